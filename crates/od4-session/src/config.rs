//! Configuration types for od4-session.
//! Parsed from ~/.od4/session.toml; CLI flags override.

use od4_protocol::{ScanPolicy, DEFAULT_PORT, RECEIVE_SIZE};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub receiver: ReceiverSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    pub cid: Option<u16>,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            cid: None,
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Local interface used to join the group and send from.
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_ttl")]
    pub multicast_ttl: u32,
    /// Deliver sent datagrams to other participants on this host.
    #[serde(default = "default_true")]
    pub multicast_loop: bool,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            multicast_ttl: default_ttl(),
            multicast_loop: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverSection {
    #[serde(default = "default_receive_size")]
    pub receive_size: usize,
    #[serde(default)]
    pub scan_policy: ScanPolicyName,
}

impl Default for ReceiverSection {
    fn default() -> Self {
        Self {
            receive_size: RECEIVE_SIZE,
            scan_policy: ScanPolicyName::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPolicyName {
    #[default]
    BoundarySignal,
    EveryRead,
}

impl From<ScanPolicyName> for ScanPolicy {
    fn from(name: ScanPolicyName) -> Self {
        match name {
            ScanPolicyName::BoundarySignal => ScanPolicy::BoundarySignal,
            ScanPolicyName::EveryRead => ScanPolicy::EveryRead,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_ttl() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_receive_size() -> usize {
    RECEIVE_SIZE
}

impl SessionConfig {
    /// Config for `cid` with every other setting at its default.
    pub fn for_cid(cid: u16) -> Self {
        let mut cfg = Self::default();
        cfg.session.cid = Some(cid);
        cfg
    }

    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: SessionConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
