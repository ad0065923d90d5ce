//! Integration test entry point for od4-session.
//!
//! Uses real multicast sockets with loopback enabled; each test picks its
//! own port so tests can run in parallel.

mod harness;
mod lifecycle;
mod pubsub;
