//! od4-session -- join an OD4 session from the command line.
//!
//! Usage:
//!   od4-session listen --cid 253                      # Log every Envelope
//!   od4-session listen --cid 253 --data-type 30005    # Print text payloads of one type
//!   od4-session send --cid 253 --data-type 30005 --text "Hello World!"

use clap::{Parser, Subcommand};

use od4_session::config::{expand_tilde, SessionConfig};
use od4_session::Session;

#[derive(Parser)]
#[command(name = "od4-session", about = "Publish/subscribe client for OD4 multicast sessions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.od4/session.toml")]
    config: String,

    /// Session identifier (0-255); overrides the config file
    #[arg(long, global = true)]
    cid: Option<u16>,

    /// Multicast port; overrides the config file
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive Envelopes until Ctrl-C
    Listen {
        /// Only decode and print this data type as a text message
        #[arg(long)]
        data_type: Option<u32>,
    },
    /// Send one text message
    Send {
        #[arg(long)]
        data_type: u32,
        #[arg(long)]
        text: String,
        #[arg(long, default_value_t = 0)]
        sender_stamp: u32,
    },
}

/// Single-string message used by the CLI for both directions.
#[derive(Clone, PartialEq, prost::Message)]
struct TextMessage {
    #[prost(string, tag = "1")]
    text: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "od4_session=info,od4_protocol=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = SessionConfig::load_or_default(&expand_tilde(&cli.config))?;
    if let Some(cid) = cli.cid {
        cfg.session.cid = Some(cid);
    }
    if let Some(port) = cli.port {
        cfg.session.port = port;
    }

    let mut session = Session::from_config(cfg)?;

    match cli.command {
        Commands::Listen { data_type } => {
            match data_type {
                Some(data_type) => {
                    session.register_message_callback(data_type, move |msg: TextMessage, ts| {
                        println!(
                            "sent: {}, received: {}, sample time stamp: {}",
                            ts[0], ts[1], ts[2]
                        );
                        println!("{}", msg.text);
                    });
                }
                None => {
                    session.on_envelope(|env| {
                        tracing::info!(
                            data_type = env.data_type,
                            sender_stamp = env.sender_stamp,
                            bytes = env.serialized_data.len(),
                            sent = %env.sent.unwrap_or_default().to_datetime(),
                            "envelope"
                        );
                    });
                }
            }
            session.connect().await?;
            tracing::info!("listening, press Ctrl-C to stop");
            session.run().await?;
            session.shutdown().await;
        }
        Commands::Send {
            data_type,
            text,
            sender_stamp,
        } => {
            session.connect().await?;
            let payload = prost::Message::encode_to_vec(&TextMessage { text });
            let sent = session
                .publisher()?
                .send_with(data_type, &payload, None, sender_stamp)
                .await?;
            tracing::info!(data_type, bytes = sent, "sent envelope");
            session.shutdown().await;
        }
    }

    Ok(())
}
