//! Clap CLI definitions for sealink.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  sealink listen                          Accept connections on the configured address
  sealink listen --addr 0.0.0.0:7420      Accept connections on all interfaces
  sealink connect 127.0.0.1:7420          Send one ping and print the pong
  sealink connect 127.0.0.1:7420 --count 5 --body '{\"n\": 1}'
  sealink --plaintext listen              Skip the key handshake and encryption
  sealink config                          Print the effective configuration";

/// Sealink: encrypted peer-to-peer messaging over TCP.
#[derive(Parser)]
#[command(name = "sealink", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.sealink/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Frame messages without the key handshake or envelope encryption.
    #[arg(long, global = true)]
    pub plaintext: bool,

    /// Override the asymmetric key size in bits.
    #[arg(long, global = true)]
    pub key_bits: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a listener that logs every packet and answers `ping` with `pong`.
    Listen {
        /// Address to bind (overrides `listen_addr` from the config).
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Connect to a listener, send packets and print the replies.
    Connect {
        /// Listener address.
        addr: SocketAddr,
        /// Packet kind.
        #[arg(long, default_value = "ping")]
        kind: String,
        /// JSON body for each packet.
        #[arg(long)]
        body: Option<String>,
        /// Number of packets to send.
        #[arg(long, default_value = "1")]
        count: u32,
        /// How long to wait for the handshake and for each reply, in milliseconds.
        #[arg(long, default_value = "5000")]
        wait_ms: u64,
    },
    /// Print the effective configuration as TOML.
    Config,
}
