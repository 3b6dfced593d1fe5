//! Sealink CLI: run a listener or talk to one from the terminal.
//!
//! Configuration comes from `--config`, else `~/.sealink/config.toml`, else
//! built-in defaults. Global flags override individual fields.

mod cli;
mod cmd;
mod config;

use crate::cli::{Cli, Commands};
use clap::Parser;
use sealink_types::{SecurityMode, WireConfig};
use std::time::Duration;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Apply global flags on top of the loaded file.
fn effective_config(cli: &Cli) -> WireConfig {
    let mut config = config::load_config(cli.config.as_deref());
    if cli.plaintext {
        config.security = SecurityMode::Plaintext;
    }
    if let Some(bits) = cli.key_bits {
        config.key_bits = bits;
    }
    if let Commands::Listen { addr: Some(addr) } = &cli.command {
        config.listen_addr = *addr;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }
    config
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = effective_config(&cli);

    match cli.command {
        Commands::Listen { .. } => cmd::listen::cmd_listen(config),
        Commands::Connect {
            addr,
            kind,
            body,
            count,
            wait_ms,
        } => cmd::connect::cmd_connect(
            config,
            cmd::connect::ConnectArgs {
                addr,
                kind,
                body,
                count,
                wait: Duration::from_millis(wait_ms),
            },
        ),
        Commands::Config => cmd::config::cmd_config(&config),
    }
}
