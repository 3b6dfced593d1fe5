//! Command implementations.

pub mod config;
pub mod connect;
pub mod listen;

/// Build the runtime a command drives its event stream on.
pub(crate) fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("Failed to create Tokio runtime: {e}");
        std::process::exit(1);
    })
}
