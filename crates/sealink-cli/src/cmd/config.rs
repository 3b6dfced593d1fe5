//! `sealink config`: print the effective configuration.

use sealink_types::WireConfig;

pub fn cmd_config(config: &WireConfig) {
    match toml::to_string_pretty(config) {
        Ok(text) => print!("{text}"),
        Err(e) => {
            eprintln!("Failed to render config: {e}");
            std::process::exit(1);
        }
    }
}
