//! Command-line entry: parse flags, load config, run the server.

use anyhow::Result;
use clap::Parser;

use crate::config::AppConfig;

#[derive(Debug, Parser)]
#[command(
    name = "voice-gateway",
    about = "Voice-assistant gateway for embedded microphone clients",
    version
)]
pub struct Cli {
    /// Bind host (overrides config)
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    pub port: Option<u16>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load();
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    crate::server::start(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_overrides() {
        let cli = Cli::parse_from(["voice-gateway", "--host", "127.0.0.1", "--port", "9000"]);
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn test_cli_defaults_empty() {
        let cli = Cli::parse_from(["voice-gateway"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
    }
}
