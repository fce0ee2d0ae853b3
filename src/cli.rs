//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Edge Gateway - path routing, JWT gating, rate limiting and realtime rooms
#[derive(Parser, Debug)]
#[command(name = "edge-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "EDGE_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "EDGE_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "EDGE_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "EDGE_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "EDGE_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Validate configuration and print the resolved route table
    CheckConfig,

    /// Sign a bearer credential with the configured secret
    Token {
        /// Subject (`sub` claim)
        #[arg(required = true)]
        subject: String,

        /// Lifetime, e.g. "15m", "1h"
        #[arg(long, default_value = "1h")]
        ttl: String,

        /// Extra claims as a JSON object
        #[arg(long, default_value = "{}")]
        claims: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_no_subcommand() {
        let cli = Cli::try_parse_from(["edge-gateway"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_token_subcommand() {
        let cli = Cli::try_parse_from(["edge-gateway", "token", "alice", "--ttl", "15m"]).unwrap();
        match cli.command {
            Some(Command::Token { subject, ttl, claims }) => {
                assert_eq!(subject, "alice");
                assert_eq!(ttl, "15m");
                assert_eq!(claims, "{}");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["edge-gateway", "check-config", "--config", "gw.yaml"]).unwrap();
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
        assert_eq!(cli.config.unwrap(), PathBuf::from("gw.yaml"));
    }
}
