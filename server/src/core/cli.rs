use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::constants::{ENV_CONFIG, ENV_HOST, ENV_PORT, ENV_REDIS_URL};

#[derive(Parser)]
#[command(name = "lilac")]
#[command(version, about = "Event-driven agent orchestration server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Webhook listener host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Webhook listener port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Redis URL for the bus backend (selects the Redis backend)
    #[arg(long, global = true, env = ENV_REDIS_URL)]
    pub redis_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server (default)
    Start,
    /// System maintenance commands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SystemCommands {
    /// Validate the configuration and identity material, then exit
    CheckConfig,
}

/// CLI values that feed into config loading
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub redis_url: Option<String>,
}

pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    (
        CliConfig {
            host: cli.host,
            port: cli.port,
            config: cli.config,
            redis_url: cli.redis_url,
        },
        cli.command,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from(["lilac", "-p", "9000", "--redis-url", "redis://x"]).unwrap();
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.redis_url.as_deref(), Some("redis://x"));
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["lilac", "system", "check-config"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::System {
                command: SystemCommands::CheckConfig
            })
        ));
    }
}
