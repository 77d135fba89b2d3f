//! Command-line argument parsing for the mqtt-shell operator tool.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for mshell_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => mshell_core::LogFormat::Text,
            CliLogFormat::Json => mshell_core::LogFormat::Json,
        }
    }
}

/// A simple mqtt client/server terminal.
#[derive(Debug, Parser)]
#[command(
    name = "mqtt-shell",
    version,
    about = "A simple mqtt client/server terminal"
)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Broker host
    #[arg(short = 'b', long = "broker", env = "MQTT_SHELL_BROKER", global = true)]
    pub broker: Option<String>,

    /// Broker port
    #[arg(
        short = 'p',
        long = "broker-port",
        env = "MQTT_SHELL_BROKER_PORT",
        global = true
    )]
    pub broker_port: Option<u16>,

    /// Broker user
    #[arg(
        short = 'u',
        long = "broker-user",
        env = "MQTT_SHELL_BROKER_USER",
        global = true
    )]
    pub broker_user: Option<String>,

    /// Broker password
    #[arg(
        short = 'P',
        long = "broker-password",
        env = "MQTT_SHELL_BROKER_PASSWORD",
        global = true
    )]
    pub broker_password: Option<String>,

    /// Node id
    #[arg(short = 'i', long = "id", env = "MQTT_SHELL_ID", global = true)]
    pub id: Option<String>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "text", global = true)]
    pub log_format: CliLogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Expose this host's shell over the broker
    Server,
    /// Interactive shell against a server node
    Client,
    /// Scan the broker for live servers
    Beacon,
    /// Desktop front-end
    Gui,
    /// Move files over the broker
    #[command(subcommand)]
    Copy(CopyCommand),
}

#[derive(Debug, Subcommand)]
pub enum CopyCommand {
    /// Push a local file to the server
    #[command(name = "local-2-remote")]
    Local2Remote {
        /// Local source file
        #[arg(short = 'S', long = "source")]
        source: PathBuf,
        /// Remote destination (absolute path on the server)
        #[arg(short = 'D', long = "destination")]
        destination: String,
    },
    /// Pull a remote file from the server
    #[command(name = "remote-2-local")]
    Remote2Local {
        /// Remote source file (absolute path on the server)
        #[arg(short = 'S', long = "source")]
        source: String,
        /// Local destination
        #[arg(short = 'D', long = "destination")]
        destination: String,
    },
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
    fn parses_copy_subcommand() {
        let cli = Cli::parse_from([
            "mqtt-shell",
            "-b",
            "broker.local",
            "-i",
            "n1",
            "copy",
            "local-2-remote",
            "-S",
            "/tmp/a.bin",
            "-D",
            "/srv/a.bin",
        ]);
        match cli.command {
            Command::Copy(CopyCommand::Local2Remote {
                source,
                destination,
            }) => {
                assert_eq!(source, PathBuf::from("/tmp/a.bin"));
                assert_eq!(destination, "/srv/a.bin");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["mqtt-shell", "server", "-b", "broker.local", "-vv"]);
        assert_eq!(cli.broker.as_deref(), Some("broker.local"));
        assert_eq!(cli.verbose, 2);
    }
}
