//! Configuration: CLI flags over `MQTT_SHELL_*` environment over the TOML
//! config file over built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use mshell_core::constants::{
    BEACON_SCAN_TIMEOUT, DEFAULT_BROKER_PORT, DEFAULT_CMD_TIMEOUT, HISTORY_FILE,
    INACTIVITY_TIMEOUT,
};
use mshell_core::{Error, Result};

use crate::cli::Cli;

const DEFAULT_BRIDGE_CONNECTIONS: usize = 5;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginFileConfig {
    pub enabled: Option<bool>,
    pub keyword: Option<String>,
    pub max_connections: Option<usize>,
}

/// The TOML configuration file shape. Everything is optional; the CLI and
/// environment win over the file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub broker: Option<String>,
    pub broker_port: Option<u16>,
    pub broker_user: Option<String>,
    pub broker_password: Option<String>,
    pub id: Option<String>,
    pub network_interface: Option<String>,
    pub beacon_timeout_secs: Option<u64>,
    pub inactivity_timeout_secs: Option<u64>,
    pub cmd_timeout_secs: Option<u64>,
    pub history_file: Option<PathBuf>,
    pub color_prompt: Option<bool>,
    pub cp_server_enabled: Option<bool>,
    pub telnet_plugin: PluginFileConfig,
    pub ssh_plugin: PluginFileConfig,
}

#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub enabled: bool,
    pub keyword: Option<String>,
    pub max_connections: usize,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: Option<String>,
    pub broker_port: u16,
    pub broker_user: Option<String>,
    pub broker_password: Option<String>,
    pub id: Option<String>,
    pub network_interface: Option<String>,
    pub beacon_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub cmd_timeout: Duration,
    pub history_file: PathBuf,
    pub color_prompt: bool,
    pub cp_server_enabled: bool,
    pub telnet_plugin: PluginSettings,
    pub ssh_plugin: PluginSettings,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(format!("MQTT_SHELL_{name}")).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse().ok())
}

impl Settings {
    /// Merge CLI, environment and config file. Configuration problems are
    /// errors: the process must exit non-zero rather than run half-set-up.
    pub fn load(cli: &Cli) -> Result<Self> {
        let file = match &cli.config_file {
            None => FileConfig::default(),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
                    message: format!("cannot read config file {}: {e}", path.display()),
                })?;
                toml::from_str(&raw).map_err(|e| Error::Config {
                    message: format!("cannot parse config file {}: {e}", path.display()),
                })?
            }
        };

        let telnet_plugin = PluginSettings {
            enabled: env_parse("TELNET_ENABLED")
                .or(file.telnet_plugin.enabled)
                .unwrap_or(true),
            keyword: env_string("TELNET_KEYWORD").or(file.telnet_plugin.keyword),
            max_connections: env_parse("TELNET_MAX_CONNECTIONS")
                .or(file.telnet_plugin.max_connections)
                .unwrap_or(DEFAULT_BRIDGE_CONNECTIONS),
        };
        let ssh_plugin = PluginSettings {
            enabled: env_parse("SSH_ENABLED")
                .or(file.ssh_plugin.enabled)
                .unwrap_or(true),
            keyword: env_string("SSH_KEYWORD").or(file.ssh_plugin.keyword),
            max_connections: env_parse("SSH_MAX_CONNECTIONS")
                .or(file.ssh_plugin.max_connections)
                .unwrap_or(DEFAULT_BRIDGE_CONNECTIONS),
        };

        Ok(Settings {
            broker: cli.broker.clone().or(file.broker),
            broker_port: cli
                .broker_port
                .or(file.broker_port)
                .unwrap_or(DEFAULT_BROKER_PORT),
            broker_user: cli.broker_user.clone().or(file.broker_user),
            broker_password: cli.broker_password.clone().or(file.broker_password),
            id: cli.id.clone().or(file.id),
            network_interface: env_string("NETWORK_INTERFACE").or(file.network_interface),
            beacon_timeout: env_parse("BEACON_TIMEOUT_SECS")
                .or(file.beacon_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(BEACON_SCAN_TIMEOUT),
            inactivity_timeout: env_parse("INACTIVITY_TIMEOUT_SECS")
                .or(file.inactivity_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(INACTIVITY_TIMEOUT),
            cmd_timeout: env_parse("CMD_TIMEOUT_SECS")
                .or(file.cmd_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CMD_TIMEOUT),
            history_file: env_string("HISTORY_FILE")
                .map(PathBuf::from)
                .or(file.history_file)
                .unwrap_or_else(|| PathBuf::from(HISTORY_FILE)),
            color_prompt: env_parse("COLOR_PROMPT")
                .or(file.color_prompt)
                .unwrap_or(false),
            cp_server_enabled: env_parse("CP_SERVER_ENABLED")
                .or(file.cp_server_enabled)
                .unwrap_or(false),
            telnet_plugin,
            ssh_plugin,
        })
    }

    /// Broker host, required for every networked subcommand.
    pub fn require_broker(&self) -> Result<&str> {
        self.broker.as_deref().ok_or_else(|| Error::Config {
            message: "broker is required (use --broker, MQTT_SHELL_BROKER or the config file)"
                .to_string(),
        })
    }

    /// Node id, required for client, server and copy.
    pub fn require_id(&self) -> Result<&str> {
        self.id.as_deref().ok_or_else(|| Error::Config {
            message: "node id is required (use --id, MQTT_SHELL_ID or the config file)".to_string(),
        })
    }

    /// Node id for the server: explicit id or the hostname.
    pub fn server_id(&self) -> Result<String> {
        if let Some(id) = &self.id {
            return Ok(id.clone());
        }
        nix::unistd::gethostname()
            .map_err(|e| Error::Config {
                message: format!("cannot derive node id from hostname: {e}"),
            })
            .map(|h| h.to_string_lossy().into_owned())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("mqtt-shell").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_without_file() {
        let settings = Settings::load(&cli(&["server"])).unwrap();
        assert_eq!(settings.broker_port, DEFAULT_BROKER_PORT);
        assert!(settings.telnet_plugin.enabled);
        assert!(!settings.cp_server_enabled);
        assert!(settings.require_broker().is_err());
    }

    #[test]
    fn file_values_fill_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
broker = "broker.lan"
broker_port = 8883
id = "pi4"
cp_server_enabled = true

[telnet_plugin]
enabled = false
max_connections = 2
"#,
        )
        .unwrap();

        let settings =
            Settings::load(&cli(&["-c", path.to_str().unwrap(), "server"])).unwrap();
        assert_eq!(settings.require_broker().unwrap(), "broker.lan");
        assert_eq!(settings.broker_port, 8883);
        assert_eq!(settings.require_id().unwrap(), "pi4");
        assert!(settings.cp_server_enabled);
        assert!(!settings.telnet_plugin.enabled);
        assert_eq!(settings.telnet_plugin.max_connections, 2);
    }

    #[test]
    fn cli_beats_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "broker = \"from-file\"\n").unwrap();
        let settings = Settings::load(&cli(&[
            "-c",
            path.to_str().unwrap(),
            "-b",
            "from-cli",
            "server",
        ]))
        .unwrap();
        assert_eq!(settings.require_broker().unwrap(), "from-cli");
    }

    #[test]
    fn bad_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "broker = [not toml").unwrap();
        assert!(Settings::load(&cli(&["-c", path.to_str().unwrap(), "server"])).is_err());
    }
}
