use std::{
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub tunnel: TunnelConfig,
    pub bot: BotConfig,
    pub backup: BackupConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Launch command. A relative program path resolves against `working_dir`.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// Relative to `working_dir`.
    pub properties_file: PathBuf,
    pub port_key: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// One capture group: the boot duration reported by the server.
    pub start_pattern: String,
    /// Literal suffix of the line printed once the world is flushed to disk.
    pub stop_suffix: String,
    pub stop_command: String,
    pub start_timeout_sec: u64,
    pub stop_timeout_sec: u64,
    pub terminate_grace_sec: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: strings(&["./run.sh"]),
            working_dir: PathBuf::from("server"),
            properties_file: PathBuf::from("server.properties"),
            port_key: "server-port".to_string(),
            port_range_start: 49152,
            port_range_end: 65535,
            start_pattern: r#"Done \((.*?)\)! For help, type "help""#.to_string(),
            stop_suffix: "ThreadedAnvilChunkStorage: All dimensions are saved".to_string(),
            stop_command: "/stop".to_string(),
            start_timeout_sec: 5 * 60,
            stop_timeout_sec: 10 * 60,
            terminate_grace_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// `{port}` is replaced with the allocated local port.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub ready_pattern: String,
    /// Host whose address is handed to players.
    pub public_host: String,
    pub start_timeout_sec: u64,
    pub terminate_grace_sec: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            command: strings(&["ssh", "-R", "{port}:localhost:{port}", "serveo.net"]),
            working_dir: PathBuf::from("."),
            ready_pattern: "(?i)forwarding tcp|started".to_string(),
            public_host: "serveo.net".to_string(),
            start_timeout_sec: 60,
            terminate_grace_sec: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BotConfig {
    /// `{address}` is replaced with the external server address.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// When unset the bot counts as ready as soon as it is launched.
    pub ready_pattern: Option<String>,
    pub ready_timeout_sec: u64,
    pub admin_prefix: String,
    pub admin_channel: String,
    pub users_channel: String,
    pub stop_sentinel: String,
    pub terminate_grace_sec: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            command: strings(&["python3", "discord_bot.py", "{address}"]),
            working_dir: PathBuf::from("."),
            ready_pattern: None,
            ready_timeout_sec: 60,
            admin_prefix: "admin".to_string(),
            admin_channel: "admin_control".to_string(),
            users_channel: "bot_chatting".to_string(),
            stop_sentinel: "__warden_stop__".to_string(),
            terminate_grace_sec: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    pub save_archive_name: String,
    pub save_folder_name: String,
    /// Files and folders archived on backup, relative to the server working dir.
    pub archive_paths: Vec<PathBuf>,
    pub credentials_file: PathBuf,
    /// File holding an OAuth access token; `WARDEN_DRIVE_TOKEN` wins over it.
    pub token_file: PathBuf,
    pub api_base: String,
    pub request_timeout_sec: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            save_archive_name: "world_save.zip".to_string(),
            save_folder_name: "world".to_string(),
            archive_paths: vec![
                PathBuf::from("world"),
                PathBuf::from("whitelist.json"),
                PathBuf::from("banned-players.json"),
            ],
            credentials_file: PathBuf::from("credentials.json"),
            token_file: PathBuf::from("drive_token"),
            api_base: "https://www.googleapis.com".to_string(),
            request_timeout_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
        }
    }
}

impl AgentConfig {
    /// Reads `path` if it exists (defaults otherwise), then applies `WARDEN_*` overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("WARDEN_SERVER_START_TIMEOUT_SEC") {
            self.server.start_timeout_sec = v.clamp(5, 60 * 60);
        }
        if let Some(v) = env_u64("WARDEN_SERVER_STOP_TIMEOUT_SEC") {
            self.server.stop_timeout_sec = v.clamp(5, 24 * 60 * 60);
        }
        if let Some(v) = env_u64("WARDEN_TUNNEL_START_TIMEOUT_SEC") {
            self.tunnel.start_timeout_sec = v.clamp(1, 10 * 60);
        }
        if let Some(v) = env_string("WARDEN_LOG_DIR") {
            self.logging.dir = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.command.is_empty() {
            anyhow::bail!("server.command must not be empty");
        }
        if self.tunnel.command.is_empty() {
            anyhow::bail!("tunnel.command must not be empty");
        }
        if self.bot.command.is_empty() {
            anyhow::bail!("bot.command must not be empty");
        }
        if self.server.port_range_start > self.server.port_range_end {
            anyhow::bail!(
                "server.port_range_start ({}) is above server.port_range_end ({})",
                self.server.port_range_start,
                self.server.port_range_end
            );
        }
        if self.server.port_key.trim().is_empty() {
            anyhow::bail!("server.port_key must not be empty");
        }
        if self.bot.admin_channel == self.bot.users_channel {
            anyhow::bail!("bot.admin_channel and bot.users_channel must differ");
        }
        Ok(())
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.server.port_range_start..=self.server.port_range_end
    }

    pub fn properties_path(&self) -> PathBuf {
        self.server.working_dir.join(&self.server.properties_file)
    }

    pub fn archive_sources(&self) -> Vec<PathBuf> {
        self.backup
            .archive_paths
            .iter()
            .map(|p| self.server.working_dir.join(p))
            .collect()
    }

    pub fn server_start_timeout(&self) -> Duration {
        Duration::from_secs(self.server.start_timeout_sec)
    }

    pub fn server_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.server.stop_timeout_sec)
    }

    pub fn tunnel_start_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel.start_timeout_sec)
    }

    pub fn bot_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.bot.ready_timeout_sec)
    }
}

/// Replaces `placeholder` in every argument.
pub fn substitute(command: &[String], placeholder: &str, value: &str) -> Vec<String> {
    command
        .iter()
        .map(|arg| arg.replace(placeholder, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = AgentConfig::from_toml("").unwrap();
        assert_eq!(cfg.server.port_key, "server-port");
        assert_eq!(cfg.port_range(), 49152..=65535);
        assert_eq!(cfg.bot.admin_channel, "admin_control");
        assert_eq!(cfg.backup.save_archive_name, "world_save.zip");
        cfg.validate().unwrap();
    }

    #[test]
    fn sections_override_selected_fields() {
        let raw = r#"
            [server]
            working_dir = "/srv/mc"
            start_timeout_sec = 120

            [bot]
            ready_pattern = "logged in as"
        "#;
        let cfg = AgentConfig::from_toml(raw).unwrap();
        assert_eq!(cfg.server.working_dir, PathBuf::from("/srv/mc"));
        assert_eq!(cfg.server_start_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.server.stop_command, "/stop");
        assert_eq!(cfg.bot.ready_pattern.as_deref(), Some("logged in as"));
        assert_eq!(
            cfg.properties_path(),
            PathBuf::from("/srv/mc/server.properties")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(AgentConfig::from_toml("[server]\nprot = 1\n").is_err());
    }

    #[test]
    fn inverted_port_range_is_invalid() {
        let mut cfg = AgentConfig::default();
        cfg.server.port_range_start = 60000;
        cfg.server.port_range_end = 50000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn substitute_fills_every_placeholder() {
        let cmd = strings(&["ssh", "-R", "{port}:localhost:{port}", "serveo.net"]);
        assert_eq!(
            substitute(&cmd, "{port}", "50000"),
            strings(&["ssh", "-R", "50000:localhost:50000", "serveo.net"])
        );
    }

    #[test]
    fn archive_sources_live_under_the_server_dir() {
        let mut cfg = AgentConfig::default();
        cfg.server.working_dir = PathBuf::from("/srv/mc");
        assert_eq!(
            cfg.archive_sources()[0],
            PathBuf::from("/srv/mc/world")
        );
    }
}
