//! Daemon configuration.
//!
//! The configuration is read from a TOML file; every field has a default so a
//! minimal file only needs the volume list.

use super::constants::{DEFAULT_CONSOLE_PORT, DEFAULT_EXPORT_PREFIX};
use super::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Where the administrative console reads its commands from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleMode {
    /// Interactive use through stdin/stdout.
    Stdin,
    /// A single TCP connection at a time.
    Tcp,
    /// No console at all.
    Off,
}

impl std::str::FromStr for ConsoleMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdin" => Ok(ConsoleMode::Stdin),
            "tcp" => Ok(ConsoleMode::Tcp),
            "off" => Ok(ConsoleMode::Off),
            other => Err(ConfigError::Invalid(format!("unknown console mode: {}", other))),
        }
    }
}

/// Console section of the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    /// Console input channel.
    #[serde(default = "default_console_mode")]
    pub mode: ConsoleMode,
    /// Listen address in tcp mode.
    #[serde(default = "default_console_address")]
    pub address: String,
    /// Listen port in tcp mode.
    #[serde(default = "default_console_port")]
    pub port: u16,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Directory watched for mount-instance control sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Backing volume roots, each holding `anonym/` and `public/` trees.
    #[serde(default)]
    pub volumes: Vec<PathBuf>,
    /// Live anon map file.
    #[serde(default = "default_anon_map_file")]
    pub anon_map_file: PathBuf,
    /// Directory receiving timestamped backups of the anon map; `<file>.old` when unset.
    #[serde(default)]
    pub anon_map_backup_dir: Option<PathBuf>,
    /// Marker prepended to generated export names.
    #[serde(default = "default_export_prefix")]
    pub export_prefix: String,
    /// Root of the per-user "what changed" report files.
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
    /// Plugins to load besides `help`.
    #[serde(default = "default_plugins")]
    pub plugins: Vec<String>,
    /// Log level used when neither `--verbose` nor `RUST_LOG` is given.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Administrative console.
    #[serde(default)]
    pub console: ConsoleConfig,
}

fn default_console_mode() -> ConsoleMode {
    ConsoleMode::Stdin
}

fn default_console_address() -> String {
    "127.0.0.1".into()
}

fn default_console_port() -> u16 {
    DEFAULT_CONSOLE_PORT
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/mammutfs_sockets")
}

fn default_anon_map_file() -> PathBuf {
    PathBuf::from("/etc/shepherd/anon.map")
}

fn default_export_prefix() -> String {
    DEFAULT_EXPORT_PREFIX.into()
}

fn default_plugins() -> Vec<String> {
    vec!["base".into(), "anonmap".into()]
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            mode: default_console_mode(),
            address: default_console_address(),
            port: default_console_port(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            socket_dir: default_socket_dir(),
            volumes: Vec::new(),
            anon_map_file: default_anon_map_file(),
            anon_map_backup_dir: None,
            export_prefix: default_export_prefix(),
            report_dir: None,
            plugins: default_plugins(),
            log_level: default_log_level(),
            console: ConsoleConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path of the TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, parsed or validated
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DaemonConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the daemon relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.volumes.is_empty() {
            return Err(ConfigError::Invalid("no backing volumes configured".into()));
        }
        if self.socket_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket_dir must not be empty".into()));
        }
        if self.console.mode == ConsoleMode::Tcp && self.console.port == 0 {
            return Err(ConfigError::Invalid("console mode tcp needs a port".into()));
        }
        Ok(())
    }

    /// Resolves a volume identifier announced by a mount instance.
    ///
    /// The identifier may be a configured root itself or the last component
    /// of one (`raid1` for `/srv/raids/raid1`); anything else is taken as a
    /// path as-is.
    pub fn resolve_volume(&self, id: &str) -> PathBuf {
        let id_path = Path::new(id);
        self.volumes
            .iter()
            .find(|v| v.as_path() == id_path || v.file_name().map_or(false, |n| n == id))
            .cloned()
            .unwrap_or_else(|| id_path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_minimal_config_uses_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("shepherd.toml");
        fs::write(&path, "volumes = [\"/srv/raids/raid0\"]\n")?;

        let config = DaemonConfig::load(&path)?;
        assert_eq!(config.volumes, vec![PathBuf::from("/srv/raids/raid0")]);
        assert_eq!(config.export_prefix, "a_");
        assert_eq!(config.console.mode, ConsoleMode::Stdin);
        assert_eq!(config.plugins, vec!["base".to_string(), "anonmap".to_string()]);
        Ok(())
    }

    #[test]
    fn test_full_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("shepherd.toml");
        fs::write(
            &path,
            r#"
socket_dir = "/tmp/sockets"
volumes = ["/a/raid0", "/a/raid1"]
anon_map_file = "/tmp/anon.map"
anon_map_backup_dir = "/tmp/backups"
export_prefix = "x_"
report_dir = "/tmp/reports"
plugins = ["base"]

[console]
mode = "tcp"
port = 9000
"#,
        )?;

        let config = DaemonConfig::load(&path)?;
        assert_eq!(config.console.mode, ConsoleMode::Tcp);
        assert_eq!(config.console.port, 9000);
        assert_eq!(config.console.address, "127.0.0.1");
        assert_eq!(config.report_dir, Some(PathBuf::from("/tmp/reports")));
        assert_eq!(config.anon_map_backup_dir, Some(PathBuf::from("/tmp/backups")));
        Ok(())
    }

    #[test]
    fn test_config_without_volumes_is_invalid() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("shepherd.toml");
        fs::write(&path, "socket_dir = \"/tmp/s\"\n")?;

        assert!(matches!(
            DaemonConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn test_resolve_volume() {
        let config = DaemonConfig {
            volumes: vec![PathBuf::from("/srv/raids/raid0"), PathBuf::from("/srv/raids/raid1")],
            ..DaemonConfig::default()
        };
        assert_eq!(config.resolve_volume("raid1"), PathBuf::from("/srv/raids/raid1"));
        assert_eq!(
            config.resolve_volume("/srv/raids/raid0"),
            PathBuf::from("/srv/raids/raid0")
        );
        assert_eq!(config.resolve_volume("/elsewhere"), PathBuf::from("/elsewhere"));
    }
}
