//! Configuration management for the backup orchestrator.
//!
//! Loads configuration from a TOML file (or built-in defaults) and then
//! applies environment variable overrides. A `.env` file in the working
//! directory is honoured.

use crate::job::Target;
use crate::utils::errors::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Component name to source path.
    #[serde(default = "default_components")]
    pub components: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsConfig {
    /// Backup root on NVMe-attached storage
    #[serde(default = "default_nvme_root")]
    pub nvme: PathBuf,

    /// Backup root on the USB backup drive
    #[serde(default = "default_usb_root")]
    pub usb: PathBuf,

    /// Staging root for network backups
    #[serde(default = "default_network_root")]
    pub network: PathBuf,

    /// Target used when a request names none
    #[serde(default = "default_target")]
    pub default: Target,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Transfer program invoked once per component
    #[serde(default = "default_engine_program")]
    pub program: PathBuf,

    /// Extra arguments placed before the mode flag
    #[serde(default)]
    pub args: Vec<String>,

    /// Seconds between SIGTERM and SIGKILL on abort
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_port() -> u16 {
    8081
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_nvme_root() -> PathBuf {
    PathBuf::from("/mnt/nvme/backups")
}

fn default_usb_root() -> PathBuf {
    PathBuf::from("/mnt/backup-ssd/backups")
}

fn default_network_root() -> PathBuf {
    PathBuf::from("/var/lib/backup-orchestrator/network-staging")
}

fn default_target() -> Target {
    Target::Nvme
}

fn default_engine_program() -> PathBuf {
    PathBuf::from("/usr/local/bin/backup-engine")
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_components() -> BTreeMap<String, PathBuf> {
    [
        ("config", "/opt/nvr/config"),
        ("data", "/opt/nvr/data"),
        ("recordings", "/scrypted/nvr/recordings"),
        ("scrypted", "/root/.scrypted/volume"),
    ]
    .into_iter()
    .map(|(name, path)| (name.to_string(), PathBuf::from(path)))
    .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            nvme: default_nvme_root(),
            usb: default_usb_root(),
            network: default_network_root(),
            default: default_target(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            args: Vec::new(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            targets: TargetsConfig::default(),
            engine: EngineConfig::default(),
            components: default_components(),
            log: LogConfig::default(),
        }
    }
}

impl TargetsConfig {
    pub fn roots(&self) -> BTreeMap<Target, PathBuf> {
        BTreeMap::from([
            (Target::Nvme, self.nvme.clone()),
            (Target::Usb, self.usb.clone()),
            (Target::Network, self.network.clone()),
        ])
    }
}

impl EngineConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Config {
    /// Load from an optional TOML file, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| OrchestratorError::Config(format!("{}: {e}", path.display())))
    }

    /// Apply overrides from `lookup` (the environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| OrchestratorError::Config(format!("invalid PORT: {port}")))?;
        }
        if let Some(bind) = lookup("BIND_ADDR") {
            self.server.bind = bind;
        }
        if let Some(root) = lookup("BACKUP_NVME_ROOT") {
            self.targets.nvme = PathBuf::from(root);
        }
        if let Some(root) = lookup("BACKUP_USB_ROOT") {
            self.targets.usb = PathBuf::from(root);
        }
        if let Some(root) = lookup("BACKUP_NETWORK_ROOT") {
            self.targets.network = PathBuf::from(root);
        }
        if let Some(target) = lookup("BACKUP_DEFAULT_TARGET") {
            self.targets.default = target.parse()?;
        }
        if let Some(program) = lookup("BACKUP_ENGINE") {
            self.engine.program = PathBuf::from(program);
        }
        if let Some(secs) = lookup("BACKUP_GRACE_PERIOD_SECS") {
            self.engine.grace_period_secs = secs.parse().map_err(|_| {
                OrchestratorError::Config(format!("invalid BACKUP_GRACE_PERIOD_SECS: {secs}"))
            })?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(OrchestratorError::Config("no components configured".into()));
        }
        for (target, root) in self.targets.roots() {
            if !root.is_absolute() {
                return Err(OrchestratorError::Config(format!(
                    "root for target {target} must be absolute: {}",
                    root.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.targets.default, Target::Nvme);
        assert_eq!(config.targets.usb, PathBuf::from("/mnt/backup-ssd/backups"));
        assert!(config.components.contains_key("config"));
        assert!(config.components.contains_key("data"));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [targets]
            usb = "/media/usb/backups"
            default = "usb"

            [engine]
            program = "/opt/engine/run.sh"
            grace_period_secs = 3

            [components]
            config = "/etc/nvr"
            "#,
        )
        .unwrap();

        assert_eq!(config.targets.default, Target::Usb);
        assert_eq!(config.targets.nvme, PathBuf::from("/mnt/nvme/backups"));
        assert_eq!(config.engine.grace_period(), Duration::from_secs(3));
        assert_eq!(config.components.len(), 1);
        assert_eq!(config.server.port, 8081);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PORT", "9000"),
            ("BACKUP_NVME_ROOT", "/data/nvme"),
            ("BACKUP_DEFAULT_TARGET", "network"),
            ("BACKUP_ENGINE", "/bin/true"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.targets.nvme, PathBuf::from("/data/nvme"));
        assert_eq!(config.targets.default, Target::Network);
        assert_eq!(config.engine.program, PathBuf::from("/bin/true"));
    }

    #[test]
    fn test_invalid_env_values() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "BACKUP_DEFAULT_TARGET").then(|| "floppy".to_string()))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTarget(_)));

        let err = config
            .apply_env(|key| (key == "PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn test_relative_root_rejected() {
        let mut config = Config::default();
        config.targets.network = PathBuf::from("staging");
        assert!(config.validate().is_err());
    }
}
