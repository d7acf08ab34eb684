//! Configuration management for duet
//!
//! This module provides:
//! - Daemon tuning (timeouts, settle pauses, auto-save debounce)
//! - The saved engine state replayed at startup
//! - TOML load/save with factory defaults and corrupt-file backup

use crate::domain::backend::LoopbackParams;
use crate::domain::channel::ChannelId;
use crate::domain::loopback::SettleTiming;
use crate::domain::router::UNASSIGNED_SINK;
use crate::domain::rules::RoutingRule;
use crate::domain::volume::FULL_VOLUME;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon-level tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Silent sink that unrouted streams are parked on
    pub unassigned_sink: String,

    /// Upper bound for a single backend command
    pub command_timeout_ms: u64,

    /// Latency requested for every loopback edge
    pub loopback_latency_ms: u32,

    pub teardown_ms: u64,
    pub edge_appear_ms: u64,
    pub stabilize_ms: u64,
    pub unmute_ms: u64,
    pub device_unmute_ms: u64,
    pub stream_settle_ms: u64,

    /// Quiet period before a burst of changes is written out
    pub autosave_debounce_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            unassigned_sink: UNASSIGNED_SINK.to_string(),
            command_timeout_ms: 5000,
            loopback_latency_ms: 150,
            teardown_ms: 50,
            edge_appear_ms: 100,
            stabilize_ms: 250,
            unmute_ms: 100,
            device_unmute_ms: 50,
            stream_settle_ms: 100,
            autosave_debounce_ms: 2000,
        }
    }
}

impl DaemonConfig {
    pub fn settle_timing(&self) -> SettleTiming {
        SettleTiming {
            teardown: Duration::from_millis(self.teardown_ms),
            edge_appear: Duration::from_millis(self.edge_appear_ms),
            stabilize: Duration::from_millis(self.stabilize_ms),
            unmute: Duration::from_millis(self.unmute_ms),
            device_unmute: Duration::from_millis(self.device_unmute_ms),
            stream_settle: Duration::from_millis(self.stream_settle_ms),
        }
    }

    pub fn loopback_params(&self) -> LoopbackParams {
        LoopbackParams {
            latency_ms: self.loopback_latency_ms,
            ..LoopbackParams::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.unassigned_sink.trim().is_empty() {
            return Err(ConfigError::Invalid("unassigned_sink must not be empty".to_string()));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid("command_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

fn full_volume() -> u8 {
    FULL_VOLUME
}

fn enabled() -> bool {
    true
}

/// Saved levels of one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default = "full_volume")]
    pub volume: u8,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "full_volume")]
    pub personal_volume: u8,
    #[serde(default)]
    pub personal_muted: bool,
    #[serde(default)]
    pub stream_volume: u8,
    #[serde(default)]
    pub stream_muted: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            volume: FULL_VOLUME,
            muted: false,
            personal_volume: FULL_VOLUME,
            personal_muted: false,
            stream_volume: 0,
            stream_muted: false,
        }
    }
}

/// Everything the engine needs to come back the way the user left it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(default = "full_volume")]
    pub master_volume: u8,

    #[serde(default)]
    pub setup_complete: bool,

    #[serde(default)]
    pub personal_device: Option<String>,

    #[serde(default)]
    pub stream_device: Option<String>,

    #[serde(default = "enabled")]
    pub personal_enabled: bool,

    #[serde(default)]
    pub stream_enabled: bool,

    #[serde(default)]
    pub rules: Vec<RoutingRule>,

    #[serde(default)]
    pub channels: BTreeMap<ChannelId, ChannelSettings>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            master_volume: FULL_VOLUME,
            setup_complete: false,
            personal_device: None,
            stream_device: None,
            personal_enabled: true,
            stream_enabled: false,
            rules: Vec::new(),
            channels: BTreeMap::new(),
        }
    }
}

/// Complete duet configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuetConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub mixer: EngineState,
}

impl DuetConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.daemon.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }
}

/// Manages the main configuration file at `~/.config/duet/config.toml`
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path (`~/.config/duet`)
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("duet"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, the defaults are written out and returned.
    /// If the config file is corrupt, it is backed up and the defaults are returned.
    #[instrument(skip(self))]
    pub async fn load(&self) -> DuetConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating default"
            );

            let config = DuetConfig::default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save default config"
                );
            }
            return config;
        }

        match DuetConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using defaults"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                DuetConfig::default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &DuetConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    /// Delete the config file
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        if self.config_path.exists() {
            fs::remove_file(&self.config_path).await?;
            info!(path = %self.config_path.display(), "Configuration cleared");
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state() -> EngineState {
        let mut state = EngineState {
            master_volume: 70,
            setup_complete: true,
            personal_device: Some("alsa_output.headphones".to_string()),
            stream_enabled: true,
            ..EngineState::default()
        };
        state.rules.push(RoutingRule::new("discord", ChannelId::new("chat")));
        state.channels.insert(
            ChannelId::new("game"),
            ChannelSettings {
                stream_volume: 40,
                ..ChannelSettings::default()
            },
        );
        state
    }

    #[test]
    fn test_config_serialization() {
        let config = DuetConfig {
            mixer: sample_state(),
            ..DuetConfig::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: DuetConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: DuetConfig = toml::from_str(
            r#"
            [mixer]
            master_volume = 30

            [mixer.channels.chat]
            stream_volume = 25
            "#,
        )
        .unwrap();

        assert_eq!(parsed.daemon, DaemonConfig::default());
        assert_eq!(parsed.mixer.master_volume, 30);
        assert!(parsed.mixer.personal_enabled);
        assert!(!parsed.mixer.stream_enabled);
        let chat = &parsed.mixer.channels[&ChannelId::new("chat")];
        assert_eq!(chat.personal_volume, 100);
        assert_eq!(chat.stream_volume, 25);
    }

    #[test]
    fn test_daemon_timings() {
        let daemon = DaemonConfig {
            stabilize_ms: 0,
            ..DaemonConfig::default()
        };
        let timing = daemon.settle_timing();

        assert_eq!(timing.stabilize, Duration::ZERO);
        assert_eq!(timing.stream_settle, Duration::from_millis(100));
        assert_eq!(daemon.loopback_params().latency_ms, 150);
        assert_eq!(daemon.command_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_empty_unassigned_sink() {
        let daemon = DaemonConfig {
            unassigned_sink: " ".to_string(),
            ..DaemonConfig::default()
        };
        assert!(matches!(daemon.validate(), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_missing_file_writes_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path().join("duet"));

        let config = manager.load().await;

        assert_eq!(config, DuetConfig::default());
        assert!(manager.exists());
    }

    #[tokio::test]
    async fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path().to_path_buf());
        let config = DuetConfig {
            mixer: sample_state(),
            ..DuetConfig::default()
        };

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await;

        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_backed_up() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path().to_path_buf());
        std::fs::write(manager.config_path(), "master_volume = [[[").unwrap();

        let config = manager.load().await;

        assert_eq!(config, DuetConfig::default());
        assert!(temp_dir.path().join("config.toml.corrupt").exists());
    }

    #[tokio::test]
    async fn test_clear() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path().to_path_buf());
        manager.save(&DuetConfig::default()).await.unwrap();

        manager.clear().await.unwrap();

        assert!(!manager.exists());
        manager.clear().await.unwrap();
    }
}
