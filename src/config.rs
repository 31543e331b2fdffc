// Configuration management for depth-acquire

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::devices::{DeviceConfig, SimulationProfile};
use crate::encoding::EncoderSettings;
use crate::recording::{PreviewConfig, QueueConfig};

/// Error type for configuration files
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Recorder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Recording length in minutes, when not given on the command line
    #[serde(default = "default_recording_minutes")]
    pub recording_minutes: f64,

    /// Print elapsed time while recording
    #[serde(default)]
    pub display_time: bool,

    /// Primary camera
    #[serde(default)]
    pub device: DeviceConfig,

    /// Second camera; enables paired mode
    #[serde(default)]
    pub secondary: Option<DeviceConfig>,

    /// Encoder process settings, used for both streams
    #[serde(default)]
    pub encoder: EncoderSettings,

    #[serde(default)]
    pub preview: PreviewConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    /// Behaviour of the simulated camera backend
    #[serde(default)]
    pub simulation: SimulationProfile,

    /// Warn when the output disk has less free space than this
    #[serde(default = "default_min_free_disk_gb")]
    pub min_free_disk_gb: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            recording_minutes: default_recording_minutes(),
            display_time: false,
            device: DeviceConfig::default(),
            secondary: None,
            encoder: EncoderSettings::default(),
            preview: PreviewConfig::default(),
            queues: QueueConfig::default(),
            simulation: SimulationProfile::default(),
            min_free_disk_gb: default_min_free_disk_gb(),
        }
    }
}

impl RecorderConfig {
    /// Load an explicitly requested config file. Errors are fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load config from the default location or return default
    pub fn load_or_default() -> Self {
        let config_path = get_config_path();

        if config_path.exists() {
            match Self::load(&config_path) {
                Ok(config) => return config,
                Err(e) => {
                    log::warn!("{:#}; using defaults", anyhow::Error::from(e));
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Pretty TOML of the effective configuration
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Get the config file path
pub fn get_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("depth-acquire")
        .join("config.toml")
}

/// Default recording length (for serde)
fn default_recording_minutes() -> f64 {
    30.0
}

/// Default free-space threshold (for serde)
fn default_min_free_disk_gb() -> f64 {
    5.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{Resolution, SyncRole};
    use crate::encoding::VideoCodec;

    #[test]
    fn empty_file_gives_defaults() {
        let config: RecorderConfig = toml::from_str("").unwrap();
        assert_eq!(config, RecorderConfig::default());
        assert_eq!(config.device.resolution, Resolution::new(640, 576));
        assert_eq!(config.encoder.codec, VideoCodec::Ffv1);
        assert!(config.secondary.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: RecorderConfig = toml::from_str(
            r#"
            recording_minutes = 0.5

            [device]
            device_id = 1
            resolution = { width = 320, height = 288 }

            [secondary]
            device_id = 2
            sync_role = "secondary"

            [encoder]
            codec = "h264"
            crf = 0

            [preview]
            enabled = true
            every = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.recording_minutes, 0.5);
        assert_eq!(config.device.device_id, 1);
        assert_eq!(config.device.fps, 30);
        let secondary = config.secondary.unwrap();
        assert_eq!(secondary.sync_role, SyncRole::Secondary);
        assert_eq!(secondary.secondary_delay_usec, 640);
        assert_eq!(config.encoder.codec, VideoCodec::H264);
        assert_eq!(config.encoder.crf, 0);
        assert_eq!(config.encoder.slices, 24);
        assert!(config.preview.enabled);
        assert_eq!(config.preview.every, 3);
        assert_eq!(config.preview.subsample, 2);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = RecorderConfig::default();
        config.display_time = true;
        config.queues.writer = 8;

        config.save(&path).unwrap();
        assert_eq!(RecorderConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RecorderConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
