//! Persistent user settings for cdrip
//!
//! Settings are stored in a TOML configuration file at:
//! - Linux: `~/.config/cdrip/cdrip_config.toml`
//! - macOS: `~/Library/Application Support/cdrip/cdrip_config.toml`
//! - Windows: `%APPDATA%\cdrip\cdrip_config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! strategy = "comparison"
//!
//! [drive]
//! device = "/dev/sr0"
//! sectors_per_command = 24
//! command_timeout_secs = 30
//!
//! [comparison]
//! required_matches = 2
//! maximum_retries = 20
//! use_hashes = true
//! use_c2 = false
//! drive_offset = 6
//!
//! [paranoia]
//! backend = "overlap"
//! max_jitter = 588
//!
//! [output]
//! directory = "/home/me/rips"
//! write_manifest = true
//! ```

use crate::comparison::{
    ComparisonConfig, DEFAULT_FATAL_ERROR_THRESHOLD, DEFAULT_MAXIMUM_RETRIES,
    DEFAULT_REQUIRED_MATCHES, DEFAULT_SECTORS_PER_READ,
};
use crate::config::Config;
use crate::drive::{DriveOptions, DEFAULT_SECTORS_PER_COMMAND};
use crate::paranoia::{ParanoiaBackend, ParanoiaConfig, DEFAULT_MAX_JITTER};
use crate::session::{OutputConfig, RippingStrategy};
use cdrip_platform::DEFAULT_COMMAND_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration file name
const CONFIG_FILE_NAME: &str = "cdrip_config.toml";

/// Directory name under the platform config dir
const APP_NAME: &str = "cdrip";

/// Which ripping strategy to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Consensus over repeated passes
    #[default]
    Comparison,
    /// Jitter-corrected reads
    Paranoia,
}

/// Persistent ripping preferences
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Ripping strategy
    pub strategy: StrategyKind,

    /// Drive settings
    pub drive: DriveSettings,

    /// Comparison ripper settings
    pub comparison: ComparisonSettings,

    /// Paranoia ripper settings
    pub paranoia: ParanoiaSettings,

    /// Output settings
    pub output: OutputSettings,
}

/// Settings for the drive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriveSettings {
    /// Default device path (e.g., "/dev/sr0")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Sectors per READ CD command
    pub sectors_per_command: u32,

    /// Command timeout in seconds
    pub command_timeout_secs: u64,

    /// Read speed in KB/s, drive default if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_speed: Option<u16>,

    /// Cache size in KiB, overriding what the drive reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_size_kb: Option<usize>,
}

/// Settings for comparison ripping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComparisonSettings {
    /// Agreeing copies needed per sector
    pub required_matches: u32,

    /// Extra reads before a sector is committed flagged
    pub maximum_retries: u32,

    /// Compare by digest
    pub use_hashes: bool,

    /// Use C2 error pointers
    pub use_c2: bool,

    /// Drive read offset in samples
    pub drive_offset: i32,

    /// Sectors per read
    pub sectors_per_read: u32,

    /// Consecutive failures that abandon a range
    pub fatal_error_threshold: u32,

    /// Scratch directory for pass files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

/// Settings for paranoia ripping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParanoiaSettings {
    /// Corrector backend
    pub backend: ParanoiaBackend,

    /// Extra reads before a sector is committed flagged
    pub maximum_retries: u32,

    /// Jitter search window in samples
    pub max_jitter: u32,

    /// Consecutive failures that abandon a range
    pub fatal_error_threshold: u32,
}

/// Settings for rip output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputSettings {
    /// Directory for rip files
    pub directory: PathBuf,

    /// Write JSON manifests
    pub write_manifest: bool,

    /// Replace existing rip files
    pub overwrite: bool,
}

impl Default for DriveSettings {
    fn default() -> Self {
        Self {
            device: None,
            sectors_per_command: DEFAULT_SECTORS_PER_COMMAND,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            read_speed: None,
            cache_size_kb: None,
        }
    }
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            required_matches: DEFAULT_REQUIRED_MATCHES,
            maximum_retries: DEFAULT_MAXIMUM_RETRIES,
            use_hashes: true,
            use_c2: false,
            drive_offset: 0,
            sectors_per_read: DEFAULT_SECTORS_PER_READ,
            fatal_error_threshold: DEFAULT_FATAL_ERROR_THRESHOLD,
            work_dir: None,
        }
    }
}

impl Default for ParanoiaSettings {
    fn default() -> Self {
        Self {
            backend: ParanoiaBackend::default(),
            maximum_retries: DEFAULT_MAXIMUM_RETRIES,
            max_jitter: DEFAULT_MAX_JITTER,
            fatal_error_threshold: DEFAULT_FATAL_ERROR_THRESHOLD,
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            write_manifest: true,
            overwrite: false,
        }
    }
}

impl Settings {
    /// Load settings from the default location
    ///
    /// Returns default settings if the file doesn't exist or can't be parsed
    pub fn load() -> Self {
        Self::load_from_path(Self::config_path())
    }

    /// Load settings from a specific path
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            tracing::debug!("No config path available, using defaults");
            return Self::default();
        };

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(settings) => {
                    tracing::debug!("Loaded settings from {:?}", path);
                    settings
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Parse settings from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, SettingsError> {
        toml::from_str(contents).map_err(SettingsError::Deserialize)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<PathBuf, SettingsError> {
        self.save_to_path(Self::config_path())
    }

    /// Save settings to a specific path
    pub fn save_to_path(&self, path: Option<PathBuf>) -> Result<PathBuf, SettingsError> {
        let path = path.ok_or(SettingsError::NoConfigDir)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let contents = toml::to_string_pretty(self).map_err(SettingsError::Serialize)?;

        std::fs::write(&path, contents).map_err(|e| SettingsError::Io {
            path: path.clone(),
            source: e,
        })?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(path)
    }

    /// Location of `cdrip_config.toml`
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join(CONFIG_FILE_NAME))
    }

    /// `<config dir>/cdrip`
    pub fn config_dir() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join(APP_NAME))
    }

    /// Whether a settings file is present
    pub fn config_exists() -> bool {
        Self::config_path().is_some_and(|p| p.exists())
    }

    /// Default settings rendered as TOML, for writing a starter file
    pub fn default_config_string() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate default config"))
    }

    /// Ripping strategy described by these settings
    pub fn strategy(&self) -> RippingStrategy {
        match self.strategy {
            StrategyKind::Comparison => RippingStrategy::Comparison(self.comparison_config()),
            StrategyKind::Paranoia => RippingStrategy::Paranoia(self.paranoia_config()),
        }
    }

    /// Comparison configuration, clamped to valid values
    pub fn comparison_config(&self) -> ComparisonConfig {
        let c = &self.comparison;
        ComparisonConfig::new()
            .required_matches(c.required_matches)
            .maximum_retries(c.maximum_retries)
            .use_hashes(c.use_hashes)
            .use_c2(c.use_c2)
            .drive_offset(c.drive_offset)
            .sectors_per_read(c.sectors_per_read)
            .fatal_error_threshold(c.fatal_error_threshold)
            .work_dir(c.work_dir.clone())
    }

    /// Paranoia configuration, clamped to valid values
    pub fn paranoia_config(&self) -> ParanoiaConfig {
        let p = &self.paranoia;
        ParanoiaConfig::new()
            .backend(p.backend)
            .maximum_retries(p.maximum_retries)
            .max_jitter(p.max_jitter)
            .fatal_error_threshold(p.fatal_error_threshold)
    }

    /// Drive options, clamped to valid values
    pub fn drive_options(&self) -> DriveOptions {
        let d = &self.drive;
        DriveOptions::new()
            .sectors_per_command(d.sectors_per_command)
            .command_timeout(Duration::from_secs(d.command_timeout_secs.max(1)))
            .read_speed(d.read_speed)
            .cache_size(d.cache_size_kb.map(|kb| kb.saturating_mul(1024)))
    }

    /// Output configuration
    pub fn output_config(&self) -> OutputConfig {
        OutputConfig::new(self.output.directory.clone())
            .write_manifest(self.output.write_manifest)
            .overwrite(self.output.overwrite)
    }

    /// Full runtime configuration
    pub fn config(&self) -> Config {
        Config::new()
            .drive(self.drive_options())
            .strategy(self.strategy())
            .output(self.output_config())
    }
}

/// Settings persistence errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// No configuration directory available
    #[error("Could not determine configuration directory")]
    NoConfigDir,

    /// Failed to read or write config file
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path that caused the error
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },

    /// Failed to serialize settings
    #[error("Failed to serialize settings: {0}")]
    Serialize(toml::ser::Error),

    /// Failed to deserialize settings
    #[error("Failed to parse settings: {0}")]
    Deserialize(toml::de::Error),
}
