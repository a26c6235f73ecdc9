//! Configuration for cdrip operations

use crate::drive::{CdDrive, DriveOptions};
use crate::error::Result;
use crate::session::{OutputConfig, RipSession, RipTarget, RippingStrategy};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Options used when opening drives
    pub drive: DriveOptions,

    /// How sectors are extracted
    pub strategy: RippingStrategy,

    /// Where rip files go
    pub output: OutputConfig,
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set drive options
    pub fn drive(mut self, options: DriveOptions) -> Self {
        self.drive = options;
        self
    }

    /// Set the ripping strategy
    pub fn strategy(mut self, strategy: RippingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the output configuration
    pub fn output(mut self, output: OutputConfig) -> Self {
        self.output = output;
        self
    }

    /// Open the drive at `path` with these drive options
    pub fn open_drive(&self, path: &str) -> Result<CdDrive> {
        CdDrive::open_with_options(path, self.drive.clone())
    }

    /// Build a session for `targets`
    pub fn session(&self, targets: impl IntoIterator<Item = RipTarget>) -> RipSession {
        RipSession::new(self.strategy.clone(), self.output.clone()).with_targets(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparison::ComparisonConfig;
    use crate::paranoia::ParanoiaConfig;
    use crate::sector::SectorRange;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.drive, DriveOptions::default());
        assert_eq!(config.strategy, RippingStrategy::Comparison(ComparisonConfig::default()));
        assert!(config.output.write_manifest);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .drive(DriveOptions::new().sectors_per_command(8))
            .strategy(RippingStrategy::Paranoia(ParanoiaConfig::new()))
            .output(OutputConfig::new("/rips"));

        assert_eq!(config.drive.sectors_per_command, 8);
        assert_eq!(config.strategy.name(), "paranoia");
        assert_eq!(config.output.directory.to_string_lossy(), "/rips");
    }

    #[test]
    fn test_session_from_config() {
        let config = Config::new();
        let session = config.session([RipTarget::new(SectorRange::new(0, 99))]);
        assert_eq!(session.targets().len(), 1);
        assert_eq!(session.strategy(), &config.strategy);
    }
}
