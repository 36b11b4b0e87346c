//! Beacon configuration and storage layout.

use crate::error::{BeaconError, Result};
use crate::persist::{Persister, write_atomic};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Radio, reporting and logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Beacon name used in check-in messages
    #[serde(rename = "Name")]
    pub name: String,
    /// Carrier frequency in Hz
    #[serde(rename = "Frequency")]
    pub frequency: u64,
    /// Channel bandwidth in Hz
    #[serde(rename = "Bandwidth")]
    pub bandwidth: u32,
    /// Transmit power in dBm
    #[serde(rename = "TXpower")]
    pub tx_power: i32,
    /// Spreading factor
    #[serde(rename = "Spread")]
    pub spreading_factor: u8,
    /// Coding rate denominator
    #[serde(rename = "CodeRate")]
    pub coding_rate: u8,
    /// Seconds between check-ins
    #[serde(rename = "ReportTime")]
    pub report_time: u64,
    /// Second of the minute check-ins are aligned to
    #[serde(rename = "TargetSecond")]
    pub target_second: u8,
    /// Send operational logs to `<storage>/log` instead of stderr
    #[serde(rename = "UseRNSLogFile")]
    pub use_log_file: bool,
    /// Write the audit record
    #[serde(rename = "UseCustomLogFile")]
    pub use_record_file: bool,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            name: "Unconfigured Beacon".to_string(),
            frequency: 915_000_000,
            bandwidth: 125_000,
            tx_power: 3,
            spreading_factor: 8,
            coding_rate: 5,
            report_time: 180,
            target_second: 0,
            use_log_file: false,
            use_record_file: false,
        }
    }
}

impl BeaconConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::InvalidConfig`] if the file cannot be read,
    /// parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            BeaconError::InvalidConfig(Cow::Owned(format!("{}: {e}", path.display())))
        })?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| BeaconError::InvalidConfig(Cow::Owned(e.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, writing and returning the defaults when it is missing
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::InvalidConfig`] if an existing file is bad.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        if let Err(e) = config.save(path) {
            tracing::error!("Failed to write default configuration: {}", e);
        }
        Ok(config)
    }

    fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BeaconError::Persistence(Cow::Owned(e.to_string())))
    }

    /// Save synchronously and atomically
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::Persistence`] if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = self.to_toml()?;
        write_atomic(path.as_ref(), contents.as_bytes())
            .map_err(|e| BeaconError::Persistence(Cow::Owned(e.to_string())))
    }

    /// Queue a save on the persistence task
    pub fn save_with(&self, persister: &Persister, path: impl Into<PathBuf>) {
        match self.to_toml() {
            Ok(contents) => persister.save(path, contents.into_bytes()),
            Err(e) => tracing::error!("Failed to serialize configuration: {}", e),
        }
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::InvalidConfig`] naming the first bad key.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BeaconError::invalid_config("Name must not be empty"));
        }
        if self.frequency == 0 {
            return Err(BeaconError::invalid_config("Frequency must be non-zero"));
        }
        if self.bandwidth == 0 {
            return Err(BeaconError::invalid_config("Bandwidth must be non-zero"));
        }
        if !(5..=12).contains(&self.spreading_factor) {
            return Err(BeaconError::InvalidConfig(Cow::Owned(format!(
                "Spread must be 5..=12, got {}",
                self.spreading_factor
            ))));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(BeaconError::InvalidConfig(Cow::Owned(format!(
                "CodeRate must be 5..=8, got {}",
                self.coding_rate
            ))));
        }
        if self.target_second > 59 {
            return Err(BeaconError::InvalidConfig(Cow::Owned(format!(
                "TargetSecond must be 0..=59, got {}",
                self.target_second
            ))));
        }
        Ok(())
    }

    /// Check-in interval
    #[must_use]
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_time.max(1))
    }
}

/// Files under the storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Layout rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root under the user's config directory
    #[must_use]
    pub fn default_root() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("LoRaBeacon/app_storage")
    }

    /// Storage root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configuration file
    #[must_use]
    pub fn config(&self) -> PathBuf {
        self.root.join("LoRaBeacon_config")
    }

    /// Long-term identity
    #[must_use]
    pub fn identity(&self) -> PathBuf {
        self.root.join("beacon_identity")
    }

    /// Known-destination cache
    #[must_use]
    pub fn known_destinations(&self) -> PathBuf {
        self.root.join("known_destinations")
    }

    /// Operational log used when `UseRNSLogFile` is set
    #[must_use]
    pub fn log(&self) -> PathBuf {
        self.root.join("log")
    }

    /// Create the root directory
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::Io`] if the directory cannot be created.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BeaconConfig::default();
        assert_eq!(config.name, "Unconfigured Beacon");
        assert_eq!(config.frequency, 915_000_000);
        assert_eq!(config.report_time, 180);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let config: BeaconConfig = toml::from_str("Name = \"Ridge\"\nReportTime = 60\n").unwrap();
        assert_eq!(config.name, "Ridge");
        assert_eq!(config.report_time, 60);
        assert_eq!(config.bandwidth, 125_000);
        assert!(!config.use_record_file);
    }

    #[test]
    fn test_save_load_uses_original_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("LoRaBeacon_config");
        let config = BeaconConfig {
            name: "Summit".to_string(),
            use_record_file: true,
            ..BeaconConfig::default()
        };
        config.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("TXpower"));
        assert!(text.contains("UseCustomLogFile = true"));
        assert_eq!(BeaconConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cases = [
            BeaconConfig { name: " ".into(), ..BeaconConfig::default() },
            BeaconConfig { frequency: 0, ..BeaconConfig::default() },
            BeaconConfig { bandwidth: 0, ..BeaconConfig::default() },
            BeaconConfig { spreading_factor: 13, ..BeaconConfig::default() },
            BeaconConfig { coding_rate: 4, ..BeaconConfig::default() },
            BeaconConfig { target_second: 60, ..BeaconConfig::default() },
        ];
        for config in &cases {
            let err = config.validate().unwrap_err();
            assert!(err.is_fatal(), "{err}");
        }
    }

    #[test]
    fn test_unparseable_file_is_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg");
        fs::write(&path, "Frequency = \"lots\"").unwrap();
        assert!(matches!(
            BeaconConfig::load(&path),
            Err(BeaconError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_or_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let paths = StoragePaths::new(dir.path().join("app_storage"));
        let config = BeaconConfig::load_or_default(paths.config()).unwrap();
        assert_eq!(config, BeaconConfig::default());
        assert!(paths.config().exists());
    }

    #[tokio::test]
    async fn test_save_with_persister() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg");
        let persister = Persister::spawn();

        BeaconConfig { report_time: 30, ..BeaconConfig::default() }.save_with(&persister, &path);
        BeaconConfig { report_time: 90, ..BeaconConfig::default() }.save_with(&persister, &path);
        persister.flush().await;

        assert_eq!(BeaconConfig::load(&path).unwrap().report_time, 90);
    }

    #[test]
    fn test_storage_layout() {
        let paths = StoragePaths::new("/srv/beacon");
        assert_eq!(paths.identity(), PathBuf::from("/srv/beacon/beacon_identity"));
        assert_eq!(paths.known_destinations(), PathBuf::from("/srv/beacon/known_destinations"));
        assert!(StoragePaths::default().root().ends_with("LoRaBeacon/app_storage"));
    }
}
