//! Configuration management for Taplink CLI

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_usb_scan_interval() -> u64 {
    3
}

/// Taplink CLI configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Path to the adb binary (defaults to "adb" on PATH)
    #[serde(default)]
    pub adb_path: Option<String>,

    /// Advertised device name (defaults to hostname)
    #[serde(default)]
    pub device_name: Option<String>,

    /// Seconds between USB bridge scans
    #[serde(default = "default_usb_scan_interval")]
    pub usb_scan_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adb_path: None,
            device_name: None,
            usb_scan_interval_secs: default_usb_scan_interval(),
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "taplink", "taplink")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.json"))
    }

    /// Load config from the default location, or return default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    /// Load config from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    /// Save config to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.adb_path.is_none());
        assert!(config.device_name.is_none());
        assert_eq!(config.usb_scan_interval_secs, 3);
    }

    #[test]
    fn test_serialization() {
        let config = Config {
            adb_path: Some("/opt/sdk/platform-tools/adb".to_string()),
            device_name: Some("workstation".to_string()),
            usb_scan_interval_secs: 5,
        };

        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(loaded.adb_path, config.adb_path);
        assert_eq!(loaded.device_name, config.device_name);
        assert_eq!(loaded.usb_scan_interval_secs, 5);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let loaded: Config = serde_json::from_str("{}").unwrap();
        assert!(loaded.adb_path.is_none());
        assert_eq!(loaded.usb_scan_interval_secs, 3);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        let config = Config {
            adb_path: Some("/opt/sdk/platform-tools/adb".to_string()),
            device_name: Some("workstation".to_string()),
            usb_scan_interval_secs: 7,
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.adb_path, config.adb_path);
        assert_eq!(loaded.device_name, config.device_name);
        assert_eq!(loaded.usb_scan_interval_secs, 7);
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("deeply/nested/config.json");

        // Directory shouldn't exist yet
        assert!(!path.parent().unwrap().exists());

        Config::default().save_to(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.adb_path.is_none());
        assert_eq!(loaded.usb_scan_interval_secs, 3);
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
