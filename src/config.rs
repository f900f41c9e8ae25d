//! Application configuration
//!
//! Values delivered by the app-configuration collaborator. The file-backed
//! `AppConfig` mirrors the delivered payload; `ConfigManager` wraps it for
//! concurrent access from the services and the outdated-state scheduler.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Application configuration values
///
/// Loaded from JSON; defaults are used when the file does not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Hours after which a negative antigen test is deemed outdated.
    /// 0 disables the outdated-state feature entirely.
    pub hours_to_deem_test_outdated: u32,
    /// Backend data-retention horizon in days. A "token not found" response
    /// for a test younger than this is a genuine error, not expected expiry.
    /// Tracks assumed backend policy; confirm against the deployed backend.
    pub retention_period_days: u32,
    /// Interval of the recurring deadman reminder in hours
    pub deadman_reminder_hours: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hours_to_deem_test_outdated: 48,
            retention_period_days: 21,
            deadman_reminder_hours: 36,
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    ///
    /// # Returns
    /// The loaded configuration, or defaults if the file doesn't exist
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Storage(format!("Failed to read config: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&data)
            .map_err(|e| Error::Storage(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create config directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Storage(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, json)
            .map_err(|e| Error::Storage(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}

/// Thread-safe configuration manager for concurrent access
///
/// Clone-able handle over shared configuration state. Updates written
/// through the manager are persisted back to the config file.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<AppConfig>>,
    config_path: Option<Arc<String>>,
}

impl ConfigManager {
    /// Create a manager backed by a config file
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let config = AppConfig::load(&path)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: Some(Arc::new(path_str)),
        })
    }

    /// Create an in-memory manager from explicit values (no persistence)
    pub fn from_config(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: None,
        }
    }

    /// Current snapshot of the configuration
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Hours after which a negative antigen test is deemed outdated
    pub async fn hours_to_deem_test_outdated(&self) -> u32 {
        self.config.read().await.hours_to_deem_test_outdated
    }

    /// Backend retention horizon in days
    pub async fn retention_period_days(&self) -> u32 {
        self.config.read().await.retention_period_days
    }

    /// Deadman reminder interval in hours
    pub async fn deadman_reminder_hours(&self) -> u32 {
        self.config.read().await.deadman_reminder_hours
    }

    /// Replace the configuration (delivered config update) and persist it
    pub async fn update(&self, new_config: AppConfig) -> Result<()> {
        let mut config = self.config.write().await;
        *config = new_config;

        if let Some(path) = &self.config_path {
            config.save(path.as_str())?;
        }

        Ok(())
    }
}
