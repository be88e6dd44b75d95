//! Capture Vault - Configuration
//!
//! Quota and upload tuning, persisted as JSON next to the vault and
//! immutable once the vault is open.

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, CaptureResult};

/// Upper bound for any single backoff (30 days)
const MAX_DELAY_SECS: u64 = 30 * 24 * 60 * 60;

/// Storage quota thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Maximum number of captures held locally
    pub max_captures: usize,
    /// Maximum ciphertext bytes held locally
    pub max_storage_bytes: u64,
    /// Fraction of either limit at which a warning is raised
    pub warning_threshold: f64,
    /// Age after which a capture is a cleanup candidate
    pub stale_days: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_captures: 50,
            max_storage_bytes: 500 * 1024 * 1024,
            warning_threshold: 0.8,
            stale_days: 7,
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> CaptureResult<()> {
        if !(self.warning_threshold > 0.0 && self.warning_threshold < 1.0) {
            return Err(CaptureError::InvalidConfig(format!(
                "warning_threshold must be within (0, 1), got {}",
                self.warning_threshold
            )));
        }
        if self.max_captures == 0 {
            return Err(CaptureError::InvalidConfig("max_captures must be positive".into()));
        }
        if self.max_storage_bytes == 0 {
            return Err(CaptureError::InvalidConfig(
                "max_storage_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Upload retry and scheduling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Attempts before a capture becomes permanently failed
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_retry_delay_secs: u64,
    /// Backoff ceiling
    pub max_retry_delay_secs: u64,
    /// Concurrent transfers across all captures
    pub max_concurrent_uploads: usize,
    /// Worker wake-up interval when nothing notifies it
    pub poll_interval_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_retry_delay_secs: 30,
            max_retry_delay_secs: 3600,
            max_concurrent_uploads: 2,
            poll_interval_secs: 15,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> CaptureResult<()> {
        if self.max_attempts == 0 {
            return Err(CaptureError::InvalidConfig("max_attempts must be positive".into()));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(CaptureError::InvalidConfig(
                "max_concurrent_uploads must be positive".into(),
            ));
        }
        if self.base_retry_delay_secs > self.max_retry_delay_secs {
            return Err(CaptureError::InvalidConfig(
                "base_retry_delay_secs exceeds max_retry_delay_secs".into(),
            ));
        }
        Ok(())
    }

    /// Exponential backoff after `attempts` failed attempts (1-based), capped
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self
            .base_retry_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_retry_delay_secs);
        Duration::seconds(delay.min(MAX_DELAY_SECS) as i64)
    }
}

/// Vault configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl VaultConfig {
    pub fn validate(&self) -> CaptureResult<()> {
        self.quota.validate()?;
        self.upload.validate()
    }

    /// Load from JSON, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> CaptureResult<Self> {
        let config = if path.exists() {
            let data = std::fs::read(path)?;
            serde_json::from_slice(&data)
                .map_err(|e| CaptureError::InvalidConfig(format!("{}: {}", path.display(), e)))?
        } else {
            VaultConfig::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Save to JSON
    pub fn save(&self, path: &Path) -> CaptureResult<()> {
        let data = serde_json::to_vec_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, data)?;
        Ok(())
    }
}
