//! Capture Vault - Storage Quota
//!
//! Count/byte thresholds over the capture index, admission gating and
//! cleanup planning. Quota status is always derived from the durable index,
//! never cached.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blobs::BlobStore;
use crate::config::QuotaConfig;
use crate::error::{StorageError, StorageResult};
use crate::index::{CaptureIndex, CaptureIndexEntry};
use crate::locks::CaptureLocks;
use crate::status::CaptureStatus;

const BYTE_UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

/// Snapshot of quota usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub count: usize,
    pub total_bytes: u64,
    pub count_percent: f64,
    pub storage_percent: f64,
    /// Either limit crossed the warning threshold but neither is exceeded
    pub is_warning: bool,
    pub is_exceeded: bool,
}

/// Result of an eviction pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub bytes_freed: u64,
    /// Candidates left alone (gone, or claimed for upload meanwhile)
    pub skipped: Vec<String>,
}

/// Derive quota status from raw usage
pub fn quota_status(count: usize, total_bytes: u64, config: &QuotaConfig) -> QuotaStatus {
    let count_percent = count as f64 * 100.0 / config.max_captures as f64;
    let storage_percent = total_bytes as f64 * 100.0 / config.max_storage_bytes as f64;

    let is_exceeded = count >= config.max_captures || total_bytes >= config.max_storage_bytes;
    let is_warning =
        !is_exceeded && count_percent.max(storage_percent) >= config.warning_threshold * 100.0;

    QuotaStatus {
        count,
        total_bytes,
        count_percent,
        storage_percent,
        is_warning,
        is_exceeded,
    }
}

/// Stale when the whole-hour age reaches `stale_days` (inclusive)
pub fn is_stale(entry: &CaptureIndexEntry, now: DateTime<Utc>, stale_days: u32) -> bool {
    entry.age_hours(now) >= i64::from(stale_days) * 24
}

/// Bytes reclaimed by removing `candidates`
pub fn calculate_cleanup_savings(candidates: &[CaptureIndexEntry]) -> u64 {
    candidates.iter().map(|entry| entry.total_size).sum()
}

/// Human-readable size in 1024 units ("0 Bytes", "1 KB", "1.5 KB")
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, BYTE_UNITS[unit])
    } else {
        format!("{:.1} {}", rounded, BYTE_UNITS[unit])
    }
}

/// Human-readable age
pub fn format_age(hours: f64) -> String {
    if hours < 1.0 {
        return "less than an hour ago".to_string();
    }
    if hours < 24.0 {
        let whole = hours.floor() as u64;
        return format!("{} {} ago", whole, if whole == 1 { "hour" } else { "hours" });
    }
    let days = (hours / 24.0).floor() as u64;
    format!("{} {} ago", days, if days == 1 { "day" } else { "days" })
}

fn cleanup_rank(entry: &CaptureIndexEntry) -> u8 {
    match entry.status {
        CaptureStatus::PermanentlyFailed => 0,
        CaptureStatus::Failed => 1,
        _ => 2,
    }
}

/// Storage Quota Manager
pub struct StorageQuotaManager {
    config: QuotaConfig,
    index: Arc<CaptureIndex>,
    blobs: Arc<dyn BlobStore>,
    locks: CaptureLocks,
}

impl StorageQuotaManager {
    pub fn new(
        config: QuotaConfig,
        index: Arc<CaptureIndex>,
        blobs: Arc<dyn BlobStore>,
        locks: CaptureLocks,
    ) -> Self {
        Self {
            config,
            index,
            blobs,
            locks,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Current usage against the configured limits
    pub async fn status(&self) -> StorageResult<QuotaStatus> {
        let (count, total) = self.index.run(|index| index.usage()).await?;
        Ok(quota_status(count, total, &self.config))
    }

    /// Reject a capture of `incoming_bytes` that would breach either limit
    pub async fn check_admission(&self, incoming_bytes: u64) -> StorageResult<()> {
        let (count, total) = self.index.run(|index| index.usage()).await?;

        let reason = if count >= self.config.max_captures {
            format!(
                "capture limit reached ({} of {})",
                count, self.config.max_captures
            )
        } else if total.saturating_add(incoming_bytes) > self.config.max_storage_bytes {
            format!(
                "{} needed, {} of {} in use",
                format_bytes(incoming_bytes),
                format_bytes(total),
                format_bytes(self.config.max_storage_bytes)
            )
        } else {
            return Ok(());
        };

        let reclaimable = calculate_cleanup_savings(&self.cleanup_candidates(Utc::now()).await?);
        log::warn!(
            "Admission refused: {} ({} reclaimable)",
            reason,
            format_bytes(reclaimable)
        );
        Err(StorageError::QuotaExceeded {
            reason,
            reclaimable,
        })
    }

    /// Entries old enough to be cleanup candidates, oldest first
    pub async fn stale_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<CaptureIndexEntry>> {
        let mut stale: Vec<CaptureIndexEntry> = self
            .index
            .run(|index| index.scan_all())
            .await?
            .into_iter()
            .filter(|entry| entry.status != CaptureStatus::Uploading)
            .filter(|entry| is_stale(entry, now, self.config.stale_days))
            .collect();
        stale.sort_by_key(|entry| entry.queued_at);
        Ok(stale)
    }

    /// Failed, permanently failed and stale entries in eviction order
    pub async fn cleanup_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<CaptureIndexEntry>> {
        let mut candidates: Vec<CaptureIndexEntry> = self
            .index
            .run(|index| index.scan_all())
            .await?
            .into_iter()
            .filter(|entry| match entry.status {
                CaptureStatus::Uploading => false,
                CaptureStatus::Failed | CaptureStatus::PermanentlyFailed => true,
                _ => is_stale(entry, now, self.config.stale_days),
            })
            .collect();

        // Stable: equal timestamps keep insertion order
        candidates.sort_by_key(|entry| (cleanup_rank(entry), entry.queued_at));
        Ok(candidates)
    }

    /// Remove `candidates`: blob first, then entry, each under its capture lock
    pub async fn evict(&self, candidates: &[CaptureIndexEntry]) -> StorageResult<CleanupReport> {
        let mut report = CleanupReport::default();

        for candidate in candidates {
            let id = candidate.capture_id.clone();
            let _guard = self.locks.lock(&id).await;

            let lookup = id.clone();
            let current = match self.index.run(move |index| index.get(&lookup)).await? {
                Some(entry) if entry.status != CaptureStatus::Uploading => entry,
                _ => {
                    log::debug!("Cleanup skipped {}", id);
                    report.skipped.push(id);
                    continue;
                }
            };

            self.blobs.delete(&id).await?;
            let removed = id.clone();
            self.index.run(move |index| index.remove(&removed)).await?;

            report.bytes_freed += current.total_size;
            report.removed.push(id);
        }

        if !report.removed.is_empty() {
            log::info!(
                "Cleanup removed {} captures, freed {}",
                report.removed.len(),
                format_bytes(report.bytes_freed)
            );
        }
        Ok(report)
    }
}
