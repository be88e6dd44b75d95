//! Capture Vault - Upload Coordinator
//!
//! Drives each capture through `pending → uploading → completed`, with
//! retry/backoff on transient failures and resumption across process death.
//!
//! ```text
//!   process_due / upload_now            OS wake (handle_transfer_event)
//!            │                                     │
//!            ▼                                     │
//!   claim (begin_upload + transfer id)             │
//!            │                                     │
//!            ▼                                     │
//!   transport.upload ──(cancel token)──┐           │
//!            │                         ▼           ▼
//!            └──────────────────────► finalize (per-capture lock)
//!                                      │
//!              completed → delete blob → remove entry
//!              retriable → failed, backoff (or permanently_failed)
//!              permanent → permanently_failed
//! ```
//!
//! At most one transfer per capture is in flight: the durable `uploading`
//! status plus the registered transfer id decide which outcome is applied,
//! and every other outcome is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::blobs::BlobStore;
use crate::config::UploadConfig;
use crate::error::{CaptureError, CaptureResult, StorageError, UploadError};
use crate::index::{CaptureIndex, CaptureIndexEntry, TransferResolution};
use crate::locks::CaptureLocks;
use crate::status::CaptureStatus;
use crate::transport::{UploadRequest, UploadTransport};

const INTERRUPTED: &str = "upload interrupted";
const CANCELLED: &str = "upload cancelled";

/// What finalization did with an upload outcome
#[derive(Debug, Clone, PartialEq)]
pub enum UploadResolution {
    /// Delivered; blob and entry purged
    Completed,
    /// Back to `failed`, due again at `next_retry_at`
    Retrying {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    },
    PermanentlyFailed { reason: String },
    /// Interrupted on request; no attempt consumed
    Cancelled,
    /// Stale outcome: unknown transfer, entry gone or superseded
    Ignored,
}

/// Cold-start recovery summary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Completed leftovers purged
    pub purged: usize,
    /// Uploads cut off by process death, now failed
    pub interrupted: Vec<String>,
}

/// How one transfer ended, before finalization
#[derive(Debug)]
enum Attempt {
    Delivered,
    Rejected(UploadError),
    Cancelled,
}

/// Capture id and result of one spawned upload
type UploadTask = (String, CaptureResult<UploadResolution>);

struct InFlight {
    transfer_id: String,
    token: CancellationToken,
}

struct Inner {
    index: Arc<CaptureIndex>,
    blobs: Arc<dyn BlobStore>,
    transport: Arc<dyn UploadTransport>,
    config: UploadConfig,
    locks: CaptureLocks,
    in_flight: Mutex<HashMap<String, InFlight>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    wake: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Upload Coordinator
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

impl UploadCoordinator {
    pub fn new(
        index: Arc<CaptureIndex>,
        blobs: Arc<dyn BlobStore>,
        transport: Arc<dyn UploadTransport>,
        config: UploadConfig,
        locks: CaptureLocks,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_uploads));
        Self {
            inner: Arc::new(Inner {
                index,
                blobs,
                transport,
                config,
                locks,
                in_flight: Mutex::new(HashMap::new()),
                permits,
                shutdown: CancellationToken::new(),
                wake: Notify::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Ids with a transfer running in this process
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.in_flight.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> CaptureResult<()> {
        if self.is_shutting_down() {
            Err(CaptureError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RECOVERY
    // ═══════════════════════════════════════════════════════════════════════

    /// Cold start: purge completed leftovers and fail uploads with no live transfer
    pub async fn recover(&self) -> CaptureResult<RecoveryReport> {
        let mut report = RecoveryReport {
            purged: self.purge_completed().await?,
            ..Default::default()
        };

        let now = Utc::now();
        let uploading = self
            .inner
            .index
            .run(|index| index.list_by_status(CaptureStatus::Uploading))
            .await?;
        for entry in uploading {
            let id = entry.capture_id.clone();
            if self.inner.in_flight.lock().contains_key(&id) {
                continue;
            }

            let _guard = self.inner.locks.lock(&id).await;
            let Some(entry) = self.get_entry(&id).await? else {
                continue;
            };
            if entry.status != CaptureStatus::Uploading {
                continue;
            }

            // The interrupted attempt counts, so a capture that keeps killing
            // the process still ends up permanently failed. No backoff: the
            // next pass resubmits it.
            let resolution = match self.retry_resolution(&entry, INTERRUPTED.to_string(), now) {
                TransferResolution::Retry {
                    attempts, error, ..
                } => TransferResolution::Retry {
                    attempts,
                    next_retry_at: now,
                    error,
                },
                other => other,
            };
            let (target, transfer_id) = (id.clone(), entry.transfer_id.clone());
            self.inner
                .index
                .run(move |index| match transfer_id {
                    Some(transfer_id) => index
                        .resolve_transfer(&target, &transfer_id, &resolution)
                        .map(|_| ()),
                    None => index.update_status(&target, resolution.status()).map(|_| ()),
                })
                .await?;

            log::warn!(
                "Recovered interrupted upload {} (attempt {} of {})",
                id,
                entry.attempts + 1,
                self.inner.config.max_attempts
            );
            report.interrupted.push(entry.capture_id.clone());
        }

        log::info!(
            "Recovery finished: {} purged, {} interrupted",
            report.purged,
            report.interrupted.len()
        );
        Ok(report)
    }

    /// Finish purging entries that reached `completed` before a crash
    pub async fn purge_completed(&self) -> CaptureResult<usize> {
        let mut purged = 0;
        let completed = self
            .inner
            .index
            .run(|index| index.list_by_status(CaptureStatus::Completed))
            .await?;
        for entry in completed {
            let id = entry.capture_id.as_str();
            let _guard = self.inner.locks.lock(id).await;

            self.inner.blobs.delete(id).await?;
            if self.remove_entry(id).await? {
                log::debug!("Purged completed capture {}", id);
                purged += 1;
            }
        }
        Ok(purged)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UPLOADS
    // ═══════════════════════════════════════════════════════════════════════

    /// Upload every due entry, up to `max_concurrent_uploads` at a time
    pub async fn process_due(&self) -> CaptureResult<Vec<(String, UploadResolution)>> {
        self.ensure_running()?;

        let due = self.due_entries().await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        log::debug!("{} captures due for upload", due.len());

        let mut tasks = JoinSet::new();
        for entry in due {
            if self.inner.in_flight.lock().contains_key(&entry.capture_id) {
                continue;
            }

            // Permits are taken here, in queue order, so claims stay FIFO
            let permit = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                permit = Arc::clone(&self.inner.permits).acquire_owned() => {
                    permit.map_err(|_| CaptureError::ShuttingDown)?
                }
            };

            self.spawn_upload(&mut tasks, entry.capture_id, permit);
        }

        let mut resolutions = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(resolved) = Self::reap(joined) {
                resolutions.push(resolved);
            }
        }
        Ok(resolutions)
    }

    fn spawn_upload(
        &self,
        tasks: &mut JoinSet<UploadTask>,
        capture_id: String,
        permit: OwnedSemaphorePermit,
    ) {
        let this = self.clone();
        tasks.spawn(async move {
            let result = this.run_upload(&capture_id, permit).await;
            (capture_id, result)
        });
    }

    fn reap(joined: Result<UploadTask, JoinError>) -> Option<(String, UploadResolution)> {
        match joined {
            Ok((id, Ok(resolution))) => Some((id, resolution)),
            // Claimed elsewhere between listing and claiming
            Ok((id, Err(CaptureError::Storage(StorageError::InvalidTransition { .. })))) => {
                log::debug!("Skipped {}: already claimed", id);
                None
            }
            Ok((id, Err(e))) => {
                log::warn!("Upload of {} failed: {}", id, e);
                None
            }
            Err(e) => {
                log::warn!("Upload task aborted: {}", e);
                None
            }
        }
    }

    /// Foreground upload of one capture, ignoring any pending backoff
    pub async fn upload_now(&self, capture_id: &str) -> CaptureResult<UploadResolution> {
        self.ensure_running()?;

        let permit = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(CaptureError::ShuttingDown),
            permit = Arc::clone(&self.inner.permits).acquire_owned() => {
                permit.map_err(|_| CaptureError::ShuttingDown)?
            }
        };
        self.run_upload(capture_id, permit).await
    }

    async fn run_upload(
        &self,
        capture_id: &str,
        _permit: OwnedSemaphorePermit,
    ) -> CaptureResult<UploadResolution> {
        let transfer_id = Uuid::new_v4().to_string();
        let token = self.inner.shutdown.child_token();

        let entry = {
            let _guard = self.inner.locks.lock(capture_id).await;
            let entry = self.claim(capture_id, &transfer_id).await?;
            self.inner.in_flight.lock().insert(
                capture_id.to_string(),
                InFlight {
                    transfer_id: transfer_id.clone(),
                    token: token.clone(),
                },
            );
            entry
        };
        log::info!(
            "Uploading {} (transfer {}, attempt {})",
            capture_id,
            transfer_id,
            entry.attempts + 1
        );

        let attempt = match self.inner.blobs.read(capture_id).await {
            Ok(ciphertext) => {
                let request = UploadRequest {
                    capture_id: capture_id.to_string(),
                    transfer_id: transfer_id.clone(),
                    ciphertext,
                    encryption: entry.encryption,
                    metadata: entry.metadata,
                };

                tokio::select! {
                    biased;
                    _ = token.cancelled() => Attempt::Cancelled,
                    result = self.inner.transport.upload(&request) => match result {
                        Ok(()) => Attempt::Delivered,
                        Err(e) => Attempt::Rejected(e),
                    },
                }
            }
            Err(StorageError::BlobNotFound(_)) => {
                Attempt::Rejected(UploadError::Permanent("encrypted blob is missing".into()))
            }
            Err(e) => Attempt::Rejected(UploadError::Retriable(e.to_string())),
        };

        self.finalize(capture_id, &transfer_id, attempt).await
    }

    /// OS wake path: apply the result of a background transfer
    pub async fn handle_transfer_event(
        &self,
        transfer_id: &str,
        result: Result<(), UploadError>,
    ) -> CaptureResult<UploadResolution> {
        let lookup = transfer_id.to_string();
        let Some(capture_id) = self
            .inner
            .index
            .run(move |index| index.capture_for_transfer(&lookup))
            .await?
        else {
            log::debug!("Ignoring event for unknown transfer {}", transfer_id);
            return Ok(UploadResolution::Ignored);
        };

        let attempt = match result {
            Ok(()) => Attempt::Delivered,
            Err(e) => Attempt::Rejected(e),
        };
        self.finalize(&capture_id, transfer_id, attempt).await
    }

    /// Apply one transfer outcome. Idempotent: stale outcomes are ignored.
    async fn finalize(
        &self,
        capture_id: &str,
        transfer_id: &str,
        attempt: Attempt,
    ) -> CaptureResult<UploadResolution> {
        let _guard = self.inner.locks.lock(capture_id).await;

        {
            let mut in_flight = self.inner.in_flight.lock();
            if in_flight
                .get(capture_id)
                .map_or(false, |f| f.transfer_id == transfer_id)
            {
                if let Some(running) = in_flight.remove(capture_id) {
                    running.token.cancel();
                }
            }
        }

        let Some(entry) = self.get_entry(capture_id).await? else {
            log::debug!("Ignoring outcome for removed capture {}", capture_id);
            return Ok(UploadResolution::Ignored);
        };
        if entry.transfer_id.as_deref() != Some(transfer_id) {
            log::debug!("Ignoring superseded transfer {} for {}", transfer_id, capture_id);
            return Ok(UploadResolution::Ignored);
        }

        match (entry.status, &attempt) {
            (CaptureStatus::Uploading, _) => {}
            // Late success for a transfer recovery already gave up on
            (CaptureStatus::Failed, Attempt::Delivered) => {
                log::info!("Adopting late delivery of {} (transfer {})", capture_id, transfer_id);
                self.claim(capture_id, transfer_id).await?;
            }
            _ => return Ok(UploadResolution::Ignored),
        }

        let now = Utc::now();
        let (resolution, outcome) = match attempt {
            Attempt::Delivered => (TransferResolution::Completed, UploadResolution::Completed),
            Attempt::Rejected(UploadError::Retriable(reason)) => {
                let resolution = self.retry_resolution(&entry, reason, now);
                let outcome = match &resolution {
                    TransferResolution::Retry {
                        attempts,
                        next_retry_at,
                        ..
                    } => UploadResolution::Retrying {
                        attempts: *attempts,
                        next_retry_at: *next_retry_at,
                    },
                    TransferResolution::PermanentlyFailed { error, .. } => {
                        UploadResolution::PermanentlyFailed {
                            reason: error.clone(),
                        }
                    }
                    TransferResolution::Completed => UploadResolution::Completed,
                };
                (resolution, outcome)
            }
            Attempt::Rejected(UploadError::Permanent(reason)) => (
                TransferResolution::PermanentlyFailed {
                    attempts: entry.attempts + 1,
                    error: reason.clone(),
                },
                UploadResolution::PermanentlyFailed { reason },
            ),
            Attempt::Cancelled => (
                TransferResolution::Retry {
                    attempts: entry.attempts,
                    next_retry_at: now + self.inner.config.retry_delay(1),
                    error: CANCELLED.to_string(),
                },
                UploadResolution::Cancelled,
            ),
        };

        let (target, transfer) = (capture_id.to_string(), transfer_id.to_string());
        self.inner
            .index
            .run(move |index| index.resolve_transfer(&target, &transfer, &resolution))
            .await?;

        match &outcome {
            UploadResolution::Completed => {
                log::info!("Upload of {} completed", capture_id);
                // Blob first, entry second; a crash in between leaves a
                // completed entry for the next purge
                match self.inner.blobs.delete(capture_id).await {
                    Ok(()) => {
                        self.remove_entry(capture_id).await?;
                    }
                    Err(e) => log::warn!("Could not purge uploaded capture {}: {}", capture_id, e),
                }
            }
            UploadResolution::Retrying {
                attempts,
                next_retry_at,
            } => log::warn!(
                "Upload of {} failed (attempt {}), retrying at {}",
                capture_id,
                attempts,
                next_retry_at
            ),
            UploadResolution::PermanentlyFailed { reason } => {
                log::warn!("Upload of {} permanently failed: {}", capture_id, reason)
            }
            UploadResolution::Cancelled => log::info!("Upload of {} cancelled", capture_id),
            UploadResolution::Ignored => {}
        }

        Ok(outcome)
    }

    /// Retry bookkeeping for a transient failure of `entry`'s current attempt
    fn retry_resolution(
        &self,
        entry: &CaptureIndexEntry,
        error: String,
        now: DateTime<Utc>,
    ) -> TransferResolution {
        let attempts = entry.attempts + 1;
        if attempts >= self.inner.config.max_attempts {
            TransferResolution::PermanentlyFailed {
                attempts,
                error: format!("{} (gave up after {} attempts)", error, attempts),
            }
        } else {
            TransferResolution::Retry {
                attempts,
                next_retry_at: now + self.inner.config.retry_delay(attempts),
                error,
            }
        }
    }

    async fn get_entry(&self, capture_id: &str) -> CaptureResult<Option<CaptureIndexEntry>> {
        let target = capture_id.to_string();
        Ok(self.inner.index.run(move |index| index.get(&target)).await?)
    }

    async fn remove_entry(&self, capture_id: &str) -> CaptureResult<bool> {
        let target = capture_id.to_string();
        Ok(self.inner.index.run(move |index| index.remove(&target)).await?)
    }

    async fn claim(&self, capture_id: &str, transfer_id: &str) -> CaptureResult<CaptureIndexEntry> {
        let (target, transfer) = (capture_id.to_string(), transfer_id.to_string());
        Ok(self
            .inner
            .index
            .run(move |index| index.begin_upload(&target, &transfer))
            .await?)
    }

    async fn due_entries(&self) -> CaptureResult<Vec<CaptureIndexEntry>> {
        let now = Utc::now();
        Ok(self.inner.index.run(move |index| index.list_due(now)).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // USER ACTIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Cancel any transfer, delete the blob, remove the entry
    pub async fn discard(&self, capture_id: &str) -> CaptureResult<bool> {
        self.cancel(capture_id);

        let _guard = self.inner.locks.lock(capture_id).await;
        // A claim may have landed while we waited for the lock
        if let Some(running) = self.inner.in_flight.lock().remove(capture_id) {
            running.token.cancel();
        }

        if self.get_entry(capture_id).await?.is_none() {
            return Ok(false);
        }

        self.inner.blobs.delete(capture_id).await?;
        self.remove_entry(capture_id).await?;
        log::info!("Discarded capture {}", capture_id);
        Ok(true)
    }

    /// Manual retry of a failed or permanently failed capture
    pub async fn retry(&self, capture_id: &str) -> CaptureResult<CaptureIndexEntry> {
        let entry = {
            let _guard = self.inner.locks.lock(capture_id).await;
            let target = capture_id.to_string();
            self.inner
                .index
                .run(move |index| index.reset_for_retry(&target))
                .await?
        };
        log::info!("Capture {} queued for manual retry", capture_id);
        self.notify();
        Ok(entry)
    }

    /// Interrupt the transfer of one capture; `false` if none is running
    pub fn cancel(&self, capture_id: &str) -> bool {
        match self.inner.in_flight.lock().get(capture_id) {
            Some(running) => {
                running.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Interrupt every running transfer (app moving to background)
    pub fn cancel_all(&self) -> usize {
        let in_flight = self.inner.in_flight.lock();
        for running in in_flight.values() {
            running.token.cancel();
        }
        in_flight.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // WORKER
    // ═══════════════════════════════════════════════════════════════════════

    /// Wake the worker (new capture admitted, connectivity regained)
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }

    /// Spawn the background worker; a second call is a no-op
    pub fn start(&self) -> CaptureResult<()> {
        self.ensure_running()?;

        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CaptureError::InvalidConfig(format!("no tokio runtime: {}", e)))?;
        let this = self.clone();
        *worker = Some(runtime.spawn(async move { this.run_worker().await }));

        log::info!(
            "Upload worker started ({} concurrent, polling every {}s)",
            self.inner.config.max_concurrent_uploads,
            self.inner.config.poll_interval_secs
        );
        Ok(())
    }

    async fn run_worker(self) {
        let poll = StdDuration::from_secs(self.inner.config.poll_interval_secs.max(1));
        let mut tasks: JoinSet<UploadTask> = JoinSet::new();
        let mut queued: HashSet<String> = HashSet::new();

        loop {
            if let Err(e) = self.purge_completed().await {
                log::warn!("Purge of completed captures failed: {}", e);
            }

            match self.claim_free_slots(&mut tasks, &mut queued).await {
                Ok(_) => {}
                Err(CaptureError::ShuttingDown) => break,
                Err(e) => log::warn!("Upload pass failed: {}", e),
            }

            // Finished uploads free a permit, so each reap loops back to claiming
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::reap_queued(joined, &mut queued);
                }
            }
        }

        // Transfers were cancelled with the shutdown token; wait for them to settle
        while let Some(joined) = tasks.join_next().await {
            Self::reap_queued(joined, &mut queued);
        }
        log::debug!("Upload worker stopped");
    }

    /// Spawn uploads for due entries while permits are free, without waiting on them
    async fn claim_free_slots(
        &self,
        tasks: &mut JoinSet<UploadTask>,
        queued: &mut HashSet<String>,
    ) -> CaptureResult<usize> {
        self.ensure_running()?;

        let mut spawned = 0;
        for entry in self.due_entries().await? {
            if queued.contains(&entry.capture_id)
                || self.inner.in_flight.lock().contains_key(&entry.capture_id)
            {
                continue;
            }

            let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => break,
                Err(TryAcquireError::Closed) => return Err(CaptureError::ShuttingDown),
            };

            queued.insert(entry.capture_id.clone());
            self.spawn_upload(tasks, entry.capture_id, permit);
            spawned += 1;
        }
        Ok(spawned)
    }

    fn reap_queued(joined: Result<UploadTask, JoinError>, queued: &mut HashSet<String>) {
        match &joined {
            Ok((id, _)) => {
                queued.remove(id);
            }
            // The id is lost with a panicked task; forget ids no longer running
            Err(_) => queued.clear(),
        }
        Self::reap(joined);
    }

    /// Cancel running transfers and wait for the worker to exit
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let worker = self.inner.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                log::warn!("Upload worker ended abnormally: {}", e);
            }
        }
        log::info!("Upload coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::MemoryBlobStore;
    use crate::index::tests::new_capture;
    use crate::transport::scripted::ScriptedTransport;
    use chrono::Duration;
    use std::future::Future;

    struct Harness {
        coordinator: UploadCoordinator,
        index: Arc<CaptureIndex>,
        blobs: Arc<MemoryBlobStore>,
        transport: Arc<ScriptedTransport>,
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn upload_config() -> UploadConfig {
        UploadConfig {
            max_attempts: 3,
            base_retry_delay_secs: 0,
            max_retry_delay_secs: 60,
            max_concurrent_uploads: 2,
            poll_interval_secs: 1,
        }
    }

    fn harness_with(
        index: Arc<CaptureIndex>,
        transport: ScriptedTransport,
        config: UploadConfig,
    ) -> Harness {
        init_logging();
        let blobs = Arc::new(MemoryBlobStore::new());
        let transport = Arc::new(transport);
        let coordinator = UploadCoordinator::new(
            Arc::clone(&index),
            blobs.clone(),
            transport.clone(),
            config,
            CaptureLocks::new(),
        );
        Harness {
            coordinator,
            index,
            blobs,
            transport,
        }
    }

    fn harness(transport: ScriptedTransport) -> Harness {
        harness_with(
            Arc::new(CaptureIndex::open_in_memory().unwrap()),
            transport,
            upload_config(),
        )
    }

    impl Harness {
        async fn queue(&self, id: &str) {
            self.blobs.write(id, b"ciphertext and tag").await.unwrap();
            self.index.admit(new_capture(id, 18)).unwrap();
        }

        fn status(&self, id: &str) -> Option<CaptureStatus> {
            self.index.get(id).unwrap().map(|e| e.status)
        }
    }

    async fn eventually<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..500 {
            if condition().await {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_successful_upload_purges_capture() {
        let h = harness(ScriptedTransport::accepting());
        h.queue("cap-1").await;

        let results = h.coordinator.process_due().await.unwrap();
        assert_eq!(results, vec![("cap-1".to_string(), UploadResolution::Completed)]);

        assert!(h.index.get("cap-1").unwrap().is_none());
        assert!(!h.blobs.contains("cap-1"));

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].ciphertext, b"ciphertext and tag");
        assert!(Uuid::parse_str(&requests[0].transfer_id).is_ok());
    }

    #[tokio::test]
    async fn test_retriable_failure_backs_off() {
        let config = UploadConfig {
            base_retry_delay_secs: 30,
            ..upload_config()
        };
        let h = harness_with(
            Arc::new(CaptureIndex::open_in_memory().unwrap()),
            ScriptedTransport::with_fallback(Err(UploadError::Retriable("HTTP 503".into()))),
            config,
        );
        h.queue("cap-1").await;

        let before = Utc::now();
        let results = h.coordinator.process_due().await.unwrap();
        match &results[0].1 {
            UploadResolution::Retrying {
                attempts,
                next_retry_at,
            } => {
                assert_eq!(*attempts, 1);
                assert!(*next_retry_at >= before + Duration::seconds(30));
            }
            other => panic!("unexpected {:?}", other),
        }

        let entry = h.index.get("cap-1").unwrap().unwrap();
        assert_eq!(entry.status, CaptureStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("HTTP 503"));
        assert!(h.blobs.contains("cap-1"));

        // Not due yet: nothing else is attempted
        assert!(h.coordinator.process_due().await.unwrap().is_empty());
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_permanently_failed() {
        let h = harness(ScriptedTransport::with_fallback(Err(UploadError::Retriable(
            "timeout".into(),
        ))));
        h.queue("cap-1").await;

        for expected in 1..3 {
            let results = h.coordinator.process_due().await.unwrap();
            assert!(matches!(
                results[0].1,
                UploadResolution::Retrying { attempts, .. } if attempts == expected
            ));
        }

        let results = h.coordinator.process_due().await.unwrap();
        assert!(matches!(results[0].1, UploadResolution::PermanentlyFailed { .. }));
        assert_eq!(h.status("cap-1"), Some(CaptureStatus::PermanentlyFailed));
        assert_eq!(h.index.get("cap-1").unwrap().unwrap().attempts, 3);

        // Terminal: never picked up again, still visible
        assert!(h.coordinator.process_due().await.unwrap().is_empty());
        assert_eq!(h.transport.calls(), 3);
        assert!(h.blobs.contains("cap-1"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness(ScriptedTransport::with_fallback(Err(UploadError::Permanent(
            "HTTP 401".into(),
        ))));
        h.queue("cap-1").await;

        let results = h.coordinator.process_due().await.unwrap();
        assert_eq!(
            results[0].1,
            UploadResolution::PermanentlyFailed {
                reason: "HTTP 401".into()
            }
        );
        assert!(h.coordinator.process_due().await.unwrap().is_empty());
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_blob_fails_permanently() {
        let h = harness(ScriptedTransport::accepting());
        h.index.admit(new_capture("ghost", 10)).unwrap();

        let resolution = h.coordinator.upload_now("ghost").await.unwrap();
        assert!(matches!(resolution, UploadResolution::PermanentlyFailed { .. }));
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_second_claim_rejected_while_in_flight() {
        let h = harness(ScriptedTransport::hanging());
        h.queue("cap-1").await;

        let first = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.upload_now("cap-1").await })
        };
        let transport = Arc::clone(&h.transport);
        eventually(|| {
            let transport = Arc::clone(&transport);
            async move { transport.calls() == 1 }
        })
        .await;

        let second = h.coordinator.upload_now("cap-1").await;
        assert!(matches!(
            second,
            Err(CaptureError::Storage(StorageError::InvalidTransition { .. }))
        ));
        assert_eq!(h.coordinator.in_flight(), vec!["cap-1"]);

        assert!(h.coordinator.cancel("cap-1"));
        assert_eq!(first.await.unwrap().unwrap(), UploadResolution::Cancelled);

        // Cancelled: back to failed without consuming an attempt
        let entry = h.index.get("cap-1").unwrap().unwrap();
        assert_eq!(entry.status, CaptureStatus::Failed);
        assert_eq!(entry.attempts, 0);
        assert!(h.coordinator.in_flight().is_empty());
        assert!(!h.coordinator.cancel("cap-1"));
    }

    #[tokio::test]
    async fn test_interrupted_upload_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db").join("index.db");

        // First process: claims the capture, then dies mid-transfer
        {
            let index = CaptureIndex::open(&db).unwrap();
            index.admit(new_capture("cap-1", 18)).unwrap();
            index.admit(new_capture("cap-2", 18)).unwrap();
            index.begin_upload("cap-1", "transfer-dead").unwrap();
        }

        // A real backoff: the interrupted attempt must still be due at once
        let config = UploadConfig {
            base_retry_delay_secs: 30,
            ..upload_config()
        };
        let h = harness_with(
            Arc::new(CaptureIndex::open(&db).unwrap()),
            ScriptedTransport::accepting(),
            config,
        );
        h.blobs.write("cap-1", b"ciphertext and tag").await.unwrap();
        h.blobs.write("cap-2", b"ciphertext and tag").await.unwrap();

        let report = h.coordinator.recover().await.unwrap();
        assert_eq!(report.interrupted, vec!["cap-1"]);
        let entry = h.index.get("cap-1").unwrap().unwrap();
        assert_eq!(entry.status, CaptureStatus::Failed);
        assert_eq!(entry.attempts, 1);

        let results = h.coordinator.process_due().await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| *r == UploadResolution::Completed));
        assert_eq!(h.index.count().unwrap(), 0);

        // Re-submitted in insertion order
        let order: Vec<String> = h.transport.requests().into_iter().map(|r| r.capture_id).collect();
        assert_eq!(order, vec!["cap-1", "cap-2"]);
    }

    #[tokio::test]
    async fn test_repeated_interruptions_terminate() {
        let index = Arc::new(CaptureIndex::open_in_memory().unwrap());
        let h = harness_with(index, ScriptedTransport::accepting(), upload_config());
        h.queue("cap-1").await;

        for round in 0..3 {
            h.index.begin_upload("cap-1", &format!("dead-{}", round)).unwrap();
            h.coordinator.recover().await.unwrap();
        }

        assert_eq!(h.status("cap-1"), Some(CaptureStatus::PermanentlyFailed));
    }

    #[tokio::test]
    async fn test_recover_purges_completed_leftovers() {
        let h = harness(ScriptedTransport::accepting());
        h.queue("cap-1").await;
        h.index.begin_upload("cap-1", "t-1").unwrap();
        h.index
            .resolve_transfer("cap-1", "t-1", &TransferResolution::Completed)
            .unwrap();

        let report = h.coordinator.recover().await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(report.interrupted.is_empty());
        assert!(h.index.get("cap-1").unwrap().is_none());
        assert!(!h.blobs.contains("cap-1"));
    }

    #[tokio::test]
    async fn test_transfer_events_are_idempotent() {
        let h = harness(ScriptedTransport::accepting());
        h.queue("cap-1").await;
        h.index.begin_upload("cap-1", "bg-1").unwrap();

        let first = h.coordinator.handle_transfer_event("bg-1", Ok(())).await.unwrap();
        assert_eq!(first, UploadResolution::Completed);
        assert!(h.index.get("cap-1").unwrap().is_none());

        let again = h.coordinator.handle_transfer_event("bg-1", Ok(())).await.unwrap();
        assert_eq!(again, UploadResolution::Ignored);

        let unknown = h
            .coordinator
            .handle_transfer_event("never-registered", Err(UploadError::Permanent("x".into())))
            .await
            .unwrap();
        assert_eq!(unknown, UploadResolution::Ignored);
    }

    #[tokio::test]
    async fn test_late_success_after_recovery_is_adopted() {
        let h = harness(ScriptedTransport::accepting());
        h.queue("cap-1").await;
        h.index.begin_upload("cap-1", "bg-1").unwrap();

        h.coordinator.recover().await.unwrap();
        assert_eq!(h.status("cap-1"), Some(CaptureStatus::Failed));

        let resolution = h.coordinator.handle_transfer_event("bg-1", Ok(())).await.unwrap();
        assert_eq!(resolution, UploadResolution::Completed);
        assert!(h.index.get("cap-1").unwrap().is_none());
        assert!(!h.blobs.contains("cap-1"));
    }

    #[tokio::test]
    async fn test_superseded_transfer_is_ignored() {
        let h = harness(
            ScriptedTransport::with_fallback(Ok(()))
                .then(Err(UploadError::Retriable("HTTP 502".into()))),
        );
        h.queue("cap-1").await;
        h.index.begin_upload("cap-1", "bg-old").unwrap();
        h.coordinator.recover().await.unwrap();

        // New attempt registers a new transfer id
        h.coordinator.process_due().await.unwrap();
        let entry = h.index.get("cap-1").unwrap().unwrap();
        assert_ne!(entry.transfer_id.as_deref(), Some("bg-old"));

        let stale = h
            .coordinator
            .handle_transfer_event("bg-old", Err(UploadError::Permanent("HTTP 400".into())))
            .await
            .unwrap();
        assert_eq!(stale, UploadResolution::Ignored);
        assert_eq!(h.status("cap-1"), Some(CaptureStatus::Failed));
    }

    #[tokio::test]
    async fn test_discard_cancels_in_flight_upload() {
        let h = harness(ScriptedTransport::hanging());
        h.queue("cap-1").await;

        let upload = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.upload_now("cap-1").await })
        };
        let transport = Arc::clone(&h.transport);
        eventually(|| {
            let transport = Arc::clone(&transport);
            async move { transport.calls() == 1 }
        })
        .await;

        assert!(h.coordinator.discard("cap-1").await.unwrap());
        assert_eq!(upload.await.unwrap().unwrap(), UploadResolution::Ignored);

        assert!(h.index.get("cap-1").unwrap().is_none());
        assert!(!h.blobs.contains("cap-1"));
        assert!(!h.coordinator.discard("cap-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_discard_cancels_claim_made_while_waiting_for_lock() {
        let h = harness(ScriptedTransport::hanging());
        h.queue("cap-1").await;

        // Hold the capture lock so the upload claims only after discard has
        // already looked for a running transfer
        let guard = h.coordinator.inner.locks.lock("cap-1").await;
        let upload = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.upload_now("cap-1").await })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let discard = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.discard("cap-1").await })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        drop(guard);

        assert!(discard.await.unwrap().unwrap());
        let resolution = tokio::time::timeout(StdDuration::from_secs(2), upload)
            .await
            .expect("upload left running after discard")
            .unwrap()
            .unwrap();
        assert_eq!(resolution, UploadResolution::Ignored);

        assert_eq!(h.transport.calls(), 1);
        assert!(h.coordinator.in_flight().is_empty());
        assert!(h.index.get("cap-1").unwrap().is_none());
        assert!(!h.blobs.contains("cap-1"));
    }

    #[tokio::test]
    async fn test_manual_retry_resets_budget() {
        let h = harness(
            ScriptedTransport::accepting().then(Err(UploadError::Permanent("HTTP 403".into()))),
        );
        h.queue("cap-1").await;

        h.coordinator.process_due().await.unwrap();
        assert_eq!(h.status("cap-1"), Some(CaptureStatus::PermanentlyFailed));

        let entry = h.coordinator.retry("cap-1").await.unwrap();
        assert_eq!(entry.status, CaptureStatus::Pending);
        assert_eq!(entry.attempts, 0);

        let results = h.coordinator.process_due().await.unwrap();
        assert_eq!(results[0].1, UploadResolution::Completed);

        assert!(matches!(
            h.coordinator.retry("cap-1").await,
            Err(CaptureError::Storage(StorageError::CaptureNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_worker_uploads_and_shuts_down() {
        let h = harness(ScriptedTransport::accepting());
        h.coordinator.start().unwrap();
        h.coordinator.start().unwrap();

        h.queue("cap-1").await;
        h.coordinator.notify();

        let index = Arc::clone(&h.index);
        eventually(|| {
            let index = Arc::clone(&index);
            async move { index.count().unwrap() == 0 }
        })
        .await;

        h.coordinator.shutdown().await;
        assert!(h.coordinator.is_shutting_down());
        assert!(matches!(
            h.coordinator.process_due().await,
            Err(CaptureError::ShuttingDown)
        ));
        assert!(matches!(h.coordinator.start(), Err(CaptureError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_worker_is_not_blocked_by_a_slow_upload() {
        let h = harness(ScriptedTransport::hanging_on("slow"));
        h.queue("slow").await;
        h.coordinator.start().unwrap();

        let transport = Arc::clone(&h.transport);
        eventually(|| {
            let transport = Arc::clone(&transport);
            async move { transport.calls() == 1 }
        })
        .await;

        // A free permit must be used while the slow transfer is still running
        h.queue("fast").await;
        h.coordinator.notify();

        let index = Arc::clone(&h.index);
        eventually(|| {
            let index = Arc::clone(&index);
            async move { index.get("fast").unwrap().is_none() }
        })
        .await;
        assert_eq!(h.status("slow"), Some(CaptureStatus::Uploading));
        assert_eq!(h.coordinator.in_flight(), vec!["slow".to_string()]);

        h.coordinator.shutdown().await;
        assert_eq!(h.status("slow"), Some(CaptureStatus::Failed));
    }

    #[tokio::test]
    async fn test_shutdown_leaves_no_upload_dangling() {
        let h = harness(ScriptedTransport::hanging());
        h.queue("cap-1").await;
        h.queue("cap-2").await;
        h.coordinator.start().unwrap();

        let transport = Arc::clone(&h.transport);
        eventually(|| {
            let transport = Arc::clone(&transport);
            async move { transport.calls() == 2 }
        })
        .await;

        h.coordinator.shutdown().await;
        assert!(h.index.list_by_status(CaptureStatus::Uploading).unwrap().is_empty());
        assert_eq!(h.status("cap-1"), Some(CaptureStatus::Failed));
        assert_eq!(h.status("cap-2"), Some(CaptureStatus::Failed));
    }
}
