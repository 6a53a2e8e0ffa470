//! Chunked, resumable firmware update pipeline with rollback protection.
//!
//! Driven one step at a time from the device's cooperative control loop:
//! `tick()` downloads at most one chunk per invocation, bounded by a flat
//! minimum interval, and the whole pipeline survives power loss through the
//! persisted progress record, chunk bitmap, and boot counter.
//!
//! Boot guard: while an update is pending confirmation, every startup
//! increments a persisted counter; `max_boot_attempts` unconfirmed boots
//! trigger a rollback to a known-good image.

use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::config::UpdateConfig;
use crate::error::{TransportError, UpdateError};
use crate::manifest::FirmwareManifest;
use crate::platform::DevicePlatform;
use crate::security::ChunkAuthenticator;
use crate::store::RecordStore;
use crate::transport::CloudTransport;
use crate::update_state::{ProgressRecord, UpdateProgress, UpdateState};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

const STATE_RECORD_KEY: &str = "fota/state";
const BOOT_COUNT_KEY: &str = "fota/boot_count";

/// Result of one `process_chunk()` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Not in the downloading state; nothing to do.
    Idle,
    /// One chunk fetched, authenticated, and written to the staged slot.
    Downloaded { index: u32 },
    /// Fetch or tag check failed; the same chunk is retried next tick.
    Deferred { index: u32 },
    /// All chunks present; image finalized and the update applied.
    Applied,
}

/// Drives manifest fetch, chunk download, verification, apply, and rollback.
pub struct FirmwareUpdateManager<S, P, T>
where
    S: RecordStore,
    P: DevicePlatform,
    T: CloudTransport,
{
    config: UpdateConfig,
    store: S,
    platform: P,
    cloud: T,
    manifest: FirmwareManifest,
    progress: UpdateProgress,
    chunks_downloaded: Vec<bool>,
    last_chunk_ms: u64,
    last_report_ms: u64,
}

impl<S, P, T> FirmwareUpdateManager<S, P, T>
where
    S: RecordStore,
    P: DevicePlatform,
    T: CloudTransport,
{
    pub fn new(config: UpdateConfig, store: S, platform: P, cloud: T) -> Self {
        Self {
            config,
            store,
            platform,
            cloud,
            manifest: FirmwareManifest::default(),
            progress: UpdateProgress::default(),
            chunks_downloaded: Vec::new(),
            last_chunk_ms: 0,
            last_report_ms: 0,
        }
    }

    /// Startup: load any persisted update state and run the boot guard.
    ///
    /// Call after [`report_boot_status`](Self::report_boot_status). If a
    /// previous session left an update in progress, the boot counter is
    /// incremented here; reaching `max_boot_attempts` triggers rollback
    /// before the device resumes normal operation.
    pub fn begin(&mut self) -> Result<(), UpdateError> {
        self.progress.current_version = self.platform.current_version();

        if self.load_state() {
            info!(
                "fota: resumed state {} ({}/{} chunks)",
                self.progress.state.name(),
                self.progress.chunks_received,
                self.progress.total_chunks
            );

            if self.progress.state.is_in_progress() {
                let count = self.increment_boot_count();
                warn!("fota: update pending confirmation, boot attempt {count}");
                if count >= self.config.max_boot_attempts {
                    error!("fota: boot count {count} reached limit, rolling back");
                    return self.rollback("boot count exceeded after update");
                }
            }
        }

        info!("fota: running firmware version {}", self.progress.current_version);
        Ok(())
    }

    // ---- boot status ----

    /// Report the boot outcome to the cloud. Must run at the very start of
    /// every boot, before `begin()` resumes any pending update logic.
    ///
    /// A zero boot counter means the prior boot was confirmed good: any
    /// update that reached the reboot stage is marked complete and its
    /// bookkeeping cleared.
    pub fn report_boot_status(&mut self) {
        let count = self.boot_count();

        let body = if count == 0 {
            let version = self.platform.current_version();
            self.clear_boot_count();
            self.confirm_completed_update();
            info!("fota: boot confirmed successful, version {version}");
            json!({"fota_status": {"boot_status": "success", "new_version": version}})
        } else {
            warn!("fota: boot status failed, count={count}");
            let mut status = json!({"boot_status": "failed", "boot_count": count});
            if count >= self.config.max_boot_attempts {
                status["rollback"] = json!(true);
            }
            json!({ "fota_status": status })
        };

        if let Err(e) = self.cloud.post_status(&body) {
            warn!("fota: failed to report boot status: {e}");
        }
    }

    /// If the persisted record shows an update that made it to the reboot
    /// stage, the successful boot confirms it: drop the record.
    fn confirm_completed_update(&mut self) {
        let Ok(Some(data)) = self.store.read(STATE_RECORD_KEY) else {
            return;
        };
        let Ok(record) = serde_json::from_slice::<ProgressRecord>(&data) else {
            return;
        };
        match UpdateState::from_code(record.state) {
            Some(UpdateState::Rebooting) | Some(UpdateState::BootVerification) => {
                info!("fota: update to {} confirmed complete", record.version);
                if let Err(e) = self.store.remove(STATE_RECORD_KEY) {
                    warn!("fota: failed to clear confirmed update state: {e}");
                }
            }
            _ => {}
        }
    }

    // ---- update pipeline ----

    /// Fetch the manifest. Returns true when a different firmware version is
    /// available; same-version manifests are never reapplied.
    pub fn check_for_update(&mut self) -> Result<bool, UpdateError> {
        info!("fota: checking for firmware updates");
        self.set_state(UpdateState::CheckingManifest)?;

        let response = match self.cloud.fetch_manifest() {
            Ok(r) => r,
            Err(e) => {
                warn!("fota: manifest fetch failed: {e}");
                self.set_state(UpdateState::Idle)?;
                return Ok(false);
            }
        };

        let manifest = match FirmwareManifest::from_response(&response) {
            Some(m) if m.valid => m,
            _ => {
                info!("fota: no firmware update available");
                self.set_state(UpdateState::Idle)?;
                return Ok(false);
            }
        };

        if manifest.version == self.progress.current_version {
            info!(
                "fota: manifest version {} matches running firmware, no update",
                manifest.version
            );
            self.set_state(UpdateState::Idle)?;
            return Ok(false);
        }

        info!(
            "fota: new firmware available: {} (current {})",
            manifest.version, self.progress.current_version
        );
        self.progress.new_version = manifest.version.clone();
        self.progress.total_chunks = manifest.total_chunks;
        self.progress.total_bytes = manifest.size;
        self.manifest = manifest;
        self.set_state(UpdateState::Idle)?;
        Ok(true)
    }

    /// Open the staged slot and initialize download tracking.
    pub fn start_download(&mut self) -> Result<(), UpdateError> {
        if !self.manifest.valid {
            error!("fota: cannot start download without a valid manifest");
            return Err(UpdateError::NoManifest);
        }

        info!(
            "fota: starting download of {} ({} bytes, {} chunks)",
            self.manifest.version, self.manifest.size, self.manifest.total_chunks
        );

        self.platform.begin_staged_write(Some(self.manifest.size))?;
        self.set_state(UpdateState::Downloading)?;

        self.chunks_downloaded = vec![false; self.manifest.total_chunks as usize];
        self.progress.chunks_received = 0;
        self.progress.bytes_received = 0;
        self.progress.total_chunks = self.manifest.total_chunks;
        self.progress.total_bytes = self.manifest.size;
        self.progress.verified = false;

        self.save_state();
        Ok(())
    }

    /// Cooperative loop driver: at most one chunk attempt per call, never
    /// more often than `chunk_interval_ms`.
    pub fn tick(&mut self, auth: &impl ChunkAuthenticator) -> Result<ChunkOutcome, UpdateError> {
        if self.progress.state != UpdateState::Downloading {
            return Ok(ChunkOutcome::Idle);
        }

        let now = self.platform.uptime_ms();
        if now.saturating_sub(self.last_chunk_ms) < self.config.chunk_interval_ms {
            return Ok(ChunkOutcome::Idle);
        }
        self.last_chunk_ms = now;

        self.process_chunk(auth)
    }

    /// One download step: fetch the lowest-index missing chunk, or finish the
    /// pipeline when none remain.
    pub fn process_chunk(&mut self, auth: &impl ChunkAuthenticator) -> Result<ChunkOutcome, UpdateError> {
        if self.progress.state != UpdateState::Downloading {
            warn!("fota: process_chunk called outside downloading state");
            return Ok(ChunkOutcome::Idle);
        }

        // A bitmap that disagrees with the chunk count means the persisted
        // state is corrupt. Abort; never silently truncate.
        if self.progress.total_chunks == 0
            || self.chunks_downloaded.len() != self.progress.total_chunks as usize
        {
            let msg = format!(
                "corrupted manifest state: total_chunks={}, bitmap={}",
                self.progress.total_chunks,
                self.chunks_downloaded.len()
            );
            self.fail(&msg);
            return Err(UpdateError::CorruptState(msg));
        }

        let Some(index) = self.chunks_downloaded.iter().position(|&done| !done) else {
            info!("fota: all chunks downloaded, verifying and installing");
            self.verify_firmware()?;
            self.apply_update()?;
            return Ok(ChunkOutcome::Applied);
        };
        let index = index as u32;

        match self.fetch_chunk(index, auth) {
            Ok(size) => {
                self.chunks_downloaded[index as usize] = true;
                self.progress.chunks_received += 1;
                self.progress.bytes_received += size as u32;

                info!(
                    "fota: chunk {} downloaded and verified ({}/{}, {} bytes)",
                    index, self.progress.chunks_received, self.progress.total_chunks, size
                );

                if self.progress.chunks_received % self.config.state_save_every_chunks == 0
                    || self.progress.chunks_received == self.progress.total_chunks
                {
                    self.save_state();
                }

                self.report_progress(false);
                Ok(ChunkOutcome::Downloaded { index })
            }
            // Staged-write faults already moved the machine to Failed.
            Err(e @ UpdateError::Platform(_)) => Err(e),
            Err(e) => {
                // Bit stays clear; the same chunk is retried on the next
                // scheduled tick. No in-call retry loop.
                warn!("fota: chunk {index} rejected, will retry: {e}");
                Ok(ChunkOutcome::Deferred { index })
            }
        }
    }

    /// Fetch and authenticate one chunk, then write it to the staged slot.
    fn fetch_chunk(&mut self, index: u32, auth: &impl ChunkAuthenticator) -> Result<usize, UpdateError> {
        debug!("fota: fetching chunk {}/{}", index + 1, self.progress.total_chunks);

        let response = self.cloud.fetch_chunk(index)?;

        let data_b64 = response
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| bad_chunk("response missing data"))?;
        let mac_hex = response
            .get("mac")
            .and_then(Value::as_str)
            .ok_or_else(|| bad_chunk("response missing mac"))?;
        let echoed = response.get("chunk_number").and_then(Value::as_u64);
        if echoed != Some(u64::from(index)) {
            return Err(bad_chunk(&format!(
                "response echoed {echoed:?}, requested {index}"
            )));
        }

        let data = BASE64
            .decode(data_b64)
            .map_err(|e| bad_chunk(&format!("base64 decode: {e}")))?;

        // Authenticate before accepting a single byte into the slot.
        if !auth.verify_chunk(&data, mac_hex) {
            return Err(bad_chunk(&format!("chunk {index} HMAC verification failed")));
        }

        // A staged-write fault is a platform failure, not a transient fetch
        // problem; retrying the append would corrupt the image.
        if let Err(e) = self.platform.write_staged(&data) {
            let msg = format!("staged write failed: {e}");
            self.fail(&msg);
            return Err(UpdateError::Platform(msg));
        }

        Ok(data.len())
    }

    /// Finalize the staged image and mark it as the next boot target.
    ///
    /// The manifest's full-image SHA-256 is not independently recomputed
    /// here; integrity rests on the per-chunk tags and the platform's own
    /// container checks at finalize.
    pub fn verify_firmware(&mut self) -> Result<(), UpdateError> {
        self.set_state(UpdateState::Verifying)?;
        info!(
            "fota: finalizing staged image ({} chunks, {} bytes)",
            self.progress.chunks_received, self.progress.bytes_received
        );

        if let Err(e) = self.platform.finalize_staged() {
            let msg = format!("finalize failed: {e}");
            self.fail(&msg);
            return Err(UpdateError::Platform(msg));
        }

        self.progress.verified = true;
        self.set_state(UpdateState::Writing)?;
        info!("fota: staged image finalized, boot target set");
        self.report_progress(true);
        Ok(())
    }

    /// Commit the update: clear the boot counter for the new image, persist,
    /// report, and restart. Does not return on real hardware.
    pub fn apply_update(&mut self) -> Result<(), UpdateError> {
        if !self.progress.verified {
            error!("fota: cannot apply unverified firmware");
            return Err(UpdateError::NotVerified);
        }

        self.set_state(UpdateState::Rebooting)?;
        self.clear_boot_count();
        self.save_state();
        self.report_progress(true);

        let body = json!({"fota_status": {
            "boot_status": "pending_reboot",
            "new_version": self.manifest.version,
        }});
        if let Err(e) = self.cloud.post_status(&body) {
            warn!("fota: failed to report pending reboot: {e}");
        }

        info!("fota: update applied, restarting into {}", self.manifest.version);
        self.platform.restart();
        Ok(())
    }

    /// Revert the next boot to a known-good image and wipe all update state.
    /// Does not return on real hardware.
    pub fn rollback(&mut self, reason: &str) -> Result<(), UpdateError> {
        error!("fota: initiating rollback: {reason}");
        self.progress.state = self.progress.state.transition(UpdateState::Rollback)?;
        self.progress.error_message = reason.to_string();
        self.report_progress(true);

        match self.platform.boot_fallback() {
            Ok(slot) => info!("fota: boot target reverted to {slot:?}"),
            Err(e) => {
                // Hard requirement violated: nothing safe to boot into.
                let msg = format!("rollback impossible: {e}");
                self.fail(&msg);
                return Err(UpdateError::Platform(msg));
            }
        }

        self.reset();
        self.clear_boot_count();

        info!("fota: restarting for rollback");
        self.platform.restart();
        Ok(())
    }

    /// Abort any in-flight download and discard all update state. Cannot
    /// interrupt a chunk fetch already handed to the transport.
    pub fn cancel(&mut self) {
        info!("fota: cancelling update");
        if self.platform.staging_active() {
            self.platform.abort_staged();
        }
        self.reset();
    }

    /// Reinitialize to idle: drop manifest, progress, bitmap, and the
    /// persisted record.
    pub fn reset(&mut self) {
        self.progress = UpdateProgress {
            current_version: self.platform.current_version(),
            ..UpdateProgress::default()
        };
        self.manifest = FirmwareManifest::default();
        self.chunks_downloaded.clear();
        if let Err(e) = self.store.remove(STATE_RECORD_KEY) {
            warn!("fota: failed to remove update state: {e}");
        }
    }

    // ---- progress reporting ----

    /// Send a progress document shaped by the current state. Throttled to
    /// `report_interval_ms` unless forced.
    fn report_progress(&mut self, force: bool) {
        let now = self.platform.uptime_ms();
        if !force && now.saturating_sub(self.last_report_ms) < self.config.report_interval_ms {
            return;
        }
        self.last_report_ms = now;

        let mut status = serde_json::Map::new();

        if self.progress.state == UpdateState::Downloading {
            status.insert("chunk_received".into(), json!(self.progress.chunks_received));
            status.insert("total_chunks".into(), json!(self.progress.total_chunks));
            if self.progress.total_chunks > 0
                && self.progress.chunks_received <= self.progress.total_chunks
            {
                let pct = f64::from(self.progress.chunks_received) * 100.0
                    / f64::from(self.progress.total_chunks);
                status.insert("progress".into(), json!(pct));
            }
        }

        if self.progress.state == UpdateState::Verifying || self.progress.verified {
            status.insert("verified".into(), json!(self.progress.verified));
        }

        if self.progress.state == UpdateState::Rollback {
            status.insert("rollback".into(), json!(true));
            status.insert("error".into(), json!(self.progress.error_message));
        }

        if self.progress.state == UpdateState::Failed {
            status.insert("error".into(), json!(self.progress.error_message));
        }

        let body = json!({ "fota_status": Value::Object(status) });
        if let Err(e) = self.cloud.post_status(&body) {
            warn!("fota: failed to report progress: {e}");
        }
    }

    // ---- persisted state ----

    fn save_state(&mut self) {
        let record = ProgressRecord::from_bitmap(
            self.progress.state,
            &self.manifest.version,
            self.progress.chunks_received,
            self.progress.total_chunks,
            self.progress.verified,
            &self.chunks_downloaded,
        );
        match serde_json::to_vec(&record) {
            Ok(data) => {
                if let Err(e) = self.store.write(STATE_RECORD_KEY, &data) {
                    warn!("fota: failed to persist update state: {e}");
                }
            }
            Err(e) => warn!("fota: failed to encode update state: {e}"),
        }
    }

    fn load_state(&mut self) -> bool {
        let data = match self.store.read(STATE_RECORD_KEY) {
            Ok(Some(data)) => data,
            Ok(None) => return false,
            Err(e) => {
                warn!("fota: failed to read update state: {e}");
                return false;
            }
        };
        let record: ProgressRecord = match serde_json::from_slice(&data) {
            Ok(r) => r,
            Err(e) => {
                warn!("fota: persisted update state unparseable: {e}");
                return false;
            }
        };

        self.progress.state = UpdateState::from_code(record.state).unwrap_or(UpdateState::Idle);
        self.progress.chunks_received = record.chunks_received;
        self.progress.total_chunks = record.total_chunks;
        self.progress.verified = record.verified;
        self.progress.new_version = record.version.clone();
        self.chunks_downloaded = record.chunk_bitmap();
        self.manifest.version = record.version;
        true
    }

    // ---- boot guard ----

    /// Persisted boot-attempt counter; plain ASCII integer record.
    pub fn boot_count(&self) -> u32 {
        match self.store.read(BOOT_COUNT_KEY) {
            Ok(Some(data)) => std::str::from_utf8(&data)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0),
            _ => 0,
        }
    }

    fn increment_boot_count(&mut self) -> u32 {
        let count = self.boot_count() + 1;
        if let Err(e) = self.store.write(BOOT_COUNT_KEY, count.to_string().as_bytes()) {
            warn!("fota: failed to persist boot count: {e}");
        }
        count
    }

    fn clear_boot_count(&mut self) {
        if let Err(e) = self.store.remove(BOOT_COUNT_KEY) {
            warn!("fota: failed to clear boot count: {e}");
        }
    }

    // ---- helpers & accessors ----

    fn set_state(&mut self, to: UpdateState) -> Result<(), UpdateError> {
        self.progress.state = self.progress.state.transition(to)?;
        debug!("fota: state -> {}", to.name());
        Ok(())
    }

    /// Unrecoverable failure: record the reason, report it, persist.
    fn fail(&mut self, msg: &str) {
        error!("fota: {msg}");
        if let Ok(next) = self.progress.state.transition(UpdateState::Failed) {
            self.progress.state = next;
        }
        self.progress.error_message = msg.to_string();
        self.report_progress(true);
        self.save_state();
    }

    pub fn state(&self) -> UpdateState {
        self.progress.state
    }

    pub fn progress(&self) -> &UpdateProgress {
        &self.progress
    }

    pub fn manifest(&self) -> &FirmwareManifest {
        &self.manifest
    }

    pub fn chunk_bitmap(&self) -> &[bool] {
        &self.chunks_downloaded
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn cloud(&self) -> &T {
        &self.cloud
    }

    pub fn cloud_mut(&mut self) -> &mut T {
        &mut self.cloud
    }

    /// Tear down, handing the store back (used when the same store backs
    /// several components across a simulated reboot).
    pub fn into_store(self) -> S {
        self.store
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }
}

/// A malformed or unauthenticated chunk response. Retriable: the caller
/// leaves the bitmap bit clear and no counters advance.
fn bad_chunk(msg: &str) -> UpdateError {
    UpdateError::Transport(TransportError::RequestFailed(msg.to_string()))
}
