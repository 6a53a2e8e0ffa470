//! Firmware update state machine and its persisted record.

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Update pipeline states. Forward-only, except that `Failed` and `Rollback`
/// are reachable from any active state on unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    CheckingManifest,
    Downloading,
    Verifying,
    Writing,
    Rebooting,
    BootVerification,
    Rollback,
    Completed,
    Failed,
}

impl UpdateState {
    /// Integer code used in the persisted record and progress reports.
    pub fn code(self) -> u8 {
        match self {
            UpdateState::Idle => 0,
            UpdateState::CheckingManifest => 1,
            UpdateState::Downloading => 2,
            UpdateState::Verifying => 3,
            UpdateState::Writing => 4,
            UpdateState::Rebooting => 5,
            UpdateState::BootVerification => 6,
            UpdateState::Rollback => 7,
            UpdateState::Completed => 8,
            UpdateState::Failed => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(UpdateState::Idle),
            1 => Some(UpdateState::CheckingManifest),
            2 => Some(UpdateState::Downloading),
            3 => Some(UpdateState::Verifying),
            4 => Some(UpdateState::Writing),
            5 => Some(UpdateState::Rebooting),
            6 => Some(UpdateState::BootVerification),
            7 => Some(UpdateState::Rollback),
            8 => Some(UpdateState::Completed),
            9 => Some(UpdateState::Failed),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::CheckingManifest => "checking_manifest",
            UpdateState::Downloading => "downloading",
            UpdateState::Verifying => "verifying",
            UpdateState::Writing => "writing",
            UpdateState::Rebooting => "rebooting",
            UpdateState::BootVerification => "boot_verification",
            UpdateState::Rollback => "rollback",
            UpdateState::Completed => "completed",
            UpdateState::Failed => "failed",
        }
    }

    /// An update is underway: a power loss in one of these states must be
    /// detected at the next boot.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            UpdateState::Downloading
                | UpdateState::Verifying
                | UpdateState::Writing
                | UpdateState::Rebooting
                | UpdateState::BootVerification
        )
    }

    /// Attempt a transition, rejecting anything the pipeline does not allow.
    pub fn transition(self, to: UpdateState) -> Result<UpdateState, UpdateError> {
        use UpdateState::*;
        let allowed = match (self, to) {
            (Idle, CheckingManifest) | (Idle, Downloading) => true,
            (CheckingManifest, Idle) | (CheckingManifest, Downloading) => true,
            (Downloading, Verifying) => true,
            (Verifying, Writing) => true,
            (Writing, Rebooting) => true,
            (Rebooting, BootVerification) | (Rebooting, Completed) => true,
            (BootVerification, Completed) => true,
            // No fallback slot leaves rollback itself unable to complete.
            (Rollback, Failed) => true,
            (from, Failed) | (from, Rollback) => from.is_in_progress() || from == CheckingManifest,
            _ => false,
        };
        if allowed {
            Ok(to)
        } else {
            Err(UpdateError::InvalidTransition {
                from: self.name(),
                to: to.name(),
            })
        }
    }
}

/// Download progress, partially persisted through [`ProgressRecord`].
#[derive(Debug, Clone)]
pub struct UpdateProgress {
    pub state: UpdateState,
    pub chunks_received: u32,
    pub total_chunks: u32,
    pub bytes_received: u32,
    pub total_bytes: u32,
    pub verified: bool,
    pub error_message: String,
    pub current_version: String,
    pub new_version: String,
}

impl Default for UpdateProgress {
    fn default() -> Self {
        Self {
            state: UpdateState::Idle,
            chunks_received: 0,
            total_chunks: 0,
            bytes_received: 0,
            total_bytes: 0,
            verified: false,
            error_message: String::new(),
            current_version: String::new(),
            new_version: String::new(),
        }
    }
}

/// Persisted update state:
/// `{state:<int>, version, chunks_received, total_chunks, verified, chunks:[0|1,...]}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub state: u8,
    pub version: String,
    pub chunks_received: u32,
    pub total_chunks: u32,
    pub verified: bool,
    pub chunks: Vec<u8>,
}

impl ProgressRecord {
    pub fn chunk_bitmap(&self) -> Vec<bool> {
        self.chunks.iter().map(|&c| c != 0).collect()
    }

    pub fn from_bitmap(
        state: UpdateState,
        version: &str,
        chunks_received: u32,
        total_chunks: u32,
        verified: bool,
        bitmap: &[bool],
    ) -> Self {
        Self {
            state: state.code(),
            version: version.to_string(),
            chunks_received,
            total_chunks,
            verified,
            chunks: bitmap.iter().map(|&b| u8::from(b)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0..=9u8 {
            let state = UpdateState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert!(UpdateState::from_code(10).is_none());
    }

    #[test]
    fn forward_path_is_accepted() {
        use UpdateState::*;
        let path = [Idle, Downloading, Verifying, Writing, Rebooting, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].transition(pair[1]).is_ok(), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn backward_and_skip_transitions_are_rejected() {
        use UpdateState::*;
        assert!(Verifying.transition(Downloading).is_err());
        assert!(Idle.transition(Writing).is_err());
        assert!(Completed.transition(Downloading).is_err());
    }

    #[test]
    fn failure_states_reachable_from_active_only() {
        use UpdateState::*;
        assert!(Downloading.transition(Failed).is_ok());
        assert!(Writing.transition(Rollback).is_ok());
        assert!(Rollback.transition(Failed).is_ok());
        assert!(Idle.transition(Rollback).is_err());
        assert!(Completed.transition(Failed).is_err());
    }

    #[test]
    fn progress_record_bitmap_round_trip() {
        let record = ProgressRecord::from_bitmap(
            UpdateState::Downloading,
            "2.0",
            2,
            3,
            false,
            &[true, false, true],
        );
        assert_eq!(record.state, 2);
        assert_eq!(record.chunks, vec![1, 0, 1]);
        assert_eq!(record.chunk_bitmap(), vec![true, false, true]);

        let json = serde_json::to_string(&record).unwrap();
        let parsed: ProgressRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.chunk_bitmap(), vec![true, false, true]);
    }
}
