//! Device platform seam: firmware slots, restart, uptime.
//!
//! The update manager drives staged writes into the inactive firmware slot
//! through this trait. On real hardware `restart()` never returns; the mock
//! records the request so tests can observe it.

use crate::error::UpdateError;

/// Boot target chosen during rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSlot {
    /// Dedicated factory-equivalent image.
    Factory,
    /// The previously running image.
    PreviousImage,
}

/// Platform operations the update pipeline depends on.
pub trait DevicePlatform {
    /// Milliseconds since boot. Also the timestamp source for envelopes.
    fn uptime_ms(&self) -> u64;

    /// Version string of the running firmware image.
    fn current_version(&self) -> String;

    /// Open the inactive slot for a staged write. `expected_size` is advisory;
    /// the platform may size the staging region itself.
    fn begin_staged_write(&mut self, expected_size: Option<u32>) -> Result<(), UpdateError>;

    /// Append bytes to the staged slot.
    fn write_staged(&mut self, data: &[u8]) -> Result<(), UpdateError>;

    /// Finalize the staged image and mark it as the next boot target.
    /// The platform performs its own container checks here.
    fn finalize_staged(&mut self) -> Result<(), UpdateError>;

    /// Abort an open staged write, discarding anything written.
    fn abort_staged(&mut self);

    /// True while a staged write is open.
    fn staging_active(&self) -> bool;

    /// Point the next boot at a known-good image: the factory slot when one
    /// exists, otherwise the previously running image. Errors when neither is
    /// available, which leaves the device with no safe recovery.
    fn boot_fallback(&mut self) -> Result<FallbackSlot, UpdateError>;

    /// Restart the device. Does not return on real hardware.
    fn restart(&mut self);
}

/// In-memory platform double for tests and host-side simulation.
pub struct MockPlatform {
    pub uptime_ms: u64,
    pub version: String,
    pub staged: Vec<u8>,
    pub staging_open: bool,
    pub finalized: bool,
    pub has_factory_slot: bool,
    pub has_previous_slot: bool,
    pub boot_target: Option<FallbackSlot>,
    pub restarts: u32,
    pub fail_finalize: bool,
}

impl MockPlatform {
    pub fn new(version: &str) -> Self {
        Self {
            uptime_ms: 0,
            version: version.to_string(),
            staged: Vec::new(),
            staging_open: false,
            finalized: false,
            has_factory_slot: true,
            has_previous_slot: true,
            boot_target: None,
            restarts: 0,
            fail_finalize: false,
        }
    }

    pub fn advance(&mut self, ms: u64) {
        self.uptime_ms += ms;
    }
}

impl DevicePlatform for MockPlatform {
    fn uptime_ms(&self) -> u64 {
        self.uptime_ms
    }

    fn current_version(&self) -> String {
        self.version.clone()
    }

    fn begin_staged_write(&mut self, _expected_size: Option<u32>) -> Result<(), UpdateError> {
        self.staged.clear();
        self.staging_open = true;
        self.finalized = false;
        Ok(())
    }

    fn write_staged(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        if !self.staging_open {
            return Err(UpdateError::Platform("staged write not open".into()));
        }
        self.staged.extend_from_slice(data);
        Ok(())
    }

    fn finalize_staged(&mut self) -> Result<(), UpdateError> {
        if !self.staging_open {
            return Err(UpdateError::Platform("staged write not open".into()));
        }
        if self.fail_finalize {
            return Err(UpdateError::Platform("image container check failed".into()));
        }
        self.staging_open = false;
        self.finalized = true;
        Ok(())
    }

    fn abort_staged(&mut self) {
        self.staging_open = false;
        self.staged.clear();
    }

    fn staging_active(&self) -> bool {
        self.staging_open
    }

    fn boot_fallback(&mut self) -> Result<FallbackSlot, UpdateError> {
        let slot = if self.has_factory_slot {
            FallbackSlot::Factory
        } else if self.has_previous_slot {
            FallbackSlot::PreviousImage
        } else {
            return Err(UpdateError::Platform("no rollback partition available".into()));
        };
        self.boot_target = Some(slot);
        Ok(slot)
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }
}
