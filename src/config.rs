/// Security layer configuration.
///
/// The PSK is carried as a 64-character hex string (32 key bytes) and is
/// validated at `begin()` and at every use that derives key material.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Pre-shared key, 32 bytes as hex.
    pub psk: String,
    /// Encrypt payloads (true) or authenticate only (false).
    pub encryption_enabled: bool,
    /// Use AES-256-CBC (true) or the reversible base64 stand-in (false).
    pub use_real_encryption: bool,
    /// Anti-replay acceptance window above the last received nonce.
    pub nonce_window: u32,
    /// Reject out-of-sequence nonces instead of relying on the replay set alone.
    pub strict_nonce_checking: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            psk: String::new(),
            encryption_enabled: false,
            use_real_encryption: false,
            nonce_window: 100,
            strict_nonce_checking: true,
        }
    }
}

/// Firmware update manager tuning.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Minimum interval between chunk download attempts from the cooperative
    /// loop. Flat; failed chunks wait the same interval as successful ones.
    pub chunk_interval_ms: u64,
    /// Minimum interval between progress reports to the cloud.
    pub report_interval_ms: u64,
    /// Unconfirmed boots tolerated before rollback.
    pub max_boot_attempts: u32,
    /// Persist download state every N chunks to bound flash wear.
    pub state_save_every_chunks: u32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 2_000,
            report_interval_ms: 5_000,
            max_boot_attempts: 3,
            state_save_every_chunks: 5,
        }
    }
}
