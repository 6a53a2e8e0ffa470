//! Nonce-based message authentication for the control plane.
//!
//! Every JSON message exchanged with the cloud is wrapped in a
//! [`SecuredEnvelope`]: sequential nonce, uptime timestamp, base64 payload
//! (optionally AES-256-CBC encrypted), and an HMAC-SHA256 tag keyed by the
//! pre-shared key. Inbound envelopes pass an exact-duplicate replay check and
//! an ordering window before the MAC is even considered.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use serde_json::json;
use sha2::Sha256;

use crate::config::SecurityConfig;
use crate::envelope::SecuredEnvelope;
use crate::error::SecurityError;
use crate::nonce::NonceState;
use crate::store::RecordStore;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const PSK_LEN: usize = 32;
const NONCE_RECORD_KEY: &str = "security/nonce";
/// Persist the outgoing counter every Nth issuance to bound flash wear.
/// Up to N-1 nonces can be re-issued after an unclean restart; the peer's
/// replay set, not issuance order, is what prevents re-acceptance.
const NONCE_SAVE_INTERVAL: u32 = 10;
/// Highest nonce accepted while `last_received_nonce == 0` (first sync after
/// a state wipe). A trade-off between lockout recovery and replay surface,
/// preserved as-is.
const FIRST_SYNC_MAX_NONCE: u32 = 1000;

/// Counters exposed through [`NonceSecurityLayer::stats`].
#[derive(Debug, Default, Clone)]
struct SecurityStats {
    messages_secured: u32,
    messages_verified: u32,
    replay_attempts: u32,
    mac_failures: u32,
}

/// Secures outgoing and verifies incoming control-plane messages.
///
/// Owns the outgoing nonce counter and the inbound anti-replay window, both
/// persisted through the record store. Exclusive, non-reentrant access from
/// the single control loop is assumed; `&mut self` enforces it.
pub struct NonceSecurityLayer<S, C>
where
    S: RecordStore,
    C: Fn() -> u64,
{
    config: SecurityConfig,
    store: S,
    clock: C,
    state: NonceState,
    stats: SecurityStats,
}

impl<S, C> NonceSecurityLayer<S, C>
where
    S: RecordStore,
    C: Fn() -> u64,
{
    /// `clock` reports device uptime in milliseconds; it feeds envelope
    /// timestamps and the recovery-nonce heuristic.
    pub fn new(config: SecurityConfig, store: S, clock: C) -> Self {
        Self {
            config,
            store,
            clock,
            state: NonceState::default(),
            stats: SecurityStats::default(),
        }
    }

    /// Validate the PSK and load (or recover) the persisted nonce state.
    pub fn begin(&mut self) -> Result<(), SecurityError> {
        self.psk_bytes()?;

        let loaded = self.load_nonce_state();
        if !loaded {
            warn!("security: nonce state missing or corrupt, entering recovery");
            let recovery = self.estimate_recovery_nonce();
            if recovery > self.state.current_nonce {
                self.state.current_nonce = recovery;
                info!("security: applied recovery nonce {recovery}");
            }
            // Force a fresh first sync on the inbound side.
            self.state.last_received_nonce = 0;
            self.state.recent_nonces.clear();
        }

        info!(
            "security: initialized (encryption={}, cipher={}, window={}, nonce={}, last_received={}, source={})",
            self.config.encryption_enabled,
            if self.config.use_real_encryption { "aes-256-cbc" } else { "base64" },
            self.config.nonce_window,
            self.state.current_nonce,
            self.state.last_received_nonce,
            if loaded { "file" } else { "recovery" },
        );

        self.save_nonce_state();
        Ok(())
    }

    /// Persist state on shutdown.
    pub fn end(&mut self) {
        self.save_nonce_state();
    }

    // ---- outgoing ----

    /// Wrap a plain payload in a secured envelope.
    pub fn secure_message(&mut self, plain: &str) -> Result<SecuredEnvelope, SecurityError> {
        let nonce = self.next_nonce();
        let timestamp = (self.clock)() as u32;
        let encrypted = self.config.encryption_enabled;

        let payload = self.encode_payload(plain)?;

        let mut envelope = SecuredEnvelope {
            nonce,
            timestamp,
            encrypted,
            payload,
            mac: String::new(),
        };
        envelope.mac = self.compute_hmac(envelope.mac_input().as_bytes())?;

        self.stats.messages_secured += 1;
        debug!("security: secured message nonce={nonce}");
        Ok(envelope)
    }

    /// Envelope as wire JSON.
    pub fn generate_envelope(&self, envelope: &SecuredEnvelope) -> String {
        envelope.to_json()
    }

    // ---- incoming ----

    /// Verify a secured JSON envelope and return the plain payload.
    pub fn verify_message(&mut self, secured_json: &str) -> Result<String, SecurityError> {
        let envelope = SecuredEnvelope::parse(secured_json)?;

        if let Err(e) = self.check_nonce(envelope.nonce) {
            self.stats.replay_attempts += 1;
            warn!("security: rejected nonce {}: {e}", envelope.nonce);
            return Err(e);
        }

        if !self.verify_hmac(envelope.mac_input().as_bytes(), &envelope.mac)? {
            self.stats.mac_failures += 1;
            warn!("security: HMAC mismatch for nonce {}", envelope.nonce);
            return Err(SecurityError::InvalidMac);
        }

        self.state.record_received(envelope.nonce);

        let plain = self.decode_payload(&envelope)?;
        self.stats.messages_verified += 1;
        debug!("security: verified message nonce={}", envelope.nonce);
        Ok(plain)
    }

    // ---- nonce management ----

    fn next_nonce(&mut self) -> u32 {
        let nonce = self.state.current_nonce;
        self.state.current_nonce += 1;
        if nonce % NONCE_SAVE_INTERVAL == 0 {
            self.save_nonce_state();
        }
        nonce
    }

    /// Anti-replay acceptance check. Exact duplicates are rejected regardless
    /// of configuration; the ordering window applies only under strict
    /// checking.
    fn check_nonce(&self, nonce: u32) -> Result<(), SecurityError> {
        if self.state.has_seen(nonce) {
            return Err(SecurityError::ReplayDetected(nonce));
        }

        if self.config.strict_nonce_checking {
            let last = self.state.last_received_nonce;
            if nonce <= last {
                return Err(SecurityError::NonceTooOld { nonce, last_received: last });
            }
            if last == 0 {
                // First sync after a state wipe: accept any reasonable nonce
                // once so the two sides can resynchronize.
                if nonce > FIRST_SYNC_MAX_NONCE {
                    return Err(SecurityError::NonceTooOld { nonce, last_received: last });
                }
                info!("security: accepting first nonce {nonce} for initial sync");
                return Ok(());
            }
            if nonce > last + self.config.nonce_window {
                return Err(SecurityError::NonceTooOld { nonce, last_received: last });
            }
        }

        Ok(())
    }

    fn load_nonce_state(&mut self) -> bool {
        let record = match self.store.read(NONCE_RECORD_KEY) {
            Ok(Some(data)) => data,
            Ok(None) => return false,
            Err(e) => {
                warn!("security: failed to read nonce record: {e}");
                return false;
            }
        };
        match NonceState::decode(&record) {
            Some(state) => {
                debug!(
                    "security: loaded nonce state current={} last_received={} history={}",
                    state.current_nonce,
                    state.last_received_nonce,
                    state.recent_nonces.len()
                );
                self.state = state;
                true
            }
            None => false,
        }
    }

    fn save_nonce_state(&mut self) {
        if let Err(e) = self.store.write(NONCE_RECORD_KEY, &self.state.encode()) {
            warn!("security: failed to persist nonce state: {e}");
        }
    }

    /// Best-effort guess at a safe outgoing nonce when persisted state is
    /// lost: one estimated issuance per ~30 s of uptime plus a fixed buffer,
    /// never moving backward from the in-memory counter.
    fn estimate_recovery_nonce(&self) -> u32 {
        let mut recovery = self.state.current_nonce;

        let uptime_ms = (self.clock)();
        if uptime_ms > 60_000 {
            let estimated = (uptime_ms / 30_000) as u32 + 1;
            recovery = recovery.max(estimated);
        }

        recovery += 50;

        if self.state.current_nonce > 100 {
            recovery = self.state.current_nonce + 10;
        }

        info!(
            "security: estimated recovery nonce {recovery} (base={})",
            self.state.current_nonce
        );
        recovery
    }

    // ---- cryptographic operations ----

    /// HMAC-SHA256 over `data` keyed by the PSK, as lowercase hex.
    pub fn compute_hmac(&self, data: &[u8]) -> Result<String, SecurityError> {
        let key = self.psk_bytes()?;
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| SecurityError::KeyError(e.to_string()))?;
        mac.update(data);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time HMAC comparison against a hex tag.
    pub fn verify_hmac(&self, data: &[u8], mac_hex: &str) -> Result<bool, SecurityError> {
        let expected = match hex::decode(mac_hex) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        let key = self.psk_bytes()?;
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| SecurityError::KeyError(e.to_string()))?;
        mac.update(data);
        Ok(mac.verify_slice(&expected).is_ok())
    }

    fn encode_payload(&self, plain: &str) -> Result<String, SecurityError> {
        if self.config.encryption_enabled && self.config.use_real_encryption {
            self.encrypt_aes(plain)
        } else {
            // Reversible transport-safe encoding; stands in for the cipher
            // when encryption is disabled or simulated.
            Ok(BASE64.encode(plain.as_bytes()))
        }
    }

    fn decode_payload(&self, envelope: &SecuredEnvelope) -> Result<String, SecurityError> {
        if envelope.encrypted && self.config.use_real_encryption {
            self.decrypt_aes(&envelope.payload)
        } else {
            let decoded = BASE64
                .decode(&envelope.payload)
                .map_err(|e| SecurityError::EncryptionError(format!("base64 decode: {e}")))?;
            String::from_utf8(decoded)
                .map_err(|e| SecurityError::EncryptionError(format!("payload not utf-8: {e}")))
        }
    }

    fn encrypt_aes(&self, plain: &str) -> Result<String, SecurityError> {
        let key = self.psk_bytes()?;
        let iv = &key[..16];
        let cipher = Aes256CbcEnc::new_from_slices(&key, iv)
            .map_err(|e| SecurityError::EncryptionError(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());
        Ok(BASE64.encode(ciphertext))
    }

    fn decrypt_aes(&self, encoded: &str) -> Result<String, SecurityError> {
        let key = self.psk_bytes()?;
        let iv = &key[..16];
        let ciphertext = BASE64
            .decode(encoded)
            .map_err(|e| SecurityError::EncryptionError(format!("base64 decode: {e}")))?;
        let cipher = Aes256CbcDec::new_from_slices(&key, iv)
            .map_err(|e| SecurityError::EncryptionError(e.to_string()))?;
        let plain = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|e| SecurityError::EncryptionError(format!("decrypt: {e}")))?;
        String::from_utf8(plain)
            .map_err(|e| SecurityError::EncryptionError(format!("payload not utf-8: {e}")))
    }

    fn psk_bytes(&self) -> Result<[u8; PSK_LEN], SecurityError> {
        if self.config.psk.len() != PSK_LEN * 2 {
            return Err(SecurityError::KeyError(format!(
                "PSK must be {} hex chars, got {}",
                PSK_LEN * 2,
                self.config.psk.len()
            )));
        }
        let decoded = hex::decode(&self.config.psk)
            .map_err(|e| SecurityError::KeyError(format!("PSK not hex: {e}")))?;
        let mut key = [0u8; PSK_LEN];
        key.copy_from_slice(&decoded);
        Ok(key)
    }

    // ---- configuration ----

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Replace the whole configuration.
    pub fn update_config(&mut self, config: SecurityConfig) {
        self.config = config;
        info!("security: configuration updated");
    }

    /// Replace the PSK; rejects keys of the wrong length or non-hex keys.
    pub fn update_psk(&mut self, new_psk: &str) -> Result<(), SecurityError> {
        if new_psk.len() != PSK_LEN * 2 || hex::decode(new_psk).is_err() {
            return Err(SecurityError::KeyError(format!(
                "PSK must be {} hex chars",
                PSK_LEN * 2
            )));
        }
        self.config.psk = new_psk.to_string();
        info!("security: PSK updated");
        Ok(())
    }

    // ---- diagnostics ----

    pub fn stats(&self) -> serde_json::Value {
        json!({
            "messages_secured": self.stats.messages_secured,
            "messages_verified": self.stats.messages_verified,
            "replay_attempts": self.stats.replay_attempts,
            "mac_failures": self.stats.mac_failures,
            "current_nonce": self.state.current_nonce,
            "last_received_nonce": self.state.last_received_nonce,
            "nonce_history_size": self.state.recent_nonces.len(),
        })
    }

    pub fn reset_stats(&mut self) {
        self.stats = SecurityStats::default();
    }

    #[cfg(test)]
    pub(crate) fn nonce_state(&self) -> &NonceState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }
}

/// Per-chunk authentication seam for the firmware update pipeline.
///
/// Firmware chunks do not travel inside full secured envelopes; only their
/// HMAC tag over the raw bytes is checked, with the same PSK.
pub trait ChunkAuthenticator {
    fn verify_chunk(&self, data: &[u8], mac_hex: &str) -> bool;
}

impl<S, C> ChunkAuthenticator for NonceSecurityLayer<S, C>
where
    S: RecordStore,
    C: Fn() -> u64,
{
    fn verify_chunk(&self, data: &[u8], mac_hex: &str) -> bool {
        self.verify_hmac(data, mac_hex).unwrap_or(false)
    }
}
