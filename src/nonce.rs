//! Persisted anti-replay nonce state.
//!
//! The record uses an explicit little-endian field order independent of any
//! in-memory layout: version(4) | current_nonce(4) | last_received_nonce(4) |
//! history_count(4) | history_count x nonce(4). A version mismatch or short
//! read invalidates the whole record and sends the caller down the recovery
//! path.

/// Bound on the exact-duplicate detection set.
pub const MAX_NONCE_HISTORY: usize = 100;

const RECORD_VERSION: u32 = 1;

/// Outgoing counter plus inbound replay tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceState {
    /// Next nonce to issue. Monotonic across restarts.
    pub current_nonce: u32,
    /// Highest nonce accepted from the peer.
    pub last_received_nonce: u32,
    /// Bounded FIFO of recently accepted nonces, oldest first.
    pub recent_nonces: Vec<u32>,
}

impl Default for NonceState {
    fn default() -> Self {
        Self {
            current_nonce: 1,
            last_received_nonce: 0,
            recent_nonces: Vec::new(),
        }
    }
}

impl NonceState {
    /// True if `nonce` is in the recent set.
    pub fn has_seen(&self, nonce: u32) -> bool {
        self.recent_nonces.contains(&nonce)
    }

    /// Record an accepted inbound nonce: raise the high-water mark and append
    /// to the history, evicting the oldest entry on overflow.
    pub fn record_received(&mut self, nonce: u32) {
        if nonce > self.last_received_nonce {
            self.last_received_nonce = nonce;
        }
        self.recent_nonces.push(nonce);
        if self.recent_nonces.len() > MAX_NONCE_HISTORY {
            self.recent_nonces.remove(0);
        }
    }

    /// Encode to the versioned binary record.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.recent_nonces.len() * 4);
        out.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        out.extend_from_slice(&self.current_nonce.to_le_bytes());
        out.extend_from_slice(&self.last_received_nonce.to_le_bytes());
        out.extend_from_slice(&(self.recent_nonces.len() as u32).to_le_bytes());
        for nonce in &self.recent_nonces {
            out.extend_from_slice(&nonce.to_le_bytes());
        }
        out
    }

    /// Decode a persisted record. `None` means missing/corrupt/incompatible;
    /// the caller must treat that as state loss, not as defaults.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        let mut fields = data.chunks_exact(4);
        let mut next = || -> Option<u32> {
            fields.next().map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };

        let version = next()?;
        if version != RECORD_VERSION {
            return None;
        }
        let current_nonce = next()?;
        let last_received_nonce = next()?;
        let history_count = next()? as usize;
        if history_count > MAX_NONCE_HISTORY {
            return None;
        }

        let mut recent_nonces = Vec::with_capacity(history_count);
        for _ in 0..history_count {
            recent_nonces.push(next()?);
        }

        Some(Self {
            current_nonce,
            last_received_nonce,
            recent_nonces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut state = NonceState {
            current_nonce: 123,
            last_received_nonce: 45,
            recent_nonces: vec![40, 42, 45],
        };
        let decoded = NonceState::decode(&state.encode()).unwrap();
        assert_eq!(decoded, state);

        state.recent_nonces.clear();
        assert_eq!(NonceState::decode(&state.encode()).unwrap(), state);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut data = NonceState::default().encode();
        data[0] = 2;
        assert!(NonceState::decode(&data).is_none());
    }

    #[test]
    fn rejects_truncated_record() {
        let state = NonceState {
            current_nonce: 9,
            last_received_nonce: 3,
            recent_nonces: vec![1, 2, 3],
        };
        let data = state.encode();
        assert!(NonceState::decode(&data[..12]).is_none());
        // History count says 3 but only 2 entries present.
        assert!(NonceState::decode(&data[..data.len() - 4]).is_none());
    }

    #[test]
    fn rejects_oversized_history_count() {
        let mut data = NonceState::default().encode();
        data[12..16].copy_from_slice(&(MAX_NONCE_HISTORY as u32 + 1).to_le_bytes());
        assert!(NonceState::decode(&data).is_none());
    }

    #[test]
    fn history_is_bounded_fifo() {
        let mut state = NonceState::default();
        for n in 1..=(MAX_NONCE_HISTORY as u32 + 10) {
            state.record_received(n);
        }
        assert_eq!(state.recent_nonces.len(), MAX_NONCE_HISTORY);
        assert_eq!(state.recent_nonces[0], 11);
        assert_eq!(state.last_received_nonce, MAX_NONCE_HISTORY as u32 + 10);
    }
}
