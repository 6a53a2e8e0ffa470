//! Secured control-plane envelope exchanged with the cloud.

use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

/// One secured message: `{nonce, timestamp, encrypted, payload, mac}`.
///
/// `payload` is base64 text (ciphertext when `encrypted`), `mac` is the hex
/// HMAC-SHA256 tag. Never persisted; built per outgoing message and parsed
/// per incoming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuredEnvelope {
    pub nonce: u32,
    #[serde(default)]
    pub timestamp: u32,
    #[serde(default)]
    pub encrypted: bool,
    pub payload: String,
    pub mac: String,
}

impl SecuredEnvelope {
    /// Parse an incoming envelope. `nonce`, `payload`, and `mac` are required;
    /// `timestamp` and `encrypted` default when absent.
    pub fn parse(json: &str) -> Result<Self, SecurityError> {
        serde_json::from_str(json)
            .map_err(|e| SecurityError::InvalidFormat(format!("envelope parse: {e}")))
    }

    /// Serialize to the wire JSON form.
    pub fn to_json(&self) -> String {
        // Serialization of this struct cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The exact byte string the HMAC covers:
    /// decimal nonce, decimal timestamp, "1"/"0" encrypted flag, payload text.
    pub fn mac_input(&self) -> String {
        let mut input = String::with_capacity(20 + 20 + 1 + self.payload.len());
        input.push_str(&self.nonce.to_string());
        input.push_str(&self.timestamp.to_string());
        input.push(if self.encrypted { '1' } else { '0' });
        input.push_str(&self.payload);
        input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requires_nonce_payload_mac() {
        assert!(SecuredEnvelope::parse(r#"{"payload":"aGk=","mac":"00"}"#).is_err());
        assert!(SecuredEnvelope::parse(r#"{"nonce":1,"mac":"00"}"#).is_err());
        assert!(SecuredEnvelope::parse(r#"{"nonce":1,"payload":"aGk="}"#).is_err());
    }

    #[test]
    fn timestamp_and_encrypted_default_when_absent() {
        let env = SecuredEnvelope::parse(r#"{"nonce":7,"payload":"aGk=","mac":"00"}"#).unwrap();
        assert_eq!(env.timestamp, 0);
        assert!(!env.encrypted);
    }

    #[test]
    fn mac_input_layout() {
        let env = SecuredEnvelope {
            nonce: 42,
            timestamp: 1000,
            encrypted: true,
            payload: "cGF5bG9hZA==".into(),
            mac: String::new(),
        };
        assert_eq!(env.mac_input(), "4210001cGF5bG9hZA==");
    }
}
