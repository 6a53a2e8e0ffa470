//! Behavioral tests for the nonce security layer.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::SecurityConfig;
use crate::envelope::SecuredEnvelope;
use crate::error::SecurityError;
use crate::security::{ChunkAuthenticator, NonceSecurityLayer};
use crate::store::{MemoryRecordStore, RecordStore};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

const PSK: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

fn config() -> SecurityConfig {
    SecurityConfig {
        psk: PSK.into(),
        ..SecurityConfig::default()
    }
}

fn layer() -> NonceSecurityLayer<MemoryRecordStore, fn() -> u64> {
    let mut layer = NonceSecurityLayer::new(config(), MemoryRecordStore::new(), (|| 0) as fn() -> u64);
    layer.begin().unwrap();
    layer
}

/// Build an envelope the way the peer would: base64 payload, HMAC over
/// nonce | timestamp | flag | payload.
fn peer_envelope(nonce: u32, plain: &str) -> String {
    let mut envelope = SecuredEnvelope {
        nonce,
        timestamp: 42,
        encrypted: false,
        payload: BASE64.encode(plain.as_bytes()),
        mac: String::new(),
    };
    let key = hex::decode(PSK).unwrap();
    let mut mac = Hmac::<Sha256>::new_from_slice(&key).unwrap();
    mac.update(envelope.mac_input().as_bytes());
    envelope.mac = hex::encode(mac.finalize().into_bytes());
    envelope.to_json()
}

#[test]
fn secure_then_verify_round_trip() {
    let mut sender = layer();
    let mut receiver = layer();

    let plain = r#"{"command":"set_interval","value":30}"#;
    let envelope = sender.secure_message(plain).unwrap();
    let wire = sender.generate_envelope(&envelope);

    assert_eq!(receiver.verify_message(&wire).unwrap(), plain);
}

#[test]
fn round_trip_with_aes_cipher() {
    let make = || {
        let cfg = SecurityConfig {
            encryption_enabled: true,
            use_real_encryption: true,
            ..config()
        };
        let mut l = NonceSecurityLayer::new(cfg, MemoryRecordStore::new(), || 0);
        l.begin().unwrap();
        l
    };
    let mut sender = make();
    let mut receiver = make();

    let plain = r#"{"sample":[1,2,3]}"#;
    let envelope = sender.secure_message(plain).unwrap();
    assert!(envelope.encrypted);
    // Ciphertext, not the plain base64 encoding.
    assert_ne!(envelope.payload, BASE64.encode(plain.as_bytes()));

    assert_eq!(receiver.verify_message(&envelope.to_json()).unwrap(), plain);
}

#[test]
fn random_payloads_round_trip() {
    use rand::distributions::{Alphanumeric, DistString};

    let mut sender = layer();
    let mut receiver = layer();
    let mut rng = rand::thread_rng();

    for _ in 0..20 {
        let plain = Alphanumeric.sample_string(&mut rng, 64);
        let envelope = sender.secure_message(&plain).unwrap();
        assert_eq!(receiver.verify_message(&envelope.to_json()).unwrap(), plain);
    }
}

#[test]
fn replay_yields_success_then_replay_detected() {
    let mut receiver = layer();
    let wire = peer_envelope(5, "hello");

    assert!(receiver.verify_message(&wire).is_ok());
    assert_eq!(
        receiver.verify_message(&wire).unwrap_err(),
        SecurityError::ReplayDetected(5)
    );
}

#[test]
fn nonces_are_sequential() {
    let mut sender = layer();
    let first = sender.secure_message("a").unwrap().nonce;
    for offset in 1..8u32 {
        let nonce = sender.secure_message("a").unwrap().nonce;
        assert_eq!(nonce, first + offset);
    }
}

#[test]
fn first_sync_accepts_up_to_1000() {
    let mut receiver = layer();
    assert!(receiver.verify_message(&peer_envelope(1000, "sync")).is_ok());

    let mut fresh = layer();
    assert!(matches!(
        fresh.verify_message(&peer_envelope(1001, "sync")),
        Err(SecurityError::NonceTooOld { nonce: 1001, .. })
    ));
}

#[test]
fn first_sync_acceptance_happens_once() {
    let mut receiver = layer();
    assert!(receiver.verify_message(&peer_envelope(900, "sync")).is_ok());
    // Window now anchors at 900; a low nonce is no longer let through.
    assert!(matches!(
        receiver.verify_message(&peer_envelope(3, "late")),
        Err(SecurityError::NonceTooOld { .. })
    ));
}

#[test]
fn nonce_zero_is_never_accepted() {
    let mut receiver = layer();
    assert!(matches!(
        receiver.verify_message(&peer_envelope(0, "x")),
        Err(SecurityError::NonceTooOld { .. })
    ));
}

#[test]
fn nonce_beyond_window_is_rejected() {
    let mut receiver = layer();
    receiver.verify_message(&peer_envelope(10, "anchor")).unwrap();

    // Window is 100: 110 is the last acceptable value.
    assert!(receiver.verify_message(&peer_envelope(110, "edge")).is_ok());
    assert!(matches!(
        receiver.verify_message(&peer_envelope(211, "far")),
        Err(SecurityError::NonceTooOld { .. })
    ));
}

#[test]
fn stale_nonce_is_rejected() {
    let mut receiver = layer();
    receiver.verify_message(&peer_envelope(50, "anchor")).unwrap();
    assert!(matches!(
        receiver.verify_message(&peer_envelope(49, "old")),
        Err(SecurityError::NonceTooOld { nonce: 49, last_received: 50 })
    ));
}

#[test]
fn tampered_payload_fails_mac_and_leaves_window_untouched() {
    let mut receiver = layer();
    let wire = peer_envelope(7, "genuine");
    let tampered = wire.replace(
        &BASE64.encode("genuine".as_bytes()),
        &BASE64.encode("forgery".as_bytes()),
    );
    assert_ne!(wire, tampered);

    assert_eq!(
        receiver.verify_message(&tampered).unwrap_err(),
        SecurityError::InvalidMac
    );
    // The rejected nonce was not recorded; the genuine message still lands.
    assert!(receiver.verify_message(&wire).is_ok());
}

#[test]
fn malformed_envelope_is_invalid_format() {
    let mut receiver = layer();
    assert!(matches!(
        receiver.verify_message("not json"),
        Err(SecurityError::InvalidFormat(_))
    ));
    assert!(matches!(
        receiver.verify_message(r#"{"payload":"aGk=","mac":"00"}"#),
        Err(SecurityError::InvalidFormat(_))
    ));
}

#[test]
fn counter_persists_every_tenth_issuance() {
    let mut sender = layer();
    for _ in 0..12 {
        sender.secure_message("x").unwrap();
    }
    // A fresh store recovers to nonce 51; issuances run 51..=62 and the save
    // fires at nonce 60, leaving current_nonce = 61 on flash. The last two
    // issuances are the tolerated re-issue window after an unclean restart.
    let snapshot = sender.store().read("security/nonce").unwrap().unwrap();
    let state = crate::nonce::NonceState::decode(&snapshot).unwrap();
    assert_eq!(state.current_nonce, 61);
}

#[test]
fn recovery_estimates_forward_nonce_and_resets_inbound() {
    let mut store = MemoryRecordStore::new();
    // Corrupt record: wrong version byte.
    let mut record = crate::nonce::NonceState::default().encode();
    record[0] = 9;
    store.write("security/nonce", &record).unwrap();

    // Ten minutes of uptime: ~21 estimated issuances, +50 safety buffer.
    let mut recovered = NonceSecurityLayer::new(config(), store, || 600_000);
    recovered.begin().unwrap();

    let envelope = recovered.secure_message("post-recovery").unwrap();
    assert_eq!(envelope.nonce, 71);
    assert_eq!(recovered.nonce_state().last_received_nonce, 0);
    assert!(recovered.nonce_state().recent_nonces.is_empty());
}

#[test]
fn recovery_with_no_uptime_still_buffers_forward() {
    let mut fresh = NonceSecurityLayer::new(config(), MemoryRecordStore::new(), || 0);
    // No record at all: defaults would restart at 1 and replay old nonces.
    fresh.begin().unwrap();
    assert_eq!(fresh.secure_message("x").unwrap().nonce, 51);
}

#[test]
fn malformed_psk_is_a_key_error() {
    let mut short = NonceSecurityLayer::new(
        SecurityConfig {
            psk: "abcd".into(),
            ..SecurityConfig::default()
        },
        MemoryRecordStore::new(),
        || 0,
    );
    assert!(matches!(short.begin(), Err(SecurityError::KeyError(_))));
    assert!(matches!(
        short.secure_message("x"),
        Err(SecurityError::KeyError(_))
    ));
}

#[test]
fn update_psk_validates_length_and_hex() {
    let mut l = layer();
    assert!(l.update_psk("tooshort").is_err());
    assert!(l
        .update_psk("zzzz6789abcdef0123456789abcdef0123456789abcdef0123456789abcdef01")
        .is_err());
    assert!(l
        .update_psk("ffff6789abcdef0123456789abcdef0123456789abcdef0123456789abcdef01")
        .is_ok());
}

#[test]
fn stats_track_rejections() {
    let mut receiver = layer();
    let wire = peer_envelope(4, "m");
    receiver.verify_message(&wire).unwrap();
    let _ = receiver.verify_message(&wire); // replay
    let _ = receiver.verify_message(r#"{"nonce":6,"payload":"aGk=","mac":"00ff"}"#); // bad mac

    let stats = receiver.stats();
    assert_eq!(stats["messages_verified"], 1);
    assert_eq!(stats["replay_attempts"], 1);
    assert_eq!(stats["mac_failures"], 1);

    receiver.reset_stats();
    assert_eq!(receiver.stats()["replay_attempts"], 0);
}

#[test]
fn chunk_authenticator_checks_raw_bytes() {
    let l = layer();
    let data = b"\x00\x01\x02firmware-bytes";

    let key = hex::decode(PSK).unwrap();
    let mut mac = Hmac::<Sha256>::new_from_slice(&key).unwrap();
    mac.update(data);
    let tag = hex::encode(mac.finalize().into_bytes());

    assert!(l.verify_chunk(data, &tag));
    assert!(!l.verify_chunk(b"different bytes", &tag));
    assert!(!l.verify_chunk(data, "not-hex"));
}
