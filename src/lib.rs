//! Secure update core for remote, unattended field devices.
//!
//! Two cooperating subsystems share a pre-shared-key authentication
//! primitive:
//!
//! - [`security::NonceSecurityLayer`] wraps and verifies control-plane JSON
//!   envelopes with sequential nonces, an anti-replay window, and
//!   HMAC-SHA256 tags;
//! - [`update::FirmwareUpdateManager`] drives the chunked, resumable,
//!   integrity-verified firmware update state machine, guarded by a
//!   persisted boot counter with rollback.
//!
//! Everything runs single-threaded from the device's cooperative control
//! loop; storage, firmware slots, and cloud transport are collaborator
//! traits ([`store::RecordStore`], [`platform::DevicePlatform`],
//! [`transport::CloudTransport`]).

pub mod config;
pub mod envelope;
pub mod error;
pub mod manifest;
pub mod nonce;
pub mod platform;
pub mod security;
pub mod store;
pub mod transport;
pub mod update;
pub mod update_state;

#[cfg(test)]
mod security_tests;

pub use config::{SecurityConfig, UpdateConfig};
pub use error::{SecurityError, TransportError, UpdateError};
pub use security::NonceSecurityLayer;
pub use update::FirmwareUpdateManager;
