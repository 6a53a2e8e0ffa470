//! Cloud transport seam.
//!
//! The real device talks to the backend over HTTP with bounded timeouts; this
//! crate only sees request/response JSON. Calls are synchronous and run to
//! completion within one scheduler tick.

use std::collections::VecDeque;

use serde_json::Value;

use crate::error::TransportError;

/// Request/response channel to the cloud backend.
pub trait CloudTransport {
    /// Fetch the firmware manifest document. An empty or manifest-less
    /// response means "no update available", not an error.
    fn fetch_manifest(&mut self) -> Result<Value, TransportError>;

    /// Fetch one firmware chunk by index.
    fn fetch_chunk(&mut self, chunk_number: u32) -> Result<Value, TransportError>;

    /// Post a status/progress document.
    fn post_status(&mut self, body: &Value) -> Result<(), TransportError>;
}

/// Scripted transport double: queued manifest and chunk responses plus a log
/// of every status post, in the style of an in-memory loopback transport.
#[derive(Default)]
pub struct ScriptedCloud {
    pub manifest_responses: VecDeque<Result<Value, TransportError>>,
    pub chunk_responses: VecDeque<Result<Value, TransportError>>,
    pub status_posts: Vec<Value>,
    pub chunk_requests: Vec<u32>,
}

impl ScriptedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_manifest(&mut self, response: Value) {
        self.manifest_responses.push_back(Ok(response));
    }

    pub fn push_chunk(&mut self, response: Value) {
        self.chunk_responses.push_back(Ok(response));
    }

    pub fn push_chunk_error(&mut self, error: TransportError) {
        self.chunk_responses.push_back(Err(error));
    }
}

impl CloudTransport for ScriptedCloud {
    fn fetch_manifest(&mut self) -> Result<Value, TransportError> {
        self.manifest_responses
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::RequestFailed("no scripted manifest".into())))
    }

    fn fetch_chunk(&mut self, chunk_number: u32) -> Result<Value, TransportError> {
        self.chunk_requests.push(chunk_number);
        self.chunk_responses
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::RequestFailed("no scripted chunk".into())))
    }

    fn post_status(&mut self, body: &Value) -> Result<(), TransportError> {
        self.status_posts.push(body.clone());
        Ok(())
    }
}
