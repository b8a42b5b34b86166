//! JSON message envelope exchanged between pipeline stages.

use serde::{Deserialize, Serialize};

use super::{BusError, Result};

/// Content type of every published envelope.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A file produced by one stage and consumed by the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub event_id: String,
    pub file_path: String,
}

impl FileEvent {
    pub fn new(event_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            file_path: file_path.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| BusError::Encode {
            event_id: self.event_id.clone(),
            source,
        })
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}
