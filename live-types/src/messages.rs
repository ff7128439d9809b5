//! Wire frames exchanged over a livedata connection.
//!
//! Frames are JSON objects discriminated by a `msg` field, e.g.
//! `{"msg":"ping","id":"1"}`. Document ids travel in their stringified form.

use serde::{Deserialize, Serialize};

use crate::{Document, TypesError};

/// All frames the liveness and publication layers exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum Frame {
    /// Liveness probe.
    Ping {
        /// Optional correlation id echoed by the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Answer to a ping.
    Pong {
        /// Correlation id copied from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// A document entered a subscription's result set.
    Added {
        /// Collection name.
        collection: String,
        /// Stringified document id.
        id: String,
        /// Document fields.
        fields: Document,
    },
    /// A document in the result set changed. Removed fields are `null`.
    Changed {
        /// Collection name.
        collection: String,
        /// Stringified document id.
        id: String,
        /// Changed fields only.
        fields: Document,
    },
    /// A document left the result set.
    Removed {
        /// Collection name.
        collection: String,
        /// Stringified document id.
        id: String,
    },
    /// All writes of the listed method calls are visible to this client.
    Updated {
        /// Method call ids.
        methods: Vec<String>,
    },
}

impl Frame {
    /// Encode as a JSON string.
    pub fn to_json(&self) -> Result<String, TypesError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON string.
    pub fn from_json(text: &str) -> Result<Self, TypesError> {
        Ok(serde_json::from_str(text)?)
    }

    /// True for ping and pong frames.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Ping { .. } | Frame::Pong { .. })
    }
}
