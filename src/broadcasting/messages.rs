//! Server → viewer message kinds.

use serde::{Deserialize, Serialize};

use crate::motion::WebClip;

/// Progress states carried by a `status` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Info,
    Generating,
    Done,
    Error,
}

/// A message fanned out to every connected viewer.
///
/// Serialized as `{"type": "status", ...}` or `{"type": "motion", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ViewerMessage {
    Status {
        state: StatusState,
        message: String,
    },
    Motion {
        name: String,
        clip: WebClip,
        /// Library identifier of the persisted clip, for "save as".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
}

impl ViewerMessage {
    pub fn status(state: StatusState, message: impl Into<String>) -> Self {
        Self::Status {
            state,
            message: message.into(),
        }
    }

    pub fn motion(name: impl Into<String>, clip: WebClip, source: Option<String>) -> Self {
        Self::Motion {
            name: name.into(),
            clip,
            source,
        }
    }
}
