//! Wire form of change events on the notification channel.
//!
//! A frame is one JSON object: `{"v":1,"type":"user.created",...event}`.
//! Postgres rejects NOTIFY payloads of 8000 bytes or more, so larger frames
//! are refused before they are sent.

use relay_common::{ChangeEvent, ChangeOp, PropagationError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FRAME_VERSION: u32 = 1;
pub const MAX_FRAME_BYTES: usize = 7_999;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is {len} bytes, limit is {max}")]
    Oversized { len: usize, max: usize },

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u32),

    #[error("frame type {found} does not match op {op}")]
    TypeMismatch { found: String, op: ChangeOp },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<FrameError> for PropagationError {
    fn from(err: FrameError) -> Self {
        PropagationError::non_retryable(err.to_string())
    }
}

#[derive(Serialize)]
struct OutFrame<'a> {
    v: u32,
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    event: &'a ChangeEvent,
}

#[derive(Deserialize)]
struct InFrame {
    v: u32,
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    event: ChangeEvent,
}

fn frame_type(op: ChangeOp) -> String {
    format!("user.{op}")
}

pub fn encode(event: &ChangeEvent) -> Result<String, FrameError> {
    let text = serde_json::to_string(&OutFrame {
        v: FRAME_VERSION,
        kind: frame_type(event.op),
        event,
    })?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::Oversized {
            len: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(text)
}

pub fn decode(text: &str) -> Result<ChangeEvent, FrameError> {
    let frame: InFrame = serde_json::from_str(text)?;
    if frame.v != FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion(frame.v));
    }
    if frame.kind != frame_type(frame.event.op) {
        return Err(FrameError::TypeMismatch {
            found: frame.kind,
            op: frame.event.op,
        });
    }
    Ok(frame.event)
}
