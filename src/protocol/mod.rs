//! Wire protocol types.
//!
//! Every frame on a connection is self-describing: a one-byte type tag
//! followed by a variant-specific body. Three payload kinds exist:
//! - `Message`: a chat message addressed to another client
//! - `HeartBeat`: a liveness probe with no body
//! - `Error`: an out-of-band error surfaced to the peer

mod codec;

pub use codec::PayloadCodec;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Frame tag for a chat message.
pub const TAG_MESSAGE: u8 = 1;
/// Frame tag for a heartbeat.
pub const TAG_HEARTBEAT: u8 = 2;
/// Frame tag for an out-of-band error.
pub const TAG_ERROR: u8 = 3;

/// Hard ceiling on the declared body length of a single frame.
pub const MAX_PAYLOAD_SIZE: u32 = 10 << 20;

/// A chat message routed from one chat id to another.
///
/// Field names are the exact wire JSON names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    pub from: String,
    pub to: String,
}

/// Frame headers, carried base64-encoded inside message and error bodies.
///
/// `size` counts the bytes of the base64 body blob, not of the decoded body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHeaders {
    #[serde(rename = "Size")]
    pub size: u32,
    #[serde(rename = "Type")]
    pub tag: u8,
    #[serde(rename = "Encoding")]
    pub encoding: String,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A chat message bound for another client.
    Message(ChatMessage),
    /// Liveness probe; encodes to exactly one byte.
    HeartBeat,
    /// An error delivered to the remote peer.
    Error(String),
}

impl Payload {
    /// The wire tag this payload is framed with.
    pub fn tag(&self) -> u8 {
        match self {
            Payload::Message(_) => TAG_MESSAGE,
            Payload::HeartBeat => TAG_HEARTBEAT,
            Payload::Error(_) => TAG_ERROR,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Message(m) => write!(f, "[{} -> {}] {}", m.from, m.to, m.message),
            Payload::HeartBeat => write!(f, "heartbeat"),
            Payload::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame tag is not one of the known payload types.
    #[error("unknown message type")]
    UnknownType,
    /// The header blob is missing, not base64, or not valid header JSON.
    #[error("empty headers")]
    EmptyHeaders,
    /// The declared body length exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("max payload size exceeded")]
    MaxPayloadSize,
    /// The outer size field disagrees with the size declared in the headers.
    #[error("frame size field disagrees with headers")]
    SizeMismatch,
    #[error("body is not valid base64")]
    BodyEncoding(#[from] base64::DecodeError),
    #[error("body is not valid JSON")]
    BodyJson(#[from] serde_json::Error),
    #[error("error body is not valid UTF-8")]
    BodyUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
