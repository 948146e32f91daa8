//! Wire protocol frames.
//!
//! Every message on the wire is one kind-tagged frame. Structured payloads
//! are JSON records; the body kinds carry raw bytes after the tag so large
//! chunks avoid any encoding overhead. Unknown tags decode to an explicit
//! [`Frame::Unknown`] variant rather than being dropped on the floor.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CellError, Result};

/// The role a freshly dialed connection declares in its identity frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// The long-lived control connection.
    Session,
    /// A short-lived per-exchange data connection.
    Channel,
}

/// First frame on every connection, sent by the cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub role: ConnectionRole,
    /// Present only when `role` is [`ConnectionRole::Channel`]: the uuid the
    /// queen assigned to the owning session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Uuid>,
    pub key: String,
}

/// The queen's reply to a successful identity frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub uuid: Uuid,
    pub key: String,
}

/// A mount pattern: which (host, path prefix) traffic this cell serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub path: String,
}

/// Metadata for one inbound HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub host: String,
    pub path: String,
    pub remote_addr: String,
}

/// Status line and headers for an outbound response. Headers default to an
/// empty multimap so a head frame never goes out without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
}

/// Request for the queen to start streaming the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyWant {
    pub max_size: usize,
}

/// The tag byte identifying a frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Identity,
    Accept,
    Mount,
    ChannelNeeded,
    RequestHead,
    RequestBody,
    RequestBodyEnd,
    RequestBodyWant,
    ResponseHead,
    ResponseBody,
    ResponseEnd,
    /// A tag this version of the protocol does not know.
    Unknown(u8),
}

impl FrameKind {
    /// The on-wire tag byte.
    pub const fn tag(self) -> u8 {
        match self {
            FrameKind::Identity => 0x00,
            FrameKind::Accept => 0x01,
            FrameKind::Mount => 0x02,
            FrameKind::ChannelNeeded => 0x03,
            FrameKind::RequestHead => 0x10,
            FrameKind::RequestBody => 0x11,
            FrameKind::RequestBodyEnd => 0x12,
            FrameKind::RequestBodyWant => 0x13,
            FrameKind::ResponseHead => 0x20,
            FrameKind::ResponseBody => 0x21,
            FrameKind::ResponseEnd => 0x22,
            FrameKind::Unknown(tag) => tag,
        }
    }

    pub fn from_tag(tag: u8) -> FrameKind {
        match tag {
            0x00 => FrameKind::Identity,
            0x01 => FrameKind::Accept,
            0x02 => FrameKind::Mount,
            0x03 => FrameKind::ChannelNeeded,
            0x10 => FrameKind::RequestHead,
            0x11 => FrameKind::RequestBody,
            0x12 => FrameKind::RequestBodyEnd,
            0x13 => FrameKind::RequestBodyWant,
            0x20 => FrameKind::ResponseHead,
            0x21 => FrameKind::ResponseBody,
            0x22 => FrameKind::ResponseEnd,
            other => FrameKind::Unknown(other),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Identity => write!(f, "identity"),
            FrameKind::Accept => write!(f, "accept"),
            FrameKind::Mount => write!(f, "mount"),
            FrameKind::ChannelNeeded => write!(f, "channel needed"),
            FrameKind::RequestHead => write!(f, "request head"),
            FrameKind::RequestBody => write!(f, "request body"),
            FrameKind::RequestBodyEnd => write!(f, "request body end"),
            FrameKind::RequestBodyWant => write!(f, "request body want"),
            FrameKind::ResponseHead => write!(f, "response head"),
            FrameKind::ResponseBody => write!(f, "response body"),
            FrameKind::ResponseEnd => write!(f, "response end"),
            FrameKind::Unknown(tag) => write!(f, "unknown (0x{tag:02x})"),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Identity(Identity),
    Accept(Accept),
    Mount(Mount),
    ChannelNeeded,
    RequestHead(RequestHead),
    RequestBody(Bytes),
    /// End of the request body. May carry trailing data.
    RequestBodyEnd(Bytes),
    RequestBodyWant(BodyWant),
    ResponseHead(ResponseHead),
    ResponseBody(Bytes),
    ResponseEnd,
    Unknown { kind: u8, payload: Bytes },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Identity(_) => FrameKind::Identity,
            Frame::Accept(_) => FrameKind::Accept,
            Frame::Mount(_) => FrameKind::Mount,
            Frame::ChannelNeeded => FrameKind::ChannelNeeded,
            Frame::RequestHead(_) => FrameKind::RequestHead,
            Frame::RequestBody(_) => FrameKind::RequestBody,
            Frame::RequestBodyEnd(_) => FrameKind::RequestBodyEnd,
            Frame::RequestBodyWant(_) => FrameKind::RequestBodyWant,
            Frame::ResponseHead(_) => FrameKind::ResponseHead,
            Frame::ResponseBody(_) => FrameKind::ResponseBody,
            Frame::ResponseEnd => FrameKind::ResponseEnd,
            Frame::Unknown { kind, .. } => FrameKind::Unknown(*kind),
        }
    }

    /// Encode into a tag byte and payload blob, ready for the transport.
    pub fn encode(&self) -> Result<(u8, Bytes)> {
        let kind = self.kind();
        let payload = match self {
            Frame::Identity(payload) => to_json(kind, payload)?,
            Frame::Accept(payload) => to_json(kind, payload)?,
            Frame::Mount(payload) => to_json(kind, payload)?,
            Frame::RequestHead(payload) => to_json(kind, payload)?,
            Frame::RequestBodyWant(payload) => to_json(kind, payload)?,
            Frame::ResponseHead(payload) => to_json(kind, payload)?,
            Frame::ChannelNeeded | Frame::ResponseEnd => Bytes::new(),
            Frame::RequestBody(data) | Frame::RequestBodyEnd(data) | Frame::ResponseBody(data) => {
                data.clone()
            }
            Frame::Unknown { payload, .. } => payload.clone(),
        };
        Ok((kind.tag(), payload))
    }

    /// Decode a tag byte plus payload blob read off the transport.
    pub fn decode(tag: u8, payload: Bytes) -> Result<Frame> {
        let kind = FrameKind::from_tag(tag);
        Ok(match kind {
            FrameKind::Identity => Frame::Identity(from_json(kind, &payload)?),
            FrameKind::Accept => Frame::Accept(from_json(kind, &payload)?),
            FrameKind::Mount => Frame::Mount(from_json(kind, &payload)?),
            FrameKind::ChannelNeeded => Frame::ChannelNeeded,
            FrameKind::RequestHead => Frame::RequestHead(from_json(kind, &payload)?),
            FrameKind::RequestBody => Frame::RequestBody(payload),
            FrameKind::RequestBodyEnd => Frame::RequestBodyEnd(payload),
            FrameKind::RequestBodyWant => Frame::RequestBodyWant(from_json(kind, &payload)?),
            FrameKind::ResponseHead => Frame::ResponseHead(from_json(kind, &payload)?),
            FrameKind::ResponseBody => Frame::ResponseBody(payload),
            FrameKind::ResponseEnd => Frame::ResponseEnd,
            FrameKind::Unknown(kind) => Frame::Unknown { kind, payload },
        })
    }
}

fn to_json<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Bytes> {
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(|source| CellError::MalformedFrame { kind, source })
}

fn from_json<T: DeserializeOwned>(kind: FrameKind, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|source| CellError::MalformedFrame { kind, source })
}
