//! Protocol frame definitions

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Wire protocol frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    // Control frames
    /// Initial handshake from the dialing side
    Handshake(Box<HandshakeFrame>),

    /// Handshake acknowledgment from the accepting side
    HandshakeAck { status: HandshakeStatus, version: u8 },

    /// Connection-level request (`tcpip-forward`, `cancel-tcpip-forward`)
    GlobalRequest(Box<GlobalRequestFrame>),

    /// Positive reply to a global request
    RequestSuccess { request_id: u32, payload: Bytes },

    /// Negative reply to a global request
    RequestFailure { request_id: u32 },

    // Channel frames
    /// Open a new data channel
    ChannelOpen(Box<ChannelOpenFrame>),

    Data { channel_id: u32, data: Bytes },

    /// Sender finished writing on a channel
    ChannelClose { channel_id: u32 },

    // Keepalive
    /// Heartbeat ping
    Heartbeat { timestamp: u64 },

    /// Heartbeat acknowledgment
    HeartbeatAck { timestamp: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeFrame {
    pub version: u8,
    /// Principal the dialer authenticates as (`lhost.lport` or `lhost`)
    pub principal: String,
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalRequestFrame {
    pub request_id: u32,
    pub name: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelOpenFrame {
    pub channel_id: u32,
    pub channel_type: String,
    pub payload: Bytes,
}

/// Handshake status codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HandshakeStatus {
    Success,
    InvalidCredentials,
    UnknownPrincipal,
    VersionMismatch,
}

impl Frame {
    /// Serialize the frame body (without length prefix)
    pub fn to_vec(&self) -> Result<Vec<u8>, bincode_next::error::EncodeError> {
        bincode_next::serde::encode_to_vec(self, bincode_next::config::standard())
    }

    /// Deserialize a frame body (without length prefix)
    pub fn from_slice(bytes: &[u8]) -> Result<Self, bincode_next::error::DecodeError> {
        bincode_next::serde::decode_from_slice(bytes, bincode_next::config::standard())
            .map(|(frame, _)| frame)
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake(_) => "handshake",
            Frame::HandshakeAck { .. } => "handshake-ack",
            Frame::GlobalRequest(_) => "global-request",
            Frame::RequestSuccess { .. } => "request-success",
            Frame::RequestFailure { .. } => "request-failure",
            Frame::ChannelOpen(_) => "channel-open",
            Frame::Data { .. } => "data",
            Frame::ChannelClose { .. } => "channel-close",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::HeartbeatAck { .. } => "heartbeat-ack",
        }
    }
}
