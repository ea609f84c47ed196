//! `portmesh` wire protocol
//!
//! Two layers live here. [`Frame`] is the envelope exchanged between a
//! tunnel agent and a forward server. The [`wire`] module holds the
//! RFC 4254 payloads carried inside global requests and channel opens, so
//! they stay byte-compatible with standard SSH implementations.

pub mod codec;
pub mod constants;
pub mod frame;
pub mod validation;
pub mod wire;

pub use codec::TunnelCodec;
pub use frame::{ChannelOpenFrame, Frame, GlobalRequestFrame, HandshakeFrame, HandshakeStatus};
pub use wire::{DirectForward, TcpipForward, WireError};
