//! RFC 4254 payload encodings
//!
//! `string` is a `uint32` big-endian length followed by that many bytes,
//! `uint32` is four bytes big-endian. Payloads must be consumed exactly.

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("payload truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("port {0} out of range")]
    PortOutOfRange(u32),
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        if self.buf.remaining() < 4 {
            return Err(WireError::Truncated {
                needed: 4 - self.buf.remaining(),
            });
        }
        Ok(self.buf.get_u32())
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        if self.buf.len() < len {
            return Err(WireError::Truncated {
                needed: len - self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        String::from_utf8(head.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn finish(self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.buf.len()))
        }
    }
}

fn put_string(dst: &mut BytesMut, value: &str) {
    #[allow(clippy::cast_possible_truncation)]
    dst.put_u32(value.len() as u32);
    dst.put_slice(value.as_bytes());
}

/// Narrow a wire `uint32` port to a socket port
pub fn port_from_wire(port: u32) -> Result<u16, WireError> {
    u16::try_from(port).map_err(|_| WireError::PortOutOfRange(port))
}

/// `tcpip-forward` / `cancel-tcpip-forward` request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpipForward {
    /// Address to bind; empty means all interfaces
    pub host: String,
    /// Port to bind; 0 asks the responder to pick one
    pub port: u32,
}

impl TcpipForward {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: u32::from(port),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(8 + self.host.len());
        put_string(&mut dst, &self.host);
        dst.put_u32(self.port);
        dst.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let host = r.string()?;
        let port = r.u32()?;
        r.finish()?;
        Ok(Self { host, port })
    }
}

/// `forwarded-tcpip` channel-open body
///
/// `host1:port1` is the forward that accepted the connection,
/// `host2:port2` the originator of that connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectForward {
    pub host1: String,
    pub port1: u32,
    pub host2: String,
    pub port2: u32,
}

impl DirectForward {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(16 + self.host1.len() + self.host2.len());
        put_string(&mut dst, &self.host1);
        dst.put_u32(self.port1);
        put_string(&mut dst, &self.host2);
        dst.put_u32(self.port2);
        dst.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let host1 = r.string()?;
        let port1 = r.u32()?;
        let host2 = r.string()?;
        let port2 = r.u32()?;
        r.finish()?;
        Ok(Self {
            host1,
            port1,
            host2,
            port2,
        })
    }
}

/// Reply body carrying the port a forward is bound to
pub fn encode_port_reply(port: u16) -> Bytes {
    let mut dst = BytesMut::with_capacity(4);
    dst.put_u32(u32::from(port));
    dst.freeze()
}

pub fn decode_port_reply(payload: &[u8]) -> Result<u16, WireError> {
    let mut r = Reader::new(payload);
    let port = r.u32()?;
    r.finish()?;
    port_from_wire(port)
}
