//! Length-prefixed codec for [`Frame`]s
//!
//! Encoding reuses a thread-local scratch buffer so steady-state writes do
//! not allocate per frame.

use crate::constants::MAX_FRAME_SIZE;
use crate::frame::Frame;
use bytes::{Buf, BufMut, BytesMut};
use std::cell::RefCell;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

thread_local! {
    static ENCODE_BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

const INITIAL_ENCODE_BUFFER_CAPACITY: usize = 8192;
const LENGTH_PREFIX: usize = 4;

/// Tunnel protocol codec
///
/// Frame format:
/// ```text
/// ┌─────────────┬──────────────┐
/// │ Length (u32)│ Frame Data   │
/// │ 4 bytes     │ N bytes      │
/// └─────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TunnelCodec {
    max_frame_size: usize,
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE as usize,
        }
    }
}

impl TunnelCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn too_large(&self, frame_length: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Frame too large: {frame_length} bytes (max: {})",
                self.max_frame_size
            ),
        )
    }
}

impl Decoder for TunnelCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Peek the prefix; only consume once the whole frame is buffered
        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let frame_length = u32::from_be_bytes(length_bytes) as usize;

        if frame_length > self.max_frame_size {
            return Err(self.too_large(frame_length));
        }

        if src.len() < LENGTH_PREFIX + frame_length {
            src.reserve(LENGTH_PREFIX + frame_length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let frame_bytes = src.split_to(frame_length).freeze();

        let frame = Frame::from_slice(&frame_bytes).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Decode error: {e}"))
        })?;

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for TunnelCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        ENCODE_BUFFER.with(|buf| {
            let mut buf = buf.borrow_mut();

            if buf.capacity() == 0 {
                buf.reserve(INITIAL_ENCODE_BUFFER_CAPACITY);
            }
            buf.clear();

            bincode_next::serde::encode_into_std_write(
                &frame,
                &mut *buf,
                bincode_next::config::standard(),
            )
            .map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("Encode error: {e}"))
            })?;

            let frame_length = buf.len();
            if frame_length > self.max_frame_size {
                return Err(self.too_large(frame_length));
            }
            let prefix = u32::try_from(frame_length).map_err(|_| self.too_large(frame_length))?;

            dst.reserve(LENGTH_PREFIX + frame_length);
            dst.put_u32(prefix);
            dst.put_slice(&buf);

            Ok(())
        })
    }
}
