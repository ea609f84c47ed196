//! Channel multiplexer
//!
//! Manages the data channels carried by one tunnel connection. Channels
//! opened by the dialing side use odd ids, the accepting side even ids, so
//! both ends allocate without coordination.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kanal::{bounded_async, AsyncReceiver, AsyncSender, SendError};
use portmesh_common::{Result, TunnelError};
use portmesh_protocol::frame::{ChannelOpenFrame, Frame};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANNEL_BUFFER: usize = 64;
const INCOMING_BUFFER: usize = 32;

type ChannelMap = Arc<DashMap<u32, mpsc::Sender<Bytes>>>;

/// A channel opened by the peer
#[derive(Debug)]
pub struct IncomingChannel {
    pub channel_type: String,
    pub payload: Bytes,
    pub stream: VirtualStream,
}

#[derive(Clone, Debug)]
pub struct Multiplexer {
    channels: ChannelMap,
    next_channel_id: Arc<AtomicU32>,
    frame_tx: AsyncSender<Frame>,
    incoming_tx: AsyncSender<IncomingChannel>,
}

impl Multiplexer {
    pub fn new(
        frame_tx: AsyncSender<Frame>,
        is_dialer: bool,
    ) -> (Self, AsyncReceiver<IncomingChannel>) {
        let (incoming_tx, incoming_rx) = bounded_async(INCOMING_BUFFER);
        let initial_channel_id = if is_dialer { 1 } else { 2 };
        (
            Self {
                channels: Arc::new(DashMap::new()),
                next_channel_id: Arc::new(AtomicU32::new(initial_channel_id)),
                frame_tx,
                incoming_tx,
            },
            incoming_rx,
        )
    }

    #[inline]
    fn allocate_channel_id(&self) -> u32 {
        self.next_channel_id.fetch_add(2, Ordering::Relaxed)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Route a channel frame read from the wire
    pub async fn process_frame(&self, frame: Frame) {
        match frame {
            Frame::ChannelOpen(open) => {
                let ChannelOpenFrame {
                    channel_id,
                    channel_type,
                    payload,
                } = *open;
                let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);

                match self.channels.entry(channel_id) {
                    Entry::Occupied(_) => {
                        warn!("Channel {} already exists", channel_id);
                        return;
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(tx);
                    }
                }

                let stream = VirtualStream::new(
                    channel_id,
                    rx,
                    self.frame_tx.clone(),
                    self.channels.clone(),
                );
                let incoming = IncomingChannel {
                    channel_type,
                    payload,
                    stream,
                };
                // A refused channel is dropped here, which closes it on the peer
                if self.incoming_tx.send(incoming).await.is_err() {
                    debug!("No consumer for channel {}", channel_id);
                }
            }
            Frame::Data { channel_id, data } => {
                let tx = self.channels.get(&channel_id).map(|r| r.clone());
                if let Some(tx) = tx {
                    if tx.send(data).await.is_err() {
                        self.channels.remove(&channel_id);
                    }
                }
            }
            Frame::ChannelClose { channel_id } => {
                // Dropping the sender surfaces EOF once buffered data is read
                self.channels.remove(&channel_id);
            }
            other => debug!("Ignoring {} frame in multiplexer", other.kind()),
        }
    }

    /// Open a new outbound channel
    pub async fn open_channel(&self, channel_type: &str, payload: Bytes) -> Result<VirtualStream> {
        let channel_id = self.allocate_channel_id();

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        self.channels.insert(channel_id, tx);

        let open = Frame::ChannelOpen(Box::new(ChannelOpenFrame {
            channel_id,
            channel_type: channel_type.to_string(),
            payload,
        }));
        if let Err(e) = self.frame_tx.send(open).await {
            self.channels.remove(&channel_id);
            return Err(TunnelError::Connection(format!("opening channel: {e}")));
        }

        Ok(VirtualStream::new(
            channel_id,
            rx,
            self.frame_tx.clone(),
            self.channels.clone(),
        ))
    }

    /// Release every channel and stop delivering incoming ones
    pub fn shutdown(&self) {
        self.channels.clear();
        let _ = self.incoming_tx.close();
    }
}

type SendFuture = Pin<Box<dyn Future<Output = std::result::Result<(), SendError>> + Send>>;

/// One data channel, usable as a byte stream
///
/// Shutting down the write side sends `ChannelClose` while reads continue
/// until the peer closes too. Dropping the stream closes both directions.
pub struct VirtualStream {
    channel_id: u32,
    rx: mpsc::Receiver<Bytes>,
    read_buffer: Bytes,
    tx: AsyncSender<Frame>,
    /// Send in flight and the number of bytes it carries
    pending_send: Option<(SendFuture, usize)>,
    close_sent: bool,
    channels: ChannelMap,
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("channel_id", &self.channel_id)
            .field("read_buffer_len", &self.read_buffer.len())
            .finish_non_exhaustive()
    }
}

impl VirtualStream {
    fn new(
        channel_id: u32,
        rx: mpsc::Receiver<Bytes>,
        tx: AsyncSender<Frame>,
        channels: ChannelMap,
    ) -> Self {
        Self {
            channel_id,
            rx,
            read_buffer: Bytes::new(),
            tx,
            pending_send: None,
            close_sent: false,
            channels,
        }
    }

    pub fn id(&self) -> u32 {
        self.channel_id
    }

    fn start_send(&mut self, frame: Frame, len: usize) {
        let tx = self.tx.clone();
        self.pending_send = Some((Box::pin(async move { tx.send(frame).await }), len));
    }

    /// Drive the in-flight send, yielding the byte count it carried
    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<usize>>> {
        let Some((fut, len)) = self.pending_send.as_mut() else {
            return Poll::Ready(Ok(None));
        };
        let len = *len;
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.pending_send = None;
                Poll::Ready(
                    result
                        .map(|()| Some(len))
                        .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())),
                )
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        if !self.close_sent {
            let _ = self.tx.try_send(Frame::ChannelClose {
                channel_id: self.channel_id,
            });
        }
        self.channels.remove(&self.channel_id);
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buffer.is_empty() {
                let len = std::cmp::min(buf.remaining(), self.read_buffer.len());
                let chunk = self.read_buffer.split_to(len);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => self.read_buffer = data,
                Poll::Ready(None) => return Poll::Ready(Ok(())), // EOF
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // A write that returned Pending is completed before new data is taken
        match self.poll_pending(cx) {
            Poll::Ready(Ok(Some(len))) => return Poll::Ready(Ok(len)),
            Poll::Ready(Ok(None)) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if self.close_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel write side closed",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let frame = Frame::Data {
            channel_id: self.channel_id,
            data: Bytes::copy_from_slice(buf),
        };
        self.start_send(frame, buf.len());

        match self.poll_pending(cx) {
            Poll::Ready(Ok(len)) => Poll::Ready(Ok(len.unwrap_or(0))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            // The caller retries with the same buffer once the queue has room
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_pending(cx).map_ok(|_| ())
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match self.poll_pending(cx) {
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
            if self.close_sent {
                return Poll::Ready(Ok(()));
            }
            let frame = Frame::ChannelClose {
                channel_id: self.channel_id,
            };
            self.start_send(frame, 0);
            self.close_sent = true;
        }
    }
}
