//! Batched frame writer
//!
//! Drains the connection's outbound queue and coalesces whatever is ready
//! into a single write + flush.

use bytes::BytesMut;
use kanal::AsyncReceiver;
use portmesh_protocol::{Frame, TunnelCodec};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_BATCH_SIZE: usize = 32;
const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// Write queued frames to `writer` until the queue closes or `shutdown` fires.
///
/// The write half is shut down on exit so the peer observes EOF.
pub async fn run_batched_sender<W>(
    frame_rx: AsyncReceiver<Frame>,
    mut writer: W,
    mut codec: TunnelCodec,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY);

    loop {
        buffer.clear();

        let first = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };

        let mut batched = 0usize;
        let mut next = Some(first);
        while let Some(frame) = next.take() {
            let kind = frame.kind();
            if let Err(e) = codec.encode(frame, &mut buffer) {
                warn!("Skipping unencodable {} frame: {}", kind, e);
            }
            batched += 1;
            if batched < MAX_BATCH_SIZE {
                next = frame_rx.try_recv().ok().flatten();
            }
        }

        if buffer.is_empty() {
            continue;
        }

        if let Err(e) = writer.write_all(&buffer).await {
            warn!("Failed to write batched frames: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("Failed to flush batched writer: {}", e);
            break;
        }
    }

    debug!("frame writer stopped");
    let _ = writer.shutdown().await;
}
