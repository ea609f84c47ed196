use bytes::Bytes;
use kanal::AsyncSender;
use portmesh_protocol::Frame;
use tracing::debug;

/// A global request received from the peer
#[derive(Debug)]
pub struct InboundRequest {
    pub name: String,
    pub want_reply: bool,
    pub payload: Bytes,
    pub responder: Responder,
}

/// Answers one [`InboundRequest`]
///
/// Replies are only put on the wire when the peer asked for one.
#[derive(Debug)]
pub struct Responder {
    request_id: u32,
    want_reply: bool,
    frame_tx: AsyncSender<Frame>,
}

impl Responder {
    pub(crate) fn new(request_id: u32, want_reply: bool, frame_tx: AsyncSender<Frame>) -> Self {
        Self {
            request_id,
            want_reply,
            frame_tx,
        }
    }

    pub async fn success(self, payload: Bytes) {
        let frame = Frame::RequestSuccess {
            request_id: self.request_id,
            payload,
        };
        self.reply(frame).await;
    }

    pub async fn failure(self) {
        let frame = Frame::RequestFailure {
            request_id: self.request_id,
        };
        self.reply(frame).await;
    }

    async fn reply(self, frame: Frame) {
        if !self.want_reply {
            return;
        }
        if let Err(e) = self.frame_tx.send(frame).await {
            debug!(request_id = self.request_id, "reply dropped: {}", e);
        }
    }
}
