//! Transport channel: framing, reassembly, and dispatch between a socket and
//! its session.
//!
//! Inbound text is newline-delimited JSON, but a transport message may carry
//! a fraction of a frame, several frames, or both. [`FrameDecoder`] keeps the
//! unfinished tail and completes it from later messages.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxrelay_core::error::ChannelError;
use voxrelay_core::protocol::{InboundFrame, OutboundFrame};

/// What a session receives from its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Frame(InboundFrame),
    /// Terminal; delivered once.
    Closed,
}

/// Incremental decoder for inbound frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Bytes held from an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed one text message; returns every frame it completes, in order.
    pub fn push_text(&mut self, data: &[u8]) -> Vec<Result<InboundFrame, ChannelError>> {
        let mut out = Vec::new();
        self.buf.extend_from_slice(data);

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_frame_bytes {
                out.push(Err(self.too_large()));
                continue;
            }
            out.push(
                serde_json::from_slice::<InboundFrame>(line)
                    .map_err(|e| ChannelError::Malformed(e.to_string())),
            );
        }

        if self.buf.trim_ascii().is_empty() {
            self.buf.clear();
            return out;
        }
        if self.buf.len() > self.max_frame_bytes {
            self.buf.clear();
            out.push(Err(self.too_large()));
            return out;
        }

        // The tail may hold one or more complete frames followed by a prefix.
        let mut stream =
            serde_json::Deserializer::from_slice(&self.buf).into_iter::<InboundFrame>();
        let mut consumed = 0;
        let mut malformed = None;
        loop {
            match stream.next() {
                Some(Ok(frame)) => {
                    consumed = stream.byte_offset();
                    out.push(Ok(frame));
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    malformed = Some(e.to_string());
                    break;
                }
                None => {
                    consumed = self.buf.len();
                    break;
                }
            }
        }

        match malformed {
            Some(reason) => {
                self.buf.clear();
                out.push(Err(ChannelError::Malformed(reason)));
            }
            None => {
                self.buf.drain(..consumed);
                if self.buf.trim_ascii().is_empty() {
                    self.buf.clear();
                }
            }
        }
        out
    }

    /// Decode one binary audio message.
    pub fn decode_binary(&self, data: &[u8]) -> Result<InboundFrame, ChannelError> {
        if data.len() > self.max_frame_bytes {
            return Err(self.too_large());
        }
        InboundFrame::from_binary(data)
    }

    fn too_large(&self) -> ChannelError {
        ChannelError::FrameTooLarge {
            limit: self.max_frame_bytes,
        }
    }
}

/// Ordered, non-blocking handle for frames going to the client.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl OutboundSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame. Returns false once the writer side is gone.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

}

/// One connection's channel: decodes inbound messages and dispatches them to
/// the owning session in arrival order.
pub struct TransportChannel {
    session_id: String,
    decoder: FrameDecoder,
    inbound: mpsc::Sender<ChannelEvent>,
    outbound: OutboundSender,
    shutdown: CancellationToken,
    done: CancellationToken,
    closed: bool,
}

impl TransportChannel {
    /// `shutdown` is the session's own stop signal, used only when the
    /// terminal event cannot be queued normally. `done` fires once the
    /// session task has exited; after that the channel emits nothing.
    pub fn new(
        session_id: impl Into<String>,
        max_frame_bytes: usize,
        inbound: mpsc::Sender<ChannelEvent>,
        outbound: OutboundSender,
        shutdown: CancellationToken,
        done: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            decoder: FrameDecoder::new(max_frame_bytes),
            inbound,
            outbound,
            shutdown,
            done,
            closed: false,
        }
    }

    /// True after `stop`, `close()`, or once the session has finished.
    pub fn is_closed(&self) -> bool {
        self.closed || self.done.is_cancelled()
    }

    /// Handle one text message. Returns the number of frames dispatched, or
    /// `Closed` once the session no longer accepts events.
    ///
    /// Anything following a `stop` frame in the same message is discarded.
    pub async fn receive_text(&mut self, data: &str) -> Result<usize, ChannelError> {
        if self.is_closed() {
            self.closed = true;
            return Err(ChannelError::Closed);
        }
        let mut delivered = 0;
        for decoded in self.decoder.push_text(data.as_bytes()) {
            match decoded {
                Ok(frame) => {
                    let stop = matches!(frame, InboundFrame::Stop);
                    self.deliver(frame).await?;
                    delivered += 1;
                    if stop {
                        debug!(session_id = %self.session_id, "Stop delivered, channel closed");
                        self.closed = true;
                        break;
                    }
                }
                Err(e) => self.reject(e),
            }
        }
        Ok(delivered)
    }

    /// Handle one binary audio message.
    pub async fn receive_binary(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        if self.is_closed() {
            self.closed = true;
            return Err(ChannelError::Closed);
        }
        match self.decoder.decode_binary(data) {
            Ok(frame) => {
                self.deliver(frame).await?;
                Ok(1)
            }
            Err(e) => {
                self.reject(e);
                Ok(0)
            }
        }
    }

    async fn deliver(&mut self, frame: InboundFrame) -> Result<(), ChannelError> {
        debug!(session_id = %self.session_id, frame = frame.name(), "Inbound frame");
        if self.inbound.send(ChannelEvent::Frame(frame)).await.is_err() {
            // Session already gone (stopped); nothing more will be accepted.
            self.closed = true;
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Malformed input is answered locally and never reaches the session.
    fn reject(&self, err: ChannelError) {
        if self.is_closed() {
            debug!(session_id = %self.session_id, %err, "Dropping rejected frame after close");
            return;
        }
        warn!(session_id = %self.session_id, kind = err.kind().as_str(), %err, "Rejected inbound frame");
        #[cfg(feature = "metrics")]
        crate::metrics::record_rejected_frame(err.kind().as_str());
        self.outbound
            .send(OutboundFrame::error(err.kind(), err.to_string()));
    }

    /// Deliver the terminal `Closed` event. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.inbound.send(ChannelEvent::Closed).await.is_err() {
            debug!(session_id = %self.session_id, "Session exited before close");
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.inbound.try_send(ChannelEvent::Closed).is_err() {
            self.shutdown.cancel();
        }
    }
}
