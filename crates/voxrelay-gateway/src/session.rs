//! Per-session state machine.
//!
//! Each session is one task reading its private inbound queue. Provider work
//! runs in a child task (see [`crate::pipeline`]); at most one exists at a
//! time. Input arriving while a run is busy goes to a single latest-wins
//! pending slot that is started when the session returns to `Idle`.
//!
//! Every outbound frame, including those produced by a run, is sent from the
//! session task, so once the session is `Closed` nothing else reaches the
//! client.

use std::sync::Arc;

#[cfg(feature = "metrics")]
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxrelay_core::protocol::{ErrorKind, InboundFrame, OutboundFrame, Phase};
use voxrelay_reply::ConversationHistory;

use crate::channel::{ChannelEvent, OutboundSender};
use crate::pipeline::{PipelineRun, RunEvent, RunInput, RunOutcome, SessionServices};

const RUN_EVENT_CAPACITY: usize = 32;

/// Audio accumulated between `start_audio` and `end_audio`.
///
/// Sequence numbers must be contiguous from 0: after a gap every later chunk
/// is refused until the missing one arrives.
#[derive(Debug, Default)]
struct Utterance {
    buffer: Vec<u8>,
    next_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkRejected {
    OutOfOrder { expected: u64 },
    TooLarge { limit: usize },
}

impl Utterance {
    /// Append a chunk if it carries the next expected sequence number and
    /// keeps the utterance within `limit` bytes.
    fn accept(&mut self, seq: u64, bytes: &[u8], limit: usize) -> Result<(), ChunkRejected> {
        if seq != self.next_seq {
            return Err(ChunkRejected::OutOfOrder {
                expected: self.next_seq,
            });
        }
        if self.buffer.len() + bytes.len() > limit {
            return Err(ChunkRejected::TooLarge { limit });
        }
        self.buffer.extend_from_slice(bytes);
        self.next_seq += 1;
        Ok(())
    }

    fn take(&mut self) -> Vec<u8> {
        self.next_seq = 0;
        std::mem::take(&mut self.buffer)
    }
}

/// The single next-run request held while busy.
#[derive(Debug)]
enum Pending {
    Text(String),
    Audio { utterance: Utterance, ended: bool },
}

struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    #[cfg(feature = "metrics")]
    started: Instant,
}

pub(crate) struct Session {
    id: String,
    phase: Phase,
    services: Arc<SessionServices>,
    outbound: OutboundSender,
    utterance: Utterance,
    pending: Option<Pending>,
    history: ConversationHistory,
    run: Option<ActiveRun>,
    runs_started: u64,
    last_error: Option<ErrorKind>,
    events_tx: mpsc::Sender<RunEvent>,
    events_rx: mpsc::Receiver<RunEvent>,
}

impl Session {
    pub fn new(id: String, services: Arc<SessionServices>, outbound: OutboundSender) -> Self {
        let (events_tx, events_rx) = mpsc::channel(RUN_EVENT_CAPACITY);
        let history = ConversationHistory::new(services.history_turns);
        Self {
            id,
            phase: Phase::Idle,
            services,
            outbound,
            utterance: Utterance::default(),
            pending: None,
            history,
            run: None,
            runs_started: 0,
            last_error: None,
            events_tx,
            events_rx,
        }
    }

    /// Process events until the session closes.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<ChannelEvent>,
        shutdown: CancellationToken,
    ) {
        info!(session_id = %self.id, "Session started");
        #[cfg(feature = "metrics")]
        crate::metrics::record_session_open();

        while self.phase != Phase::Closed {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => self.close("shutdown"),
                Some(event) = self.events_rx.recv() => self.handle_run_event(event),
                event = inbound.recv() => match event {
                    Some(ChannelEvent::Frame(frame)) => self.handle_frame(frame),
                    Some(ChannelEvent::Closed) | None => self.close("channel closed"),
                },
            }
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_session_close();
        info!(
            session_id = %self.id,
            runs = self.runs_started,
            last_error = ?self.last_error,
            "Session closed"
        );
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        debug!(session_id = %self.id, phase = %self.phase, frame = frame.name(), "Handling frame");
        match frame {
            InboundFrame::Stop => self.close("stop requested"),
            InboundFrame::StartAudio => self.on_start_audio(),
            InboundFrame::AudioChunk { seq, bytes } => self.on_audio_chunk(seq, &bytes),
            InboundFrame::EndAudio => self.on_end_audio(),
            InboundFrame::TextMessage { text } => self.on_text(text),
        }
    }

    fn on_start_audio(&mut self) {
        match self.phase {
            Phase::Idle => {
                self.utterance = Utterance::default();
                self.set_phase(Phase::Buffering);
            }
            Phase::Buffering => {
                let dropped = self.utterance.take().len();
                warn!(session_id = %self.id, dropped_bytes = dropped, "start_audio during utterance, restarting");
                self.warn_client("start_audio received mid-utterance; previous audio discarded");
            }
            Phase::Processing | Phase::Streaming => self.queue(Pending::Audio {
                utterance: Utterance::default(),
                ended: false,
            }),
            Phase::Closed => {}
        }
    }

    fn on_audio_chunk(&mut self, seq: u64, bytes: &[u8]) {
        let limit = self.services.max_utterance_bytes;
        let busy = self.phase.is_busy();
        let target = match self.phase {
            Phase::Buffering => Some(&mut self.utterance),
            Phase::Processing | Phase::Streaming => match &mut self.pending {
                Some(Pending::Audio {
                    utterance,
                    ended: false,
                }) => Some(utterance),
                _ => None,
            },
            Phase::Idle => None,
            Phase::Closed => return,
        };
        let Some(utterance) = target else {
            warn!(session_id = %self.id, seq, "audio_chunk outside an utterance");
            self.warn_client("audio_chunk ignored: no utterance in progress");
            return;
        };
        match utterance.accept(seq, bytes, limit) {
            Ok(()) => {}
            Err(ChunkRejected::OutOfOrder { expected }) => {
                warn!(session_id = %self.id, seq, expected, "Dropped out-of-order audio chunk");
                self.warn_client(format!(
                    "audio_chunk seq {seq} dropped (expected {expected})"
                ));
            }
            Err(ChunkRejected::TooLarge { limit }) => self.discard_oversized(limit, busy),
        }
    }

    /// An utterance over the size limit is dropped with a single error frame.
    /// A pending one only empties the slot; the current run is untouched.
    fn discard_oversized(&mut self, limit: usize, pending: bool) {
        warn!(session_id = %self.id, limit, pending, "Utterance too large, discarding");
        #[cfg(feature = "metrics")]
        crate::metrics::record_error(ErrorKind::InvalidAudio.as_str());
        self.outbound.send(OutboundFrame::error(
            ErrorKind::InvalidAudio,
            format!("utterance exceeds {limit} bytes; discarded"),
        ));
        if pending {
            self.pending = None;
        } else {
            self.utterance = Utterance::default();
            self.set_phase(Phase::Idle);
        }
    }

    fn on_end_audio(&mut self) {
        match self.phase {
            Phase::Buffering => {
                let audio = self.utterance.take();
                self.start_run(RunInput::Audio(audio));
                return;
            }
            Phase::Processing | Phase::Streaming => {
                if let Some(Pending::Audio { ended, .. }) = &mut self.pending {
                    if !*ended {
                        *ended = true;
                        return;
                    }
                }
            }
            Phase::Closed => return,
            Phase::Idle => {}
        }
        warn!(session_id = %self.id, "end_audio outside an utterance");
        self.warn_client("end_audio ignored: no utterance in progress");
    }

    fn on_text(&mut self, text: String) {
        if text.trim().is_empty() {
            self.warn_client("empty text_message ignored");
            return;
        }
        match self.phase {
            Phase::Idle => self.start_run(RunInput::Text(text)),
            Phase::Buffering => {
                let dropped = self.utterance.take().len();
                warn!(session_id = %self.id, dropped_bytes = dropped, "text_message mid-utterance, discarding audio");
                self.warn_client("text_message received mid-utterance; buffered audio discarded");
                self.start_run(RunInput::Text(text));
            }
            Phase::Processing | Phase::Streaming => self.queue(Pending::Text(text)),
            Phase::Closed => {}
        }
    }

    /// Latest wins: a new request replaces whatever was waiting.
    fn queue(&mut self, next: Pending) {
        if let Some(previous) = self.pending.replace(next) {
            debug!(session_id = %self.id, ?previous, "Pending request superseded");
            #[cfg(feature = "metrics")]
            crate::metrics::record_superseded();
        }
    }

    fn start_run(&mut self, input: RunInput) {
        self.runs_started += 1;
        let id = self.runs_started;
        let cancel = CancellationToken::new();
        let run = PipelineRun {
            run: id,
            session_id: self.id.clone(),
            services: self.services.clone(),
            history: self.history.snapshot(),
            events: self.events_tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.execute(input));
        self.run = Some(ActiveRun {
            id,
            cancel,
            task,
            #[cfg(feature = "metrics")]
            started: Instant::now(),
        });
        self.set_phase(Phase::Processing);
    }

    fn handle_run_event(&mut self, event: RunEvent) {
        let current = self.run.as_ref().map(|r| r.id);
        let run = match &event {
            RunEvent::Frame { run, .. }
            | RunEvent::Phase { run, .. }
            | RunEvent::Finished { run, .. } => *run,
        };
        if current != Some(run) {
            debug!(session_id = %self.id, run, "Dropping event from abandoned run");
            return;
        }

        match event {
            RunEvent::Frame { frame, .. } => {
                self.outbound.send(frame);
            }
            RunEvent::Phase { phase, .. } => self.set_phase(phase),
            RunEvent::Finished { outcome, .. } => self.finish_run(outcome),
        }
    }

    fn finish_run(&mut self, outcome: RunOutcome) {
        if let Some(_run) = self.run.take() {
            #[cfg(feature = "metrics")]
            crate::metrics::record_run(outcome.label(), _run.started.elapsed().as_secs_f64());
        }
        match outcome {
            RunOutcome::Completed { user, reply } => {
                self.history.record_exchange(&user, &reply);
                self.last_error = None;
            }
            RunOutcome::Empty => {
                debug!(session_id = %self.id, "Empty transcript, no reply");
            }
            RunOutcome::Failed { kind, message } => {
                warn!(session_id = %self.id, kind = kind.as_str(), %message, "Pipeline run failed");
                #[cfg(feature = "metrics")]
                crate::metrics::record_error(kind.as_str());
                self.outbound.send(OutboundFrame::error(kind, message));
                self.last_error = Some(kind);
            }
            RunOutcome::Cancelled => {}
        }
        self.set_phase(Phase::Idle);
        self.resume_pending();
    }

    fn resume_pending(&mut self) {
        match self.pending.take() {
            Some(Pending::Text(text)) => self.start_run(RunInput::Text(text)),
            Some(Pending::Audio {
                mut utterance,
                ended: true,
            }) => self.start_run(RunInput::Audio(utterance.take())),
            Some(Pending::Audio {
                utterance,
                ended: false,
            }) => {
                self.utterance = utterance;
                self.set_phase(Phase::Buffering);
            }
            None => {}
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        debug!(session_id = %self.id, from = %self.phase, to = %phase, "Phase change");
        self.phase = phase;
        if self.services.emit_status && phase != Phase::Closed {
            self.outbound.send(OutboundFrame::Status { phase });
        }
    }

    fn warn_client(&self, message: impl Into<String>) {
        self.outbound.send(OutboundFrame::warning(message));
    }

    /// Terminal: cancel in-flight work, release buffers, emit nothing more.
    fn close(&mut self, reason: &str) {
        if self.phase == Phase::Closed {
            return;
        }
        if let Some(run) = self.run.take() {
            debug!(session_id = %self.id, run = run.id, "Cancelling in-flight run");
            run.cancel.cancel();
            run.task.abort();
        }
        self.utterance = Utterance::default();
        self.pending = None;
        self.history.clear();
        self.events_rx.close();
        info!(session_id = %self.id, phase = %self.phase, reason, "Closing session");
        self.set_phase(Phase::Closed);
    }
}
