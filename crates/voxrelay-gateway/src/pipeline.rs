//! One pipeline run: transcribe (audio input only), reply, synthesize, stream.
//!
//! A run executes in its own task and talks to the session only through
//! [`RunEvent`]s, so the session keeps reading inbound frames while provider
//! calls are suspended. The session forwards the frames; a run never writes
//! to the transport directly.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use voxrelay_core::error::SpeechError;
use voxrelay_core::protocol::{ErrorKind, OutboundFrame, Phase};
use voxrelay_media::SpeechClient;
use voxrelay_reply::{ConversationTurn, ReplyContext, ReplyGenerator};

/// Collaborators shared read-only by every session.
pub struct SessionServices {
    pub speech: Arc<SpeechClient>,
    pub reply: Arc<dyn ReplyGenerator>,
    pub reply_timeout: Duration,
    pub history_turns: usize,
    pub emit_status: bool,
    pub inbound_queue: usize,
    pub max_utterance_bytes: usize,
}

impl SessionServices {
    pub fn new(speech: Arc<SpeechClient>, reply: Arc<dyn ReplyGenerator>) -> Self {
        Self {
            speech,
            reply,
            reply_timeout: Duration::from_secs(30),
            history_turns: 20,
            emit_status: true,
            inbound_queue: 64,
            max_utterance_bytes: 10 * 1_048_576,
        }
    }
}

/// What a run starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunInput {
    Audio(Vec<u8>),
    Text(String),
}

/// Messages from a run back to its session. `run` identifies the run so the
/// session can drop anything from a run it has already abandoned.
#[derive(Debug)]
pub enum RunEvent {
    Frame { run: u64, frame: OutboundFrame },
    Phase { run: u64, phase: Phase },
    Finished { run: u64, outcome: RunOutcome },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Reply delivered; `user` is the transcript or text message.
    Completed { user: String, reply: String },
    /// Transcription produced no words.
    Empty,
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

impl RunOutcome {
    fn from_speech(err: SpeechError) -> Self {
        match err {
            SpeechError::Cancelled => Self::Cancelled,
            other => Self::Failed {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Empty => "empty",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

pub(crate) struct PipelineRun {
    pub run: u64,
    pub session_id: String,
    pub services: Arc<SessionServices>,
    pub history: Vec<ConversationTurn>,
    pub events: mpsc::Sender<RunEvent>,
    pub cancel: CancellationToken,
}

/// Emission failed because the session is gone.
struct Detached;

impl PipelineRun {
    pub async fn execute(self, input: RunInput) {
        let outcome = match self.drive(input).await {
            Ok(outcome) => outcome,
            Err(Detached) => return,
        };
        debug!(session_id = %self.session_id, run = self.run, outcome = outcome.label(), "Run finished");
        let _ = self
            .events
            .send(RunEvent::Finished {
                run: self.run,
                outcome,
            })
            .await;
    }

    async fn emit(&self, frame: OutboundFrame) -> Result<(), Detached> {
        self.events
            .send(RunEvent::Frame {
                run: self.run,
                frame,
            })
            .await
            .map_err(|_| Detached)
    }

    async fn drive(&self, input: RunInput) -> Result<RunOutcome, Detached> {
        let user = match input {
            RunInput::Audio(audio) => {
                debug!(session_id = %self.session_id, bytes = audio.len(), "Dispatching transcription");
                let text = match self.services.speech.transcribe(&audio, &self.cancel).await {
                    Ok(text) => text,
                    Err(e) => return Ok(RunOutcome::from_speech(e)),
                };
                drop(audio);
                let text = text.trim().to_string();
                self.emit(OutboundFrame::Transcript { text: text.clone() })
                    .await?;
                if text.is_empty() {
                    return Ok(RunOutcome::Empty);
                }
                text
            }
            RunInput::Text(text) => text,
        };

        let reply = match self.generate_reply(&user).await {
            Ok(reply) => reply,
            Err(outcome) => return Ok(outcome),
        };
        self.emit(OutboundFrame::ReplyText {
            text: reply.clone(),
        })
        .await?;

        let mut audio = match self.services.speech.synthesize(&reply, &self.cancel).await {
            Ok(stream) => stream,
            Err(e) => return Ok(RunOutcome::from_speech(e)),
        };
        self.events
            .send(RunEvent::Phase {
                run: self.run,
                phase: Phase::Streaming,
            })
            .await
            .map_err(|_| Detached)?;

        let mut seq = 0u64;
        while let Some(chunk) = audio.next().await {
            match chunk {
                Ok(bytes) => {
                    self.emit(OutboundFrame::AudioChunk {
                        seq,
                        bytes: bytes.to_vec(),
                    })
                    .await?;
                    seq += 1;
                }
                Err(e) => return Ok(RunOutcome::from_speech(e)),
            }
        }
        self.emit(OutboundFrame::StreamEnd).await?;
        info!(session_id = %self.session_id, run = self.run, chunks = seq, "Reply streamed");

        Ok(RunOutcome::Completed { user, reply })
    }

    async fn generate_reply(&self, text: &str) -> Result<String, RunOutcome> {
        let ctx = ReplyContext::new(self.session_id.clone(), text).with_history(self.history.clone());
        let reply = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RunOutcome::Cancelled),
            result = tokio::time::timeout(self.services.reply_timeout, self.services.reply.reply(&ctx)) => result,
        };
        match reply {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(RunOutcome::Failed {
                kind: e.kind(),
                message: e.to_string(),
            }),
            Err(_) => Err(RunOutcome::Failed {
                kind: ErrorKind::ReplyUnavailable,
                message: format!(
                    "Reply timed out after {}ms",
                    self.services.reply_timeout.as_millis()
                ),
            }),
        }
    }
}
