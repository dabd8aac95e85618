//! Session state machine tests against instrumented fake providers.
//!
//! Run with: `cargo test -p voxrelay-gateway --test session`

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedReceiver;

use voxrelay_core::error::{RegistryError, ReplyError, SpeechError};
use voxrelay_core::protocol::{ErrorKind, OutboundFrame, Phase};
use voxrelay_gateway::{OutboundSender, SessionHandle, SessionRegistry, SessionServices, TransportChannel};
use voxrelay_media::{AudioStream, SpeechClient, SpeechPolicy, SpeechProvider};
use voxrelay_reply::{ReplyContext, ReplyGenerator};

// --- Fakes ---

/// Counters shared with in-flight calls and live synthesis streams.
#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    abandoned: AtomicUsize,
}

/// Marks one provider call (or stream) as in flight until dropped.
struct Flight {
    counters: Arc<Counters>,
    finished: bool,
}

impl Flight {
    fn enter(counters: &Arc<Counters>) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self {
            counters: counters.clone(),
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.counters.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// How the next synthesis call fails, once.
#[derive(Debug, Clone, Copy)]
enum SynthFailure {
    AtDispatch,
    MidStream { after: usize },
}

struct FakeSpeech {
    synth_failure: Mutex<Option<SynthFailure>>,
    transcripts: Mutex<VecDeque<Result<String, SpeechError>>>,
    transcribe_delay: Duration,
    chunks: Vec<&'static [u8]>,
    chunk_delay: Duration,
    heard: Mutex<Vec<Vec<u8>>>,
    spoken: Mutex<Vec<String>>,
    transcribe_calls: AtomicUsize,
    counters: Arc<Counters>,
}

impl FakeSpeech {
    fn new() -> Self {
        Self {
            synth_failure: Mutex::new(None),
            transcripts: Mutex::new(VecDeque::new()),
            transcribe_delay: Duration::ZERO,
            chunks: vec![b"c1".as_slice(), b"c2".as_slice()],
            chunk_delay: Duration::ZERO,
            heard: Mutex::new(Vec::new()),
            spoken: Mutex::new(Vec::new()),
            transcribe_calls: AtomicUsize::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    fn script(self, results: Vec<Result<&str, SpeechError>>) -> Self {
        *self.transcripts.lock().unwrap() =
            results.into_iter().map(|r| r.map(String::from)).collect();
        self
    }

    fn fail_next_synthesis(self, failure: SynthFailure) -> Self {
        *self.synth_failure.lock().unwrap() = Some(failure);
        self
    }

    fn heard(&self) -> Vec<Vec<u8>> {
        self.heard.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechProvider for FakeSpeech {
    fn id(&self) -> &str {
        "fake"
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<String, SpeechError> {
        let flight = Flight::enter(&self.counters);
        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        self.heard.lock().unwrap().push(audio.to_vec());
        if !self.transcribe_delay.is_zero() {
            tokio::time::sleep(self.transcribe_delay).await;
        }
        let result = self
            .transcripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("hello".into()));
        flight.finish();
        result
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, SpeechError> {
        let flight = Flight::enter(&self.counters);
        self.spoken.lock().unwrap().push(text.to_string());
        let mut items: Vec<Result<&'static [u8], SpeechError>> =
            self.chunks.iter().copied().map(Ok).collect();
        match self.synth_failure.lock().unwrap().take() {
            Some(SynthFailure::AtDispatch) => {
                flight.finish();
                return Err(SpeechError::ProviderUnavailable("voice backend down".into()));
            }
            Some(SynthFailure::MidStream { after }) => {
                items.truncate(after);
                items.push(Err(SpeechError::ProviderUnavailable("stream dropped".into())));
            }
            None => {}
        }
        let delay = self.chunk_delay;
        let len = items.len();
        let stream = futures::stream::iter(items.into_iter().enumerate()).then(move |(i, item)| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            (i, item)
        });
        // The stream holds the flight until its last item.
        let mut flight = Some(flight);
        Ok(Box::pin(stream.map(move |(i, item)| {
            if i + 1 == len {
                if let Some(f) = flight.take() {
                    f.finish();
                }
            }
            item.map(Bytes::from_static)
        })))
    }
}

struct FakeReply {
    delay: Duration,
    fail: bool,
    calls: Mutex<Vec<ReplyContext>>,
}

impl FakeReply {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn texts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.text.clone()).collect()
    }
}

#[async_trait]
impl ReplyGenerator for FakeReply {
    fn id(&self) -> &str {
        "fake"
    }

    async fn reply(&self, ctx: &ReplyContext) -> Result<String, ReplyError> {
        self.calls.lock().unwrap().push(ctx.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(ReplyError::Unavailable("model down".into()));
        }
        Ok(match ctx.text.as_str() {
            "hello" => "world".to_string(),
            other => format!("re: {other}"),
        })
    }
}

// --- Harness ---

struct Harness {
    speech: Arc<FakeSpeech>,
    reply: Arc<FakeReply>,
    registry: SessionRegistry,
}

impl Harness {
    fn new(speech: FakeSpeech, reply: FakeReply, emit_status: bool) -> Self {
        Self::with_services(speech, reply, |services| services.emit_status = emit_status)
    }

    fn with_services(
        speech: FakeSpeech,
        reply: FakeReply,
        configure: impl FnOnce(&mut SessionServices),
    ) -> Self {
        let speech = Arc::new(speech);
        let reply = Arc::new(reply);
        let policy = SpeechPolicy {
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(50),
            max_retries: 1,
        };
        let client = SpeechClient::new(speech.clone(), policy);
        let mut services = SessionServices::new(Arc::new(client), reply.clone());
        configure(&mut services);
        Self {
            speech,
            reply,
            registry: SessionRegistry::new(Arc::new(services), 8),
        }
    }

    fn open(&self, id: &str) -> Conn {
        let (outbound, rx) = OutboundSender::new();
        let handle = self.registry.create(id, outbound.clone()).unwrap();
        let channel = handle.channel(1 << 20, outbound);
        Conn {
            channel,
            rx,
            handle,
        }
    }
}

struct Conn {
    channel: TransportChannel,
    rx: UnboundedReceiver<OutboundFrame>,
    handle: SessionHandle,
}

impl Conn {
    async fn send(&mut self, json: &str) {
        self.channel.receive_text(json).await.unwrap();
    }

    async fn text(&mut self, text: &str) {
        let frame = serde_json::json!({"type": "text_message", "text": text}).to_string();
        self.send(&frame).await;
    }

    async fn chunk(&mut self, seq: u64, bytes: &[u8]) {
        let mut msg = seq.to_be_bytes().to_vec();
        msg.extend_from_slice(bytes);
        self.channel.receive_binary(&msg).await.unwrap();
    }

    async fn next(&mut self) -> OutboundFrame {
        tokio::time::timeout(Duration::from_secs(30), self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound channel closed")
    }

    /// Collect frames up to and including the next `stream_end` or `error`.
    async fn until_done(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next().await;
            let done = matches!(frame, OutboundFrame::StreamEnd | OutboundFrame::Error { .. });
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    /// Close the channel and return anything emitted that was not yet read.
    async fn close_and_drain(mut self) -> Vec<OutboundFrame> {
        self.channel.close().await;
        self.handle.wait_closed(Duration::from_secs(5)).await;
        drop(self.channel);
        let mut rest = Vec::new();
        while let Some(frame) = self.rx.recv().await {
            rest.push(frame);
        }
        rest
    }
}

fn audio(seq: u64, data: &[u8]) -> OutboundFrame {
    OutboundFrame::AudioChunk {
        seq,
        bytes: data.to_vec(),
    }
}

fn is_warning(frame: &OutboundFrame) -> bool {
    matches!(frame, OutboundFrame::Warning { .. })
}

fn error_kind(frame: &OutboundFrame) -> Option<ErrorKind> {
    match frame {
        OutboundFrame::Error { kind, .. } => Some(*kind),
        _ => None,
    }
}

fn status(phase: Phase) -> OutboundFrame {
    OutboundFrame::Status { phase }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// --- Tests ---

#[tokio::test]
async fn test_end_to_end_sequence() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let mut conn = h.open("e2e");

    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.send(r#"{"type":"audio_chunk","seq":0,"bytes":"aGk="}"#).await;
    conn.send(r#"{"type":"end_audio"}"#).await;

    let frames = conn.until_done().await;
    assert_eq!(
        frames,
        vec![
            OutboundFrame::Transcript {
                text: "hello".into()
            },
            OutboundFrame::ReplyText {
                text: "world".into()
            },
            audio(0, b"c1"),
            audio(1, b"c2"),
            OutboundFrame::StreamEnd,
        ]
    );
    assert_eq!(h.speech.heard(), vec![b"hi".to_vec()]);
    assert!(conn.close_and_drain().await.is_empty());
}

#[tokio::test]
async fn test_status_frames_follow_phase_changes() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), true);
    let mut conn = h.open("status");

    conn.text("hi").await;
    let mut frames = conn.until_done().await;
    frames.push(conn.next().await);

    let status = |phase| OutboundFrame::Status { phase };
    assert_eq!(
        frames,
        vec![
            status(Phase::Processing),
            OutboundFrame::ReplyText {
                text: "re: hi".into()
            },
            status(Phase::Streaming),
            audio(0, b"c1"),
            audio(1, b"c2"),
            OutboundFrame::StreamEnd,
            status(Phase::Idle),
        ]
    );
}

#[tokio::test]
async fn test_utterance_is_concatenation_in_seq_order() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let mut conn = h.open("concat");

    conn.send(r#"{"type":"start_audio"}"#).await;
    for (seq, part) in ["ab", "cd", "ef", "gh"].iter().enumerate() {
        conn.chunk(seq as u64, part.as_bytes()).await;
    }
    conn.send(r#"{"type":"end_audio"}"#).await;
    conn.until_done().await;

    assert_eq!(h.speech.heard(), vec![b"abcdefgh".to_vec()]);
}

#[tokio::test]
async fn test_out_of_order_and_duplicate_chunks_dropped() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), true);
    let mut conn = h.open("ooo");

    conn.send(r#"{"type":"start_audio"}"#).await;
    assert_eq!(conn.next().await, OutboundFrame::Status { phase: Phase::Buffering });

    conn.chunk(0, b"a").await;
    conn.chunk(2, b"late").await;
    conn.chunk(0, b"dup").await;
    conn.chunk(1, b"b").await;

    assert!(is_warning(&conn.next().await));
    assert!(is_warning(&conn.next().await));

    conn.send(r#"{"type":"end_audio"}"#).await;
    // Still buffering until end_audio: the next status is Processing
    assert_eq!(conn.next().await, OutboundFrame::Status { phase: Phase::Processing });
    conn.until_done().await;

    assert_eq!(h.speech.heard(), vec![b"ab".to_vec()]);
}

#[tokio::test]
async fn test_transcribe_timeout_retried_once() {
    let speech = FakeSpeech::new().script(vec![Err(SpeechError::Timeout), Ok("hello")]);
    let h = Harness::new(speech, FakeReply::new(), false);
    let mut conn = h.open("retry");

    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"hi").await;
    conn.send(r#"{"type":"end_audio"}"#).await;

    let frames = conn.until_done().await;
    assert_eq!(
        frames[0],
        OutboundFrame::Transcript {
            text: "hello".into()
        }
    );
    assert_eq!(h.speech.transcribe_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalid_audio_single_error_no_retry() {
    let speech = FakeSpeech::new().script(vec![Err(SpeechError::InvalidAudio("garbled".into()))]);
    let h = Harness::new(speech, FakeReply::new(), false);
    let mut conn = h.open("invalid");

    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"??").await;
    conn.send(r#"{"type":"end_audio"}"#).await;

    match conn.next().await {
        OutboundFrame::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidAudio),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert_eq!(h.speech.transcribe_calls.load(Ordering::SeqCst), 1);
    assert!(h.reply.texts().is_empty());

    // Back in Idle: a text message runs normally
    conn.text("again").await;
    let frames = conn.until_done().await;
    assert_eq!(
        frames[0],
        OutboundFrame::ReplyText {
            text: "re: again".into()
        }
    );
}

#[tokio::test]
async fn test_reply_failure_returns_to_idle() {
    let mut reply = FakeReply::new();
    reply.fail = true;
    let h = Harness::new(FakeSpeech::new(), reply, false);
    let mut conn = h.open("reply-down");

    conn.text("anyone?").await;
    match conn.next().await {
        OutboundFrame::Error { kind, .. } => assert_eq!(kind, ErrorKind::ReplyUnavailable),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(h.speech.spoken.lock().unwrap().is_empty());
    assert!(conn.close_and_drain().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reply_timeout_reported_as_unavailable() {
    let mut reply = FakeReply::new();
    reply.delay = Duration::from_secs(10);
    let h = Harness::with_services(FakeSpeech::new(), reply, |services| {
        services.emit_status = true;
        services.reply_timeout = Duration::from_secs(1);
    });
    let mut conn = h.open("reply-slow");

    conn.text("hurry").await;
    assert_eq!(conn.next().await, status(Phase::Processing));
    match conn.next().await {
        OutboundFrame::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::ReplyUnavailable);
            assert!(message.contains("timed out"), "{message}");
        }
        other => panic!("expected error frame, got {other:?}"),
    }
    assert_eq!(conn.next().await, status(Phase::Idle));
    assert!(h.speech.spoken.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_failure_at_dispatch() {
    let speech = FakeSpeech::new().fail_next_synthesis(SynthFailure::AtDispatch);
    let h = Harness::new(speech, FakeReply::new(), true);
    let mut conn = h.open("tts-down");

    conn.text("speak").await;
    let mut frames = conn.until_done().await;
    frames.push(conn.next().await);
    assert_eq!(frames.len(), 4, "{frames:?}");
    assert_eq!(frames[0], status(Phase::Processing));
    assert_eq!(
        frames[1],
        OutboundFrame::ReplyText {
            text: "re: speak".into()
        }
    );
    assert_eq!(error_kind(&frames[2]), Some(ErrorKind::ProviderUnavailable));
    assert_eq!(frames[3], status(Phase::Idle));

    // The next request runs normally
    conn.text("again").await;
    let frames = conn.until_done().await;
    assert_eq!(
        frames,
        vec![
            status(Phase::Processing),
            OutboundFrame::ReplyText {
                text: "re: again".into()
            },
            status(Phase::Streaming),
            audio(0, b"c1"),
            audio(1, b"c2"),
            OutboundFrame::StreamEnd,
        ]
    );
    assert_eq!(conn.next().await, status(Phase::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_failure_mid_stream() {
    let mut speech = FakeSpeech::new().fail_next_synthesis(SynthFailure::MidStream { after: 1 });
    speech.chunk_delay = Duration::from_millis(50);
    let h = Harness::new(speech, FakeReply::new(), true);
    let mut conn = h.open("tts-drop");

    conn.text("speak").await;
    let mut frames = conn.until_done().await;
    frames.push(conn.next().await);
    assert_eq!(frames.len(), 6, "{frames:?}");
    assert_eq!(frames[0], status(Phase::Processing));
    assert!(matches!(frames[1], OutboundFrame::ReplyText { .. }));
    assert_eq!(frames[2], status(Phase::Streaming));
    assert_eq!(frames[3], audio(0, b"c1"));
    assert_eq!(error_kind(&frames[4]), Some(ErrorKind::ProviderUnavailable));
    assert_eq!(frames[5], status(Phase::Idle));
    assert!(!frames.contains(&OutboundFrame::StreamEnd));

    // A failed turn is not recorded in history
    conn.text("again").await;
    let frames = conn.until_done().await;
    assert_eq!(frames.last(), Some(&OutboundFrame::StreamEnd));
    let calls = h.reply.calls.lock().unwrap();
    assert!(calls[1].history.is_empty());
}

#[tokio::test]
async fn test_empty_transcript_skips_reply() {
    let speech = FakeSpeech::new().script(vec![Ok("   ")]);
    let h = Harness::new(speech, FakeReply::new(), true);
    let mut conn = h.open("silence");

    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"..").await;
    conn.send(r#"{"type":"end_audio"}"#).await;

    let mut frames = Vec::new();
    loop {
        let frame = conn.next().await;
        let idle = frame == OutboundFrame::Status { phase: Phase::Idle };
        frames.push(frame);
        if idle {
            break;
        }
    }
    assert!(frames.contains(&OutboundFrame::Transcript { text: String::new() }));
    assert!(h.reply.texts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_latest_wins_while_busy() {
    let mut reply = FakeReply::new();
    reply.delay = Duration::from_millis(500);
    let h = Harness::new(FakeSpeech::new(), reply, false);
    let mut conn = h.open("latest");

    conn.text("first").await;
    settle().await;
    conn.text("A").await;
    conn.text("B").await;

    conn.until_done().await; // first
    let frames = conn.until_done().await;
    assert_eq!(
        frames[0],
        OutboundFrame::ReplyText {
            text: "re: B".into()
        }
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.reply.texts(), vec!["first", "B"]);
    assert!(conn.close_and_drain().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_speech_call_in_flight() {
    let mut speech = FakeSpeech::new();
    speech.transcribe_delay = Duration::from_millis(200);
    speech.chunk_delay = Duration::from_millis(100);
    let h = Harness::new(speech, FakeReply::new(), false);
    let mut conn = h.open("serial");

    for round in 0..3u8 {
        conn.send(r#"{"type":"start_audio"}"#).await;
        conn.chunk(0, &[round]).await;
        conn.send(r#"{"type":"end_audio"}"#).await;
        conn.text("interrupt").await;
        settle().await;
    }
    // The first utterance runs, later requests collapse into the last text
    for _ in 0..2 {
        conn.until_done().await;
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.speech.counters.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.speech.counters.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_processing_cancels_call() {
    let mut speech = FakeSpeech::new();
    speech.transcribe_delay = Duration::from_secs(10);
    let h = Harness::new(speech, FakeReply::new(), false);
    let mut conn = h.open("stop");

    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"hi").await;
    conn.send(r#"{"type":"end_audio"}"#).await;
    settle().await;
    assert_eq!(h.speech.counters.in_flight.load(Ordering::SeqCst), 1);

    conn.send(r#"{"type":"stop"}"#).await;
    tokio::time::timeout(Duration::from_secs(1), conn.handle.finished())
        .await
        .expect("session did not close in time");

    settle().await;
    assert_eq!(h.speech.counters.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(h.speech.counters.abandoned.load(Ordering::SeqCst), 1);
    assert!(conn.close_and_drain().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_during_streaming_emits_nothing_more() {
    let mut speech = FakeSpeech::new();
    speech.chunks = vec![b"c1".as_slice(), b"c2".as_slice(), b"c3".as_slice(), b"c4".as_slice()];
    speech.chunk_delay = Duration::from_millis(300);
    let h = Harness::new(speech, FakeReply::new(), false);
    let mut conn = h.open("close-stream");

    conn.text("talk to me").await;
    assert!(matches!(conn.next().await, OutboundFrame::ReplyText { .. }));
    assert_eq!(conn.next().await, audio(0, b"c1"));

    let rest = conn.close_and_drain().await;
    assert!(rest.is_empty(), "frames after close: {rest:?}");

    settle().await;
    assert_eq!(h.speech.counters.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(h.speech.counters.abandoned.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_utterance_captured_while_busy() {
    let mut reply = FakeReply::new();
    reply.delay = Duration::from_millis(300);
    let h = Harness::new(FakeSpeech::new(), reply, false);
    let mut conn = h.open("pending-audio");

    conn.text("first").await;
    settle().await;
    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"qu").await;
    conn.chunk(1, b"eued").await;
    conn.send(r#"{"type":"end_audio"}"#).await;

    conn.until_done().await;
    let frames = conn.until_done().await;
    assert_eq!(
        frames[0],
        OutboundFrame::Transcript {
            text: "hello".into()
        }
    );
    assert_eq!(h.speech.heard(), vec![b"queued".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_open_pending_utterance_resumes_buffering() {
    let mut reply = FakeReply::new();
    reply.delay = Duration::from_millis(300);
    let h = Harness::new(FakeSpeech::new(), reply, true);
    let mut conn = h.open("resume");

    conn.text("first").await;
    settle().await;
    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"part1-").await;

    conn.until_done().await;
    assert_eq!(conn.next().await, OutboundFrame::Status { phase: Phase::Idle });
    assert_eq!(conn.next().await, OutboundFrame::Status { phase: Phase::Buffering });

    conn.chunk(1, b"part2").await;
    conn.send(r#"{"type":"end_audio"}"#).await;
    conn.until_done().await;
    assert_eq!(h.speech.heard(), vec![b"part1-part2".to_vec()]);
}

#[tokio::test]
async fn test_text_mid_utterance_discards_audio() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let mut conn = h.open("mid");

    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"half a sent").await;
    conn.text("never mind").await;

    assert!(is_warning(&conn.next().await));
    let frames = conn.until_done().await;
    assert_eq!(
        frames[0],
        OutboundFrame::ReplyText {
            text: "re: never mind".into()
        }
    );
    assert!(h.speech.heard().is_empty());
}

#[tokio::test]
async fn test_gap_drops_rest_of_utterance() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let mut conn = h.open("gap");

    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"a").await;
    conn.chunk(2, b"c").await;
    conn.chunk(3, b"d").await;
    conn.send(r#"{"type":"end_audio"}"#).await;

    assert!(is_warning(&conn.next().await));
    assert!(is_warning(&conn.next().await));
    conn.until_done().await;
    assert_eq!(h.speech.heard(), vec![b"a".to_vec()]);
}

#[tokio::test]
async fn test_oversized_utterance_discarded() {
    let h = Harness::with_services(FakeSpeech::new(), FakeReply::new(), |services| {
        services.emit_status = true;
        services.max_utterance_bytes = 8;
    });
    let mut conn = h.open("too-big");

    conn.send(r#"{"type":"start_audio"}"#).await;
    assert_eq!(conn.next().await, status(Phase::Buffering));
    conn.chunk(0, b"123456").await;
    conn.chunk(1, b"7890").await;
    assert_eq!(error_kind(&conn.next().await), Some(ErrorKind::InvalidAudio));
    assert_eq!(conn.next().await, status(Phase::Idle));

    // The rest of the oversized utterance has nowhere to go
    conn.chunk(2, b"x").await;
    conn.send(r#"{"type":"end_audio"}"#).await;
    assert!(is_warning(&conn.next().await));
    assert!(is_warning(&conn.next().await));
    assert_eq!(h.speech.transcribe_calls.load(Ordering::SeqCst), 0);

    // Exactly at the limit is accepted
    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"12345678").await;
    conn.send(r#"{"type":"end_audio"}"#).await;
    conn.until_done().await;
    assert_eq!(h.speech.heard(), vec![b"12345678".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_pending_utterance_discarded() {
    let mut reply = FakeReply::new();
    reply.delay = Duration::from_millis(300);
    let h = Harness::with_services(FakeSpeech::new(), reply, |services| {
        services.max_utterance_bytes = 8;
    });
    let mut conn = h.open("too-big-pending");

    conn.text("first").await;
    settle().await;
    conn.send(r#"{"type":"start_audio"}"#).await;
    conn.chunk(0, b"0123456789").await;
    conn.send(r#"{"type":"end_audio"}"#).await;

    assert_eq!(error_kind(&conn.next().await), Some(ErrorKind::InvalidAudio));
    assert!(is_warning(&conn.next().await));

    // The current run is unaffected
    let frames = conn.until_done().await;
    assert_eq!(frames.last(), Some(&OutboundFrame::StreamEnd));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.speech.transcribe_calls.load(Ordering::SeqCst), 0);
    assert!(conn.close_and_drain().await.is_empty());
}

#[tokio::test]
async fn test_stray_audio_in_idle_warns() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let mut conn = h.open("stray");

    conn.chunk(0, b"x").await;
    conn.send(r#"{"type":"end_audio"}"#).await;
    assert!(is_warning(&conn.next().await));
    assert!(is_warning(&conn.next().await));
    assert_eq!(h.speech.transcribe_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_history_passed_to_next_turn() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let mut conn = h.open("history");

    conn.text("one").await;
    conn.until_done().await;
    conn.text("two").await;
    conn.until_done().await;

    let calls = h.reply.calls.lock().unwrap();
    assert!(calls[0].history.is_empty());
    let history: Vec<_> = calls[1].history.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(history, vec!["one", "re: one"]);
}

#[tokio::test]
async fn test_malformed_frame_does_not_reach_session() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), true);
    let mut conn = h.open("malformed");

    conn.send(r#"{"type":"shout"}"#).await;
    match conn.next().await {
        OutboundFrame::Error { kind, .. } => assert_eq!(kind, ErrorKind::MalformedFrame),
        other => panic!("expected error frame, got {other:?}"),
    }
    // Session unaffected
    conn.send(r#"{"type":"start_audio"}"#).await;
    assert_eq!(conn.next().await, OutboundFrame::Status { phase: Phase::Buffering });
}

#[tokio::test]
async fn test_nothing_emitted_after_stop() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let mut conn = h.open("stop-then-junk");

    let delivered = conn
        .channel
        .receive_text("{\"type\":\"stop\"}\n{garbage}\n")
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    tokio::time::timeout(Duration::from_secs(5), conn.handle.finished())
        .await
        .expect("session did not close in time");

    // A message read after the session ended is refused silently
    assert!(conn.channel.receive_text("{garbage}").await.is_err());
    assert!(conn.channel.receive_binary(&[0; 4]).await.is_err());
    assert!(conn.close_and_drain().await.is_empty());
}

// --- Registry ---

#[tokio::test]
async fn test_registry_rejects_duplicate_id() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let _conn = h.open("dup");
    let (outbound, _rx) = OutboundSender::new();
    let err = h.registry.create("dup", outbound).err().unwrap();
    assert_eq!(err, RegistryError::DuplicateSession("dup".into()));
}

#[tokio::test]
async fn test_registry_capacity() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let mut receivers = Vec::new();
    for i in 0..8 {
        let (outbound, rx) = OutboundSender::new();
        h.registry.create(&format!("s{i}"), outbound).unwrap();
        receivers.push(rx);
    }
    let (outbound, _rx) = OutboundSender::new();
    assert_eq!(
        h.registry.create("one-too-many", outbound).err(),
        Some(RegistryError::Full { limit: 8 })
    );
    assert_eq!(h.registry.len(), 8);
    h.registry.shutdown_all();
}

#[tokio::test]
async fn test_registry_get_remove() {
    let h = Harness::new(FakeSpeech::new(), FakeReply::new(), false);
    let conn = h.open("gr");
    assert_eq!(h.registry.get("gr").map(|s| s.id().to_string()), Some("gr".into()));
    assert_eq!(h.registry.ids(), vec!["gr".to_string()]);

    conn.close_and_drain().await;
    assert!(h.registry.remove("gr").is_some());
    assert!(h.registry.remove("gr").is_none());
    assert!(h.registry.get("gr").is_none());
    assert!(h.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_concurrent_create_remove() {
    let h = Arc::new(Harness::new(FakeSpeech::new(), FakeReply::new(), false));
    let mut tasks = Vec::new();
    for worker in 0..4 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                let id = format!("w{worker}-{i}");
                let (outbound, _rx) = OutboundSender::new();
                let handle = h.registry.create(&id, outbound).unwrap();
                handle.shutdown();
                handle.finished().await;
                assert!(h.registry.remove(&id).is_some());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(h.registry.is_empty());
}
