use crate::capture::{CaptureControl, CaptureFactory};
use crate::protocol::ServerMsg;
use crate::transcript::TranscriptBuffer;
use crate::transport::{close_error, ChunkSender, Connector, TransportEvent};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const TIMER_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_BUFFER: usize = 64;

/// Session state machine. `Idle` is initial and terminal; `Error` is
/// terminal until `clear_error` or the next `start_recording`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Recording,
    Error,
}

/// Outcome events delivered to the caller. One channel of tagged events
/// stands in for the three callbacks a UI would register: transcript
/// updates, the tier-limit notice, and terminal failures.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Fired on every appended final segment and every interim replacement.
    TranscriptUpdate {
        final_text: String,
        interim_text: String,
    },
    /// The service reported the tier's hard duration ceiling. Not a fault;
    /// callers present upgrade messaging rather than an error.
    LimitReached { message: String },
    /// Terminal failure. Fired exactly once per failed session.
    Failed { message: String },
}

struct Shared {
    state: SessionState,
    transcript: TranscriptBuffer,
    tier: Option<String>,
    max_duration_seconds: Option<u64>,
    last_error: Option<String>,
}

/// Resources owned by one live session, torn down as a unit.
struct Active {
    stop_tx: watch::Sender<bool>,
    sender: ChunkSender,
    control: Arc<dyn CaptureControl>,
    timer_tasks: Vec<JoinHandle<()>>,
}

/// Controller for live voice-to-text streaming: owns the state machine,
/// mediates between audio capture and the transport, and reports outcomes
/// through the event channel returned by [`DictationSession::new`].
///
/// Single-flight: one capture device, one connection, and one pair of
/// timers at most. A `start_recording` while a session is active is a
/// no-op; failures funnel through one teardown routine and surface as
/// exactly one terminal event.
pub struct DictationSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    connector: Arc<dyn Connector>,
    capture: Arc<dyn CaptureFactory>,
    credential: String,
    events: mpsc::Sender<SessionEvent>,
    shared: Mutex<Shared>,
    elapsed: Arc<AtomicU64>,
    active: tokio::sync::Mutex<Option<Active>>,
}

impl DictationSession {
    pub fn new(
        connector: Arc<dyn Connector>,
        capture: Arc<dyn CaptureFactory>,
        credential: impl Into<String>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let inner = Arc::new(SessionInner {
            connector,
            capture,
            credential: credential.into(),
            events: events_tx,
            shared: Mutex::new(Shared {
                state: SessionState::Idle,
                transcript: TranscriptBuffer::new(),
                tier: None,
                max_duration_seconds: None,
                last_error: None,
            }),
            elapsed: Arc::new(AtomicU64::new(0)),
            active: tokio::sync::Mutex::new(None),
        });

        (Self { inner }, events_rx)
    }

    /// Start a session: open the transport, await the service's accept, then
    /// begin capture. Failures are reported through the event channel, never
    /// returned, so callers have one uniform error path.
    pub async fn start_recording(&self) {
        self.inner.start().await;
    }

    /// Tear down the active session, if any. Idempotent; safe from any
    /// state, including mid-handshake, and always releases the device and
    /// the connection.
    pub async fn stop_recording(&self) {
        self.inner.stop().await;
    }

    /// Clear both transcripts without affecting session state.
    pub fn clear_transcript(&self) {
        self.inner.shared().transcript.clear();
    }

    /// `Error -> Idle`. No-op in any other state.
    pub fn clear_error(&self) {
        let mut shared = self.inner.shared();
        if shared.state == SessionState::Error {
            shared.state = SessionState::Idle;
            shared.last_error = None;
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared().state
    }

    pub fn final_transcript(&self) -> String {
        self.inner.shared().transcript.final_text().to_string()
    }

    pub fn interim_transcript(&self) -> String {
        self.inner.shared().transcript.interim_text().to_string()
    }

    pub fn tier(&self) -> Option<String> {
        self.inner.shared().tier.clone()
    }

    pub fn max_duration_seconds(&self) -> Option<u64> {
        self.inner.shared().max_duration_seconds
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.inner.elapsed.load(Ordering::SeqCst)
    }

    pub fn remaining_seconds(&self) -> Option<u64> {
        let max = self.inner.shared().max_duration_seconds?;
        Some(max.saturating_sub(self.elapsed_seconds()))
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.shared().last_error.clone()
    }
}

impl SessionInner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn start(self: &Arc<Self>) {
        {
            let mut shared = self.shared();
            if shared.state != SessionState::Idle {
                warn!(state = ?shared.state, "start_recording ignored while session is active");
                return;
            }
            shared.state = SessionState::Connecting;
        }

        if self.credential.is_empty() {
            self.fail("no credential available for the transcription service".to_string())
                .await;
            return;
        }

        if !self.capture.is_available() {
            self.fail("no audio capture capability available".to_string())
                .await;
            return;
        }

        info!("opening transcription transport");
        let mut handle = match self.connector.open(&self.credential).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(e.to_string()).await;
                return;
            }
        };

        // The service must accept the session before any audio is captured;
        // this ordering is the core correctness invariant of the component.
        let accepted = match handle.ready().await {
            Ok(accepted) => accepted,
            Err(e) => {
                handle.sender().close().await;
                self.fail(e.to_string()).await;
                return;
            }
        };

        let (mut stream, control) = match self.capture.open().await {
            Ok(pair) => pair,
            Err(e) => {
                handle.sender().close().await;
                self.fail(e.to_string()).await;
                return;
            }
        };

        let sender = handle.sender();
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut active_guard = self.active.lock().await;

        let stopped_during_handshake = {
            let mut shared = self.shared();
            if shared.state != SessionState::Connecting {
                true
            } else {
                shared.tier = Some(accepted.tier.clone());
                shared.max_duration_seconds = Some(accepted.max_duration_seconds);
                shared.last_error = None;
                shared.state = SessionState::Recording;
                false
            }
        };

        if stopped_during_handshake {
            drop(active_guard);
            debug!("stop requested during handshake; releasing resources");
            control.stop();
            sender.close().await;
            return;
        }

        self.elapsed.store(0, Ordering::SeqCst);
        info!(
            tier = %accepted.tier,
            max_duration_seconds = accepted.max_duration_seconds,
            "session accepted; recording"
        );

        // Audio pump: capture chunks feed the transport's outbound path.
        // Chunks emitted after a stop request are dropped, never queued.
        tokio::spawn({
            let this = Arc::clone(self);
            let sender = sender.clone();
            let mut stop = stop_rx.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        chunk = stream.recv() => {
                            let Some(chunk) = chunk else {
                                if !*stop.borrow() {
                                    this.fail("audio capture ended unexpectedly".to_string())
                                        .await;
                                }
                                break;
                            };

                            if *stop.borrow() {
                                debug!("chunk dropped after stop request");
                                break;
                            }

                            if let Err(e) = sender.send(chunk).await {
                                debug!(error = %e, "chunk dropped; transport is closing");
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Inbound message loop: interprets protocol messages and drives the
        // state machine on close or failure.
        tokio::spawn({
            let this = Arc::clone(self);
            let mut stop = stop_rx.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        event = handle.next_event() => {
                            let Some(event) = event else {
                                if !*stop.borrow() {
                                    this.fail("connection closed unexpectedly".to_string())
                                        .await;
                                }
                                break;
                            };

                            if this.handle_transport_event(event, &stop).await {
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Duration timer: one tick per second for the time-remaining
        // readout. The service stays authoritative for the limit itself.
        let duration_task = tokio::spawn({
            let elapsed = Arc::clone(&self.elapsed);
            async move {
                let mut ticker = interval(TIMER_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    elapsed.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        // Backup flush: defends against encoders that buffer internally and
        // would otherwise starve the transport if the cadence stalls.
        let flush_task = tokio::spawn({
            let control = Arc::clone(&control);
            async move {
                let mut ticker = interval(TIMER_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    control.flush();
                }
            }
        });

        *active_guard = Some(Active {
            stop_tx,
            sender,
            control,
            timer_tasks: vec![duration_task, flush_task],
        });
    }

    /// Returns true when the message loop should end.
    async fn handle_transport_event(
        self: &Arc<Self>,
        event: TransportEvent,
        stop: &watch::Receiver<bool>,
    ) -> bool {
        match event {
            TransportEvent::Message(ServerMsg::Transcript { text, is_final }) => {
                let update = {
                    let mut shared = self.shared();
                    shared.transcript.apply(&text, is_final);
                    SessionEvent::TranscriptUpdate {
                        final_text: shared.transcript.final_text().to_string(),
                        interim_text: shared.transcript.interim_text().to_string(),
                    }
                };
                let _ = self.events.send(update).await;
                false
            }
            TransportEvent::Message(ServerMsg::DurationLimitReached { message }) => {
                self.limit_reached(message).await;
                true
            }
            TransportEvent::Message(ServerMsg::Error { message }) => {
                self.fail(message).await;
                true
            }
            TransportEvent::Message(ServerMsg::SessionAccepted { .. }) => {
                self.fail("unexpected session accept after the handshake".to_string())
                    .await;
                true
            }
            TransportEvent::Closed { code, reason } => {
                if !*stop.borrow() {
                    self.fail(close_error(code, &reason).to_string()).await;
                }
                true
            }
            TransportEvent::Failed(reason) => {
                self.fail(reason).await;
                true
            }
        }
    }

    async fn stop(&self) {
        self.teardown().await;

        let mut shared = self.shared();
        match shared.state {
            SessionState::Idle => {
                debug!("stop_recording while idle is a no-op");
            }
            // Resources are already released on entry to Error; the state
            // survives until clear_error or the next start.
            SessionState::Error => {}
            _ => {
                shared.state = SessionState::Idle;
                shared.transcript.clear_interim();
                info!("dictation session stopped");
            }
        }
    }

    /// The single teardown routine every exit path funnels through: stop
    /// the timers, stop capture, close the transport. The pump and message
    /// loop exit on the stop signal.
    async fn teardown(&self) {
        let active = { self.active.lock().await.take() };
        let Some(active) = active else {
            return;
        };

        let _ = active.stop_tx.send(true);
        active.control.stop();
        active.sender.close().await;

        for task in active.timer_tasks {
            task.abort();
        }
    }

    async fn fail(&self, message: String) {
        self.teardown().await;

        {
            let mut shared = self.shared();
            match shared.state {
                // Already terminal: the session was stopped or has reported
                // a failure. Exactly one terminal event per session.
                SessionState::Idle | SessionState::Error => {
                    debug!(%message, "suppressing duplicate failure report");
                    return;
                }
                _ => {}
            }
            shared.state = SessionState::Error;
            shared.last_error = Some(message.clone());
            shared.transcript.clear_interim();
        }

        warn!(%message, "dictation session failed");
        let _ = self.events.send(SessionEvent::Failed { message }).await;
    }

    async fn limit_reached(&self, message: String) {
        self.teardown().await;

        {
            let mut shared = self.shared();
            if shared.state != SessionState::Recording {
                return;
            }
            shared.state = SessionState::Error;
            shared.last_error = Some(message.clone());
            shared.transcript.clear_interim();
        }

        info!(%message, "duration limit reached");
        let _ = self
            .events
            .send(SessionEvent::LimitReached { message })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioChunk, CaptureStream};
    use crate::error::Result;
    use crate::transport::{SendCmd, TransportHandle, CLOSE_ACCESS_DENIED};

    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeConnector {
        events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
        sent: Arc<Mutex<Vec<AudioChunk>>>,
        opens: AtomicUsize,
    }

    impl FakeConnector {
        fn new() -> (Arc<Self>, mpsc::Sender<TransportEvent>) {
            let (events_tx, events_rx) = mpsc::channel(64);
            let connector = Arc::new(Self {
                events_rx: Mutex::new(Some(events_rx)),
                sent: Arc::new(Mutex::new(Vec::new())),
                opens: AtomicUsize::new(0),
            });
            (connector, events_tx)
        }

        fn sent(&self) -> Vec<AudioChunk> {
            self.sent.lock().unwrap().clone()
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(&self, _credential: &str) -> Result<TransportHandle> {
            self.opens.fetch_add(1, Ordering::SeqCst);

            let events_rx = self
                .events_rx
                .lock()
                .unwrap()
                .take()
                .expect("one open per test");

            let (tx, mut rx) = mpsc::channel::<SendCmd>(64);
            let sent = Arc::clone(&self.sent);
            tokio::spawn(async move {
                while let Some(cmd) = rx.recv().await {
                    match cmd {
                        SendCmd::Chunk(chunk) => sent.lock().unwrap().push(chunk),
                        SendCmd::Close => break,
                    }
                }
            });

            Ok(TransportHandle::from_parts(tx, events_rx))
        }
    }

    struct FakeCapture {
        available: bool,
        stream_rx: Mutex<Option<mpsc::Receiver<AudioChunk>>>,
        chunk_tx: mpsc::Sender<AudioChunk>,
        flushes: Arc<AtomicUsize>,
        opens: AtomicUsize,
    }

    impl FakeCapture {
        fn new(available: bool) -> (Arc<Self>, mpsc::Sender<AudioChunk>) {
            let (chunk_tx, stream_rx) = mpsc::channel(64);
            let capture = Arc::new(Self {
                available,
                stream_rx: Mutex::new(Some(stream_rx)),
                chunk_tx: chunk_tx.clone(),
                flushes: Arc::new(AtomicUsize::new(0)),
                opens: AtomicUsize::new(0),
            });
            (capture, chunk_tx)
        }

        fn flushes(&self) -> usize {
            self.flushes.load(Ordering::SeqCst)
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    struct FakeStream {
        rx: mpsc::Receiver<AudioChunk>,
    }

    #[async_trait]
    impl CaptureStream for FakeStream {
        async fn recv(&mut self) -> Option<AudioChunk> {
            self.rx.recv().await
        }
    }

    struct FakeControl {
        flushes: Arc<AtomicUsize>,
        chunk_tx: mpsc::Sender<AudioChunk>,
        stopped: std::sync::atomic::AtomicBool,
    }

    impl CaptureControl for FakeControl {
        fn flush(&self) {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            self.flushes.fetch_add(1, Ordering::SeqCst);
            // A flush with nothing buffered still emits a zero-byte chunk.
            let _ = self.chunk_tx.try_send(AudioChunk::empty());
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CaptureFactory for FakeCapture {
        fn is_available(&self) -> bool {
            self.available
        }

        async fn open(&self) -> Result<(Box<dyn CaptureStream>, Arc<dyn CaptureControl>)> {
            self.opens.fetch_add(1, Ordering::SeqCst);

            let rx = self
                .stream_rx
                .lock()
                .unwrap()
                .take()
                .expect("one open per test");

            let control = Arc::new(FakeControl {
                flushes: Arc::clone(&self.flushes),
                chunk_tx: self.chunk_tx.clone(),
                stopped: std::sync::atomic::AtomicBool::new(false),
            });

            Ok((Box::new(FakeStream { rx }), control))
        }
    }

    fn accepted(tier: &str, max_duration_seconds: u64) -> TransportEvent {
        TransportEvent::Message(ServerMsg::SessionAccepted {
            tier: tier.to_string(),
            max_duration_seconds,
        })
    }

    fn transcript(text: &str, is_final: bool) -> TransportEvent {
        TransportEvent::Message(ServerMsg::Transcript {
            text: text.to_string(),
            is_final,
        })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn drain(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn message_before_accept_fails_without_sending_audio() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(true);
        let (session, mut events) =
            DictationSession::new(connector.clone(), capture.clone(), "token");

        events_tx
            .send(transcript("too early", false))
            .await
            .unwrap();

        session.start_recording().await;

        assert_eq!(session.state(), SessionState::Error);
        assert!(connector.sent().is_empty());
        assert_eq!(capture.opens(), 0);

        match events.recv().await.unwrap() {
            SessionEvent::Failed { message } => {
                assert!(message.contains("session accept"), "got: {message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent_from_any_state() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(true);
        let (session, mut events) = DictationSession::new(connector, capture, "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;
        assert_eq!(session.state(), SessionState::Recording);

        session.stop_recording().await;
        assert_eq!(session.state(), SessionState::Idle);

        session.stop_recording().await;
        session.stop_recording().await;
        assert_eq!(session.state(), SessionState::Idle);

        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn zero_byte_chunk_is_forwarded_without_error() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, chunk_tx) = FakeCapture::new(true);
        let (session, mut events) =
            DictationSession::new(connector.clone(), capture, "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;

        chunk_tx.send(AudioChunk::empty()).await.unwrap();

        let sent = Arc::clone(&connector.sent);
        wait_until(move || !sent.lock().unwrap().is_empty()).await;

        let sent = connector.sent();
        assert!(sent[0].is_empty());
        assert!(drain(&mut events).is_empty());

        session.stop_recording().await;
    }

    #[tokio::test]
    async fn interim_is_replaced_and_final_is_appended() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(true);
        let (session, mut events) = DictationSession::new(connector, capture, "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;

        events_tx.send(transcript("hello", false)).await.unwrap();
        events_tx
            .send(transcript("hello world", false))
            .await
            .unwrap();
        events_tx
            .send(transcript("hello world.", true))
            .await
            .unwrap();

        let mut updates = Vec::new();
        for _ in 0..3 {
            updates.push(events.recv().await.unwrap());
        }

        assert_eq!(session.final_transcript(), "hello world.");
        assert_eq!(session.interim_transcript(), "");

        assert_eq!(
            updates[1],
            SessionEvent::TranscriptUpdate {
                final_text: String::new(),
                interim_text: "hello world".to_string(),
            }
        );
        assert_eq!(
            updates[2],
            SessionEvent::TranscriptUpdate {
                final_text: "hello world.".to_string(),
                interim_text: String::new(),
            }
        );

        session.stop_recording().await;
    }

    #[tokio::test]
    async fn limit_reached_is_not_reported_as_an_error() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(true);
        let (session, mut events) = DictationSession::new(connector, capture, "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;

        events_tx
            .send(TransportEvent::Message(ServerMsg::DurationLimitReached {
                message: "starter tier allows 5 minutes".to_string(),
            }))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            SessionEvent::LimitReached { message } => {
                assert!(message.contains("5 minutes"));
            }
            other => panic!("expected LimitReached, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Error);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn access_denied_close_is_reported_as_an_error() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(true);
        let (session, mut events) = DictationSession::new(connector, capture, "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;

        events_tx
            .send(TransportEvent::Closed {
                code: CLOSE_ACCESS_DENIED,
                reason: "subscription expired".to_string(),
            })
            .await
            .unwrap();

        let probe = session.inner.clone();
        wait_until(move || probe.shared().state == SessionState::Error).await;

        match events.recv().await.unwrap() {
            SessionEvent::Failed { message } => {
                assert!(message.contains("access denied"), "got: {message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_streams_chunks_and_stops_clean() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, chunk_tx) = FakeCapture::new(true);
        let (session, mut events) =
            DictationSession::new(connector.clone(), capture, "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;

        assert_eq!(session.state(), SessionState::Recording);
        assert_eq!(session.tier().as_deref(), Some("starter"));
        assert_eq!(session.max_duration_seconds(), Some(300));

        for i in 0..3u8 {
            chunk_tx
                .send(AudioChunk::new(vec![i; 16]))
                .await
                .unwrap();
        }

        let sent = Arc::clone(&connector.sent);
        wait_until(move || sent.lock().unwrap().len() >= 3).await;

        events_tx.send(transcript("ok", true)).await.unwrap();
        let probe = session.inner.clone();
        wait_until(move || probe.shared().transcript.final_text() == "ok").await;

        tokio::time::advance(Duration::from_secs(2)).await;
        wait_until(|| session.elapsed_seconds() >= 2).await;
        assert_eq!(session.remaining_seconds(), Some(300 - session.elapsed_seconds()));

        session.stop_recording().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.final_transcript(), "ok");

        // Three audio chunks reached the transport; anything beyond them is
        // a zero-byte backup flush.
        let sent = connector.sent();
        assert_eq!(sent.iter().filter(|c| !c.is_empty()).count(), 3);

        // The duration timer is dead after teardown.
        let frozen = session.elapsed_seconds();
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(session.elapsed_seconds(), frozen);

        let observed = drain(&mut events);
        assert!(!observed
            .iter()
            .any(|ev| matches!(ev, SessionEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn missing_capture_capability_fails_before_connecting() {
        let (connector, _events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(false);
        let (session, mut events) =
            DictationSession::new(connector.clone(), capture, "token");

        session.start_recording().await;

        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(connector.opens(), 0);

        match events.recv().await.unwrap() {
            SessionEvent::Failed { message } => {
                assert!(message.contains("capture"), "got: {message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        session.clear_error();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn backup_flush_fires_when_the_cadence_stalls() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(true);
        let (session, _events) =
            DictationSession::new(connector.clone(), capture.clone(), "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;
        assert_eq!(capture.flushes(), 0);

        // No capture cadence fires at all; the backup timer still forces a
        // chunk out at the one-second mark.
        tokio::time::advance(Duration::from_millis(1100)).await;

        let flushes = Arc::clone(&capture.flushes);
        wait_until(move || flushes.load(Ordering::SeqCst) >= 1).await;

        let sent = Arc::clone(&connector.sent);
        wait_until(move || !sent.lock().unwrap().is_empty()).await;

        session.stop_recording().await;
    }

    #[tokio::test]
    async fn empty_credential_fails_without_connecting() {
        let (connector, _events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(true);
        let (session, mut events) =
            DictationSession::new(connector.clone(), capture, "");

        session.start_recording().await;

        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(connector.opens(), 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn chunks_after_stop_never_reach_the_transport() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, chunk_tx) = FakeCapture::new(true);
        let (session, mut events) =
            DictationSession::new(connector.clone(), capture, "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;

        chunk_tx.send(AudioChunk::new(vec![1; 16])).await.unwrap();
        let sent = Arc::clone(&connector.sent);
        wait_until(move || sent.lock().unwrap().len() == 1).await;

        session.stop_recording().await;

        // A chunk emitted after the stop request is dropped, never queued.
        // The send itself may fail once the pump has released the stream.
        let _ = chunk_tx.send(AudioChunk::new(vec![2; 16])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(connector.sent().len(), 1);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn stop_during_handshake_releases_without_installing() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, chunk_tx) = FakeCapture::new(true);
        let (session, mut events) =
            DictationSession::new(connector.clone(), capture.clone(), "token");

        let starter = session.inner.clone();
        let start = tokio::spawn(async move { starter.start().await });

        let probe = session.inner.clone();
        wait_until(move || probe.shared().state == SessionState::Connecting).await;

        session.stop_recording().await;
        assert_eq!(session.state(), SessionState::Idle);

        // The service accepts only after the caller has already stopped; the
        // in-flight start must release the transport and device quietly.
        events_tx.send(accepted("starter", 300)).await.unwrap();
        start.await.unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(capture.opens(), 1);
        assert!(session.inner.active.lock().await.is_none());

        // The chunk stream was released along with the device, so audio has
        // nowhere to go.
        assert!(chunk_tx.send(AudioChunk::new(vec![1; 16])).await.is_err());
        assert!(connector.sent().is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn clear_transcript_is_safe_mid_recording() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(true);
        let (session, _events) = DictationSession::new(connector, capture, "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;

        events_tx.send(transcript("first line.", true)).await.unwrap();
        let probe = session.inner.clone();
        wait_until(move || probe.shared().transcript.final_text() == "first line.").await;

        session.clear_transcript();
        assert_eq!(session.final_transcript(), "");
        assert_eq!(session.state(), SessionState::Recording);

        session.stop_recording().await;
    }

    #[tokio::test]
    async fn second_start_while_recording_is_a_no_op() {
        let (connector, events_tx) = FakeConnector::new();
        let (capture, _chunk_tx) = FakeCapture::new(true);
        let (session, _events) =
            DictationSession::new(connector.clone(), capture, "token");

        events_tx.send(accepted("starter", 300)).await.unwrap();
        session.start_recording().await;
        assert_eq!(session.state(), SessionState::Recording);

        session.start_recording().await;
        assert_eq!(session.state(), SessionState::Recording);
        assert_eq!(connector.opens(), 1);

        session.stop_recording().await;
    }
}
