//! # Assessment Session State Machine
//!
//! One [`AssessmentSession`] coordinates one client connection from the configuration
//! frame to teardown:
//!
//! ```text
//! AwaitingConfig ──config ok──> Starting ──engine started──> Streaming
//!       │                          │                           │   │
//!       │ bad config               │ start failed   end-of-stream│   │engine done / failure
//!       ▼                          ▼                           ▼   │ / client gone
//!   Terminated <────────────── Terminated <──────────────── Draining ┘
//! ```
//!
//! While streaming, the reader worker runs as its own task and the engine reports through
//! [`SessionListener`], which writes status frames itself and then signals the state
//! machine. The state machine reacts to whichever of "reader finished" and "engine
//! finished" happens first.
//!
//! ## Teardown guarantees:
//! [`Teardown`] runs on every exit path and is idempotent: the engine is stopped at most
//! once, the connection is closed at most once, and the debug recording (if any) is
//! flushed. A panic anywhere in the session is caught by [`AssessmentSession::run_guarded`]
//! and turned into one `internal error` frame.

use super::classifier;
use super::protocol::{SessionSettings, StatusFrame};
use super::pump::{EngineSlot, ReaderExit, ReaderReport, ReaderWorker, Responder, SharedEngine};
use super::transport::{FrameReceiver, TransportMessage};
use crate::audio::AudioRecorder;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::recognition::{
    AssessmentResult, EngineError, EngineListener, EngineParams, RecognitionEngine,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingConfig,
    Starting,
    Streaming,
    Draining,
    Terminated,
}

/// How a session ended, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The engine delivered its final result
    Completed,
    /// The configuration frame was unusable
    Rejected,
    /// The engine failed to start or failed while running
    EngineFailed,
    /// The engine did not finish within the drain timeout
    TimedOut,
    /// The client went away first
    Aborted,
    /// Panic or lost worker
    Internal,
}

impl SessionOutcome {
    pub fn is_success(self) -> bool {
        self == SessionOutcome::Completed
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub outcome: SessionOutcome,
    /// State the session was in when it returned; `Terminated` once teardown has run
    pub final_state: SessionState,
    /// Mode sent to the engine, once known
    pub eval_mode: Option<i64>,
    pub frames_received: u64,
    pub bytes_received: usize,
    pub frames_sent: u64,
    pub recording: Option<PathBuf>,
}

impl SessionReport {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            outcome: SessionOutcome::Internal,
            final_state: SessionState::AwaitingConfig,
            eval_mode: None,
            frames_received: 0,
            bytes_received: 0,
            frames_sent: 0,
            recording: None,
        }
    }
}

/// The first terminal notification from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineTerminal {
    Completed,
    Failed(EngineError),
}

/// Receiving side of the listener's signals.
pub struct EngineEvents {
    failures: mpsc::Receiver<EngineError>,
    completion: oneshot::Receiver<()>,
}

impl EngineEvents {
    /// Wait for completion or failure. Resolves once; do not poll again afterwards.
    pub async fn next_terminal(&mut self) -> EngineTerminal {
        tokio::select! {
            Some(err) = self.failures.recv() => EngineTerminal::Failed(err),
            Ok(()) = &mut self.completion => EngineTerminal::Completed,
            else => EngineTerminal::Failed(EngineError::Closed(
                "engine went away without a result".to_string(),
            )),
        }
    }
}

/// Engine listener for one session.
///
/// Status frames go straight to the client through the shared [`Responder`]; the state
/// machine only learns that the engine finished (or failed).
pub struct SessionListener {
    session_id: String,
    responder: Arc<Responder>,
    failures: mpsc::Sender<EngineError>,
    completion: StdMutex<Option<oneshot::Sender<()>>>,
    intermediate_results: AtomicU64,
}

impl SessionListener {
    pub fn new(session_id: impl Into<String>, responder: Arc<Responder>) -> (Arc<Self>, EngineEvents) {
        let (failure_tx, failure_rx) = mpsc::channel(1);
        let (completion_tx, completion_rx) = oneshot::channel();
        let listener = Arc::new(Self {
            session_id: session_id.into(),
            responder,
            failures: failure_tx,
            completion: StdMutex::new(Some(completion_tx)),
            intermediate_results: AtomicU64::new(0),
        });
        let events = EngineEvents {
            failures: failure_rx,
            completion: completion_rx,
        };
        (listener, events)
    }

    fn signal_completion(&self) {
        let sender = match self.completion.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

#[async_trait]
impl EngineListener for SessionListener {
    async fn on_start(&self, voice_id: &str) {
        info!("Session {}: engine started (voice_id {})", self.session_id, voice_id);
        self.responder.send(StatusFrame::start()).await;
    }

    async fn on_intermediate_result(&self, result: AssessmentResult) {
        let count = self.intermediate_results.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Session {}: intermediate result #{} ({} words)",
            self.session_id,
            count,
            result.words.len()
        );
        self.responder.send(StatusFrame::intermediate(result)).await;
    }

    async fn on_complete(&self, result: AssessmentResult) {
        info!(
            "Session {}: assessment complete, overall score {:.2}",
            self.session_id, result.overall_score
        );
        self.responder.send(StatusFrame::complete(result)).await;
        self.signal_completion();
    }

    async fn on_fail(&self, error: EngineError) {
        warn!("Session {}: engine failed: {}", self.session_id, error);
        let err = SessionError::EngineRuntime(error.clone());
        self.responder.send_error(&err).await;
        if self.failures.try_send(error).is_err() {
            debug!("Session {}: engine failure already reported", self.session_id);
        }
    }
}

/// Idempotent cleanup for one session.
pub struct Teardown {
    session_id: String,
    responder: Arc<Responder>,
    engine: Option<SharedEngine>,
    recorder: Option<AudioRecorder>,
    recording: Option<PathBuf>,
    done: bool,
}

impl Teardown {
    pub fn new(session_id: impl Into<String>, responder: Arc<Responder>) -> Self {
        Self {
            session_id: session_id.into(),
            responder,
            engine: None,
            recorder: None,
            recording: None,
            done: false,
        }
    }

    pub fn attach_engine(&mut self, engine: SharedEngine) {
        self.engine = Some(engine);
    }

    pub fn attach_recorder(&mut self, recorder: AudioRecorder) {
        self.recorder = Some(recorder);
    }

    /// Path of the saved recording, once teardown has written it.
    pub fn recording(&self) -> Option<&PathBuf> {
        self.recording.as_ref()
    }

    pub async fn run(&mut self) {
        if self.done {
            debug!("Session {}: teardown already ran", self.session_id);
            return;
        }
        self.done = true;

        if let Some(engine) = self.engine.take() {
            engine.lock().await.release().await;
        }

        if let Some(recorder) = self.recorder.take() {
            match recorder.finish().await {
                Ok(path) => {
                    info!("Session {}: saved audio to {}", self.session_id, path.display());
                    self.recording = Some(path);
                }
                Err(e) => warn!("Session {}: failed to save audio: {}", self.session_id, e),
            }
        }

        self.responder.close().await;
        debug!("Session {}: teardown complete", self.session_id);
    }
}

enum FirstEvent {
    Reader(Result<ReaderReport, JoinError>),
    Engine(EngineTerminal),
}

/// Coordinator for one client connection.
pub struct AssessmentSession {
    id: String,
    state: SessionState,
    started_at: DateTime<Utc>,
    limits: SessionConfig,
    engine: Arc<dyn RecognitionEngine>,
    responder: Arc<Responder>,
}

impl AssessmentSession {
    pub fn new(
        id: impl Into<String>,
        engine: Arc<dyn RecognitionEngine>,
        responder: Arc<Responder>,
        limits: SessionConfig,
    ) -> Self {
        Self {
            id: id.into(),
            state: SessionState::AwaitingConfig,
            started_at: Utc::now(),
            limits,
            engine,
            responder,
        }
    }

    /// Run the session, turning a panic into an `internal error` frame.
    pub async fn run_guarded(self, receiver: Box<dyn FrameReceiver>) -> SessionReport {
        let session_id = self.id.clone();
        let responder = self.responder.clone();

        match AssertUnwindSafe(self.run(receiver)).catch_unwind().await {
            Ok(report) => report,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!("Session {}: panicked: {}", session_id, reason);
                responder.send_error(&SessionError::Internal(reason)).await;
                responder.close().await;

                let mut report = SessionReport::new(&session_id);
                report.final_state = SessionState::Terminated;
                report.frames_sent = responder.frames_sent();
                report
            }
        }
    }

    /// Run the session to completion. Teardown has always happened when this returns.
    pub async fn run(mut self, receiver: Box<dyn FrameReceiver>) -> SessionReport {
        info!("Session {}: awaiting configuration", self.id);

        let mut report = SessionReport::new(&self.id);
        let mut teardown = Teardown::new(self.id.clone(), self.responder.clone());

        let outcome = self.drive(receiver, &mut teardown, &mut report).await;
        report.outcome = outcome;

        teardown.run().await;
        report.recording = teardown.recording().cloned();
        report.frames_sent = self.responder.frames_sent();
        self.transition(SessionState::Terminated);
        report.final_state = self.state;

        info!(
            "Session {}: finished {:?} after {}s ({} frames in, {} bytes, {} frames out)",
            self.id,
            report.outcome,
            (Utc::now() - self.started_at).num_seconds(),
            report.frames_received,
            report.bytes_received,
            report.frames_sent
        );
        report
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    async fn drive(
        &mut self,
        mut receiver: Box<dyn FrameReceiver>,
        teardown: &mut Teardown,
        report: &mut SessionReport,
    ) -> SessionOutcome {
        let settings = match Self::await_config(&mut *receiver).await {
            Ok(settings) => settings,
            Err(SessionError::Transport(reason)) => {
                info!("Session {}: client left before configuring: {}", self.id, reason);
                return SessionOutcome::Aborted;
            }
            Err(err) => {
                warn!("Session {}: rejected configuration: {}", self.id, err);
                self.responder.send_error(&err).await;
                return SessionOutcome::Rejected;
            }
        };

        self.transition(SessionState::Starting);
        let eval_mode = classifier::effective_eval_mode(settings.eval_mode, &settings.ref_text);
        if eval_mode != settings.eval_mode {
            info!(
                "Session {}: eval_mode {} replaced by {} from reference text",
                self.id, settings.eval_mode, eval_mode
            );
        }
        report.eval_mode = Some(eval_mode);

        let params = EngineParams {
            voice_id: self.id.clone(),
            ref_text: settings.ref_text.clone(),
            server_engine_type: settings.server_engine_type.clone(),
            score_coeff: settings.score_coeff,
            eval_mode,
            text_mode: settings.text_mode,
        };

        let (listener, mut events) = SessionListener::new(self.id.clone(), self.responder.clone());
        let handle = match self.engine.start(params, listener).await {
            Ok(handle) => handle,
            Err(e) => {
                let err = SessionError::EngineStart(e);
                error!("Session {}: {}", self.id, err);
                self.responder.send_error(&err).await;
                return SessionOutcome::EngineFailed;
            }
        };
        let engine = EngineSlot::shared(handle);
        teardown.attach_engine(engine.clone());

        let recorder = if settings.save_audio {
            self.create_recorder().await
        } else {
            None
        };

        self.transition(SessionState::Streaming);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let mut reader = tokio::spawn(
            ReaderWorker::new(self.id.clone(), receiver, engine.clone(), recorder).run(shutdown_rx),
        );

        let first = tokio::select! {
            joined = &mut reader => FirstEvent::Reader(joined),
            terminal = events.next_terminal() => FirstEvent::Engine(terminal),
        };

        match first {
            FirstEvent::Engine(terminal) => {
                let _ = shutdown_tx.send(());
                self.collect_reader(reader.await, teardown, report);
                match terminal {
                    EngineTerminal::Completed => SessionOutcome::Completed,
                    EngineTerminal::Failed(e) => {
                        debug!("Session {}: ending after engine failure: {}", self.id, e);
                        self.report_engine_failure(e).await;
                        SessionOutcome::EngineFailed
                    }
                }
            }
            FirstEvent::Reader(joined) => match self.collect_reader(joined, teardown, report) {
                Some(ReaderExit::EndOfStream) => match self.drain(&mut events).await {
                    Some(EngineTerminal::Completed) => SessionOutcome::Completed,
                    Some(EngineTerminal::Failed(e)) => {
                        self.report_engine_failure(e).await;
                        SessionOutcome::EngineFailed
                    }
                    None => {
                        let err = SessionError::DrainTimeout(self.limits.drain_timeout_secs);
                        warn!("Session {}: {}", self.id, err);
                        self.responder.send_error(&err).await;
                        SessionOutcome::TimedOut
                    }
                },
                Some(ReaderExit::Aborted(reason)) => {
                    info!("Session {}: client gone: {}", self.id, reason);
                    engine.lock().await.stop().await;
                    if self.drain(&mut events).await.is_none() {
                        debug!("Session {}: engine did not finish after abort", self.id);
                    }
                    SessionOutcome::Aborted
                }
                Some(ReaderExit::EngineWriteFailed(e)) => {
                    let err = SessionError::EngineRuntime(e);
                    warn!("Session {}: {}", self.id, err);
                    self.responder.send_error(&err).await;
                    SessionOutcome::EngineFailed
                }
                Some(ReaderExit::Shutdown) => SessionOutcome::Aborted,
                None => {
                    let err = SessionError::Internal("reader task failed".to_string());
                    self.responder.send_error(&err).await;
                    SessionOutcome::Internal
                }
            },
        }
    }

    /// The listener normally sent this frame already and the responder drops the repeat.
    /// When the engine side vanished without a callback, this is the only error frame.
    async fn report_engine_failure(&self, error: EngineError) {
        self.responder
            .send_error(&SessionError::EngineRuntime(error))
            .await;
    }

    async fn await_config(receiver: &mut dyn FrameReceiver) -> Result<SessionSettings, SessionError> {
        match receiver.recv().await {
            None => Err(SessionError::Transport(
                "connection closed before configuration".to_string(),
            )),
            Some(Err(e)) => Err(SessionError::Transport(e.to_string())),
            Some(Ok(TransportMessage::Close(_))) => Err(SessionError::Transport(
                "client closed before configuration".to_string(),
            )),
            Some(Ok(TransportMessage::Text(text))) => SessionSettings::parse(text.as_bytes()),
            Some(Ok(TransportMessage::Binary(data))) => SessionSettings::parse(&data),
        }
    }

    /// Wait for the engine's final word. `None` on timeout.
    async fn drain(&mut self, events: &mut EngineEvents) -> Option<EngineTerminal> {
        self.transition(SessionState::Draining);
        tokio::time::timeout(self.limits.drain_timeout(), events.next_terminal())
            .await
            .ok()
    }

    fn collect_reader(
        &self,
        joined: Result<ReaderReport, JoinError>,
        teardown: &mut Teardown,
        report: &mut SessionReport,
    ) -> Option<ReaderExit> {
        match joined {
            Ok(reader) => {
                report.frames_received = reader.stats.frames;
                report.bytes_received = reader.stats.bytes;
                if let Some(recorder) = reader.recorder {
                    teardown.attach_recorder(recorder);
                }
                Some(reader.exit)
            }
            Err(e) => {
                error!("Session {}: reader task failed: {}", self.id, e);
                None
            }
        }
    }

    async fn create_recorder(&self) -> Option<AudioRecorder> {
        match AudioRecorder::create(&self.limits.audio_dir, &self.id, self.started_at).await {
            Ok(recorder) => {
                info!("Session {}: recording audio to {}", self.id, recorder.path().display());
                Some(recorder)
            }
            Err(e) => {
                warn!("Session {}: cannot record audio: {}", self.id, e);
                None
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::protocol::Status;
    use crate::assessment::transport::{
        ChannelReceiver, ChannelSender, InboundItem, OutboundCommand,
    };
    use crate::config::AppConfig;
    use crate::recognition::EngineHandle;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Script {
        CompleteOnStop,
        FailOnStart,
        FailImmediately,
        FailWrites,
        NeverFinish,
        PanicOnStart,
        VanishAfterStart,
    }

    #[derive(Default)]
    struct Calls {
        params: Option<EngineParams>,
        writes: Vec<Vec<u8>>,
        stops: usize,
    }

    struct FakeEngine {
        script: Script,
        calls: Arc<StdMutex<Calls>>,
    }

    struct FakeHandle {
        script: Script,
        listener: Option<Arc<dyn EngineListener>>,
        calls: Arc<StdMutex<Calls>>,
    }

    fn sample_result() -> AssessmentResult {
        AssessmentResult {
            overall_score: 87.654321,
            pron_accuracy: 91.25,
            pron_fluency: 0.873,
            pron_completion: 1.0,
            words: Vec::new(),
        }
    }

    #[async_trait]
    impl RecognitionEngine for FakeEngine {
        async fn start(
            &self,
            params: EngineParams,
            listener: Arc<dyn EngineListener>,
        ) -> Result<Box<dyn EngineHandle>, EngineError> {
            self.calls.lock().unwrap().params = Some(params.clone());
            match self.script {
                Script::FailOnStart => {
                    return Err(EngineError::Rejected {
                        code: 4001,
                        message: "invalid ref_text".to_string(),
                    })
                }
                Script::PanicOnStart => panic!("engine exploded"),
                _ => {}
            }

            listener.on_start(&params.voice_id).await;
            if self.script == Script::VanishAfterStart {
                // The callback task dies holding the only listener reference.
                tokio::spawn(async move {
                    let _listener = listener;
                    panic!("callback task died");
                });
                return Ok(Box::new(FakeHandle {
                    script: self.script,
                    listener: None,
                    calls: self.calls.clone(),
                }));
            }
            if self.script == Script::FailImmediately {
                let listener = listener.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    listener
                        .on_fail(EngineError::Closed("upstream reset".to_string()))
                        .await;
                });
            }

            Ok(Box::new(FakeHandle {
                script: self.script,
                listener: Some(listener),
                calls: self.calls.clone(),
            }))
        }
    }

    #[async_trait]
    impl EngineHandle for FakeHandle {
        async fn write_audio(&mut self, audio: &[u8]) -> Result<(), EngineError> {
            if self.script == Script::FailWrites {
                return Err(EngineError::Write("broken pipe".to_string()));
            }
            self.calls.lock().unwrap().writes.push(audio.to_vec());
            if let Some(listener) = &self.listener {
                listener.on_intermediate_result(sample_result()).await;
            }
            Ok(())
        }

        async fn stop(&mut self) {
            self.calls.lock().unwrap().stops += 1;
            if let (Script::CompleteOnStop, Some(listener)) = (self.script, self.listener.clone()) {
                tokio::spawn(async move { listener.on_complete(sample_result()).await });
            }
        }
    }

    struct Client {
        inbound: mpsc::Sender<InboundItem>,
        outbound: mpsc::Receiver<OutboundCommand>,
        session: JoinHandle<SessionReport>,
        calls: Arc<StdMutex<Calls>>,
    }

    impl Client {
        async fn send_text(&self, text: &str) {
            self.inbound
                .send(Ok(TransportMessage::Text(text.to_string())))
                .await
                .unwrap();
        }

        async fn send_audio(&self, data: Vec<u8>) {
            self.inbound
                .send(Ok(TransportMessage::Binary(data)))
                .await
                .unwrap();
        }

        /// Drop the inbound side, as an abrupt disconnect would.
        fn hang_up(&mut self) {
            self.inbound = mpsc::channel(1).0;
        }

        /// Wait for the session and collect everything it sent.
        async fn finish(mut self) -> (SessionReport, Vec<StatusFrame>, usize, Arc<StdMutex<Calls>>) {
            let report = tokio::time::timeout(Duration::from_secs(5), self.session)
                .await
                .expect("session hung")
                .unwrap();

            let mut frames = Vec::new();
            let mut closes = 0;
            while let Ok(command) = self.outbound.try_recv() {
                match command {
                    OutboundCommand::Text(text) => frames.push(serde_json::from_str(&text).unwrap()),
                    OutboundCommand::Close => closes += 1,
                }
            }
            (report, frames, closes, self.calls)
        }
    }

    fn connect(script: Script) -> Client {
        let calls = Arc::new(StdMutex::new(Calls::default()));
        let engine = Arc::new(FakeEngine {
            script,
            calls: calls.clone(),
        });

        let mut limits = AppConfig::default().session;
        limits.drain_timeout_secs = 1;
        limits.write_timeout_secs = 1;

        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let responder = Arc::new(Responder::new(
            "session-under-test",
            Box::new(ChannelSender::new(outbound_tx)),
            limits.write_timeout(),
        ));
        let session = AssessmentSession::new("session-under-test", engine, responder, limits);
        let handle = tokio::spawn(session.run_guarded(Box::new(ChannelReceiver::new(inbound_rx))));

        Client {
            inbound: inbound_tx,
            outbound: outbound_rx,
            session: handle,
            calls,
        }
    }

    fn statuses(frames: &[StatusFrame]) -> Vec<Status> {
        frames.iter().map(|f| f.status).collect()
    }

    fn terminal_count(frames: &[StatusFrame]) -> usize {
        frames.iter().filter(|f| f.is_terminal()).count()
    }

    #[tokio::test]
    async fn test_single_word_happy_path() {
        let client = connect(Script::CompleteOnStop);
        client.send_text(r#"{"ref_text":"cat"}"#).await;
        client.send_audio(vec![0; 640]).await;
        client.send_text(r#"{"type":"end"}"#).await;

        let (report, frames, closes, calls) = client.finish().await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.final_state, SessionState::Terminated);
        assert_eq!(
            statuses(&frames),
            vec![Status::Start, Status::Intermediate, Status::Complete]
        );
        assert_eq!(frames[2].result, Some(sample_result()));
        assert_eq!(closes, 1);

        let calls = calls.lock().unwrap();
        let params = calls.params.as_ref().unwrap();
        assert_eq!(params.eval_mode, 0);
        assert_eq!(params.server_engine_type, "16k_en");
        assert_eq!(params.score_coeff, 1.1);
        assert_eq!(params.voice_id, "session-under-test");
        assert_eq!(calls.stops, 1);
    }

    #[tokio::test]
    async fn test_sentence_overrides_mode_and_pads_odd_frames() {
        let client = connect(Script::CompleteOnStop);
        client
            .send_text(r#"{"ref_text":"The cat sat.","eval_mode":0,"score_coeff":0}"#)
            .await;
        client.send_audio(vec![1, 2, 3]).await;
        client.send_text(r#"{"type":"pause"}"#).await;
        client.send_audio(vec![4, 5]).await;
        client.send_text(r#"{"type":"end"}"#).await;

        let (report, frames, _, calls) = client.finish().await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.eval_mode, Some(1));
        assert_eq!(report.frames_received, 2);
        assert_eq!(report.bytes_received, 5);
        assert_eq!(terminal_count(&frames), 1);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.params.as_ref().unwrap().eval_mode, 1);
        assert_eq!(calls.params.as_ref().unwrap().score_coeff, 1.0);
        assert_eq!(calls.writes, vec![vec![1, 2, 3, 0], vec![4, 5]]);
    }

    #[tokio::test]
    async fn test_missing_ref_text_gets_one_error_and_no_engine() {
        let client = connect(Script::CompleteOnStop);
        client.send_text(r#"{"eval_mode":1}"#).await;

        let (report, frames, closes, calls) = client.finish().await;

        assert_eq!(report.outcome, SessionOutcome::Rejected);
        assert_eq!(report.final_state, SessionState::Terminated);
        assert_eq!(statuses(&frames), vec![Status::Error]);
        assert!(frames[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("Invalid configuration"));
        assert_eq!(closes, 1);
        assert!(calls.lock().unwrap().params.is_none());
    }

    #[tokio::test]
    async fn test_engine_start_failure_is_reported() {
        let client = connect(Script::FailOnStart);
        client.send_text(r#"{"ref_text":"cat"}"#).await;

        let (report, frames, _, calls) = client.finish().await;

        assert_eq!(report.outcome, SessionOutcome::EngineFailed);
        assert_eq!(statuses(&frames), vec![Status::Error]);
        assert_eq!(
            frames[0].error.as_deref(),
            Some("engine rejected request (code 4001): invalid ref_text")
        );
        assert_eq!(calls.lock().unwrap().stops, 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_mid_stream_stops_engine_once() {
        let client = connect(Script::CompleteOnStop);
        client.send_text(r#"{"ref_text":"cat"}"#).await;
        client.send_audio(vec![0; 320]).await;

        let mut client = client;
        client.hang_up();

        let (report, _, closes, calls) = client.finish().await;
        assert_eq!(report.outcome, SessionOutcome::Aborted);
        assert_eq!(report.final_state, SessionState::Terminated);
        assert_eq!(calls.lock().unwrap().stops, 1);
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_vanished_engine_still_gets_error_frame() {
        let client = connect(Script::VanishAfterStart);
        client.send_text(r#"{"ref_text":"cat"}"#).await;

        let (report, frames, closes, _) = client.finish().await;

        assert_eq!(report.outcome, SessionOutcome::EngineFailed);
        assert_eq!(report.final_state, SessionState::Terminated);
        assert_eq!(statuses(&frames), vec![Status::Start, Status::Error]);
        assert_eq!(
            frames[1].error.as_deref(),
            Some("engine connection closed: engine went away without a result")
        );
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_engine_failure_ends_session_without_client_input() {
        let client = connect(Script::FailImmediately);
        client.send_text(r#"{"ref_text":"cat"}"#).await;

        // The inbound side stays open and silent.
        let (report, frames, closes, calls) = client.finish().await;

        assert_eq!(report.outcome, SessionOutcome::EngineFailed);
        assert_eq!(statuses(&frames), vec![Status::Start, Status::Error]);
        assert_eq!(
            frames[1].error.as_deref(),
            Some("engine connection closed: upstream reset")
        );
        assert_eq!(closes, 1);
        assert_eq!(calls.lock().unwrap().stops, 1);
    }

    #[tokio::test]
    async fn test_audio_write_failure_is_terminal() {
        let client = connect(Script::FailWrites);
        client.send_text(r#"{"ref_text":"cat"}"#).await;
        client.send_audio(vec![0; 64]).await;

        let (report, frames, _, _) = client.finish().await;

        assert_eq!(report.outcome, SessionOutcome::EngineFailed);
        assert_eq!(statuses(&frames), vec![Status::Start, Status::Error]);
        assert_eq!(
            frames[1].error.as_deref(),
            Some("failed to send audio to engine: broken pipe")
        );
    }

    #[tokio::test]
    async fn test_drain_timeout_sends_error() {
        let client = connect(Script::NeverFinish);
        client.send_text(r#"{"ref_text":"cat"}"#).await;
        client.send_text(r#"{"type":"end"}"#).await;

        let (report, frames, _, calls) = client.finish().await;

        assert_eq!(report.outcome, SessionOutcome::TimedOut);
        assert_eq!(statuses(&frames), vec![Status::Start, Status::Error]);
        assert!(frames[1].error.as_deref().unwrap().contains("did not finish"));
        assert_eq!(calls.lock().unwrap().stops, 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error_frame() {
        let client = connect(Script::PanicOnStart);
        client.send_text(r#"{"ref_text":"cat"}"#).await;

        let (report, frames, closes, _) = client.finish().await;

        assert_eq!(report.outcome, SessionOutcome::Internal);
        assert_eq!(report.final_state, SessionState::Terminated);
        assert_eq!(statuses(&frames), vec![Status::Error]);
        assert_eq!(frames[0].error.as_deref(), Some("internal error"));
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_teardown_twice_has_no_extra_effects() {
        let calls = Arc::new(StdMutex::new(Calls::default()));
        let (listener, _events) = {
            let (tx, _rx) = mpsc::channel(1);
            let responder = Arc::new(Responder::new(
                "t",
                Box::new(ChannelSender::new(tx)),
                Duration::from_secs(1),
            ));
            SessionListener::new("t", responder)
        };
        let handle = FakeHandle {
            script: Script::NeverFinish,
            listener: Some(listener),
            calls: calls.clone(),
        };

        let (tx, mut rx) = mpsc::channel(8);
        let responder = Arc::new(Responder::new(
            "t",
            Box::new(ChannelSender::new(tx)),
            Duration::from_secs(1),
        ));
        let mut teardown = Teardown::new("t", responder.clone());
        teardown.attach_engine(EngineSlot::shared(Box::new(handle)));

        teardown.run().await;
        teardown.run().await;

        assert_eq!(calls.lock().unwrap().stops, 1);
        assert_eq!(rx.try_recv(), Ok(OutboundCommand::Close));
        assert!(rx.try_recv().is_err());
        assert!(!responder.send(StatusFrame::error("late")).await);
    }

    #[tokio::test]
    async fn test_saved_audio_is_written_on_teardown() {
        let dir = std::env::temp_dir().join(format!("assessment-session-{}", uuid::Uuid::new_v4()));
        let calls = Arc::new(StdMutex::new(Calls::default()));
        let engine = Arc::new(FakeEngine {
            script: Script::CompleteOnStop,
            calls: calls.clone(),
        });
        let mut limits = AppConfig::default().session;
        limits.audio_dir = dir.clone();

        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let responder = Arc::new(Responder::new(
            "rec",
            Box::new(ChannelSender::new(outbound_tx)),
            Duration::from_secs(1),
        ));
        let session = AssessmentSession::new("rec", engine, responder, limits);

        inbound_tx
            .send(Ok(TransportMessage::Text(
                r#"{"ref_text":"cat","is_save_audio_file":true}"#.to_string(),
            )))
            .await
            .unwrap();
        inbound_tx
            .send(Ok(TransportMessage::Binary(vec![1, 0, 2, 0, 3])))
            .await
            .unwrap();
        inbound_tx
            .send(Ok(TransportMessage::Text(r#"{"type":"end"}"#.to_string())))
            .await
            .unwrap();

        let report = session.run(Box::new(ChannelReceiver::new(inbound_rx))).await;
        let path = report.recording.expect("recording saved");
        assert!(path.starts_with(&dir));

        let mut file = std::fs::File::open(&path).unwrap();
        let (_, data) = wav::read(&mut file).unwrap();
        assert_eq!(data, wav::BitDepth::Sixteen(vec![1, 2, 3]));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
