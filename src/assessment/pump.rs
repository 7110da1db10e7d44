//! # Duplex Pumps
//!
//! A streaming session moves data in two directions at once:
//!
//! ```text
//!   client ──frames──> ReaderWorker ──PCM──> EngineSlot ──> engine
//!   client <──JSON─── Responder <──callbacks── engine listener
//! ```
//!
//! The [`ReaderWorker`] runs as its own task and is the only code that reads from the
//! client. The [`Responder`] is shared by everything that writes to the client (the
//! engine listener and the session state machine) and serializes those writes.
//!
//! ## Responder guarantees:
//! - Writes never interleave: one lock guards the sink
//! - Every write is bounded by the write timeout
//! - At most one terminal frame (`complete` or `error`) is ever sent, and nothing is sent
//!   after it
//! - A failed write is logged and dropped, never retried

use super::protocol::{parse_control, ControlMessage, StatusFrame};
use super::transport::{FrameReceiver, FrameSender, TransportMessage};
use crate::audio::{align_pcm16, estimated_duration_secs, AudioRecorder};
use crate::error::SessionError;
use crate::recognition::{EngineError, EngineHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// Serialized, deadline-bounded writer for one client connection.
pub struct Responder {
    session_id: String,
    sink: Mutex<Box<dyn FrameSender>>,
    write_timeout: Duration,
    // Both flags are only changed while `sink` is locked.
    terminal_sent: AtomicBool,
    closed: AtomicBool,
    frames_sent: AtomicU64,
}

impl Responder {
    pub fn new(session_id: impl Into<String>, sink: Box<dyn FrameSender>, write_timeout: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            sink: Mutex::new(sink),
            write_timeout,
            terminal_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Send one status frame. Returns `true` if it was written.
    pub async fn send(&self, frame: StatusFrame) -> bool {
        let mut sink = self.sink.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            debug!("Session {}: dropping {:?} frame, connection closed", self.session_id, frame.status);
            return false;
        }
        if self.terminal_sent.load(Ordering::SeqCst) {
            debug!("Session {}: dropping {:?} frame after terminal frame", self.session_id, frame.status);
            return false;
        }
        if frame.is_terminal() {
            self.terminal_sent.store(true, Ordering::SeqCst);
        }

        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Session {}: failed to encode {:?} frame: {}", self.session_id, frame.status, e);
                return false;
            }
        };

        match tokio::time::timeout(self.write_timeout, sink.send_text(payload)).await {
            Ok(Ok(())) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                warn!("Session {}: failed to write {:?} frame: {}", self.session_id, frame.status, e);
                false
            }
            Err(_) => {
                warn!(
                    "Session {}: writing {:?} frame timed out after {:?}",
                    self.session_id, frame.status, self.write_timeout
                );
                false
            }
        }
    }

    /// Send the error frame for `err`, if it is terminal.
    pub async fn send_error(&self, err: &SessionError) -> bool {
        if !err.is_terminal() {
            return false;
        }
        self.send(StatusFrame::error(err.client_message())).await
    }

    /// Close the connection. Only the first call does anything.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if tokio::time::timeout(self.write_timeout, sink.close()).await.is_err() {
            warn!("Session {}: closing the connection timed out", self.session_id);
        }
    }

    #[cfg(test)]
    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

/// Owner of the engine handle for one session.
///
/// Guarantees `stop` reaches the engine at most once, however many paths ask for it
/// (end-of-stream, failure, teardown).
pub struct EngineSlot {
    handle: Option<Box<dyn EngineHandle>>,
    stopped: bool,
}

pub type SharedEngine = Arc<Mutex<EngineSlot>>;

impl EngineSlot {
    pub fn new(handle: Box<dyn EngineHandle>) -> Self {
        Self {
            handle: Some(handle),
            stopped: false,
        }
    }

    pub fn shared(handle: Box<dyn EngineHandle>) -> SharedEngine {
        Arc::new(Mutex::new(Self::new(handle)))
    }

    pub async fn write_audio(&mut self, audio: &[u8]) -> Result<(), EngineError> {
        match self.handle.as_mut() {
            Some(handle) if !self.stopped => handle.write_audio(audio).await,
            _ => Err(EngineError::Stopped),
        }
    }

    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(handle) = self.handle.as_mut() {
            handle.stop().await;
        }
    }

    /// Stop (if needed) and drop the handle, releasing the engine connection.
    pub async fn release(&mut self) {
        self.stop().await;
        self.handle = None;
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }
}

/// Audio statistics for one session.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub frames: u64,
    /// Bytes as received, before alignment padding
    pub bytes: usize,
    started: Instant,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            frames: 0,
            bytes: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, frame_len: usize) {
        self.frames += 1;
        self.bytes += frame_len;
    }

    pub fn audio_secs(&self) -> f64 {
        estimated_duration_secs(self.bytes)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the reader stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderExit {
    /// Client sent `{"type":"end"}`; the engine has been told to stop
    EndOfStream,
    /// Client went away or the transport failed
    Aborted(String),
    /// The engine rejected an audio frame
    EngineWriteFailed(EngineError),
    /// The session asked the reader to stop
    Shutdown,
}

#[derive(Debug)]
pub struct ReaderReport {
    pub exit: ReaderExit,
    pub stats: StreamStats,
    pub recorder: Option<AudioRecorder>,
}

/// Reads client frames until end-of-stream, failure or shutdown.
pub struct ReaderWorker {
    session_id: String,
    receiver: Box<dyn FrameReceiver>,
    engine: SharedEngine,
    recorder: Option<AudioRecorder>,
    stats: StreamStats,
}

impl ReaderWorker {
    pub fn new(
        session_id: impl Into<String>,
        receiver: Box<dyn FrameReceiver>,
        engine: SharedEngine,
        recorder: Option<AudioRecorder>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            receiver,
            engine,
            recorder,
            stats: StreamStats::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> ReaderReport {
        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => break ReaderExit::Shutdown,
                next = self.receiver.recv() => next,
            };

            let message = match next {
                None => break ReaderExit::Aborted("client disconnected".to_string()),
                Some(Err(e)) => break ReaderExit::Aborted(e.to_string()),
                Some(Ok(message)) => message,
            };

            match message {
                TransportMessage::Binary(frame) => {
                    if let Err(e) = self.forward_audio(frame).await {
                        break ReaderExit::EngineWriteFailed(e);
                    }
                }
                TransportMessage::Text(text) => match parse_control(&text) {
                    ControlMessage::EndOfStream => {
                        info!(
                            "Session {}: end of stream after {} frames, {} bytes (~{:.2}s audio) in {:?}",
                            self.session_id,
                            self.stats.frames,
                            self.stats.bytes,
                            self.stats.audio_secs(),
                            self.stats.elapsed()
                        );
                        self.engine.lock().await.stop().await;
                        break ReaderExit::EndOfStream;
                    }
                    ControlMessage::Unrecognized(reason) => {
                        let err = SessionError::FrameProtocol(reason);
                        debug!("Session {}: ignoring text frame: {}", self.session_id, err);
                    }
                },
                TransportMessage::Close(reason) => {
                    break ReaderExit::Aborted(format!(
                        "client closed the connection: {}",
                        reason.unwrap_or_else(|| "no reason".to_string())
                    ));
                }
            }
        };

        ReaderReport {
            exit,
            stats: self.stats,
            recorder: self.recorder,
        }
    }

    async fn forward_audio(&mut self, frame: Vec<u8>) -> Result<(), EngineError> {
        self.stats.record(frame.len());
        let frame = align_pcm16(frame);
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.append(&frame).await {
                warn!("Session {}: audio recording stopped: {}", self.session_id, e);
                self.recorder = None;
            }
        }
        self.engine.lock().await.write_audio(&frame).await
    }
}
