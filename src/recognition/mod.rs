//! # Recognition Engine Adapter
//!
//! The pronunciation scoring itself happens in a remote engine. This module describes the
//! small contract the session coordinator needs from it, independent of any vendor:
//!
//! - [`RecognitionEngine::start`] opens one streaming assessment and returns a handle
//! - [`EngineHandle::write_audio`] forwards one audio frame
//! - [`EngineHandle::stop`] signals end of input (idempotent)
//! - [`EngineListener`] receives the engine's asynchronous notifications
//!
//! ## Callback contract:
//! Notifications are delivered from the engine's own task, never from the caller of
//! `write_audio`. After `on_start`, any number of `on_intermediate_result` calls may
//! arrive, followed by exactly one of `on_complete` or `on_fail`. Nothing is delivered
//! after that terminal callback.
//!
//! ## Resource ownership:
//! A handle owns the engine connection. Dropping it releases the connection and stops
//! callback delivery, which is what makes cleanup after a panic or a timeout safe.

pub mod result;
pub mod soe;

pub use result::AssessmentResult;
pub use soe::SoeEngine;

use async_trait::async_trait;
use std::sync::Arc;

/// Settings for one engine session, derived from the client's configuration frame after
/// defaults, coercion and mode classification have been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    /// Unique id for this assessment on the engine side
    pub voice_id: String,
    pub ref_text: String,
    pub server_engine_type: String,
    pub score_coeff: f64,
    pub eval_mode: i64,
    pub text_mode: i64,
}

/// Failures reported by an engine adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("engine credentials are not configured")]
    MissingCredentials,

    #[error("failed to sign engine request: {0}")]
    Signing(String),

    #[error("failed to connect to engine: {0}")]
    Connect(String),

    #[error("engine did not respond within {0} seconds")]
    Timeout(u64),

    #[error("engine rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("engine connection closed: {0}")]
    Closed(String),

    #[error("failed to send audio to engine: {0}")]
    Write(String),

    #[error("unexpected engine response: {0}")]
    Protocol(String),

    #[error("audio written after the engine was stopped")]
    Stopped,
}

/// Factory for engine sessions. One instance is shared by every connection.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Open a streaming assessment. On success `listener.on_start` has already been called.
    async fn start(
        &self,
        params: EngineParams,
        listener: Arc<dyn EngineListener>,
    ) -> Result<Box<dyn EngineHandle>, EngineError>;
}

/// One open engine session. Not safe for concurrent use; callers serialize access.
#[async_trait]
pub trait EngineHandle: Send {
    async fn write_audio(&mut self, audio: &[u8]) -> Result<(), EngineError>;

    /// Signal end of input. Calling it again is a no-op.
    async fn stop(&mut self);
}

/// Receiver for engine notifications.
#[async_trait]
pub trait EngineListener: Send + Sync {
    async fn on_start(&self, voice_id: &str);
    async fn on_intermediate_result(&self, result: AssessmentResult);
    async fn on_complete(&self, result: AssessmentResult);
    async fn on_fail(&self, error: EngineError);
}
