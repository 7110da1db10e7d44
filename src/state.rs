//! # Application State Management
//!
//! Shared state for every HTTP handler and every WebSocket session.
//!
//! ## What lives here:
//! - **config**: read-only after startup, so a plain `Arc<AppConfig>` is enough
//! - **metrics**: request counters, per-endpoint timings and session accounting, updated
//!   by middleware and by sessions as they finish
//! - **start_time**: for uptime reporting
//!
//! ### Arc<RwLock<T>> for metrics
//! Many requests update metrics concurrently and the health endpoints read them. Every
//! critical section is a handful of integer updates, so a std `RwLock` is fine; the lock is
//! never held across an `.await`.
//!
//! ### Session permits
//! [`AppState::try_acquire_session`] reserves one of `max_concurrent_sessions` slots and
//! returns a [`SessionPermit`]. The slot is released when the permit is dropped, so a
//! session that ends by panic or early return can never leak capacity.

use crate::assessment::SessionOutcome;
use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::debug;

/// The main application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Loaded and validated once at startup
    pub config: Arc<AppConfig>,

    /// Counters updated by middleware and sessions
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,

    /// Total number of 4xx/5xx responses
    pub error_count: u64,

    /// Sessions currently holding a permit
    pub active_sessions: u32,

    /// Per-endpoint statistics, keyed like "GET /health"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    pub sessions: SessionMetrics,
}

/// How sessions ended.
///
/// - **completed**: the engine delivered a final result
/// - **failed**: bad configuration, engine failure, drain timeout or internal fault
/// - **aborted**: the client went away first
/// - **rejected_capacity**: refused because the server was full
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionMetrics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    pub rejected_capacity: u64,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Sum of request durations in milliseconds
    pub total_duration_ms: u64,

    pub error_count: u64,
}

/// One reserved session slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SessionPermit {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
        debug!("Session slot released, {} active", metrics.active_sessions);
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // A panic while holding the lock leaves plain counters behind, which are still
    // usable, so poisoning is ignored.
    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record one request against its endpoint.
    ///
    /// The first request for an endpoint creates its entry via `.entry().or_default()`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a session slot, or `None` when `max_concurrent_sessions` are already active.
    ///
    /// Check and increment happen under one write lock, so two connections can never
    /// both take the last slot.
    pub fn try_acquire_session(&self) -> Option<SessionPermit> {
        let limit = self.config.performance.max_concurrent_sessions;
        let mut metrics = self.metrics_write();

        if metrics.active_sessions as usize >= limit {
            metrics.sessions.rejected_capacity += 1;
            return None;
        }
        metrics.active_sessions += 1;
        Some(SessionPermit {
            metrics: self.metrics.clone(),
        })
    }

    pub fn record_session_outcome(&self, outcome: SessionOutcome) {
        let mut metrics = self.metrics_write();
        metrics.sessions.total += 1;
        match outcome {
            SessionOutcome::Completed => metrics.sessions.completed += 1,
            SessionOutcome::Aborted => metrics.sessions.aborted += 1,
            SessionOutcome::Rejected
            | SessionOutcome::EngineFailed
            | SessionOutcome::TimedOut
            | SessionOutcome::Internal => metrics.sessions.failed += 1,
        }
    }

    /// Consistent copy of the metrics, so no lock is held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_limit(limit: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        AppState::new(config)
    }

    #[test]
    fn test_session_permits_respect_the_limit() {
        let state = state_with_limit(2);

        let first = state.try_acquire_session().unwrap();
        let _second = state.try_acquire_session().unwrap();
        assert!(state.try_acquire_session().is_none());
        assert_eq!(state.get_metrics_snapshot().active_sessions, 2);

        drop(first);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
        assert!(state.try_acquire_session().is_some());

        assert_eq!(state.get_metrics_snapshot().sessions.rejected_capacity, 1);
    }

    #[test]
    fn test_session_outcomes_are_counted() {
        let state = state_with_limit(4);
        state.record_session_outcome(SessionOutcome::Completed);
        state.record_session_outcome(SessionOutcome::TimedOut);
        state.record_session_outcome(SessionOutcome::Rejected);
        state.record_session_outcome(SessionOutcome::Aborted);

        let sessions = state.get_metrics_snapshot().sessions;
        assert_eq!(sessions.total, 4);
        assert_eq!(sessions.completed, 1);
        assert_eq!(sessions.failed, 2);
        assert_eq!(sessions.aborted, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state_with_limit(1);
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }
}
