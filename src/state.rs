//! # Application State Management
//!
//! Shared state visible to every HTTP handler and WebSocket session.
//!
//! ## Two Layers:
//! - **AppState**: configuration snapshot plus gateway metrics, all behind
//!   `Arc<RwLock<…>>` so handlers clone cheap references and never hold a
//!   lock across I/O.
//! - **GatewayServices**: the wired-up collaborators (ticket store, object
//!   store, token verifier, ASR dispatcher) built once at startup. These
//!   are trait objects so tests can swap in in-memory fakes.
//!
//! The ticket store is the only cross-connection mutable state in the core;
//! everything per-session lives inside the session actor.

use crate::archive::{ArchiverConfig, ObjectStore};
use crate::asr::AsrDispatcher;
use crate::auth::{TicketStore, TokenVerifier};
use crate::config::AppConfig;
use crate::ws::session::SessionDeps;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Configuration + metrics shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<GatewayMetrics>>,
    pub start_time: Instant,
}

/// Counters the health and metrics endpoints report.
#[derive(Debug, Default, Clone)]
pub struct GatewayMetrics {
    /// HTTP requests processed since start
    pub request_count: u64,

    /// HTTP requests that ended in a 4xx/5xx
    pub error_count: u64,

    /// Currently open WebSocket sessions
    pub active_sessions: u32,

    /// Tickets issued since start
    pub tickets_issued: u64,

    /// Transcription submissions that produced a transcript
    pub transcriptions_completed: u64,

    /// Transcription submissions that produced an error frame
    pub transcriptions_failed: u64,

    /// Per-endpoint request statistics (key: "METHOD /path")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(GatewayMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; releases the lock immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    pub fn increment_active_sessions(&self) {
        self.metrics.write().unwrap().active_sessions += 1;
    }

    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn record_ticket_issued(&self) {
        self.metrics.write().unwrap().tickets_issued += 1;
    }

    pub fn record_transcription(&self, success: bool) {
        let mut metrics = self.metrics.write().unwrap();
        if success {
            metrics.transcriptions_completed += 1;
        } else {
            metrics.transcriptions_failed += 1;
        }
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the metrics for serialization.
    pub fn get_metrics_snapshot(&self) -> GatewayMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// The gateway's wired collaborators, built once in `main`.
#[derive(Clone)]
pub struct GatewayServices {
    pub ticket_store: Arc<dyn TicketStore>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub token_verifier: Option<Arc<TokenVerifier>>,
    pub dispatcher: AsrDispatcher,
    pub archiver_config: ArchiverConfig,
    pub allowed_origins: Vec<String>,
    pub app_state: AppState,
}

impl GatewayServices {
    /// The slice of services a session actor owns.
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            ticket_store: self.ticket_store.clone(),
            object_store: self.object_store.clone(),
            dispatcher: self.dispatcher.clone(),
            archiver_config: self.archiver_config.clone(),
            app_state: self.app_state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counter_never_underflows() {
        let state = AppState::new(AppConfig::default());
        state.decrement_active_sessions();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);

        state.increment_active_sessions();
        state.increment_active_sessions();
        state.decrement_active_sessions();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("POST /api/ws/ticket", 10, false);
        state.record_endpoint_request("POST /api/ws/ticket", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["POST /api/ws/ticket"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.total_duration_ms, 40);
        assert_eq!(metric.error_count, 1);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_transcription_counters() {
        let state = AppState::new(AppConfig::default());
        state.record_transcription(true);
        state.record_transcription(true);
        state.record_transcription(false);
        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.transcriptions_completed, 2);
        assert_eq!(snapshot.transcriptions_failed, 1);
    }
}
