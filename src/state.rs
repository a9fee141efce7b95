//! # Application State Management
//!
//! Shared state accessed by every HTTP request handler and WebSocket actor.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same state
//! - **RwLock**: multiple readers OR one writer at a time
//! - Reads (config snapshots, metrics) are frequent; writes (config updates,
//!   counter bumps) are short.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Session and pipeline metrics, updated by the dispatch path and workers
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters for the orchestration pipeline.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since server start
    pub request_count: u64,

    /// Total HTTP errors since server start
    pub error_count: u64,

    /// Utterances routed and dispatched to a capability
    pub utterances_dispatched: u64,

    /// Utterances dropped because the router returned no valid selection
    pub routing_failures: u64,

    /// Scene annotations appended by the background loop
    pub annotations_recorded: u64,

    /// Operator notes recorded
    pub notes_recorded: u64,

    /// Procedure reports generated
    pub reports_generated: u64,

    /// Currently connected duplex WebSocket clients
    pub active_connections: u32,

    /// Per-endpoint request metrics
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately so other threads are not
    /// blocked while the caller works with the snapshot.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validation.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    pub fn record_dispatch(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.utterances_dispatched += 1;
    }

    pub fn record_routing_failure(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.routing_failures += 1;
    }

    pub fn record_annotation(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.annotations_recorded += 1;
    }

    pub fn record_note(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.notes_recorded += 1;
    }

    pub fn record_report(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.reports_generated += 1;
    }

    pub fn increment_active_connections(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_connections += 1;
    }

    pub fn decrement_active_connections(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_connections > 0 {
            metrics.active_connections -= 1;
        }
    }

    /// Record detailed metrics for a specific endpoint (used by middleware).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics.
    ///
    /// Takes the read lock once and clones so metrics do not change while
    /// they are being serialized to JSON.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            utterances_dispatched: metrics.utterances_dispatched,
            routing_failures: metrics.routing_failures,
            annotations_recorded: metrics.annotations_recorded,
            notes_recorded: metrics.notes_recorded,
            reports_generated: metrics.reports_generated,
            active_connections: metrics.active_connections,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
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

    #[test]
    fn test_counters() {
        let state = AppState::new(AppConfig::default());
        state.record_dispatch();
        state.record_dispatch();
        state.record_routing_failure();
        state.record_annotation();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.utterances_dispatched, 2);
        assert_eq!(snapshot.routing_failures, 1);
        assert_eq!(snapshot.annotations_recorded, 1);
    }

    #[test]
    fn test_active_connections_never_underflow() {
        let state = AppState::new(AppConfig::default());
        state.decrement_active_connections();
        assert_eq!(state.get_metrics_snapshot().active_connections, 0);
    }
}
