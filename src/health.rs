//! Health check surface (ambient, modeled on the teacher's `HealthState`
//! and `health_handler`). Reports last-poll recency and recent error count
//! so an external prober can tell the poller apart from a stalled process.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthInner>>,
}

struct HealthInner {
    last_poll_time: Option<DateTime<Utc>>,
    last_batch_errors: usize,
    consecutive_error_batches: usize,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthInner {
                last_poll_time: None,
                last_batch_errors: 0,
                consecutive_error_batches: 0,
            })),
        }
    }

    pub async fn record_batch(&self, total_errors: usize) {
        let mut state = self.inner.write().await;
        state.last_poll_time = Some(Utc::now());
        state.last_batch_errors = total_errors;
        if total_errors > 0 {
            state.consecutive_error_batches += 1;
        } else {
            state.consecutive_error_batches = 0;
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn health_handler(State(health): State<HealthState>) -> (StatusCode, Json<serde_json::Value>) {
    let state = health.inner.read().await;

    let status = if state.consecutive_error_batches > 5 {
        "degraded"
    } else {
        "ok"
    };
    let http_status = if state.consecutive_error_batches > 10 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        http_status,
        Json(json!({
            "service": "race-poller",
            "status": status,
            "last_poll": state.last_poll_time.map(|t| t.to_rfc3339()),
            "last_batch_errors": state.last_batch_errors,
            "consecutive_error_batches": state.consecutive_error_batches,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_health_state_reports_ok() {
        let health = HealthState::new();
        let (status, body) = health_handler(State(health)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["status"], "ok");
    }

    #[tokio::test]
    async fn degrades_after_repeated_error_batches() {
        let health = HealthState::new();
        for _ in 0..6 {
            health.record_batch(3).await;
        }
        let (status, body) = health_handler(State(health)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["status"], "degraded");
    }

    #[tokio::test]
    async fn a_clean_batch_resets_the_error_streak() {
        let health = HealthState::new();
        for _ in 0..6 {
            health.record_batch(3).await;
        }
        health.record_batch(0).await;
        let (status, _) = health_handler(State(health)).await;
        assert_eq!(status, StatusCode::OK);
    }
}
