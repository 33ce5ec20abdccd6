//! Per-Race Scheduler (component I, spec §4.9). Owns the single piece of
//! in-process shared mutable state permitted by spec §5/§9: a `lastPollTime`
//! map, guarded the same way the teacher's `GameCache` guards its
//! `Arc<RwLock<HashMap>>` — mutated only through this type's API, checked
//! then updated under the write lock, never mutated mid-poll.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::RaceStatus;

/// Chooses the polling interval for a race from its proximity to start and
/// current status (spec §4.9). Status takes precedence: a closed/final race
/// heartbeats regardless of `t`.
pub fn cadence(time_to_start_minutes: f64, status: RaceStatus) -> std::time::Duration {
    use std::time::Duration;

    if matches!(status, RaceStatus::Final | RaceStatus::Closed) {
        return Duration::from_secs(300);
    }
    if time_to_start_minutes > 10.0 {
        Duration::from_secs(60)
    } else if time_to_start_minutes > 5.0 {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(15)
    }
}

/// Thread-safe `lastPollTime` map. Absence of an entry counts as due (spec
/// §4.9: "Absence of a prior poll counts as due").
#[derive(Clone, Default)]
pub struct Scheduler {
    last_poll: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `race_id` is due for a poll right now, given its chosen cadence.
    pub async fn is_due(&self, race_id: &str, now: DateTime<Utc>, interval: std::time::Duration) -> bool {
        let table = self.last_poll.read().await;
        match table.get(race_id) {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(*last);
                elapsed >= chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero())
            }
        }
    }

    /// Records completion of a poll (success or terminal failure) so cadence
    /// continues without hot-looping on a broken race (spec §5).
    pub async fn record_polled(&self, race_id: &str, now: DateTime<Utc>) {
        self.last_poll.write().await.insert(race_id.to_string(), now);
    }

    /// Filters `candidates` down to the subset due for a poll right now.
    pub async fn select_due(
        &self,
        candidates: &[(String, f64, RaceStatus)],
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut due = Vec::new();
        for (race_id, time_to_start, status) in candidates {
            let interval = cadence(*time_to_start, *status);
            if self.is_due(race_id, now, interval).await {
                due.push(race_id.clone());
            }
        }
        due
    }
}
