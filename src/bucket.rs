//! Timeline Bucketer (component F, spec §4.6) — the hardest subsystem.
//!
//! Turns a continuous `timeToStart` (signed minutes, positive before start)
//! into a canonical discrete bucket, then computes the incremental pool
//! contribution for that bucket against the nearest prior persisted bucket.
//! Pure bucket-selection math lives here as plain functions; the
//! duplicate-guard/gap-spanning logic reads through [`crate::store::Store`]
//! since it depends on previously persisted rows, not in-memory state (spec
//! §5: "correct under restart").

use crate::domain::{BucketedMoneyFlowRow, IntervalType};
use crate::error::IngestError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use tracing::warn;

/// Selects the canonical bucket for a given `timeToStart` in minutes (spec §4.6).
///
/// Pre-start (`t >= 0`): the largest canonical bucket `b` with `b <= t`,
/// capped at 60 for `t > 60`. The pre-start grid is 5-minute steps from 60
/// down to 5, then 1-minute steps from 4 down to 0.
///
/// Post-start (`t < 0`): the nearest canonical bucket *already reached*,
/// i.e. the smallest `b` with `b >= t` — equivalent to a ceiling snapped to
/// the post-start grid (0.5-minute steps down to -5, then 1-minute steps
/// beyond). This is the opposite rounding direction from the pre-start case,
/// which is why spec §4.6 calls it out as `ceil(t)` rather than reusing the
/// pre-start floor.
pub fn select_bucket(t: f64) -> f64 {
    if t > 60.0 {
        return 60.0;
    }
    if t >= 5.0 {
        return (t / 5.0).floor() * 5.0;
    }
    if t >= 0.0 {
        return t.floor();
    }
    if t >= -5.0 {
        return (t * 2.0).ceil() / 2.0;
    }
    t.ceil()
}

/// Interval type for cadence/tagging (spec §4.6). Not part of bucket identity.
pub fn interval_type(t: f64) -> IntervalType {
    if t > 30.0 {
        IntervalType::FiveMinute
    } else if t > 5.0 {
        IntervalType::OneMinute
    } else if t > 0.0 {
        IntervalType::ThirtySecond
    } else {
        IntervalType::Live
    }
}

fn round_cents(total_cents: i64, pct: f64) -> i64 {
    (total_cents as f64 * pct / 100.0).round() as i64
}

fn percentage(amount_cents: i64, total_cents: i64) -> Option<f64> {
    if total_cents == 0 {
        None
    } else {
        Some(amount_cents as f64 / total_cents as f64 * 100.0)
    }
}

/// Input for one entrant's poll, used to compute a bucketed row (spec §4.6).
pub struct BucketInput {
    pub race_id: String,
    pub entrant_id: String,
    pub time_to_start: f64,
    pub hold_percentage: f64,
    pub bet_percentage: f64,
    pub win_pool_total_cents: i64,
    pub place_pool_total_cents: i64,
    pub polling_timestamp: DateTime<Utc>,
}

/// Computes the bucketed row for one entrant's poll, or `None` if this exact
/// `(race_id, entrant_id, timeInterval)` already has a row (duplicate guard,
/// spec §4.6 step 1 / §8 invariant 5). Reads through `store` for the
/// baseline/gap-spanning checks but does not write — the caller persists the
/// result via [`Store::append_bucketed_row`].
pub async fn compute_row(
    store: &dyn Store,
    input: BucketInput,
) -> Result<Option<BucketedMoneyFlowRow>, IngestError> {
    let time_interval = select_bucket(input.time_to_start);

    if store
        .get_bucketed_row(&input.race_id, &input.entrant_id, time_interval)
        .await?
        .is_some()
    {
        return Ok(None);
    }

    let win_cents = round_cents(input.win_pool_total_cents, input.hold_percentage);
    let place_cents = round_cents(input.place_pool_total_cents, input.hold_percentage);

    let any_prior = store
        .any_bucketed_row_exists(&input.race_id, &input.entrant_id)
        .await?;

    let (incremental_win, incremental_place) = if !any_prior {
        // Baseline case (spec §4.6 step 2 / §8 invariant 7): only the very
        // first bucket in the early pre-race range counts the absolute
        // amount as the increment; anything earlier in the timeline would
        // otherwise fabricate history that was never observed.
        if time_interval >= 55.0 {
            (win_cents, place_cents)
        } else {
            (0, 0)
        }
    } else {
        match store
            .nearest_prior_bucket(&input.race_id, &input.entrant_id, time_interval)
            .await?
        {
            Some(prior) => (
                win_cents - prior.win_pool_amount,
                place_cents - prior.place_pool_amount,
            ),
            // Every prior row for this entrant happened to carry a zero
            // absolute amount (nearest_prior_bucket only considers non-zero
            // rows) — treat the implicit baseline as zero, same as a fresh start.
            None => (win_cents, place_cents),
        }
    };

    if incremental_win < 0 || incremental_place < 0 {
        warn!(
            race_id = %input.race_id,
            entrant_id = %input.entrant_id,
            time_interval,
            incremental_win,
            incremental_place,
            "negative incremental pool amount (money flowing out or late correction)"
        );
    }

    Ok(Some(BucketedMoneyFlowRow {
        race_id: input.race_id,
        entrant_id: input.entrant_id,
        time_interval,
        interval_type: interval_type(input.time_to_start),
        hold_percentage: input.hold_percentage,
        bet_percentage: input.bet_percentage,
        win_pool_amount: win_cents,
        place_pool_amount: place_cents,
        incremental_win_amount: incremental_win,
        incremental_place_amount: incremental_place,
        win_pool_percentage: percentage(win_cents, input.win_pool_total_cents),
        place_pool_percentage: percentage(place_cents, input.place_pool_total_cents),
        polling_timestamp: input.polling_timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn input(race_id: &str, entrant_id: &str, t: f64, hold_pct: f64, win_pool_total: i64) -> BucketInput {
        BucketInput {
            race_id: race_id.to_string(),
            entrant_id: entrant_id.to_string(),
            time_to_start: t,
            hold_percentage: hold_pct,
            bet_percentage: 0.0,
            win_pool_total_cents: win_pool_total,
            place_pool_total_cents: win_pool_total,
            polling_timestamp: Utc::now(),
        }
    }

    // --- bucket selection ---

    /// Spec §8 scenario S1: startTime 12:00:00Z, now 11:53:20Z -> t=6.667 -> bucket 5.
    #[test]
    fn s1_bucket_selection_pre_start() {
        assert_eq!(select_bucket(6.667), 5.0);
        assert_eq!(interval_type(6.667), IntervalType::OneMinute);
    }

    #[test]
    fn caps_at_60_for_t_over_60() {
        assert_eq!(select_bucket(90.0), 60.0);
        assert_eq!(select_bucket(61.0), 60.0);
        assert_eq!(select_bucket(60.0), 60.0);
    }

    #[test]
    fn pre_start_five_minute_steps_above_five() {
        assert_eq!(select_bucket(58.0), 55.0);
        assert_eq!(select_bucket(34.9), 30.0);
        assert_eq!(select_bucket(5.0), 5.0);
    }

    #[test]
    fn pre_start_one_minute_steps_below_five() {
        assert_eq!(select_bucket(4.9), 4.0);
        assert_eq!(select_bucket(0.1), 0.0);
        assert_eq!(select_bucket(0.0), 0.0);
    }

    #[test]
    fn post_start_half_minute_steps_down_to_five() {
        assert_eq!(select_bucket(-0.1), 0.0);
        assert_eq!(select_bucket(-0.3), 0.0);
        assert_eq!(select_bucket(-0.5), -0.5);
        assert_eq!(select_bucket(-0.7), -0.5);
        assert_eq!(select_bucket(-1.0), -1.0);
        assert_eq!(select_bucket(-5.0), -5.0);
    }

    #[test]
    fn post_start_one_minute_steps_beyond_five() {
        assert_eq!(select_bucket(-5.3), -5.0);
        assert_eq!(select_bucket(-6.0), -6.0);
        assert_eq!(select_bucket(-6.5), -6.0);
        assert_eq!(select_bucket(-7.0), -7.0);
    }

    #[test]
    fn interval_type_thresholds() {
        assert_eq!(interval_type(31.0), IntervalType::FiveMinute);
        assert_eq!(interval_type(30.0), IntervalType::OneMinute);
        assert_eq!(interval_type(5.1), IntervalType::OneMinute);
        assert_eq!(interval_type(5.0), IntervalType::ThirtySecond);
        assert_eq!(interval_type(0.1), IntervalType::ThirtySecond);
        assert_eq!(interval_type(0.0), IntervalType::Live);
        assert_eq!(interval_type(-2.0), IntervalType::Live);
    }

    // --- incremental computation ---

    /// Spec §8 scenario S2: first observation at t=58, hold%=10, winPoolTotal=100000
    /// -> bucket 55, winPoolAmount=10000, incrementalWinAmount=10000.
    #[tokio::test]
    async fn s2_first_observation_baseline() {
        let store = InMemoryStore::new();
        let row = compute_row(&store, input("r1", "e1", 58.0, 10.0, 100_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.time_interval, 55.0);
        assert_eq!(row.win_pool_amount, 10_000);
        assert_eq!(row.incremental_win_amount, 10_000);
        assert_eq!(row.interval_type, IntervalType::FiveMinute);
    }

    #[tokio::test]
    async fn baseline_below_55_yields_zero_increment() {
        let store = InMemoryStore::new();
        let row = compute_row(&store, input("r1", "e1", 20.0, 10.0, 100_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.time_interval, 20.0);
        assert_eq!(row.win_pool_amount, 10_000);
        assert_eq!(row.incremental_win_amount, 0, "no fabricated history before bucket 55");
    }

    /// Spec §8 scenario S3: prior row at timeInterval=10 (winPoolAmount=50000);
    /// next poll at t=3.2, hold%=12, winPoolTotal=500000 -> bucket 3,
    /// winPoolAmount=60000, incrementalWinAmount=10000.
    #[tokio::test]
    async fn s3_gap_spanning_increment() {
        let store = InMemoryStore::new();
        store
            .append_bucketed_row(&BucketedMoneyFlowRow {
                race_id: "r1".to_string(),
                entrant_id: "e1".to_string(),
                time_interval: 10.0,
                interval_type: IntervalType::OneMinute,
                hold_percentage: 10.0,
                bet_percentage: 0.0,
                win_pool_amount: 50_000,
                place_pool_amount: 50_000,
                incremental_win_amount: 50_000,
                incremental_place_amount: 50_000,
                win_pool_percentage: Some(10.0),
                place_pool_percentage: Some(10.0),
                polling_timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let row = compute_row(&store, input("r1", "e1", 3.2, 12.0, 500_000))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(row.time_interval, 3.0);
        assert_eq!(row.win_pool_amount, 60_000);
        assert_eq!(row.incremental_win_amount, 10_000);
        assert_eq!(row.interval_type, IntervalType::ThirtySecond);
    }

    /// Spec §8 scenario S4: two polls both fall into timeInterval=2; the
    /// second yields zero new rows for that entrant.
    #[tokio::test]
    async fn s4_duplicate_interval_suppressed() {
        let store = InMemoryStore::new();
        let first = compute_row(&store, input("r1", "e1", 2.3, 10.0, 100_000))
            .await
            .unwrap()
            .unwrap();
        store.append_bucketed_row(&first).await.unwrap();

        let second = compute_row(&store, input("r1", "e1", 2.1, 10.0, 100_000))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn incremental_consistency_across_three_polls() {
        let store = InMemoryStore::new();

        let a = compute_row(&store, input("r1", "e1", 58.0, 10.0, 100_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.win_pool_amount, 10_000);
        store.append_bucketed_row(&a).await.unwrap();

        let b = compute_row(&store, input("r1", "e1", 10.0, 15.0, 100_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.win_pool_amount, 15_000);
        assert_eq!(b.incremental_win_amount, 5_000);
        store.append_bucketed_row(&b).await.unwrap();

        let c = compute_row(&store, input("r1", "e1", 1.0, 12.0, 100_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.win_pool_amount, 12_000);
        assert_eq!(c.incremental_win_amount, -3_000, "pool share can shrink");
    }

    #[tokio::test]
    async fn duplicate_guard_is_per_entrant() {
        let store = InMemoryStore::new();
        let row1 = compute_row(&store, input("r1", "e1", 2.0, 10.0, 100_000))
            .await
            .unwrap()
            .unwrap();
        store.append_bucketed_row(&row1).await.unwrap();

        let row2 = compute_row(&store, input("r1", "e2", 2.0, 20.0, 100_000))
            .await
            .unwrap();
        assert!(row2.is_some(), "a different entrant at the same interval is not a duplicate");
    }

    #[test]
    fn percentage_is_none_when_denominator_zero() {
        assert_eq!(percentage(0, 0), None);
        assert_eq!(percentage(500, 1000), Some(50.0));
    }
}
