//! Money-Flow Aggregator (component E, spec §4.5). Sums repeated per-entrant
//! money-tracker entries into one `(hold%, bet%)` pair per entrant per poll.

use crate::domain::RaceStatus;
use crate::upstream::UpstreamMoneyTrackerEntry;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregatedEntry {
    pub hold_percentage: f64,
    pub bet_percentage: f64,
}

/// Sums `hold_percentage`/`bet_percentage` across every entry sharing an
/// `entrantId` (spec §4.5, §8 scenario S7). Warns (doesn't abort) when the
/// sum of aggregated hold% across entrants deviates from 100% by more than
/// 5 points (spec §8 invariant 4).
pub fn aggregate(entries: &[UpstreamMoneyTrackerEntry]) -> HashMap<String, AggregatedEntry> {
    let mut aggregated: HashMap<String, AggregatedEntry> = HashMap::new();

    for entry in entries {
        let slot = aggregated.entry(entry.entrant_id.clone()).or_default();
        slot.hold_percentage += entry.hold_percentage.unwrap_or(0.0);
        slot.bet_percentage += entry.bet_percentage.unwrap_or(0.0);
    }

    let hold_sum: f64 = aggregated.values().map(|e| e.hold_percentage).sum();
    if !aggregated.is_empty() && !(95.0..=105.0).contains(&hold_sum) {
        warn!(
            "aggregated hold% sum {:.2} outside tolerance [95, 105]",
            hold_sum
        );
    }

    aggregated
}

/// Whether money-flow processing should be skipped entirely for this poll
/// (spec §4.5 filtering rule): only when the race is abandoned *and* no prior
/// money-flow row exists — i.e. it was abandoned pre-market.
pub fn should_skip(status: RaceStatus, has_prior_money_flow_row: bool) -> bool {
    status == RaceStatus::Abandoned && !has_prior_money_flow_row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(entrant_id: &str, hold: f64) -> UpstreamMoneyTrackerEntry {
        UpstreamMoneyTrackerEntry {
            entrant_id: entrant_id.to_string(),
            hold_percentage: Some(hold),
            bet_percentage: None,
        }
    }

    /// Spec §8 scenario S7: entrants [{A,4},{A,3},{B,2}] -> A=7, B=2, one row each.
    #[test]
    fn s7_aggregation_sum_rule() {
        let entries = vec![entry("A", 4.0), entry("A", 3.0), entry("B", 2.0)];
        let result = aggregate(&entries);
        assert_eq!(result.len(), 2);
        assert_eq!(result["A"].hold_percentage, 7.0);
        assert_eq!(result["B"].hold_percentage, 2.0);
    }

    #[test]
    fn s6_abandoned_with_no_prior_row_is_skipped() {
        assert!(should_skip(RaceStatus::Abandoned, false));
    }

    #[test]
    fn abandoned_with_prior_row_continues_processing() {
        assert!(!should_skip(RaceStatus::Abandoned, true));
    }

    #[test]
    fn non_abandoned_statuses_never_skip() {
        for status in [
            RaceStatus::Open,
            RaceStatus::Closed,
            RaceStatus::Interim,
            RaceStatus::Final,
        ] {
            assert!(!should_skip(status, false));
        }
    }
}
