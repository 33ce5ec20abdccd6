//! Race-State Updater (component G, spec §4.7). Advances race status along
//! the monotone chain, stamps `finalizedAt`/`abandonedAt`, and maintains the
//! derived `RaceResults` document.

use crate::domain::{Dividend, Entrant, EntrantOdds, Race, RaceResults, RaceStatus, ResultEntry, ResultStatus};
use crate::error::IngestError;
use crate::store::Store;
use crate::upstream::{UpstreamDividend, UpstreamResultEntry};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::warn;

fn to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}

/// Reads the stored race (if any), applies the incoming status, and persists
/// the result. Illegal transitions (spec §3 invariant) are logged and
/// ignored rather than rejected — the poll continues with the prior status.
pub async fn update_status(
    store: &dyn Store,
    race_id: &str,
    start_time: DateTime<Utc>,
    incoming_status: RaceStatus,
    now: DateTime<Utc>,
) -> Result<Race, IngestError> {
    let existing = store.get_race(race_id).await?;

    let race = match existing {
        None => Race {
            race_id: race_id.to_string(),
            start_time,
            status: incoming_status,
            last_status_change: now,
            finalized_at: (incoming_status == RaceStatus::Final).then_some(now),
            abandoned_at: (incoming_status == RaceStatus::Abandoned).then_some(now),
            last_poll_time: None,
        },
        Some(current) => {
            if current.status == incoming_status {
                current
            } else if current.status.can_transition_to(incoming_status) {
                Race {
                    status: incoming_status,
                    last_status_change: now,
                    // finalizedAt is immutable once set (spec §3).
                    finalized_at: current
                        .finalized_at
                        .or((incoming_status == RaceStatus::Final).then_some(now)),
                    abandoned_at: current
                        .abandoned_at
                        .or((incoming_status == RaceStatus::Abandoned).then_some(now)),
                    ..current
                }
            } else {
                warn!(
                    race_id,
                    from = current.status.as_str(),
                    to = incoming_status.as_str(),
                    "illegal race-status transition ignored"
                );
                current
            }
        }
    };

    store.upsert_race(&race).await?;
    Ok(race)
}

/// Whether results processing should run at all this poll (spec §4.7:
/// "when results[] or dividends[] are present").
pub fn should_write_results(has_results: bool, has_dividends: bool) -> bool {
    has_results || has_dividends
}

fn scan_dividend_statuses(dividends: &[UpstreamDividend], needle: &str) -> bool {
    dividends
        .iter()
        .any(|d| d.status.as_deref().unwrap_or("").to_lowercase().contains(needle))
}

/// Keys the current odds snapshot by `runnerNumber` (spec §4.7: "from the
/// current `runners[]` or `entrants[]` odds").
pub fn snapshot_odds_by_runner_number(entrants: &[Entrant]) -> HashMap<u32, EntrantOdds> {
    entrants.iter().map(|e| (e.runner_number, e.odds)).collect()
}

/// Builds the updated [`RaceResults`] document. `prior` is the
/// previously-stored results row, if any, used to (a) keep `resultStatus`
/// monotone interim→final and (b) capture `fixedOddsSnapshot` only once, at
/// the moment results first become available (spec §4.7).
pub fn build_race_results(
    race_id: &str,
    status: RaceStatus,
    upstream_results: &[UpstreamResultEntry],
    upstream_dividends: &[UpstreamDividend],
    current_odds_snapshot: &HashMap<u32, EntrantOdds>,
    prior: Option<&RaceResults>,
    now: DateTime<Utc>,
) -> RaceResults {
    let results: Vec<ResultEntry> = upstream_results
        .iter()
        .filter_map(|r| {
            Some(ResultEntry {
                position: r.position?,
                runner_number: r.runner_number?,
                runner_name: r.runner_name.clone().unwrap_or_default(),
            })
        })
        .collect();

    let dividends: Vec<Dividend> = upstream_dividends
        .iter()
        .filter_map(|d| {
            Some(Dividend {
                product_type: d.product_type.clone()?,
                amount_cents: to_cents(d.amount?),
                status: d.status.clone().unwrap_or_default(),
            })
        })
        .collect();

    let fixed_odds_snapshot = match prior {
        Some(p) if !p.fixed_odds_snapshot.is_empty() => p.fixed_odds_snapshot.clone(),
        _ => current_odds_snapshot.clone(),
    };

    let result_status = match prior.map(|p| p.result_status) {
        Some(ResultStatus::Final) => ResultStatus::Final,
        _ if status == RaceStatus::Final => ResultStatus::Final,
        _ => ResultStatus::Interim,
    };

    RaceResults {
        race_id: race_id.to_string(),
        results,
        dividends,
        fixed_odds_snapshot,
        photo_finish: scan_dividend_statuses(upstream_dividends, "photo"),
        stewards_inquiry: scan_dividend_statuses(upstream_dividends, "inquiry"),
        protest_lodged: scan_dividend_statuses(upstream_dividends, "protest"),
        result_status,
        result_time: now,
    }
}
