//! Odds-History Writer (component C, spec §4.3). A pure function computing
//! which rows to append, kept separate from I/O the way the teacher separates
//! `extract_odds_snapshot` (pure) from `store_snapshots` (I/O).

use crate::domain::{Entrant, EntrantOdds, OddsHistoryRow, OddsType};
use chrono::Utc;

/// Returns one [`OddsHistoryRow`] per field whose value differs from the
/// prior stored entrant (numeric equality, no tolerance — spec §4.3). If
/// `previous` is `None`, every present field is recorded as its first
/// observation.
pub fn rows_to_append(entrant_id: &str, new_odds: EntrantOdds, previous: Option<&Entrant>) -> Vec<OddsHistoryRow> {
    let now = Utc::now();
    let prev_odds = previous.map(|e| e.odds);

    let fields: [(OddsType, Option<f64>); 4] = [
        (OddsType::FixedWin, new_odds.fixed_win),
        (OddsType::FixedPlace, new_odds.fixed_place),
        (OddsType::PoolWin, new_odds.pool_win),
        (OddsType::PoolPlace, new_odds.pool_place),
    ];

    fields
        .into_iter()
        .filter_map(|(odds_type, value)| {
            let value = value?;
            let changed = match prev_odds {
                None => true,
                Some(prev) => {
                    let prev_value = match odds_type {
                        OddsType::FixedWin => prev.fixed_win,
                        OddsType::FixedPlace => prev.fixed_place,
                        OddsType::PoolWin => prev.pool_win,
                        OddsType::PoolPlace => prev.pool_place,
                    };
                    prev_value != Some(value)
                }
            };
            changed.then_some(OddsHistoryRow {
                entrant_id: entrant_id.to_string(),
                odds: value,
                r#type: odds_type,
                event_timestamp: now,
            })
        })
        .collect()
}
