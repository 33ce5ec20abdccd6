//! Payload Normalizer (component B, spec §4.2). Converts the upstream
//! snake_case envelope into strongly-typed internal records. Mirrors the
//! teacher's `extract_odds_snapshot` field-mapping style: one small function
//! per concern, `Option` used for "absent" rather than defaulting to zero.

use crate::domain::{Connections, Entrant, EntrantOdds, FormFields, GEAR_MAX, OWNERS_MAX, RUNNER_CHANGE_MAX};
use crate::error::IngestError;
use crate::upstream::UpstreamEntrant;
use chrono::Utc;

/// Stringifies a JSON scalar the way a human would read it, then truncates to
/// `max_len` chars. Spec §4.2: "stringify non-string values before truncation".
fn stringify_and_truncate(value: &serde_json::Value, max_len: usize) -> Option<String> {
    let s = match value {
        serde_json::Value::Null => return None,
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(s.chars().take(max_len).collect())
}

fn truncate_opt(value: &Option<serde_json::Value>, max_len: usize) -> Option<String> {
    value.as_ref().and_then(|v| stringify_and_truncate(v, max_len))
}

/// Normalizes a single upstream entrant into an internal [`Entrant`].
///
/// Returns a structured [`IngestError::Validation`] listing missing required
/// field paths (`entrantId`, `raceId`, `runnerNumber`, `name`) rather than
/// panicking or silently defaulting them.
pub fn normalize_entrant(raw: &UpstreamEntrant, fallback_race_id: &str) -> Result<Entrant, IngestError> {
    let mut missing = Vec::new();
    if raw.entrant_id.is_empty() {
        missing.push("entrants[].entrant_id".to_string());
    }
    let runner_number = raw.runner_number;
    if runner_number.is_none() {
        missing.push("entrants[].runner_number".to_string());
    }
    let name = raw.name.clone();
    if name.is_none() {
        missing.push("entrants[].name".to_string());
    }
    if !missing.is_empty() {
        return Err(IngestError::Validation { fields: missing });
    }

    let race_id = raw.race_id.clone().unwrap_or_else(|| fallback_race_id.to_string());

    Ok(Entrant {
        entrant_id: raw.entrant_id.clone(),
        race_id,
        runner_number: runner_number.unwrap(),
        name: name.unwrap(),
        is_scratched: raw.is_scratched.unwrap_or(false),
        is_late_scratched: raw.is_late_scratched.unwrap_or(false),
        is_emergency: raw.is_emergency.unwrap_or(false),
        odds: EntrantOdds {
            fixed_win: raw.fixed_win,
            fixed_place: raw.fixed_place,
            pool_win: raw.pool_win,
            pool_place: raw.pool_place,
        },
        connections: Connections {
            jockey: raw.jockey.clone(),
            trainer: raw.trainer.clone(),
        },
        silks: raw.silk_colours.clone(),
        form: FormFields {
            runner_change: truncate_opt(&raw.runner_change, RUNNER_CHANGE_MAX),
            gear: truncate_opt(&raw.gear, GEAR_MAX),
            owners: truncate_opt(&raw.owners, OWNERS_MAX),
        },
        last_updated: Utc::now(),
    })
}

/// Normalizes every entrant in a batch, collecting successes and failures
/// separately so one bad row doesn't drop the rest (spec §4.8: per-row
/// failures never block siblings).
pub fn normalize_entrants(
    raw_entrants: &[UpstreamEntrant],
    fallback_race_id: &str,
) -> (Vec<Entrant>, Vec<IngestError>) {
    let mut ok = Vec::new();
    let mut errs = Vec::new();
    for raw in raw_entrants {
        match normalize_entrant(raw, fallback_race_id) {
            Ok(e) => ok.push(e),
            Err(e) => errs.push(e),
        }
    }
    (ok, errs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_entrant() -> UpstreamEntrant {
        UpstreamEntrant {
            entrant_id: "e1".to_string(),
            race_id: Some("r1".to_string()),
            runner_number: Some(4),
            name: Some("Speedy".to_string()),
            is_scratched: None,
            is_late_scratched: None,
            is_emergency: None,
            fixed_win: Some(3.5),
            fixed_place: None,
            pool_win: None,
            pool_place: None,
            jockey: Some("J. Rider".to_string()),
            trainer: None,
            silk_colours: None,
            runner_change: None,
            gear: None,
            owners: None,
        }
    }

    #[test]
    fn absent_optional_fields_stay_unset_not_zero() {
        let entrant = normalize_entrant(&base_entrant(), "r1").unwrap();
        assert_eq!(entrant.odds.fixed_place, None);
        assert!(!entrant.is_scratched);
    }

    #[test]
    fn missing_required_fields_produce_validation_error() {
        let mut raw = base_entrant();
        raw.runner_number = None;
        raw.name = None;
        let err = normalize_entrant(&raw, "r1").unwrap_err();
        match err {
            IngestError::Validation { fields } => {
                assert!(fields.iter().any(|f| f.contains("runner_number")));
                assert!(fields.iter().any(|f| f.contains("name")));
            }
            _ => panic!("expected Validation error"),
        }
    }

    #[test]
    fn free_text_fields_truncate_to_persisted_maximum() {
        let mut raw = base_entrant();
        raw.gear = Some(serde_json::Value::String("x".repeat(300)));
        raw.owners = Some(serde_json::Value::String("y".repeat(400)));
        let entrant = normalize_entrant(&raw, "r1").unwrap();
        assert_eq!(entrant.form.gear.unwrap().len(), GEAR_MAX);
        assert_eq!(entrant.form.owners.unwrap().len(), OWNERS_MAX);
    }

    #[test]
    fn non_string_values_are_stringified_before_truncation() {
        let mut raw = base_entrant();
        raw.runner_change = Some(serde_json::json!({"note": "blinkers on"}));
        let entrant = normalize_entrant(&raw, "r1").unwrap();
        assert!(entrant.form.runner_change.unwrap().contains("blinkers"));
    }

    #[test]
    fn one_bad_row_does_not_block_the_rest() {
        let mut bad = base_entrant();
        bad.runner_number = None;
        let good = base_entrant();
        let (ok, errs) = normalize_entrants(&[bad, good], "r1");
        assert_eq!(ok.len(), 1);
        assert_eq!(errs.len(), 1);
    }
}
