//! Internal entity types (spec §3). Everything downstream of [`crate::normalize`]
//! works with these, never with the raw upstream shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum lengths for free-text fields, enforced at the normalizer boundary.
pub const RUNNER_CHANGE_MAX: usize = 500;
pub const GEAR_MAX: usize = 200;
pub const OWNERS_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceStatus {
    Open,
    Closed,
    Interim,
    Final,
    Abandoned,
}

impl RaceStatus {
    /// Parses an upstream status string, lower-casing it and coercing the
    /// `Finalized` synonym to `Final` (see DESIGN.md, Open Question 2).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "interim" => Some(Self::Interim),
            "final" | "finalized" => Some(Self::Final),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Ordinal position in the monotone chain `open <= closed <= interim <= final`.
    /// `abandoned` has no place in the chain; it is a sink reachable from any state.
    fn chain_rank(self) -> Option<u8> {
        match self {
            Self::Open => Some(0),
            Self::Closed => Some(1),
            Self::Interim => Some(2),
            Self::Final => Some(3),
            Self::Abandoned => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Interim => "interim",
            Self::Final => "final",
            Self::Abandoned => "abandoned",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition under spec §3's
    /// invariant: the chain only moves forward, `abandoned` is reachable from
    /// anywhere, and nothing leaves `abandoned` or `final`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self == Self::Abandoned {
            return false;
        }
        if next == Self::Abandoned {
            return true;
        }
        match (self.chain_rank(), next.chain_rank()) {
            (Some(from), Some(to)) => to >= from,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Race {
    pub race_id: String,
    pub start_time: DateTime<Utc>,
    pub status: RaceStatus,
    pub last_status_change: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub last_poll_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EntrantOdds {
    pub fixed_win: Option<f64>,
    pub fixed_place: Option<f64>,
    pub pool_win: Option<f64>,
    pub pool_place: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connections {
    pub jockey: Option<String>,
    pub trainer: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormFields {
    pub runner_change: Option<String>,
    pub gear: Option<String>,
    pub owners: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entrant {
    pub entrant_id: String,
    pub race_id: String,
    pub runner_number: u32,
    pub name: String,
    pub is_scratched: bool,
    pub is_late_scratched: bool,
    pub is_emergency: bool,
    pub odds: EntrantOdds,
    pub connections: Connections,
    pub silks: Option<String>,
    pub form: FormFields,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OddsType {
    FixedWin,
    FixedPlace,
    PoolWin,
    PoolPlace,
}

impl OddsType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FixedWin => "fixed_win",
            Self::FixedPlace => "fixed_place",
            Self::PoolWin => "pool_win",
            Self::PoolPlace => "pool_place",
        }
    }
}

/// Append-only (spec §3): a row is written only when the observed value differs
/// from what was previously stored for the same `(entrant_id, type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsHistoryRow {
    pub entrant_id: String,
    pub odds: f64,
    pub r#type: OddsType,
    pub event_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolTotals {
    pub race_id: String,
    pub win_pool_total: i64,
    pub place_pool_total: i64,
    pub quinella_pool_total: i64,
    pub trifecta_pool_total: i64,
    pub exacta_pool_total: i64,
    pub first4_pool_total: i64,
    pub total_race_pool: i64,
    pub currency: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalType {
    FiveMinute,
    OneMinute,
    ThirtySecond,
    Live,
}

impl IntervalType {
    pub fn label(self) -> &'static str {
        match self {
            Self::FiveMinute => "5m",
            Self::OneMinute => "1m",
            Self::ThirtySecond => "30s",
            Self::Live => "live",
        }
    }
}

/// One poll's raw per-entrant contribution, pre-bucketing (spec §3 "raw shape").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMoneyFlowEntry {
    pub race_id: String,
    pub entrant_id: String,
    pub hold_percentage: Option<f64>,
    pub bet_percentage: Option<f64>,
    pub polling_timestamp: DateTime<Utc>,
    pub time_to_start: f64,
    pub win_pool_amount: i64,
    pub place_pool_amount: i64,
}

/// A bucketed, persisted money-flow row (spec §3 "bucketed shape").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketedMoneyFlowRow {
    pub race_id: String,
    pub entrant_id: String,
    pub time_interval: f64,
    pub interval_type: IntervalType,
    pub hold_percentage: f64,
    pub bet_percentage: f64,
    pub win_pool_amount: i64,
    pub place_pool_amount: i64,
    pub incremental_win_amount: i64,
    pub incremental_place_amount: i64,
    pub win_pool_percentage: Option<f64>,
    pub place_pool_percentage: Option<f64>,
    pub polling_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Interim,
    Final,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    pub position: u32,
    pub runner_number: u32,
    pub runner_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dividend {
    pub product_type: String,
    pub amount_cents: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceResults {
    pub race_id: String,
    pub results: Vec<ResultEntry>,
    pub dividends: Vec<Dividend>,
    pub fixed_odds_snapshot: HashMap<u32, EntrantOdds>,
    pub photo_finish: bool,
    pub stewards_inquiry: bool,
    pub protest_lodged: bool,
    pub result_status: ResultStatus,
    pub result_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_chain_is_monotone() {
        assert!(RaceStatus::Open.can_transition_to(RaceStatus::Closed));
        assert!(RaceStatus::Closed.can_transition_to(RaceStatus::Interim));
        assert!(RaceStatus::Interim.can_transition_to(RaceStatus::Final));
        assert!(!RaceStatus::Final.can_transition_to(RaceStatus::Open));
        assert!(!RaceStatus::Closed.can_transition_to(RaceStatus::Open));
    }

    #[test]
    fn abandoned_is_a_sink_reachable_from_anywhere() {
        for status in [
            RaceStatus::Open,
            RaceStatus::Closed,
            RaceStatus::Interim,
            RaceStatus::Final,
        ] {
            assert!(status.can_transition_to(RaceStatus::Abandoned));
        }
        assert!(!RaceStatus::Abandoned.can_transition_to(RaceStatus::Open));
        assert!(RaceStatus::Abandoned.can_transition_to(RaceStatus::Abandoned));
    }

    #[test]
    fn finalized_coerces_to_final() {
        assert_eq!(RaceStatus::parse("Finalized"), Some(RaceStatus::Final));
        assert_eq!(RaceStatus::parse("Final"), Some(RaceStatus::Final));
        assert_eq!(RaceStatus::parse("OPEN"), Some(RaceStatus::Open));
    }
}
