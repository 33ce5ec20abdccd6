//! Pool Totals Writer (component D, spec §4.4). Aggregates the upstream
//! `tote_pools[]` array into a [`PoolTotals`] row and converts every amount to
//! integer minor units on write (spec §9: conversion exactly once at the
//! boundary).

use crate::domain::PoolTotals;
use crate::upstream::UpstreamPoolEntry;
use chrono::Utc;
use tracing::warn;

/// Converts a dollar amount to integer cents. The single point where float
/// dollars become integer minor units (spec §9).
fn to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}

/// Builds a [`PoolTotals`] from the upstream pool entries (spec §4.4 mapping).
/// `totalRacePool` sums every entry encountered, including unknown product
/// types (logged, not discarded).
pub fn aggregate_pool_totals(race_id: &str, entries: &[UpstreamPoolEntry], currency: &str) -> PoolTotals {
    let mut totals = PoolTotals {
        race_id: race_id.to_string(),
        win_pool_total: 0,
        place_pool_total: 0,
        quinella_pool_total: 0,
        trifecta_pool_total: 0,
        exacta_pool_total: 0,
        first4_pool_total: 0,
        total_race_pool: 0,
        currency: currency.to_string(),
        last_updated: Utc::now(),
    };

    for entry in entries {
        let cents = to_cents(entry.total);
        totals.total_race_pool += cents;

        match entry.product_type.as_str() {
            "Win" => totals.win_pool_total += cents,
            "Place" => totals.place_pool_total += cents,
            "Quinella" => totals.quinella_pool_total += cents,
            "Trifecta" => totals.trifecta_pool_total += cents,
            "Exacta" => totals.exacta_pool_total += cents,
            "First 4" | "First Four" => totals.first4_pool_total += cents,
            other => warn!("unknown tote pool product type: {}", other),
        }
    }

    totals
}
