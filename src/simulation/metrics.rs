//! Channel-level metrics derived from a `RunResult`.
//!
//! Contains:
//! - Jain's fairness index over a set of airtimes
//! - Per-family collision probability, normalized occupancy and efficiency
//! - Per-FBE-variant airtime and fairness

use serde::Serialize;
use std::collections::BTreeMap;

use super::types::{Family, FbeKind, Micros, RunResult};

/// Jain's fairness index `(Σa)² / (k · Σa²)`.
///
/// Lies in `(0, 1]` for any non-empty set with at least one non-zero value and equals 1 exactly
/// when all values are equal. Returns 0 for an empty set or when every value is zero.
pub fn jain_fairness(airtimes: &[Micros]) -> f64 {
    let sum: f64 = airtimes.iter().map(|a| *a as f64).sum();
    let sum_of_squares: f64 = airtimes.iter().map(|a| (*a as f64).powi(2)).sum();
    let denominator = airtimes.len() as f64 * sum_of_squares;
    if denominator == 0.0 {
        return 0.0;
    }
    sum * sum / denominator
}

/// Channel usage of one family, or of all families together when `family` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilySummary {
    pub family: Option<Family>,
    pub succeeded: u64,
    pub failed: u64,
    /// `failed / (succeeded + failed)`, 0 without attempts.
    pub collision_probability: f64,
    /// Data plus control airtime of successful attempts over the horizon.
    pub normalized_occupancy: f64,
    /// Data airtime of successful attempts over the horizon.
    pub normalized_efficiency: f64,
}

impl FamilySummary {
    fn new(family: Option<Family>, succeeded: u64, failed: u64, occupied: Micros, payload: Micros, horizon: Micros) -> Self {
        let attempts = succeeded + failed;
        let ratio = |part: f64, whole: f64| if whole == 0.0 { 0.0 } else { part / whole };
        Self {
            family,
            succeeded,
            failed,
            collision_probability: ratio(failed as f64, attempts as f64),
            normalized_occupancy: ratio(occupied as f64, horizon as f64),
            normalized_efficiency: ratio(payload as f64, horizon as f64),
        }
    }
}

/// Per-family summaries followed by the all-family summary.
pub fn family_summaries(result: &RunResult) -> Vec<FamilySummary> {
    let mut summaries: Vec<FamilySummary> = Family::ALL
        .iter()
        .map(|family| {
            let c = result.counters(*family);
            FamilySummary::new(Some(*family), c.succeeded, c.failed, c.occupied_time, c.payload_time, result.horizon)
        })
        .collect();
    let (succeeded, failed, occupied, payload) = summaries.iter().zip(Family::ALL).fold((0, 0, 0, 0), |acc, (s, family)| {
        let c = result.counters(family);
        (acc.0 + s.succeeded, acc.1 + s.failed, acc.2 + c.occupied_time, acc.3 + c.payload_time)
    });
    summaries.push(FamilySummary::new(None, succeeded, failed, occupied, payload, result.horizon));
    summaries
}

/// Airtime statistics of all FBE entities of one variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantSummary {
    pub variant: FbeKind,
    pub entities: usize,
    pub total_airtime: Micros,
    pub mean_airtime: f64,
    pub fairness: f64,
}

/// One summary per FBE variant present in the run, in variant order.
pub fn fbe_variant_summaries(result: &RunResult) -> Vec<VariantSummary> {
    let mut by_variant: BTreeMap<FbeKind, Vec<Micros>> = BTreeMap::new();
    for entity in &result.entities {
        if let Some(variant) = entity.variant {
            by_variant.entry(variant).or_default().push(entity.stats.airtime);
        }
    }
    by_variant
        .into_iter()
        .map(|(variant, airtimes)| {
            let total: Micros = airtimes.iter().sum();
            VariantSummary { variant, entities: airtimes.len(), total_airtime: total, mean_airtime: total as f64 / airtimes.len() as f64, fairness: jain_fairness(&airtimes) }
        })
        .collect()
}

/// Fairness over every FBE entity of the run.
pub fn fbe_fairness(result: &RunResult) -> f64 {
    let airtimes: Vec<Micros> = result.entities.iter().filter(|e| e.family == Family::Fbe).map(|e| e.stats.airtime).collect();
    jain_fairness(&airtimes)
}
