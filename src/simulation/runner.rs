//! Entry point of one simulation run.
//!
//! `run` validates the entity configurations, builds a fresh executor, channel and random stream,
//! spawns the entities in configuration order and drives them to the horizon. Everything shared is
//! created per run, so runs are independent and a seed reproduces a run exactly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{info, warn};

use super::channel::Channel;
use super::entity::EntityContext;
use super::executor::Executor;
use super::fbe::{Fbe, FbeTimers};
use super::gnb::Gnb;
use super::rng::SimRng;
use super::station::Station;
use super::types::{
    ConfigWarning, EntityConfig, EntityReport, EntityStats, EventKind, Family, FbeKind, FbeVariant, Micros, RunResult, SimulationError,
};

/// Rejects configurations that cannot be clamped into something meaningful.
pub fn validate(config: &EntityConfig) -> Result<(), String> {
    match config {
        EntityConfig::Wifi(c) => {
            if c.cw_min > c.cw_max {
                return Err(format!("WiFi cw_min ({}) exceeds cw_max ({})", c.cw_min, c.cw_max));
            }
        }
        EntityConfig::Nru(c) => {
            if c.cw_min > c.cw_max {
                return Err(format!("NR-U cw_min ({}) exceeds cw_max ({})", c.cw_min, c.cw_max));
            }
            if c.sync_slot_duration == 0 || c.observation_slot_duration == 0 {
                return Err("NR-U slot durations must be positive".to_string());
            }
            if c.sync_desync_bounds.0 > c.sync_desync_bounds.1 {
                return Err(format!("NR-U desync bounds {:?} are reversed", c.sync_desync_bounds));
            }
            if c.mcot == 0 {
                return Err("NR-U mcot must be positive".to_string());
            }
        }
        EntityConfig::Fbe(c) => {
            if c.ffp == 0 {
                return Err("FBE ffp must be positive".to_string());
            }
            match c.variant {
                FbeVariant::RandomMuting { max_frames_in_a_row, max_muted_periods } if max_frames_in_a_row == 0 || max_muted_periods == 0 => {
                    return Err("random-muting FBE limits must be positive".to_string());
                }
                FbeVariant::DeterministicBackoff { max_retransmissions: 0, .. } => {
                    return Err("deterministic-backoff FBE max_retransmissions must be positive".to_string());
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Assigns every entity its configured name or a default such as `Station 2` or
/// `(Floating FBE) 1`, numbered per family (per variant for FBE).
pub fn entity_names(configs: &[EntityConfig]) -> Vec<String> {
    let mut family_counts: HashMap<Family, usize> = HashMap::new();
    let mut fbe_counts: HashMap<FbeKind, usize> = HashMap::new();
    configs
        .iter()
        .map(|config| {
            let label = match config {
                EntityConfig::Wifi(_) => {
                    let n = family_counts.entry(Family::Wifi).or_default();
                    *n += 1;
                    format!("Station {}", n)
                }
                EntityConfig::Nru(_) => {
                    let n = family_counts.entry(Family::Nru).or_default();
                    *n += 1;
                    format!("Gnb {}", n)
                }
                EntityConfig::Fbe(c) => {
                    let kind = c.variant.kind();
                    let n = fbe_counts.entry(kind).or_default();
                    *n += 1;
                    format!("({}) {}", kind, n)
                }
            };
            config.name().map(str::to_string).unwrap_or(label)
        })
        .collect()
}

/// Runs one simulation of `configs` until `horizon` with the given seed.
pub fn run(horizon: Micros, seed: u64, configs: &[EntityConfig]) -> Result<RunResult, SimulationError> {
    for config in configs {
        validate(config).map_err(SimulationError::InvalidConfig)?;
    }
    let names = entity_names(configs);
    info!("Starting run: {} entities, horizon {} µs, seed {}", configs.len(), horizon, seed);

    let mut executor = Executor::new(horizon);
    let channel = Channel::new(executor.handle());
    let rng = SimRng::seed_from_u64(seed);
    let mut warnings = Vec::new();
    let mut entities = Vec::with_capacity(configs.len());

    for (id, (config, name)) in configs.iter().zip(names).enumerate() {
        let stats = Rc::new(RefCell::new(EntityStats::default()));
        let ctx = EntityContext { id, name: name.clone(), family: config.family(), channel: channel.clone(), rng: rng.clone(), stats: stats.clone() };
        let variant = match config {
            EntityConfig::Wifi(c) => {
                Station::spawn(ctx, c.clone());
                None
            }
            EntityConfig::Nru(c) => {
                Gnb::spawn(ctx, c.clone());
                None
            }
            EntityConfig::Fbe(c) => {
                let (timers, clamped) = FbeTimers::new(c.ffp, c.cot, c.cca_slots);
                for message in clamped {
                    warn!("[{}] {}", name, message);
                    warnings.push(ConfigWarning { entity: name.clone(), message });
                }
                Fbe::spawn(ctx, c.clone(), timers);
                Some(c.variant.kind())
            }
        };
        entities.push((name, config.family(), variant, stats));
    }

    executor.run()?;

    let records = channel.take_records();
    let entities: Vec<EntityReport> = entities
        .into_iter()
        .map(|(name, family, variant, stats)| EntityReport { name, family, variant, stats: stats.borrow().clone() })
        .collect();
    info!("Run finished: {} events, {} collisions", records.events.len(), records.events.iter().filter(|e| e.kind == EventKind::Collision).count());

    Ok(RunResult {
        horizon,
        seed,
        entities,
        events: records.events,
        counters: records.counters,
        backoff_trace: records.backoff_trace,
        backoff_histogram: records.backoff_histogram,
        warnings,
    })
}

/// Runs the same configuration once per seed.
pub fn run_batch(horizon: Micros, seeds: &[u64], configs: &[EntityConfig]) -> Result<Vec<RunResult>, SimulationError> {
    seeds.iter().map(|seed| run(horizon, *seed, configs)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::types::{FbeConfig, NruAccessMode, NruConfig, WifiConfig};

    fn wifi() -> EntityConfig {
        EntityConfig::Wifi(WifiConfig::default())
    }

    fn standard_fbe(offset: Micros) -> EntityConfig {
        EntityConfig::Fbe(FbeConfig::new(10_000, 9_500, FbeVariant::Standard).with_offset(offset))
    }

    fn mixed() -> Vec<EntityConfig> {
        vec![
            wifi(),
            wifi(),
            EntityConfig::Nru(NruConfig::default()),
            EntityConfig::Nru(NruConfig { access_mode: NruAccessMode::ReservationSignal, ..NruConfig::default() }),
            standard_fbe(0),
            EntityConfig::Fbe(FbeConfig::new(10_000, 5_000, FbeVariant::Floating)),
            EntityConfig::Fbe(FbeConfig::new(8_000, 6_000, FbeVariant::DeterministicBackoff { max_retransmissions: 5, init_backoff_value: 3, threshold: 4 })),
        ]
    }

    #[test]
    fn lone_station_has_no_collisions() {
        let result = run(1_000_000, 1, &[wifi()]).unwrap();
        let station = result.entity("Station 1").unwrap();
        assert!(station.stats.succeeded > 0);
        assert_eq!(station.stats.failed, 0);
        assert_eq!(result.collisions(), 0);
    }

    #[test]
    fn two_stations_collide_and_share_attempts() {
        let result = run(1_000_000, 7, &[wifi(), wifi()]).unwrap();
        assert!(result.collisions() > 0);
        let attempts: Vec<u64> = result.entities.iter().map(|e| e.stats.succeeded + e.stats.failed).collect();
        let (low, high) = (attempts[0].min(attempts[1]), attempts[0].max(attempts[1]));
        assert!(low > 0);
        assert!((high - low) * 5 <= high, "attempts {:?} are unbalanced", attempts);
        // Both stations of a collision record it.
        assert_eq!(result.entities[0].stats.failed, result.entities[1].stats.failed);
    }

    #[test]
    fn lone_gnb_is_aligned_to_its_sync_slots() {
        let result = run(1_000_000, 3, &[EntityConfig::Nru(NruConfig::default())]).unwrap();
        let gnb = result.entity("Gnb 1").unwrap();
        let desync = gnb.stats.sync_offset.unwrap();
        assert!(gnb.stats.succeeded > 0);
        for event in &result.events {
            assert_eq!(event.kind, EventKind::Success);
            assert_eq!((event.started_at - desync) % 1000, 0);
        }
    }

    #[test]
    fn lone_standard_fbe_occupies_cot_every_period() {
        let result = run(1_000_000, 0, &[standard_fbe(0)]).unwrap();
        let fbe = result.entity("(Standard FBE) 1").unwrap();
        assert_eq!(fbe.stats.cca_busy, 0);
        assert_eq!(fbe.stats.succeeded, 100);
        assert_eq!(fbe.stats.airtime, fbe.stats.succeeded * 9_500);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn same_seed_reproduces_the_run() {
        let first = run(300_000, 42, &mixed()).unwrap();
        let second = run(300_000, 42, &mixed()).unwrap();
        assert_eq!(first, second);
        assert!(!first.events.is_empty());
    }

    #[test]
    fn every_attempt_lands_in_one_counter() {
        let result = run(500_000, 9, &mixed()).unwrap();
        for family in Family::ALL {
            let counters = result.counters(family);
            let (succeeded, failed) = result
                .entities
                .iter()
                .filter(|e| e.family == family)
                .fold((0, 0), |(s, f), e| (s + e.stats.succeeded, f + e.stats.failed));
            assert_eq!((counters.succeeded, counters.failed), (succeeded, failed));
        }
        let attempts: u64 = result.entities.iter().map(|e| e.stats.succeeded + e.stats.failed).sum();
        assert_eq!(attempts as usize, result.events.len());
    }

    #[test]
    fn fbe_flagged_by_wifi_activity_still_accounts_airtime() {
        let result = run(500_000, 5, &[wifi(), standard_fbe(0)]).unwrap();
        let fbe = result.entity("(Standard FBE) 1").unwrap();
        assert!(fbe.stats.succeeded + fbe.stats.failed > 0);
        assert_eq!(fbe.stats.airtime, fbe.stats.succeeded * 9_500);
        assert_eq!(result.counters(Family::Fbe).payload_time, fbe.stats.airtime);
    }

    #[test]
    fn batch_runs_once_per_seed() {
        let results = run_batch(100_000, &[1, 2, 3], &[wifi(), wifi()]).unwrap();
        assert_eq!(results.iter().map(|r| r.seed).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn clamped_values_are_reported() {
        let config = EntityConfig::Fbe(FbeConfig::new(10_000, 9_990, FbeVariant::Standard));
        let result = run(50_000, 0, &[config]).unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].entity, "(Standard FBE) 1");
    }

    #[test]
    fn impossible_configuration_is_rejected() {
        let config = EntityConfig::Wifi(WifiConfig { cw_min: 64, cw_max: 15, ..WifiConfig::default() });
        assert!(matches!(run(1_000, 0, &[config]), Err(SimulationError::InvalidConfig(_))));
        let config = EntityConfig::Fbe(FbeConfig::new(0, 0, FbeVariant::Standard));
        assert!(matches!(run(1_000, 0, &[config]), Err(SimulationError::InvalidConfig(_))));
    }

    #[test]
    fn default_names_are_numbered_per_kind() {
        let mut named = FbeConfig::new(10_000, 5_000, FbeVariant::Floating);
        named.name = Some("edge".into());
        let names = entity_names(&[wifi(), standard_fbe(0), wifi(), standard_fbe(10), EntityConfig::Fbe(named), EntityConfig::Nru(NruConfig::default())]);
        assert_eq!(names, vec!["Station 1", "(Standard FBE) 1", "Station 2", "(Standard FBE) 2", "edge", "Gnb 1"]);
    }
}
