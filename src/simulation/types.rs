//! Type definitions for the simulation.
//!
//! Contains the data structures shared across the simulation:
//! - Per-family entity configuration (WiFi, NR-U, FBE) as loaded from scenarios
//! - Protocol family and FBE variant tags
//! - Event log records and per-entity counters
//! - The `RunResult` handed to reporting collaborators

use serde::{Deserialize, Serialize};
use std::fmt;

/// Virtual time and durations, in microseconds.
pub type Micros = u64;

/// Index of an entity within one run (its position in the configuration list).
pub type EntityId = usize;

/// Arbitration keys are `ARBITRATION_KEY_BASE - duration`, so longer transmissions produce
/// smaller keys and win arbitration.
pub const ARBITRATION_KEY_BASE: u64 = 100_000_000;

/// Protocol family an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// IEEE 802.11 DCF station.
    Wifi,
    /// NR-U gNB running Cat-4 style LBT.
    Nru,
    /// NR-U frame based equipment.
    Fbe,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Wifi, Family::Nru, Family::Fbe];
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Wifi => write!(f, "WiFi"),
            Family::Nru => write!(f, "NR-U"),
            Family::Fbe => write!(f, "FBE"),
        }
    }
}

/// Outcome of one transmission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Success,
    Collision,
}

impl EventKind {
    /// Collision rule shared by every family: exactly one entity in the
    /// occupancy round means success, zero or several mean failure.
    pub fn from_attempts(attempts: usize) -> Self {
        if attempts == 1 { EventKind::Success } else { EventKind::Collision }
    }
}

/// Immutable entry of the channel event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    /// Virtual time at which the attempt resolved.
    pub time: Micros,
    /// Virtual time at which the attempt started occupying the channel.
    pub started_at: Micros,
    pub entity: String,
    pub family: Family,
    pub kind: EventKind,
}

/// Kind of a deterministic-backoff trace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// Backoff counter value (selected or decremented).
    Backoff,
    /// Interrupt counter value after a busy CCA or a reselection.
    InterruptCounter,
}

/// One change of a deterministic-backoff FBE counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackoffTraceRecord {
    pub time: Micros,
    pub entity: String,
    pub kind: TraceKind,
    pub value: u32,
    /// True when the value comes from a fresh selection rather than a decrement.
    pub is_selection: bool,
}

fn default_cw_min() -> u32 {
    15
}

fn default_cw_max() -> u32 {
    63
}

fn default_retry_limit() -> u32 {
    7
}

/// IEEE 802.11 DCF station parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub name: Option<String>,
    pub cw_min: u32,
    pub cw_max: u32,
    /// Retransmissions allowed before the frame is dropped.
    pub retry_limit: u32,
    /// MSDU payload size in bytes.
    pub payload_size: u32,
    /// OFDM rate index, 0..=7 (6 to 54 Mb/s).
    pub mcs: u8,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self { name: None, cw_min: default_cw_min(), cw_max: default_cw_max(), retry_limit: default_retry_limit(), payload_size: 1472, mcs: 7 }
    }
}

/// How an NR-U gNB lines its transmissions up with synchronization slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NruAccessMode {
    /// Idle gap before the countdown so that it ends on a slot boundary.
    #[default]
    Gap,
    /// Count down immediately and fill up to the boundary with a reservation signal.
    ReservationSignal,
}

/// NR-U LBT parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NruConfig {
    pub name: Option<String>,
    /// Defer period of the prioritization period (µs).
    pub deter_period: Micros,
    /// Observation slot duration (µs).
    pub observation_slot_duration: Micros,
    /// Synchronization slot length (µs).
    pub sync_slot_duration: Micros,
    /// Inclusive bounds of the random initial desynchronization (µs).
    pub sync_desync_bounds: (Micros, Micros),
    /// Observation slots appended to the defer period.
    #[serde(rename = "M", alias = "m")]
    pub m: u32,
    pub cw_min: u32,
    pub cw_max: u32,
    /// Maximum channel occupancy time in milliseconds.
    pub mcot: u32,
    pub retry_limit: u32,
    pub access_mode: NruAccessMode,
}

impl Default for NruConfig {
    fn default() -> Self {
        Self {
            name: None,
            deter_period: 16,
            observation_slot_duration: 9,
            sync_slot_duration: 1000,
            sync_desync_bounds: (0, 1000),
            m: 3,
            cw_min: default_cw_min(),
            cw_max: default_cw_max(),
            mcot: 6,
            retry_limit: default_retry_limit(),
            access_mode: NruAccessMode::Gap,
        }
    }
}

impl NruConfig {
    /// Prioritization period: defer period plus `M` observation slots.
    pub fn prioritization_period(&self) -> Micros {
        self.deter_period + self.m as Micros * self.observation_slot_duration
    }

    /// Full occupancy of one transmission in microseconds.
    pub fn mcot_micros(&self) -> Micros {
        self.mcot as Micros * 1000
    }
}

/// How a CCA that is interrupted mid-sense is concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CcaCredit {
    /// Keep sensing until the full CCA duration elapsed, then report busy.
    #[default]
    TopUp,
    /// Report busy at the interruption instant; only the elapsed part is spent.
    Elapsed,
}

fn default_max_frames_in_a_row() -> u32 {
    5
}

fn default_random_max_muted_periods() -> u32 {
    5
}

fn default_fixed_max_muted_periods() -> u32 {
    1
}

fn default_max_retransmissions() -> u32 {
    5
}

fn default_init_backoff_value() -> u32 {
    3
}

fn default_threshold() -> u32 {
    4
}

/// FBE variant together with its variant specific parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum FbeVariant {
    Standard,
    RandomMuting {
        #[serde(default = "default_max_frames_in_a_row")]
        max_frames_in_a_row: u32,
        #[serde(default = "default_random_max_muted_periods")]
        max_muted_periods: u32,
    },
    FixedMuting {
        #[serde(default = "default_fixed_max_muted_periods")]
        max_muted_periods: u32,
    },
    Floating,
    DeterministicBackoff {
        #[serde(default = "default_max_retransmissions")]
        max_retransmissions: u32,
        #[serde(default = "default_init_backoff_value")]
        init_backoff_value: u32,
        #[serde(default = "default_threshold")]
        threshold: u32,
    },
}

impl FbeVariant {
    pub fn kind(&self) -> FbeKind {
        match self {
            FbeVariant::Standard => FbeKind::Standard,
            FbeVariant::RandomMuting { .. } => FbeKind::RandomMuting,
            FbeVariant::FixedMuting { .. } => FbeKind::FixedMuting,
            FbeVariant::Floating => FbeKind::Floating,
            FbeVariant::DeterministicBackoff { .. } => FbeKind::DeterministicBackoff,
        }
    }
}

/// Parameterless FBE variant tag, used for grouping results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FbeKind {
    Standard,
    RandomMuting,
    FixedMuting,
    Floating,
    DeterministicBackoff,
}

impl fmt::Display for FbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FbeKind::Standard => "Standard FBE",
            FbeKind::RandomMuting => "Random-muting FBE",
            FbeKind::FixedMuting => "Fixed-muting FBE",
            FbeKind::Floating => "Floating FBE",
            FbeKind::DeterministicBackoff => "Deterministic-backoff FBE",
        };
        f.pad(label)
    }
}

fn default_cca_slots() -> u32 {
    1
}

/// Frame based equipment parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FbeConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Fixed frame period (µs).
    pub ffp: Micros,
    /// Channel occupancy time (µs); clamped to 95% of the FFP.
    pub cot: Micros,
    /// CCA length in observation slots; clamped to the idle period.
    #[serde(default = "default_cca_slots")]
    pub cca_slots: u32,
    /// Initial delay before the first period (µs).
    #[serde(default)]
    pub offset: Micros,
    #[serde(default)]
    pub cca_credit: CcaCredit,
    #[serde(flatten)]
    pub variant: FbeVariant,
}

impl FbeConfig {
    pub fn new(ffp: Micros, cot: Micros, variant: FbeVariant) -> Self {
        Self { name: None, ffp, cot, cca_slots: default_cca_slots(), offset: 0, cca_credit: CcaCredit::TopUp, variant }
    }

    pub fn with_offset(mut self, offset: Micros) -> Self {
        self.offset = offset;
        self
    }
}

/// Configuration of one contending entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum EntityConfig {
    Wifi(WifiConfig),
    Nru(NruConfig),
    Fbe(FbeConfig),
}

impl EntityConfig {
    pub fn family(&self) -> Family {
        match self {
            EntityConfig::Wifi(_) => Family::Wifi,
            EntityConfig::Nru(_) => Family::Nru,
            EntityConfig::Fbe(_) => Family::Fbe,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            EntityConfig::Wifi(c) => c.name.as_deref(),
            EntityConfig::Nru(c) => c.name.as_deref(),
            EntityConfig::Fbe(c) => c.name.as_deref(),
        }
    }
}

/// A configuration value that was outside its valid range and got clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigWarning {
    pub entity: String,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

/// Counters owned by one entity for the whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityStats {
    pub succeeded: u64,
    pub failed: u64,
    /// Payload airtime of successful attempts (µs).
    pub airtime: Micros,
    /// Control airtime: WiFi ACKs, NR-U reservation signals (µs).
    pub control_airtime: Micros,
    /// CCAs that sensed the medium busy (FBE only).
    pub cca_busy: u64,
    /// Periods muted by a muting rule (FBE only).
    pub muted_periods: u64,
    /// Initial synchronization offset (NR-U only).
    pub sync_offset: Option<Micros>,
}

/// Per-entity part of a `RunResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub name: String,
    pub family: Family,
    pub variant: Option<FbeKind>,
    pub stats: EntityStats,
}

/// Channel-wide counters of one family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FamilyCounters {
    pub succeeded: u64,
    pub failed: u64,
    /// Data plus control airtime of successful attempts (µs).
    pub occupied_time: Micros,
    /// Data airtime of successful attempts (µs).
    pub payload_time: Micros,
}

/// Everything a run produces for the reporting collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub horizon: Micros,
    pub seed: u64,
    pub entities: Vec<EntityReport>,
    pub events: Vec<EventRecord>,
    pub counters: Vec<(Family, FamilyCounters)>,
    pub backoff_trace: Vec<BackoffTraceRecord>,
    /// How often each backoff value (in slots) was drawn, per family.
    pub backoff_histogram: Vec<(Family, u32, u64)>,
    pub warnings: Vec<ConfigWarning>,
}

impl RunResult {
    pub fn entity(&self, name: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn counters(&self, family: Family) -> FamilyCounters {
        self.counters.iter().find(|(f, _)| *f == family).map(|(_, c)| *c).unwrap_or_default()
    }

    pub fn collisions(&self) -> usize {
        self.events.iter().filter(|e| e.kind == EventKind::Collision).count()
    }
}

/// Fatal conditions that abort a run.
///
/// These indicate a defect in the simulation logic rather than a bad input; invalid
/// parameter ranges are clamped and reported through `ConfigWarning` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationError {
    /// A gNB computed a negative alignment gap.
    NegativeGap { entity: String, boundary_in: i64, backoff: Micros },
    /// An arbitration winner found no recorded attempt in its own occupancy round.
    EmptyRound { entity: String },
    /// Configuration that cannot be clamped into a valid value.
    InvalidConfig(String),
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationError::NegativeGap { entity, boundary_in, backoff } => {
                write!(f, "{}: negative alignment gap (next boundary in {} µs, backoff {} µs)", entity, boundary_in, backoff)
            }
            SimulationError::EmptyRound { entity } => write!(f, "{}: occupancy round ended without any recorded attempt", entity),
            SimulationError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for SimulationError {}
