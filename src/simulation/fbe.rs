//! Frame based equipment (FBE).
//!
//! All five variants share one driver built from two primitives:
//! - `sense`: a CCA at the end of the idle part of the frame period
//! - `transmit`: one COT long channel occupancy through the shared arbitration
//!
//! A period starts right after a CCA. Depending on the variant's decision the entity transmits
//! for the COT, skips the period, or mutes it entirely, and the next CCA ends the period:
//!
//! ```text
//! | COT (transmit or skip) | idle - CCA | CCA |
//! ```
//!
//! Variant specific behavior lives in `VariantState` and is consulted through three hooks
//! (`next_action`, `on_cca`, `on_sent`). The floating variant replaces the fixed
//! CCA position with a random number of slots waited before each CCA.

use log::debug;

use super::channel::{Contention, Waiter, WaiterKind};
use super::entity::EntityContext;
use super::executor::{TaskId, WaitOutcome};
use super::types::{BackoffTraceRecord, CcaCredit, EventKind, Family, FbeConfig, FbeVariant, Micros, SimulationError, TraceKind};

/// Observation slot used for CCA and floating offsets.
pub const OBSERVATION_SLOT: Micros = 9;

/// Validated FBE timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbeTimers {
    pub ffp: Micros,
    pub cot: Micros,
    pub idle_period: Micros,
    pub cca: Micros,
}

impl FbeTimers {
    /// Builds the timers, clamping the COT to 95% of the FFP and the CCA to the idle period.
    /// Every clamp is reported in the returned list.
    pub fn new(ffp: Micros, cot: Micros, cca_slots: u32) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let max_cot = ffp * 95 / 100;
        let cot = if cot > max_cot {
            warnings.push(format!("COT {} µs exceeds 95% of FFP; using {} µs", cot, max_cot));
            max_cot
        } else {
            cot
        };
        let idle_period = ffp - cot;
        let requested_cca = cca_slots as Micros * OBSERVATION_SLOT;
        let cca = if requested_cca > idle_period {
            warnings.push(format!("CCA {} µs exceeds idle period; using {} µs", requested_cca, idle_period));
            idle_period
        } else {
            requested_cca
        };
        (Self { ffp, cot, idle_period, cca }, warnings)
    }

    /// Time between the end of the COT and the start of the next CCA.
    pub fn wait_until_cca(&self) -> Micros {
        self.idle_period - self.cca
    }
}

/// Sensing time left after a CCA was interrupted `elapsed` into a `cca` long sense.
pub fn cca_residual(credit: CcaCredit, cca: Micros, elapsed: Micros) -> Micros {
    match credit {
        CcaCredit::TopUp => cca.saturating_sub(elapsed),
        CcaCredit::Elapsed => 0,
    }
}

/// What the entity does with the COT part of the coming period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeriodAction {
    Transmit,
    /// Stay silent for the COT, then sense as usual.
    Skip { muted: bool },
    /// Stay silent for the whole period without sensing.
    MuteWithoutCca,
}

struct FbeCore {
    ctx: EntityContext,
    timers: FbeTimers,
    cca_credit: CcaCredit,
    task: TaskId,
    skip_next_cot: bool,
}

impl FbeCore {
    /// Runs one CCA. Returns true when the medium was sensed idle.
    async fn sense(&mut self) -> bool {
        let sim = self.ctx.sim().clone();
        let cca = self.timers.cca;
        let idle = if self.ctx.channel.is_busy() {
            sim.sleep(cca).await;
            false
        } else {
            let waiter = Waiter { family: Family::Fbe, task: self.task, kind: WaiterKind::Cca };
            match self.ctx.channel.wait_registered(waiter, cca).await {
                WaitOutcome::Completed => true,
                WaitOutcome::Interrupted { elapsed } => {
                    sim.sleep(cca_residual(self.cca_credit, cca, elapsed)).await;
                    false
                }
            }
        };
        self.skip_next_cot = !idle;
        if !idle {
            self.ctx.stats.borrow_mut().cca_busy += 1;
            debug!("[{}] CCA busy, skipping next COT", self.ctx.name);
        }
        idle
    }

    /// Occupies the channel for one COT. A COT that would reach the horizon is credited only up to
    /// the horizon and resolved one microsecond before it.
    async fn transmit(&mut self) -> Result<EventKind, SimulationError> {
        let sim = self.ctx.sim().clone();
        let cot = self.timers.cot;
        let started_at = sim.now();
        let horizon = sim.horizon();
        let (hold, credit) =
            if started_at + cot >= horizon { (horizon.saturating_sub(1).saturating_sub(started_at), horizon - started_at) } else { (cot, cot) };

        let kind = match self.ctx.channel.contend(self.ctx.id, Family::Fbe, cot).await {
            Contention::Won(grant) => {
                sim.sleep(hold).await;
                let kind = grant.outcome(&self.ctx.name)?;
                self.ctx.record(started_at, kind, credit, 0);
                self.ctx.channel.release(grant);
                kind
            }
            Contention::Lost(round) => {
                sim.sleep(hold).await;
                let kind = round.outcome();
                self.ctx.record(started_at, kind, credit, 0);
                kind
            }
        };
        debug!("[{}] transmission started at {} resolved as {:?}", self.ctx.name, started_at, kind);
        Ok(kind)
    }

    fn count_muted(&self) {
        self.ctx.stats.borrow_mut().muted_periods += 1;
    }

    fn trace(&self, kind: TraceKind, value: u32, is_selection: bool) {
        self.ctx.channel.record_trace(BackoffTraceRecord { time: self.ctx.now(), entity: self.ctx.name.clone(), kind, value, is_selection });
    }
}

/// Counters of the deterministic-backoff variant.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeterministicBackoff {
    max_retransmissions: u32,
    init_backoff_value: u32,
    threshold: u32,
    retransmissions: u32,
    backoff_counter: u32,
    interrupt_counter: u32,
}

impl DeterministicBackoff {
    /// `(retransmissions mod max) < threshold` selects `init + interrupts`, otherwise a uniform draw
    /// from `[0, max - 1]`.
    fn select_backoff(&mut self, core: &FbeCore) {
        let modulo = self.retransmissions % self.max_retransmissions.max(1);
        if modulo < self.threshold {
            self.backoff_counter = self.init_backoff_value + self.interrupt_counter;
            if self.interrupt_counter != 0 {
                self.interrupt_counter = 0;
                core.trace(TraceKind::InterruptCounter, 0, true);
            }
        } else {
            self.backoff_counter = core.ctx.rng.range_inclusive(0, self.max_retransmissions.saturating_sub(1) as u64) as u32;
        }
        debug!("[{}] selected backoff counter {}", core.ctx.name, self.backoff_counter);
        core.trace(TraceKind::Backoff, self.backoff_counter, true);
    }

    fn on_cca(&mut self, idle: bool, core: &FbeCore) {
        if !idle {
            self.interrupt_counter += 1;
            core.trace(TraceKind::InterruptCounter, self.interrupt_counter, false);
        } else if self.backoff_counter != 0 {
            self.backoff_counter -= 1;
            core.trace(TraceKind::Backoff, self.backoff_counter, false);
        }
    }

    fn on_sent(&mut self, kind: EventKind, core: &FbeCore) {
        match kind {
            EventKind::Success => self.retransmissions = 0,
            EventKind::Collision if self.retransmissions < self.max_retransmissions => self.retransmissions += 1,
            EventKind::Collision => {
                debug!("[{}] {} retransmissions exhausted, dropping frame", core.ctx.name, self.max_retransmissions);
                self.retransmissions = 0;
                if self.interrupt_counter != 0 {
                    self.interrupt_counter = 0;
                    core.trace(TraceKind::InterruptCounter, 0, true);
                }
            }
        }
        self.select_backoff(core);
    }
}

/// Variant specific state, one arm per FBE variant.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VariantState {
    Standard,
    RandomMuting { max_frames_in_a_row: u32, max_muted_periods: u32, frames_left: Option<u32>, mutes_left: u32 },
    FixedMuting { max_muted_periods: u32, muted_to_go: u32 },
    Floating { max_slots: Micros },
    DeterministicBackoff(DeterministicBackoff),
}

impl VariantState {
    fn new(variant: &FbeVariant, timers: &FbeTimers) -> Self {
        match *variant {
            FbeVariant::Standard => VariantState::Standard,
            FbeVariant::RandomMuting { max_frames_in_a_row, max_muted_periods } => {
                VariantState::RandomMuting { max_frames_in_a_row, max_muted_periods, frames_left: None, mutes_left: 0 }
            }
            FbeVariant::FixedMuting { max_muted_periods } => VariantState::FixedMuting { max_muted_periods, muted_to_go: 0 },
            FbeVariant::Floating => VariantState::Floating { max_slots: timers.wait_until_cca() / OBSERVATION_SLOT },
            FbeVariant::DeterministicBackoff { max_retransmissions, init_backoff_value, threshold } => {
                VariantState::DeterministicBackoff(DeterministicBackoff {
                    max_retransmissions,
                    init_backoff_value,
                    threshold,
                    retransmissions: 0,
                    backoff_counter: 0,
                    interrupt_counter: 0,
                })
            }
        }
    }

    fn next_action(&mut self, core: &FbeCore) -> PeriodAction {
        match self {
            VariantState::Standard | VariantState::Floating { .. } => {
                if core.skip_next_cot { PeriodAction::Skip { muted: false } } else { PeriodAction::Transmit }
            }
            VariantState::RandomMuting { max_frames_in_a_row, max_muted_periods, frames_left, mutes_left } => {
                if *frames_left == Some(0) {
                    *mutes_left = core.ctx.rng.range_inclusive(1, *max_muted_periods as u64) as u32;
                    *frames_left = None;
                    debug!("[{}] muting {} periods", core.ctx.name, mutes_left);
                }
                if *mutes_left > 0 {
                    *mutes_left -= 1;
                    return if *mutes_left == 0 { PeriodAction::Skip { muted: true } } else { PeriodAction::MuteWithoutCca };
                }
                if core.skip_next_cot {
                    return PeriodAction::Skip { muted: false };
                }
                if frames_left.is_none() {
                    *frames_left = Some(core.ctx.rng.range_inclusive(1, *max_frames_in_a_row as u64) as u32);
                    debug!("[{}] transmitting up to {:?} frames in a row", core.ctx.name, frames_left);
                }
                PeriodAction::Transmit
            }
            VariantState::FixedMuting { muted_to_go, .. } => {
                if core.skip_next_cot {
                    PeriodAction::Skip { muted: false }
                } else if *muted_to_go > 0 {
                    *muted_to_go -= 1;
                    if *muted_to_go == 0 { PeriodAction::Skip { muted: true } } else { PeriodAction::MuteWithoutCca }
                } else {
                    PeriodAction::Transmit
                }
            }
            VariantState::DeterministicBackoff(db) => {
                if db.backoff_counter == 0 && !core.skip_next_cot {
                    PeriodAction::Transmit
                } else {
                    PeriodAction::Skip { muted: false }
                }
            }
        }
    }

    fn on_cca(&mut self, idle: bool, core: &FbeCore) {
        match self {
            VariantState::RandomMuting { frames_left, .. } if !idle => *frames_left = None,
            VariantState::DeterministicBackoff(db) => db.on_cca(idle, core),
            _ => {}
        }
    }

    fn on_sent(&mut self, kind: EventKind, core: &FbeCore) {
        match self {
            VariantState::RandomMuting { frames_left, .. } => {
                *frames_left = match kind {
                    EventKind::Success => frames_left.map(|f| f.saturating_sub(1)),
                    EventKind::Collision => None,
                };
            }
            VariantState::FixedMuting { max_muted_periods, muted_to_go } if kind == EventKind::Success => *muted_to_go = *max_muted_periods,
            VariantState::DeterministicBackoff(db) => db.on_sent(kind, core),
            _ => {}
        }
    }
}

pub struct Fbe {
    core: FbeCore,
    variant: VariantState,
    offset: Micros,
}

impl Fbe {
    pub fn new(ctx: EntityContext, config: &FbeConfig, timers: FbeTimers, task: TaskId) -> Self {
        let core = FbeCore { ctx, timers, cca_credit: config.cca_credit, task, skip_next_cot: false };
        Self { core, variant: VariantState::new(&config.variant, &timers), offset: config.offset }
    }

    pub fn spawn(ctx: EntityContext, config: FbeConfig, timers: FbeTimers) -> TaskId {
        let sim = ctx.sim().clone();
        sim.spawn(move |task| Fbe::new(ctx, &config, timers, task).run())
    }

    pub async fn run(mut self) -> Result<(), SimulationError> {
        let sim = self.core.ctx.sim().clone();
        debug!("[{}] {:?}, offset {} µs", self.core.ctx.name, self.core.timers, self.offset);
        if self.offset > 0 {
            sim.sleep(self.offset).await;
        }
        match &mut self.variant {
            VariantState::Floating { max_slots } => {
                let max_slots = *max_slots;
                return self.run_floating(max_slots).await;
            }
            VariantState::DeterministicBackoff(db) => db.select_backoff(&self.core),
            _ => {}
        }
        self.sense().await;

        let timers = self.core.timers;
        loop {
            match self.variant.next_action(&self.core) {
                PeriodAction::Transmit => {
                    let kind = self.core.transmit().await?;
                    self.variant.on_sent(kind, &self.core);
                    sim.sleep(timers.wait_until_cca()).await;
                    self.sense().await;
                }
                PeriodAction::Skip { muted } => {
                    if muted {
                        self.core.count_muted();
                    }
                    sim.sleep(timers.cot + timers.wait_until_cca()).await;
                    self.sense().await;
                }
                PeriodAction::MuteWithoutCca => {
                    self.core.count_muted();
                    sim.sleep(timers.ffp).await;
                }
            }
        }
    }

    async fn sense(&mut self) {
        let idle = self.core.sense().await;
        self.variant.on_cca(idle, &self.core);
    }

    /// Each period: random wait of whole slots, CCA, COT, then a pause that restores the FFP.
    async fn run_floating(&mut self, max_slots: Micros) -> Result<(), SimulationError> {
        let sim = self.core.ctx.sim().clone();
        let timers = self.core.timers;
        loop {
            let wait = if max_slots == 0 { 0 } else { self.core.ctx.rng.range_inclusive(1, max_slots) * OBSERVATION_SLOT };
            let pause = timers.idle_period - wait - timers.cca;
            debug!("[{}] waiting {} µs before CCA", self.core.ctx.name, wait);
            sim.sleep(wait).await;
            self.sense().await;
            match self.variant.next_action(&self.core) {
                PeriodAction::Transmit => {
                    let kind = self.core.transmit().await?;
                    self.variant.on_sent(kind, &self.core);
                    sim.sleep(pause).await;
                }
                _ => sim.sleep(timers.cot + pause).await,
            }
        }
    }
}
