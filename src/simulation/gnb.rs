//! NR-U gNB running listen-before-talk against a synchronization-slot grid.
//!
//! A gNB is two cooperating tasks:
//! - a sync-slot tracker that, after a random desynchronization, advances the next slot boundary
//!   by one synchronization slot at every boundary
//! - the access loop: prioritization period plus random backoff, then a full-MCOT transmission
//!
//! In gap mode the countdown is preceded by an idle gap sized so that it ends exactly on a slot
//! boundary. In reservation-signal mode the countdown starts at once and the transmission opens
//! with a reservation signal that fills the time up to the next boundary.

use std::cell::Cell;
use std::rc::Rc;

use log::debug;

use super::backoff::{BackoffCountdown, RetryState, draw_backoff};
use super::channel::{Contention, Waiter, WaiterKind};
use super::entity::EntityContext;
use super::executor::{Sim, TaskId, WaitOutcome};
use super::types::{EventKind, Family, Micros, NruAccessMode, NruConfig, SimulationError};

pub struct Gnb {
    ctx: EntityContext,
    config: NruConfig,
    task: TaskId,
    retry: RetryState,
    next_boundary: Rc<Cell<Micros>>,
}

/// Keeps `next_boundary` pointing at the upcoming synchronization-slot boundary.
async fn track_sync_slots(sim: Sim, next_boundary: Rc<Cell<Micros>>, desync: Micros, sync_slot: Micros) -> Result<(), SimulationError> {
    sim.sleep(desync).await;
    loop {
        next_boundary.set(next_boundary.get() + sync_slot);
        sim.sleep(sync_slot).await;
    }
}

/// Idle gap that makes a countdown of `armed` end on a boundary. `time_to_boundary` may be zero or
/// negative when the boundary is being passed at this very instant.
fn alignment_gap(time_to_boundary: i64, armed: Micros, sync_slot: Micros) -> i64 {
    let mut time_to_boundary = time_to_boundary;
    while armed as i64 >= time_to_boundary {
        time_to_boundary += sync_slot as i64;
    }
    time_to_boundary - armed as i64
}

impl Gnb {
    /// Draws the desynchronization offset and spawns both tasks. Returns the access loop's task.
    pub fn spawn(ctx: EntityContext, config: NruConfig) -> TaskId {
        let (low, high) = config.sync_desync_bounds;
        let desync = ctx.rng.range_inclusive(low, high);
        ctx.stats.borrow_mut().sync_offset = Some(desync);
        debug!("[{}] selected desync {} µs", ctx.name, desync);

        let next_boundary = Rc::new(Cell::new(desync));
        let sim = ctx.sim().clone();
        sim.spawn({
            let (sim, next_boundary) = (sim.clone(), next_boundary.clone());
            let sync_slot = config.sync_slot_duration;
            move |_| track_sync_slots(sim, next_boundary, desync, sync_slot)
        });
        sim.spawn(move |task| Gnb { ctx, config, task, retry: RetryState::default(), next_boundary }.run())
    }

    pub async fn run(mut self) -> Result<(), SimulationError> {
        loop {
            match self.config.access_mode {
                NruAccessMode::Gap => self.wait_backoff_gap().await?,
                NruAccessMode::ReservationSignal => self.wait_backoff().await,
            }
            match self.send_transmission().await? {
                EventKind::Success => self.retry.on_success(),
                EventKind::Collision => {
                    if self.retry.on_failure(self.config.retry_limit) {
                        debug!("[{}] retry limit {} exceeded, resetting contention window", self.ctx.name, self.config.retry_limit);
                    }
                }
            }
        }
    }

    fn draw_countdown(&self) -> BackoffCountdown {
        let slots = draw_backoff(&self.ctx.rng, self.retry.failures_in_row, self.config.cw_min, self.config.cw_max);
        self.ctx.channel.record_backoff_draw(Family::Nru, slots);
        BackoffCountdown::new(slots, self.config.observation_slot_duration, self.config.prioritization_period())
    }

    fn waiter(&self) -> Waiter {
        Waiter { family: Family::Nru, task: self.task, kind: WaiterKind::Backoff }
    }

    async fn wait_backoff_gap(&self) -> Result<(), SimulationError> {
        let sim = self.ctx.sim();
        let channel = &self.ctx.channel;
        let mut countdown = self.draw_countdown();
        loop {
            channel.wait_idle().await;
            let armed = countdown.armed();
            let time_to_boundary = self.next_boundary.get() as i64 - sim.now() as i64;
            let gap = alignment_gap(time_to_boundary, armed, self.config.sync_slot_duration);
            if gap < 0 {
                return Err(SimulationError::NegativeGap { entity: self.ctx.name.clone(), boundary_in: gap + armed as i64, backoff: armed });
            }
            debug!("[{}] backoff {} µs, waiting gap {} µs", self.ctx.name, armed, gap);
            sim.sleep(gap as Micros).await;

            if channel.is_busy() {
                debug!("[{}] channel busy after gap, waiting for it to clear", self.ctx.name);
                continue;
            }
            match channel.wait_registered(self.waiter(), armed).await {
                WaitOutcome::Completed => return Ok(()),
                WaitOutcome::Interrupted { elapsed } => {
                    let credited = countdown.interrupt(elapsed);
                    debug!("[{}] backoff interrupted after {} µs, {} µs credited", self.ctx.name, elapsed, credited);
                }
            }
        }
    }

    async fn wait_backoff(&self) {
        let channel = &self.ctx.channel;
        let mut countdown = self.draw_countdown();
        loop {
            channel.wait_idle().await;
            match channel.wait_registered(self.waiter(), countdown.armed()).await {
                WaitOutcome::Completed => return,
                WaitOutcome::Interrupted { elapsed } => {
                    countdown.interrupt(elapsed);
                }
            }
        }
    }

    async fn send_transmission(&self) -> Result<EventKind, SimulationError> {
        let sim = self.ctx.sim();
        let channel = &self.ctx.channel;
        let total = self.config.mcot_micros();
        let started_at = sim.now();
        let reservation = match self.config.access_mode {
            NruAccessMode::Gap => 0,
            NruAccessMode::ReservationSignal => self.next_boundary.get().saturating_sub(started_at).min(total),
        };
        let data = total - reservation;

        let kind = match channel.contend(self.ctx.id, Family::Nru, total).await {
            Contention::Won(grant) => {
                sim.sleep(total).await;
                let kind = grant.outcome(&self.ctx.name)?;
                self.ctx.record(started_at, kind, data, reservation);
                channel.release(grant);
                kind
            }
            Contention::Lost(round) => {
                sim.sleep(total).await;
                let kind = round.outcome();
                self.ctx.record(started_at, kind, data, reservation);
                kind
            }
        };
        debug!("[{}] transmission started at {} resolved as {:?}", self.ctx.name, started_at, kind);
        Ok(kind)
    }
}
