//! WiFi DCF station.
//!
//! Each station runs one task that, for every frame:
//! - waits DIFS plus a random backoff, pausing whenever the medium turns busy
//! - contends for the channel with its PPDU duration
//! - on success waits the ACK exchange, on failure the ACK timeout, then retries or drops

use log::debug;

use super::backoff::{BackoffCountdown, RetryState, draw_backoff};
use super::channel::{Contention, Waiter, WaiterKind};
use super::entity::EntityContext;
use super::executor::{TaskId, WaitOutcome};
use super::timing::{ACK_TIMEOUT, FrameTiming, T_DIFS, T_SLOT};
use super::types::{EventKind, Family, SimulationError, WifiConfig};

pub struct Station {
    ctx: EntityContext,
    config: WifiConfig,
    timing: FrameTiming,
    task: TaskId,
    retry: RetryState,
}

impl Station {
    pub fn new(ctx: EntityContext, config: WifiConfig, task: TaskId) -> Self {
        let timing = FrameTiming::new(config.payload_size, config.mcs);
        Self { ctx, config, timing, task, retry: RetryState::default() }
    }

    /// Spawns the station's task on the channel's executor.
    pub fn spawn(ctx: EntityContext, config: WifiConfig) -> TaskId {
        let sim = ctx.sim().clone();
        sim.spawn(move |task| Station::new(ctx, config, task).run())
    }

    pub async fn run(mut self) -> Result<(), SimulationError> {
        debug!("[{}] data {} µs, ack {} µs", self.ctx.name, self.timing.data, self.timing.ack);
        loop {
            self.wait_backoff().await;
            match self.send_frame().await? {
                EventKind::Success => self.retry.on_success(),
                EventKind::Collision => {
                    if self.retry.on_failure(self.config.retry_limit) {
                        debug!("[{}] retry limit {} exceeded, dropping frame", self.ctx.name, self.config.retry_limit);
                    }
                }
            }
        }
    }

    async fn wait_backoff(&self) {
        let slots = draw_backoff(&self.ctx.rng, self.retry.failures_in_row, self.config.cw_min, self.config.cw_max);
        self.ctx.channel.record_backoff_draw(Family::Wifi, slots);
        let mut countdown = BackoffCountdown::new(slots, T_SLOT, T_DIFS);
        let waiter = Waiter { family: Family::Wifi, task: self.task, kind: WaiterKind::Backoff };
        loop {
            self.ctx.channel.wait_idle().await;
            debug!("[{}] waiting backoff {} µs (with DIFS)", self.ctx.name, countdown.armed());
            match self.ctx.channel.wait_registered(waiter, countdown.armed()).await {
                WaitOutcome::Completed => return,
                WaitOutcome::Interrupted { elapsed } => {
                    let credited = countdown.interrupt(elapsed);
                    debug!("[{}] backoff interrupted after {} µs, {} µs credited, {} µs left", self.ctx.name, elapsed, credited, countdown.remaining());
                }
            }
        }
    }

    async fn send_frame(&self) -> Result<EventKind, SimulationError> {
        let sim = self.ctx.sim();
        let channel = &self.ctx.channel;
        let (data, ack) = (self.timing.data, self.timing.ack);
        let started_at = sim.now();
        match channel.contend(self.ctx.id, Family::Wifi, data).await {
            Contention::Won(grant) => {
                sim.sleep(data).await;
                let kind = grant.outcome(&self.ctx.name)?;
                match kind {
                    EventKind::Success => {
                        self.ctx.record(started_at, kind, data, ack);
                        sim.sleep(ack).await;
                        channel.release(grant);
                    }
                    EventKind::Collision => {
                        debug!("[{}] collision in round {}", self.ctx.name, grant.round().id());
                        self.ctx.record(started_at, kind, data, ack);
                        channel.release(grant);
                        sim.sleep(ACK_TIMEOUT).await;
                    }
                }
                Ok(kind)
            }
            Contention::Lost(round) => {
                sim.sleep(data).await;
                let kind = round.outcome();
                self.ctx.record(started_at, kind, data, ack);
                match kind {
                    EventKind::Success => sim.sleep(ack).await,
                    EventKind::Collision => sim.sleep(ACK_TIMEOUT).await,
                }
                Ok(kind)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::channel::Channel;
    use crate::simulation::executor::Executor;
    use crate::simulation::rng::SimRng;
    use crate::simulation::types::EntityStats;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn station_context(channel: &Rc<Channel>, rng: &SimRng, id: usize) -> (EntityContext, Rc<RefCell<EntityStats>>) {
        let stats = Rc::new(RefCell::new(EntityStats::default()));
        let ctx = EntityContext { id, name: format!("Station {}", id + 1), family: Family::Wifi, channel: channel.clone(), rng: rng.clone(), stats: stats.clone() };
        (ctx, stats)
    }

    #[test]
    fn lone_station_never_collides() {
        let mut executor = Executor::new(200_000);
        let channel = Channel::new(executor.handle());
        let rng = SimRng::seed_from_u64(11);
        let (ctx, stats) = station_context(&channel, &rng, 0);
        Station::spawn(ctx, WifiConfig::default());
        executor.run().unwrap();

        let timing = FrameTiming::new(1472, 7);
        let stats = stats.borrow();
        assert_eq!(stats.failed, 0);
        assert!(stats.succeeded > 0);
        assert_eq!(stats.airtime, stats.succeeded * timing.data);
        assert_eq!(stats.control_airtime, stats.succeeded * timing.ack);
        // Every exchange needs at least DIFS, the PPDU and the ACK.
        assert!(stats.succeeded <= 200_000 / (T_DIFS + timing.data + timing.ack));
    }

    #[test]
    fn every_attempt_is_recorded_once() {
        let mut executor = Executor::new(300_000);
        let channel = Channel::new(executor.handle());
        let rng = SimRng::seed_from_u64(5);
        let mut all_stats = Vec::new();
        for id in 0..3 {
            let (ctx, stats) = station_context(&channel, &rng, id);
            Station::spawn(ctx, WifiConfig::default());
            all_stats.push(stats);
        }
        executor.run().unwrap();

        let attempts: u64 = all_stats.iter().map(|s| s.borrow().succeeded + s.borrow().failed).sum();
        assert_eq!(attempts as usize, channel.event_count());
        let counters = channel.counters(Family::Wifi);
        assert_eq!(counters.succeeded + counters.failed, attempts);
    }
}
