//! Shared radio channel.
//!
//! The channel owns the only mutable state shared between entities:
//! - the exclusive occupancy lock ("medium busy")
//! - the arbitration queue of the current instant, keyed so that the longest transmission wins
//! - the open transmission round, listing everyone who attempted while it lasted
//! - the registry of backoff and CCA waiters interrupted when the lock is taken
//! - per-family counters, the event log, the backoff histogram and the deterministic-backoff trace
//!
//! ## Arbitration
//!
//! A contender joins the open round (or opens one), submits `ARBITRATION_KEY_BASE - duration` and
//! races a zero-length timeout. When the timeout fires, every request of that instant is queued, so
//! the smallest key (ties: earliest submission) takes the lock and interrupts all registered
//! waiters. Everyone else lost: they transmit underneath the winner without holding the lock and
//! are judged by the round they joined. A request made while the lock is held loses immediately.
//!
//! The round closes when its winner releases the lock; the arbitration queue is cleared with it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::poll_fn;
use std::rc::Rc;
use std::task::{Poll, Waker};

use log::debug;

use super::executor::{Sim, TaskId, WaitOutcome};
use super::types::{
    ARBITRATION_KEY_BASE, BackoffTraceRecord, EntityId, EventKind, EventRecord, Family, FamilyCounters, Micros, SimulationError,
};

#[derive(Debug, Default)]
struct RoundState {
    id: u64,
    participants: Vec<(EntityId, Family)>,
    closed: bool,
}

/// Shared view of one transmission round.
#[derive(Debug, Clone)]
pub struct RoundHandle(Rc<RefCell<RoundState>>);

impl RoundHandle {
    fn open(id: u64) -> Self {
        Self(Rc::new(RefCell::new(RoundState { id, ..Default::default() })))
    }

    pub fn id(&self) -> u64 {
        self.0.borrow().id
    }

    /// Number of distinct entities that attempted during the round so far.
    pub fn attempts(&self) -> usize {
        self.0.borrow().participants.len()
    }

    /// Outcome as judged by a contender that lost arbitration.
    pub fn outcome(&self) -> EventKind {
        EventKind::from_attempts(self.attempts())
    }

    fn join(&self, entity: EntityId, family: Family) {
        let mut round = self.0.borrow_mut();
        if !round.participants.iter().any(|(e, _)| *e == entity) {
            round.participants.push((entity, family));
        }
    }

    fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }
}

/// Proof of holding the occupancy lock. Must be handed back through `Channel::release`.
#[derive(Debug)]
pub struct OccupancyGrant {
    entity: EntityId,
    round: RoundHandle,
}

impl OccupancyGrant {
    /// Applies the collision rule to the winner's round. A round without any attempt means the
    /// lock was granted to nobody who transmitted, which is a logic defect.
    pub fn outcome(&self, name: &str) -> Result<EventKind, SimulationError> {
        match self.round.attempts() {
            0 => Err(SimulationError::EmptyRound { entity: name.to_string() }),
            n => Ok(EventKind::from_attempts(n)),
        }
    }

    pub fn round(&self) -> &RoundHandle {
        &self.round
    }
}

/// Result of `Channel::contend`.
#[derive(Debug)]
pub enum Contention {
    Won(OccupancyGrant),
    Lost(RoundHandle),
}

/// What a registered waiter is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterKind {
    Backoff,
    Cca,
}

/// An entity suspended in an interruptible wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub family: Family,
    pub task: TaskId,
    pub kind: WaiterKind,
}

/// Entities to interrupt when the medium turns busy.
#[derive(Debug, Default)]
struct WaiterRegistry {
    waiters: Vec<Waiter>,
}

impl WaiterRegistry {
    fn register(&mut self, waiter: Waiter) {
        self.waiters.retain(|w| w.task != waiter.task);
        self.waiters.push(waiter);
    }

    fn unregister(&mut self, task: TaskId) {
        self.waiters.retain(|w| w.task != task);
    }

    fn broadcast_targets(&self) -> Vec<TaskId> {
        self.waiters.iter().map(|w| w.task).collect()
    }

    fn count(&self, family: Family, kind: WaiterKind) -> usize {
        self.waiters.iter().filter(|w| w.family == family && w.kind == kind).count()
    }
}

/// One resolved attempt, as reported by the attempting entity.
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    pub name: &'a str,
    pub family: Family,
    pub started_at: Micros,
    pub kind: EventKind,
    /// Data airtime credited on success.
    pub payload: Micros,
    /// Control airtime credited on success.
    pub control: Micros,
}

#[derive(Default)]
struct ChannelState {
    occupied_by: Option<EntityId>,
    release_epoch: u64,
    idle_waiters: Vec<Waker>,
    arbitration: BTreeMap<(u64, u64), EntityId>,
    arbitration_seq: u64,
    round: Option<RoundHandle>,
    next_round_id: u64,
    waiters: WaiterRegistry,
    counters: BTreeMap<Family, FamilyCounters>,
    events: Vec<EventRecord>,
    histogram: BTreeMap<(Family, u32), u64>,
    trace: Vec<BackoffTraceRecord>,
}

/// Everything the channel recorded during a run.
#[derive(Debug, Default)]
pub struct ChannelRecords {
    pub events: Vec<EventRecord>,
    pub counters: Vec<(Family, FamilyCounters)>,
    pub backoff_histogram: Vec<(Family, u32, u64)>,
    pub backoff_trace: Vec<BackoffTraceRecord>,
}

pub struct Channel {
    sim: Sim,
    state: RefCell<ChannelState>,
}

impl Channel {
    pub fn new(sim: Sim) -> Rc<Self> {
        Rc::new(Self { sim, state: RefCell::new(ChannelState::default()) })
    }

    pub fn sim(&self) -> &Sim {
        &self.sim
    }

    /// True while the lock is held or a round is being arbitrated.
    pub fn is_busy(&self) -> bool {
        let state = self.state.borrow();
        state.occupied_by.is_some() || state.round.as_ref().is_some_and(|r| !r.is_closed())
    }

    pub fn is_locked(&self) -> bool {
        self.state.borrow().occupied_by.is_some()
    }

    /// Competes for the occupancy lock with a transmission of `duration`.
    pub async fn contend(&self, entity: EntityId, family: Family, duration: Micros) -> Contention {
        let (round, key) = {
            let mut state = self.state.borrow_mut();
            let open = state.round.as_ref().filter(|r| !r.is_closed()).cloned();
            let round = match open {
                Some(round) => round,
                None => {
                    let id = state.next_round_id;
                    state.next_round_id += 1;
                    let round = RoundHandle::open(id);
                    state.round = Some(round.clone());
                    round
                }
            };
            round.join(entity, family);
            if state.occupied_by.is_some() {
                return Contention::Lost(round);
            }
            let key = (ARBITRATION_KEY_BASE.saturating_sub(duration), state.arbitration_seq);
            state.arbitration_seq += 1;
            state.arbitration.insert(key, entity);
            (round, key)
        };

        self.sim.sleep(0).await;

        let targets = {
            let mut state = self.state.borrow_mut();
            let best = state.arbitration.keys().next().copied();
            state.arbitration.remove(&key);
            if state.occupied_by.is_some() || best != Some(key) {
                return Contention::Lost(round);
            }
            state.occupied_by = Some(entity);
            state.waiters.broadcast_targets()
        };
        debug!("[channel] entity {} won round {} at {} ({} µs), interrupting {} waiters", entity, round.id(), self.sim.now(), duration, targets.len());
        for task in targets {
            self.sim.interrupt(task);
        }
        Contention::Won(OccupancyGrant { entity, round })
    }

    /// Closes the winner's round and frees the medium.
    pub fn release(&self, grant: OccupancyGrant) {
        let wakers = {
            let mut state = self.state.borrow_mut();
            grant.round.0.borrow_mut().closed = true;
            if state.occupied_by == Some(grant.entity) {
                state.occupied_by = None;
            }
            state.arbitration.clear();
            state.release_epoch += 1;
            std::mem::take(&mut state.idle_waiters)
        };
        for w in wakers {
            w.wake();
        }
    }

    /// Resolves once the lock is free. Returns immediately if it already is.
    pub async fn wait_idle(&self) {
        let epoch = self.state.borrow().release_epoch;
        poll_fn(|cx| {
            let mut state = self.state.borrow_mut();
            if state.occupied_by.is_none() || state.release_epoch != epoch {
                Poll::Ready(())
            } else {
                state.idle_waiters.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    /// Interruptible wait during which `waiter` is registered for the busy-medium broadcast.
    pub async fn wait_registered(&self, waiter: Waiter, duration: Micros) -> WaitOutcome {
        self.state.borrow_mut().waiters.register(waiter);
        let outcome = self.sim.wait_interruptible(waiter.task, duration).await;
        self.state.borrow_mut().waiters.unregister(waiter.task);
        outcome
    }

    pub fn waiting(&self, family: Family, kind: WaiterKind) -> usize {
        self.state.borrow().waiters.count(family, kind)
    }

    /// Appends a resolved attempt to the event log and the family counters.
    pub fn record_attempt(&self, attempt: Attempt<'_>) {
        let mut state = self.state.borrow_mut();
        let time = self.sim.now();
        let counters = state.counters.entry(attempt.family).or_default();
        match attempt.kind {
            EventKind::Success => {
                counters.succeeded += 1;
                counters.occupied_time += attempt.payload + attempt.control;
                counters.payload_time += attempt.payload;
            }
            EventKind::Collision => counters.failed += 1,
        }
        state.events.push(EventRecord { time, started_at: attempt.started_at, entity: attempt.name.to_string(), family: attempt.family, kind: attempt.kind });
    }

    pub fn record_backoff_draw(&self, family: Family, slots: u32) {
        *self.state.borrow_mut().histogram.entry((family, slots)).or_default() += 1;
    }

    pub fn record_trace(&self, record: BackoffTraceRecord) {
        self.state.borrow_mut().trace.push(record);
    }

    pub fn counters(&self, family: Family) -> FamilyCounters {
        self.state.borrow().counters.get(&family).copied().unwrap_or_default()
    }

    pub fn event_count(&self) -> usize {
        self.state.borrow().events.len()
    }

    /// Moves everything recorded so far out of the channel.
    pub fn take_records(&self) -> ChannelRecords {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        ChannelRecords {
            events: std::mem::take(&mut state.events),
            counters: Family::ALL.iter().map(|f| (*f, state.counters.get(f).copied().unwrap_or_default())).collect(),
            backoff_histogram: state.histogram.iter().map(|((f, v), n)| (*f, *v, *n)).collect(),
            backoff_trace: std::mem::take(&mut state.trace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::executor::Executor;
    use std::cell::Cell;

    type Outcomes = Rc<RefCell<Vec<(EntityId, bool, EventKind, Micros)>>>;

    /// Spawns an entity that contends once at `at` and logs (entity, won, outcome, end time).
    fn spawn_contender(channel: &Rc<Channel>, outcomes: &Outcomes, entity: EntityId, at: Micros, duration: Micros) {
        let (ch, out) = (channel.clone(), outcomes.clone());
        let sim = channel.sim().clone();
        sim.spawn(move |_| async move {
            let sim = ch.sim().clone();
            sim.sleep(at).await;
            match ch.contend(entity, Family::Fbe, duration).await {
                Contention::Won(grant) => {
                    sim.sleep(duration).await;
                    let kind = grant.outcome("winner")?;
                    ch.release(grant);
                    out.borrow_mut().push((entity, true, kind, sim.now()));
                }
                Contention::Lost(round) => {
                    sim.sleep(duration).await;
                    out.borrow_mut().push((entity, false, round.outcome(), sim.now()));
                }
            }
            Ok(())
        });
    }

    #[test]
    fn lone_contender_wins_and_succeeds() {
        let mut executor = Executor::new(10_000);
        let channel = Channel::new(executor.handle());
        let outcomes: Outcomes = Rc::default();
        spawn_contender(&channel, &outcomes, 0, 100, 500);
        executor.run().unwrap();
        assert_eq!(*outcomes.borrow(), vec![(0, true, EventKind::Success, 600)]);
        assert!(!channel.is_busy());
    }

    #[test]
    fn longest_simultaneous_request_wins_and_all_collide() {
        let mut executor = Executor::new(10_000);
        let channel = Channel::new(executor.handle());
        let outcomes: Outcomes = Rc::default();
        spawn_contender(&channel, &outcomes, 0, 100, 300);
        spawn_contender(&channel, &outcomes, 1, 100, 900);
        executor.run().unwrap();
        let outcomes = outcomes.borrow();
        assert!(outcomes.contains(&(0, false, EventKind::Collision, 400)));
        assert!(outcomes.contains(&(1, true, EventKind::Collision, 1_000)));
    }

    #[test]
    fn equal_durations_favour_earliest_submission() {
        let mut executor = Executor::new(10_000);
        let channel = Channel::new(executor.handle());
        let outcomes: Outcomes = Rc::default();
        spawn_contender(&channel, &outcomes, 0, 50, 200);
        spawn_contender(&channel, &outcomes, 1, 50, 200);
        executor.run().unwrap();
        let outcomes = outcomes.borrow();
        assert!(outcomes.contains(&(0, true, EventKind::Collision, 250)));
        assert!(outcomes.contains(&(1, false, EventKind::Collision, 250)));
    }

    #[test]
    fn request_during_occupancy_loses_and_collides() {
        let mut executor = Executor::new(10_000);
        let channel = Channel::new(executor.handle());
        let outcomes: Outcomes = Rc::default();
        spawn_contender(&channel, &outcomes, 0, 0, 1_000);
        spawn_contender(&channel, &outcomes, 1, 400, 100);
        executor.run().unwrap();
        let outcomes = outcomes.borrow();
        assert!(outcomes.contains(&(1, false, EventKind::Collision, 500)));
        assert!(outcomes.contains(&(0, true, EventKind::Collision, 1_000)));
    }

    #[test]
    fn consecutive_rounds_are_independent() {
        let mut executor = Executor::new(10_000);
        let channel = Channel::new(executor.handle());
        let outcomes: Outcomes = Rc::default();
        spawn_contender(&channel, &outcomes, 0, 0, 100);
        spawn_contender(&channel, &outcomes, 1, 101, 100);
        executor.run().unwrap();
        let outcomes = outcomes.borrow();
        assert!(outcomes.contains(&(0, true, EventKind::Success, 100)));
        assert!(outcomes.contains(&(1, true, EventKind::Success, 201)));
    }

    #[test]
    fn winning_interrupts_registered_waiters() {
        let mut executor = Executor::new(10_000);
        let sim = executor.handle();
        let channel = Channel::new(sim.clone());
        let outcomes: Outcomes = Rc::default();
        let observed = Rc::new(Cell::new(None));
        let (ch, obs) = (channel.clone(), observed.clone());
        sim.spawn(move |task| async move {
            let waiter = Waiter { family: Family::Wifi, task, kind: WaiterKind::Backoff };
            obs.set(Some(ch.wait_registered(waiter, 1_000).await));
            assert_eq!(ch.waiting(Family::Wifi, WaiterKind::Backoff), 0);
            Ok(())
        });
        spawn_contender(&channel, &outcomes, 0, 250, 100);
        executor.run().unwrap();
        assert_eq!(observed.get(), Some(WaitOutcome::Interrupted { elapsed: 250 }));
    }

    #[test]
    fn wait_idle_resumes_at_release() {
        let mut executor = Executor::new(10_000);
        let sim = executor.handle();
        let channel = Channel::new(sim.clone());
        let outcomes: Outcomes = Rc::default();
        spawn_contender(&channel, &outcomes, 0, 0, 700);
        let resumed = Rc::new(Cell::new(None));
        let (ch, r) = (channel.clone(), resumed.clone());
        sim.spawn(move |_| async move {
            let sim = ch.sim().clone();
            sim.sleep(10).await;
            assert!(ch.is_locked());
            ch.wait_idle().await;
            r.set(Some(sim.now()));
            Ok(())
        });
        executor.run().unwrap();
        assert_eq!(resumed.get(), Some(700));
    }

    #[test]
    fn empty_round_is_an_invariant_violation() {
        let grant = OccupancyGrant { entity: 0, round: RoundHandle::open(0) };
        assert_eq!(grant.outcome("Station 1"), Err(SimulationError::EmptyRound { entity: "Station 1".into() }));
        assert_eq!(RoundHandle::open(1).outcome(), EventKind::Collision);
    }

    #[test]
    fn records_feed_family_counters() {
        let executor = Executor::new(10_000);
        let channel = Channel::new(executor.handle());
        let base = Attempt { name: "Gnb 1", family: Family::Nru, started_at: 0, kind: EventKind::Success, payload: 5_000, control: 1_000 };
        channel.record_attempt(base);
        channel.record_attempt(Attempt { kind: EventKind::Collision, ..base });
        channel.record_backoff_draw(Family::Nru, 4);
        channel.record_backoff_draw(Family::Nru, 4);
        let counters = channel.counters(Family::Nru);
        assert_eq!((counters.succeeded, counters.failed), (1, 1));
        assert_eq!((counters.occupied_time, counters.payload_time), (6_000, 5_000));
        let records = channel.take_records();
        assert_eq!(records.events.len(), 2);
        assert_eq!(records.backoff_histogram, vec![(Family::Nru, 4, 2)]);
        assert_eq!(records.counters.len(), 3);
    }
}
