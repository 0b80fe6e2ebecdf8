//! Deterministic single-threaded executor with a virtual microsecond clock.
//!
//! Every simulated entity runs as an `async` task on this executor. Tasks suspend at three kinds of
//! points only: `Sim::sleep` (timeout), the channel's arbitration (built on a zero-length sleep), and
//! `Sim::wait_interruptible`, which another task can end early through `Sim::interrupt`.
//!
//! Ordering rules:
//! - Tasks that are ready at the same instant are polled in FIFO wake order.
//! - Timers sharing a deadline fire in registration order.
//! - Time only advances once no task is ready, and never to or past the horizon.
//!
//! The timer queue is a `BTreeMap` keyed by `(deadline, sequence)`, so the earliest deadline is
//! always the first entry and ties resolve by insertion.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use embassy_futures::select::{Either, select};
use futures::future::LocalBoxFuture;
use futures::task::{ArcWake, waker};
use log::trace;

use super::types::{Micros, SimulationError};

pub type TaskId = usize;

type TaskFuture = LocalBoxFuture<'static, Result<(), SimulationError>>;

/// Result of an interruptible wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full duration elapsed.
    Completed,
    /// Another task interrupted the wait after `elapsed` microseconds.
    Interrupted { elapsed: Micros },
}

#[derive(Default)]
struct ReadyQueue {
    order: VecDeque<TaskId>,
    queued: HashSet<TaskId>,
}

impl ReadyQueue {
    fn push(&mut self, id: TaskId) {
        if self.queued.insert(id) {
            self.order.push_back(id);
        }
    }

    fn pop(&mut self) -> Option<TaskId> {
        let id = self.order.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }
}

fn lock_queue(queue: &Mutex<ReadyQueue>) -> MutexGuard<'_, ReadyQueue> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct TaskWaker {
    id: TaskId,
    queue: Arc<Mutex<ReadyQueue>>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        lock_queue(&arc_self.queue).push(arc_self.id);
    }
}

struct SimState {
    now: Cell<Micros>,
    horizon: Micros,
    timers: RefCell<BTreeMap<(Micros, u64), Waker>>,
    timer_seq: Cell<u64>,
    interrupts: RefCell<HashSet<TaskId>>,
    spawned: RefCell<Vec<(TaskId, TaskFuture)>>,
    next_task: Cell<TaskId>,
    ready: Arc<Mutex<ReadyQueue>>,
}

/// Cloneable handle to the clock and scheduler of one run.
#[derive(Clone)]
pub struct Sim(Rc<SimState>);

impl Sim {
    /// Current virtual time.
    pub fn now(&self) -> Micros {
        self.0.now.get()
    }

    /// Virtual instant at which the run stops.
    pub fn horizon(&self) -> Micros {
        self.0.horizon
    }

    /// Spawns a task. The closure receives the id the task is known by, so that it can register
    /// itself for interrupts.
    pub fn spawn<F, Fut>(&self, make: F) -> TaskId
    where
        F: FnOnce(TaskId) -> Fut,
        Fut: Future<Output = Result<(), SimulationError>> + 'static,
    {
        let id = self.0.next_task.get();
        self.0.next_task.set(id + 1);
        let future: TaskFuture = Box::pin(make(id));
        self.0.spawned.borrow_mut().push((id, future));
        lock_queue(&self.0.ready).push(id);
        id
    }

    /// Suspends the current task for `duration` microseconds of virtual time.
    ///
    /// Always yields, even for a zero duration: a zero sleep resumes at the same instant but only
    /// after every task already runnable at that instant has been polled.
    pub fn sleep(&self, duration: Micros) -> Sleep {
        Sleep { sim: self.clone(), duration, key: None, done: false }
    }

    /// Raises the interrupt flag of `task` and schedules it. The flag is only observed by
    /// `wait_interruptible`.
    pub fn interrupt(&self, task: TaskId) {
        self.0.interrupts.borrow_mut().insert(task);
        lock_queue(&self.0.ready).push(task);
    }

    /// Waits `duration` unless `task` is interrupted first. An interrupt raised at the very instant
    /// the timer expires takes priority.
    pub async fn wait_interruptible(&self, task: TaskId, duration: Micros) -> WaitOutcome {
        self.0.interrupts.borrow_mut().remove(&task);
        let start = self.now();
        let signal = InterruptSignal { sim: self.clone(), task };
        let outcome = match select(signal, self.sleep(duration)).await {
            Either::First(()) => WaitOutcome::Interrupted { elapsed: self.now() - start },
            Either::Second(()) => WaitOutcome::Completed,
        };
        self.0.interrupts.borrow_mut().remove(&task);
        outcome
    }

    fn register_timer(&self, deadline: Micros, waker: Waker) -> (Micros, u64) {
        let seq = self.0.timer_seq.get();
        self.0.timer_seq.set(seq + 1);
        let key = (deadline, seq);
        self.0.timers.borrow_mut().insert(key, waker);
        key
    }
}

/// Future returned by `Sim::sleep`.
///
/// The deadline is fixed at the first poll. The executor removes the timer entry when it fires;
/// a missing entry means the sleep is over.
pub struct Sleep {
    sim: Sim,
    duration: Micros,
    key: Option<(Micros, u64)>,
    done: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(());
        }
        match this.key {
            None => {
                let deadline = this.sim.now().saturating_add(this.duration);
                this.key = Some(this.sim.register_timer(deadline, cx.waker().clone()));
                Poll::Pending
            }
            Some(key) => {
                let mut timers = this.sim.0.timers.borrow_mut();
                match timers.get_mut(&key) {
                    Some(registered) => {
                        if !registered.will_wake(cx.waker()) {
                            *registered = cx.waker().clone();
                        }
                        Poll::Pending
                    }
                    None => {
                        this.key = None;
                        this.done = true;
                        Poll::Ready(())
                    }
                }
            }
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.sim.0.timers.borrow_mut().remove(&key);
        }
    }
}

struct InterruptSignal {
    sim: Sim,
    task: TaskId,
}

impl Future for InterruptSignal {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // Interrupts wake the task by id, so no waker needs to be stored.
        if self.sim.0.interrupts.borrow_mut().remove(&self.task) { Poll::Ready(()) } else { Poll::Pending }
    }
}

/// Owns the tasks of one run and drives them until the horizon.
pub struct Executor {
    sim: Sim,
    tasks: HashMap<TaskId, TaskFuture>,
}

impl Executor {
    pub fn new(horizon: Micros) -> Self {
        let state = SimState {
            now: Cell::new(0),
            horizon,
            timers: RefCell::new(BTreeMap::new()),
            timer_seq: Cell::new(0),
            interrupts: RefCell::new(HashSet::new()),
            spawned: RefCell::new(Vec::new()),
            next_task: Cell::new(0),
            ready: Arc::new(Mutex::new(ReadyQueue::default())),
        };
        Self { sim: Sim(Rc::new(state)), tasks: HashMap::new() }
    }

    pub fn handle(&self) -> Sim {
        self.sim.clone()
    }

    /// Runs until no timer is left before the horizon. The first task error aborts the run.
    ///
    /// On return the clock reads the horizon and every unfinished task has been dropped.
    pub fn run(&mut self) -> Result<(), SimulationError> {
        let result = self.drive();
        self.sim.0.now.set(self.sim.horizon());
        self.tasks.clear();
        self.sim.0.spawned.borrow_mut().clear();
        result
    }

    fn drive(&mut self) -> Result<(), SimulationError> {
        loop {
            while let Some(id) = self.next_ready() {
                self.adopt_spawned();
                let Some(future) = self.tasks.get_mut(&id) else {
                    continue;
                };
                let task_waker = waker(Arc::new(TaskWaker { id, queue: self.sim.0.ready.clone() }));
                let mut cx = Context::from_waker(&task_waker);
                match future.as_mut().poll(&mut cx) {
                    Poll::Ready(Ok(())) => {
                        trace!("[executor] task {} finished at {}", id, self.sim.now());
                        self.tasks.remove(&id);
                    }
                    Poll::Ready(Err(e)) => return Err(e),
                    Poll::Pending => {}
                }
            }

            let due = self.pop_due_timers();
            if due.is_empty() {
                return Ok(());
            }
            for w in due {
                w.wake();
            }
        }
    }

    fn next_ready(&self) -> Option<TaskId> {
        lock_queue(&self.sim.0.ready).pop()
    }

    fn adopt_spawned(&mut self) {
        let spawned: Vec<_> = self.sim.0.spawned.borrow_mut().drain(..).collect();
        self.tasks.extend(spawned);
    }

    /// Advances the clock to the earliest deadline and removes every timer due at that instant.
    fn pop_due_timers(&self) -> Vec<Waker> {
        let mut timers = self.sim.0.timers.borrow_mut();
        let Some((&(deadline, _), _)) = timers.iter().next() else {
            return Vec::new();
        };
        if deadline >= self.sim.horizon() {
            return Vec::new();
        }
        self.sim.0.now.set(deadline);
        let later = timers.split_off(&(deadline + 1, 0));
        let due = std::mem::replace(&mut *timers, later);
        due.into_values().collect()
    }
}
