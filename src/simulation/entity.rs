use std::cell::RefCell;
use std::rc::Rc;

use super::channel::{Attempt, Channel};
use super::executor::Sim;
use super::rng::SimRng;
use super::types::{EntityId, EntityStats, EventKind, Family, Micros};

/// What every contending entity carries: identity, the shared channel and random stream, and the
/// counters the runner reads back once the run is over.
pub struct EntityContext {
    pub id: EntityId,
    pub name: String,
    pub family: Family,
    pub channel: Rc<Channel>,
    pub rng: SimRng,
    pub stats: Rc<RefCell<EntityStats>>,
}

impl EntityContext {
    pub fn sim(&self) -> &Sim {
        self.channel.sim()
    }

    pub fn now(&self) -> Micros {
        self.channel.sim().now()
    }

    /// Records a resolved attempt both in the entity's counters and on the channel.
    pub fn record(&self, started_at: Micros, kind: EventKind, payload: Micros, control: Micros) {
        {
            let mut stats = self.stats.borrow_mut();
            match kind {
                EventKind::Success => {
                    stats.succeeded += 1;
                    stats.airtime += payload;
                    stats.control_airtime += control;
                }
                EventKind::Collision => stats.failed += 1,
            }
        }
        self.channel.record_attempt(Attempt { name: &self.name, family: self.family, started_at, kind, payload, control });
    }
}
