//! The beat-domain scheduler inside the beat clock: a priority queue
//! keyed by absolute beat, drained after every tick. Events closer than a
//! tick get handed down to the wall clock so its precision stage can land
//! them between ticks.

use std::cell::RefCell;
use std::rc::Rc;

use crate::beat_clock::BeatClockInner;
use crate::clock::{ClockEventInfo, ClockId};
use crate::containers::{IdTable, KeyedPriorityQueue};
use crate::time::Time;

pub type BeatId = u32;

/// Passed to every beat timeout and interval callback.
#[derive(Clone, Copy, Debug)]
pub struct BeatEventInfo {
    pub id: BeatId,
    /// Beat position at delivery.
    pub now: f64,
    /// The goal beat this fire was scheduled for.
    pub intended: f64,
    /// 0.0 for one-shots.
    pub period: f64,
}

pub type BeatCallback = Box<dyn FnMut(BeatEventInfo)>;

struct BeatEvent {
    /// Last intended fire beat; the next goal is `prev + period`.
    prev: f64,
    period: f64,
    /// Taken out of the slot only while the callback runs.
    callback: Option<BeatCallback>,
    deleted: bool,
}

pub(crate) struct BeatScheduler {
    queue: KeyedPriorityQueue<f64, BeatId>,
    table: IdTable<BeatEvent>,
    /// The single outstanding wall-clock timeout driving sub-tick fires.
    pub(crate) timeout: Option<ClockId>,
}

impl BeatScheduler {
    pub(crate) fn new() -> Self {
        Self {
            queue: KeyedPriorityQueue::new(),
            table: IdTable::new(),
            timeout: None,
        }
    }

    /// Queues an event at `goal`; `period` of 0.0 means one-shot. The
    /// caller follows up with `update_waiting_time`.
    pub(crate) fn insert(
        &mut self,
        goal: f64,
        period: f64,
        callback: BeatCallback,
    ) -> BeatId {
        let id = self.table.push(BeatEvent {
            prev: goal - period,
            period,
            callback: Some(callback),
            deleted: false,
        });
        self.queue.push(goal, id);
        id
    }

    /// Marks the event deleted; reclaimed lazily when it surfaces in the
    /// queue. A no-op for handles that already fired or were cleared.
    pub(crate) fn clear(&mut self, id: BeatId) {
        if let Some(event) = self.table.get_mut(id) {
            event.deleted = true;
        }
    }
}

/// The next beat at or after `current` congruent to `offset` modulo
/// `sync`, nudged by a small epsilon so an event never lands on the
/// instant that asked for it.
pub(crate) fn next_synced_beat(current: f64, sync: f64, offset: f64) -> f64 {
    let mut next = (current / sync + 0.000001).ceil() * sync + offset;
    while next < current + 0.000001 {
        next += sync;
    }
    next.max(0.0)
}

/// Drains everything due at the current beat, then re-plans the wait.
pub(super) fn process(inner: &Rc<RefCell<BeatClockInner>>) {
    let now_beat = inner.borrow().current_beat();
    loop {
        let due = {
            let mut bc = inner.borrow_mut();
            match bc.scheduler.queue.top() {
                Some((goal, id)) if goal <= now_beat => {
                    bc.scheduler.queue.pop();
                    Some((goal, id))
                }
                _ => None,
            }
        };
        let Some((goal, id)) = due else {
            break;
        };
        process_event(inner, id, now_beat, goal);
    }
    update_waiting_time(inner);
}

/// The event is out of the queue but still in the table: invoke unless
/// deleted, then reschedule (interval) or free.
fn process_event(inner: &Rc<RefCell<BeatClockInner>>, id: BeatId, now: f64, goal: f64) {
    let taken = {
        let mut bc = inner.borrow_mut();
        match bc.scheduler.table.get_mut(id) {
            Some(event) if !event.deleted => {
                event.callback.take().map(|callback| (callback, event.period))
            }
            _ => None,
        }
    };

    if let Some((mut callback, period)) = taken {
        callback(BeatEventInfo {
            id,
            now,
            intended: goal,
            period,
        });

        let mut bc = inner.borrow_mut();
        if let Some(event) = bc.scheduler.table.get_mut(id) {
            event.callback = Some(callback);
        }
    }

    // Re-resolve by handle: the callback may have grown the table
    let mut bc = inner.borrow_mut();
    match bc.scheduler.table.get_mut(id) {
        Some(event) if !event.deleted && event.period != 0.0 => {
            event.prev += event.period;
            let next = event.prev + event.period;
            bc.scheduler.queue.push(next, id);
        }
        Some(_) => {
            bc.scheduler.table.free(id);
        }
        None => {}
    }
}

/// Chooses how the next event gets fired: more than a tick away, the next
/// tick re-checks; already due, an immediate wall-clock timeout; within a
/// tick, a precise wall-clock timeout between ticks. At most one
/// wall-clock timeout is outstanding, replaced on every re-plan.
pub(super) fn update_waiting_time(inner: &Rc<RefCell<BeatClockInner>>) {
    let mut bc = inner.borrow_mut();
    let clock = bc.clock.clone();

    if let Some(id) = bc.scheduler.timeout.take() {
        clock.clear_timeout(id);
    }

    let Some((goal, _)) = bc.scheduler.queue.top() else {
        return;
    };

    let tick_beats = 1.0 / bc.tick_resolution() as f64;
    let current = bc.current_beat();

    if current + tick_beats < goal {
        return;
    }

    let weak = bc.weak_self.clone();
    let callback = move |_info: ClockEventInfo| {
        if let Some(inner) = weak.upgrade() {
            inner.borrow_mut().scheduler.timeout = None;
            process(&inner);
        }
    };

    let target: Time = if current >= goal {
        0
    } else {
        let beat_period = bc.state.beat_period as f64;
        clock.current_time() + ((goal - current) * beat_period) as Time
    };
    bc.scheduler.timeout = Some(clock.set_timeout_absolute(target, callback));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_next_synced_beat_lands_on_the_grid() {
        approx_eq(next_synced_beat(3.4, 1.0, 0.0), 4.0);
        approx_eq(next_synced_beat(3.4, 4.0, 0.0), 4.0);
        approx_eq(next_synced_beat(5.0, 4.0, 0.0), 8.0);
        approx_eq(next_synced_beat(3.4, 1.0, 0.5), 4.5);
        approx_eq(next_synced_beat(0.0, 0.25, 0.0), 0.25);
    }

    #[test]
    fn test_next_synced_beat_is_strictly_ahead() {
        // Sitting exactly on a grid point schedules the next one
        let next = next_synced_beat(4.0, 1.0, 0.0);
        approx_eq(next, 5.0);

        // An offset behind the current beat rolls forward by whole syncs
        let rolled = next_synced_beat(10.7, 1.0, 0.5);
        approx_eq(rolled, 11.5);
        assert!(rolled > 10.7);
    }

    #[test]
    fn test_next_synced_beat_never_negative() {
        assert!(next_synced_beat(-8.0, 1.0, 0.0) >= 0.0);
    }
}
