//! Wall-clock scheduler: callbacks at absolute monotonic times with
//! sub-tick precision. One platform wake-up is armed at any moment, aimed
//! slightly early by the precision timer; the last stretch to each goal is
//! closed with a busy-wait so `now` lands just past `intended`.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::containers::{IdTable, KeyedPriorityQueue};
use crate::platform::Platform;
use crate::precision::PrecisionTimer;
use crate::time::Time;

pub type ClockId = u32;

/// Passed to every timeout and interval callback.
#[derive(Clone, Copy, Debug)]
pub struct ClockEventInfo {
    pub id: ClockId,
    /// Clock time observed immediately after the busy-wait stage exits.
    pub now: Time,
    /// The goal time this fire was scheduled for.
    pub intended: Time,
    /// 0 for one-shots.
    pub period: Time,
    /// Busy-wait iterations spent closing the gap to `intended`.
    pub spin_count: u64,
}

pub type ClockCallback = Box<dyn FnMut(ClockEventInfo)>;

struct ClockEvent {
    /// Last intended fire time; the next goal is `prev + period`,
    /// independent of when the callback actually ran.
    prev: Time,
    period: Time,
    /// Taken out of the slot only while the callback runs.
    callback: Option<ClockCallback>,
    deleted: bool,
}

struct ClockState {
    queue: KeyedPriorityQueue<Time, ClockId>,
    table: IdTable<ClockEvent>,
    timer_armed: bool,
    waiting_time: Time,
    precision: PrecisionTimer,
}

/// A cheaply cloneable handle to the scheduler. All handles share state;
/// everything runs on the main-loop thread.
pub struct Clock {
    platform: Rc<dyn Platform>,
    state: Rc<RefCell<ClockState>>,
}

impl Clone for Clock {
    fn clone(&self) -> Self {
        Self {
            platform: self.platform.clone(),
            state: self.state.clone(),
        }
    }
}

impl Clock {
    pub fn new(platform: Rc<dyn Platform>) -> Self {
        let state = Rc::new(RefCell::new(ClockState {
            queue: KeyedPriorityQueue::new(),
            table: IdTable::new(),
            timer_armed: false,
            waiting_time: 0,
            precision: PrecisionTimer::new(),
        }));

        let weak_platform = Rc::downgrade(&platform);
        let weak_state = Rc::downgrade(&state);
        platform.set_on_timer(Box::new(move || {
            if let (Some(platform), Some(state)) =
                (weak_platform.upgrade(), weak_state.upgrade())
            {
                process(&platform, &state);
            }
        }));

        Self { platform, state }
    }

    pub fn current_time(&self) -> Time {
        self.platform.current_time()
    }

    /// Fire once, `duration` from now.
    pub fn set_timeout(
        &self,
        duration: Time,
        callback: impl FnMut(ClockEventInfo) + 'static,
    ) -> ClockId {
        self.set_timeout_absolute(self.current_time() + duration, callback)
    }

    /// Fire once at the absolute time `goal`. A goal in the past fires on
    /// the next wake rather than being replayed or dropped.
    pub fn set_timeout_absolute(
        &self,
        goal: Time,
        callback: impl FnMut(ClockEventInfo) + 'static,
    ) -> ClockId {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.table.push(ClockEvent {
                prev: 0,
                period: 0,
                callback: Some(Box::new(callback)),
                deleted: false,
            });
            state.queue.push(goal, id);
            id
        };
        update_waiting_time(&self.platform, &self.state);
        id
    }

    /// Fire every `period`, starting one period from now.
    pub fn set_interval(
        &self,
        period: Time,
        callback: impl FnMut(ClockEventInfo) + 'static,
    ) -> ClockId {
        self.set_interval_absolute(self.current_time() + period, period, callback)
    }

    /// Fire at `goal`, then every `period` after it. Successive goals are
    /// spaced from the previous intended fire, never the observed one, so
    /// intervals do not drift.
    pub fn set_interval_absolute(
        &self,
        goal: Time,
        period: Time,
        callback: impl FnMut(ClockEventInfo) + 'static,
    ) -> ClockId {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.table.push(ClockEvent {
                // Wraps when the first goal is within one period of the
                // epoch; the first reschedule wraps back
                prev: goal.wrapping_sub(period),
                period,
                callback: Some(Box::new(callback)),
                deleted: false,
            });
            state.queue.push(goal, id);
            id
        };
        update_waiting_time(&self.platform, &self.state);
        id
    }

    /// Marks the event deleted; its callback will never run again. Storage
    /// is reclaimed lazily when the entry surfaces in the queue. A no-op
    /// for handles that already fired or were already cleared.
    pub fn clear_timeout(&self, id: ClockId) {
        let mut state = self.state.borrow_mut();
        if let Some(event) = state.table.get_mut(id) {
            event.deleted = true;
        }
    }

    pub fn clear_interval(&self, id: ClockId) {
        self.clear_timeout(id);
    }
}

/// Re-aims the platform's one-shot at the top of the queue, disarming it
/// when the queue is empty.
fn update_waiting_time(platform: &Rc<dyn Platform>, state: &Rc<RefCell<ClockState>>) {
    let mut state = state.borrow_mut();
    match state.queue.top() {
        None => {
            if state.timer_armed {
                state.timer_armed = false;
                state.waiting_time = 0;
                platform.clear_timer();
            }
        }
        Some((goal, _)) => {
            if state.timer_armed && state.waiting_time == goal {
                return;
            }
            state.waiting_time = goal;
            let request = state.precision.plan_wake(goal);
            trace!("arming wake-up: goal {} request {}", goal, request);
            platform.set_timer(request);
            state.timer_armed = true;
        }
    }
}

/// Platform wake handler: drain everything due (or close enough that the
/// busy-wait stage should absorb the rest), then re-arm.
fn process(platform: &Rc<dyn Platform>, state: &Rc<RefCell<ClockState>>) {
    {
        let mut state = state.borrow_mut();
        let now = platform.current_time();
        state.precision.observe_wake(now);
        // the one-shot has elapsed
        state.timer_armed = false;
    }

    loop {
        let due = {
            let mut state = state.borrow_mut();
            match state.queue.top() {
                None => None,
                Some((goal, id)) => {
                    let now = platform.current_time();
                    let deleted =
                        state.table.get(id).is_none_or(|event| event.deleted);
                    if deleted || state.precision.should_process(now, goal) {
                        state.queue.pop();
                        Some((goal, id))
                    } else {
                        None
                    }
                }
            }
        };
        match due {
            Some((goal, id)) => process_event(platform, state, id, goal),
            None => break,
        }
    }

    update_waiting_time(platform, state);
}

/// The event is out of the queue but still in the table. Busy-wait to the
/// goal, invoke, then reschedule (interval) or free (everything else).
fn process_event(
    platform: &Rc<dyn Platform>,
    state: &Rc<RefCell<ClockState>>,
    id: ClockId,
    goal: Time,
) {
    let taken = {
        let mut state = state.borrow_mut();
        match state.table.get_mut(id) {
            Some(event) if !event.deleted => {
                event.callback.take().map(|callback| (callback, event.period))
            }
            _ => None,
        }
    };

    if let Some((mut callback, period)) = taken {
        // Callbacks never run before the time they asked for
        let mut now = platform.current_time();
        let spin_count = platform.busy_wait_until(&mut || {
            now = platform.current_time();
            now > goal
        });

        callback(ClockEventInfo {
            id,
            now,
            intended: goal,
            period,
            spin_count,
        });

        // The callback may have cleared this event, but the slot cannot
        // have been freed or reused while the callback was out
        let mut state = state.borrow_mut();
        if let Some(event) = state.table.get_mut(id) {
            event.callback = Some(callback);
        }
    }

    // Re-resolve by handle: the callback may have grown the table
    let rescheduled = {
        let mut state = state.borrow_mut();
        match state.table.get_mut(id) {
            Some(event) if !event.deleted && event.period != 0 => {
                event.prev = event.prev.wrapping_add(event.period);
                let next = event.prev.wrapping_add(event.period);
                state.queue.push(next, id);
                true
            }
            Some(_) => {
                state.table.free(id);
                false
            }
            None => false,
        }
    };
    if rescheduled {
        update_waiting_time(platform, state);
    }
}
