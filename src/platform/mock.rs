//! A platform with virtual time under manual control, for deterministic
//! scheduler tests. `fire_timer` models the host waking us up late by a
//! configurable amount, and busy-waits consume virtual time one small
//! step per iteration so they terminate.

use std::cell::{Cell, RefCell};

use crate::platform::{Platform, TimerCallback};
use crate::time::{micros, Time};

pub struct MockPlatform {
    now: Cell<Time>,
    deadline: Cell<Option<Time>>,
    on_timer: RefCell<Option<TimerCallback>>,
    wake_latency: Cell<Time>,
    spin_step: Cell<Time>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            now: Cell::new(0),
            deadline: Cell::new(None),
            on_timer: RefCell::new(None),
            wake_latency: Cell::new(0),
            spin_step: Cell::new(micros(1)),
        }
    }

    pub fn now(&self) -> Time {
        self.now.get()
    }

    pub fn advance(&self, duration: Time) {
        self.now.set(self.now.get() + duration);
    }

    pub fn armed_deadline(&self) -> Option<Time> {
        self.deadline.get()
    }

    /// Synthetic lateness added to every wake-up.
    pub fn set_wake_latency(&self, latency: Time) {
        self.wake_latency.set(latency);
    }

    /// Delivers the armed wake-up: jumps virtual time to the deadline plus
    /// the synthetic latency and invokes the on-timer handler. Returns
    /// false when no timer is armed.
    pub fn fire_timer(&self) -> bool {
        let Some(deadline) = self.deadline.get() else {
            return false;
        };
        self.deadline.set(None);
        let wake = deadline + self.wake_latency.get();
        if self.now.get() < wake {
            self.now.set(wake);
        }
        let callback = self.on_timer.borrow_mut().take();
        if let Some(mut callback) = callback {
            callback();
            let mut slot = self.on_timer.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
        true
    }

    /// Fires every wake-up armed at or before `until`, in order, then
    /// settles virtual time at `until`. Handlers may re-arm; the loop
    /// re-reads the deadline each round.
    pub fn run_until(&self, until: Time) {
        while let Some(deadline) = self.deadline.get() {
            if deadline > until {
                break;
            }
            self.fire_timer();
        }
        if self.now.get() < until {
            self.now.set(until);
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn current_time(&self) -> Time {
        self.now.get()
    }

    fn set_timer(&self, deadline: Time) {
        self.deadline.set(Some(deadline));
    }

    fn clear_timer(&self) {
        self.deadline.set(None);
    }

    fn set_on_timer(&self, callback: TimerCallback) {
        *self.on_timer.borrow_mut() = Some(callback);
    }

    fn busy_wait_until(&self, predicate: &mut dyn FnMut() -> bool) -> u64 {
        let mut spins = 0;
        while !predicate() {
            spins += 1;
            self.now.set(self.now.get() + self.spin_step.get());
        }
        spins
    }
}
