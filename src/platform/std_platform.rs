//! Hosted platform on plain std: monotonic time from an `Instant` epoch
//! and a blocking main loop over an mpsc wake channel. Producer threads
//! (MIDI input, for one) never touch scheduler state; they enqueue their
//! data somewhere the main thread can reach, then post a wake through a
//! `Waker` and let the registered drain handler run on the main thread.

use std::cell::{Cell, RefCell};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::trace;

use crate::platform::{Platform, TimerCallback};
use crate::time::Time;

/// Cloneable, thread-safe monotonic time source. All copies share the
/// epoch of the platform that handed them out.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicTime {
    epoch: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> Time {
        self.epoch.elapsed().as_nanos() as Time
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

enum Wake {
    Source(usize),
    Quit,
}

/// Posts a wake for one registered source. Cloneable and sendable to the
/// producer thread that owns the other end of the data.
#[derive(Clone)]
pub struct Waker {
    tx: Sender<Wake>,
    source: usize,
}

impl Waker {
    pub fn wake(&self) {
        let _ = self.tx.send(Wake::Source(self.source));
    }
}

pub struct StdPlatform {
    time: MonotonicTime,
    deadline: Cell<Option<Time>>,
    on_timer: RefCell<Option<TimerCallback>>,
    sources: RefCell<Vec<Option<Box<dyn FnMut()>>>>,
    tx: Sender<Wake>,
    rx: Receiver<Wake>,
    running: Cell<bool>,
}

impl StdPlatform {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            time: MonotonicTime::new(),
            deadline: Cell::new(None),
            on_timer: RefCell::new(None),
            sources: RefCell::new(Vec::new()),
            tx,
            rx,
            running: Cell::new(false),
        }
    }

    /// A time source sharing this platform's epoch, for producer threads
    /// that stamp incoming data.
    pub fn time_source(&self) -> MonotonicTime {
        self.time
    }

    /// Registers a main-thread handler and returns the `Waker` that
    /// schedules it from any thread.
    pub fn register_source(&self, handler: Box<dyn FnMut()>) -> Waker {
        let mut sources = self.sources.borrow_mut();
        sources.push(Some(handler));
        Waker {
            tx: self.tx.clone(),
            source: sources.len() - 1,
        }
    }

    /// Blocks dispatching timer wake-ups and source wakes until `quit`.
    pub fn run(&self) {
        self.running.set(true);
        trace!("entering main loop");
        while self.running.get() {
            match self.deadline.get() {
                Some(deadline) => {
                    let now = self.time.now();
                    if now >= deadline {
                        self.fire_timer();
                        continue;
                    }
                    match self.rx.recv_timeout(Duration::from_nanos(deadline - now)) {
                        Ok(wake) => self.dispatch(wake),
                        Err(RecvTimeoutError::Timeout) => self.fire_timer(),
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(wake) => self.dispatch(wake),
                    Err(_) => break,
                },
            }
        }
        trace!("left main loop");
    }

    pub fn quit(&self) {
        self.running.set(false);
        let _ = self.tx.send(Wake::Quit);
    }

    fn dispatch(&self, wake: Wake) {
        match wake {
            Wake::Quit => self.running.set(false),
            Wake::Source(index) => {
                // Taken out for the duration of the call so the handler
                // may register further sources
                let handler = self
                    .sources
                    .borrow_mut()
                    .get_mut(index)
                    .and_then(Option::take);
                if let Some(mut handler) = handler {
                    handler();
                    let mut sources = self.sources.borrow_mut();
                    if let Some(slot) = sources.get_mut(index) {
                        *slot = Some(handler);
                    }
                }
            }
        }
    }

    fn fire_timer(&self) {
        self.deadline.set(None);
        let callback = self.on_timer.borrow_mut().take();
        if let Some(mut callback) = callback {
            callback();
            let mut slot = self.on_timer.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

impl Default for StdPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for StdPlatform {
    fn current_time(&self) -> Time {
        self.time.now()
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
            std::hint::spin_loop();
        }
        spins
    }
}
