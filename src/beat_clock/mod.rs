//! Musical scheduler: callbacks at positions on a beat timeline whose
//! tempo comes from the internal tick generator or an external MIDI
//! clock. The beat position survives BPM changes and source swaps, and
//! pending beat events keep their goals across both.

pub mod scheduler;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::info;

use crate::clock::{Clock, ClockId};
use crate::config::{
    DEFAULT_BPM, DEFAULT_PPQN, MIDI_CLOCK, MIDI_PPQN, MIDI_TICK_MEAN_WINDOW,
};
use crate::logging::warn_once;
use crate::midi::MidiSource;
use crate::precision::RunningMean;
use crate::time::{self, Time};

pub use scheduler::{BeatCallback, BeatEventInfo, BeatId};

/// Nanoseconds per beat at `bpm`.
pub fn bpm_to_beat_period(bpm: f64) -> Time {
    time::secs_f64(60.0 / bpm)
}

/// Nanoseconds per tick at `bpm` with `ppqn` ticks per beat.
pub fn bpm_to_tick_period(bpm: f64, ppqn: u32) -> Time {
    time::secs_f64(60.0 / bpm / ppqn as f64)
}

/// Snapshot handed to the tick observer, taken before the tick advances
/// the beat position.
#[derive(Clone, Copy, Debug)]
pub struct BeatClockInfo {
    pub bpm: f64,
    pub ppqn: u32,
    pub beat: f64,
    pub beat_phase: u32,
    pub time: Time,
    pub intended: Time,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockSource {
    Internal,
    Midi,
}

/// Tempo and position state carried across BPM changes and source swaps.
struct TickState {
    bpm: f64,
    ppqn: u32,
    beat_period: Time,
    tick_period: Time,
    beat: f64,
    beat_ref: i64,
    tick_count: u64,
    beat_phase: u32,
    last_tick_time: Time,
    last_tick_time_intended: Time,
}

impl TickState {
    fn new() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            ppqn: DEFAULT_PPQN,
            beat_period: bpm_to_beat_period(DEFAULT_BPM),
            tick_period: bpm_to_tick_period(DEFAULT_BPM, DEFAULT_PPQN),
            beat: 0.0,
            beat_ref: 0,
            tick_count: 0,
            beat_phase: 0,
            last_tick_time: 0,
            last_tick_time_intended: 0,
        }
    }

    /// Advances one tick on a `tick_ppqn` grid. Once per beat the position
    /// re-snaps to the integer reference so floating-point error cannot
    /// accumulate across beats.
    fn advance(&mut self, time: Time, intended: Time, tick_ppqn: u32) {
        self.tick_count += 1;
        self.beat_phase += 1;
        self.beat += 1.0 / tick_ppqn as f64;
        self.last_tick_time = time;
        self.last_tick_time_intended = intended;
        if self.beat_phase % tick_ppqn == 0 {
            self.beat_phase = 0;
            self.beat_ref += 1;
            self.beat = self.beat_ref as f64;
        }
    }
}

/// Per-source workings. Swapping sources replaces this while `TickState`
/// carries over untouched.
enum SourceImpl {
    Internal {
        /// The wall-clock interval generating ticks while running.
        interval: Option<ClockId>,
    },
    Midi {
        /// Inter-arrival times of 0xF8 bytes, from which the tick period,
        /// beat period, and bpm are back-derived.
        arrivals: RunningMean<MIDI_TICK_MEAN_WINDOW>,
    },
}

pub(crate) struct BeatClockInner {
    pub(crate) weak_self: Weak<RefCell<BeatClockInner>>,
    pub(crate) clock: Clock,
    midi: Option<Rc<dyn MidiSource>>,
    source: ClockSource,
    source_impl: SourceImpl,
    pub(crate) state: TickState,
    running: bool,
    send_midi_clock: bool,
    on_tick: Option<Box<dyn FnMut(BeatClockInfo)>>,
    pub(crate) scheduler: scheduler::BeatScheduler,
}

impl BeatClockInner {
    /// The tick grid the beat actually advances on: the user-configured
    /// resolution internally, the fixed MIDI realtime grid externally.
    pub(crate) fn tick_resolution(&self) -> u32 {
        match self.source {
            ClockSource::Internal => self.state.ppqn,
            ClockSource::Midi => MIDI_PPQN,
        }
    }

    /// Continuous beat position between ticks. The internal source knows
    /// what each tick was scheduled for; a MIDI source only has receive
    /// timestamps.
    pub(crate) fn current_beat(&self) -> f64 {
        let reference = match self.source {
            ClockSource::Internal => self.state.last_tick_time_intended,
            ClockSource::Midi => {
                if self.state.tick_count == 0 && self.state.last_tick_time == 0 {
                    // No tick received yet, nothing to interpolate from
                    return self.state.beat;
                }
                self.state.last_tick_time
            }
        };
        let now = self.clock.current_time();
        let elapsed = (now as i64 - reference as i64) as f64;
        self.state.beat + elapsed / self.state.beat_period as f64
    }
}

/// A handle to the musical scheduler. Handles are cheap to clone; ticking
/// stops when the last one is dropped.
pub struct BeatClock {
    inner: Rc<RefCell<BeatClockInner>>,
}

impl Clone for BeatClock {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for BeatClock {
    fn drop(&mut self) {
        // Callbacks registered with the wall clock and the MIDI source
        // only hold weak references, so the last handle tears down here.
        // A handle dying inside one of this clock's own callbacks skips
        // the teardown; the state it would touch is already unwinding.
        if Rc::strong_count(&self.inner) == 1 && self.inner.try_borrow_mut().is_ok() {
            self.stop();
        }
    }
}

impl BeatClock {
    /// Builds the beat clock and starts the internal source ticking at
    /// the default tempo.
    pub fn new(clock: Clock, midi: Option<Rc<dyn MidiSource>>) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<BeatClockInner>>| {
            RefCell::new(BeatClockInner {
                weak_self: weak.clone(),
                clock: clock.clone(),
                midi,
                source: ClockSource::Internal,
                source_impl: SourceImpl::Internal { interval: None },
                state: TickState::new(),
                running: false,
                send_midi_clock: false,
                on_tick: None,
                scheduler: scheduler::BeatScheduler::new(),
            })
        });
        let beat_clock = Self { inner };
        start_source(&beat_clock.inner);
        beat_clock
    }

    pub fn current_beat(&self) -> f64 {
        self.inner.borrow().current_beat()
    }

    pub fn bpm(&self) -> f64 {
        self.inner.borrow().state.bpm
    }

    pub fn ppqn(&self) -> u32 {
        self.inner.borrow().state.ppqn
    }

    pub fn source(&self) -> ClockSource {
        self.inner.borrow().source
    }

    /// Observer invoked on every tick, before the beat advances.
    pub fn set_on_tick(&self, callback: impl FnMut(BeatClockInfo) + 'static) {
        self.inner.borrow_mut().on_tick = Some(Box::new(callback));
    }

    /// Transmit a 0xF8 realtime byte on every tick when enabled.
    pub fn send_midi_clock(&self, state: bool) {
        self.inner.borrow_mut().send_midi_clock = state;
    }

    /// Swaps the tempo source, carrying the full beat position and tempo
    /// state over; pending beat events keep their goals.
    pub fn set_source(&self, source: ClockSource) {
        {
            let bc = self.inner.borrow();
            if source == ClockSource::Midi && bc.midi.is_none() {
                drop(bc);
                warn_once(
                    "No MIDI source configured; staying on the internal clock"
                        .to_string(),
                );
                return;
            }
        }
        stop_source(&self.inner);
        {
            let mut bc = self.inner.borrow_mut();
            bc.source = source;
            bc.source_impl = match source {
                ClockSource::Internal => SourceImpl::Internal { interval: None },
                ClockSource::Midi => SourceImpl::Midi {
                    arrivals: RunningMean::new(),
                },
            };
            info!("Clock source: {:?}", source);
        }
        start_source(&self.inner);
    }

    /// Changes the internal tempo, re-aiming the next tick at
    /// `last intended tick + new period` (or now, if that already
    /// passed). Ignored while following a MIDI clock.
    pub fn set_bpm(&self, bpm: f64) {
        let mut bc = self.inner.borrow_mut();
        if bc.source == ClockSource::Midi {
            drop(bc);
            warn_once(
                "set_bpm has no effect while following a MIDI clock".to_string(),
            );
            return;
        }
        let old_tick_period = bc.state.tick_period;
        bc.state.bpm = bpm;
        bc.state.beat_period = bpm_to_beat_period(bpm);
        bc.state.tick_period = bpm_to_tick_period(bpm, bc.state.ppqn);
        if bc.running && bc.state.tick_period != old_tick_period {
            restart_tick_interval(&mut bc);
        }
    }

    /// Changes the internal tick resolution. Under a MIDI source only the
    /// reported value changes; the beat keeps advancing on the realtime
    /// clock's own 24-per-beat grid.
    pub fn set_ppqn(&self, ppqn: u32) {
        let mut bc = self.inner.borrow_mut();
        bc.state.ppqn = ppqn;
        if bc.source == ClockSource::Internal {
            let old_tick_period = bc.state.tick_period;
            bc.state.tick_period = bpm_to_tick_period(bc.state.bpm, ppqn);
            if bc.running && bc.state.tick_period != old_tick_period {
                restart_tick_interval(&mut bc);
            }
        }
    }

    /// Fire once, `duration` beats from now.
    pub fn set_beat_timeout(
        &self,
        duration: f64,
        callback: impl FnMut(BeatEventInfo) + 'static,
    ) -> BeatId {
        let goal = self.current_beat() + duration;
        self.set_beat_timeout_absolute(goal, callback)
    }

    /// Fire once at beat `goal`.
    pub fn set_beat_timeout_absolute(
        &self,
        goal: f64,
        callback: impl FnMut(BeatEventInfo) + 'static,
    ) -> BeatId {
        let id = self
            .inner
            .borrow_mut()
            .scheduler
            .insert(goal, 0.0, Box::new(callback));
        scheduler::update_waiting_time(&self.inner);
        id
    }

    /// Fire every `period` beats, starting one period from now.
    pub fn set_beat_interval(
        &self,
        period: f64,
        callback: impl FnMut(BeatEventInfo) + 'static,
    ) -> BeatId {
        let goal = self.current_beat() + period;
        self.set_beat_interval_absolute(goal, period, callback)
    }

    /// Fire at beat `goal`, then every `period` beats after it.
    pub fn set_beat_interval_absolute(
        &self,
        goal: f64,
        period: f64,
        callback: impl FnMut(BeatEventInfo) + 'static,
    ) -> BeatId {
        let id = self
            .inner
            .borrow_mut()
            .scheduler
            .insert(goal, period, Box::new(callback));
        scheduler::update_waiting_time(&self.inner);
        id
    }

    /// Fire once at the next beat congruent to `offset` modulo `sync`.
    pub fn set_beat_sync_timeout(
        &self,
        sync: f64,
        offset: f64,
        callback: impl FnMut(BeatEventInfo) + 'static,
    ) -> BeatId {
        let goal = scheduler::next_synced_beat(self.current_beat(), sync, offset);
        self.set_beat_timeout_absolute(goal, callback)
    }

    /// As `set_beat_sync_timeout` for the first fire, then every `period`
    /// beats after it.
    pub fn set_beat_sync_interval(
        &self,
        sync: f64,
        offset: f64,
        period: f64,
        callback: impl FnMut(BeatEventInfo) + 'static,
    ) -> BeatId {
        let goal = scheduler::next_synced_beat(self.current_beat(), sync, offset);
        self.set_beat_interval_absolute(goal, period, callback)
    }

    /// Marks the event deleted; its callback will never run again. A
    /// no-op for handles that already fired or were already cleared.
    pub fn clear_beat_timeout(&self, id: BeatId) {
        self.inner.borrow_mut().scheduler.clear(id);
    }

    pub fn clear_beat_interval(&self, id: BeatId) {
        self.clear_beat_timeout(id);
    }

    /// Stops tick generation and the scheduler's outstanding wall-clock
    /// timeout. Pending beat events stay queued and resume firing if a
    /// source is started again.
    pub fn stop(&self) {
        stop_source(&self.inner);
        let mut bc = self.inner.borrow_mut();
        let clock = bc.clock.clone();
        if let Some(id) = bc.scheduler.timeout.take() {
            clock.clear_timeout(id);
        }
    }
}

fn start_source(inner: &Rc<RefCell<BeatClockInner>>) {
    let mut bc = inner.borrow_mut();
    bc.running = true;
    match bc.source {
        ClockSource::Internal => {
            let now = bc.clock.current_time();
            // Anchors current-beat interpolation until the first tick
            bc.state.last_tick_time_intended = now;
            start_tick_interval(&mut bc, now);
        }
        ClockSource::Midi => {
            let weak = bc.weak_self.clone();
            if let Some(midi) = bc.midi.clone() {
                midi.set_on_clock(Some(Box::new(move |time, bytes| {
                    if bytes.len() == 1 && bytes[0] == MIDI_CLOCK {
                        if let Some(inner) = weak.upgrade() {
                            upon_midi_tick(&inner, time);
                        }
                    }
                })));
            }
        }
    }
}

fn stop_source(inner: &Rc<RefCell<BeatClockInner>>) {
    let mut bc = inner.borrow_mut();
    bc.running = false;
    match bc.source {
        ClockSource::Internal => {
            let interval = match &mut bc.source_impl {
                SourceImpl::Internal { interval } => interval.take(),
                _ => None,
            };
            if let Some(id) = interval {
                bc.clock.clear_interval(id);
            }
        }
        ClockSource::Midi => {
            if let Some(midi) = bc.midi.clone() {
                midi.set_on_clock(None);
            }
        }
    }
}

fn start_tick_interval(bc: &mut BeatClockInner, start: Time) {
    let weak = bc.weak_self.clone();
    let id = bc.clock.set_interval_absolute(
        start,
        bc.state.tick_period,
        move |info| {
            if let Some(inner) = weak.upgrade() {
                upon_tick(&inner, info.now, info.intended);
            }
        },
    );
    if let SourceImpl::Internal { interval } = &mut bc.source_impl {
        *interval = Some(id);
    }
}

/// Re-aims the running tick interval after a tempo change: the next tick
/// lands at `last intended + new period` when that is still ahead,
/// otherwise immediately.
fn restart_tick_interval(bc: &mut BeatClockInner) {
    let interval = match &mut bc.source_impl {
        SourceImpl::Internal { interval } => interval.take(),
        _ => None,
    };
    let Some(id) = interval else {
        return;
    };
    bc.clock.clear_interval(id);

    let now = bc.clock.current_time();
    let next = bc.state.last_tick_time_intended + bc.state.tick_period;
    let start = if next >= now { next } else { now };
    start_tick_interval(bc, start);
}

/// A tick from either source: emit, advance, then drive the scheduler.
fn upon_tick(inner: &Rc<RefCell<BeatClockInner>>, time: Time, intended: Time) {
    let (info, midi) = {
        let bc = inner.borrow();
        let info = BeatClockInfo {
            bpm: bc.state.bpm,
            ppqn: bc.state.ppqn,
            beat: bc.state.beat,
            beat_phase: bc.state.beat_phase,
            time,
            intended,
        };
        let midi = if bc.send_midi_clock {
            bc.midi.clone()
        } else {
            None
        };
        (info, midi)
    };

    if let Some(midi) = midi {
        midi.send(&[MIDI_CLOCK]);
    }

    let observer = inner.borrow_mut().on_tick.take();
    if let Some(mut observer) = observer {
        observer(info);
        let mut bc = inner.borrow_mut();
        if bc.on_tick.is_none() {
            bc.on_tick = Some(observer);
        }
    }

    {
        let mut bc = inner.borrow_mut();
        let tick_ppqn = bc.tick_resolution();
        bc.state.advance(time, intended, tick_ppqn);
    }

    scheduler::process(inner);
}

/// A 0xF8 byte from the MIDI source: refresh the tempo estimate from the
/// inter-arrival mean, then tick. Receive time stands in for the intended
/// time; an external clock has nothing better to offer.
fn upon_midi_tick(inner: &Rc<RefCell<BeatClockInner>>, time: Time) {
    {
        let mut bc = inner.borrow_mut();
        let BeatClockInner {
            source_impl, state, ..
        } = &mut *bc;
        let SourceImpl::Midi { arrivals } = source_impl else {
            return;
        };
        // The first tick ever seen has no predecessor to measure from
        if state.last_tick_time != 0 {
            arrivals.add_sample((time as i64 - state.last_tick_time as i64) as f64);
        }
        let mean = arrivals.mean();
        state.tick_period = if mean > 0.0 {
            mean as Time
        } else {
            bpm_to_tick_period(DEFAULT_BPM, MIDI_PPQN)
        };
        state.beat_period = state.tick_period * MIDI_PPQN as u64;
        state.bpm = 60.0 / time::to_secs_f64(state.beat_period);
    }
    upon_tick(inner, time, time);
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::midi::mock::MockMidiSource;
    use crate::platform::mock::MockPlatform;
    use crate::time::{millis, secs};

    const TICK: Time = 20_833_333; // 120 bpm at 24 ppqn

    fn setup() -> (Rc<MockPlatform>, Clock, BeatClock) {
        let platform = Rc::new(MockPlatform::new());
        platform.advance(secs(1));
        let clock = Clock::new(platform.clone());
        let beat_clock = BeatClock::new(clock.clone(), None);
        (platform, clock, beat_clock)
    }

    fn setup_with_midi() -> (Rc<MockPlatform>, Rc<MockMidiSource>, BeatClock) {
        let platform = Rc::new(MockPlatform::new());
        platform.advance(secs(1));
        let clock = Clock::new(platform.clone());
        let midi = Rc::new(MockMidiSource::new());
        let source: Rc<dyn MidiSource> = midi.clone();
        let beat_clock = BeatClock::new(clock, Some(source));
        (platform, midi, beat_clock)
    }

    #[test]
    fn test_ticks_advance_beat_and_resnap_at_beat_boundaries() {
        let (platform, _clock, beat_clock) = setup();
        let infos = Rc::new(RefCell::new(Vec::new()));
        {
            let infos = infos.clone();
            beat_clock.set_on_tick(move |info| infos.borrow_mut().push(info));
        }

        platform.run_until(platform.now() + millis(600));

        let infos = infos.borrow();
        assert!(infos.len() >= 25);
        assert_eq!(infos[0].beat, 0.0);
        assert_eq!(infos[0].beat_phase, 0);
        for (index, info) in infos.iter().take(24).enumerate() {
            assert_eq!(info.beat_phase, index as u32);
        }
        // Re-snapped exactly to the integer at the beat boundary
        assert_eq!(infos[24].beat, 1.0);
        assert_eq!(infos[24].beat_phase, 0);
    }

    #[test]
    fn test_tick_goals_are_drift_free() {
        let (platform, _clock, beat_clock) = setup();
        let start = platform.now();
        let intendeds = Rc::new(RefCell::new(Vec::new()));
        {
            let intendeds = intendeds.clone();
            beat_clock
                .set_on_tick(move |info| intendeds.borrow_mut().push(info.intended));
        }

        platform.run_until(start + millis(500));

        let intendeds = intendeds.borrow();
        assert!(intendeds.len() >= 20);
        for (index, intended) in intendeds.iter().enumerate() {
            assert_eq!(*intended, start + TICK * index as u64);
        }
    }

    #[test]
    fn test_current_beat_is_monotonic_between_ticks() {
        let (platform, _clock, beat_clock) = setup();
        platform.run_until(platform.now() + millis(100));

        let mut previous = beat_clock.current_beat();
        for _ in 0..10 {
            platform.advance(millis(1));
            let beat = beat_clock.current_beat();
            assert!(beat > previous);
            previous = beat;
        }
    }

    #[test]
    fn test_beat_timeout_fires_once() {
        let (platform, _clock, beat_clock) = setup();
        let fires = Rc::new(RefCell::new(Vec::new()));
        {
            let fires = fires.clone();
            beat_clock.set_beat_timeout(1.0, move |info| {
                fires.borrow_mut().push(info);
            });
        }

        platform.run_until(platform.now() + secs(2));

        let fires = fires.borrow();
        assert_eq!(fires.len(), 1);
        assert!(fires[0].now >= fires[0].intended);
        assert_eq!(fires[0].period, 0.0);
    }

    #[test]
    fn test_beat_sync_timeout_fires_just_past_the_boundary() {
        let (platform, _clock, beat_clock) = setup();

        // Run to roughly beat 3.4
        platform.run_until(platform.now() + millis(1700));
        let at_schedule = beat_clock.current_beat();
        assert!(at_schedule > 3.3 && at_schedule < 3.5);

        let fires = Rc::new(RefCell::new(Vec::new()));
        {
            let fires = fires.clone();
            beat_clock.set_beat_sync_timeout(1.0, 0.0, move |info| {
                fires.borrow_mut().push(info);
            });
        }

        platform.run_until(platform.now() + millis(500));

        let fires = fires.borrow();
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].intended, 4.0);
        assert!(fires[0].now >= 4.0);
        assert!(fires[0].now < 4.0 + 1.0 / 24.0);
    }

    #[test]
    fn test_beat_interval_goals_are_drift_free() {
        let (platform, _clock, beat_clock) = setup();
        let fires = Rc::new(RefCell::new(Vec::new()));
        {
            let handle = beat_clock.clone();
            let fires = fires.clone();
            beat_clock.set_beat_interval(0.25, move |info| {
                fires.borrow_mut().push(info.intended);
                if fires.borrow().len() == 12 {
                    handle.clear_beat_interval(info.id);
                }
            });
        }

        platform.run_until(platform.now() + secs(3));

        let fires = fires.borrow();
        assert_eq!(fires.len(), 12);
        for (index, intended) in fires.iter().enumerate() {
            assert_eq!(*intended, fires[0] + index as f64 * 0.25);
        }
    }

    #[test]
    fn test_clear_beat_timeout_prevents_fire() {
        let (platform, _clock, beat_clock) = setup();
        let fired = Rc::new(Cell::new(false));
        let id = {
            let fired = fired.clone();
            beat_clock.set_beat_timeout(0.5, move |_| fired.set(true))
        };
        beat_clock.clear_beat_timeout(id);
        beat_clock.clear_beat_timeout(id);

        platform.run_until(platform.now() + secs(1));
        assert!(!fired.get());
    }

    #[test]
    fn test_set_bpm_retimes_the_next_tick() {
        let (platform, _clock, beat_clock) = setup();
        let intendeds = Rc::new(RefCell::new(Vec::new()));
        {
            let intendeds = intendeds.clone();
            beat_clock
                .set_on_tick(move |info| intendeds.borrow_mut().push(info.intended));
        }

        // Stop just past a tick so the retimed goal is still ahead
        platform.run_until(platform.now() + millis(90));
        beat_clock.set_bpm(240.0);
        let changed_at = intendeds.borrow().len();
        platform.run_until(platform.now() + millis(100));

        let intendeds = intendeds.borrow();
        let fast_tick = bpm_to_tick_period(240.0, 24);
        assert_eq!(beat_clock.bpm(), 240.0);
        // First retimed tick is one new period after the last old one
        assert_eq!(
            intendeds[changed_at],
            intendeds[changed_at - 1] + fast_tick
        );
        for pair in intendeds[changed_at..].windows(2) {
            assert_eq!(pair[1] - pair[0], fast_tick);
        }
    }

    #[test]
    fn test_set_bpm_is_ignored_while_following_midi() {
        let (_platform, _midi, beat_clock) = setup_with_midi();
        beat_clock.set_source(ClockSource::Midi);
        let before = beat_clock.bpm();
        beat_clock.set_bpm(93.0);
        assert_eq!(beat_clock.bpm(), before);
    }

    #[test]
    fn test_set_source_without_midi_stays_internal() {
        let (_platform, _clock, beat_clock) = setup();
        beat_clock.set_source(ClockSource::Midi);
        assert_eq!(beat_clock.source(), ClockSource::Internal);
    }

    #[test]
    fn test_midi_ticks_advance_beat_and_derive_tempo() {
        let (platform, midi, beat_clock) = setup_with_midi();
        beat_clock.set_source(ClockSource::Midi);

        let mut at = platform.now();
        for _ in 0..48 {
            at += TICK;
            platform.run_until(at);
            midi.feed(at, &[MIDI_CLOCK]);
        }

        assert!((beat_clock.current_beat() - 2.0).abs() < 0.05);
        assert!((beat_clock.bpm() - 120.0).abs() < 0.5);
    }

    #[test]
    fn test_non_clock_bytes_do_not_tick() {
        let (platform, midi, beat_clock) = setup_with_midi();
        beat_clock.set_source(ClockSource::Midi);

        let ticks = Rc::new(Cell::new(0));
        {
            let ticks = ticks.clone();
            beat_clock.set_on_tick(move |_| ticks.set(ticks.get() + 1));
        }

        midi.feed(platform.now(), &[0x90, 60, 100]);
        midi.feed(platform.now(), &[0xFA]);
        assert_eq!(ticks.get(), 0);

        midi.feed(platform.now(), &[MIDI_CLOCK]);
        assert_eq!(ticks.get(), 1);
    }

    #[test]
    fn test_source_swap_preserves_the_beat_timeline() {
        let (platform, midi, beat_clock) = setup_with_midi();

        // Run internally to around beat 2.5
        platform.run_until(platform.now() + millis(1250));
        let before_swap = beat_clock.current_beat();
        assert!(before_swap > 2.4 && before_swap < 2.7);

        let fires = Rc::new(RefCell::new(Vec::new()));
        {
            let fires = fires.clone();
            beat_clock.set_beat_timeout_absolute(4.0, move |info| {
                fires.borrow_mut().push(info);
            });
        }

        beat_clock.set_source(ClockSource::Midi);
        let after_swap = beat_clock.current_beat();
        assert!((after_swap - before_swap).abs() < 0.1);

        // Feed a 120 bpm MIDI clock; the pending event still fires at its
        // absolute beat
        let mut at = platform.now();
        for _ in 0..60 {
            at += TICK;
            platform.run_until(at);
            midi.feed(at, &[MIDI_CLOCK]);
        }

        let fires = fires.borrow();
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].intended, 4.0);
        assert!(fires[0].now >= 4.0);
        assert!(fires[0].now < 4.0 + 2.0 / 24.0);
    }

    #[test]
    fn test_midi_clock_passthrough_sends_one_byte_per_tick() {
        let (platform, midi, beat_clock) = setup_with_midi();
        beat_clock.send_midi_clock(true);

        let ticks = Rc::new(Cell::new(0u32));
        {
            let ticks = ticks.clone();
            beat_clock.set_on_tick(move |_| ticks.set(ticks.get() + 1));
        }

        platform.run_until(platform.now() + millis(300));

        let sent = midi.sent.borrow();
        assert!(ticks.get() > 0);
        assert_eq!(sent.len(), ticks.get() as usize);
        assert!(sent.iter().all(|bytes| bytes == &[MIDI_CLOCK]));
    }

    #[test]
    fn test_stop_quiesces_the_wall_clock() {
        let (platform, _clock, beat_clock) = setup();
        beat_clock.set_beat_timeout(10.0, |_| {});
        platform.run_until(platform.now() + millis(100));
        assert!(platform.armed_deadline().is_some());

        beat_clock.stop();
        platform.run_until(platform.now() + millis(100));
        assert!(platform.armed_deadline().is_none());
    }
}
