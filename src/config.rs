//! Crate-wide constants. The precision factors are heuristics that may be
//! tuned per target platform; the factor ordering is a hard requirement.

/// Tempo of a freshly constructed beat clock.
pub const DEFAULT_BPM: f64 = 120.0;

/// Pulses per quarter note of the internal tick generator.
pub const DEFAULT_PPQN: u32 = 24;

/// MIDI realtime clock runs at a fixed 24 pulses per quarter note.
pub const MIDI_PPQN: u32 = 24;

/// MIDI realtime clock byte.
pub const MIDI_CLOCK: u8 = 0xF8;

/// Multiple of the mean wake overshoot subtracted from the next goal when
/// programming the platform's one-shot timer.
pub const SPIN_FACTOR: i64 = 2;

/// The clock proceeds straight to the busy-wait stage when the next event
/// is closer than this multiple of the mean wake overshoot.
pub const EVENT_PROCESSING_FACTOR: i64 = 10;

// The busy-wait stage must begin strictly before the goal time.
const _: () = assert!(EVENT_PROCESSING_FACTOR > SPIN_FACTOR);

/// Window of wake overshoot samples kept by the precision timer.
pub const WAKE_MEAN_WINDOW: usize = 8;

/// Window of inter-arrival samples used to estimate an external MIDI
/// clock's tick period.
pub const MIDI_TICK_MEAN_WINDOW: usize = 32;
