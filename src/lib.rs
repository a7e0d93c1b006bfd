//! A realtime event-scheduling runtime for musical and control
//! applications: a platform-abstracted monotonic clock drives a
//! wall-clock scheduler ([`clock::Clock`]) and a musical scheduler
//! ([`beat_clock::BeatClock`]) whose tempo comes from an internal
//! generator or an external MIDI clock.

pub mod beat_clock;
pub mod clock;
pub mod config;
pub mod containers;
pub mod logging;
pub mod midi;
pub mod platform;
pub mod precision;
pub mod prelude;
pub mod time;
