//! Monotonic time in nanoseconds since an arbitrary epoch. All scheduling
//! math happens on these plain integers; `std::time::Duration` only appears
//! at the platform boundary.

/// Absolute monotonic time or a non-negative duration, in nanoseconds.
pub type Time = u64;

/// Signed time difference, in nanoseconds.
pub type STime = i64;

pub const fn secs(s: u64) -> Time {
    s * 1_000_000_000
}

pub const fn millis(ms: u64) -> Time {
    ms * 1_000_000
}

pub const fn micros(us: u64) -> Time {
    us * 1_000
}

pub fn secs_f64(s: f64) -> Time {
    (s * 1_000_000_000.0) as Time
}

pub fn to_secs_f64(time: Time) -> f64 {
    time as f64 / 1_000_000_000.0
}

pub fn to_millis_f64(time: Time) -> f64 {
    time as f64 / 1_000_000.0
}
