//! Error-learning layer between the platform's coarse one-shot timer and
//! the fire times the clock actually wants. The platform is asked to wake
//! slightly early by a learned margin; the remaining gap is closed with a
//! busy-wait.

use crate::config::{EVENT_PROCESSING_FACTOR, SPIN_FACTOR, WAKE_MEAN_WINDOW};
use crate::time::Time;

/// Ring-buffer running mean over the last `N` samples.
#[derive(Clone, Copy, Debug)]
pub struct RunningMean<const N: usize> {
    samples: [f64; N],
    len: usize,
    index: usize,
    avg: f64,
}

impl<const N: usize> RunningMean<N> {
    pub fn new() -> Self {
        Self {
            samples: [0.0; N],
            len: 0,
            index: 0,
            avg: 0.0,
        }
    }

    pub fn add_sample(&mut self, sample: f64) {
        if self.len < N {
            self.samples[self.len] = sample;
            self.len += 1;
            self.avg += (sample - self.avg) / self.len as f64;
        } else {
            let evicted = self.samples[self.index];
            self.samples[self.index] = sample;
            self.avg += (sample - evicted) / N as f64;
        }
        self.index = (self.index + 1) % N;
    }

    pub fn mean(&self) -> f64 {
        self.avg
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.index = 0;
        self.avg = 0.0;
    }
}

impl<const N: usize> Default for RunningMean<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Learns the platform timer's wake overshoot and plans wake-ups so the
/// busy-wait stage begins strictly before each goal.
pub struct PrecisionTimer {
    overshoot: RunningMean<WAKE_MEAN_WINDOW>,
    request_time: Time,
}

impl PrecisionTimer {
    pub fn new() -> Self {
        Self {
            overshoot: RunningMean::new(),
            request_time: 0,
        }
    }

    /// Time to hand the platform's one-shot timer so that, after the usual
    /// overshoot, we wake with a spin margin to spare before `goal`.
    pub fn plan_wake(&mut self, goal: Time) -> Time {
        let margin = self.overshoot.mean() * SPIN_FACTOR as f64;
        let request = (goal as f64 - margin).max(0.0) as Time;
        self.request_time = request;
        request
    }

    /// Whether the event at `next_event_time` is due, or close enough that
    /// waiting for another platform wake would overshoot it.
    pub fn should_process(&self, now: Time, next_event_time: Time) -> bool {
        if next_event_time <= now {
            return true;
        }
        ((next_event_time - now) as f64)
            < self.overshoot.mean() * EVENT_PROCESSING_FACTOR as f64
    }

    /// Records how late (or early) the platform woke us relative to the
    /// last planned request. Call once per wake, before any busy-wait.
    pub fn observe_wake(&mut self, now: Time) {
        self.overshoot
            .add_sample(now as f64 - self.request_time as f64);
    }
}

impl Default for PrecisionTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{micros, millis};

    #[test]
    fn test_running_mean_partial_fill() {
        let mut mean = RunningMean::<4>::new();
        assert_eq!(mean.mean(), 0.0);
        mean.add_sample(10.0);
        assert_eq!(mean.mean(), 10.0);
        mean.add_sample(20.0);
        assert_eq!(mean.mean(), 15.0);
    }

    #[test]
    fn test_running_mean_evicts_oldest() {
        let mut mean = RunningMean::<3>::new();
        mean.add_sample(3.0);
        mean.add_sample(6.0);
        mean.add_sample(9.0);
        assert_eq!(mean.mean(), 6.0);
        // 3.0 falls out of the window
        mean.add_sample(12.0);
        assert_eq!(mean.mean(), 9.0);
    }

    #[test]
    fn test_running_mean_clear() {
        let mut mean = RunningMean::<3>::new();
        mean.add_sample(5.0);
        mean.clear();
        assert_eq!(mean.mean(), 0.0);
        mean.add_sample(1.0);
        assert_eq!(mean.mean(), 1.0);
    }

    #[test]
    fn test_plan_wake_subtracts_learned_margin() {
        let mut timer = PrecisionTimer::new();

        // No samples yet: request the goal itself
        let goal = millis(100);
        assert_eq!(timer.plan_wake(goal), goal);

        // Teach it a steady 500us overshoot
        for _ in 0..WAKE_MEAN_WINDOW {
            let request = timer.plan_wake(goal);
            timer.observe_wake(request + micros(500));
        }
        let request = timer.plan_wake(goal);
        assert_eq!(request, goal - micros(500) * SPIN_FACTOR as u64);
    }

    #[test]
    fn test_should_process_uses_safety_margin() {
        let mut timer = PrecisionTimer::new();
        timer.plan_wake(millis(10));
        timer.observe_wake(millis(10) + micros(100));

        // Already due
        assert!(timer.should_process(millis(20), millis(20)));
        assert!(timer.should_process(millis(20), millis(15)));

        // Within the margin of 100us * EVENT_PROCESSING_FACTOR
        assert!(timer.should_process(millis(20), millis(20) + micros(900)));
        assert!(!timer.should_process(millis(20), millis(20) + micros(1100)));
    }

    #[test]
    fn test_early_wake_pulls_mean_down() {
        let mut timer = PrecisionTimer::new();
        for _ in 0..WAKE_MEAN_WINDOW {
            let request = timer.plan_wake(millis(50));
            timer.observe_wake(request + micros(400));
        }
        for _ in 0..WAKE_MEAN_WINDOW {
            let request = timer.plan_wake(millis(50));
            timer.observe_wake(request);
        }
        assert_eq!(timer.overshoot.mean(), 0.0);
        assert_eq!(timer.plan_wake(millis(50)), millis(50));
    }
}
