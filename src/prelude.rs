pub use crate::beat_clock::*;
pub use crate::clock::*;
pub use crate::config::*;
pub use crate::containers::{IdTable, KeyedPriorityQueue};
pub use crate::logging::*;
pub use crate::midi::{
    list_ports, print_ports, InputsOrOutputs, MidiPort, MidiSource, OnMidi,
};
pub use crate::platform::{
    MonotonicTime, Platform, StdPlatform, TimerCallback, Waker,
};
pub use crate::precision::{PrecisionTimer, RunningMean};
pub use crate::time::{self, STime, Time};
