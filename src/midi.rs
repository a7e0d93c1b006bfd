//! MIDI plumbing. The schedulers only see the `MidiSource` capability:
//! raw bytes stamped with a monotonic receive time, delivered on the
//! main-loop thread, plus a send side for the realtime-clock passthrough.
//! `MidiPort` backs it with midir; its input callback runs on midir's
//! thread, so messages are stamped there, queued, and drained on the main
//! thread after a platform wake.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::error::Error;
use std::rc::Rc;
use std::sync::Arc;

use log::{info, warn};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;

use crate::platform::StdPlatform;
use crate::time::Time;

pub type OnMidi = dyn FnMut(Time, &[u8]);

/// Raw-byte MIDI capability. Every inbound message goes to the clock
/// handler first, then the general message handler; both run on the
/// main-loop thread.
pub trait MidiSource {
    fn set_on_clock(&self, callback: Option<Box<OnMidi>>);
    fn set_on_message(&self, callback: Option<Box<OnMidi>>);
    fn send(&self, bytes: &[u8]);
}

/// A handler slot that tolerates being replaced or cleared from inside
/// its own invocation.
struct HandlerSlot {
    callback: RefCell<Option<Box<OnMidi>>>,
    replaced: Cell<bool>,
}

impl HandlerSlot {
    fn new() -> Self {
        Self {
            callback: RefCell::new(None),
            replaced: Cell::new(false),
        }
    }

    fn set(&self, callback: Option<Box<OnMidi>>) {
        *self.callback.borrow_mut() = callback;
        self.replaced.set(true);
    }

    fn dispatch(&self, time: Time, bytes: &[u8]) {
        let taken = self.callback.borrow_mut().take();
        let Some(mut callback) = taken else {
            return;
        };
        self.replaced.set(false);
        callback(time, bytes);
        if !self.replaced.get() {
            *self.callback.borrow_mut() = Some(callback);
        }
    }
}

/// A midir-backed input (and optional output) port.
pub struct MidiPort {
    queue: Arc<Mutex<VecDeque<(Time, Vec<u8>)>>>,
    on_clock: HandlerSlot,
    on_message: HandlerSlot,
    monitoring: Cell<bool>,
    output: RefCell<Option<MidiOutputConnection>>,
    input: RefCell<Option<MidiInputConnection<()>>>,
}

impl MidiPort {
    /// Connects the named input port (and output port, when given) and
    /// registers the main-thread drain with the platform.
    pub fn connect(
        platform: &Rc<StdPlatform>,
        in_port: &str,
        out_port: Option<&str>,
    ) -> Result<Rc<Self>, Box<dyn Error>> {
        let port = Rc::new(Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            on_clock: HandlerSlot::new(),
            on_message: HandlerSlot::new(),
            monitoring: Cell::new(false),
            output: RefCell::new(None),
            input: RefCell::new(None),
        });

        let waker = {
            let weak = Rc::downgrade(&port);
            platform.register_source(Box::new(move || {
                if let Some(port) = weak.upgrade() {
                    port.drain();
                }
            }))
        };

        let mut midi_in = MidiInput::new("tactus in")?;
        midi_in.ignore(Ignore::None);
        let in_ports = midi_in.ports();
        let found = in_ports
            .iter()
            .find(|p| midi_in.port_name(p).unwrap_or_default() == in_port)
            .ok_or_else(|| format!("Unable to find input port: {}", in_port))?;

        let queue = port.queue.clone();
        let time = platform.time_source();
        let connection = midi_in
            .connect(
                found,
                "tactus in",
                move |_stamp, message, _| {
                    queue.lock().push_back((time.now(), message.to_vec()));
                    waker.wake();
                },
                (),
            )
            .map_err(|err| format!("Unable to connect input: {}", err))?;
        *port.input.borrow_mut() = Some(connection);
        info!("Connected MIDI input: {}", in_port);

        if let Some(out_port) = out_port {
            let midi_out = MidiOutput::new("tactus out")?;
            let out_ports = midi_out.ports();
            let found = out_ports
                .iter()
                .find(|p| midi_out.port_name(p).unwrap_or_default() == out_port)
                .ok_or_else(|| format!("Unable to find output port: {}", out_port))?;
            let connection = midi_out
                .connect(found, "tactus out")
                .map_err(|err| format!("Unable to connect output: {}", err))?;
            *port.output.borrow_mut() = Some(connection);
            info!("Connected MIDI output: {}", out_port);
        }

        Ok(port)
    }

    /// Log every inbound message.
    pub fn monitor(&self, state: bool) {
        self.monitoring.set(state);
    }

    fn drain(&self) {
        // The lock is never held across a handler call
        loop {
            let Some((time, bytes)) = self.queue.lock().pop_front() else {
                break;
            };
            if self.monitoring.get() {
                info!("midi in | time: {}, message: {:02X?}", time, bytes);
            }
            self.on_clock.dispatch(time, &bytes);
            self.on_message.dispatch(time, &bytes);
        }
    }
}

impl MidiSource for MidiPort {
    fn set_on_clock(&self, callback: Option<Box<OnMidi>>) {
        self.on_clock.set(callback);
    }

    fn set_on_message(&self, callback: Option<Box<OnMidi>>) {
        self.on_message.set(callback);
    }

    fn send(&self, bytes: &[u8]) {
        match self.output.borrow_mut().as_mut() {
            Some(connection) => {
                if let Err(err) = connection.send(bytes) {
                    warn!("Failed to send MIDI message: {}", err);
                }
            }
            None => {
                crate::logging::warn_once(
                    "Dropping outbound MIDI: no output port connected".to_string(),
                );
            }
        }
    }
}

pub type PortIndexAndName = (usize, String);

pub enum InputsOrOutputs {
    Inputs,
    Outputs,
}

pub fn list_ports(
    inputs_or_outputs: InputsOrOutputs,
) -> Result<Vec<PortIndexAndName>, Box<dyn Error>> {
    match inputs_or_outputs {
        InputsOrOutputs::Inputs => {
            let midi_in = MidiInput::new("tactus ports")?;
            Ok(midi_in
                .ports()
                .iter()
                .enumerate()
                .map(|(index, port)| {
                    (index, midi_in.port_name(port).unwrap_or_default())
                })
                .collect())
        }
        InputsOrOutputs::Outputs => {
            let midi_out = MidiOutput::new("tactus ports")?;
            Ok(midi_out
                .ports()
                .iter()
                .enumerate()
                .map(|(index, port)| {
                    (index, midi_out.port_name(port).unwrap_or_default())
                })
                .collect())
        }
    }
}

pub fn print_ports() -> Result<(), Box<dyn Error>> {
    println!("\nAvailable input ports:");
    for (index, port_name) in list_ports(InputsOrOutputs::Inputs)? {
        println!("    {}: {}", index, port_name);
    }

    println!("\nAvailable output ports:");
    for (index, port_name) in list_ports(InputsOrOutputs::Outputs)? {
        println!("    {}: {}", index, port_name);
    }

    println!();

    Ok(())
}
