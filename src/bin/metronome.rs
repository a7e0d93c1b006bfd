//! End-to-end demo: platform main loop, wall clock, beat clock, and
//! optionally a MIDI port for following or transmitting the realtime
//! clock. Logs every downbeat; raise the filter to `tactus=trace` to see
//! individual ticks.

use std::error::Error;
use std::rc::Rc;

use clap::Parser;

use tactus::prelude::*;

#[derive(Parser)]
#[command(about = "Drive a beat clock and log ticks and downbeats")]
struct Args {
    /// Tempo for the internal clock source
    #[arg(long, default_value_t = 120.0)]
    bpm: f64,

    /// Ticks per beat for the internal clock source
    #[arg(long, default_value_t = 24)]
    ppqn: u32,

    /// MIDI input port to read from
    #[arg(long)]
    midi_in: Option<String>,

    /// MIDI output port for the realtime-clock passthrough
    #[arg(long)]
    midi_out: Option<String>,

    /// Follow the MIDI input's realtime clock instead of the internal one
    #[arg(long)]
    follow: bool,

    /// Transmit 0xF8 on every tick
    #[arg(long)]
    send_clock: bool,

    /// Log every inbound MIDI message
    #[arg(long)]
    monitor: bool,

    /// List MIDI ports and exit
    #[arg(long)]
    list_ports: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logger();
    let args = Args::parse();

    if args.list_ports {
        return print_ports();
    }

    let platform = Rc::new(StdPlatform::new());
    let clock = Clock::new(platform.clone());

    let midi: Option<Rc<dyn MidiSource>> = match &args.midi_in {
        Some(port) => {
            let port = MidiPort::connect(&platform, port, args.midi_out.as_deref())?;
            port.monitor(args.monitor);
            Some(port)
        }
        None => None,
    };

    let beat_clock = BeatClock::new(clock, midi);
    beat_clock.set_ppqn(args.ppqn);
    beat_clock.set_bpm(args.bpm);

    if args.follow {
        beat_clock.set_source(ClockSource::Midi);
    }
    if args.send_clock {
        beat_clock.send_midi_clock(true);
    }

    beat_clock.set_on_tick(|info| {
        trace!(
            "tick | beat: {:.3}, phase: {}, bpm: {:.2}",
            info.beat,
            info.beat_phase,
            info.bpm
        );
    });
    beat_clock.set_beat_sync_interval(1.0, 0.0, 1.0, |info| {
        info!("beat {}", info.intended);
    });

    platform.run();
    Ok(())
}
