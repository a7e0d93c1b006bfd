//! Colored logger setup plus a de-duplicating warning helper for
//! contract violations that would otherwise spam (a BPM change requested
//! on every tap while an external clock is in charge, for one).

use env_logger::{Builder, Env};
use once_cell::sync::Lazy;
use std::{collections::HashSet, io::Write, sync::Mutex};
use termcolor::{Color, ColorSpec, WriteColor};

pub use log::{debug, error, info, trace, warn};

pub fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("tactus=info"))
        .format(|_buf, record| {
            let buffer_writer =
                termcolor::BufferWriter::stdout(termcolor::ColorChoice::Auto);
            let mut buffer = buffer_writer.buffer();
            let mut spec = ColorSpec::new();

            spec.set_fg(Some(match record.level() {
                log::Level::Trace => Color::Cyan,
                log::Level::Debug => Color::Blue,
                log::Level::Info => Color::Green,
                log::Level::Warn => Color::Yellow,
                log::Level::Error => Color::Red,
            }))
            .set_bold(true);

            buffer.set_color(&spec)?;

            let module_path = record.module_path().unwrap_or("<unknown>");

            write!(buffer, "[{}][{}]", record.level(), module_path)?;

            buffer.reset()?;
            writeln!(buffer, " {}", record.args())?;

            buffer_writer.print(&buffer)?;
            Ok(())
        })
        .init();
}

static WARNED_MESSAGES: Lazy<Mutex<HashSet<String>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

/// Warns the first time each distinct message is seen, then stays quiet.
pub fn warn_once(message: String) {
    let mut set = WARNED_MESSAGES.lock().unwrap();
    if set.insert(message.clone()) {
        warn!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_warn_once_deduplicates() {
        let message = "test_warn_once_deduplicates probe".to_string();
        warn_once(message.clone());
        warn_once(message.clone());
        warn_once(message.clone());
        let set = WARNED_MESSAGES.lock().unwrap();
        assert_eq!(set.iter().filter(|seen| **seen == message).count(), 1);
    }
}
