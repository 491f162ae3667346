//! `log` backend for the boot image: every record goes to COM1.

use core::fmt::Write;

use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

use crate::SERIAL;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let (level_str, msg_color) = level_style(record.level());
        // A trap taken while COM1 is locked would spin forever on it.
        x86_64::instructions::interrupts::without_interrupts(|| {
            let _ = writeln!(
                SERIAL.lock(),
                "[{}] {}{}\x1b[0m",
                level_str,
                msg_color,
                record.args()
            );
        });
    }

    fn flush(&self) {}
}

fn level_style(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::Error => ("\x1b[31mERROR\x1b[0m", "\x1b[31m"),
        Level::Warn => ("\x1b[33mWARN\x1b[0m", "\x1b[33m"),
        Level::Info => ("\x1b[32mINFO\x1b[0m", "\x1b[37m"),
        Level::Debug => ("\x1b[90mDEBUG\x1b[0m", "\x1b[90m"),
        Level::Trace => ("\x1b[90mTRACE\x1b[0m", "\x1b[90m"),
    }
}

/// Install the serial logger with `level` as the maximum.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    SERIAL.lock().init();
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
