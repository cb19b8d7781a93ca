// SPDX-License-Identifier: MPL-2.0

//! Logging to a boot console.
//!
//! Messages are always printed in their entirety: the console writer is kept
//! behind a spin lock for the duration of each record.

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

use crate::QuirkConfig;

/// A [`log::Log`] implementation writing one line per record to `W`.
pub struct ConsoleLogger<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> ConsoleLogger<W> {
    pub const fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Runs `f` with exclusive access to the console writer.
    pub fn with_writer<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.writer.lock())
    }

    fn write_record(&self, record: &Record) -> fmt::Result {
        let mut writer = self.writer.lock();
        writeln!(
            writer,
            "{:<5} {}: {}",
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl<W: Write + Send> log::Log for ConsoleLogger<W> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // A console that fails to print has nowhere to report it.
        let _ = self.write_record(record);
    }

    fn flush(&self) {}
}

/// Installs `logger` as the global logger at the level requested by
/// `quirks.log_level`, or with logging off if none was given.
///
/// Users should avoid the log macros before this function is called.
pub fn init<W: Write + Send + 'static>(
    logger: &'static ConsoleLogger<W>,
    config: &QuirkConfig,
) -> Result<(), log::SetLoggerError> {
    let level = config.log_level.unwrap_or(LevelFilter::Off);

    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}
