// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Stderr logger for the layer.
//!
//! The layer lives inside somebody else's process, so it never assumes a logger has been
//! installed. [`init`] installs [`StderrLogger`] unless the host application already set one,
//! in which case the layer's records simply flow into the host's logger.

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::{io::Write, sync::Once};

/// Environment variable selecting the maximum level (`error`, `warn`, `info`, `debug` or
/// `trace`).
pub const LOG_LEVEL_ENV: &str = "WSI_LAYER_LOG";

static INIT: Once = Once::new();

/// Writes records to stderr, prefixed with a timestamp and a one-letter level.
pub struct StderrLogger {
    level: LevelFilter,
}

impl StderrLogger {
    #[inline]
    pub const fn new(level: LevelFilter) -> Self {
        Self { level }
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format_line(record);
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

// `HH:MM:SS.mmm L [wsi-layer] target: message`
fn format_line(record: &Record<'_>) -> String {
    let level_char = match record.level() {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    };

    format!(
        "{} {} [wsi-layer] {}: {}\n",
        Local::now().format("%H:%M:%S%.3f"),
        level_char,
        record.target(),
        record.args(),
    )
}

/// Parses a level name. Unknown names yield `None`.
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Installs the stderr logger once per process.
///
/// Calling this more than once, or after the host installed its own logger, does nothing.
pub fn init() {
    INIT.call_once(|| {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|value| parse_level(&value))
            .unwrap_or(LevelFilter::Warn);

        if log::set_boxed_logger(Box::new(StderrLogger::new(level))).is_ok() {
            log::set_max_level(level);
        }
    });
}
