#![cfg_attr(not(test), no_std)]

//! Kernel logger.
//!
//! Implements the [`log::Log`] facade over a console sink the embedding
//! environment registers at boot (the SBI console on bare metal, stderr in
//! the test suite). Records are colored per level and serialized by a lock
//! so concurrent harts do not interleave lines.

use log::{Level, LevelFilter};
use spin::{Mutex, Once};

/// A console sink: receives one formatted record line.
pub type ConsoleSink = fn(core::fmt::Arguments<'_>);

static SINK: Once<ConsoleSink> = Once::new();
static LOG_LOCK: Mutex<()> = Mutex::new(());

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        SINK.get().is_some()
    }

    fn log(&self, record: &log::Record) {
        let Some(sink) = SINK.get() else {
            return;
        };
        let _guard = LOG_LOCK.lock();
        sink(format_args!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m\n",
            level2color(record.level()),
            record.level(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Initializes the logger with the given console sink.
///
/// The log level is taken from the `LOG` environment variable at build
/// time; unset means off. Calling this more than once keeps the first sink.
pub fn init(sink: ConsoleSink) {
    SINK.call_once(|| sink);
    static LOGGER: KernelLogger = KernelLogger;
    log::set_logger(&LOGGER).ok();
    log::set_max_level(match option_env!("LOG") {
        Some("trace") => LevelFilter::Trace,
        Some("debug") => LevelFilter::Debug,
        Some("info") => LevelFilter::Info,
        Some("warn") => LevelFilter::Warn,
        Some("error") => LevelFilter::Error,
        _ => LevelFilter::Off,
    });
}

/// ANSI color code for a log level.
pub fn level2color(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 36,  // Cyan
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}
