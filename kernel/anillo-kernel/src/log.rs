//! Kernel log sink registry.
//!
//! The lower crates log through the macros in `anillo-core`, which forward
//! to whatever functions are registered. This module owns the sink side: a
//! [`Logger`] fanning formatted output out to dyn [`LogSink`]s. Concrete
//! sinks (serial, framebuffer) are provided by the embedder; the kernel
//! itself defines none.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use anillo_core::log::LogLevel;
use anillo_core::sync::SpinLock;

/// A dyn-compatible output sink.
///
/// Takes `&self`: sinks serialize internally (hardware FIFOs and cursors
/// keep their own locks).
pub trait LogSink: Send + Sync {
    /// Writes a string fragment to this sink.
    fn write_str(&self, s: &str);
    /// Maximum level accepted (`level <= max_level` is written).
    fn max_level(&self) -> LogLevel;
    /// Human-readable name for diagnostics.
    fn name(&self) -> &'static str;
}

static SINKS: SpinLock<Vec<Box<dyn LogSink>>> = SpinLock::new(Vec::new());

/// Registers a sink.
pub fn add_sink(sink: Box<dyn LogSink>) {
    SINKS.lock().push(sink);
}

/// Buffers one formatted record, then fans it out level-filtered.
struct Record {
    level: Option<LogLevel>,
}

impl Record {
    fn emit(&self, args: fmt::Arguments<'_>) {
        let sinks = SINKS.lock();
        for sink in sinks.iter() {
            if let Some(level) = self.level {
                if level > sink.max_level() {
                    continue;
                }
                sink.write_str("[");
                sink.write_str(level.name());
                sink.write_str("] ");
            }
            let mut adapter = SinkAdapter { sink: &**sink };
            let _ = adapter.write_fmt(args);
            if self.level.is_some() {
                sink.write_str("\n");
            }
        }
    }
}

struct SinkAdapter<'a> {
    sink: &'a dyn LogSink,
}

impl fmt::Write for SinkAdapter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.sink.write_str(s);
        Ok(())
    }
}

fn print_to_sinks(args: fmt::Arguments<'_>) {
    Record { level: None }.emit(args);
}

fn log_to_sinks(level: LogLevel, args: fmt::Arguments<'_>) {
    Record { level: Some(level) }.emit(args);
}

/// Wires the sink fan-out into the `anillo-core` logging macros.
///
/// Call once sinks exist; until then, log output is discarded.
pub fn install() {
    // SAFETY: The fan-out functions only take the sink list spin lock and
    // call sink implementations, which must themselves be any-context safe
    // per the LogSink contract.
    unsafe {
        anillo_core::log::set_print_fn(print_to_sinks);
        anillo_core::log::set_log_fn(log_to_sinks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;

    struct Capture {
        lines: &'static Mutex<String>,
        max: LogLevel,
    }

    impl LogSink for Capture {
        fn write_str(&self, s: &str) {
            self.lines.lock().unwrap().push_str(s);
        }
        fn max_level(&self) -> LogLevel {
            self.max
        }
        fn name(&self) -> &'static str {
            "capture"
        }
    }

    static CAPTURED: Mutex<String> = Mutex::new(String::new());

    #[test]
    fn sinks_receive_filtered_output() {
        add_sink(Box::new(Capture {
            lines: &CAPTURED,
            max: LogLevel::Info,
        }));

        log_to_sinks(LogLevel::Info, format_args!("hello {}", 1));
        log_to_sinks(LogLevel::Debug, format_args!("filtered"));
        print_to_sinks(format_args!("raw"));

        let captured = CAPTURED.lock().unwrap();
        assert!(captured.contains("[INFO ] hello 1\n"));
        assert!(!captured.contains("filtered"));
        assert!(captured.contains("raw"));
    }
}
