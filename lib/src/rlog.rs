//! Runtime logging.
//!
//! Events are single lines, attributed to the task that produced them. The
//! runtime core registers a *context probe* at bring-up, so even when
//! several scheduling domains interleave on one sink every line names the
//! task speaking:
//!
//! ```text
//! trace weft[2]: sched -1 ==>> task 2
//! ```
//!
//! Output is delivered through a `LogSink` trait object installed at most
//! once per process (a test harness can install a capture buffer); until
//! then lines fall back to stderr. The level gate is one relaxed atomic
//! read, so a disabled trace call costs only the check and never builds
//! its format arguments.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use std::io::Write;
use std::sync::OnceLock;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    pub fn label(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        }
    }

    fn parse(text: &str) -> Option<Level> {
        match text {
            "error" => Some(Level::Error),
            "warn" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            "trace" => Some(Level::Trace),
            _ => None,
        }
    }
}

/// Destination for formatted log lines.
///
/// A sink receives one complete line per call and appends its own newline;
/// it must not interleave lines from concurrent threads.
pub trait LogSink: Send + Sync {
    fn line(&self, level: Level, line: fmt::Arguments<'_>);
}

struct Stderr;

impl LogSink for Stderr {
    fn line(&self, level: Level, line: fmt::Arguments<'_>) {
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = write!(out, "{} ", level.label());
        let _ = out.write_fmt(line);
        let _ = out.write_all(b"\n");
    }
}

static FALLBACK: Stderr = Stderr;

/// Reports the task the current flow is executing, for line attribution.
/// Threads the runtime does not host report `None`.
pub type ContextProbe = fn() -> Option<i32>;

static SINK: OnceLock<&'static dyn LogSink> = OnceLock::new();
static CONTEXT: OnceLock<ContextProbe> = OnceLock::new();
static GATE: AtomicU8 = AtomicU8::new(Level::Warn as u8);

/// Install the process-wide sink. The first installation wins, so a
/// capture sink set up before the runtime stays in place.
pub fn set_sink(sink: &'static dyn LogSink) {
    let _ = SINK.set(sink);
}

/// Register the task-attribution probe. First registration wins.
pub fn set_context_probe(probe: ContextProbe) {
    let _ = CONTEXT.set(probe);
}

pub fn set_level(level: Level) {
    GATE.store(level as u8, Ordering::Relaxed);
}

pub fn level() -> Level {
    match GATE.load(Ordering::Relaxed) {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

/// Pick up `WEFT_LOG` (`error` | `warn` | `info` | `debug` | `trace`).
/// Unset or unrecognized values leave the gate where it is.
pub fn init_from_env() {
    if let Some(level) = std::env::var("WEFT_LOG")
        .ok()
        .and_then(|v| Level::parse(v.trim()))
    {
        set_level(level);
    }
}

#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 <= GATE.load(Ordering::Relaxed)
}

/// Format and deliver one line. Callers normally go through `rlog!`, which
/// performs the gate check before the arguments are built.
pub fn emit(level: Level, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let sink: &dyn LogSink = SINK.get().copied().unwrap_or(&FALLBACK);
    match CONTEXT.get().and_then(|probe| probe()) {
        Some(pipid) => sink.line(level, format_args!("weft[{pipid}]: {args}")),
        None => sink.line(level, format_args!("weft: {args}")),
    }
}

/// Log one line at the given level: `rlog!(Debug, "task {} exiting", id)`.
#[macro_export]
macro_rules! rlog {
    ($level:ident, $($arg:tt)*) => {
        if $crate::rlog::enabled($crate::rlog::Level::$level) {
            $crate::rlog::emit(
                $crate::rlog::Level::$level,
                ::core::format_args!($($arg)*),
            );
        }
    };
}
