//! Violation reporter: formats records to the log sink and enforces the
//! termination policy.
//!
//! States: Collecting -> Terminated. Warnings are logged and never count.
//! Each fault is logged, then either terminates at once (stop-on-error) or
//! draws one unit from the error budget; the fault that takes the budget to
//! zero terminates.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::{LogFormat, RuntimeConfig};
use crate::violation::ViolationRecord;

const STATE_COLLECTING: u8 = 0;
const STATE_TERMINATED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterState {
    Collecting,
    Terminated,
}

/// What the caller should do after a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Continue,
    /// The terminator has been invoked. With the default terminator the
    /// process is already gone; a test terminator returns here.
    Terminate,
}

/// Action taken on entering the Terminated state.
pub type Terminator = Box<dyn Fn(&ViolationRecord) + Send + Sync>;

fn abort_process(_: &ViolationRecord) {
    std::process::abort();
}

pub struct Reporter {
    state: AtomicU8,
    stop_on_error: bool,
    budget: u32,
    remaining: AtomicU32,
    format: LogFormat,
    sink: Mutex<Box<dyn Write + Send>>,
    terminator: Terminator,
    warnings: AtomicU64,
    faults: AtomicU64,
}

impl Reporter {
    /// Reporter writing to `sink`.
    #[must_use]
    pub fn new(sink: Box<dyn Write + Send>, stop_on_error: bool, budget: u32, format: LogFormat) -> Self {
        let budget = budget.max(1);
        Self {
            state: AtomicU8::new(STATE_COLLECTING),
            stop_on_error,
            budget,
            remaining: AtomicU32::new(budget),
            format,
            sink: Mutex::new(sink),
            terminator: Box::new(abort_process),
            warnings: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    /// Reporter configured from `cfg`: the configured log file, else stderr.
    pub fn from_config(cfg: &RuntimeConfig) -> io::Result<Self> {
        let sink: Box<dyn Write + Send> = match &cfg.log_path {
            Some(path) => open_log(path)?,
            None => Box::new(io::stderr()),
        };
        Ok(Self::new(sink, cfg.stop_on_error, cfg.error_budget, cfg.log_format))
    }

    /// Replace the action taken on termination.
    #[must_use]
    pub fn with_terminator(mut self, terminator: impl Fn(&ViolationRecord) + Send + Sync + 'static) -> Self {
        self.terminator = Box::new(terminator);
        self
    }

    /// Redirect subsequent reports.
    pub fn set_sink(&self, sink: Box<dyn Write + Send>) {
        let mut guard = self.sink.lock();
        let _ = guard.flush();
        *guard = sink;
    }

    /// Redirect subsequent reports to a file, appending.
    pub fn set_log_file(&self, path: &Path) -> io::Result<()> {
        self.set_sink(open_log(path)?);
        Ok(())
    }

    pub fn report(&self, violation: &ViolationRecord) -> ReportOutcome {
        self.write(violation);

        if violation.is_warning() {
            self.warnings.fetch_add(1, Ordering::Relaxed);
            return ReportOutcome::Continue;
        }
        self.faults.fetch_add(1, Ordering::Relaxed);

        let exhausted = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map_or(true, |before| before <= 1);

        if self.stop_on_error || exhausted {
            self.state.store(STATE_TERMINATED, Ordering::Release);
            (self.terminator)(violation);
            return ReportOutcome::Terminate;
        }
        ReportOutcome::Continue
    }

    pub fn flush(&self) {
        let _ = self.sink.lock().flush();
    }

    fn write(&self, violation: &ViolationRecord) {
        let mut sink = self.sink.lock();
        // A failing sink must not stop the policy from running.
        let _ = match self.format {
            LogFormat::Text => write!(sink, "{violation}"),
            LogFormat::Jsonl => match serde_json::to_string(violation) {
                Ok(line) => writeln!(sink, "{line}"),
                Err(err) => writeln!(sink, "{{\"error\":\"{err}\"}}"),
            },
        };
        let _ = sink.flush();
    }

    #[must_use]
    pub fn state(&self) -> ReporterState {
        match self.state.load(Ordering::Acquire) {
            STATE_COLLECTING => ReporterState::Collecting,
            _ => ReporterState::Terminated,
        }
    }

    #[must_use]
    pub const fn budget(&self) -> u32 {
        self.budget
    }

    #[must_use]
    pub fn remaining_budget(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn stop_on_error(&self) -> bool {
        self.stop_on_error
    }

    #[must_use]
    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

fn open_log(path: &Path) -> io::Result<Box<dyn Write + Send>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(io::LineWriter::new(file)))
}

/// In-memory sink whose contents stay readable after being handed to a
/// [`Reporter`].
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: std::sync::Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }

    #[must_use]
    pub fn boxed(&self) -> Box<dyn Write + Send> {
        Box::new(self.clone())
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
