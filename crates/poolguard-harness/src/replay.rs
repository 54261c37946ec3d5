//! Trace replay.
//!
//! A trace is a JSON document naming a runtime configuration and a list of
//! pool operations. Replay runs the operations on a fresh [`Runtime`] whose
//! terminator only records the termination, logs one structured entry per
//! operation and stops at the first operation that terminates the run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use poolguard_membrane::config::DEFAULT_ERROR_BUDGET;
use poolguard_membrane::{
    AccessKind, AllocKind, AllocSite, CallSite, CheckMode, LogFormat, MetricsSnapshot, PoolId,
    Provenance, Reporter, RetentionPolicy, Runtime, RuntimeConfig, ViolationRecord,
};

use crate::error::HarnessError;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

// ---------------------------------------------------------------------------
// Trace format
// ---------------------------------------------------------------------------

/// An address written either as a JSON number or as a `0x` hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawAddr")]
pub struct Addr(pub usize);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAddr {
    Number(u64),
    Text(String),
}

impl TryFrom<RawAddr> for Addr {
    type Error = HarnessError;

    fn try_from(raw: RawAddr) -> Result<Self, Self::Error> {
        match raw {
            RawAddr::Number(n) => usize::try_from(n)
                .map(Addr)
                .map_err(|_| HarnessError::InvalidAddress(n.to_string())),
            RawAddr::Text(text) => {
                let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    Some(hex) => usize::from_str_radix(hex, 16).ok(),
                    None => text.parse().ok(),
                };
                parsed.map(Addr).ok_or(HarnessError::InvalidAddress(text))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Global,
    Stack,
    #[default]
    Heap,
    ByVal,
    Custom,
}

impl From<ObjectKind> for AllocKind {
    fn from(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Global => Self::Global,
            ObjectKind::Stack => Self::Stack,
            ObjectKind::Heap => Self::Heap,
            ObjectKind::ByVal => Self::ByVal,
            ObjectKind::Custom => Self::Custom,
        }
    }
}

const fn one() -> usize {
    1
}

/// One replayed operation. Pools are referred to by label.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceOp {
    PoolInit {
        pool: String,
    },
    PoolDestroy {
        pool: String,
    },
    Register {
        pool: String,
        addr: Addr,
        size: usize,
        #[serde(default)]
        kind: ObjectKind,
    },
    RegisterExternal {
        addr: Addr,
        size: usize,
    },
    Unregister {
        pool: String,
        addr: Addr,
    },
    UnregisterStack {
        pool: String,
        addr: Addr,
    },
    Reregister {
        pool: String,
        new_addr: Addr,
        old_addr: Addr,
        size: usize,
    },
    Check {
        pool: String,
        addr: Addr,
        #[serde(default = "one")]
        len: usize,
        #[serde(default)]
        complete: bool,
        #[serde(default)]
        write: bool,
    },
    CheckAlign {
        pool: String,
        addr: Addr,
        element_size: usize,
    },
    CheckArithmetic {
        pool: String,
        source: Addr,
        dest: Addr,
        #[serde(default)]
        complete: bool,
    },
    ExactCheck {
        base: Addr,
        result: Addr,
        size: usize,
    },
    FastLsCheck {
        base: Addr,
        result: Addr,
        size: usize,
        len: usize,
    },
    AllocCall {
        pool: String,
        callee: String,
        #[serde(default)]
        args: Vec<Addr>,
        ret: Addr,
        /// Length reported for the string argument of string allocators.
        #[serde(default)]
        string_len: Option<usize>,
    },
    FreeCall {
        pool: String,
        callee: String,
        #[serde(default)]
        args: Vec<Addr>,
    },
}

impl TraceOp {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PoolInit { .. } => "pool_init",
            Self::PoolDestroy { .. } => "pool_destroy",
            Self::Register { .. } => "register",
            Self::RegisterExternal { .. } => "register_external",
            Self::Unregister { .. } => "unregister",
            Self::UnregisterStack { .. } => "unregister_stack",
            Self::Reregister { .. } => "reregister",
            Self::Check { .. } => "check",
            Self::CheckAlign { .. } => "check_align",
            Self::CheckArithmetic { .. } => "check_arithmetic",
            Self::ExactCheck { .. } => "exact_check",
            Self::FastLsCheck { .. } => "fast_ls_check",
            Self::AllocCall { .. } => "alloc_call",
            Self::FreeCall { .. } => "free_call",
        }
    }

    fn pool_label(&self) -> Option<&str> {
        match self {
            Self::PoolInit { pool }
            | Self::PoolDestroy { pool }
            | Self::Register { pool, .. }
            | Self::Unregister { pool, .. }
            | Self::UnregisterStack { pool, .. }
            | Self::Reregister { pool, .. }
            | Self::Check { pool, .. }
            | Self::CheckAlign { pool, .. }
            | Self::CheckArithmetic { pool, .. }
            | Self::AllocCall { pool, .. }
            | Self::FreeCall { pool, .. } => Some(pool),
            Self::RegisterExternal { .. } | Self::ExactCheck { .. } | Self::FastLsCheck { .. } => None,
        }
    }
}

/// Runtime settings for a replay. Absent fields take the runtime defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TraceConfig {
    #[serde(default)]
    pub error_budget: Option<u32>,
    #[serde(default)]
    pub stop_on_error: bool,
    #[serde(default)]
    pub retain_freed: Option<bool>,
}

impl TraceConfig {
    fn runtime_config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig {
            stop_on_error: self.stop_on_error,
            error_budget: self.error_budget.unwrap_or(DEFAULT_ERROR_BUDGET),
            ..RuntimeConfig::default()
        };
        if self.retain_freed == Some(false) {
            config.retention = RetentionPolicy::Immediate;
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Trace {
    pub name: String,
    #[serde(default)]
    pub config: TraceConfig,
    pub ops: Vec<TraceOp>,
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// A violation observed during replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayViolation {
    pub op_index: usize,
    pub symbol: &'static str,
    pub record: ViolationRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_sha256: Option<String>,
    pub ops_total: usize,
    pub ops_executed: usize,
    pub warnings: u64,
    pub faults: u64,
    pub terminated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<usize>,
    pub violations: Vec<ReplayViolation>,
    pub metrics: MetricsSnapshot,
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

struct Replayer {
    runtime: Runtime,
    pools: HashMap<String, PoolId>,
}

impl Replayer {
    fn pool(&self, index: usize, label: &str) -> Result<PoolId, HarnessError> {
        self.pools
            .get(label)
            .copied()
            .ok_or_else(|| HarnessError::UnknownPool {
                index,
                label: label.to_string(),
            })
    }

    /// Run one operation. The outer error aborts the replay; the inner one
    /// is a reported violation.
    fn apply(
        &mut self,
        index: usize,
        op: &TraceOp,
    ) -> Result<Result<(), ViolationRecord>, HarnessError> {
        let site = Some(AllocSite::tagged(index as u32));
        let rt = &self.runtime;
        let outcome = match op {
            TraceOp::PoolInit { pool } => {
                if self.pools.contains_key(pool) {
                    return Err(HarnessError::DuplicatePool {
                        index,
                        label: pool.clone(),
                    });
                }
                let id = rt.create_pool();
                self.pools.insert(pool.clone(), id);
                Ok(())
            }
            TraceOp::PoolDestroy { pool } => {
                let id = self.pool(index, pool)?;
                self.pools.remove(pool);
                rt.destroy_pool(id);
                Ok(())
            }
            TraceOp::Register {
                pool,
                addr,
                size,
                kind,
            } => {
                rt.register(self.pool(index, pool)?, addr.0, *size, (*kind).into(), site);
                Ok(())
            }
            TraceOp::RegisterExternal { addr, size } => {
                rt.register_external(addr.0, *size, site);
                Ok(())
            }
            TraceOp::Unregister { pool, addr } => {
                rt.unregister(self.pool(index, pool)?, addr.0, site).map(drop)
            }
            TraceOp::UnregisterStack { pool, addr } => {
                rt.unregister_stack(self.pool(index, pool)?, addr.0);
                Ok(())
            }
            TraceOp::Reregister {
                pool,
                new_addr,
                old_addr,
                size,
            } => rt
                .reregister(self.pool(index, pool)?, new_addr.0, old_addr.0, *size, site)
                .map(drop),
            TraceOp::Check {
                pool,
                addr,
                len,
                complete,
                write,
            } => {
                let mode = CheckMode::new(provenance(*complete), access(*write));
                rt.check(self.pool(index, pool)?, addr.0, *len, mode, site)
                    .map(drop)
            }
            TraceOp::CheckAlign {
                pool,
                addr,
                element_size,
            } => rt.check_align(self.pool(index, pool)?, addr.0, *element_size, site),
            TraceOp::CheckArithmetic {
                pool,
                source,
                dest,
                complete,
            } => {
                let mode = CheckMode::new(provenance(*complete), AccessKind::Read);
                rt.check_arithmetic(self.pool(index, pool)?, source.0, dest.0, mode, site)
                    .map(drop)
            }
            TraceOp::ExactCheck { base, result, size } => {
                rt.exact_check(base.0, result.0, *size, site).map(drop)
            }
            TraceOp::FastLsCheck {
                base,
                result,
                size,
                len,
            } => rt.fast_ls_check(base.0, result.0, *size, *len, site),
            TraceOp::AllocCall {
                pool,
                callee,
                args,
                ret,
                string_len,
            } => {
                let args: Vec<usize> = args.iter().map(|a| a.0).collect();
                let call = CallSite::new(callee, &args, ret.0);
                rt.on_allocation(self.pool(index, pool)?, &call, |_| *string_len, site)
                    .map(drop)
            }
            TraceOp::FreeCall { pool, callee, args } => {
                let args: Vec<usize> = args.iter().map(|a| a.0).collect();
                let call = CallSite::new(callee, &args, 0);
                rt.on_deallocation(self.pool(index, pool)?, &call, site)
                    .map(drop)
            }
        };
        Ok(outcome)
    }
}

const fn provenance(complete: bool) -> Provenance {
    if complete {
        Provenance::Complete
    } else {
        Provenance::Incomplete
    }
}

const fn access(write: bool) -> AccessKind {
    if write { AccessKind::Write } else { AccessKind::Read }
}

/// Replay `trace` on a fresh runtime, logging each operation to `log`.
pub fn replay(trace: &Trace, log: &mut LogEmitter) -> Result<ReplaySummary, HarnessError> {
    let config = trace.config.runtime_config();
    let terminated = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&terminated);
    let reporter = Reporter::new(
        Box::new(std::io::sink()),
        config.stop_on_error,
        config.error_budget,
        LogFormat::Text,
    )
    .with_terminator(move |_| flag.store(true, Ordering::SeqCst));

    let mut replayer = Replayer {
        runtime: Runtime::with_reporter(config, reporter),
        pools: HashMap::new(),
    };

    log.emit_entry(
        LogEntry::new(String::new(), LogLevel::Info, "replay_start").with_details(
            serde_json::json!({ "name": trace.name, "ops": trace.ops.len() }),
        ),
    )?;

    let mut violations = Vec::new();
    let mut ops_executed = 0;
    let mut terminated_at = None;

    for (index, op) in trace.ops.iter().enumerate() {
        let result = replayer.apply(index, op)?;
        ops_executed += 1;

        let mut entry = LogEntry::new(String::new(), LogLevel::Info, op.name()).with_op(index);
        if let Some(label) = op.pool_label() {
            entry = entry.with_pool(label);
        }
        let outcome = match result {
            Ok(()) => Outcome::Pass,
            Err(violation) => {
                let outcome = if terminated.load(Ordering::SeqCst) {
                    Outcome::Terminated
                } else if violation.is_warning() {
                    Outcome::Warn
                } else {
                    Outcome::Fault
                };
                entry.level = match outcome {
                    Outcome::Warn => LogLevel::Warn,
                    Outcome::Terminated => LogLevel::Fatal,
                    _ => LogLevel::Error,
                };
                entry = entry.with_violation(violation.kind.symbol(), violation.fault_ptr);
                violations.push(ReplayViolation {
                    op_index: index,
                    symbol: violation.kind.symbol(),
                    record: violation,
                });
                outcome
            }
        };
        log.emit_entry(entry.with_outcome(outcome))?;

        if outcome == Outcome::Terminated {
            terminated_at = Some(index);
            break;
        }
    }

    let reporter = replayer.runtime.reporter();
    let summary = ReplaySummary {
        name: trace.name.clone(),
        trace_sha256: None,
        ops_total: trace.ops.len(),
        ops_executed,
        warnings: reporter.warnings(),
        faults: reporter.faults(),
        terminated: terminated_at.is_some(),
        terminated_at,
        violations,
        metrics: replayer.runtime.metrics(),
    };

    log.emit_entry(
        LogEntry::new(String::new(), LogLevel::Info, "replay_end").with_details(
            serde_json::json!({
                "ops_executed": summary.ops_executed,
                "warnings": summary.warnings,
                "faults": summary.faults,
                "terminated": summary.terminated,
            }),
        ),
    )?;
    log.flush()?;
    Ok(summary)
}

/// Load a trace file and replay it, writing the JSONL log to `log_path`
/// when given.
pub fn replay_file(path: &Path, log_path: Option<&Path>) -> Result<ReplaySummary, HarnessError> {
    let bytes = std::fs::read(path)?;
    let digest = hex_lower(&Sha256::digest(&bytes));
    let trace: Trace = serde_json::from_slice(&bytes)?;

    let run_id = format!("{}-{}", trace.name, &digest[..12]);
    let mut log = match log_path {
        Some(log_path) => LogEmitter::to_file(log_path, &run_id)?,
        None => LogEmitter::sink(&run_id),
    };
    let mut summary = replay(&trace, &mut log)?;
    summary.trace_sha256 = Some(digest);
    Ok(summary)
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
