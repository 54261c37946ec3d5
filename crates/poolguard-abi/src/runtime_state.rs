//! The single process-wide runtime behind the C entry points.
//!
//! Initialization is an explicit atomic state machine rather than a
//! `OnceLock`: the runtime allocates while initializing, and in an
//! instrumented program that allocation can re-enter an entry point on the
//! same thread. A re-entrant call that sees INITIALIZING gets `None` and
//! passes through unchecked instead of blocking forever.

use std::ffi::{CStr, c_char, c_uint};
use std::path::Path;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use poolguard_membrane::{Reporter, RetentionPolicy, Runtime, RuntimeConfig};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

static RUNTIME_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static RUNTIME_PTR: AtomicPtr<Runtime> = AtomicPtr::new(std::ptr::null_mut());

fn ready() -> Option<&'static Runtime> {
    if RUNTIME_STATE.load(Ordering::Acquire) != STATE_READY {
        return None;
    }
    let ptr = RUNTIME_PTR.load(Ordering::Acquire);
    // SAFETY: once READY, RUNTIME_PTR points at a leaked Runtime that is
    // never freed or replaced.
    Some(unsafe { &*ptr })
}

/// Make `runtime` the process runtime.
///
/// Fails, handing the value back, when a runtime is already installed or
/// being installed.
pub fn install(runtime: Runtime) -> Result<&'static Runtime, Box<Runtime>> {
    if RUNTIME_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return Err(Box::new(runtime));
    }
    let ptr = Box::into_raw(Box::new(runtime));
    RUNTIME_PTR.store(ptr, Ordering::Release);
    RUNTIME_STATE.store(STATE_READY, Ordering::Release);
    // SAFETY: just leaked above; lives for the rest of the process.
    Ok(unsafe { &*ptr })
}

/// The process runtime, created from the environment on first use.
pub fn runtime() -> Option<&'static Runtime> {
    if let Some(rt) = ready() {
        return Some(rt);
    }
    if RUNTIME_STATE.load(Ordering::Acquire) == STATE_INITIALIZING {
        return None;
    }
    match install(runtime_from_config(RuntimeConfig::from_env())) {
        Ok(rt) => Some(rt),
        // Lost the race; the winner may already be done.
        Err(_) => ready(),
    }
}

fn runtime_from_config(config: RuntimeConfig) -> Runtime {
    match Runtime::new(config.clone()) {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("poolguard: cannot open log file: {err}; reporting to stderr");
            let config = RuntimeConfig {
                log_path: None,
                ..config
            };
            let reporter = Reporter::new(
                Box::new(std::io::stderr()),
                config.stop_on_error,
                config.error_budget,
                config.log_format,
            );
            Runtime::with_reporter(config, reporter)
        }
    }
}

/// Initialize the runtime from the program's constructor.
///
/// `dangling` zero drops freed records at once (no use-after-free
/// detection); `terminate` nonzero stops on the first fault. Environment
/// settings fill in everything else. Ignored once a runtime exists.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_init_runtime(dangling: c_uint, terminate: c_uint) {
    let mut config = RuntimeConfig::from_env();
    if dangling == 0 {
        config.retention = RetentionPolicy::Immediate;
    }
    if terminate != 0 {
        config.stop_on_error = true;
    }
    let _ = install(runtime_from_config(config));
}

/// Send subsequent reports to the file `name`, appending.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_init_logfile(name: *const c_char) {
    if name.is_null() {
        return;
    }
    let Some(rt) = runtime() else {
        return;
    };
    // SAFETY: caller passes a NUL-terminated path.
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();
    if let Err(err) = rt.reporter().set_log_file(Path::new(name.as_ref())) {
        eprintln!("poolguard: cannot open log file {name}: {err}");
    }
}

/// Flush the report sink at program exit.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_fini_runtime() {
    if let Some(rt) = ready() {
        rt.reporter().flush();
    }
}
