//! Load/unload lifecycle.
//!
//! The accelerator runtime opens the tracer as a tool library and calls the
//! exported `OnLoad`/`OnUnload` entry points. `OnLoad` wires the host-API
//! and activity channels up through the runtime's dispatch table and primes
//! the clock skew; `OnUnload` tears the channels down and performs the
//! final queue drain. Registration failures degrade tracing instead of
//! failing the host application's load.

use std::ffi::CString;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::LazyLock;

use libc::c_char;
use parking_lot::Mutex;

use crate::abi::{ApiTable, DOMAIN_HOST_API, DOMAIN_OPS, OP_COPY};
use crate::activity::activity_callback;
use crate::activity_queue;
use crate::clock;
use crate::host_api::api_callback;
use crate::session;
use crate::telemetry::{self, TelemetryState};
use crate::utils::env_flag;

static API_TABLE: AtomicPtr<ApiTable> = AtomicPtr::new(std::ptr::null_mut());
static RUNTIME_VERSION: AtomicU64 = AtomicU64::new(0);
static SAMPLING_SUPPRESSED: AtomicBool = AtomicBool::new(false);
static UNLOADED: AtomicBool = AtomicBool::new(false);

pub(crate) fn api_table() -> Option<&'static ApiTable> {
    let table = API_TABLE.load(Ordering::Acquire);
    if table.is_null() {
        None
    } else {
        Some(unsafe { &*table })
    }
}

pub(crate) fn runtime_version() -> u64 {
    RUNTIME_VERSION.load(Ordering::Acquire)
}

/// True while tool setup is running. The sampling profiler (an external
/// collaborator) consults this to avoid propagating its timers into
/// threads the runtime spawns during registration.
pub fn sampling_suppressed() -> bool {
    SAMPLING_SUPPRESSED.load(Ordering::Acquire)
}

struct SuppressSampling;

impl SuppressSampling {
    fn new() -> SuppressSampling {
        SAMPLING_SUPPRESSED.store(true, Ordering::Release);
        SuppressSampling
    }
}

impl Drop for SuppressSampling {
    fn drop(&mut self) {
        SAMPLING_SUPPRESSED.store(false, Ordering::Release);
    }
}

pub type HookFn = Box<dyn Fn() -> Result<(), String> + Send + Sync>;

struct Hooks {
    name: String,
    setup: HookFn,
    shutdown: HookFn,
}

static HOOKS: LazyLock<Mutex<Vec<Hooks>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// Registers a named setup/shutdown pair. Re-registering under an existing
/// name replaces the previous pair, so repeated loads do not stack hooks.
pub fn register_hooks(name: &str, setup: HookFn, shutdown: HookFn) {
    let mut hooks = HOOKS.lock();
    if let Some(existing) = hooks.iter_mut().find(|hooks| hooks.name == name) {
        existing.setup = setup;
        existing.shutdown = shutdown;
        return;
    }
    hooks.push(Hooks {
        name: name.to_owned(),
        setup,
        shutdown,
    });
}

#[cfg(test)]
pub(crate) fn hook_count() -> usize {
    HOOKS.lock().len()
}

fn run_setup() {
    for hooks in HOOKS.lock().iter() {
        if let Err(err) = (hooks.setup)() {
            log::warn!("setup for {:?} failed: {err}; tracing degrades", hooks.name);
        }
    }
}

fn run_shutdown() {
    for hooks in HOOKS.lock().iter() {
        if let Err(err) = (hooks.shutdown)() {
            log::warn!("shutdown for {:?} failed: {err}", hooks.name);
        }
    }
}

static TRACED_OPS: LazyLock<Mutex<Option<Vec<String>>>> = LazyLock::new(|| Mutex::new(None));

/// Restricts the host-API channel to an explicit list of operation names.
/// `None` (the default) traces the whole domain.
pub fn set_traced_operations(operations: Option<Vec<String>>) {
    *TRACED_OPS.lock() = operations;
}

fn traced_operations() -> Option<Vec<String>> {
    if let Some(operations) = TRACED_OPS.lock().clone() {
        return Some(operations);
    }
    let from_env = std::env::var("OMNITRACE_TRACE_OPERATIONS").ok()?;
    let operations: Vec<String> = from_env
        .split([',', ' ', ';'])
        .filter(|name| !name.is_empty())
        .map(|name| name.to_owned())
        .collect();
    if operations.is_empty() {
        None
    } else {
        Some(operations)
    }
}

fn hsa_setup(table: &'static ApiTable) -> Result<(), String> {
    match traced_operations() {
        None => {
            let enable = table
                .enable_domain_callback
                .ok_or("runtime has no domain-callback registration")?;
            let status = unsafe { enable(DOMAIN_HOST_API, api_callback, std::ptr::null_mut()) };
            if status != 0 {
                return Err(format!("domain callback registration failed: {status}"));
            }
        }
        Some(operations) => {
            let resolve = table
                .op_code
                .ok_or("runtime has no op-code lookup")?;
            let enable = table
                .enable_op_callback
                .ok_or("runtime has no op-callback registration")?;
            for operation in operations {
                let Ok(name) = CString::new(operation.as_str()) else {
                    continue;
                };
                let mut op = 0u32;
                let status = unsafe { resolve(DOMAIN_HOST_API, name.as_ptr(), &mut op) };
                if status != 0 {
                    log::warn!("unknown operation {operation:?}; not traced");
                    continue;
                }
                let status =
                    unsafe { enable(DOMAIN_HOST_API, op, api_callback, std::ptr::null_mut()) };
                if status != 0 {
                    log::warn!("failed to enable tracing for {operation:?}: {status}");
                }
            }
        }
    }

    let set_target = table
        .set_activity_target
        .ok_or("runtime has no activity-target registration")?;
    let status = unsafe { set_target(activity_callback, std::ptr::null_mut()) };
    if status != 0 {
        return Err(format!("activity target registration failed: {status}"));
    }
    if let Some(set_properties) = table.set_domain_properties {
        unsafe { set_properties(DOMAIN_OPS, std::ptr::null_mut()) };
    }
    if let Some(enable_activity) = table.enable_op_activity {
        let status = unsafe { enable_activity(DOMAIN_OPS, OP_COPY) };
        if status != 0 {
            log::warn!("failed to enable copy-op activity: {status}");
        }
    }
    Ok(())
}

fn hsa_shutdown(table: &'static ApiTable) -> Result<(), String> {
    if let Some(disable) = table.disable_domain_callback {
        unsafe { disable(DOMAIN_HOST_API) };
    }
    if let Some(disable) = table.disable_op_activity {
        unsafe { disable(DOMAIN_OPS, OP_COPY) };
    }
    Ok(())
}

fn on_load(
    table: *const ApiTable,
    runtime_version: u64,
    failed_tool_count: u64,
    failed_tool_names: *const *const c_char,
) -> bool {
    if !env_flag("OMNITRACE_INIT_TOOLING", true) {
        log::debug!("tool initialization disabled; standing down");
        return false;
    }
    let _suppress = SuppressSampling::new();

    if failed_tool_count > 0 && !failed_tool_names.is_null() {
        for index in 0..failed_tool_count as usize {
            let name = unsafe { *failed_tool_names.add(index) };
            if !name.is_null() {
                let name = unsafe { std::ffi::CStr::from_ptr(name) };
                log::warn!("runtime tool failed to load: {}", name.to_string_lossy());
            }
        }
    }

    RUNTIME_VERSION.store(runtime_version, Ordering::Release);
    if table.is_null() {
        log::error!("runtime passed a null dispatch table; tracing disabled");
        return true;
    }
    API_TABLE.store(table as *mut ApiTable, Ordering::Release);
    UNLOADED.store(false, Ordering::Release);

    if !session::is_initialized() {
        session::initialize_from_process();
    }

    let table = unsafe { &*table };
    register_hooks(
        "hsa",
        Box::new(move || hsa_setup(table)),
        Box::new(move || hsa_shutdown(table)),
    );
    clock::prime_skew(table);
    telemetry::set_state(TelemetryState::Active);
    run_setup();
    true
}

fn on_unload() {
    if UNLOADED.swap(true, Ordering::AcqRel) {
        return;
    }
    telemetry::set_state(TelemetryState::Finalized);
    run_shutdown();
    // Completions delivered after application exit are still pending in the
    // per-thread queues.
    activity_queue::drain_all();
    let _ = session::finalize();
}

/// Tool entry point called by the runtime after it has loaded the library.
///
/// # Safety
///
/// `table` must be null or a dispatch table that stays valid until
/// [`OnUnload`]; `failed_tool_names` must be null or point to
/// `failed_tool_count` C strings.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn OnLoad(
    table: *const ApiTable,
    runtime_version: u64,
    failed_tool_count: u64,
    failed_tool_names: *const *const c_char,
) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        on_load(table, runtime_version, failed_tool_count, failed_tool_names)
    }))
    .unwrap_or(false)
}

/// Tool exit point called by the runtime before it unloads the library.
/// Safe to call more than once.
#[allow(non_snake_case)]
#[no_mangle]
pub extern "C" fn OnUnload() {
    let _ = catch_unwind(on_unload);
}
