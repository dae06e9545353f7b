//! Synchronous host-API callback.
//!
//! Entered on the traced application's own thread, twice per call of
//! interest. ENTER registers the call in the correlation registry, hands
//! out a causal-chain link, and emits the host-side BEGIN; EXIT emits the
//! END. Both phases drain the thread's deferred activity queue so that
//! device completions are attributed at the earliest call boundary of the
//! issuing thread.

use std::cell::RefCell;
use std::ffi::CStr;
use std::panic::{catch_unwind, AssertUnwindSafe};

use libc::c_void;

use crate::abi::{ApiArgs, ApiCallbackData, ApiId, DOMAIN_HOST_API, PHASE_ENTER, PHASE_EXIT};
use crate::activity_queue;
use crate::causal::{self, ChainLink};
use crate::clock;
use crate::correlation::{self, RawName};
use crate::lifecycle;
use crate::reentrancy;
use crate::sink::{self, HostCallEnd, HostCallEvent};

/// Runtimes at or above this version report the external-memory calls,
/// which are book-keeping noise on the timeline.
const EXTERNAL_MEMORY_MIN_VERSION: u64 = 400;

/// Internal runtime book-keeping whose recording would distort the
/// timeline.
fn is_bookkeeping(id: ApiId, runtime_version: u64) -> bool {
    match id {
        ApiId::PushCallConfiguration
        | ApiId::PopCallConfiguration
        | ApiId::DeviceEnablePeerAccess => true,
        ApiId::ImportExternalMemory | ApiId::DestroyExternalMemory => {
            runtime_version >= EXTERNAL_MEMORY_MIN_VERSION
        }
        _ => false,
    }
}

/// # Safety
///
/// The caller guarantees the union variant matches `id`.
unsafe fn extract_queue(id: Option<ApiId>, args: &ApiArgs) -> u64 {
    match id {
        Some(ApiId::MemcpyAsync) => unsafe { args.memcpy_async.stream as u64 },
        Some(ApiId::MemsetAsync) => unsafe { args.memset_async.stream as u64 },
        Some(ApiId::LaunchKernel) | Some(ApiId::ModuleLaunchKernel) => unsafe {
            args.launch_kernel.stream as u64
        },
        Some(ApiId::StreamSynchronize) => unsafe { args.stream_synchronize.stream as u64 },
        _ => 0,
    }
}

fn api_label(call_id: u32) -> &'static CStr {
    if let Some(table) = lifecycle::api_table() {
        if let Some(op_name) = table.op_name {
            let ptr = unsafe { op_name(DOMAIN_HOST_API, call_id) };
            if !ptr.is_null() {
                // Runtime-owned, stable for the session.
                return unsafe { CStr::from_ptr(ptr) };
            }
        }
    }
    match ApiId::from_raw(call_id) {
        Some(id) => id.fallback_name(),
        None => sink::intern_label(&format!("api_{call_id}")),
    }
}

struct InFlightCall {
    correlation_id: u64,
    begin_ns: u64,
}

thread_local! {
    static CALL_STACK: RefCell<Vec<InFlightCall>> = const { RefCell::new(Vec::new()) };
}

fn on_enter(call_id: u32, data: &ApiCallbackData) {
    let begin_ns = clock::host_timestamp_ns();
    let id = ApiId::from_raw(call_id);
    let queue = unsafe { extract_queue(id, &data.args) };

    if id.is_some_and(ApiId::is_launch) {
        if let Some(table) = lifecycle::api_table() {
            if let Some(kernel_name) = table.kernel_name {
                let func = unsafe { data.args.launch_kernel.func };
                let name = unsafe { kernel_name(func) };
                if !name.is_null() {
                    correlation::record_name(data.correlation_id, RawName(name));
                }
            }
        }
        correlation::record_origin(data.correlation_id, activity_queue::current_tid());
    }

    let chain = causal::begin();
    correlation::record_chain(data.correlation_id, chain);

    sink::begin_host_call(&HostCallEvent {
        name: api_label(call_id),
        correlation_id: data.correlation_id,
        chain,
        queue,
        begin_ns,
    });

    CALL_STACK.with(|stack| {
        stack.borrow_mut().push(InFlightCall {
            correlation_id: data.correlation_id,
            begin_ns,
        });
    });

    activity_queue::drain_current();
}

fn on_exit(data: &ApiCallbackData) {
    // Completions received during the call body are attributed before the
    // enclosing END.
    activity_queue::drain_current();

    let end_ns = clock::host_timestamp_ns();
    // Without a matching enter on this thread no BEGIN was emitted and no
    // chain link was pushed; emitting an END here would unbalance both.
    let Some(call) = CALL_STACK.with(|stack| stack.borrow_mut().pop()) else {
        log::debug!(
            "host-api exit without matching enter for correlation {}",
            data.correlation_id
        );
        return;
    };
    if call.correlation_id != data.correlation_id {
        log::debug!(
            "mismatched host-api exit: expected correlation {} got {}",
            call.correlation_id,
            data.correlation_id
        );
    }

    if end_ns < call.begin_ns {
        log::debug!(
            "dropping inverted host-api pair for correlation {}",
            data.correlation_id
        );
        causal::end();
        return;
    }

    let chain = correlation::chain_of(data.correlation_id).unwrap_or(ChainLink {
        id: 0,
        parent: 0,
        depth: 0,
    });
    sink::end_host_call(&HostCallEnd {
        correlation_id: data.correlation_id,
        chain,
        end_ns,
    });
    causal::end();
}

/// The callback target registered with the runtime's host-API domain.
///
/// # Safety
///
/// `data` must point to an [`ApiCallbackData`] whose union variant matches
/// `call_id`, valid for the duration of the call.
pub unsafe extern "C" fn api_callback(
    domain: u32,
    call_id: u32,
    data: *const c_void,
    _user: *mut c_void,
) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if domain != DOMAIN_HOST_API || data.is_null() {
            return;
        }
        let data = unsafe { &*(data as *const ApiCallbackData) };
        if let Some(id) = ApiId::from_raw(call_id) {
            if is_bookkeeping(id, lifecycle::runtime_version()) {
                return;
            }
        }
        let Some(_guard) = reentrancy::enter_host_api() else {
            return;
        };
        match data.phase {
            PHASE_ENTER => on_enter(call_id, data),
            PHASE_EXIT => on_exit(data),
            other => log::trace!("unexpected host-api phase {other}"),
        }
    }));
    if result.is_err() {
        log::error!("host-api callback panicked; event dropped");
    }
}
