//! Raw ABI shared with the accelerator runtime.
//!
//! Everything in this module mirrors a fixed layout owned by the runtime:
//! the per-call callback payload, the packed activity-record buffers handed
//! to the asynchronous activity callback, and the dispatch table through
//! which the tracer talks back to the runtime. The tracer never owns any of
//! this memory; pointers stay valid for the duration of the trace session.

use std::mem::size_of;

use libc::{c_char, c_void};

/// Call-site phase carried in [`ApiCallbackData::phase`].
pub const PHASE_ENTER: u32 = 0;
/// See [`PHASE_ENTER`].
pub const PHASE_EXIT: u32 = 1;

/// Domain id for synchronous host-API callbacks.
pub const DOMAIN_HOST_API: u32 = 1;
/// Domain id for asynchronous device-operation records.
pub const DOMAIN_OPS: u32 = 2;

/// Device operation codes, in the order the runtime reports them.
pub const OP_DISPATCH: u32 = 0;
pub const OP_COPY: u32 = 1;
pub const OP_BARRIER: u32 = 2;

/// Host-API call ids the tracer dispatches on.
///
/// The numbering matches the runtime's id space for the subset of calls the
/// tracer cares about; every other id is handled generically.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiId {
    PushCallConfiguration = 1,
    PopCallConfiguration = 2,
    Malloc = 3,
    Free = 4,
    MemcpyAsync = 5,
    MemsetAsync = 6,
    LaunchKernel = 7,
    ModuleLaunchKernel = 8,
    StreamSynchronize = 9,
    DeviceSynchronize = 10,
    DeviceEnablePeerAccess = 11,
    ImportExternalMemory = 12,
    DestroyExternalMemory = 13,
}

impl ApiId {
    pub fn from_raw(raw: u32) -> Option<ApiId> {
        Some(match raw {
            1 => ApiId::PushCallConfiguration,
            2 => ApiId::PopCallConfiguration,
            3 => ApiId::Malloc,
            4 => ApiId::Free,
            5 => ApiId::MemcpyAsync,
            6 => ApiId::MemsetAsync,
            7 => ApiId::LaunchKernel,
            8 => ApiId::ModuleLaunchKernel,
            9 => ApiId::StreamSynchronize,
            10 => ApiId::DeviceSynchronize,
            11 => ApiId::DeviceEnablePeerAccess,
            12 => ApiId::ImportExternalMemory,
            13 => ApiId::DestroyExternalMemory,
            _ => return None,
        })
    }

    /// Name used when the runtime's op-name helper is unavailable.
    pub fn fallback_name(self) -> &'static std::ffi::CStr {
        match self {
            ApiId::PushCallConfiguration => c"PushCallConfiguration",
            ApiId::PopCallConfiguration => c"PopCallConfiguration",
            ApiId::Malloc => c"Malloc",
            ApiId::Free => c"Free",
            ApiId::MemcpyAsync => c"MemcpyAsync",
            ApiId::MemsetAsync => c"MemsetAsync",
            ApiId::LaunchKernel => c"LaunchKernel",
            ApiId::ModuleLaunchKernel => c"ModuleLaunchKernel",
            ApiId::StreamSynchronize => c"StreamSynchronize",
            ApiId::DeviceSynchronize => c"DeviceSynchronize",
            ApiId::DeviceEnablePeerAccess => c"DeviceEnablePeerAccess",
            ApiId::ImportExternalMemory => c"ImportExternalMemory",
            ApiId::DestroyExternalMemory => c"DestroyExternalMemory",
        }
    }

    /// Calls that launch device code and therefore carry a kernel pointer.
    pub fn is_launch(self) -> bool {
        matches!(self, ApiId::LaunchKernel | ApiId::ModuleLaunchKernel)
    }
}

/// Classification of a device activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Dispatch,
    Copy,
    Barrier,
}

impl OpClass {
    pub fn from_op(op: u32) -> Option<OpClass> {
        Some(match op {
            OP_DISPATCH => OpClass::Dispatch,
            OP_COPY => OpClass::Copy,
            OP_BARRIER => OpClass::Barrier,
            _ => return None,
        })
    }

    /// Generic operation name, used when a correlation lookup misses.
    pub fn generic_name(self) -> &'static std::ffi::CStr {
        match self {
            OpClass::Dispatch => c"DISPATCH",
            OpClass::Copy => c"COPY",
            OpClass::Barrier => c"BARRIER",
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MemcpyAsyncArgs {
    pub dst: *mut c_void,
    pub src: *const c_void,
    pub size_bytes: usize,
    pub kind: u32,
    pub stream: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MemsetAsyncArgs {
    pub dst: *mut c_void,
    pub value: i32,
    pub size_bytes: usize,
    pub stream: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct LaunchKernelArgs {
    pub func: *const c_void,
    pub grid_dim: [u32; 3],
    pub block_dim: [u32; 3],
    pub shared_mem_bytes: u32,
    pub stream: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct StreamSynchronizeArgs {
    pub stream: *mut c_void,
}

/// Per-call argument union. Which variant is live is determined by the call
/// id delivered alongside the payload; reading any other variant is
/// undefined.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ApiArgs {
    pub memcpy_async: MemcpyAsyncArgs,
    pub memset_async: MemsetAsyncArgs,
    pub launch_kernel: LaunchKernelArgs,
    pub stream_synchronize: StreamSynchronizeArgs,
    pub raw: [u64; 8],
}

/// Payload of one host-API callback invocation.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ApiCallbackData {
    pub phase: u32,
    pub correlation_id: u64,
    pub args: ApiArgs,
}

/// One completed device operation, as packed into the activity buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ActivityRecord {
    pub domain: u32,
    pub op: u32,
    pub kind: u32,
    pub begin_ns: u64,
    pub end_ns: u64,
    pub correlation_id: u64,
    pub device_id: i32,
    pub queue_id: u64,
    pub process_id: u32,
}

/// Walks a `[begin, end)` buffer of packed [`ActivityRecord`]s.
///
/// The cursor advances by one record per step no matter what the caller does
/// with the yielded record, so skip paths cannot stall the walk. A partial
/// trailing record (or `begin == end`) terminates the iteration.
pub struct RecordIter {
    cur: *const u8,
    end: *const u8,
}

impl RecordIter {
    /// # Safety
    ///
    /// `begin..end` must be a readable buffer for the duration of the
    /// iteration.
    pub unsafe fn new(begin: *const c_char, end: *const c_char) -> RecordIter {
        RecordIter {
            cur: begin as *const u8,
            end: end as *const u8,
        }
    }
}

impl Iterator for RecordIter {
    type Item = ActivityRecord;

    fn next(&mut self) -> Option<ActivityRecord> {
        let size = size_of::<ActivityRecord>();
        if self.cur.is_null() || (self.end as usize).checked_sub(self.cur as usize)? < size {
            return None;
        }
        // The runtime does not guarantee record alignment within the buffer.
        let record = unsafe { (self.cur as *const ActivityRecord).read_unaligned() };
        self.cur = unsafe { self.cur.add(size) };
        Some(record)
    }
}

pub type ApiCallbackFn =
    unsafe extern "C" fn(domain: u32, call_id: u32, data: *const c_void, user: *mut c_void);

pub type ActivityCallbackFn =
    unsafe extern "C" fn(begin: *const c_char, end: *const c_char, user: *mut c_void);

/// Dispatch table supplied by the runtime at load time.
///
/// This is the tracer's entire interface back into the runtime: timestamp
/// queries, name helpers, and callback registration. Every entry is optional
/// so that older runtimes with a shorter table still load; missing entries
/// degrade the corresponding feature rather than failing the load.
#[repr(C)]
pub struct ApiTable {
    /// Device timestamp in nanoseconds. Non-zero return means failure.
    pub get_timestamp_ns: Option<unsafe extern "C" fn(out: *mut u64) -> i32>,
    /// Stable name for (domain, op); may return null.
    pub op_name: Option<unsafe extern "C" fn(domain: u32, op: u32) -> *const c_char>,
    /// Reverse lookup of an op code from its name. Non-zero return means
    /// the name is unknown.
    pub op_code:
        Option<unsafe extern "C" fn(domain: u32, name: *const c_char, out: *mut u32) -> i32>,
    /// Stable (possibly mangled) kernel name for a device function pointer.
    pub kernel_name: Option<unsafe extern "C" fn(func: *const c_void) -> *const c_char>,
    pub enable_domain_callback:
        Option<unsafe extern "C" fn(domain: u32, cb: ApiCallbackFn, user: *mut c_void) -> i32>,
    pub enable_op_callback: Option<
        unsafe extern "C" fn(domain: u32, op: u32, cb: ApiCallbackFn, user: *mut c_void) -> i32,
    >,
    pub disable_domain_callback: Option<unsafe extern "C" fn(domain: u32) -> i32>,
    pub set_activity_target:
        Option<unsafe extern "C" fn(cb: ActivityCallbackFn, user: *mut c_void) -> i32>,
    pub set_domain_properties:
        Option<unsafe extern "C" fn(domain: u32, properties: *mut c_void) -> i32>,
    pub enable_op_activity: Option<unsafe extern "C" fn(domain: u32, op: u32) -> i32>,
    pub disable_op_activity: Option<unsafe extern "C" fn(domain: u32, op: u32) -> i32>,
}
