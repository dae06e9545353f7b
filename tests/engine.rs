//! End-to-end engine flow against a mock runtime: load, trace a kernel
//! launch, deliver its completion on a worker thread, drain, unload.

use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use libc::{c_char, c_void};

use omnitrace::abi::{
    ActivityCallbackFn, ActivityRecord, ApiArgs, ApiCallbackData, ApiCallbackFn, ApiId, ApiTable,
    LaunchKernelArgs, StreamSynchronizeArgs, DOMAIN_HOST_API, DOMAIN_OPS, OP_COPY, OP_DISPATCH,
    PHASE_ENTER, PHASE_EXIT,
};
use omnitrace::sink::{self, CollectorSink, CollectorStats, RecordedEvent};
use omnitrace::{clock, OnLoad, OnUnload};

static API_CB: Mutex<Option<ApiCallbackFn>> = Mutex::new(None);
static ACTIVITY_CB: Mutex<Option<ActivityCallbackFn>> = Mutex::new(None);
static COPY_ACTIVITY_ENABLES: AtomicUsize = AtomicUsize::new(0);
static DOMAIN_DISABLES: AtomicUsize = AtomicUsize::new(0);

const KERNEL_FUNC: usize = 0xF00;

unsafe extern "C" fn mock_get_timestamp_ns(out: *mut u64) -> i32 {
    // The mock device clock is the host clock, so the reconciled skew
    // should land near zero.
    unsafe { *out = clock::host_timestamp_ns() };
    0
}

unsafe extern "C" fn mock_op_name(domain: u32, op: u32) -> *const c_char {
    if domain != DOMAIN_HOST_API {
        // Force the engine onto its generic fallback names for device ops.
        return ptr::null();
    }
    match ApiId::from_raw(op) {
        Some(ApiId::LaunchKernel) => c"hipLaunchKernel".as_ptr(),
        Some(ApiId::MemcpyAsync) => c"hipMemcpyAsync".as_ptr(),
        Some(ApiId::StreamSynchronize) => c"hipStreamSynchronize".as_ptr(),
        _ => ptr::null(),
    }
}

unsafe extern "C" fn mock_kernel_name(func: *const c_void) -> *const c_char {
    if func as usize == KERNEL_FUNC {
        c"_Z3foov".as_ptr()
    } else {
        ptr::null()
    }
}

unsafe extern "C" fn mock_enable_domain_callback(
    domain: u32,
    cb: ApiCallbackFn,
    _user: *mut c_void,
) -> i32 {
    assert_eq!(domain, DOMAIN_HOST_API);
    *API_CB.lock().unwrap() = Some(cb);
    0
}

unsafe extern "C" fn mock_disable_domain_callback(_domain: u32) -> i32 {
    DOMAIN_DISABLES.fetch_add(1, Ordering::SeqCst);
    0
}

unsafe extern "C" fn mock_set_activity_target(cb: ActivityCallbackFn, _user: *mut c_void) -> i32 {
    *ACTIVITY_CB.lock().unwrap() = Some(cb);
    0
}

unsafe extern "C" fn mock_set_domain_properties(_domain: u32, _properties: *mut c_void) -> i32 {
    0
}

unsafe extern "C" fn mock_enable_op_activity(domain: u32, op: u32) -> i32 {
    assert_eq!((domain, op), (DOMAIN_OPS, OP_COPY));
    COPY_ACTIVITY_ENABLES.fetch_add(1, Ordering::SeqCst);
    0
}

unsafe extern "C" fn mock_disable_op_activity(_domain: u32, _op: u32) -> i32 {
    0
}

static TABLE: ApiTable = ApiTable {
    get_timestamp_ns: Some(mock_get_timestamp_ns),
    op_name: Some(mock_op_name),
    op_code: None,
    kernel_name: Some(mock_kernel_name),
    enable_domain_callback: Some(mock_enable_domain_callback),
    enable_op_callback: None,
    disable_domain_callback: Some(mock_disable_domain_callback),
    set_activity_target: Some(mock_set_activity_target),
    set_domain_properties: Some(mock_set_domain_properties),
    enable_op_activity: Some(mock_enable_op_activity),
    disable_op_activity: Some(mock_disable_op_activity),
};

fn api_cb() -> ApiCallbackFn {
    API_CB.lock().unwrap().expect("host-api callback registered")
}

fn fire_api(call_id: u32, data: &ApiCallbackData) {
    unsafe {
        api_cb()(
            DOMAIN_HOST_API,
            call_id,
            data as *const ApiCallbackData as *const c_void,
            ptr::null_mut(),
        );
    }
}

fn launch_data(phase: u32, correlation_id: u64, stream: u64, func: usize) -> ApiCallbackData {
    ApiCallbackData {
        phase,
        correlation_id,
        args: ApiArgs {
            launch_kernel: LaunchKernelArgs {
                func: func as *const c_void,
                grid_dim: [1, 1, 1],
                block_dim: [64, 1, 1],
                shared_mem_bytes: 0,
                stream: stream as *mut c_void,
            },
        },
    }
}

fn sync_data(phase: u32, correlation_id: u64, stream: u64) -> ApiCallbackData {
    ApiCallbackData {
        phase,
        correlation_id,
        args: ApiArgs {
            stream_synchronize: StreamSynchronizeArgs {
                stream: stream as *mut c_void,
            },
        },
    }
}

fn dispatch_record(correlation_id: u64, begin_ns: u64, end_ns: u64, queue_id: u64) -> ActivityRecord {
    ActivityRecord {
        domain: DOMAIN_OPS,
        op: OP_DISPATCH,
        kind: 0,
        begin_ns,
        end_ns,
        correlation_id,
        device_id: 0,
        queue_id,
        process_id: std::process::id(),
    }
}

fn deliver_on_worker(records: Vec<ActivityRecord>) {
    let activity_cb = ACTIVITY_CB.lock().unwrap().expect("activity callback registered");
    std::thread::spawn(move || {
        let begin = records.as_ptr() as *const c_char;
        let end = unsafe { begin.add(records.len() * size_of::<ActivityRecord>()) };
        unsafe { activity_cb(begin, end, ptr::null_mut()) };
    })
    .join()
    .unwrap();
}

#[test]
fn end_to_end_engine_flow() {
    let collector = CollectorSink::new();
    let stats = CollectorStats::new();
    sink::install_sink(collector.clone());
    sink::install_stats_sink(stats.clone());

    let loaded = unsafe { OnLoad(&TABLE, 450, 0, ptr::null()) };
    assert!(loaded);
    assert!(API_CB.lock().unwrap().is_some());
    assert!(ACTIVITY_CB.lock().unwrap().is_some());
    assert_eq!(COPY_ACTIVITY_ENABLES.load(Ordering::SeqCst), 1);
    assert!(omnitrace::is_initialized());

    // The mock device clock is the host clock; the reconciled skew must be
    // bounded by sampling noise.
    let skew = clock::skew_ns();
    assert!(skew.abs() < 50_000_000, "skew = {skew}");

    // Book-keeping calls never reach the sinks. Runtime version 450 is
    // recent enough to filter the external-memory pair as well.
    fire_api(ApiId::PushCallConfiguration as u32, &sync_data(PHASE_ENTER, 40, 0));
    fire_api(ApiId::PushCallConfiguration as u32, &sync_data(PHASE_EXIT, 40, 0));
    fire_api(ApiId::ImportExternalMemory as u32, &sync_data(PHASE_ENTER, 41, 0));
    fire_api(ApiId::ImportExternalMemory as u32, &sync_data(PHASE_EXIT, 41, 0));
    assert!(collector.events().is_empty());

    // Launch kernel foo with correlation id 42 on stream 0x10.
    fire_api(
        ApiId::LaunchKernel as u32,
        &launch_data(PHASE_ENTER, 42, 0x10, KERNEL_FUNC),
    );
    fire_api(
        ApiId::LaunchKernel as u32,
        &launch_data(PHASE_EXIT, 42, 0x10, KERNEL_FUNC),
    );

    // Its completion arrives on a runtime worker thread...
    let kernel_begin = 1_000_000_000u64;
    let kernel_end = kernel_begin + 1000;
    deliver_on_worker(vec![dispatch_record(42, kernel_begin, kernel_end, 0x10)]);
    // ...and is not visible until the issuing thread reaches its next
    // host-call boundary.
    assert_eq!(collector.events().len(), 2);
    fire_api(ApiId::StreamSynchronize as u32, &sync_data(PHASE_ENTER, 43, 0x10));
    fire_api(ApiId::StreamSynchronize as u32, &sync_data(PHASE_EXIT, 43, 0x10));

    let events = collector.events();
    let main_tid = nix::unistd::gettid().as_raw();

    match &events[0] {
        RecordedEvent::Begin {
            name,
            correlation_id,
            queue,
            depth,
            begin_ns,
        } => {
            assert_eq!(name, "hipLaunchKernel");
            assert_eq!(*correlation_id, 42);
            assert_eq!(*queue, 0x10);
            assert_eq!(*depth, 0);
            let end_ns = events.iter().find_map(|event| match event {
                RecordedEvent::End {
                    correlation_id: 42,
                    end_ns,
                } => Some(*end_ns),
                _ => None,
            });
            assert!(end_ns.unwrap() >= *begin_ns);
        }
        other => panic!("expected launch Begin, got {other:?}"),
    }

    let span = events
        .iter()
        .find_map(|event| match event {
            RecordedEvent::Span {
                name,
                begin_ns,
                end_ns,
                queue_id,
                correlation_id,
                thread,
                ..
            } if *correlation_id == 42 => {
                Some((name.clone(), *begin_ns, *end_ns, *queue_id, *thread))
            }
            _ => None,
        })
        .expect("kernel completion span");
    assert_eq!(span.0, "foo()");
    assert_eq!(span.1, clock::correct_device_ns(kernel_begin, skew));
    assert_eq!(span.2, clock::correct_device_ns(kernel_end, skew));
    assert_eq!(span.3, 0x10);
    assert_eq!(span.4, main_tid);

    // The span is drained at the boundary of the synchronize call, after
    // its own BEGIN.
    let sync_begin_index = events
        .iter()
        .position(|event| {
            matches!(event, RecordedEvent::Begin { correlation_id: 43, .. })
        })
        .unwrap();
    let span_index = events
        .iter()
        .position(|event| matches!(event, RecordedEvent::Span { .. }))
        .unwrap();
    assert!(span_index > sync_begin_index);

    assert_eq!(stats.samples(), vec![("foo()".to_string(), 1000)]);

    // A completion the registry has never seen: generic name, attributed
    // to the delivering thread, flushed by the final drain at unload.
    collector.clear();
    let mut copy = dispatch_record(999, 5000, 5400, 0x20);
    copy.op = OP_COPY;
    deliver_on_worker(vec![copy]);
    assert!(collector.events().is_empty());

    OnUnload();
    let events = collector.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        RecordedEvent::Span {
            name,
            correlation_id,
            thread,
            ..
        } => {
            assert_eq!(name, "COPY");
            assert_eq!(*correlation_id, 999);
            assert_ne!(*thread, main_tid);
        }
        other => panic!("expected fallback Span, got {other:?}"),
    }
    assert_eq!(DOMAIN_DISABLES.load(Ordering::SeqCst), 1);
    assert!(omnitrace::is_finalized());

    // A second unload is a no-op.
    OnUnload();
    assert_eq!(DOMAIN_DISABLES.load(Ordering::SeqCst), 1);
    assert_eq!(collector.events().len(), 1);

    sink::uninstall_all();
}
