//! Asynchronous activity callback.
//!
//! The runtime delivers buffers of completed device operations on a worker
//! thread it owns. Each record is joined against the correlation registry,
//! skew-corrected onto the host timeline, and packaged as a closure on the
//! originating thread's queue so the sink writers only ever run on the
//! thread that issued the host call.

use std::cell::{Cell, RefCell};
use std::ffi::CStr;
use std::panic::{catch_unwind, AssertUnwindSafe};

use libc::{c_char, c_void};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use rustc_hash::FxHashMap;

use crate::abi::{ActivityRecord, OpClass, RecordIter, DOMAIN_OPS};
use crate::activity_queue::{self, Tid};
use crate::clock;
use crate::correlation::{self, RawName};
use crate::lifecycle;
use crate::sink::{self, DeviceSpan};

/// Blocks profiling signals for the duration of the callback body so the
/// sampling profiler cannot interrupt the registry and queue updates.
struct BlockedSignals {
    previous: Option<SigSet>,
}

impl BlockedSignals {
    fn new() -> BlockedSignals {
        let mut blocked = SigSet::empty();
        blocked.add(Signal::SIGPROF);
        blocked.add(Signal::SIGALRM);
        let mut previous = SigSet::empty();
        let previous = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))
            .map(|_| previous)
            .ok();
        BlockedSignals { previous }
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
        }
    }
}

thread_local! {
    static WORKER_NAMED: Cell<bool> = const { Cell::new(false) };
    static DEMANGLE_CACHE: RefCell<FxHashMap<usize, &'static CStr>> =
        RefCell::new(FxHashMap::default());
}

fn name_worker_thread() {
    WORKER_NAMED.with(|named| {
        if !named.replace(true) {
            // Visible as the thread's row name in the timeline.
            unsafe {
                libc::prctl(libc::PR_SET_NAME, c"hsa-activity".as_ptr());
            }
        }
    });
}

/// The demangling scheme: try Rust first (it rejects foreign manglings
/// cheaply), then Itanium C++, else keep the raw name.
fn demangle_any(name: &str) -> String {
    if let Ok(symbol) = rustc_demangle::try_demangle(name) {
        return format!("{symbol:#}");
    }
    if name.starts_with('_') {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = symbol.demangle_with_options(&options) {
                return demangled;
            }
        }
    }
    name.to_string()
}

/// Demangles a runtime-owned kernel name, caching by pointer identity. The
/// cache is thread-local; only the runtime worker populates it.
fn demangled_name(raw: RawName) -> Option<&'static CStr> {
    if raw.0.is_null() {
        return None;
    }
    DEMANGLE_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if let Some(existing) = cache.get(&(raw.0 as usize)) {
            return Some(*existing);
        }
        let mangled = unsafe { CStr::from_ptr(raw.0) };
        let demangled = match mangled.to_str() {
            Ok(mangled) => demangle_any(mangled),
            Err(_) => mangled.to_string_lossy().into_owned(),
        };
        let stable = sink::intern_label(&demangled);
        cache.insert(raw.0 as usize, stable);
        Some(stable)
    })
}

fn generic_name(op: OpClass, raw_op: u32) -> &'static CStr {
    if let Some(table) = lifecycle::api_table() {
        if let Some(op_name) = table.op_name {
            let ptr = unsafe { op_name(DOMAIN_OPS, raw_op) };
            if !ptr.is_null() {
                return unsafe { CStr::from_ptr(ptr) };
            }
        }
    }
    op.generic_name()
}

/// Joins one record against the registry. Returns the thread to attribute
/// it to and the finished span, or `None` for records outside the traced
/// domain/op range.
pub(crate) fn resolve_record(record: &ActivityRecord, skew: i64) -> Option<(Tid, DeviceSpan)> {
    if record.domain != DOMAIN_OPS {
        return None;
    }
    let op = OpClass::from_op(record.op)?;

    let begin_ns = clock::correct_device_ns(record.begin_ns, skew);
    let end_ns = clock::correct_device_ns(record.end_ns, skew);

    let stored_name = correlation::name_of(record.correlation_id).and_then(demangled_name);
    let name = match stored_name {
        Some(name) => name,
        None => generic_name(op, record.op),
    };
    let thread = correlation::origin_of(record.correlation_id)
        .unwrap_or_else(activity_queue::current_tid);

    Some((
        thread,
        DeviceSpan {
            name,
            op,
            begin_ns,
            end_ns,
            device_id: record.device_id,
            queue_id: record.queue_id,
            correlation_id: record.correlation_id,
            thread,
        },
    ))
}

/// The callback target registered with the runtime's activity channel.
///
/// # Safety
///
/// `[begin, end)` must be a readable buffer of packed activity records,
/// valid for the duration of the call.
pub unsafe extern "C" fn activity_callback(
    begin: *const c_char,
    end: *const c_char,
    _user: *mut c_void,
) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let _signals = BlockedSignals::new();
        name_worker_thread();
        let skew = clock::skew_ns();
        for record in unsafe { RecordIter::new(begin, end) } {
            let Some((thread, span)) = resolve_record(&record, skew) else {
                continue;
            };
            let stats_name = span.name.to_string_lossy().into_owned();
            activity_queue::queue_for(thread).push(Box::new(move || {
                sink::emit_device_span(&span);
                sink::add_sample(&stats_name, span.end_ns.saturating_sub(span.begin_ns));
            }));
        }
    }));
    if result.is_err() {
        log::error!("activity callback panicked; buffer dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{OP_BARRIER, OP_COPY, OP_DISPATCH};
    use crate::causal::ChainLink;
    use crate::sink::{CollectorSink, CollectorStats, RecordedEvent};
    use serial_test::serial;
    use std::mem::size_of;
    use std::ptr;

    fn record(correlation_id: u64, op: u32, begin_ns: u64, end_ns: u64) -> ActivityRecord {
        ActivityRecord {
            domain: DOMAIN_OPS,
            op,
            kind: 0,
            begin_ns,
            end_ns,
            correlation_id,
            device_id: 0,
            queue_id: 0x10,
            process_id: 0,
        }
    }

    #[test]
    fn known_correlation_uses_stored_name_and_origin() {
        correlation::record_name(6001, RawName(c"foo".as_ptr()));
        correlation::record_origin(6001, 777);
        correlation::record_chain(
            6001,
            ChainLink {
                id: 1,
                parent: 0,
                depth: 0,
            },
        );

        let (thread, span) = resolve_record(&record(6001, OP_DISPATCH, 1000, 2000), -100).unwrap();
        assert_eq!(thread, 777);
        assert_eq!(span.name.to_bytes(), b"foo");
        assert_eq!(span.begin_ns, 900);
        assert_eq!(span.end_ns, 1900);
        assert_eq!(span.queue_id, 0x10);
        assert_eq!(span.op, OpClass::Dispatch);
    }

    #[test]
    fn unknown_correlation_falls_back_to_generic_name() {
        let (thread, span) = resolve_record(&record(999_999, OP_COPY, 10, 20), 0).unwrap();
        assert_eq!(thread, activity_queue::current_tid());
        assert_eq!(span.name.to_bytes(), b"COPY");
    }

    #[test]
    fn out_of_range_records_are_skipped() {
        assert!(resolve_record(&record(6002, OP_BARRIER + 1, 0, 1), 0).is_none());
        let mut foreign = record(6002, OP_DISPATCH, 0, 1);
        foreign.domain = crate::abi::DOMAIN_HOST_API;
        assert!(resolve_record(&foreign, 0).is_none());
    }

    #[test]
    fn demangles_itanium_and_keeps_plain_names() {
        assert_eq!(demangle_any("_Z3foov"), "foo()");
        assert_eq!(demangle_any("plain_kernel"), "plain_kernel");
    }

    #[test]
    fn demangle_cache_is_pointer_keyed() {
        let raw = RawName(c"_Z3barv".as_ptr());
        let first = demangled_name(raw).unwrap();
        let second = demangled_name(raw).unwrap();
        assert!(ptr::eq(first, second));
        assert_eq!(first.to_bytes(), b"bar()");
        assert!(demangled_name(RawName(ptr::null())).is_none());
    }

    #[test]
    #[serial]
    fn callback_defers_emission_to_origin_queue() {
        let collector = CollectorSink::new();
        let stats = CollectorStats::new();
        sink::install_sink(collector.clone());
        sink::install_stats_sink(stats.clone());

        let records = [record(999_998, OP_COPY, 100, 250)];
        let begin = records.as_ptr() as *const c_char;
        let end = unsafe { begin.add(size_of::<ActivityRecord>()) };
        unsafe { activity_callback(begin, end, ptr::null_mut()) };

        // Nothing reaches the sinks until the origin thread drains.
        assert!(collector.events().is_empty());
        activity_queue::drain_current();

        let events = collector.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            RecordedEvent::Span {
                name,
                begin_ns,
                end_ns,
                correlation_id,
                ..
            } => {
                assert_eq!(name, "COPY");
                assert_eq!(*begin_ns, 100);
                assert_eq!(*end_ns, 250);
                assert_eq!(*correlation_id, 999_998);
            }
            other => panic!("expected Span, got {other:?}"),
        }
        assert_eq!(stats.samples(), vec![("COPY".to_string(), 150)]);
        sink::uninstall_all();
    }

    #[test]
    #[serial]
    fn empty_buffer_is_a_no_op() {
        let collector = CollectorSink::new();
        sink::install_sink(collector.clone());
        let records = [record(1, OP_COPY, 0, 1)];
        let begin = records.as_ptr() as *const c_char;
        unsafe { activity_callback(begin, begin, ptr::null_mut()) };
        activity_queue::drain_current();
        assert!(collector.events().is_empty());
        sink::uninstall_all();
    }
}
