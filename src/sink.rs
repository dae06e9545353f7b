//! Event interface to the trace writers.
//!
//! The persistent writers (timeline and statistical) live outside this
//! crate; the engine only knows these traits. Region labels handed to a
//! sink are interned and stay valid for the rest of the process, which lets
//! writers key on the pointer. Sinks must accept timestamps that are not
//! monotonic across queues; the engine does not reorder.

use std::ffi::CStr;
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::abi::OpClass;
use crate::causal::ChainLink;
use crate::correlation::Tid;
use crate::utils::leak_cstr;

/// Host-API call start, emitted on the calling thread at ENTER.
#[derive(Debug, Clone)]
pub struct HostCallEvent {
    pub name: &'static CStr,
    pub correlation_id: u64,
    pub chain: ChainLink,
    /// Stream handle of the call, or 0 for calls without one.
    pub queue: u64,
    pub begin_ns: u64,
}

/// Host-API call end, emitted on the calling thread at EXIT.
#[derive(Debug, Clone)]
pub struct HostCallEnd {
    pub correlation_id: u64,
    pub chain: ChainLink,
    pub end_ns: u64,
}

/// One completed device operation, already skew-corrected onto the host
/// timeline and attributed to the thread that issued the originating call.
#[derive(Debug, Clone)]
pub struct DeviceSpan {
    pub name: &'static CStr,
    pub op: OpClass,
    pub begin_ns: u64,
    pub end_ns: u64,
    pub device_id: i32,
    pub queue_id: u64,
    /// Flow annotation tying the span back to its host call.
    pub correlation_id: u64,
    pub thread: Tid,
}

pub trait TimelineSink: Send + Sync {
    fn push_region(&self, label: &'static CStr);
    fn pop_region(&self, label: &'static CStr);
    fn begin_host_call(&self, event: &HostCallEvent);
    fn end_host_call(&self, event: &HostCallEnd);
    fn emit_device_span(&self, span: &DeviceSpan);
}

pub trait StatsSink: Send + Sync {
    fn add_sample(&self, name: &str, duration_ns: u64);
}

static TIMELINE_SINKS: RwLock<Vec<Arc<dyn TimelineSink>>> = RwLock::new(Vec::new());
static STATS_SINKS: RwLock<Vec<Arc<dyn StatsSink>>> = RwLock::new(Vec::new());

pub fn install_sink(sink: Arc<dyn TimelineSink>) {
    TIMELINE_SINKS.write().push(sink);
}

pub fn install_stats_sink(sink: Arc<dyn StatsSink>) {
    STATS_SINKS.write().push(sink);
}

/// Removes every installed sink. The trace front-end calls this once the
/// writers have been flushed and torn down.
pub fn uninstall_all() {
    TIMELINE_SINKS.write().clear();
    STATS_SINKS.write().clear();
}

pub(crate) fn push_region(label: &'static CStr) {
    for sink in TIMELINE_SINKS.read().iter() {
        sink.push_region(label);
    }
}

pub(crate) fn pop_region(label: &'static CStr) {
    for sink in TIMELINE_SINKS.read().iter() {
        sink.pop_region(label);
    }
}

pub(crate) fn begin_host_call(event: &HostCallEvent) {
    for sink in TIMELINE_SINKS.read().iter() {
        sink.begin_host_call(event);
    }
}

pub(crate) fn end_host_call(event: &HostCallEnd) {
    for sink in TIMELINE_SINKS.read().iter() {
        sink.end_host_call(event);
    }
}

pub(crate) fn emit_device_span(span: &DeviceSpan) {
    for sink in TIMELINE_SINKS.read().iter() {
        sink.emit_device_span(span);
    }
}

pub(crate) fn add_sample(name: &str, duration_ns: u64) {
    for sink in STATS_SINKS.read().iter() {
        sink.add_sample(name, duration_ns);
    }
}

static INTERNED: LazyLock<Mutex<FxHashMap<String, &'static CStr>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));

/// Interns a label, returning a pointer that is stable for the process.
pub fn intern_label(label: &str) -> &'static CStr {
    let mut interned = INTERNED.lock();
    if let Some(existing) = interned.get(label) {
        return *existing;
    }
    let stable = leak_cstr(label);
    interned.insert(label.to_owned(), stable);
    stable
}

/// In-memory sink recording everything it sees. Used by the test suite and
/// handy when debugging a writer integration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    Push(&'static CStr),
    Pop(&'static CStr),
    Begin {
        name: String,
        correlation_id: u64,
        queue: u64,
        depth: u32,
        begin_ns: u64,
    },
    End {
        correlation_id: u64,
        end_ns: u64,
    },
    Span {
        name: String,
        op: OpClass,
        begin_ns: u64,
        end_ns: u64,
        queue_id: u64,
        correlation_id: u64,
        thread: Tid,
    },
}

#[derive(Default)]
pub struct CollectorSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl CollectorSink {
    pub fn new() -> Arc<CollectorSink> {
        Arc::new(CollectorSink::default())
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TimelineSink for CollectorSink {
    fn push_region(&self, label: &'static CStr) {
        self.events.lock().push(RecordedEvent::Push(label));
    }

    fn pop_region(&self, label: &'static CStr) {
        self.events.lock().push(RecordedEvent::Pop(label));
    }

    fn begin_host_call(&self, event: &HostCallEvent) {
        self.events.lock().push(RecordedEvent::Begin {
            name: event.name.to_string_lossy().into_owned(),
            correlation_id: event.correlation_id,
            queue: event.queue,
            depth: event.chain.depth,
            begin_ns: event.begin_ns,
        });
    }

    fn end_host_call(&self, event: &HostCallEnd) {
        self.events.lock().push(RecordedEvent::End {
            correlation_id: event.correlation_id,
            end_ns: event.end_ns,
        });
    }

    fn emit_device_span(&self, span: &DeviceSpan) {
        self.events.lock().push(RecordedEvent::Span {
            name: span.name.to_string_lossy().into_owned(),
            op: span.op,
            begin_ns: span.begin_ns,
            end_ns: span.end_ns,
            queue_id: span.queue_id,
            correlation_id: span.correlation_id,
            thread: span.thread,
        });
    }
}

#[derive(Default)]
pub struct CollectorStats {
    samples: Mutex<Vec<(String, u64)>>,
}

impl CollectorStats {
    pub fn new() -> Arc<CollectorStats> {
        Arc::new(CollectorStats::default())
    }

    pub fn samples(&self) -> Vec<(String, u64)> {
        self.samples.lock().clone()
    }
}

impl StatsSink for CollectorStats {
    fn add_sample(&self, name: &str, duration_ns: u64) {
        self.samples.lock().push((name.to_owned(), duration_ns));
    }
}
