//! Correlation registry.
//!
//! The runtime tags each host-API call and each device activity record with
//! the same correlation id. The registry keeps what the activity side needs
//! to attribute a completion back to its originating call: the kernel or
//! operation name, the originating thread, and the call's causal-chain
//! position. The three maps are locked independently so that host threads
//! inserting at ENTER and the runtime worker reading at completion do not
//! contend on a single lock.
//!
//! Entries are never evicted during a session; the runtime's id space is
//! not reused while a trace is running, and dropping entries early would
//! race with out-of-order activity delivery.

use std::sync::LazyLock;

use libc::c_char;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::causal::ChainLink;

/// A name pointer owned by the runtime, stable for the session.
#[derive(Debug, Clone, Copy)]
pub struct RawName(pub *const c_char);

// The runtime guarantees the pointed-to string is immutable and outlives
// the trace session.
unsafe impl Send for RawName {}
unsafe impl Sync for RawName {}

pub type Tid = i32;

static NAMES: LazyLock<Mutex<FxHashMap<u64, RawName>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));
static ORIGINS: LazyLock<Mutex<FxHashMap<u64, Tid>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));
static CHAINS: LazyLock<Mutex<FxHashMap<u64, ChainLink>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));

pub fn record_name(correlation_id: u64, name: RawName) {
    NAMES.lock().insert(correlation_id, name);
}

pub fn name_of(correlation_id: u64) -> Option<RawName> {
    NAMES.lock().get(&correlation_id).copied()
}

pub fn record_origin(correlation_id: u64, tid: Tid) {
    ORIGINS.lock().insert(correlation_id, tid);
}

pub fn origin_of(correlation_id: u64) -> Option<Tid> {
    ORIGINS.lock().get(&correlation_id).copied()
}

pub fn record_chain(correlation_id: u64, link: ChainLink) {
    CHAINS.lock().insert(correlation_id, link);
}

pub fn chain_of(correlation_id: u64) -> Option<ChainLink> {
    CHAINS.lock().get(&correlation_id).copied()
}
