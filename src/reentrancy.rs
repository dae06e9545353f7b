//! Per-thread reentrancy guards.
//!
//! Each callback that can indirectly trigger itself (the interpreter hook
//! through argument formatting, the host-API callback through instrumented
//! runtime internals) holds one of these for the duration of its body. The
//! release is tied to drop so that early returns, `?`, and unwinding all
//! clear the flag.

use std::cell::Cell;
use std::thread::LocalKey;

thread_local! {
    static INTERP_ACTIVE: Cell<bool> = const { Cell::new(false) };
    static HOST_API_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

pub struct ReentrancyGuard {
    slot: &'static LocalKey<Cell<bool>>,
}

impl ReentrancyGuard {
    fn enter(slot: &'static LocalKey<Cell<bool>>) -> Option<ReentrancyGuard> {
        if slot.with(|active| active.replace(true)) {
            return None;
        }
        Some(ReentrancyGuard { slot })
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        self.slot.with(|active| active.set(false));
    }
}

/// Returns `None` while the interpreter adapter is already running on this
/// thread.
pub fn enter_interp() -> Option<ReentrancyGuard> {
    ReentrancyGuard::enter(&INTERP_ACTIVE)
}

/// Returns `None` while the host-API callback is already running on this
/// thread.
pub fn enter_host_api() -> Option<ReentrancyGuard> {
    ReentrancyGuard::enter(&HOST_API_ACTIVE)
}
