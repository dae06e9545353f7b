//! CPU/GPU clock reconciliation.
//!
//! Device activity records carry timestamps from the accelerator runtime's
//! clock. To place them on the host timeline we estimate a signed offset
//! such that `host_ns ≈ device_ns + skew`, by bracketing a device timestamp
//! query between two host timestamps and averaging over several rounds.
//! The offset is computed once at load time and read lock-free afterwards.

use std::sync::atomic::{fence, Ordering};
use std::sync::OnceLock;

use nix::time::{clock_gettime, ClockId};

use crate::abi::ApiTable;
use crate::utils::env_flag;

const SKEW_ROUNDS: u32 = 10;

static SKEW_NS: OnceLock<i64> = OnceLock::new();

/// Host wall-clock timestamp in nanoseconds.
pub fn host_timestamp_ns() -> u64 {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC).unwrap();
    now.tv_sec() as u64 * 1_000_000_000 + now.tv_nsec() as u64
}

fn device_timestamp_ns(table: &ApiTable) -> Option<u64> {
    let query = table.get_timestamp_ns?;
    let mut out = 0u64;
    let status = unsafe { query(&mut out) };
    if status != 0 {
        return None;
    }
    Some(out)
}

fn compute_skew(table: &ApiTable) -> i64 {
    if !env_flag("OMNITRACE_USE_ROCTRACER_CLOCK_SKEW", true) {
        return 0;
    }
    let mut total: i128 = 0;
    for _ in 0..SKEW_ROUNDS {
        fence(Ordering::SeqCst);
        let host_before = host_timestamp_ns();
        fence(Ordering::SeqCst);
        let device = match device_timestamp_ns(table) {
            Some(device) => device,
            None => {
                log::warn!("device timestamp query failed; timestamps will not be skew-corrected");
                return 0;
            }
        };
        fence(Ordering::SeqCst);
        let host_after = host_timestamp_ns();
        fence(Ordering::SeqCst);
        let host_mid = (host_before as i128 + host_after as i128) / 2;
        total += host_mid - device as i128;
    }
    (total / SKEW_ROUNDS as i128) as i64
}

/// Computes and caches the skew. Subsequent calls return the cached value.
pub fn prime_skew(table: &ApiTable) -> i64 {
    *SKEW_NS.get_or_init(|| {
        let skew = compute_skew(table);
        log::debug!("clock skew: {skew} ns");
        skew
    })
}

/// Cached skew, or 0 when it has not been (or could not be) computed.
pub fn skew_ns() -> i64 {
    SKEW_NS.get().copied().unwrap_or(0)
}

/// Applies the skew to a device timestamp, clamping at zero.
pub fn correct_device_ns(device_ns: u64, skew: i64) -> u64 {
    if skew >= 0 {
        device_ns.saturating_add(skew as u64)
    } else {
        device_ns.saturating_sub(skew.unsigned_abs())
    }
}
