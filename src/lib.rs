//! Omnitrace tracing engine.
//!
//! Attaches to a running application and records timestamped events from
//! three concurrent sources: the embedded interpreter's per-frame trace
//! hook, the host-side API of the accelerator runtime, and the runtime's
//! asynchronous records of completed device operations. Host calls and
//! device activity are joined through the runtime's correlation-id space
//! and a CPU/GPU clock-skew correction, producing one timeline.
//!
//! The engine runs on threads it does not own: application threads for the
//! interpreter hook and the host-API callback, runtime worker threads for
//! the activity callback. It never blocks the traced application, guards
//! every hook against re-entering itself, and defers all sink emission for
//! device activity back to the thread that issued the originating call.
//!
//! The persistent trace writers, the command-line front-end, and process
//! launch live outside this crate; they connect through the [`sink`]
//! traits and the [`session`] API. The accelerator runtime connects
//! through the exported [`OnLoad`]/[`OnUnload`] entry points.

pub mod abi;
mod activity;
mod activity_queue;
mod causal;
pub mod clock;
mod correlation;
mod host_api;
pub mod interp;
mod lifecycle;
mod reentrancy;
pub mod session;
pub mod sink;
pub mod telemetry;
mod utils;

pub use activity::activity_callback;
pub use causal::ChainLink;
pub use correlation::Tid;
pub use host_api::api_callback;
pub use lifecycle::{
    register_hooks, sampling_suppressed, set_traced_operations, OnLoad, OnUnload,
};
pub use session::{
    command_line, finalize, initialize, is_finalized, is_initialized, CommandSpec, SessionError,
};
