//! Interpreter trace adapter.
//!
//! The embedded interpreter invokes [`profiler_function`] once per frame
//! event. Call/return events that survive the configured filters become
//! balanced region push/pop pairs on the calling thread. The adapter runs
//! inside the interpreter's hot path, so it never blocks, never allocates
//! for filtered events, and guards against re-entering itself through
//! argument formatting.

pub mod config;
mod label;

use std::cell::{Cell, RefCell};

use crate::reentrancy;
use crate::session;
use crate::sink;

use self::config::{with_thread_config, TraceConfig};

/// The frame events the adapter reacts to. Anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Call,
    CCall,
    Return,
    CReturn,
}

fn parse_event(event: &str) -> Option<EventKind> {
    Some(match event {
        "call" => EventKind::Call,
        "c_call" => EventKind::CCall,
        "return" => EventKind::Return,
        "c_return" => EventKind::CReturn,
        _ => return None,
    })
}

/// One interpreter frame, as seen by the adapter.
///
/// `format_args` is only consulted when argument capture is enabled; it may
/// call arbitrary interpreter code (user `__repr__` implementations), which
/// can re-enter the adapter. The recursion guard makes that re-entry a
/// no-op.
pub trait Frame {
    fn function_name(&self) -> &str;
    fn filename(&self) -> &str;
    fn line_number(&self) -> u32;

    fn format_args(&self) -> Option<String> {
        None
    }
}

thread_local! {
    static THREAD_TRACING: Cell<bool> = const { Cell::new(false) };
    static POP_STACK: RefCell<Vec<Box<dyn FnOnce()>>> = const { RefCell::new(Vec::new()) };
}

/// Starts tracing interpreter events on the calling thread. Snapshots the
/// master configuration.
pub fn profiler_init() {
    config::refresh_thread_snapshot();
    THREAD_TRACING.with(|tracing| tracing.set(true));
}

/// Stops tracing on the calling thread and closes any regions left open.
pub fn profiler_finalize() {
    THREAD_TRACING.with(|tracing| tracing.set(false));
    let open = POP_STACK.with(|stack| std::mem::take(&mut *stack.borrow_mut()));
    for pop in open.into_iter().rev() {
        pop();
    }
}

/// The per-frame trace hook.
pub fn profiler_function<F: Frame>(frame: &F, event: &str, arg: Option<&str>) {
    let Some(kind) = parse_event(event) else {
        log::trace!("unrecognized interpreter event {event:?}");
        return;
    };
    if !THREAD_TRACING.with(|tracing| tracing.get()) || session::is_finalized() {
        return;
    }
    let Some(_guard) = reentrancy::enter_interp() else {
        return;
    };
    with_thread_config(|config| handle_event(config, frame, kind, arg));
}

fn handle_event<F: Frame>(
    config: &mut TraceConfig,
    frame: &F,
    kind: EventKind,
    arg: Option<&str>,
) {
    let is_c = matches!(kind, EventKind::CCall | EventKind::CReturn);
    if is_c && !config.trace_c {
        return;
    }

    if config.ignore_stack_depth > 0 {
        match kind {
            EventKind::Call => config.ignore_stack_depth += 1,
            EventKind::Return => config.ignore_stack_depth -= 1,
            _ => {}
        }
        return;
    }

    // For C events the interesting name is the callee passed alongside the
    // frame, not the interpreter frame itself.
    let name = if is_c {
        arg.unwrap_or_else(|| frame.function_name())
    } else {
        frame.function_name()
    };
    let filename = frame.filename();

    if !config.restrict_functions.is_empty() && !config.restrict_functions.matches(name) {
        return;
    }

    let force_collect = config.include_functions.matches(name);
    if !force_collect {
        if config.exclude_functions.matches(name) {
            if kind == EventKind::Call && config.exclude_functions.matches_user(name) {
                config.ignore_stack_depth += 1;
            }
            return;
        }
        if !config.include_internal
            && !config.internal_prefix.is_empty()
            && filename.starts_with(&config.internal_prefix)
        {
            return;
        }
        if !config.restrict_filenames.is_empty() && !config.restrict_filenames.matches(filename) {
            return;
        }
        if !config.include_filenames.matches(filename) && config.exclude_filenames.matches(filename)
        {
            return;
        }
    }

    match kind {
        EventKind::Call | EventKind::CCall => {
            let args = if config.include_args {
                frame.format_args()
            } else {
                None
            };
            let built = label::build_label(
                config,
                name,
                args.as_deref(),
                filename,
                frame.line_number(),
                is_c,
            );
            let stable = label::intern(built);
            sink::push_region(stable);
            config.depth_tracker += 1;
            POP_STACK.with(|stack| {
                stack
                    .borrow_mut()
                    .push(Box::new(move || sink::pop_region(stable)));
            });
        }
        EventKind::Return | EventKind::CReturn => {
            let pop = POP_STACK.with(|stack| stack.borrow_mut().pop());
            if let Some(pop) = pop {
                pop();
                config.depth_tracker -= 1;
            }
        }
    }
}
