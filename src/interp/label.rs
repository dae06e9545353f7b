//! Region label construction and interning.
//!
//! Region push/pop operates on stable C-string pointers, so every label the
//! adapter builds is interned once per thread and reused for the rest of
//! the process. Hot functions hit the interner map instead of allocating.

use std::cell::RefCell;
use std::ffi::CStr;
use std::fmt::Write;

use rustc_hash::FxHashMap;

use super::config::TraceConfig;
use crate::sink::intern_label;
use crate::utils::basename;

pub(crate) fn build_label(
    config: &TraceConfig,
    name: &str,
    args: Option<&str>,
    filename: &str,
    line: u32,
    is_c_call: bool,
) -> String {
    let mut label = String::with_capacity(name.len() + 16);
    if is_c_call {
        label.push('[');
        label.push_str(name);
        label.push(']');
    } else {
        label.push_str(name);
    }
    if let Some(args) = args {
        let _ = write!(label, "({args})");
    }
    if config.include_filename {
        let file = if config.full_filepath {
            filename
        } else {
            basename(filename)
        };
        if config.include_line {
            let _ = write!(label, "[{file}:{line}]");
        } else {
            let _ = write!(label, "[{file}]");
        }
    } else if config.include_line {
        let _ = write!(label, ":{line}");
    }
    label
}

thread_local! {
    static INTERNED: RefCell<FxHashMap<String, &'static CStr>> =
        RefCell::new(FxHashMap::default());
}

/// Per-thread interning front of the process-wide label table.
pub(crate) fn intern(label: String) -> &'static CStr {
    INTERNED.with(|interned| {
        let mut interned = interned.borrow_mut();
        if let Some(existing) = interned.get(&label) {
            return *existing;
        }
        let stable = intern_label(&label);
        interned.insert(label, stable);
        stable
    })
}
