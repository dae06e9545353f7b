//! Per-thread interpreter trace configuration.
//!
//! The first thread to touch the configuration owns the process-wide
//! master; every other thread clones the master on first access and then
//! works exclusively on its private copy, so cross-thread mutation is never
//! observed mid-trace. The setter surface (exposed to the interpreter as
//! `profiler.config`) writes to the master and to the calling thread's
//! snapshot only.

use std::cell::RefCell;
use std::sync::LazyLock;

use parking_lot::Mutex;
use regex::{Regex, RegexSet};

/// Function names the tracer skips out of the box: interpreter plumbing
/// that would otherwise dominate the region stream. Unlike user-supplied
/// exclusions, matching one of these skips the single event without
/// suppressing the subtree beneath it.
pub const DEFAULT_EXCLUDED_FUNCTIONS: &[&str] = &[
    "^<module>$",
    "^<listcomp>$",
    "^<setcomp>$",
    "^<dictcomp>$",
    "^<genexpr>$",
    "^<lambda>$",
    "^_handle_fromlist$",
    "^_shutdown$",
];

/// An ordered collection of regular expressions. Built-in default patterns
/// sort before user-supplied ones and are reported separately so that the
/// adapter can tell which kind matched.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<String>,
    default_count: usize,
    compiled: Option<RegexSet>,
}

impl PatternSet {
    pub fn empty() -> PatternSet {
        PatternSet::default()
    }

    fn with_defaults(defaults: &[&str]) -> PatternSet {
        let mut set = PatternSet {
            patterns: defaults.iter().map(|p| p.to_string()).collect(),
            default_count: defaults.len(),
            compiled: None,
        };
        set.recompile();
        set
    }

    /// Appends a user pattern. Invalid regexes are reported and dropped.
    pub fn add(&mut self, pattern: &str) {
        if let Err(err) = Regex::new(pattern) {
            log::error!("ignoring invalid filter pattern {pattern:?}: {err}");
            return;
        }
        self.patterns.push(pattern.to_owned());
        self.recompile();
    }

    /// Replaces the user patterns, keeping any built-in defaults.
    pub fn replace(&mut self, patterns: Vec<String>) {
        self.patterns.truncate(self.default_count);
        for pattern in patterns {
            self.add(&pattern);
        }
    }

    /// The user patterns (defaults are not reported back).
    pub fn patterns(&self) -> Vec<String> {
        self.patterns[self.default_count..].to_vec()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, text: &str) -> bool {
        self.compiled.as_ref().is_some_and(|set| set.is_match(text))
    }

    /// True when `text` matches a user pattern (as opposed to only built-in
    /// defaults).
    pub fn matches_user(&self, text: &str) -> bool {
        match &self.compiled {
            Some(set) => set
                .matches(text)
                .iter()
                .any(|index| index >= self.default_count),
            None => false,
        }
    }

    fn recompile(&mut self) {
        self.compiled = if self.patterns.is_empty() {
            None
        } else {
            match RegexSet::new(&self.patterns) {
                Ok(compiled) => Some(compiled),
                Err(err) => {
                    log::error!("failed to compile filter patterns: {err}");
                    None
                }
            }
        };
    }
}

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub trace_c: bool,
    pub include_args: bool,
    pub include_line: bool,
    pub include_filename: bool,
    pub full_filepath: bool,
    pub include_internal: bool,
    /// Non-zero while a filtered subtree is being skipped; balanced by
    /// CALL/RETURN deltas.
    pub ignore_stack_depth: i32,
    pub verbose: i32,
    pub depth_tracker: i32,
    /// Installation prefix of the tracer itself; frames from files under it
    /// are skipped unless `include_internal` is set.
    pub internal_prefix: String,
    pub restrict_functions: PatternSet,
    pub include_functions: PatternSet,
    pub exclude_functions: PatternSet,
    pub restrict_filenames: PatternSet,
    pub include_filenames: PatternSet,
    pub exclude_filenames: PatternSet,
}

impl Default for TraceConfig {
    fn default() -> TraceConfig {
        TraceConfig {
            trace_c: false,
            include_args: false,
            include_line: true,
            include_filename: true,
            full_filepath: false,
            include_internal: false,
            ignore_stack_depth: 0,
            verbose: 0,
            depth_tracker: 0,
            internal_prefix: std::env::var("OMNITRACE_INSTALL_PREFIX").unwrap_or_default(),
            restrict_functions: PatternSet::empty(),
            include_functions: PatternSet::empty(),
            exclude_functions: PatternSet::with_defaults(DEFAULT_EXCLUDED_FUNCTIONS),
            restrict_filenames: PatternSet::empty(),
            include_filenames: PatternSet::empty(),
            exclude_filenames: PatternSet::empty(),
        }
    }
}

static MASTER: LazyLock<Mutex<TraceConfig>> = LazyLock::new(|| Mutex::new(TraceConfig::default()));

thread_local! {
    static LOCAL: RefCell<Option<TraceConfig>> = const { RefCell::new(None) };
}

/// Runs `f` against this thread's private configuration, snapshotting the
/// master on first access.
pub(crate) fn with_thread_config<R>(f: impl FnOnce(&mut TraceConfig) -> R) -> R {
    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        let config = local.get_or_insert_with(|| MASTER.lock().clone());
        f(config)
    })
}

/// Re-snapshots the master into this thread's private configuration.
pub(crate) fn refresh_thread_snapshot() {
    LOCAL.with(|local| {
        *local.borrow_mut() = Some(MASTER.lock().clone());
    });
}

/// Mutates the master and, if this thread already holds a snapshot, brings
/// the snapshot along. Other threads' snapshots are deliberately left
/// untouched.
pub fn update(f: impl FnOnce(&mut TraceConfig)) {
    let snapshot = {
        let mut master = MASTER.lock();
        f(&mut master);
        master.clone()
    };
    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        if local.is_some() {
            *local = Some(snapshot);
        }
    });
}

/// A copy of the master configuration.
pub fn get() -> TraceConfig {
    MASTER.lock().clone()
}

macro_rules! flag_accessors {
    ($($field:ident, $setter:ident;)*) => {
        $(
            pub fn $field() -> bool {
                MASTER.lock().$field
            }

            pub fn $setter(value: bool) {
                update(|config| config.$field = value);
            }
        )*
    };
}

flag_accessors! {
    trace_c, set_trace_c;
    include_args, set_include_args;
    include_line, set_include_line;
    include_filename, set_include_filename;
    full_filepath, set_full_filepath;
    include_internal, set_include_internal;
}

macro_rules! int_accessors {
    ($($field:ident, $setter:ident;)*) => {
        $(
            pub fn $field() -> i32 {
                MASTER.lock().$field
            }

            pub fn $setter(value: i32) {
                update(|config| config.$field = value);
            }
        )*
    };
}

int_accessors! {
    ignore_stack_depth, set_ignore_stack_depth;
    verbose, set_verbose;
    depth_tracker, set_depth_tracker;
}

macro_rules! pattern_accessors {
    ($($field:ident, $adder:ident, $setter:ident;)*) => {
        $(
            pub fn $field() -> Vec<String> {
                MASTER.lock().$field.patterns()
            }

            pub fn $adder(pattern: &str) {
                update(|config| config.$field.add(pattern));
            }

            pub fn $setter(patterns: Vec<String>) {
                update(|config| config.$field.replace(patterns));
            }
        )*
    };
}

pattern_accessors! {
    restrict_functions, add_restrict_function, set_restrict_functions;
    include_functions, add_include_function, set_include_functions;
    exclude_functions, add_exclude_function, set_exclude_functions;
    restrict_filenames, add_restrict_filename, set_restrict_filenames;
    include_filenames, add_include_filename, set_include_filenames;
    exclude_filenames, add_exclude_filename, set_exclude_filenames;
}
