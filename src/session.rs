//! Trace-session state.
//!
//! This is the surface the interpreter-side module calls into: establish
//! the session (recording the traced command line for the sinks), query its
//! state, and tear it down once. Double initialization and double
//! finalization are contract violations and fail loudly; everything else in
//! the tracer is best-effort.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::utils::env_flag;

pub const COMMAND_LINE_VAR: &str = "OMNITRACE_COMMAND_LINE";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("tracing session is already initialized")]
    AlreadyInitialized,
    #[error("tracing session is already finalized")]
    AlreadyFinalized,
}

/// The traced command line: either a single pre-joined command string or an
/// argv list.
#[derive(Debug, Clone)]
pub enum CommandSpec {
    Command(String),
    Argv(Vec<String>),
}

impl From<&str> for CommandSpec {
    fn from(command: &str) -> CommandSpec {
        CommandSpec::Command(command.to_owned())
    }
}

impl From<String> for CommandSpec {
    fn from(command: String) -> CommandSpec {
        CommandSpec::Command(command)
    }
}

impl From<Vec<String>> for CommandSpec {
    fn from(argv: Vec<String>) -> CommandSpec {
        CommandSpec::Argv(argv)
    }
}

impl From<&[&str]> for CommandSpec {
    fn from(argv: &[&str]) -> CommandSpec {
        CommandSpec::Argv(argv.iter().map(|arg| arg.to_string()).collect())
    }
}

impl CommandSpec {
    fn into_command_line(self) -> String {
        match self {
            CommandSpec::Command(command) => command,
            CommandSpec::Argv(argv) => {
                shlex::try_join(argv.iter().map(String::as_str))
                    .unwrap_or_else(|_| argv.join(" "))
            }
        }
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static FINALIZED: AtomicBool = AtomicBool::new(false);

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

pub fn is_finalized() -> bool {
    FINALIZED.load(Ordering::Acquire)
}

/// Establishes the trace session. The command line becomes observable to
/// the sinks through the environment.
pub fn initialize(command: impl Into<CommandSpec>) -> Result<(), SessionError> {
    if INITIALIZED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(SessionError::AlreadyInitialized);
    }

    init_logging();

    let command_line = command.into().into_command_line();
    std::env::set_var(COMMAND_LINE_VAR, &command_line);
    log::debug!("trace session initialized for {command_line:?}");
    Ok(())
}

/// Ends the trace session. One-shot.
pub fn finalize() -> Result<(), SessionError> {
    if FINALIZED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(SessionError::AlreadyFinalized);
    }
    log::debug!("trace session finalized");
    Ok(())
}

/// The command line recorded at initialization, if any.
pub fn command_line() -> Option<String> {
    std::env::var(COMMAND_LINE_VAR).ok()
}

/// Fallback initialization used when the runtime loads the tracer before
/// any front-end established a session: the traced command line is read
/// from the process itself.
pub(crate) fn initialize_from_process() {
    let argv: Vec<String> = std::fs::read("/proc/self/cmdline")
        .unwrap_or_default()
        .split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    let _ = initialize(CommandSpec::Argv(argv));
}

fn init_logging() {
    let level = match std::env::var("OMNITRACE_VERBOSE")
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(0)
    {
        _ if env_flag("OMNITRACE_DEBUG", false) => "trace",
        i32::MIN..=0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}
