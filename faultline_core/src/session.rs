use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors reported by a debugger backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session could not be established (debugger missing, remote unreachable, ...).
    #[error("Failed to attach debugger session: {0}")]
    AttachFailed(String),
    /// The debugger could not resolve a breakpoint location.
    #[error("Symbol '{0}' not found")]
    SymbolNotFound(String),
    /// A register, variable or memory range could not be read.
    #[error("Failed to read {access}: {reason}")]
    ReadFailed { access: String, reason: String },
    /// A register, variable or memory range could not be written.
    #[error("Failed to write {access}: {reason}")]
    WriteFailed { access: String, reason: String },
    /// The backend answered with something the adapter did not expect.
    #[error("Debugger protocol error: {0}")]
    Protocol(String),
    /// Talking to the debugger process failed.
    #[error("Debugger I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

/// Everything a backend needs to open a session against the program under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub executable: PathBuf,
    pub debugger: PathBuf,
    /// `host:port` of a remote debug server. Local spawn when `None`.
    pub remote: Option<String>,
    /// The debuggee is a remote board reached through a GDB server rather than a hosted process.
    pub embedded: bool,
    /// Upper bound for establishing the session and for each debugger command.
    pub attach_timeout: Duration,
    /// Width in bytes of a memory target.
    pub word_size: u64,
}

/// A location the debugger can read or write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Access {
    Variable(String),
    Register(String),
    Memory { address: u64, len: usize },
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Variable(name) => write!(f, "variable '{name}'"),
            Access::Register(name) => write!(f, "register '{name}'"),
            Access::Memory { address, len } => write!(f, "{len} bytes at {address:#x}"),
        }
    }
}

/// Why the debuggee stopped, or that it did not stop before the deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    BreakpointHit,
    /// A result-condition breakpoint was hit. Carries the condition's symbol; the debuggee is
    /// still alive and halted there.
    ConditionReached(String),
    Exited(i32),
    /// The process received a fatal signal (`SIGSEGV`, `SIGABRT`, a hard fault, ...).
    Signaled(String),
    DeadlineExceeded,
}

impl StopEvent {
    /// The process is gone after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopEvent::Exited(_) | StopEvent::Signaled(_))
    }
}

/// Handle returned for an inserted breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointHandle {
    pub number: u32,
    pub symbol: String,
}

/// One open debugger session, exclusively owned by a single experiment run.
///
/// Event delivery is modelled as a blocking wait with a deadline, so callers can stay a plain
/// synchronous state machine: each suspension point is one `wait_for_stop` call that resolves
/// on whichever of "the debuggee stopped" and "the deadline passed" comes first.
pub trait DebugSession {
    /// Inserts a breakpoint at `symbol`. Fails with `SymbolNotFound` if it cannot be resolved.
    ///
    /// # Arguments
    /// * `symbol`: Function name or location expression understood by the debugger.
    ///
    /// # Returns
    /// The debugger's breakpoint number and the symbol it was set on.
    fn set_breakpoint(&mut self, symbol: &str) -> Result<BreakpointHandle, SessionError>;

    /// Inserts a breakpoint that ends the run when hit. Hits are reported by `wait_for_stop`
    /// as `ConditionReached(symbol)` instead of `BreakpointHit`.
    fn set_result_condition(&mut self, symbol: &str) -> Result<BreakpointHandle, SessionError>;

    /// Starts the debuggee on the first call and continues it afterwards. Stops that were
    /// reported before this call and did not end the program are discarded.
    fn resume(&mut self) -> Result<(), SessionError>;

    /// Interrupts a running debuggee and blocks until it is halted.
    ///
    /// # Returns
    /// `Ok(None)` when the debuggee is now paused. `Ok(Some(event))` when it terminated
    /// before the interrupt took effect; `event` is then `Exited` or `Signaled`.
    fn pause(&mut self) -> Result<Option<StopEvent>, SessionError>;

    /// Reads the bytes currently stored at `access`. The debuggee must be halted.
    ///
    /// # Arguments
    /// * `access`: The variable, register or memory range to read.
    ///
    /// # Returns
    /// The value in little-endian order, as wide as the variable, register or range.
    fn read_value(&mut self, access: &Access) -> Result<Vec<u8>, SessionError>;

    /// Writes little-endian `bytes` to `access`. The debuggee must be halted.
    ///
    /// # Arguments
    /// * `access`: The variable, register or memory range to overwrite.
    /// * `bytes`: The new value; a variable or register keeps its width.
    fn write_value(&mut self, access: &Access, bytes: &[u8]) -> Result<(), SessionError>;

    /// Blocks until the debuggee stops or `deadline` passes, whichever is first.
    /// A deadline already in the past still reports a stop that is pending. Stops that need no
    /// reaction (an interrupt, a non-fatal signal) are continued past.
    ///
    /// # Arguments
    /// * `deadline`: Latest instant to wait until.
    ///
    /// # Returns
    /// The stop that happened first, or `DeadlineExceeded` when none came in time.
    fn wait_for_stop(&mut self, deadline: Instant) -> Result<StopEvent, SessionError>;

    /// Forcibly terminates the debuggee.
    fn kill(&mut self) -> Result<(), SessionError>;

    /// Releases the session. Called exactly once, as the last call of a run.
    fn detach(&mut self) -> Result<(), SessionError>;
}

/// Opens fresh sessions. Shared read-only across concurrently executing runs.
pub trait SessionFactory: Send + Sync {
    fn attach(&self, descriptor: &SessionDescriptor) -> Result<Box<dyn DebugSession>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_display_names_the_location() {
        assert_eq!(Access::Register("eax".into()).to_string(), "register 'eax'");
        assert_eq!(
            Access::Memory {
                address: 0x7ffd_f000,
                len: 4
            }
            .to_string(),
            "4 bytes at 0x7ffdf000"
        );
    }

    #[test]
    fn only_exit_and_signal_are_terminal() {
        assert!(StopEvent::Exited(0).is_terminal());
        assert!(StopEvent::Signaled("SIGSEGV".into()).is_terminal());
        assert!(!StopEvent::BreakpointHit.is_terminal());
        assert!(!StopEvent::ConditionReached("foo_done".into()).is_terminal());
        assert!(!StopEvent::DeadlineExceeded.is_terminal());
    }

    #[test]
    fn io_errors_convert_to_session_errors() {
        let err: SessionError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(matches!(err, SessionError::Io(msg) if msg.contains("pipe closed")));
    }
}
