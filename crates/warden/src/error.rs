use std::fmt;

/// Errors raised by the supervision engine.
///
/// `Tracking` is the only variant the engine treats as recoverable: it is
/// logged and supervision continues with memory-only tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// Configuration rejected before anything was spawned.
	Config(String),
	/// fork/exec of the managed program failed.
	Spawn(String),
	/// User/group lookup or a credential syscall failed in the spawned child.
	Privilege(String),
	/// Tracking-group directory or membership file could not be used.
	Tracking(String),
	/// The blocking wait on the managed program failed.
	Wait(String),
	/// Signal handlers could not be installed.
	Signal(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Config(e) => write!(f, "invalid configuration: {}", e),
			Error::Spawn(e) => write!(f, "spawn failed: {}", e),
			Error::Privilege(e) => write!(f, "privilege drop failed: {}", e),
			Error::Tracking(e) => write!(f, "process tracking: {}", e),
			Error::Wait(e) => write!(f, "wait failed: {}", e),
			Error::Signal(e) => write!(f, "signal setup failed: {}", e),
		}
	}
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
