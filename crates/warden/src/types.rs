use std::fmt;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Lifecycle of the managed program as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
	Unstarted,
	Running { pid: Pid },
	Exited,
}

impl ProcessState {
	pub fn is_running(&self) -> bool {
		matches!(self, ProcessState::Running { .. })
	}

	pub fn pid(&self) -> Option<Pid> {
		match self {
			ProcessState::Running { pid } => Some(*pid),
			_ => None,
		}
	}
}

/// Result of one observed death of the managed program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
	/// Exited with code 0.
	ExitedNormally,
	/// Exited with a non-zero code.
	ExitedWithError(i32),
	KilledBySignal(Signal),
	/// A raw wait status that is neither an exit nor a known signal.
	Unknown(i32),
}

impl TerminationOutcome {
	/// Classifies a raw `waitpid` status.
	pub fn from_raw(pid: Pid, status: i32) -> Self {
		match WaitStatus::from_raw(pid, status) {
			Ok(WaitStatus::Exited(_, 0)) => TerminationOutcome::ExitedNormally,
			Ok(WaitStatus::Exited(_, code)) => TerminationOutcome::ExitedWithError(code),
			Ok(WaitStatus::Signaled(_, signal, _)) => TerminationOutcome::KilledBySignal(signal),
			_ => TerminationOutcome::Unknown(status),
		}
	}

	/// Exit code for normal exits, `None` otherwise.
	pub fn exit_code(&self) -> Option<i32> {
		match self {
			TerminationOutcome::ExitedNormally => Some(0),
			TerminationOutcome::ExitedWithError(code) => Some(*code),
			_ => None,
		}
	}
}

impl fmt::Display for TerminationOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TerminationOutcome::ExitedNormally => write!(f, "exited with code 0"),
			TerminationOutcome::ExitedWithError(code) => write!(f, "exited with code {}", code),
			TerminationOutcome::KilledBySignal(sig) => {
				write!(f, "terminated by signal '{}' ({})", sig, *sig as i32)
			}
			TerminationOutcome::Unknown(status) => write!(f, "terminated with status {}", status),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// Raw statuses in the Linux encoding: exit code in bits 8..16, signal in
	// the low seven bits.
	const fn exited(code: i32) -> i32 {
		code << 8
	}

	#[test]
	fn classifies_exit_codes() {
		let pid = Pid::from_raw(42);
		assert_eq!(TerminationOutcome::from_raw(pid, exited(0)), TerminationOutcome::ExitedNormally);
		assert_eq!(
			TerminationOutcome::from_raw(pid, exited(7)),
			TerminationOutcome::ExitedWithError(7)
		);
	}

	#[test]
	fn classifies_signals() {
		let pid = Pid::from_raw(42);
		assert_eq!(
			TerminationOutcome::from_raw(pid, Signal::SIGSEGV as i32),
			TerminationOutcome::KilledBySignal(Signal::SIGSEGV)
		);
		// core dump flag
		assert_eq!(
			TerminationOutcome::from_raw(pid, Signal::SIGABRT as i32 | 0x80),
			TerminationOutcome::KilledBySignal(Signal::SIGABRT)
		);
	}

	#[test]
	fn exit_code_only_for_normal_exits() {
		assert_eq!(TerminationOutcome::ExitedNormally.exit_code(), Some(0));
		assert_eq!(TerminationOutcome::ExitedWithError(3).exit_code(), Some(3));
		assert_eq!(TerminationOutcome::KilledBySignal(Signal::SIGKILL).exit_code(), None);
		assert_eq!(TerminationOutcome::Unknown(0xffff).exit_code(), None);
	}

	#[test]
	fn state_pid() {
		let pid = Pid::from_raw(7);
		assert_eq!(ProcessState::Running { pid }.pid(), Some(pid));
		assert!(ProcessState::Running { pid }.is_running());
		assert_eq!(ProcessState::Exited.pid(), None);
		assert!(!ProcessState::Unstarted.is_running());
	}
}
