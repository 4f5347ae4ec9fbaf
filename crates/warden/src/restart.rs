use std::time::Duration;

use crate::config::SupervisorConfig;
use crate::signals::is_shutdown_signal;
use crate::types::TerminationOutcome;

/// Restart bookkeeping. Reset only by starting a new supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartState {
	/// Restart attempts made so far.
	pub count: u32,
	/// Seconds to wait before the next attempt.
	pub delay: u32,
	pub delay_limit: u32,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
	restart_on_error: bool,
	restart_on_crash: bool,
	state: RestartState,
}

impl RestartPolicy {
	pub fn new(config: &SupervisorConfig) -> Self {
		Self {
			restart_on_error: config.restart_on_error,
			restart_on_crash: config.restart_on_crash,
			state: RestartState {
				count: 0,
				delay: 0,
				delay_limit: config.delay_limit,
			},
		}
	}

	pub fn should_restart(&self, outcome: &TerminationOutcome, quit: bool) -> bool {
		if quit {
			return false;
		}
		match outcome {
			TerminationOutcome::ExitedNormally => false,
			TerminationOutcome::ExitedWithError(_) => self.restart_on_error,
			TerminationOutcome::KilledBySignal(sig) if is_shutdown_signal(*sig) => false,
			TerminationOutcome::KilledBySignal(_) => self.restart_on_crash,
			// an unrecognized status is more likely our bug than a deliberate stop
			TerminationOutcome::Unknown(_) => true,
		}
	}

	/// Delay to sleep before the upcoming attempt; advances the backoff.
	pub fn next_delay(&mut self) -> Duration {
		let current = self.state.delay;
		let next = if current == 0 { 1 } else { current.saturating_mul(2) };
		self.state.delay = next.min(self.state.delay_limit);
		Duration::from_secs(current.into())
	}

	/// Counts one restart attempt and returns the new total.
	pub fn record_attempt(&mut self) -> u32 {
		self.state.count += 1;
		self.state.count
	}

	pub fn restart_count(&self) -> u32 {
		self.state.count
	}

	pub fn state(&self) -> &RestartState {
		&self.state
	}
}
