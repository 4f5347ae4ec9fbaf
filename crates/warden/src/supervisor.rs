use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::process::ManagedProcess;
use crate::restart::RestartPolicy;
use crate::signals::Routing;
use crate::tracker::ProcessGroupTracker;
use crate::types::TerminationOutcome;

/// Exit status for signal/unknown terminations and startup failures.
pub const EXIT_FAILURE: i32 = 1;

const QUIT_POLL: Duration = Duration::from_millis(100);

/// The supervision loop: wait, classify, resume or restart, repeat.
pub struct Supervisor {
	process: ManagedProcess,
	policy: RestartPolicy,
	routing: Arc<Routing>,
}

impl Supervisor {
	pub fn new(config: &SupervisorConfig) -> Result<Self> {
		config.validate()?;
		let routing = Routing::new();
		let tracker = ProcessGroupTracker::create(&config.tracking_root, &config.program);
		let process = ManagedProcess::new(config, tracker, Arc::clone(&routing))?;

		Ok(Self {
			process,
			policy: RestartPolicy::new(config),
			routing,
		})
	}

	/// Handle shared with the signal router; also lets callers request quit.
	pub fn routing(&self) -> Arc<Routing> {
		Arc::clone(&self.routing)
	}

	pub fn process(&self) -> &ManagedProcess {
		&self.process
	}

	pub fn restart_count(&self) -> u32 {
		self.policy.restart_count()
	}

	/// Supervises until no further restart is allowed and returns the exit code.
	pub fn run(&mut self) -> i32 {
		match self.supervise() {
			Ok(code) => code,
			Err(e) => {
				tracing::error!("{}", e);
				EXIT_FAILURE
			}
		}
	}

	fn supervise(&mut self) -> Result<i32> {
		self.process.start()?;

		loop {
			let pid = self.process.pid();
			let outcome = self.process.wait()?;
			let pid = pid.map(|p| p.as_raw()).unwrap_or(0);

			let exit_code = match outcome {
				TerminationOutcome::ExitedNormally | TerminationOutcome::ExitedWithError(_) => {
					let code = outcome.exit_code().unwrap_or(EXIT_FAILURE);
					tracing::info!("program PID {} terminated normally with exit code {}", pid, code);

					if self.process.resume() {
						tracing::info!(
							"reattaching to child PID {}.",
							self.process.pid().map(|p| p.as_raw()).unwrap_or(0)
						);
						continue;
					}
					if code != 0 {
						tracing::info!("exit code {} is an error", code);
					}
					code
				}
				TerminationOutcome::KilledBySignal(_) => {
					tracing::info!("child {} {}", pid, outcome);
					EXIT_FAILURE
				}
				TerminationOutcome::Unknown(_) => {
					tracing::error!("child {} {} (neither normally nor abnormally)", pid, outcome);
					EXIT_FAILURE
				}
			};

			if self.restart(&outcome)? {
				continue;
			}

			tracing::info!("shutting down supervisor with application exit code {}", exit_code);
			return Ok(exit_code);
		}
	}

	/// Applies the policy and, when allowed, backs off and respawns.
	fn restart(&mut self, outcome: &TerminationOutcome) -> Result<bool> {
		if !self.policy.should_restart(outcome, self.routing.quit_requested()) {
			return Ok(false);
		}

		let delay = self.policy.next_delay();
		if !delay.is_zero() {
			tracing::info!("restart is sleeping for {} seconds", delay.as_secs());
			if !self.sleep_unless_quit(delay) {
				tracing::info!("quit requested while waiting to restart");
				return Ok(false);
			}
		}

		let attempt = self.policy.record_attempt();
		tracing::info!("restarting program after it {} (restart #{})", outcome, attempt);
		self.process.restart()?;
		Ok(true)
	}

	/// Sleeps for `delay`; returns false as soon as quit is requested.
	fn sleep_unless_quit(&self, delay: Duration) -> bool {
		let deadline = Instant::now() + delay;
		loop {
			if self.routing.quit_requested() {
				return false;
			}
			let now = Instant::now();
			if now >= deadline {
				return true;
			}
			std::thread::sleep(QUIT_POLL.min(deadline - now));
		}
	}

	/// Tears down the tracking group. The managed process is left running.
	pub fn shutdown(self) {
		self.process.shutdown();
	}
}
