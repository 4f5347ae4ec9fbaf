//! # warden
//!
//! Supervises a single program: spawns it, waits for it, restarts it on
//! error exits or crashes with exponential backoff, forwards signals to it,
//! and re-attaches when the program replaces itself through fork+exec.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use warden::SupervisorConfig;
//!
//! let mut config = SupervisorConfig::new("/usr/sbin/x0d").args(["--no-fork"]);
//! config.restart_on_crash = true;
//! config.delay_limit = 30;
//!
//! std::process::exit(warden::run(config));
//! ```

pub mod config;
pub mod error;
pub mod privilege;
pub mod process;
pub mod restart;
pub mod signals;
pub mod supervisor;
pub mod tracker;
pub mod types;

pub use config::SupervisorConfig;
pub use error::{Error, Result};
pub use process::ManagedProcess;
pub use restart::{RestartPolicy, RestartState};
pub use signals::{Routing, SignalRouter};
pub use supervisor::{Supervisor, EXIT_FAILURE};
pub use tracker::ProcessGroupTracker;
pub use types::*;

/// Runs a supervisor for the whole lifetime of the managed program.
///
/// Installs the signal router for the duration of the call; at most one
/// call may be active per process.
pub fn run(config: SupervisorConfig) -> i32 {
	let mut supervisor = match Supervisor::new(&config) {
		Ok(s) => s,
		Err(e) => {
			tracing::error!("{}", e);
			return EXIT_FAILURE;
		}
	};

	let router = match SignalRouter::install(supervisor.routing()) {
		Ok(r) => r,
		Err(e) => {
			tracing::error!("{}", e);
			supervisor.shutdown();
			return EXIT_FAILURE;
		}
	};

	let code = supervisor.run();
	drop(router);
	supervisor.shutdown();
	code
}

/// PID of the supervisor itself, for PID files.
pub fn supervisor_pid() -> u32 {
	std::process::id()
}
