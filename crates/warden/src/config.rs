use std::ffi::CString;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::tracker::DEFAULT_TRACKING_ROOT;

/// Default cap, in seconds, for the exponential restart delay.
pub const DEFAULT_DELAY_LIMIT: u32 = 80;

/// Everything the engine needs to supervise one program.
///
/// Built once by the front end and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
	/// Absolute path of the managed executable.
	pub program: PathBuf,
	/// Arguments passed after `argv[0]`.
	pub args: Vec<String>,
	pub user: Option<String>,
	pub group: Option<String>,
	/// Restart after a normal exit with a non-zero code.
	pub restart_on_error: bool,
	/// Restart after termination by a crash-class signal.
	pub restart_on_crash: bool,
	/// Upper bound for the restart delay, in seconds.
	pub delay_limit: u32,
	/// The front end detaches into the background before supervising.
	pub background: bool,
	/// Control-group hierarchy under which the tracking group is created.
	pub tracking_root: PathBuf,
	/// File receiving the PID of the currently managed process.
	pub main_pidfile: Option<PathBuf>,
}

impl SupervisorConfig {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			user: None,
			group: None,
			restart_on_error: false,
			restart_on_crash: false,
			delay_limit: DEFAULT_DELAY_LIMIT,
			background: false,
			tracking_root: PathBuf::from(DEFAULT_TRACKING_ROOT),
			main_pidfile: None,
		}
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args = args.into_iter().map(Into::into).collect();
		self
	}

	/// Full argument vector, `argv[0]` being the program path.
	pub fn argv(&self) -> Vec<String> {
		std::iter::once(self.program.to_string_lossy().into_owned())
			.chain(self.args.iter().cloned())
			.collect()
	}

	pub fn validate(&self) -> Result<()> {
		if !self.program.is_absolute() {
			return Err(Error::Config(format!(
				"program path must be absolute: {}",
				self.program.display()
			)));
		}
		if self.argv().iter().any(|arg| arg.contains('\0')) {
			return Err(Error::Config("arguments must not contain NUL bytes".to_string()));
		}
		for name in [&self.user, &self.group].into_iter().flatten() {
			if name.is_empty() || name.contains('\0') {
				return Err(Error::Config(format!("invalid user or group name: {:?}", name)));
			}
		}
		Ok(())
	}

	pub(crate) fn c_argv(&self) -> Result<Vec<CString>> {
		self.argv()
			.into_iter()
			.map(|arg| CString::new(arg).map_err(|e| Error::Config(e.to_string())))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn argv_starts_with_program() {
		let config = SupervisorConfig::new("/usr/sbin/x0d").args(["--no-fork", "-v"]);
		assert_eq!(config.argv(), vec!["/usr/sbin/x0d", "--no-fork", "-v"]);
	}

	#[test]
	fn relative_program_is_rejected() {
		let err = SupervisorConfig::new("bin/app").validate().unwrap_err();
		assert!(matches!(err, Error::Config(_)));
	}

	#[test]
	fn nul_in_argument_is_rejected() {
		let config = SupervisorConfig::new("/bin/true").args(["a\0b"]);
		assert!(config.validate().is_err());
	}

	#[test]
	fn empty_user_is_rejected() {
		let mut config = SupervisorConfig::new("/bin/true");
		config.user = Some(String::new());
		assert!(config.validate().is_err());
	}

	#[test]
	fn defaults() {
		let config = SupervisorConfig::new("/bin/true");
		assert!(config.validate().is_ok());
		assert_eq!(config.delay_limit, DEFAULT_DELAY_LIMIT);
		assert!(!config.restart_on_error);
		assert!(!config.restart_on_crash);
		assert_eq!(config.tracking_root, PathBuf::from(DEFAULT_TRACKING_ROOT));
	}
}
