use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Debug, Parser)]
#[command(
	name = "warden",
	version,
	about = "a process supervising tool",
	override_usage = "warden [OPTIONS] -- /path/to/app [app options ...]",
	after_help = "Examples:\n    warden -c -- /usr/sbin/x0d\n    warden -p /var/run/x0d/warden.pid -- /usr/sbin/x0d --no-fork"
)]
pub struct Cli {
	/// Fork supervisor into background
	#[arg(short, long)]
	pub fork: bool,

	/// Location to store the current supervisor PID
	#[arg(short, long, value_name = "PATH")]
	pub pidfile: Option<PathBuf>,

	/// PID file for the main child process
	#[arg(short = 'P', long, value_name = "PATH")]
	pub main_pidfile: Option<PathBuf>,

	/// Drops application user privileges
	#[arg(short, long, value_name = "NAME")]
	pub user: Option<String>,

	/// Drops application group privileges
	#[arg(short, long, value_name = "NAME")]
	pub group: Option<String>,

	/// Maximum delay in seconds to sleep between restarts [default: 80]
	#[arg(short = 'l', long, value_name = "N")]
	pub delay_limit: Option<u32>,

	/// Restart the application also on normal termination with exit code != 0
	#[arg(short = 'e', long)]
	pub restart_on_error: bool,

	/// Restart the application when it crashes (killed by a non-shutdown signal)
	#[arg(short = 'c', long)]
	pub restart_on_crash: bool,

	/// Decreases verbosity; use -qq to silence runtime errors too
	#[arg(short, long, action = ArgAction::Count)]
	pub quiet: u8,

	/// TOML file with default options
	#[arg(short = 'C', long, value_name = "PATH")]
	pub config: Option<PathBuf>,

	/// Control-group hierarchy used to track spawned processes
	#[arg(long, value_name = "DIR")]
	pub tracking_root: Option<PathBuf>,

	/// Program to supervise, followed by its arguments
	#[arg(
		value_name = "PROGRAM",
		required = true,
		trailing_var_arg = true,
		allow_hyphen_values = true
	)]
	pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_flags_and_program() {
		let cli = Cli::parse_from([
			"warden", "-ec", "-l", "30", "-qq", "-u", "www", "--", "/usr/sbin/x0d", "--no-fork",
		]);
		assert!(cli.restart_on_error);
		assert!(cli.restart_on_crash);
		assert_eq!(cli.delay_limit, Some(30));
		assert_eq!(cli.quiet, 2);
		assert_eq!(cli.user.as_deref(), Some("www"));
		assert_eq!(cli.command, vec!["/usr/sbin/x0d", "--no-fork"]);
	}

	#[test]
	fn program_arguments_are_not_parsed_as_options() {
		let cli = Cli::parse_from(["warden", "/bin/app", "-f", "--user", "x"]);
		assert!(!cli.fork);
		assert_eq!(cli.user, None);
		assert_eq!(cli.command, vec!["/bin/app", "-f", "--user", "x"]);
	}

	#[test]
	fn program_is_required() {
		assert!(Cli::try_parse_from(["warden", "-c"]).is_err());
	}
}
