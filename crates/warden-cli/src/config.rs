use std::path::{Path, PathBuf};

use serde::Deserialize;
use warden::config::DEFAULT_DELAY_LIMIT;
use warden::tracker::DEFAULT_TRACKING_ROOT;
use warden::SupervisorConfig;

use crate::cli::Cli;

// ── Config file (--config) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
	#[serde(default)]
	pub supervisor: SupervisorSection,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
	pub user: Option<String>,
	pub group: Option<String>,
	pub delay_limit: Option<u32>,
	#[serde(default)]
	pub restart_on_error: bool,
	#[serde(default)]
	pub restart_on_crash: bool,
	#[serde(default)]
	pub fork: bool,
	pub pidfile: Option<PathBuf>,
	pub main_pidfile: Option<PathBuf>,
	pub tracking_root: Option<PathBuf>,
	#[serde(default)]
	pub quiet: u8,
}

pub fn load_file(path: &Path) -> Result<FileConfig, String> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
	toml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
}

// ── Effective settings ──────────────────────────────────────────────────────

/// Engine configuration plus the options owned by the front end.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
	pub supervisor: SupervisorConfig,
	pub pidfile: Option<PathBuf>,
	pub quiet: u8,
}

impl Settings {
	/// Command-line values win; switches set on either side are on.
	pub fn merge(cli: &Cli, file: FileConfig) -> Result<Self, String> {
		let file = file.supervisor;
		let (program, args) = cli
			.command
			.split_first()
			.ok_or_else(|| "no program path given".to_string())?;

		let mut supervisor = SupervisorConfig::new(program).args(args.iter().cloned());
		supervisor.user = cli.user.clone().or(file.user);
		supervisor.group = cli.group.clone().or(file.group);
		supervisor.delay_limit = cli.delay_limit.or(file.delay_limit).unwrap_or(DEFAULT_DELAY_LIMIT);
		supervisor.restart_on_error = cli.restart_on_error || file.restart_on_error;
		supervisor.restart_on_crash = cli.restart_on_crash || file.restart_on_crash;
		supervisor.background = cli.fork || file.fork;
		supervisor.tracking_root = cli
			.tracking_root
			.clone()
			.or(file.tracking_root)
			.unwrap_or_else(|| PathBuf::from(DEFAULT_TRACKING_ROOT));
		supervisor.main_pidfile = cli.main_pidfile.clone().or(file.main_pidfile);

		Ok(Self {
			supervisor,
			pidfile: cli.pidfile.clone().or(file.pidfile),
			quiet: cli.quiet.saturating_add(file.quiet),
		})
	}
}
