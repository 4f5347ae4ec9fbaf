mod cli;
mod config;
mod pidfile;

use clap::Parser;
use owo_colors::OwoColorize;
use tracing::level_filters::LevelFilter;

use cli::Cli;
use config::{FileConfig, Settings};
use pidfile::PidFile;

fn main() {
	let cli = Cli::parse();

	let file = match &cli.config {
		Some(path) => config::load_file(path).unwrap_or_else(|e| fail(&e)),
		None => FileConfig::default(),
	};
	let settings = Settings::merge(&cli, file).unwrap_or_else(|e| fail(&e));

	init_logging(settings.quiet);

	if let Err(e) = settings.supervisor.validate() {
		tracing::error!("{}", e);
		std::process::exit(warden::EXIT_FAILURE);
	}

	if settings.supervisor.background {
		if let Err(e) = nix::unistd::daemon(false, true) {
			tracing::error!("could not daemonize into background: {}", e);
			std::process::exit(warden::EXIT_FAILURE);
		}
	}

	let pidfile = match &settings.pidfile {
		Some(path) => {
			let pid = warden::supervisor_pid();
			tracing::info!("writing supervisor PID {} to {}", pid, path.display());
			match PidFile::create(path, pid) {
				Ok(f) => Some(f),
				Err(e) => {
					tracing::error!("could not write PID file {}: {}", path.display(), e);
					std::process::exit(warden::EXIT_FAILURE);
				}
			}
		}
		None => None,
	};

	let code = warden::run(settings.supervisor);

	drop(pidfile);
	std::process::exit(code);
}

fn init_logging(quiet: u8) {
	let level = match quiet {
		0 => LevelFilter::INFO,
		1 => LevelFilter::ERROR,
		_ => LevelFilter::OFF,
	};
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

fn fail(message: &str) -> ! {
	eprintln!("{} {}", "error:".red().bold(), message);
	std::process::exit(warden::EXIT_FAILURE);
}
