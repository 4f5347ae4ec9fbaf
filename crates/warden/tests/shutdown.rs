//! TERM delivered to the supervisor itself, through the installed signal
//! router. Own test binary: the router is process-wide and an uncaught TERM
//! would take the whole harness down.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::getpid;

use warden::{SupervisorConfig, EXIT_FAILURE};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("warden-shutdown-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::remove_dir_all(&dir);
	std::fs::create_dir_all(&dir).unwrap();
	dir
}

/// Shell program that logs every start to `starts` before running `body`.
fn logged(body: &str, root: &Path) -> (SupervisorConfig, PathBuf) {
	let starts = root.join("starts");
	let mut config = SupervisorConfig::new("/bin/sh").args([
		"-c",
		&format!("echo start >> \"$1\"; {}", body),
		"sh",
		starts.to_str().unwrap(),
	]);
	config.tracking_root = root.to_path_buf();
	config.main_pidfile = Some(root.join("main.pid"));
	config.restart_on_error = true;
	config.restart_on_crash = true;
	config.delay_limit = 4;
	(config, starts)
}

fn start_count(starts: &Path) -> usize {
	std::fs::read_to_string(starts).map(|s| s.lines().count()).unwrap_or(0)
}

fn wait_until(what: &str, mut ready: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(10);
	while !ready() {
		assert!(Instant::now() < deadline, "timed out waiting for {}", what);
		std::thread::sleep(Duration::from_millis(10));
	}
}

fn supervise(config: SupervisorConfig) -> JoinHandle<i32> {
	std::thread::spawn(move || warden::run(config))
}

// Both cases share one test so that only one router exists at a time.
#[test]
fn term_to_supervisor_ends_supervision() {
	// forwarded TERM kills the program: fixed failure code, no restart
	let root = temp_dir("running");
	let (config, starts) = logged("exec /bin/sleep 30", &root);
	let pidfile = root.join("main.pid");
	let handle = supervise(config);

	// the main PID file is written only after the router is installed
	wait_until("the program to start", || pidfile.exists() && start_count(&starts) == 1);
	kill(getpid(), Signal::SIGTERM).unwrap();

	assert_eq!(handle.join().unwrap(), EXIT_FAILURE);
	assert_eq!(start_count(&starts), 1);
	assert!(!pidfile.exists());
	let _ = std::fs::remove_dir_all(&root);

	// TERM during the one-second backoff: the program's own code, no restart
	let root = temp_dir("backoff");
	let (config, starts) = logged("exit 7", &root);
	let began = Instant::now();
	let handle = supervise(config);

	// first restart is immediate, the second waits one second
	wait_until("the immediate restart", || start_count(&starts) == 2);
	std::thread::sleep(Duration::from_millis(300));
	kill(getpid(), Signal::SIGTERM).unwrap();

	assert_eq!(handle.join().unwrap(), 7);
	assert_eq!(start_count(&starts), 2);
	assert!(began.elapsed() < Duration::from_secs(3));
	let _ = std::fs::remove_dir_all(&root);
}
