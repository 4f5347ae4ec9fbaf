//! The one OS process under supervision.
//!
//! Spawning is split in two phases. Everything that allocates happens in the
//! supervisor before `fork()`. The child branch ([`exec_child`]) only resets
//! its signal state, joins the tracking group, drops privileges and calls
//! `execv`; on any failure it writes a five-byte record
//! (stage tag and errno) to a close-on-exec pipe and exits without ever
//! returning into shared code. The supervisor reads that pipe: end-of-file
//! means the new image is running.

use std::ffi::{CStr, CString};
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::signal::{SigSet, Signal};
use nix::unistd::{fork, pipe2, ForkResult, Pid};

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::privilege::{DropStage, GroupDropped, PrivilegeDrop};
use crate::signals::{self, Routing};
use crate::tracker::{self, ProcessGroupTracker};
use crate::types::{ProcessState, TerminationOutcome};

/// Exit status of a child that could not become the managed program.
const CHILD_FAILURE_EXIT: i32 = 127;
const EXEC_STAGE: u8 = 0xff;
const REPORT_LEN: usize = 5;

pub struct ManagedProcess {
	exe: PathBuf,
	program: CString,
	argv: Vec<CString>,
	privileges: PrivilegeDrop,
	tracker: ProcessGroupTracker,
	routing: Arc<Routing>,
	state: ProcessState,
	main_pidfile: Option<PathBuf>,
}

impl ManagedProcess {
	/// Takes ownership of `tracker`; it is destroyed if preparation fails.
	pub fn new(
		config: &SupervisorConfig,
		tracker: ProcessGroupTracker,
		routing: Arc<Routing>,
	) -> Result<Self> {
		let (program, argv, privileges) = match prepare(config) {
			Ok(prepared) => prepared,
			Err(e) => {
				tracker.destroy();
				return Err(e);
			}
		};

		Ok(Self {
			exe: config.program.clone(),
			program,
			argv,
			privileges,
			tracker,
			routing,
			state: ProcessState::Unstarted,
			main_pidfile: config.main_pidfile.clone(),
		})
	}

	pub fn state(&self) -> ProcessState {
		self.state
	}

	pub fn pid(&self) -> Option<Pid> {
		self.state.pid()
	}

	pub fn tracker(&self) -> &ProcessGroupTracker {
		&self.tracker
	}

	/// First spawn. Also makes the supervisor a child subreaper, so a
	/// successor the program forks before exiting stays our child.
	pub fn start(&mut self) -> Result<Pid> {
		mark_subreaper();
		self.spawn()
	}

	/// Always spawns a fresh process.
	pub fn restart(&mut self) -> Result<Pid> {
		self.spawn()
	}

	/// Re-associates with a still-running process from the tracking group.
	///
	/// Prefers the strict main-member match; failing that, the first member
	/// still waitable by us.
	pub fn resume(&mut self) -> bool {
		let found = self
			.tracker
			.find_main_member()
			.or_else(|| self.tracker.first_waitable_member());

		match found {
			Some(pid) => {
				self.associate(pid);
				true
			}
			None => false,
		}
	}

	/// Sends `signal` to the current process. No-op when unassociated.
	pub fn signal(&self, signal: Signal) -> bool {
		self.routing.forward(signal)
	}

	/// Blocks until the current process terminates.
	pub fn wait(&mut self) -> Result<TerminationOutcome> {
		let pid = self
			.pid()
			.ok_or_else(|| Error::Wait("no process is associated".to_string()))?;
		let status = wait_raw(pid)?;

		self.routing.dissociate();
		self.state = ProcessState::Exited;
		Ok(TerminationOutcome::from_raw(pid, status))
	}

	fn spawn(&mut self) -> Result<Pid> {
		tracing::info!("spawning program ({})...", self.exe.display());

		let mut argv_ptrs: Vec<*const libc::c_char> =
			self.argv.iter().map(|arg| arg.as_ptr()).collect();
		argv_ptrs.push(std::ptr::null());

		let (report_rx, report_tx) =
			pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Spawn(format!("pipe failed: {}", e)))?;
		let members = self.tracker.open_members().unwrap_or_else(|e| {
			tracing::error!("{}", e);
			None
		});
		let members_fd = members.as_ref().map(|file| file.as_raw_fd());
		let mask = signals::block_forwarded()?;

		// SAFETY: the child branch only performs syscalls on data prepared above.
		let forked = match unsafe { fork() } {
			Ok(ForkResult::Child) => exec_child(ChildSetup {
				program: &self.program,
				argv: &argv_ptrs,
				privileges: &self.privileges,
				members: members_fd,
				mask: &mask,
				report: report_tx.as_raw_fd(),
			}),
			Ok(ForkResult::Parent { child }) => Ok(child),
			Err(e) => Err(Error::Spawn(format!("fork failed: {}", e))),
		};
		signals::restore_mask(&mask);
		drop(members);
		drop(report_tx);

		let child = forked?;
		self.await_exec(child, File::from(report_rx))?;

		tracing::info!("child pid is {}", child);
		self.associate(child);
		Ok(child)
	}

	fn await_exec(&self, child: Pid, mut report: File) -> Result<()> {
		let mut record = [0u8; REPORT_LEN];
		let mut filled = 0;
		while filled < REPORT_LEN {
			match report.read(&mut record[filled..]) {
				Ok(0) => break,
				Ok(n) => filled += n,
				Err(e) if e.kind() == ErrorKind::Interrupted => continue,
				Err(e) => return Err(Error::Spawn(format!("reading exec report failed: {}", e))),
			}
		}

		if filled == 0 {
			return Ok(());
		}

		// The child already gave up; reap it so it does not linger as a zombie.
		let _ = wait_raw(child);

		if filled < REPORT_LEN {
			return Err(Error::Spawn(format!("truncated exec report from child {}", child)));
		}
		let errno = Errno::from_raw(i32::from_ne_bytes([record[1], record[2], record[3], record[4]]));
		match DropStage::from_u8(record[0]) {
			Some(stage) => Err(Error::Privilege(format!("{} failed: {}", stage, errno))),
			None => Err(Error::Spawn(format!("execv {} failed: {}", self.exe.display(), errno))),
		}
	}

	fn associate(&mut self, pid: Pid) {
		self.state = ProcessState::Running { pid };
		self.routing.associate(pid);

		if let Some(path) = &self.main_pidfile {
			if let Err(e) = fs::write(path, format!("{}\n", pid)) {
				tracing::error!("could not write main PID file {}: {}", path.display(), e);
			}
		}
	}

	/// Releases supervisor-side resources. The process itself keeps running.
	pub fn shutdown(self) {
		if let Some(path) = &self.main_pidfile {
			remove_pidfile(path);
		}
		self.tracker.destroy();
	}
}

fn prepare(config: &SupervisorConfig) -> Result<(CString, Vec<CString>, PrivilegeDrop)> {
	config.validate()?;
	let program = CString::new(config.program.as_os_str().as_bytes())
		.map_err(|e| Error::Config(e.to_string()))?;
	let privileges = PrivilegeDrop::resolve(config.user.as_deref(), config.group.as_deref())?;
	Ok((program, config.c_argv()?, privileges))
}

/// Everything the child branch touches, prepared before `fork()`.
struct ChildSetup<'a> {
	program: &'a CStr,
	argv: &'a [*const libc::c_char],
	privileges: &'a PrivilegeDrop,
	members: Option<RawFd>,
	mask: &'a SigSet,
	report: RawFd,
}

/// Child side of spawn: reset signals, join the group, drop privileges,
/// replace the image, or die.
fn exec_child(child: ChildSetup<'_>) -> ! {
	signals::reset_for_exec(child.mask);

	// Joining comes first so anything the program forks inherits the group,
	// and before the privilege drop that could forbid the write.
	if let Some(fd) = child.members {
		tracker::enroll_self(fd);
	}

	if let Err(failure) = child.privileges.drop_group().and_then(GroupDropped::drop_user) {
		abort_child(child.report, failure.stage as u8, failure.errno);
	}

	// SAFETY: argv is a NULL-terminated array of pointers into CStrings that
	// outlive this call.
	unsafe { libc::execv(child.program.as_ptr(), child.argv.as_ptr()) };
	abort_child(child.report, EXEC_STAGE, Errno::last())
}

fn abort_child(report: RawFd, stage: u8, errno: Errno) -> ! {
	let code = (errno as i32).to_ne_bytes();
	let record = [stage, code[0], code[1], code[2], code[3]];
	// SAFETY: write(2) and _exit(2) are async-signal-safe.
	unsafe {
		libc::write(report, record.as_ptr().cast(), record.len());
		libc::_exit(CHILD_FAILURE_EXIT)
	}
}

fn wait_raw(pid: Pid) -> Result<i32> {
	loop {
		let mut status = 0;
		// SAFETY: plain waitpid on a PID we own, status points to a local.
		let rv = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
		if rv >= 0 {
			return Ok(status);
		}
		match Errno::last() {
			Errno::EINTR => continue,
			e => return Err(Error::Wait(format!("waitpid({}) failed: {}", pid, e))),
		}
	}
}

/// Orphaned descendants get reparented to us, so a program that re-executes
/// through fork stays waitable.
#[cfg(target_os = "linux")]
fn mark_subreaper() {
	if let Err(e) = nix::sys::prctl::set_child_subreaper(true) {
		tracing::info!("prctl(PR_SET_CHILD_SUBREAPER) failed. {}", e);
	}
}

#[cfg(not(target_os = "linux"))]
fn mark_subreaper() {}

fn remove_pidfile(path: &Path) {
	if let Err(e) = fs::remove_file(path) {
		if e.kind() != ErrorKind::NotFound {
			tracing::info!("could not remove {}: {}", path.display(), e);
		}
	}
}
