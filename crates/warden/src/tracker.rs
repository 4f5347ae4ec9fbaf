//! Kernel-backed record of every process spawned by this supervisor.
//!
//! The tracking group is a control-group directory named after the
//! supervisor's PID. Membership is inherited by descendants, so the group
//! keeps pointing at the managed program even after it re-executes itself
//! through a fork. When the directory cannot be created the tracker runs in
//! memory-only mode: adding is a no-op and enumeration yields nothing.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::libc;
use nix::sys::signal::kill;
use nix::unistd::{getpid, Pid};

use crate::error::{Error, Result};

/// cgroup v1 `cpu` hierarchy.
pub const DEFAULT_TRACKING_ROOT: &str = "/sys/fs/cgroup/cpu";

// Present in every cgroup directory, v1 and v2 alike.
const CGROUP_PROCS: &str = "cgroup.procs";
// Used when the root is a plain directory rather than a cgroup mount.
const TASKS: &str = "tasks";

#[derive(Debug)]
pub struct ProcessGroupTracker {
	group_dir: Option<PathBuf>,
	main_exe: PathBuf,
	owner: Pid,
}

impl ProcessGroupTracker {
	/// Creates the tracking group, degrading to memory-only tracking on failure.
	pub fn create(root: &Path, main_exe: &Path) -> Self {
		match Self::try_create(root, main_exe) {
			Ok(tracker) => tracker,
			Err(e) => {
				tracing::error!("{}; continuing without process re-attachment", e);
				Self::memory_only(main_exe)
			}
		}
	}

	pub fn try_create(root: &Path, main_exe: &Path) -> Result<Self> {
		let owner = getpid();
		let group_dir = root.join(group_name(owner));

		match fs::create_dir(&group_dir) {
			Ok(()) => {}
			Err(e) if e.kind() == ErrorKind::AlreadyExists => {
				tracing::info!("reusing tracking group {}", group_dir.display());
			}
			Err(e) => {
				return Err(Error::Tracking(format!(
					"cannot create {}: {}",
					group_dir.display(),
					e
				)));
			}
		}

		Ok(Self {
			group_dir: Some(group_dir),
			main_exe: canonical_exe(main_exe),
			owner,
		})
	}

	pub fn memory_only(main_exe: &Path) -> Self {
		Self {
			group_dir: None,
			main_exe: canonical_exe(main_exe),
			owner: getpid(),
		}
	}

	/// Whether membership survives loss of the supervisor's own state.
	pub fn is_durable(&self) -> bool {
		self.group_dir.is_some()
	}

	pub fn group_dir(&self) -> Option<&Path> {
		self.group_dir.as_deref()
	}

	pub fn main_exe(&self) -> &Path {
		&self.main_exe
	}

	fn members_file(&self) -> Option<PathBuf> {
		let dir = self.group_dir.as_ref()?;
		let procs = dir.join(CGROUP_PROCS);
		if procs.exists() {
			Some(procs)
		} else {
			Some(dir.join(TASKS))
		}
	}

	/// Opens the member file for appending (close-on-exec). `None` when
	/// memory-only.
	pub fn open_members(&self) -> Result<Option<File>> {
		let Some(path) = self.members_file() else {
			return Ok(None);
		};

		OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.map(Some)
			.map_err(|e| Error::Tracking(format!("cannot open {}: {}", path.display(), e)))
	}

	pub fn add_member(&self, pid: Pid) -> Result<()> {
		let Some(mut file) = self.open_members()? else {
			return Ok(());
		};
		file.write_all(format!("{}\n", pid).as_bytes())
			.map_err(|e| Error::Tracking(format!("cannot add {} to the tracking group: {}", pid, e)))
	}

	/// Every PID recorded in the group, in file order. Entries may be stale.
	pub fn list_members(&self) -> Result<Vec<Pid>> {
		let Some(path) = self.members_file() else {
			return Ok(Vec::new());
		};

		match fs::read_to_string(&path) {
			Ok(content) => Ok(parse_members(&content)),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
			Err(e) => Err(Error::Tracking(format!("cannot read {}: {}", path.display(), e))),
		}
	}

	/// The one member that is our direct child and runs the expected executable.
	///
	/// Ambiguity is a miss: with two or more candidates nothing is returned.
	pub fn find_main_member(&self) -> Option<Pid> {
		let candidates: Vec<Pid> = self
			.members_or_empty()
			.into_iter()
			.filter(|&pid| parent_pid(pid) == Some(self.owner))
			.filter(|&pid| exe_path(pid).as_deref() == Some(self.main_exe.as_path()))
			.collect();

		match candidates.as_slice() {
			[pid] => Some(*pid),
			[] => None,
			_ => {
				tracing::info!(
					"{} processes match {}; refusing to guess the main process",
					candidates.len(),
					self.main_exe.display()
				);
				None
			}
		}
	}

	/// First member that is still a direct child of ours, whatever its image.
	pub fn first_waitable_member(&self) -> Option<Pid> {
		self.members_or_empty()
			.into_iter()
			.filter(|&pid| pid != self.owner)
			.find(|&pid| parent_pid(pid) == Some(self.owner) && is_alive(pid))
	}

	fn members_or_empty(&self) -> Vec<Pid> {
		self.list_members().unwrap_or_else(|e| {
			tracing::error!("{}", e);
			Vec::new()
		})
	}

	/// Removes the tracking group. Best-effort.
	pub fn destroy(self) {
		let Some(dir) = self.group_dir else {
			return;
		};
		if !dir.join(CGROUP_PROCS).exists() {
			let _ = fs::remove_file(dir.join(TASKS));
		}
		if let Err(e) = fs::remove_dir(&dir) {
			tracing::info!("could not remove tracking group {}: {}", dir.display(), e);
		}
	}
}

/// Appends the calling process to a member file opened by [`open_members`].
///
/// Allocation-free, so a freshly forked child can join before it execs and
/// anything it forks afterwards inherits the group.
///
/// [`open_members`]: ProcessGroupTracker::open_members
pub(crate) fn enroll_self(members: RawFd) -> bool {
	let mut buf = [0u8; 12];
	let mut pos = buf.len() - 1;
	buf[pos] = b'\n';

	let mut pid = getpid().as_raw().unsigned_abs();
	loop {
		pos -= 1;
		buf[pos] = b'0' + (pid % 10) as u8;
		pid /= 10;
		if pid == 0 {
			break;
		}
	}

	let line = &buf[pos..];
	// SAFETY: write(2) on a caller-owned descriptor from a stack buffer.
	let written = unsafe { libc::write(members, line.as_ptr().cast(), line.len()) };
	written == line.len() as isize
}

pub fn group_name(owner: Pid) -> String {
	format!("{}.supervisor", owner)
}

fn canonical_exe(path: &Path) -> PathBuf {
	fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn parse_members(content: &str) -> Vec<Pid> {
	content
		.lines()
		.filter_map(|line| line.trim().parse::<i32>().ok())
		.filter(|&raw| raw > 0)
		.map(Pid::from_raw)
		.collect()
}

/// Parent PID of `pid`, read from `/proc/<pid>/stat`.
pub fn parent_pid(pid: Pid) -> Option<Pid> {
	let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
	parse_stat_ppid(&stat).map(Pid::from_raw)
}

// The command name sits in parentheses and may itself contain spaces or
// parentheses, so fields are counted from the last ')'.
fn parse_stat_ppid(stat: &str) -> Option<i32> {
	let rest = &stat[stat.rfind(')')? + 1..];
	let mut fields = rest.split_whitespace();
	let _state = fields.next()?;
	fields.next()?.parse().ok()
}

/// Resolved executable image of `pid`.
pub fn exe_path(pid: Pid) -> Option<PathBuf> {
	fs::read_link(format!("/proc/{}/exe", pid)).ok()
}

pub fn is_alive(pid: Pid) -> bool {
	kill(pid, None).is_ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stat_ppid_plain() {
		let stat = "1234 (sleep) S 1000 1234 1000 0 -1 4194304";
		assert_eq!(parse_stat_ppid(stat), Some(1000));
	}

	#[test]
	fn stat_ppid_with_spaces_and_parens_in_comm() {
		let stat = "77 (my (odd) app) R 55 77 55 0";
		assert_eq!(parse_stat_ppid(stat), Some(55));
	}

	#[test]
	fn stat_ppid_garbage() {
		assert_eq!(parse_stat_ppid("no parens here"), None);
		assert_eq!(parse_stat_ppid("1 (x)"), None);
	}

	#[test]
	fn members_skip_garbage_and_zero() {
		let pids = parse_members("12\n\nabc\n0\n 34 \n-5\n");
		assert_eq!(pids, vec![Pid::from_raw(12), Pid::from_raw(34)]);
	}

	#[test]
	fn enroll_self_appends_own_pid() {
		use std::os::fd::AsRawFd;

		let path = std::env::temp_dir().join(format!("warden-enroll-{}", std::process::id()));
		let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path).unwrap();
		assert!(enroll_self(file.as_raw_fd()));
		assert!(enroll_self(file.as_raw_fd()));

		let expected = format!("{0}\n{0}\n", std::process::id());
		assert_eq!(fs::read_to_string(&path).unwrap(), expected);
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn group_is_named_after_owner() {
		assert_eq!(group_name(Pid::from_raw(4242)), "4242.supervisor");
	}

	#[test]
	fn memory_only_tracker_is_empty() {
		let tracker = ProcessGroupTracker::memory_only(Path::new("/bin/true"));
		assert!(!tracker.is_durable());
		assert!(tracker.open_members().unwrap().is_none());
		assert!(tracker.add_member(Pid::from_raw(1)).is_ok());
		assert_eq!(tracker.list_members(), Ok(Vec::new()));
		assert_eq!(tracker.find_main_member(), None);
		tracker.destroy();
	}

	#[test]
	fn missing_root_degrades() {
		let root = Path::new("/nonexistent/warden-tracking-root");
		assert!(matches!(
			ProcessGroupTracker::try_create(root, Path::new("/bin/true")),
			Err(Error::Tracking(_))
		));
		assert!(!ProcessGroupTracker::create(root, Path::new("/bin/true")).is_durable());
	}
}
