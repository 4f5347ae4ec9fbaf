//! One-way credential reduction for the spawned program.
//!
//! Names are resolved in the supervisor, before forking, into a
//! [`PrivilegeDrop`] plan. The forked child then only issues the credential
//! syscalls. The group stage has to run first because changing the group
//! needs the privileges that the user stage gives up; the user stage is only
//! reachable through the value the group stage returns:
//!
//! ```compile_fail
//! let plan = warden::privilege::PrivilegeDrop::none();
//! plan.drop_user().unwrap();
//! ```
//!
//! ```
//! let plan = warden::privilege::PrivilegeDrop::none();
//! plan.drop_group().and_then(|dropped| dropped.drop_user()).unwrap();
//! ```

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::unistd::{chdir, getgid, getuid, initgroups, setgid, setgroups, setuid, Gid, Group, Uid, User};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupTarget {
	name: String,
	gid: Gid,
	/// User whose supplementary groups are rebuilt under `gid`.
	init_for: Option<CString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UserTarget {
	name: String,
	uid: Uid,
	home: CString,
}

/// Resolved credentials to switch to in the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivilegeDrop {
	group: Option<GroupTarget>,
	user: Option<UserTarget>,
}

/// Proof that the group stage ran.
#[derive(Debug)]
pub struct GroupDropped<'a> {
	user: Option<&'a UserTarget>,
}

/// Credential syscall that failed in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DropStage {
	SetGid = 1,
	SetGroups = 2,
	InitGroups = 3,
	SetUid = 4,
	Chdir = 5,
}

impl DropStage {
	pub fn from_u8(tag: u8) -> Option<Self> {
		match tag {
			1 => Some(DropStage::SetGid),
			2 => Some(DropStage::SetGroups),
			3 => Some(DropStage::InitGroups),
			4 => Some(DropStage::SetUid),
			5 => Some(DropStage::Chdir),
			_ => None,
		}
	}
}

impl fmt::Display for DropStage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			DropStage::SetGid => "setgid",
			DropStage::SetGroups => "setgroups",
			DropStage::InitGroups => "initgroups",
			DropStage::SetUid => "setuid",
			DropStage::Chdir => "chdir to home directory",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropFailure {
	pub stage: DropStage,
	pub errno: Errno,
}

fn fail(stage: DropStage) -> impl FnOnce(Errno) -> DropFailure {
	move |errno| DropFailure { stage, errno }
}

impl PrivilegeDrop {
	pub fn none() -> Self {
		Self::default()
	}

	/// Resolves the requested names against the caller's real credentials.
	pub fn resolve(user: Option<&str>, group: Option<&str>) -> Result<Self> {
		Self::resolve_as(user, group, getuid(), getgid())
	}

	/// Like [`resolve`](Self::resolve), for the given caller identity.
	///
	/// A stage is only planned when the caller holds the root id it needs;
	/// otherwise the request is logged and skipped.
	pub fn resolve_as(user: Option<&str>, group: Option<&str>, uid: Uid, gid: Gid) -> Result<Self> {
		let mut plan = Self::none();

		if let Some(group_name) = group {
			if gid.as_raw() == 0 {
				let entry = Group::from_name(group_name)
					.map_err(|e| Error::Privilege(format!("could not look up group {}: {}", group_name, e)))?
					.ok_or_else(|| Error::Privilege(format!("could not find group: {}", group_name)))?;
				let init_for = user
					.map(|name| CString::new(name).map_err(|e| Error::Privilege(e.to_string())))
					.transpose()?;
				tracing::info!("dropping group privileges to '{}' ({})", group_name, entry.gid);
				plan.group = Some(GroupTarget {
					name: group_name.to_string(),
					gid: entry.gid,
					init_for,
				});
			} else {
				tracing::info!("not running with group id 0; keeping group for '{}'", group_name);
			}
		}

		if let Some(user_name) = user {
			if uid.is_root() {
				let entry = User::from_name(user_name)
					.map_err(|e| Error::Privilege(format!("could not look up user {}: {}", user_name, e)))?
					.ok_or_else(|| Error::Privilege(format!("could not find user: {}", user_name)))?;
				let home = CString::new(entry.dir.as_os_str().as_bytes())
					.map_err(|e| Error::Privilege(e.to_string()))?;
				tracing::info!("dropping user privileges to '{}' ({})", user_name, entry.uid);
				plan.user = Some(UserTarget {
					name: user_name.to_string(),
					uid: entry.uid,
					home,
				});
			} else {
				tracing::info!("not running as root; keeping user for '{}'", user_name);
			}
		}

		Ok(plan)
	}

	pub fn is_noop(&self) -> bool {
		self.group.is_none() && self.user.is_none()
	}

	pub fn group_id(&self) -> Option<Gid> {
		self.group.as_ref().map(|g| g.gid)
	}

	pub fn user_id(&self) -> Option<Uid> {
		self.user.as_ref().map(|u| u.uid)
	}

	/// Switches group id and rebuilds supplementary groups.
	///
	/// Only syscalls happen here; safe to call between fork and exec.
	pub fn drop_group(&self) -> std::result::Result<GroupDropped<'_>, DropFailure> {
		if let Some(target) = &self.group {
			setgid(target.gid).map_err(fail(DropStage::SetGid))?;
			setgroups(&[]).map_err(fail(DropStage::SetGroups))?;
			if let Some(user) = &target.init_for {
				initgroups(user, target.gid).map_err(fail(DropStage::InitGroups))?;
			}
		}
		Ok(GroupDropped {
			user: self.user.as_ref(),
		})
	}
}

impl GroupDropped<'_> {
	/// Switches user id and moves into the user's home directory.
	pub fn drop_user(self) -> std::result::Result<(), DropFailure> {
		if let Some(target) = self.user {
			setuid(target.uid).map_err(fail(DropStage::SetUid))?;
			chdir(target.home.as_c_str()).map_err(fail(DropStage::Chdir))?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const NOBODY: u32 = 65534;

	#[test]
	fn unprivileged_caller_plans_nothing() {
		let plan = PrivilegeDrop::resolve_as(
			Some("warden-no-such-user"),
			Some("warden-no-such-group"),
			Uid::from_raw(NOBODY),
			Gid::from_raw(NOBODY),
		)
		.unwrap();
		assert!(plan.is_noop());
	}

	#[test]
	fn unknown_group_fails_for_root() {
		let err = PrivilegeDrop::resolve_as(
			None,
			Some("warden-no-such-group"),
			Uid::from_raw(NOBODY),
			Gid::from_raw(0),
		)
		.unwrap_err();
		assert_eq!(err, Error::Privilege("could not find group: warden-no-such-group".into()));
	}

	#[test]
	fn unknown_user_fails_for_root() {
		let err = PrivilegeDrop::resolve_as(
			Some("warden-no-such-user"),
			None,
			Uid::from_raw(0),
			Gid::from_raw(NOBODY),
		)
		.unwrap_err();
		assert!(matches!(err, Error::Privilege(_)));
	}

	#[test]
	fn root_group_resolves() {
		let plan =
			PrivilegeDrop::resolve_as(None, Some("root"), Uid::from_raw(NOBODY), Gid::from_raw(0))
				.unwrap();
		assert_eq!(plan.group_id(), Some(Gid::from_raw(0)));
		assert_eq!(plan.user_id(), None);
	}

	#[test]
	fn root_user_resolves_with_home() {
		let plan =
			PrivilegeDrop::resolve_as(Some("root"), None, Uid::from_raw(0), Gid::from_raw(NOBODY))
				.unwrap();
		assert_eq!(plan.user_id(), Some(Uid::from_raw(0)));
		assert!(!plan.user.as_ref().unwrap().home.as_bytes().is_empty());
	}

	#[test]
	fn noop_plan_applies_cleanly() {
		let plan = PrivilegeDrop::none();
		assert!(plan.drop_group().and_then(GroupDropped::drop_user).is_ok());
	}

	#[test]
	fn stage_tags_round_trip() {
		for stage in [
			DropStage::SetGid,
			DropStage::SetGroups,
			DropStage::InitGroups,
			DropStage::SetUid,
			DropStage::Chdir,
		] {
			assert_eq!(DropStage::from_u8(stage as u8), Some(stage));
		}
		assert_eq!(DropStage::from_u8(0), None);
	}
}
