use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// PID file holding the supervisor's PID. Removed on drop.
#[derive(Debug)]
pub struct PidFile {
	path: PathBuf,
}

impl PidFile {
	pub fn create(path: &Path, pid: u32) -> io::Result<Self> {
		fs::write(path, format!("{}\n", pid))?;
		Ok(Self {
			path: path.to_path_buf(),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for PidFile {
	fn drop(&mut self) {
		let _ = fs::remove_file(&self.path);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn written_as_decimal_and_removed_on_drop() {
		let path = std::env::temp_dir().join(format!("warden-pidfile-{}.pid", std::process::id()));
		let pidfile = PidFile::create(&path, 4321).unwrap();
		assert_eq!(pidfile.path(), path.as_path());
		assert_eq!(fs::read_to_string(&path).unwrap(), "4321\n");
		drop(pidfile);
		assert!(!path.exists());
	}

	#[test]
	fn unwritable_location_fails() {
		assert!(PidFile::create(Path::new("/nonexistent/dir/warden.pid"), 1).is_err());
	}
}
