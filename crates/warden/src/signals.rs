//! Asynchronous signal routing to the managed program.
//!
//! The handler runs in signal context, so it only touches atomics and calls
//! `kill(2)`. It reaches the engine's [`Routing`] through a process-wide
//! pointer that exists only while a [`SignalRouter`] is alive; at most one
//! router can be installed per process.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{
	kill, pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::unistd::Pid;

use crate::error::{Error, Result};

/// Signals forwarded verbatim to the managed program.
pub const FORWARDED_SIGNALS: [Signal; 8] = [
	Signal::SIGINT,
	Signal::SIGQUIT,
	Signal::SIGTERM,
	Signal::SIGCONT,
	Signal::SIGUSR1,
	Signal::SIGUSR2,
	Signal::SIGTTIN,
	Signal::SIGTTOU,
];

/// Deliberate shutdown requests. They never lead to a restart.
pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM];

pub fn is_shutdown_signal(signal: Signal) -> bool {
	SHUTDOWN_SIGNALS.contains(&signal)
}

/// State shared between the control loop and the signal handler.
///
/// `pid` is 0 while no process is associated. Signals arriving then are
/// dropped.
#[derive(Debug, Default)]
pub struct Routing {
	pid: AtomicI32,
	quit: AtomicBool,
}

impl Routing {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn associate(&self, pid: Pid) {
		self.pid.store(pid.as_raw(), Ordering::SeqCst);
	}

	pub fn dissociate(&self) {
		self.pid.store(0, Ordering::SeqCst);
	}

	pub fn current(&self) -> Option<Pid> {
		match self.pid.load(Ordering::SeqCst) {
			raw if raw > 0 => Some(Pid::from_raw(raw)),
			_ => None,
		}
	}

	pub fn request_quit(&self) {
		self.quit.store(true, Ordering::SeqCst);
	}

	pub fn quit_requested(&self) -> bool {
		self.quit.load(Ordering::SeqCst)
	}

	/// Sends `signal` to the associated process. Returns whether it was sent.
	pub fn forward(&self, signal: Signal) -> bool {
		match self.current() {
			Some(pid) => kill(pid, signal).is_ok(),
			None => false,
		}
	}

	/// What the handler does with a received signal.
	pub fn route(&self, signal: Signal) -> bool {
		if is_shutdown_signal(signal) {
			self.request_quit();
		}
		self.forward(signal)
	}
}

static ROUTE: AtomicPtr<Routing> = AtomicPtr::new(ptr::null_mut());

extern "C" fn route_signal(signo: libc::c_int) {
	let saved = Errno::last_raw();
	let routing = ROUTE.load(Ordering::SeqCst);
	if !routing.is_null() {
		if let Ok(signal) = Signal::try_from(signo) {
			// SAFETY: the pointer comes from an Arc held by the installed
			// SignalRouter, which clears it only after restoring the previous
			// handlers.
			unsafe { &*routing }.route(signal);
		}
	}
	Errno::set_raw(saved);
}

/// Installed signal handlers. Dropping it restores the previous dispositions.
pub struct SignalRouter {
	routing: Arc<Routing>,
	previous: Vec<(Signal, SigAction)>,
}

impl SignalRouter {
	pub fn install(routing: Arc<Routing>) -> Result<Self> {
		let raw = Arc::as_ptr(&routing) as *mut Routing;
		if ROUTE
			.compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return Err(Error::Signal("a signal router is already installed".to_string()));
		}

		let mut router = Self {
			routing,
			previous: Vec::with_capacity(FORWARDED_SIGNALS.len()),
		};
		let action = SigAction::new(
			SigHandler::Handler(route_signal),
			SaFlags::SA_RESTART,
			SigSet::empty(),
		);

		for signal in FORWARDED_SIGNALS {
			// SAFETY: route_signal only touches atomics and calls kill(2).
			match unsafe { sigaction(signal, &action) } {
				Ok(old) => router.previous.push((signal, old)),
				Err(e) => {
					return Err(Error::Signal(format!("sigaction({}) failed: {}", signal, e)));
				}
			}
		}

		Ok(router)
	}

	pub fn routing(&self) -> &Arc<Routing> {
		&self.routing
	}
}

impl Drop for SignalRouter {
	fn drop(&mut self) {
		for (signal, old) in self.previous.drain(..).rev() {
			// SAFETY: restores a disposition previously returned by sigaction.
			if let Err(e) = unsafe { sigaction(signal, &old) } {
				tracing::error!("could not restore handler for {}: {}", signal, e);
			}
		}
		ROUTE.store(ptr::null_mut(), Ordering::SeqCst);
	}
}

fn forwarded_set() -> SigSet {
	let mut set = SigSet::empty();
	for signal in FORWARDED_SIGNALS {
		set.add(signal);
	}
	set
}

/// Blocks the forwarded signals on the calling thread, returning the previous
/// mask. Spawning holds them across `fork` so none reaches the child while it
/// still carries the router's handler.
pub(crate) fn block_forwarded() -> Result<SigSet> {
	let mut previous = SigSet::empty();
	pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&forwarded_set()), Some(&mut previous))
		.map_err(|e| Error::Signal(format!("cannot block forwarded signals: {}", e)))?;
	Ok(previous)
}

pub(crate) fn restore_mask(mask: &SigSet) {
	let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(mask), None);
}

/// Child side of spawn: default dispositions for the forwarded signals while
/// a router is installed, then the mask from before [`block_forwarded`].
/// Signals that arrived meanwhile are delivered to the child itself.
pub(crate) fn reset_for_exec(mask: &SigSet) {
	if !ROUTE.load(Ordering::SeqCst).is_null() {
		let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
		for signal in FORWARDED_SIGNALS {
			// SAFETY: SIG_DFL runs no code in this process.
			let _ = unsafe { sigaction(signal, &default) };
		}
	}
	restore_mask(mask);
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::os::unix::process::ExitStatusExt;
	use std::process::Command;

	fn sleeper() -> std::process::Child {
		Command::new("/bin/sleep").arg("30").spawn().unwrap()
	}

	#[test]
	fn forward_reaches_associated_process() {
		let routing = Routing::new();
		let mut child = sleeper();
		routing.associate(Pid::from_raw(child.id() as i32));

		assert!(routing.forward(Signal::SIGUSR1));
		let status = child.wait().unwrap();
		assert_eq!(status.signal(), Some(Signal::SIGUSR1 as i32));
	}

	#[test]
	fn forward_is_dropped_while_unassociated() {
		let routing = Routing::new();
		let mut child = sleeper();
		routing.associate(Pid::from_raw(child.id() as i32));
		routing.dissociate();

		assert!(!routing.forward(Signal::SIGUSR1));
		assert!(child.try_wait().unwrap().is_none());
		child.kill().unwrap();
		child.wait().unwrap();
	}

	#[test]
	fn shutdown_signals_raise_quit() {
		let routing = Routing::new();
		assert!(!routing.route(Signal::SIGUSR2));
		assert!(!routing.quit_requested());
		for signal in SHUTDOWN_SIGNALS {
			let routing = Routing::new();
			routing.route(signal);
			assert!(routing.quit_requested(), "{} should request quit", signal);
		}
	}

	#[test]
	fn forwarded_signals_held_until_mask_restored() {
		let previous = block_forwarded().unwrap();
		let held = SigSet::thread_get_mask().unwrap();
		for signal in FORWARDED_SIGNALS {
			assert!(held.contains(signal), "{} should be blocked", signal);
		}

		restore_mask(&previous);
		let after = SigSet::thread_get_mask().unwrap();
		for signal in FORWARDED_SIGNALS {
			assert_eq!(after.contains(signal), previous.contains(signal));
		}
	}

	// The only test in this crate that touches process-wide dispositions.
	#[test]
	fn installed_router_forwards_raised_signal() {
		let routing = Routing::new();
		let router = SignalRouter::install(Arc::clone(&routing)).unwrap();
		assert!(SignalRouter::install(Routing::new()).is_err());

		let mut child = sleeper();
		routing.associate(Pid::from_raw(child.id() as i32));
		nix::sys::signal::raise(Signal::SIGUSR2).unwrap();

		let status = child.wait().unwrap();
		assert_eq!(status.signal(), Some(Signal::SIGUSR2 as i32));
		assert!(!routing.quit_requested());

		drop(router);
		let again = SignalRouter::install(Routing::new()).unwrap();
		drop(again);
	}
}
