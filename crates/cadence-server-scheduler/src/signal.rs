// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivering signals to the process groups of child work.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
	Term,
	Int,
	Kill,
}

impl Signal {
	pub fn as_str(&self) -> &'static str {
		match self {
			Signal::Term => "SIGTERM",
			Signal::Int => "SIGINT",
			Signal::Kill => "SIGKILL",
		}
	}

	#[cfg(unix)]
	fn as_raw(&self) -> libc::c_int {
		match self {
			Signal::Term => libc::SIGTERM,
			Signal::Int => libc::SIGINT,
			Signal::Kill => libc::SIGKILL,
		}
	}
}

impl fmt::Display for Signal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Error)]
pub enum SignalError {
	/// The group is already gone.
	#[error("process group {pid} not found")]
	NotFound { pid: u32 },

	#[error("refusing to signal pid {pid}")]
	InvalidPid { pid: u32 },

	#[error("failed to send {signal} to process group {pid}: {source}")]
	Os {
		pid: u32,
		signal: Signal,
		#[source]
		source: std::io::Error,
	},
}

pub trait ProcessSignaler: Send + Sync {
	/// Sends `signal` to the process group led by `pid`.
	fn signal_group(&self, pid: u32, signal: Signal) -> Result<(), SignalError>;
}

/// `kill(-pid, sig)`.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixSignaler;

#[cfg(unix)]
impl ProcessSignaler for UnixSignaler {
	fn signal_group(&self, pid: u32, signal: Signal) -> Result<(), SignalError> {
		// pid 0 or 1 would address our own group or every process we may signal
		let group = match libc::pid_t::try_from(pid) {
			Ok(group) if group > 1 => -group,
			_ => return Err(SignalError::InvalidPid { pid }),
		};

		let rc = unsafe { libc::kill(group, signal.as_raw()) };
		if rc == 0 {
			return Ok(());
		}

		let source = std::io::Error::last_os_error();
		if source.raw_os_error() == Some(libc::ESRCH) {
			Err(SignalError::NotFound { pid })
		} else {
			Err(SignalError::Os {
				pid,
				signal,
				source,
			})
		}
	}
}

/// For targets without process groups. Signals are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSignaler;

impl ProcessSignaler for NoopSignaler {
	fn signal_group(&self, pid: u32, signal: Signal) -> Result<(), SignalError> {
		debug!(pid, %signal, "signal delivery not supported on this platform, ignoring");
		Ok(())
	}
}

/// Records every delivery. Pids marked gone answer with [`SignalError::NotFound`].
#[derive(Debug, Default)]
pub struct RecordingSignaler {
	sent: Mutex<Vec<(u32, Signal)>>,
	gone: Mutex<HashSet<u32>>,
}

impl RecordingSignaler {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_gone(&self, pid: u32) {
		self.gone.lock().insert(pid);
	}

	pub fn sent(&self) -> Vec<(u32, Signal)> {
		self.sent.lock().clone()
	}

	pub fn sent_to(&self, pid: u32) -> Vec<Signal> {
		self.sent
			.lock()
			.iter()
			.filter(|(p, _)| *p == pid)
			.map(|(_, s)| *s)
			.collect()
	}
}

impl ProcessSignaler for RecordingSignaler {
	fn signal_group(&self, pid: u32, signal: Signal) -> Result<(), SignalError> {
		self.sent.lock().push((pid, signal));
		if self.gone.lock().contains(&pid) {
			return Err(SignalError::NotFound { pid });
		}
		Ok(())
	}
}
