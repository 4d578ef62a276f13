//! §4.H: what happens when a guard's slow path actually denies a call.
//! [`ViolationHandler`] is the extension point; [`DefaultViolationHandler`]
//! matches a real CLR host's `SecurityException`-throwing behaviour, the
//! other two stock handlers are for callers that would rather observe
//! violations than abort on them.

use std::sync::Mutex;

use crate::cas::error::SecurityViolation;

/// Reacts to a guard denial. Implementations run on the sandboxed call's own
/// thread, synchronously, before the guard returns control to its caller —
/// an implementation that blocks indefinitely blocks the call forever.
pub trait ViolationHandler: Send + Sync {
	/// `true` lets the call proceed anyway (the handler chose to waive the
	/// violation); `false` aborts it. [`DefaultViolationHandler`] always
	/// returns `false`.
	fn handle(&self, violation: &SecurityViolation) -> bool;
}

/// Aborts every violation — the behaviour a freshly constructed
/// [`Loader`](crate::cas::loader::Loader) starts with.
#[derive(Debug, Default, Copy, Clone)]
pub struct DefaultViolationHandler;

impl ViolationHandler for DefaultViolationHandler {
	fn handle(&self, _violation: &SecurityViolation) -> bool {
		false
	}
}

/// Logs every violation at `warn` level through `tracing`, then aborts the
/// call same as [`DefaultViolationHandler`] — for hosts that want an audit
/// trail without writing their own handler.
#[derive(Debug, Default, Copy, Clone)]
pub struct LoggingViolationHandler;

impl ViolationHandler for LoggingViolationHandler {
	fn handle(&self, violation: &SecurityViolation) -> bool {
		tracing::warn!(member = ?violation.member, declaring_type = ?violation.declaring_type, reason = %violation.reason, "security violation");
		false
	}
}

/// Records every violation it sees instead of acting on it; [`Self::drain`]
/// hands ownership of the recorded violations back to the caller. Intended
/// for host-side tests that want to assert on *which* violations occurred
/// without aborting the call under test.
#[derive(Default)]
pub struct RecordingViolationHandler {
	recorded: Mutex<Vec<SecurityViolation>>,
}

impl RecordingViolationHandler {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn drain(&self) -> Vec<SecurityViolation> {
		std::mem::take(&mut *self.recorded.lock().unwrap_or_else(|e| e.into_inner()))
	}

	pub fn len(&self) -> usize {
		self.recorded.lock().unwrap_or_else(|e| e.into_inner()).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl ViolationHandler for RecordingViolationHandler {
	fn handle(&self, violation: &SecurityViolation) -> bool {
		self.recorded.lock().unwrap_or_else(|e| e.into_inner()).push(violation.clone());
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cas::error::ViolationReason;
	use crate::metadata::indices::metadata_token::MetadataToken;

	fn violation() -> SecurityViolation {
		SecurityViolation { member: MetadataToken::try_from(0x0600_0001).unwrap(), declaring_type: MetadataToken::try_from(0x0200_0001).unwrap(), reason: ViolationReason::NotInPolicy }
	}

	#[test]
	fn default_handler_always_denies() {
		assert!(!DefaultViolationHandler.handle(&violation()));
	}

	#[test]
	fn recording_handler_accumulates_and_drains() {
		let handler = RecordingViolationHandler::new();
		handler.handle(&violation());
		handler.handle(&violation());
		assert_eq!(handler.len(), 2);
		let drained = handler.drain();
		assert_eq!(drained.len(), 2);
		assert!(handler.is_empty());
	}
}
