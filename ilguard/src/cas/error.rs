//! The four error kinds the loader and policy builder surface: load-time
//! rejection, runtime policy violation, binding configuration errors, and
//! internal invariant failures.

use std::fmt::{Display, Formatter};

use crate::metadata::indices::metadata_token::MetadataToken;

#[derive(Debug)]
pub enum LoadError {
	Io(std::io::Error),
	NotManaged,
	UnmanagedLibrary,
	UnsupportedStackalloc { method: MetadataToken, reason: &'static str },
	AlreadyInstrumented,
	Metadata(String),
}

impl Display for LoadError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			LoadError::Io(e) => write!(f, "failed to read module: {e}"),
			LoadError::NotManaged => write!(f, "not a managed assembly"),
			LoadError::UnmanagedLibrary => write!(f, "loading unmanaged libraries into a sandboxed context is refused"),
			LoadError::UnsupportedStackalloc { method, reason } => {
				write!(f, "bad image format in {method:?}: {reason}")
			},
			LoadError::AlreadyInstrumented => write!(f, "module already carries the verifier prelude"),
			LoadError::Metadata(msg) => write!(f, "malformed metadata: {msg}"),
		}
	}
}

impl std::error::Error for LoadError {}

impl From<std::io::Error> for LoadError {
	fn from(e: std::io::Error) -> Self {
		LoadError::Io(e)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ViolationReason {
	NotInPolicy,
	NullReceiver,
	UnsupportedDispatchShape,
}

impl Display for ViolationReason {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			ViolationReason::NotInPolicy => write!(f, "member is not in the sandbox's policy"),
			ViolationReason::NullReceiver => write!(f, "dispatch on a null receiver"),
			ViolationReason::UnsupportedDispatchShape => write!(f, "dispatch shape not supported by the late-binding resolver"),
		}
	}
}

/// Raised (by default, aborting the sandboxed call) when a guard denies
/// access. Carries enough context for a [`ViolationHandler`](crate::cas::violation::ViolationHandler)
/// to log or record the offending member.
#[derive(Debug, Clone)]
pub struct SecurityViolation {
	pub member: MetadataToken,
	pub declaring_type: MetadataToken,
	pub reason: ViolationReason,
}

impl Display for SecurityViolation {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "access to {:?} on {:?} denied: {}", self.member, self.declaring_type, self.reason)
	}
}

impl std::error::Error for SecurityViolation {}

#[derive(Debug)]
pub enum BindingError {
	NotFound { type_name: String, member: String },
	Ambiguous { type_name: String, member: String, candidates: usize },
}

impl Display for BindingError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			BindingError::NotFound { type_name, member } => write!(f, "{type_name} has no member matching `{member}`"),
			BindingError::Ambiguous { type_name, member, candidates } => {
				write!(f, "{type_name} has {candidates} members matching `{member}`, expected exactly one")
			},
		}
	}
}

impl std::error::Error for BindingError {}

/// A host bug, not a policy decision: a running frame names a module that
/// was registered with a loader but whose loader has since been dropped
/// out from under it. Distinct from [`SecurityViolation`] because the
/// load-boundary rule (§7) treats a module that was *never* registered as
/// fully trusted — this variant is for the module that *was* registered,
/// where the registry entry and the loader it points to disagreeing is
/// only possible if the host drops every handle to a `Loader` while a
/// `ModuleHandle` it produced (and the sandboxed code running under it) is
/// still alive.
#[derive(Debug)]
pub struct InvalidStateError(pub String);

impl Display for InvalidStateError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "invalid internal state: {}", self.0)
	}
}

impl std::error::Error for InvalidStateError {}

/// What a guard's runtime entry point can fail with: a policy denial, or the
/// kind-4 internal invariant failure described on [`InvalidStateError`].
/// Kept distinct from [`SecurityViolation`] itself so a host can match on
/// which happened rather than guess from a string.
#[derive(Debug)]
pub enum GuardError {
	Violation(SecurityViolation),
	InvalidState(InvalidStateError),
}

impl Display for GuardError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			GuardError::Violation(v) => Display::fmt(v, f),
			GuardError::InvalidState(e) => Display::fmt(e, f),
		}
	}
}

impl std::error::Error for GuardError {}

impl From<SecurityViolation> for GuardError {
	fn from(v: SecurityViolation) -> Self {
		GuardError::Violation(v)
	}
}

impl From<InvalidStateError> for GuardError {
	fn from(e: InvalidStateError) -> Self {
		GuardError::InvalidState(e)
	}
}
