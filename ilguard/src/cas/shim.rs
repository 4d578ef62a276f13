//! §4.C: the process-wide map from sensitive library methods to their safe
//! replacements. Built once at process start, then read-only — matching
//! §5's "shared resources" model.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::cas::identity::MemberId;

/// `SignatureHash` equality ignores the declaring-type identity of *closed*
/// generic instantiations but preserves the open generic shape — which is
/// exactly what [`MemberId::resolve`](crate::cas::identity::MemberId::resolve)
/// already collapses a `MethodSpec`/`MemberRef` token down to, so a shim
/// lookup is a plain `MemberId` key.
pub type SignatureHash = MemberId;

/// A safe replacement for an ambient-authority API, keyed by the original
/// method's [`SignatureHash`]. The rewriter substitutes calls to the
/// original with a call to `replacement`, re-attaching the call site's
/// original generic arguments (from both declaring type and method, in
/// their original order) around the swap.
#[derive(Debug, Copy, Clone)]
pub struct Shim {
	pub replacement: MemberId,
	/// `true` for a genuine safe passthrough (e.g. `Console.WriteLine`);
	/// `false` for an always-deny stub standing in for an API this sandbox
	/// refuses outright (e.g. `Marshal`/`GCHandle` entry points).
	pub always_deny: bool,
}

#[derive(Default)]
pub struct ShimTable {
	shims: HashMap<SignatureHash, Shim>,
}

impl ShimTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, original: SignatureHash, shim: Shim) {
		self.shims.insert(original, shim);
	}

	pub fn lookup(&self, original: &SignatureHash) -> Option<Shim> {
		self.shims.get(original).copied()
	}

	pub fn is_empty(&self) -> bool {
		self.shims.is_empty()
	}
}

/// Process-wide shim table, built lazily on first access. Hosts register
/// their own shims (e.g. for `File.WriteAllBytes`) by calling
/// [`register_builtin`] before the first [`Loader`](crate::cas::loader::Loader)
/// instruments a module; after that point the table is read-only in
/// practice even though nothing enforces it structurally, matching §5's
/// "built at process start, then read-only" resource model.
static SHIM_TABLE: OnceLock<std::sync::RwLock<ShimTable>> = OnceLock::new();

fn shim_table() -> &'static std::sync::RwLock<ShimTable> {
	SHIM_TABLE.get_or_init(|| std::sync::RwLock::new(ShimTable::new()))
}

pub fn register_shim(original: SignatureHash, shim: Shim) {
	shim_table().write().unwrap_or_else(|e| e.into_inner()).register(original, shim);
}

pub fn lookup_shim(original: &SignatureHash) -> Option<Shim> {
	shim_table().read().unwrap_or_else(|e| e.into_inner()).lookup(original)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cas::identity::ModuleId;
	use crate::metadata::indices::metadata_token::MetadataToken;

	#[test]
	fn unregistered_method_has_no_shim() {
		let m = ModuleId::next();
		let token = MemberId(m, MetadataToken::try_from(0x0600_0001).unwrap());
		assert!(lookup_shim(&token).is_none());
	}

	#[test]
	fn registered_shim_round_trips() {
		let m = ModuleId::next();
		let original = MemberId(m, MetadataToken::try_from(0x0600_00AA).unwrap());
		let replacement = MemberId(m, MetadataToken::try_from(0x0600_00BB).unwrap());
		register_shim(original, Shim { replacement, always_deny: false });
		let shim = lookup_shim(&original).expect("shim to be registered");
		assert_eq!(shim.replacement, replacement);
		assert!(!shim.always_deny);
	}
}
