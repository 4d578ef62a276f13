//! §4.F: the per-type guard cache. Every call site the rewriter touches
//! gets one memoised boolean — "is this target always allowed, regardless
//! of receiver" — so the injected prologue is a single load-and-branch on
//! the fast path.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::cas::identity::MemberId;

/// A call-site target identity: the member a guard was emitted for, plus
/// whether it's a field access or a call/newobj — two call sites naming the
/// same member through different opcode kinds get distinct cache slots,
/// since "is this field always accessible" and "is this constructor always
/// callable" are different predicates even when the token coincides (which
/// it structurally can't, but the distinction documents intent).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CallSiteKind {
	Field,
	Call,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CallSiteId {
	pub member: MemberId,
	pub kind: CallSiteKind,
}

/// The generated nested holder type (spec: `<Type>+<CasGuard{id}>`) for one
/// instrumented type: one [`OnceLock<bool>`] per distinct call-site target,
/// mirroring "a static constructor that runs exactly once under the VM's
/// type-init lock" with Rust's own one-shot primitive.
#[derive(Default)]
pub struct GuardHolder {
	fields: Mutex<HashMap<CallSiteId, &'static OnceLock<bool>>>,
}

impl GuardHolder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the cache field for `site`, allocating one (leaked, since a
	/// guard holder lives for the process — matching a static field's
	/// lifetime) on first ask. Memoised: repeated asks for the same site
	/// during rewriting return the same field, per §4.F.
	pub fn cache_field_for(&self, site: CallSiteId) -> &'static OnceLock<bool> {
		let mut fields = self.fields.lock().unwrap_or_else(|e| e.into_inner());
		*fields.entry(site).or_insert_with(|| Box::leak(Box::new(OnceLock::new())))
	}

	/// Reads (initialising on first use via `init`) the cache field for
	/// `site`. `init` is only ever invoked once per site across the life of
	/// this holder — the `OnceLock` publishes through the VM's type-init
	/// fence's Rust analogue.
	pub fn is_always_allowed(&self, site: CallSiteId, init: impl FnOnce() -> bool) -> bool {
		*self.cache_field_for(site).get_or_init(init)
	}

	pub fn site_count(&self) -> usize {
		self.fields.lock().unwrap_or_else(|e| e.into_inner()).len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cas::identity::ModuleId;
	use crate::metadata::indices::metadata_token::MetadataToken;

	fn site(n: u32) -> CallSiteId {
		let m = ModuleId::next();
		CallSiteId { member: MemberId(m, MetadataToken::try_from(0x0600_0000 | n).unwrap()), kind: CallSiteKind::Call }
	}

	#[test]
	fn initializer_runs_exactly_once() {
		let holder = GuardHolder::new();
		let site = site(1);
		let mut calls = 0;
		for _ in 0..5 {
			holder.is_always_allowed(site, || {
				calls += 1;
				true
			});
		}
		assert_eq!(calls, 1);
	}

	#[test]
	fn distinct_sites_get_distinct_fields() {
		let holder = GuardHolder::new();
		let a = site(1);
		let b = site(2);
		assert!(!std::ptr::eq(holder.cache_field_for(a), holder.cache_field_for(b)));
		assert_eq!(holder.site_count(), 2);
	}

	#[test]
	fn repeated_lookup_is_memoised() {
		let holder = GuardHolder::new();
		let a = site(1);
		assert!(std::ptr::eq(holder.cache_field_for(a), holder.cache_field_for(a)));
	}
}
