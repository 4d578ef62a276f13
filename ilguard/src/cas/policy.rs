//! §4.A: the compiled allow-list. A [`CasPolicy`] is an immutable value,
//! safe to share across loader instances and threads; [`CasPolicyBuilder`]
//! is the single-threaded construction side.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cas::binding::TypeBinding;
use crate::cas::identity::MemberId;

/// An immutable set of [`MemberId`]s. Cheap to clone (an `Arc` around the
/// set) so a loader can hand the same policy to every instrumented module.
#[derive(Debug, Clone)]
pub struct CasPolicy {
	members: Arc<HashSet<MemberId>>,
}

impl CasPolicy {
	pub fn contains_field(&self, field: &MemberId) -> bool {
		self.members.contains(field)
	}

	pub fn contains_method(&self, method: &MemberId) -> bool {
		self.members.contains(method)
	}

	pub fn len(&self) -> usize {
		self.members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.members.is_empty()
	}
}

/// Builds a [`CasPolicy`] by unioning [`TypeBinding`]s in, optionally seeded
/// from the curated default sandbox (§4.A's "universally safe
/// standard-library members").
#[derive(Default)]
pub struct CasPolicyBuilder {
	members: HashSet<MemberId>,
}

impl CasPolicyBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seeds the policy with [`default_sandbox_names`] resolved against
	/// `corelib`, the assembly the caller loaded the host's core library
	/// from. Silently skips any name the assembly doesn't actually declare —
	/// a mismatched corelib should not make policy construction fail, since
	/// the sandbox is a best-effort courtesy set, not a contract.
	pub fn with_default_sandbox(mut self, corelib: &Arc<crate::metadata::Assembly>, module: crate::cas::identity::ModuleId) -> Self {
		for seed in default_sandbox_seeds() {
			if let Ok(binding) = seed.resolve(corelib.clone(), module) {
				self.members.extend(binding.enumerate());
			}
		}
		self
	}

	pub fn allow(mut self, binding: TypeBinding) -> Self {
		self.members.extend(binding.enumerate());
		self
	}

	pub fn build(self) -> CasPolicy {
		CasPolicy { members: Arc::new(self.members) }
	}
}

/// One entry of the curated default-sandbox seed list (§4.A's
/// `[SUPPLEMENT]`): a type name plus the single member name to admit from
/// it. Resolved lazily against whatever corelib assembly the host provides,
/// since this crate has no compiled-in reference to a real `mscorlib`.
struct SandboxSeed {
	namespace: &'static str,
	type_name: &'static str,
	member: SandboxMember,
}

enum SandboxMember {
	Method(&'static str),
	Field(&'static str),
}

impl SandboxSeed {
	fn resolve(&self, assembly: Arc<crate::metadata::Assembly>, module: crate::cas::identity::ModuleId) -> Result<TypeBinding, crate::cas::error::BindingError> {
		let type_row = find_type(&assembly, self.namespace, self.type_name).ok_or_else(|| crate::cas::error::BindingError::NotFound {
			type_name: format!("{}.{}", self.namespace, self.type_name),
			member: self.member_name().to_string(),
		})?;

		let binding = TypeBinding::new(assembly, module, type_row, crate::cas::binding::Accessibility::None);
		match self.member {
			SandboxMember::Method(name) => binding.with_method(name),
			SandboxMember::Field(name) => binding.with_field(name),
		}
	}

	fn member_name(&self) -> &'static str {
		match self.member {
			SandboxMember::Method(name) => name,
			SandboxMember::Field(name) => name,
		}
	}
}

fn find_type(assembly: &crate::metadata::Assembly, namespace: &str, name: &str) -> Option<usize> {
	use crate::metadata::heaps::table::TypeDefTable;

	let tables = assembly.table_heap()?;
	let strings = assembly.string_heap()?;
	let type_defs = tables.get_table::<TypeDefTable>()?;

	(0..type_defs.len()).find(|&i| {
		let Some(row) = type_defs.row(i) else { return false };
		strings.get(row.type_name) == Some(name) && strings.get(row.type_namespace) == Some(namespace)
	})
}

/// The historical .NET CAS "default sandbox": read-only surface of the
/// primitive value types plus `Object`'s identity members. Everything here
/// is side-effect free and cannot be used to escape the sandbox.
const fn default_sandbox_seeds() -> [SandboxSeed; 9] {
	[
		SandboxSeed { namespace: "System", type_name: "Object", member: SandboxMember::Method("ToString") },
		SandboxSeed { namespace: "System", type_name: "Object", member: SandboxMember::Method("Equals") },
		SandboxSeed { namespace: "System", type_name: "Object", member: SandboxMember::Method("GetHashCode") },
		SandboxSeed { namespace: "System", type_name: "String", member: SandboxMember::Method("get_Length") },
		SandboxSeed { namespace: "System", type_name: "String", member: SandboxMember::Method("Substring") },
		SandboxSeed { namespace: "System", type_name: "String", member: SandboxMember::Method("Concat") },
		SandboxSeed { namespace: "System", type_name: "Math", member: SandboxMember::Method("Abs") },
		SandboxSeed { namespace: "System", type_name: "Math", member: SandboxMember::Method("Max") },
		SandboxSeed { namespace: "System", type_name: "Array", member: SandboxMember::Method("get_Length") },
	]
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cas::identity::ModuleId;

	#[test]
	fn empty_policy_denies_everything() {
		let policy = CasPolicyBuilder::new().build();
		assert!(policy.is_empty());
		let fake = MemberId(ModuleId::next(), crate::metadata::indices::metadata_token::MetadataToken::try_from(0x0400_0001).unwrap());
		assert!(!policy.contains_field(&fake));
	}

	#[test]
	fn allow_inserts_explicit_member() {
		let m = ModuleId::next();
		let field = MemberId(m, crate::metadata::indices::metadata_token::MetadataToken::try_from(0x0400_0001).unwrap());
		let mut members = HashSet::new();
		members.insert(field);
		let policy = CasPolicy { members: Arc::new(members) };
		assert!(policy.contains_field(&field));
	}
}
