//! §4.D: the late-binding resolver. Maps a `(receiver, declared method)`
//! pair to the method that will *actually* execute, so policy checks run
//! against the implementation rather than the abstract declaration.
//!
//! Resolver output feeds the runtime call check (`cas::loader`); the
//! rewriter never calls this directly, since the rewriter only knows the
//! declared method at instrumentation time — the receiver isn't known
//! until the guard's slow path runs.

use std::sync::Arc;

use crate::cas::error::ViolationReason;
use crate::metadata::heaps::table::{MethodAttributes, MethodDefTable, TypeDefTable};
use crate::metadata::indices::coded_index::TypeDefOrRef;
use crate::metadata::indices::metadata_token::{MetadataToken, MetadataTokenKind, MethodDefToken};
use crate::metadata::Assembly;

/// The shape of a call's receiver, as observed at the guard's slow path.
/// `Null` is distinct from `Instance` because rule 1 (§4.D) treats a null
/// receiver specially regardless of what static type the call site names.
#[derive(Debug, Clone, Copy)]
pub enum Receiver {
	Null,
	/// An object whose runtime type is the `TypeDef` row at `type_row`.
	Instance { type_row: usize },
	/// A single-dimensional, zero-based array (`T[]`) — the one array shape
	/// rule 3's delegate-trick fallback covers.
	SzArray,
	/// Any other array rank/bound shape. Always rejected (fail-closed, per
	/// the Open Question in §9): widening this is future work, not a
	/// silent guess.
	OtherArray,
}

/// The declared call site: which method the IL names, and enough of its
/// metadata to decide virtuality and match overrides.
#[derive(Debug, Clone, Copy)]
pub struct DeclaredMethod {
	pub declaring_type: usize,
	pub method_row: usize,
}

/// The methods an `SzArray` receiver inherits from the runtime's built-in
/// array base (§4.D `[SUPPLEMENT]`): the fixed pseudo method table rule 3
/// resolves against instead of literally emitting a delegate.
const ARRAY_BASE_METHODS: &[&str] = &["Equals", "GetHashCode", "ToString", "Clone", "GetEnumerator"];

/// Maximum parameter count rule 3's delegate-trick fallback supports,
/// matching the Open Question's "more-than-14-parameter" cutoff.
const MAX_DELEGATE_PARAMS: usize = 14;

#[derive(Debug, Clone)]
pub enum ResolvedMethod {
	/// The declared method is final, non-virtual, or no override was found
	/// on the receiver's type — dispatch targets the declaration unchanged.
	Unchanged,
	/// Dispatch resolved to an override declared at this `TypeDef` row.
	Override { type_row: usize, method_row: usize },
	/// Rule 3: resolved against the built-in array pseudo method table.
	ArrayBase(&'static str),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResolveError {
	NullReceiver,
	UnsupportedDispatchShape,
}

impl From<ResolveError> for ViolationReason {
	fn from(value: ResolveError) -> Self {
		match value {
			ResolveError::NullReceiver => ViolationReason::NullReceiver,
			ResolveError::UnsupportedDispatchShape => ViolationReason::UnsupportedDispatchShape,
		}
	}
}

/// Resolves `declared` as actually dispatched on `receiver`, per §4.D rules
/// 1-4.
pub fn resolve(assembly: &Arc<Assembly>, receiver: Receiver, declared: DeclaredMethod) -> Result<ResolvedMethod, ResolveError> {
	let Some(tables) = assembly.table_heap() else { return Ok(ResolvedMethod::Unchanged) };
	let Some(methods) = tables.get_table::<MethodDefTable>() else { return Ok(ResolvedMethod::Unchanged) };
	let Some(method) = methods.row(declared.method_row) else { return Ok(ResolvedMethod::Unchanged) };
	let Some(strings) = assembly.string_heap() else { return Ok(ResolvedMethod::Unchanged) };
	let is_ctor = strings.get(method.name) == Some(".ctor");
	let is_static = method.flags.contains(MethodAttributes::STATIC);

	// Rule 1: null receiver + non-static, non-constructor call.
	if matches!(receiver, Receiver::Null) && !is_static && !is_ctor {
		return Err(ResolveError::NullReceiver);
	}

	// Rule 2: not virtual, or virtual-and-final, dispatches unchanged.
	let is_virtual = method.flags.is_virtual();
	let is_final = method.flags.contains(MethodAttributes::FINAL);
	if !is_virtual || is_final {
		return Ok(ResolvedMethod::Unchanged);
	}

	match receiver {
		Receiver::Null => Ok(ResolvedMethod::Unchanged),
		Receiver::OtherArray => Err(ResolveError::UnsupportedDispatchShape),
		Receiver::SzArray => resolve_array_base(assembly, methods, declared, strings),
		Receiver::Instance { type_row } => Ok(resolve_virtual(assembly, tables, methods, type_row, declared)),
	}
}

fn resolve_array_base(
	assembly: &Arc<Assembly>,
	methods: &MethodDefTable,
	declared: DeclaredMethod,
	strings: &crate::metadata::heaps::StringHeap,
) -> Result<ResolvedMethod, ResolveError> {
	let method = methods.row(declared.method_row).expect("validated by caller");
	let name = strings.get(method.name).unwrap_or("");

	let Some(tables) = assembly.table_heap() else { return Err(ResolveError::UnsupportedDispatchShape) };
	let Some(blobs) = assembly.blob_heap() else { return Err(ResolveError::UnsupportedDispatchShape) };
	let Ok(sig) = crate::metadata::il::MethodSignature::read(&mut std::io::Cursor::new(blobs.get(method.signature).unwrap_or(&[])), tables.sizes()) else {
		return Err(ResolveError::UnsupportedDispatchShape);
	};

	if sig.parameter_types.len() > MAX_DELEGATE_PARAMS {
		return Err(ResolveError::UnsupportedDispatchShape);
	}
	if sig.parameter_types.signatures().any(|t| matches!(t, crate::metadata::il::TypeSignatureTag::Reference(_))) {
		return Err(ResolveError::UnsupportedDispatchShape);
	}

	match ARRAY_BASE_METHODS.iter().find(|&&m| m == name) {
		Some(name) => Ok(ResolvedMethod::ArrayBase(name)),
		None => Err(ResolveError::UnsupportedDispatchShape),
	}
}

/// Walks from `type_row` up the single-inheritance chain towards
/// `declared`'s declaring type, returning the first (most-derived) override
/// found. If none is found before reaching the declaring type itself,
/// dispatch is unchanged — the receiver's type doesn't override this
/// virtual member.
///
/// Interface-declared methods are matched by name only (implicit interface
/// implementation, ECMA-335 §I.12.2); explicit overrides recorded in the
/// `MethodImpl` table take priority when present. Class virtual methods are
/// matched by name *and* rendered parameter signature, since overloads on
/// the same name are otherwise indistinguishable.
fn resolve_virtual(assembly: &Arc<Assembly>, tables: &crate::metadata::heaps::table::TableHeap, methods: &MethodDefTable, receiver_type: usize, declared: DeclaredMethod) -> ResolvedMethod {
	use crate::metadata::heaps::table::{MethodImplTable, TypeAttributes};

	let Some(type_defs) = tables.get_table::<TypeDefTable>() else { return ResolvedMethod::Unchanged };
	let Some(declaring_def) = type_defs.row(declared.declaring_type) else { return ResolvedMethod::Unchanged };
	let declaring_is_interface = (declaring_def.flags & TypeAttributes::CLASS_SEMANTICS_MASK) == TypeAttributes::INTERFACE;

	let declared_token: MetadataToken = MethodDefToken(declared.method_row + 1).into();

	if let Some(impls) = tables.get_table::<MethodImplTable>() {
		for row in impls.rows() {
			let Some(class) = row.class.index() else { continue };
			let decl_token: MetadataToken = row.declaration.into();
			if class == receiver_type && decl_token == declared_token {
				let body_token: MetadataToken = row.body.into();
				if body_token.kind() == MetadataTokenKind::MethodDef {
					return ResolvedMethod::Override { type_row: receiver_type, method_row: body_token.index() - 1 };
				}
			}
		}
	}

	if declaring_is_interface {
		return resolve_interface_implicit(assembly, tables, methods, receiver_type, declared);
	}

	let Some(strings) = assembly.string_heap() else { return ResolvedMethod::Unchanged };
	let Some(declared_row) = methods.row(declared.method_row) else { return ResolvedMethod::Unchanged };
	let declared_name = strings.get(declared_row.name).unwrap_or("");
	let declared_sig = single_signature(assembly, methods, declared.method_row);

	let mut current = receiver_type;
	loop {
		if current == declared.declaring_type {
			return ResolvedMethod::Unchanged;
		}

		let Some(def) = type_defs.row(current) else { return ResolvedMethod::Unchanged };
		for i in type_defs.method_range(methods, current) {
			let Some(m) = methods.row(i) else { continue };
			if !m.flags.is_virtual() {
				continue;
			}
			if strings.get(m.name) != Some(declared_name) {
				continue;
			}
			if single_signature(assembly, methods, i) == declared_sig {
				return ResolvedMethod::Override { type_row: current, method_row: i };
			}
		}

		let base: MetadataToken = def.extends.into();
		match base.kind() {
			MetadataTokenKind::TypeDef => current = base.index() - 1,
			// The base type lives outside this module's own TypeDef table
			// (TypeRef) or there is none (Object): nothing left to walk.
			_ => return ResolvedMethod::Unchanged,
		}
	}
}

fn resolve_interface_implicit(assembly: &Arc<Assembly>, tables: &crate::metadata::heaps::table::TableHeap, methods: &MethodDefTable, receiver_type: usize, declared: DeclaredMethod) -> ResolvedMethod {
	use crate::metadata::heaps::table::InterfaceImplTable;

	let Some(type_defs) = tables.get_table::<TypeDefTable>() else { return ResolvedMethod::Unchanged };
	let Some(strings) = assembly.string_heap() else { return ResolvedMethod::Unchanged };
	let Some(declared_row) = methods.row(declared.method_row) else { return ResolvedMethod::Unchanged };
	let declared_name = strings.get(declared_row.name).unwrap_or("");

	let Some(impls) = tables.get_table::<InterfaceImplTable>() else { return ResolvedMethod::Unchanged };
	let implements = impls.rows().iter().any(|r| {
		r.class.index() == Some(receiver_type) && {
			let iface: MetadataToken = r.interface.into();
			iface.kind() == MetadataTokenKind::TypeDef && iface.index() - 1 == declared.declaring_type
		}
	});
	if !implements {
		return ResolvedMethod::Unchanged;
	}

	let _ = type_defs; // receiver_type validity already implied by caller
	for i in type_defs.method_range(methods, receiver_type) {
		let Some(m) = methods.row(i) else { continue };
		if m.flags.accessibility() == crate::cas::binding::Accessibility::Public && strings.get(m.name) == Some(declared_name) {
			return ResolvedMethod::Override { type_row: receiver_type, method_row: i };
		}
	}

	ResolvedMethod::Unchanged
}

fn single_signature(assembly: &Assembly, methods: &MethodDefTable, row: usize) -> Option<String> {
	crate::cas::binding::render_method_signature(assembly, methods, &[row]).remove(&row)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_error_maps_to_violation_reason() {
		assert_eq!(ViolationReason::from(ResolveError::NullReceiver), ViolationReason::NullReceiver);
		assert_eq!(ViolationReason::from(ResolveError::UnsupportedDispatchShape), ViolationReason::UnsupportedDispatchShape);
	}
}
