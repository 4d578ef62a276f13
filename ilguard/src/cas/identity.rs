//! Stable, loader-independent identity for a field, method or constructor.
//!
//! A [`MemberId`] must be equal iff two handles name the same declaration in
//! the same module, and must collapse closed generic instantiations down to
//! their open definition — calls through `List<int>.Add` and
//! `List<string>.Add` test the same identity.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::metadata::heaps::table::{
	FieldTable, MemberRef, MemberRefTable, MethodDefTable, MethodSpecTable, TableHeap, TableRow, TypeDefTable, TypeSpecTable,
};
use crate::metadata::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::metadata::il::TypeSignatureTag;
use crate::metadata::Assembly;

/// A process-unique identifier minted when a module is loaded. Stands in
/// for "module identity" in a world without a live CLR module handle — see
/// the crate-level notes on the assembly→loader weak map.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ModuleId(u32);

static NEXT_MODULE_ID: AtomicU32 = AtomicU32::new(1);

impl ModuleId {
	pub fn next() -> Self {
		Self(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
	}
}

/// `(module, token)`, with the token always resolved to its definition row.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MemberId(pub ModuleId, pub MetadataToken);

impl MemberId {
	/// Builds the canonical identity of `token` as seen from `module`,
	/// collapsing `MethodSpec` rows (closed generic *method* instantiations)
	/// and `MemberRef`s into closed generic *types* (`TypeSpec` parents) down
	/// to the open-definition `MethodDef`/`Field` they ultimately name.
	///
	/// Disambiguation against the open type is by name only, not full
	/// signature equality: substituting generic arguments back out of an
	/// instantiated signature to compare it against the open definition's
	/// would need a full signature-unification pass. Overloaded generic
	/// methods that differ only by a type parameter could theoretically
	/// collide here; this is a deliberate scope cut, not an oversight.
	pub fn resolve(module: ModuleId, token: MetadataToken, assembly: &Assembly) -> Self {
		let Some(tables) = assembly.table_heap() else {
			return Self(module, token);
		};

		let resolved = resolve_to_definition(token, tables, assembly).unwrap_or(token);
		Self(module, resolved)
	}
}

fn resolve_to_definition(token: MetadataToken, tables: &TableHeap, assembly: &Assembly) -> Option<MetadataToken> {
	match token.kind() {
		MetadataTokenKind::MethodSpec => {
			let specs = tables.get_table::<MethodSpecTable>()?;
			let row = specs.row(token.index().checked_sub(1)?)?;
			let inner: MetadataToken = row.method.into();
			Some(resolve_to_definition(inner, tables, assembly).unwrap_or(inner))
		},
		MetadataTokenKind::MemberRef => {
			let refs = tables.get_table::<MemberRefTable>()?;
			let row = refs.row(token.index().checked_sub(1)?)?;
			resolve_member_ref_into_open_generic(row, tables, assembly)
		},
		_ => None,
	}
}

/// Resolves a `MemberRef` whose parent is a `TypeSpec` (i.e. a member
/// reached through a closed generic type, like `List<int>.Add`) to the
/// `MethodDef`/`Field` row of the same name on the open generic type
/// definition the `TypeSpec` instantiates.
fn resolve_member_ref_into_open_generic(member_ref: &MemberRef, tables: &TableHeap, assembly: &Assembly) -> Option<MetadataToken> {
	let parent: MetadataToken = member_ref.class.into();
	if parent.kind() != MetadataTokenKind::TypeSpec {
		return None;
	}

	let type_specs = tables.get_table::<TypeSpecTable>()?;
	let spec = type_specs.row(parent.index().checked_sub(1)?)?;
	let blob = assembly.blob_heap()?.get(spec.signature)?;

	let mut cursor = std::io::Cursor::new(blob);
	let tag = TypeSignatureTag::read(&mut cursor, tables.sizes()).ok()?;
	let TypeSignatureTag::GenericInst(inst) = tag else {
		return None;
	};

	let open_type = match inst.ty().as_tag() {
		TypeSignatureTag::ClassType(ty) | TypeSignatureTag::ValueType(ty) => ty,
		_ => return None,
	};

	let open_type_token: MetadataToken = open_type.into();
	if open_type_token.kind() != MetadataTokenKind::TypeDef {
		// Generic type defined in another module: the open definition lives
		// outside this assembly's own TypeDef table. Name-based lookup can't
		// reach it from here, so identity falls back to the MemberRef token.
		return None;
	}

	let type_defs = tables.get_table::<TypeDefTable>()?;
	let type_row = open_type_token.index() - 1;
	let name = assembly.string_heap()?.get(member_ref.name)?;

	if let Some(methods) = tables.get_table::<MethodDefTable>() {
		let range = type_defs.method_range(methods, type_row);
		for i in range {
			let Some(method) = methods.row(i) else { continue };
			if assembly.string_heap()?.get(method.name) == Some(name) {
				return Some(crate::metadata::indices::metadata_token::MethodDefToken(i + 1).into());
			}
		}
	}

	if let Some(fields) = tables.get_table::<FieldTable>() {
		let range = type_defs.field_range(fields, type_row);
		for i in range {
			let Some(field) = fields.row(i) else { continue };
			if assembly.string_heap()?.get(field.name) == Some(name) {
				return Some(crate::metadata::indices::metadata_token::FieldToken(i + 1).into());
			}
		}
	}

	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn module_ids_are_distinct() {
		let a = ModuleId::next();
		let b = ModuleId::next();
		assert_ne!(a, b);
	}

	#[test]
	fn member_id_equality_follows_module_and_token() {
		let m = ModuleId::next();
		let t = MetadataToken::try_from(0x0600_0001u32).unwrap();
		assert_eq!(MemberId(m, t), MemberId(m, t));
	}
}
