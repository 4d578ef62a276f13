//! The `localloc` pattern verifier (§4.G "Instrumentation", local allocation
//! bullet). A stack allocation that escapes as a raw pointer would hand
//! sandboxed code a non-GC pointer, so the only shape this loader accepts is
//! the safe-span idiom: allocate, construct the length operand, and
//! immediately wrap both in a `Span<T>` whose element type is unmanaged.
//! Anything else fails instrumentation outright — this is a load-time
//! check, not a guard the rewriter can fall back to a slow path for.

use std::io::Cursor;

use crate::metadata::heaps::table::{FieldTable, MemberRefTable, TableHeap, TypeAttributes, TypeDefTable, TypeRefTable, TypeSpecTable};
use crate::metadata::il::{CompoundOpCode, MethodBody, OpCode, OpCodeIterator, TypeSignatureTag};
use crate::metadata::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::metadata::Assembly;

/// A `localloc` survives instrumentation iff it is immediately followed by
/// `<load length>; newobj Span<T>(void*, int)` with `T` unmanaged (§4.D.9).
/// Anything else is a load-time bad-image-format rejection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StackallocViolation {
	/// `localloc` wasn't immediately followed by a load-length instruction
	/// and a matching `newobj Span<T>`.
	NotTheSafePattern,
	/// The pattern matched, but `Span<T>`'s `T` isn't unmanaged.
	ManagedElementType,
}

impl StackallocViolation {
	pub fn reason(self) -> &'static str {
		match self {
			StackallocViolation::NotTheSafePattern => "localloc is only permitted as localloc; <load length>; newobj Span<T>(void*, int)",
			StackallocViolation::ManagedElementType => "Span<T> element type used with localloc must be unmanaged",
		}
	}
}

/// Scans every `localloc` in `body` and verifies it heads the safe pattern.
/// Returns the first violation found, if any; a clean method returns `Ok(())`.
pub fn verify(assembly: &Assembly, body: &MethodBody) -> Result<(), StackallocViolation> {
	let instructions: Vec<OpCode> = OpCodeIterator::new(body.code).filter_map(|(_, op)| op.ok()).collect();

	for (i, opcode) in instructions.iter().enumerate() {
		if !matches!(opcode, OpCode::compound(CompoundOpCode::localloc)) {
			continue;
		}

		let Some(load_length) = instructions.get(i + 1) else { return Err(StackallocViolation::NotTheSafePattern) };
		if !is_load_int_constant_or_local(load_length) {
			return Err(StackallocViolation::NotTheSafePattern);
		}

		let Some(OpCode::newobj(ctor_token)) = instructions.get(i + 2) else { return Err(StackallocViolation::NotTheSafePattern) };
		let element_type = span_element_type(assembly, *ctor_token).ok_or(StackallocViolation::NotTheSafePattern)?;
		if !is_unmanaged_tag(assembly, &element_type, 0) {
			return Err(StackallocViolation::ManagedElementType);
		}
	}

	Ok(())
}

fn is_load_int_constant_or_local(opcode: &OpCode) -> bool {
	matches!(
		opcode,
		OpCode::ldc_i4_m1
			| OpCode::ldc_i4_0 | OpCode::ldc_i4_1
			| OpCode::ldc_i4_2 | OpCode::ldc_i4_3
			| OpCode::ldc_i4_4 | OpCode::ldc_i4_5
			| OpCode::ldc_i4_6 | OpCode::ldc_i4_7
			| OpCode::ldc_i4_8 | OpCode::ldc_i4_s(_)
			| OpCode::ldc_i4(_) | OpCode::ldloc_0
			| OpCode::ldloc_1 | OpCode::ldloc_2
			| OpCode::ldloc_3 | OpCode::ldloc_s(_)
			| OpCode::compound(CompoundOpCode::ldloc(_))
	)
}

/// Resolves `ctor_token` (a `newobj` operand) to the single generic
/// argument of a `System.Span<T>` (or `System.ReadOnlySpan<T>`)
/// constructor call, or `None` if it doesn't name one. `pub(crate)` because
/// `cas::loader`'s instrumentation pass re-derives the same element type to
/// size the `CheckStackallocLength` guard it splices in.
pub(crate) fn span_element_type<'a>(assembly: &'a Assembly, ctor_token: MetadataToken) -> Option<TypeSignatureTag<'a>> {
	let tables = assembly.table_heap()?;
	if ctor_token.kind() != MetadataTokenKind::MemberRef {
		// A constructor on a closed generic type is always reached through
		// a MemberRef whose parent is the instantiating TypeSpec; a direct
		// MethodDef can't be Span<T>'s constructor from inside this module.
		return None;
	}

	let refs = tables.get_table::<MemberRefTable>()?;
	let member_ref = refs.row(ctor_token.index().checked_sub(1)?)?;
	if assembly.string_heap()?.get(member_ref.name) != Some(".ctor") {
		return None;
	}

	let parent: MetadataToken = member_ref.class.into();
	if parent.kind() != MetadataTokenKind::TypeSpec {
		return None;
	}

	let specs = tables.get_table::<TypeSpecTable>()?;
	let spec = specs.row(parent.index().checked_sub(1)?)?;
	let blob = assembly.blob_heap()?.get(spec.signature)?;

	let mut cursor = Cursor::new(blob);
	let tag = TypeSignatureTag::read(&mut cursor, tables.sizes()).ok()?;
	let TypeSignatureTag::GenericInst(inst) = tag else { return None };
	if inst.params_count() != 1 {
		return None;
	}

	let name = match inst.ty().as_tag() {
		TypeSignatureTag::ClassType(ty) | TypeSignatureTag::ValueType(ty) => ty,
		_ => return None,
	};
	if !names_span_type(assembly, name.into()) {
		return None;
	}

	inst.params().next()
}

fn names_span_type(assembly: &Assembly, token: MetadataToken) -> bool {
	let Some(tables) = assembly.table_heap() else { return false };
	let Some(strings) = assembly.string_heap() else { return false };

	match token.kind() {
		MetadataTokenKind::TypeRef => {
			let Some(refs) = tables.get_table::<TypeRefTable>() else { return false };
			let Some(row) = refs.row(token.index() - 1) else { return false };
			strings.get(row.type_namespace) == Some("System") && matches!(strings.get(row.type_name), Some("Span`1") | Some("ReadOnlySpan`1"))
		},
		MetadataTokenKind::TypeDef => {
			let Some(defs) = tables.get_table::<TypeDefTable>() else { return false };
			let Some(row) = defs.row(token.index() - 1) else { return false };
			strings.get(row.type_namespace) == Some("System") && matches!(strings.get(row.type_name), Some("Span`1") | Some("ReadOnlySpan`1"))
		},
		_ => false,
	}
}

const MAX_RECURSION: usize = 32;

/// ECMA-335 §I.8.2.3: a type satisfies the unmanaged constraint iff it
/// contains no references, recursively. Primitives, pointers and enums are
/// unmanaged by construction; a value type is unmanaged iff every instance
/// field it declares is.
fn is_unmanaged_tag(assembly: &Assembly, tag: &TypeSignatureTag, depth: usize) -> bool {
	if depth > MAX_RECURSION {
		// A real cyclic value-type layout is impossible (the verifier would
		// have already rejected it); treat runaway recursion as a failure
		// to prove unmanaged-ness rather than spinning forever.
		return false;
	}

	match tag {
		TypeSignatureTag::ValueType(type_ref) => {
			let token: MetadataToken = (*type_ref).into();
			is_unmanaged_value_type(assembly, token, depth)
		},
		other => other.is_unmanaged(),
	}
}

fn is_unmanaged_value_type(assembly: &Assembly, token: MetadataToken, depth: usize) -> bool {
	let Some(tables) = assembly.table_heap() else { return false };

	let type_row = match token.kind() {
		MetadataTokenKind::TypeDef => token.index() - 1,
		// A value type defined outside this module (TypeRef) can't have its
		// fields walked from here; the enum case still recognises it below
		// by whether it `extends` `System.Enum`.
		MetadataTokenKind::TypeRef => return false,
		_ => return false,
	};

	let Some(type_defs) = tables.get_table::<TypeDefTable>() else { return false };
	let Some(def) = type_defs.row(type_row) else { return false };
	if def.flags.contains(TypeAttributes::INTERFACE) {
		return false;
	}

	let extends: MetadataToken = def.extends.into();
	if extends.kind() == MetadataTokenKind::TypeRef {
		if let Some(refs) = tables.get_table::<TypeRefTable>() {
			if let Some(row) = refs.row(extends.index() - 1) {
				let Some(strings) = assembly.string_heap() else { return false };
				if strings.get(row.type_namespace) == Some("System") && strings.get(row.type_name) == Some("Enum") {
					return true;
				}
			}
		}
	}

	let Some(fields) = tables.get_table::<FieldTable>() else { return true };
	let Some(blobs) = assembly.blob_heap() else { return false };
	for i in type_defs.field_range(fields, type_row) {
		let Some(field) = fields.row(i) else { continue };
		if field.flags.contains(crate::metadata::heaps::table::FieldAttributes::STATIC) {
			continue;
		}
		let Some(blob) = blobs.get(field.signature) else { return false };
		let mut cursor = Cursor::new(blob);
		// FieldSig ::= FIELD CustomMod* Type (ECMA-335 §II.23.2.4); the
		// leading 0x06 tag is skipped the same way a local-var signature's
		// leading 0x07 is in `MethodBody::read`.
		if cursor.get_ref().first() != Some(&0x06) {
			return false;
		}
		cursor.set_position(1);
		let Ok(field_tag) = TypeSignatureTag::read(&mut cursor, tables.sizes()) else { return false };
		if !is_unmanaged_tag(assembly, &field_tag, depth + 1) {
			return false;
		}
	}

	true
}

/// Byte width of an unmanaged element type, for recomputing `length *
/// sizeof(T)` against the byte count `localloc` itself received (§4.I). Only
/// ever called on a tag `is_unmanaged_tag` already accepted during `verify`,
/// so every shape it needs to size is reachable; `None` only where the size
/// genuinely can't be read back out of the metadata (a value type defined in
/// another module, or a signature read failure), which `instrument_method`
/// treats as a reason to reject the method rather than guess a byte count.
pub(crate) fn element_size(assembly: &Assembly, tag: &TypeSignatureTag, depth: usize) -> Option<u32> {
	if depth > MAX_RECURSION {
		return None;
	}

	match tag {
		TypeSignatureTag::Bool | TypeSignatureTag::Int1 | TypeSignatureTag::UInt1 => Some(1),
		TypeSignatureTag::Char | TypeSignatureTag::Int2 | TypeSignatureTag::UInt2 => Some(2),
		TypeSignatureTag::Int4 | TypeSignatureTag::UInt4 | TypeSignatureTag::Float => Some(4),
		TypeSignatureTag::Int8 | TypeSignatureTag::UInt8 | TypeSignatureTag::Double => Some(8),
		TypeSignatureTag::IntPtr | TypeSignatureTag::UIntPtr | TypeSignatureTag::Pointer(_) => Some(8),
		TypeSignatureTag::ValueType(type_ref) => {
			let token: MetadataToken = (*type_ref).into();
			value_type_size(assembly, token, depth)
		},
		_ => None,
	}
}

fn value_type_size(assembly: &Assembly, token: MetadataToken, depth: usize) -> Option<u32> {
	let tables = assembly.table_heap()?;

	let type_row = match token.kind() {
		MetadataTokenKind::TypeDef => token.index() - 1,
		// A value type defined outside this module can't have its fields
		// walked from here, same limitation as `is_unmanaged_value_type`.
		_ => return None,
	};

	let type_defs = tables.get_table::<TypeDefTable>()?;
	let def = type_defs.row(type_row)?;

	let extends: MetadataToken = def.extends.into();
	if extends.kind() == MetadataTokenKind::TypeRef {
		if let Some(refs) = tables.get_table::<TypeRefTable>() {
			if let Some(row) = refs.row(extends.index() - 1) {
				let strings = assembly.string_heap()?;
				if strings.get(row.type_namespace) == Some("System") && strings.get(row.type_name) == Some("Enum") {
					return enum_underlying_size(assembly, tables, type_defs, type_row, depth);
				}
			}
		}
	}

	let fields = tables.get_table::<FieldTable>()?;
	let blobs = assembly.blob_heap()?;
	let mut total = 0u32;
	for i in type_defs.field_range(fields, type_row) {
		let Some(field) = fields.row(i) else { continue };
		if field.flags.contains(crate::metadata::heaps::table::FieldAttributes::STATIC) {
			continue;
		}
		let field_tag = read_field_tag(blobs, tables, field.signature)?;
		total += element_size(assembly, &field_tag, depth + 1)?;
	}
	Some(total)
}

fn enum_underlying_size(assembly: &Assembly, tables: &TableHeap, type_defs: &TypeDefTable, type_row: usize, depth: usize) -> Option<u32> {
	let fields = tables.get_table::<FieldTable>()?;
	let blobs = assembly.blob_heap()?;
	for i in type_defs.field_range(fields, type_row) {
		let Some(field) = fields.row(i) else { continue };
		if field.flags.contains(crate::metadata::heaps::table::FieldAttributes::STATIC) {
			continue;
		}
		// An enum's single instance field is its underlying integral type.
		let field_tag = read_field_tag(blobs, tables, field.signature)?;
		return element_size(assembly, &field_tag, depth + 1);
	}
	None
}

fn read_field_tag<'a>(
	blobs: &'a crate::metadata::heaps::BlobHeap, tables: &crate::metadata::heaps::table::TableHeap, signature: crate::metadata::heaps::BlobIndex,
) -> Option<TypeSignatureTag<'a>> {
	let blob = blobs.get(signature)?;
	let mut cursor = Cursor::new(blob);
	// FieldSig ::= FIELD CustomMod* Type, same leading-byte convention as
	// `is_unmanaged_value_type` skips below.
	if cursor.get_ref().first() != Some(&0x06) {
		return None;
	}
	cursor.set_position(1);
	TypeSignatureTag::read(&mut cursor, tables.sizes()).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn load_int_constant_forms_are_recognised() {
		assert!(is_load_int_constant_or_local(&OpCode::ldc_i4_4));
		assert!(is_load_int_constant_or_local(&OpCode::ldc_i4(4096)));
		assert!(is_load_int_constant_or_local(&OpCode::ldloc_0));
		assert!(!is_load_int_constant_or_local(&OpCode::dup));
	}

	#[test]
	fn violation_reasons_are_distinct() {
		assert_ne!(StackallocViolation::NotTheSafePattern.reason(), StackallocViolation::ManagedElementType.reason());
	}
}
