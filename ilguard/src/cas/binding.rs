//! Accessibility-scoped selection of a type's members (§4.B): the unit a
//! [`CasPolicyBuilder`](crate::cas::policy::CasPolicyBuilder) allows in.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cas::error::BindingError;
use crate::cas::identity::{MemberId, ModuleId};
use crate::metadata::heaps::table::{FieldTable, MethodDefTable, MethodImplTable, TableRow, TypeDefTable, TypeRefTable};
use crate::metadata::indices::metadata_token::{FieldToken, MetadataToken, MethodDefToken};
use crate::metadata::Assembly;

/// The CLR's six-way member visibility collapsed to four levels (an
/// explicit judgment call, recorded in DESIGN.md): `Assembly`,
/// `FamAndAssem` and `FamOrAssem` all map to `Protected`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum Accessibility {
	None,
	Private,
	Protected,
	Public,
}

#[derive(Clone)]
enum Members {
	ByAccessibility(Accessibility),
	Explicit(MemberId),
}

/// A builder over one target type. Either enumerated in bulk at an
/// [`Accessibility`] level (the common case, fed to `allow`), or narrowed
/// with `with_constructor`/`with_field`/`with_method` to a single member.
#[derive(Clone)]
pub struct TypeBinding {
	assembly: Arc<Assembly>,
	module: ModuleId,
	type_row: usize,
	members: Members,
}

impl TypeBinding {
	pub fn new(assembly: Arc<Assembly>, module: ModuleId, type_row: usize, accessibility: Accessibility) -> Self {
		Self { assembly, module, type_row, members: Members::ByAccessibility(accessibility) }
	}

	fn type_name(&self) -> String {
		let Some(tables) = self.assembly.table_heap() else { return String::from("<unknown type>") };
		let Some(strings) = self.assembly.string_heap() else { return String::from("<unknown type>") };
		let Some(row) = tables.get_table::<TypeDefTable>().and_then(|t| t.row(self.type_row)) else {
			return String::from("<unknown type>");
		};
		let name = strings.get(row.type_name).unwrap_or("?");
		let ns = strings.get(row.type_namespace).unwrap_or("");
		match ns.is_empty() {
			true => name.to_string(),
			false => format!("{ns}.{name}"),
		}
	}

	/// The unique declared constructor (`.ctor`) of this type.
	pub fn with_constructor(self) -> Result<Self, BindingError> {
		self.with_method_named(".ctor")
	}

	pub fn with_field(self, name: &str) -> Result<Self, BindingError> {
		let Some(tables) = self.assembly.table_heap() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		let Some(strings) = self.assembly.string_heap() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		let Some(type_defs) = tables.get_table::<TypeDefTable>() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		let Some(fields) = tables.get_table::<FieldTable>() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};

		let range = type_defs.field_range(fields, self.type_row);
		let mut matches = range.filter(|&i| fields.row(i).map(|f| strings.get(f.name) == Some(name)).unwrap_or(false));

		let Some(first) = matches.next() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		if matches.next().is_some() {
			let count = 2 + matches.count();
			return Err(BindingError::Ambiguous { type_name: self.type_name(), member: name.into(), candidates: count });
		}

		let token: MetadataToken = FieldToken(first + 1).into();
		let member = MemberId::resolve(self.module, token, &self.assembly);
		Ok(Self { members: Members::Explicit(member), ..self })
	}

	/// Matches by name only; fails if more than one overload exists. Use
	/// [`with_method_signature`](Self::with_method_signature) to disambiguate
	/// overloads.
	pub fn with_method(self, name: &str) -> Result<Self, BindingError> {
		self.with_method_named(name)
	}

	/// Matches by name and a rendered parameter-type signature (e.g.
	/// `"(Int32,String)"`). Constructed generics compare by their open
	/// definition, so this is stable across instantiations.
	pub fn with_method_signature(self, name: &str, signature: &str) -> Result<Self, BindingError> {
		let Some(tables) = self.assembly.table_heap() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		let Some(strings) = self.assembly.string_heap() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		let Some(type_defs) = tables.get_table::<TypeDefTable>() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		let Some(methods) = tables.get_table::<MethodDefTable>() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};

		let range = type_defs.method_range(methods, self.type_row);
		let rendered = render_method_signature(&self.assembly, methods, &range.clone().collect::<Vec<_>>());
		let mut matches = range
			.filter(|&i| methods.row(i).map(|m| strings.get(m.name) == Some(name)).unwrap_or(false))
			.filter(|i| rendered.get(i).map(|s| s == signature).unwrap_or(false));

		let Some(first) = matches.next() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: format!("{name}{signature}") });
		};
		if matches.next().is_some() {
			return Err(BindingError::Ambiguous { type_name: self.type_name(), member: format!("{name}{signature}"), candidates: 2 });
		}

		let token: MetadataToken = MethodDefToken(first + 1).into();
		let member = MemberId::resolve(self.module, token, &self.assembly);
		Ok(Self { members: Members::Explicit(member), ..self })
	}

	fn with_method_named(self, name: &str) -> Result<Self, BindingError> {
		let Some(tables) = self.assembly.table_heap() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		let Some(strings) = self.assembly.string_heap() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		let Some(type_defs) = tables.get_table::<TypeDefTable>() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		let Some(methods) = tables.get_table::<MethodDefTable>() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};

		let range = type_defs.method_range(methods, self.type_row);
		let mut matches = range.filter(|&i| methods.row(i).map(|m| strings.get(m.name) == Some(name)).unwrap_or(false));

		let Some(first) = matches.next() else {
			return Err(BindingError::NotFound { type_name: self.type_name(), member: name.into() });
		};
		if matches.next().is_some() {
			let count = 2 + matches.count();
			return Err(BindingError::Ambiguous { type_name: self.type_name(), member: name.into(), candidates: count });
		}

		let token: MetadataToken = MethodDefToken(first + 1).into();
		let member = MemberId::resolve(self.module, token, &self.assembly);
		Ok(Self { members: Members::Explicit(member), ..self })
	}

	/// Enumerates the members this binding grants, per §4.B's rules.
	pub fn enumerate(&self) -> HashSet<MemberId> {
		let mut out = HashSet::new();
		match &self.members {
			Members::Explicit(m) => {
				out.insert(*m);
			},
			Members::ByAccessibility(level) => self.enumerate_at(self.type_row, *level, &mut out),
		}
		out
	}

	fn enumerate_at(&self, type_row: usize, level: Accessibility, out: &mut HashSet<MemberId>) {
		if level == Accessibility::None {
			return;
		}

		let Some(tables) = self.assembly.table_heap() else { return };
		let Some(type_defs) = tables.get_table::<TypeDefTable>() else { return };
		if type_defs.row(type_row).is_none() {
			return;
		}

		if let Some(fields) = tables.get_table::<FieldTable>() {
			for i in type_defs.field_range(fields, type_row) {
				let Some(field) = fields.row(i) else { continue };
				if field.flags.accessibility() <= level {
					let token: MetadataToken = FieldToken(i + 1).into();
					out.insert(MemberId::resolve(self.module, token, &self.assembly));
				}
			}
		}

		if let Some(methods) = tables.get_table::<MethodDefTable>() {
			let method_impls = tables.get_table::<MethodImplTable>();
			for i in type_defs.method_range(methods, type_row) {
				let Some(method) = methods.row(i) else { continue };
				let is_interface_target = method_impls
					.map(|impls| {
						impls.rows().iter().any(|r| {
							r.class.index() == Some(type_row)
								&& MetadataToken::from(r.body).kind() == crate::metadata::indices::metadata_token::MetadataTokenKind::MethodDef
								&& MetadataToken::from(r.body).index() == i + 1
						})
					})
					.unwrap_or(false);

				if is_interface_target || method.flags.accessibility() <= level {
					let token: MetadataToken = MethodDefToken(i + 1).into();
					out.insert(MemberId::resolve(self.module, token, &self.assembly));
				}
			}
		}

		let Some(nested) = tables.get_table::<crate::metadata::heaps::table::NestedClassTable>() else { return };
		for row in nested.rows() {
			let Some(enclosing) = row.enclosing_class.index() else { continue };
			if enclosing != type_row {
				continue;
			}
			let Some(nested_row) = row.nested_class.index() else { continue };
			let Some(nested_def) = type_defs.row(nested_row) else { continue };

			let declared = nested_def.flags.visibility();
			let effective = if declared < level && level != Accessibility::Private {
				match is_reference_type_like(&self.assembly, tables, nested_row) {
					true => level,
					false if declared >= level => level,
					false => Accessibility::None,
				}
			} else {
				level
			};

			self.enumerate_at(nested_row, effective, out);
		}
	}
}

fn is_reference_type_like(assembly: &Assembly, tables: &crate::metadata::heaps::table::TableHeap, type_row: usize) -> bool {
	use crate::metadata::heaps::table::{TypeAttributes, TypeDefTable};

	let Some(type_defs) = tables.get_table::<TypeDefTable>() else { return true };
	let Some(row) = type_defs.row(type_row) else { return true };

	if (row.flags & TypeAttributes::CLASS_SEMANTICS_MASK) == TypeAttributes::INTERFACE {
		return true;
	}

	let Some(strings) = assembly.string_heap() else { return true };
	let base_token: MetadataToken = row.extends.into();
	let (name, ns) = match base_token.kind() {
		crate::metadata::indices::metadata_token::MetadataTokenKind::TypeRef => {
			let Some(refs) = tables.get_table::<TypeRefTable>() else { return true };
			let Some(r) = refs.row(base_token.index().wrapping_sub(1)) else { return true };
			(strings.get(r.type_name).unwrap_or(""), strings.get(r.type_namespace).unwrap_or(""))
		},
		crate::metadata::indices::metadata_token::MetadataTokenKind::TypeDef => {
			let Some(r) = type_defs.row(base_token.index().wrapping_sub(1)) else { return true };
			(strings.get(r.type_name).unwrap_or(""), strings.get(r.type_namespace).unwrap_or(""))
		},
		_ => return true,
	};

	!(ns == "System" && matches!(name, "ValueType" | "Enum"))
}

/// Renders each method's parameter types into a `"(Ty1,Ty2)"` string for
/// signature-qualified lookup, with the declaring-type identity of closed
/// generics stripped so instantiated and open signatures compare equal.
///
/// `pub(crate)` because the late-binding resolver (§4.D) needs the same
/// rendering to match a candidate override's signature against the
/// declared method's.
pub(crate) fn render_method_signature(assembly: &Assembly, methods: &MethodDefTable, rows: &[usize]) -> std::collections::HashMap<usize, String> {
	use crate::metadata::il::{MethodSignature, TypeSignatureTag};

	let mut out = std::collections::HashMap::new();
	let Some(blobs) = assembly.blob_heap() else { return out };
	let Some(tables) = assembly.table_heap() else { return out };

	for &i in rows {
		let Some(method) = methods.row(i) else { continue };
		let Some(blob) = blobs.get(method.signature) else { continue };
		let mut cursor = std::io::Cursor::new(blob);
		let Ok(sig) = MethodSignature::read(&mut cursor, tables.sizes()) else { continue };

		let rendered = sig
			.parameter_types
			.signatures()
			.map(|tag| render_type_tag(&tag))
			.collect::<Vec<_>>()
			.join(",");
		out.insert(i, format!("({rendered})"));
	}
	out
}

pub(crate) fn render_type_tag(tag: &crate::metadata::il::TypeSignatureTag<'_>) -> String {
	use crate::metadata::il::TypeSignatureTag as T;
	match tag {
		T::Bool => "Boolean".into(),
		T::Char => "Char".into(),
		T::Int1 => "SByte".into(),
		T::UInt1 => "Byte".into(),
		T::Int2 => "Int16".into(),
		T::UInt2 => "UInt16".into(),
		T::Int4 => "Int32".into(),
		T::UInt4 => "UInt32".into(),
		T::Int8 => "Int64".into(),
		T::UInt8 => "UInt64".into(),
		T::Float => "Single".into(),
		T::Double => "Double".into(),
		T::String => "String".into(),
		T::Object => "Object".into(),
		T::IntPtr => "IntPtr".into(),
		T::UIntPtr => "UIntPtr".into(),
		T::Void => "Void".into(),
		T::Pointer(t) | T::SzArray(t) | T::Reference(t) | T::Pinned(t) => format!("{}*", render_type_tag(&t.as_tag())),
		T::GenericInst(inst) => format!("{}`{}", render_type_tag(&inst.ty().as_tag()), inst.params_count()),
		_ => "Object".into(),
	}
}

#[cfg(test)]
mod tests {
	use super::Accessibility;

	#[test]
	fn accessibility_is_totally_ordered() {
		assert!(Accessibility::None < Accessibility::Private);
		assert!(Accessibility::Private < Accessibility::Protected);
		assert!(Accessibility::Protected < Accessibility::Public);
	}
}
