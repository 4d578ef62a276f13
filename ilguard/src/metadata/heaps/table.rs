use std::any::TypeId;
use std::fmt::Debug;
use std::io::{Cursor, Error, ErrorKind, Read};
use std::sync::Arc;

use bitflags::bitflags;
use owning_ref::ArcRef;

use ilguard_derive::{FromRepr, Table};

use crate::metadata::heaps::{BlobIndex, GuidIndex, StringIndex};
use crate::metadata::indices::coded_index::{
	CustomAttributeType, HasConstant, HasCustomAttribute, HasFieldMarshal, HasSemantics, Implementation,
	MemberForwarded, MemberRefParent, MethodDefOrRef, TypeDefOrRef, TypeOrMethodDef,
};
use crate::metadata::indices::row_index::RowIndex;
use crate::metadata::indices::sizes::*;
use crate::utilities::{enumerate_set_bits, impl_from_byte_stream, FromByteStream};

#[derive(Debug)]
pub struct TableHeap {
	major_version: u8,
	minor_version: u8,
	tables: Vec<Arc<dyn Table>>,
	sizes: Arc<IndexSizes>,
}

impl TableHeap {
	pub fn minor_version(&self) -> u8 {
		self.minor_version
	}
	pub fn major_version(&self) -> u8 {
		self.major_version
	}
	/// Index widths computed from this heap's `#~` stream header, retained so
	/// that signature blobs (local variables, generic instantiations) can be
	/// parsed after the initial table read.
	pub fn sizes(&self) -> &Arc<IndexSizes> {
		&self.sizes
	}
	pub fn get_table<T: Table + 'static>(&self) -> Option<&T> {
		for table in &self.tables {
			if Table::type_id(table.as_ref()) == TypeId::of::<T>() {
				let table = table.as_ref() as *const dyn Table as *const T;
				return Some(unsafe { &*table });
			}
		}
		None
	}

	/// Assembles a table heap from already-built tables, bypassing the `#~`
	/// stream byte format entirely — for constructing fixture assemblies out
	/// of table rows built directly in Rust.
	pub fn from_tables(major_version: u8, minor_version: u8, tables: Vec<Arc<dyn Table>>, sizes: Arc<IndexSizes>) -> Self {
		Self { major_version, minor_version, tables, sizes }
	}
}

impl TryFrom<ArcRef<[u8]>> for TableHeap {
	type Error = Error;
	fn try_from(value: ArcRef<[u8]>) -> Result<Self, Self::Error> {
		#[repr(C)]
		#[derive(Copy, Clone)]
		struct Header {
			reserved_0: u32,
			major_version: u8,
			minor_version: u8,
			heap_sizes: u8,
			reserved_1: u8,
			valid: u64,
			sorted: u64,
		}

		impl_from_byte_stream!(Header);

		let mut stream = Cursor::new(value.as_ref());
		let Header { heap_sizes, valid, minor_version, major_version, .. } = Header::read(&mut stream, &())?;

		let table_count = valid.count_ones() as usize;
		let mut table_lens = [0u32; TABLE_KIND_COUNT];

		for i in enumerate_set_bits(valid) {
			if i >= TABLE_KIND_COUNT {
				return Err(ErrorKind::InvalidData.into());
			}
			let mut bytes = [0u8; 4];
			stream.read_exact(&mut bytes)?;
			table_lens[i] = u32::from_le_bytes(bytes);
		}

		let sizes = Arc::new(IndexSizes::new(heap_sizes, &table_lens));

		let mut tables: Vec<Arc<dyn Table>> = Vec::with_capacity(table_count);
		for i in enumerate_set_bits(valid) {
			let len = table_lens[i] as usize;
			let Some(kind) = TableKind::from_repr(i) else {
				return Err(ErrorKind::InvalidData.into());
			};

			tables.push(match kind {
				TableKind::Module => Arc::new(ModuleTable::read(&mut stream, &sizes, len)?),
				TableKind::TypeRef => Arc::new(TypeRefTable::read(&mut stream, &sizes, len)?),
				TableKind::TypeDef => Arc::new(TypeDefTable::read(&mut stream, &sizes, len)?),
				TableKind::Field => Arc::new(FieldTable::read(&mut stream, &sizes, len)?),
				TableKind::MethodDef => Arc::new(MethodDefTable::read(&mut stream, &sizes, len)?),
				TableKind::Param => Arc::new(ParamTable::read(&mut stream, &sizes, len)?),
				TableKind::InterfaceImpl => Arc::new(InterfaceImplTable::read(&mut stream, &sizes, len)?),
				TableKind::MemberRef => Arc::new(MemberRefTable::read(&mut stream, &sizes, len)?),
				TableKind::Constant => Arc::new(ConstantTable::read(&mut stream, &sizes, len)?),
				TableKind::CustomAttribute => Arc::new(CustomAttributeTable::read(&mut stream, &sizes, len)?),
				TableKind::FieldMarshal => Arc::new(FieldMarshalTable::read(&mut stream, &sizes, len)?),
				TableKind::ClassLayout => Arc::new(ClassLayoutTable::read(&mut stream, &sizes, len)?),
				TableKind::FieldLayout => Arc::new(FieldLayoutTable::read(&mut stream, &sizes, len)?),
				TableKind::StandAloneSig => Arc::new(StandAloneSigTable::read(&mut stream, &sizes, len)?),
				TableKind::EventMap => Arc::new(EventMapTable::read(&mut stream, &sizes, len)?),
				TableKind::Event => Arc::new(EventTable::read(&mut stream, &sizes, len)?),
				TableKind::PropertyMap => Arc::new(PropertyMapTable::read(&mut stream, &sizes, len)?),
				TableKind::Property => Arc::new(PropertyTable::read(&mut stream, &sizes, len)?),
				TableKind::MethodSemantics => Arc::new(MethodSemanticsTable::read(&mut stream, &sizes, len)?),
				TableKind::MethodImpl => Arc::new(MethodImplTable::read(&mut stream, &sizes, len)?),
				TableKind::ModuleRef => Arc::new(ModuleRefTable::read(&mut stream, &sizes, len)?),
				TableKind::TypeSpec => Arc::new(TypeSpecTable::read(&mut stream, &sizes, len)?),
				TableKind::ImplMap => Arc::new(ImplMapTable::read(&mut stream, &sizes, len)?),
				TableKind::FieldRVA => Arc::new(FieldRVATable::read(&mut stream, &sizes, len)?),
				TableKind::Assembly => Arc::new(AssemblyTable::read(&mut stream, &sizes, len)?),
				TableKind::AssemblyRef => Arc::new(AssemblyRefTable::read(&mut stream, &sizes, len)?),
				TableKind::File => Arc::new(FileTable::read(&mut stream, &sizes, len)?),
				TableKind::ExportedType => Arc::new(ExportedTypeTable::read(&mut stream, &sizes, len)?),
				TableKind::ManifestResource => Arc::new(ManifestResourceTable::read(&mut stream, &sizes, len)?),
				TableKind::NestedClass => Arc::new(NestedClassTable::read(&mut stream, &sizes, len)?),
				TableKind::GenericParam => Arc::new(GenericParamTable::read(&mut stream, &sizes, len)?),
				TableKind::MethodSpec => Arc::new(MethodSpecTable::read(&mut stream, &sizes, len)?),
				TableKind::GenericParamConstraint => Arc::new(GenericParamConstraintTable::read(&mut stream, &sizes, len)?),
				// Pointer tables and the portable PDB / EnC tables are not
				// part of the member graph CAS policy reasons over.
				kind => return Err(Error::new(ErrorKind::InvalidData, format!("unsupported table kind {kind:?}"))),
			});
		}

		Ok(Self { major_version, minor_version, tables })
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromRepr)]
pub enum TableKind {
	Module = 0x00,
	TypeRef = 0x01,
	TypeDef = 0x02,
	FieldPtr = 0x03,
	Field = 0x04,
	MethodPtr = 0x05,
	MethodDef = 0x06,
	ParamPtr = 0x07,
	Param = 0x08,
	InterfaceImpl = 0x09,
	MemberRef = 0x0a,
	Constant = 0x0b,
	CustomAttribute = 0x0c,
	FieldMarshal = 0x0d,
	DeclSecurity = 0x0e,
	ClassLayout = 0x0f,
	FieldLayout = 0x10,
	StandAloneSig = 0x11,
	EventMap = 0x12,
	EventPtr = 0x13,
	Event = 0x14,
	PropertyMap = 0x15,
	PropertyPtr = 0x16,
	Property = 0x17,
	MethodSemantics = 0x18,
	MethodImpl = 0x19,
	ModuleRef = 0x1a,
	TypeSpec = 0x1b,
	ImplMap = 0x1c,
	FieldRVA = 0x1d,
	EncLog = 0x1e,
	EncMap = 0x1f,
	Assembly = 0x20,
	AssemblyProcessor = 0x21,
	AssemblyOS = 0x22,
	AssemblyRef = 0x23,
	AssemblyRefProcessor = 0x24,
	AssemblyRefOS = 0x25,
	File = 0x26,
	ExportedType = 0x27,
	ManifestResource = 0x28,
	NestedClass = 0x29,
	GenericParam = 0x2a,
	MethodSpec = 0x2b,
	GenericParamConstraint = 0x2c,

	Document = 0x30,
	MethodDebugInformation = 0x31,
	LocalScope = 0x32,
	LocalVariable = 0x33,
	LocalConstant = 0x34,
	ImportScope = 0x35,
	StateMachineMethod = 0x36,
	CustomDebugInformation = 0x37,
}

#[allow(clippy::len_without_is_empty)]
pub trait Table: 'static + Debug + Send + Sync {
	fn len(&self) -> usize;
	fn kind(&self) -> TableKind;
	fn type_id(&self) -> TypeId {
		TypeId::of::<Self>()
	}
}

/// A row type that backs exactly one `#~` table, giving
/// [`RowIndex`](crate::metadata::indices::RowIndex) enough information to
/// size its own on-disk index.
pub trait TableRow: 'static + Sized {
	const KIND: TableKind;
	type Table: Table;
}

#[derive(Debug, Clone, Table)]
pub struct Module {
	pub generation: u16,
	pub name: StringIndex,
	pub mv_id: GuidIndex,
	pub enc_id: GuidIndex,
	pub enc_base_id: GuidIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct TypeAttributes: u32 {
		const VISIBILITY_MASK = 0x0000_0007;
		const NOT_PUBLIC = 0x0000_0000;
		const PUBLIC = 0x0000_0001;
		const NESTED_PUBLIC = 0x0000_0002;
		const NESTED_PRIVATE = 0x0000_0003;
		const NESTED_FAMILY = 0x0000_0004;
		const NESTED_ASSEMBLY = 0x0000_0005;
		const NESTED_FAMILY_AND_ASSEMBLY = 0x0000_0006;
		const NESTED_FAMILY_OR_ASSEMBLY = 0x0000_0007;

		const LAYOUT_MASK = 0x0000_0018;
		const AUTO_LAYOUT = 0x0000_0000;
		const SEQUENTIAL_LAYOUT = 0x0000_0008;
		const EXPLICIT_LAYOUT = 0x0000_0010;

		const CLASS_SEMANTICS_MASK = 0x0000_0020;
		const CLASS = 0x0000_0000;
		const INTERFACE = 0x0000_0020;

		const ABSTRACT = 0x0000_0080;
		const SEALED = 0x0000_0100;
		const SPECIAL_NAME = 0x0000_0400;

		const IMPORTED = 0x0000_1000;
		const SERIALIZABLE = 0x0000_2000;

		const STRING_FORMAT_MASK = 0x0003_0000;
		const ANSI_CLASS = 0x0000_0000;
		const UNICODE_CLASS = 0x0001_0000;
		const AUTO_CLASS = 0x0002_0000;
		const CUSTOM_FORMAT_CLASS = 0x0003_0000;
		const CUSTOM_STRING_FORMAT_MASK = 0x00C0_0000;

		const BEFORE_FIELD_INIT = 0x0010_0000;

		const RT_SPECIAL_NAME = 0x0000_0800;
		const HAS_SECURITY = 0x0004_0000;
		const IS_TYPE_FORWARDER = 0x0020_0000;
	}
}

impl_from_byte_stream!(TypeAttributes);

impl TypeAttributes {
	pub fn visibility(&self) -> crate::cas::binding::Accessibility {
		use crate::cas::binding::Accessibility;
		match (*self & Self::VISIBILITY_MASK).bits() {
			0x1 | 0x2 => Accessibility::Public,
			0x3 => Accessibility::Private,
			0x4 | 0x6 | 0x7 => Accessibility::Protected,
			0x5 => Accessibility::Protected,
			_ => Accessibility::None,
		}
	}
}

#[derive(Debug, Clone, Table)]
pub struct TypeDef {
	pub flags: TypeAttributes,
	pub type_name: StringIndex,
	pub type_namespace: StringIndex,
	pub extends: TypeDefOrRef,
	pub field_list: RowIndex<Field>,
	pub method_list: RowIndex<MethodDef>,
}

impl TypeDefTable {
	/// The rows of `fields` declared by the type at `row`, computed from the
	/// half-open range between its `field_list` and the next type's.
	pub fn field_range(&self, fields: &FieldTable, row: usize) -> std::ops::Range<usize> {
		let start = self.row(row).and_then(|r| r.field_list.index()).unwrap_or(0);
		let end = self.row(row + 1).and_then(|r| r.field_list.index()).unwrap_or_else(|| fields.len());
		start..end
	}

	/// The rows of `methods` declared by the type at `row`, by the same
	/// range convention as [`field_range`](Self::field_range).
	pub fn method_range(&self, methods: &MethodDefTable, row: usize) -> std::ops::Range<usize> {
		let start = self.row(row).and_then(|r| r.method_list.index()).unwrap_or(0);
		let end = self.row(row + 1).and_then(|r| r.method_list.index()).unwrap_or_else(|| methods.len());
		start..end
	}
}

#[derive(Debug, Clone, Table)]
pub struct TypeRef {
	pub resolution_scope: crate::metadata::indices::coded_index::ResolutionScope,
	pub type_name: StringIndex,
	pub type_namespace: StringIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct FieldAttributes: u16 {
		const FIELD_ACCESS_MASK = 0x0007;
		const COMPILER_CONTROLLED = 0x0000;
		const PRIVATE = 0x0001;
		const FAMILY_AND_ASSEMBLY = 0x0002;
		const ASSEMBLY = 0x0003;
		const FAMILY = 0x0004;
		const FAMILY_OR_ASSEMBLY = 0x0005;
		const PUBLIC = 0x0006;
		const STATIC = 0x0010;
		const INIT_ONLY = 0x0020;
		const LITERAL = 0x0040;
		const NOT_SERIALIZED = 0x0080;
		const SPECIAL_NAME = 0x0200;

		const PINVOKE_IMPL = 0x2000;

		const RT_SPECIAL_NAME = 0x0400;
		const HAS_FIELD_MARSHAL = 0x1000;
		const HAS_DEFAULT = 0x8000;
		const HAS_FIELD_RVA = 0x0100;
	}
}

impl_from_byte_stream!(FieldAttributes);

impl FieldAttributes {
	pub fn accessibility(&self) -> crate::cas::binding::Accessibility {
		use crate::cas::binding::Accessibility;
		match (*self & Self::FIELD_ACCESS_MASK).bits() {
			0x6 => Accessibility::Public,
			0x1 | 0x0 => Accessibility::Private,
			0x2 | 0x3 | 0x4 | 0x5 => Accessibility::Protected,
			_ => Accessibility::None,
		}
	}
}

#[derive(Debug, Clone, Table)]
pub struct Field {
	pub flags: FieldAttributes,
	pub name: StringIndex,
	pub signature: BlobIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodAttributes: u16 {
		const MEMBER_ACCESS_MASK = 0x0007;
		const COMPILER_CONTROLLED = 0x0000;
		const PRIVATE = 0x0001;
		const FAMILY_AND_ASSEMBLY = 0x0002;
		const ASSEMBLY = 0x0003;
		const FAMILY = 0x0004;
		const FAMILY_OR_ASSEMBLY = 0x0005;
		const PUBLIC = 0x0006;

		const STATIC = 0x0010;
		const FINAL = 0x0020;
		const VIRTUAL = 0x0040;
		const HIDE_BY_SIG = 0x0080;

		const VTABLE_LAYOUT_MASK = 0x0100;
		const REUSE_SLOT = 0x0000;
		const NEW_SLOT = 0x0100;

		const STRICT = 0x0200;
		const ABSTRACT = 0x0400;
		const SPECIAL_NAME = 0x0800;

		const PINVOKE_IMPL = 0x2000;
		const UNMANAGED_EXPORT = 0x0008;

		const RT_SPECIAL_NAME = 0x1000;
		const HAS_SECURITY = 0x4000;
		const REQUIRE_SEC_OBJECT = 0x8000;
	}
}

impl_from_byte_stream!(MethodAttributes);

impl MethodAttributes {
	pub fn accessibility(&self) -> crate::cas::binding::Accessibility {
		use crate::cas::binding::Accessibility;
		match (*self & Self::MEMBER_ACCESS_MASK).bits() {
			0x6 => Accessibility::Public,
			0x1 | 0x0 => Accessibility::Private,
			0x2 | 0x3 | 0x4 | 0x5 => Accessibility::Protected,
			_ => Accessibility::None,
		}
	}

	pub fn is_virtual(&self) -> bool {
		self.contains(Self::VIRTUAL)
	}

	pub fn is_newslot(&self) -> bool {
		self.contains(Self::NEW_SLOT)
	}

	pub fn is_abstract(&self) -> bool {
		self.contains(Self::ABSTRACT)
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodImplAttributes: u16 {
		const CODE_TYPE_MASK = 0x0003;
		const IL = 0x0000;
		const NATIVE = 0x0001;
		const OPTIL = 0x0002;
		const RUNTIME = 0x0003;

		const MANAGED_MASK = 0x0004;
		const UNMANAGED = 0x0004;
		const MANAGED = 0x0000;

		const FORWARD_REF = 0x0010;
		const PRESERVE_SIG = 0x0080;
		const INTERNAL_CALL = 0x1000;
		const SYNCHRONIZED = 0x0020;
		const NO_INLINING = 0x0008;
		const NO_OPTIMIZATION = 0x0040;
		const AGGRESSIVE_INLINING = 0x0100;
		const AGGRESSIVE_OPTIMIZATION = 0x0200;
	}
}

impl_from_byte_stream!(MethodImplAttributes);

#[derive(Debug, Clone, Table)]
pub struct MethodDef {
	pub rva: u32,
	pub impl_flags: MethodImplAttributes,
	pub flags: MethodAttributes,
	pub name: StringIndex,
	pub signature: BlobIndex,
	pub param_list: RowIndex<Param>,
}

impl MethodDefTable {
	/// The rows of `params` declared by the method at `row`, by the same
	/// range convention as [`TypeDefTable::field_range`].
	pub fn param_range(&self, params: &ParamTable, row: usize) -> std::ops::Range<usize> {
		let start = self.row(row).and_then(|r| r.param_list.index()).unwrap_or(0);
		let end = self.row(row + 1).and_then(|r| r.param_list.index()).unwrap_or_else(|| params.len());
		start..end
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ParamAttributes: u16 {
		const IN = 0x0001;
		const OUT = 0x0002;
		const OPTIONAL = 0x0010;
		const HAS_DEFAULT = 0x1000;
		const HAS_FIELD_MARSHAL = 0x2000;
	}
}

impl_from_byte_stream!(ParamAttributes);

#[derive(Debug, Clone, Table)]
pub struct Param {
	pub flags: ParamAttributes,
	pub sequence: u16,
	pub name: StringIndex,
}

#[derive(Debug, Clone, Table)]
pub struct InterfaceImpl {
	pub class: RowIndex<TypeDef>,
	pub interface: TypeDefOrRef,
}

#[derive(Debug, Clone, Table)]
pub struct MemberRef {
	pub class: MemberRefParent,
	pub name: StringIndex,
	pub signature: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct Constant {
	pub ty: [u8; 2],
	pub parent: HasConstant,
	pub value: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct CustomAttribute {
	pub parent: HasCustomAttribute,
	pub ty: CustomAttributeType,
	pub value: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct FieldMarshal {
	pub parent: HasFieldMarshal,
	pub native_type: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct ClassLayout {
	pub packing_size: u16,
	pub class_size: u32,
	pub parent: RowIndex<TypeDef>,
}

#[derive(Debug, Clone, Table)]
pub struct FieldLayout {
	pub offset: u32,
	pub field: RowIndex<Field>,
}

#[derive(Debug, Clone, Table)]
pub struct StandAloneSig {
	pub signature: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct EventMap {
	pub parent: RowIndex<TypeDef>,
	pub event_list: RowIndex<Event>,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct EventAttributes: u16 {
		const SPECIAL_NAME = 0x0200;
		const RT_SPECIAL_NAME = 0x0400;
	}
}

impl_from_byte_stream!(EventAttributes);

#[derive(Debug, Clone, Table)]
pub struct Event {
	pub flags: EventAttributes,
	pub name: StringIndex,
	pub ty: TypeDefOrRef,
}

#[derive(Debug, Clone, Table)]
pub struct PropertyMap {
	pub parent: RowIndex<TypeDef>,
	pub property_list: RowIndex<Property>,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct PropertyAttributes: u16 {
		const SPECIAL_NAME = 0x0200;
		const RT_SPECIAL_NAME = 0x0400;
		const HAS_DEFAULT = 0x1000;
	}
}

impl_from_byte_stream!(PropertyAttributes);

#[derive(Debug, Clone, Table)]
pub struct Property {
	pub flags: PropertyAttributes,
	pub name: StringIndex,
	pub ty: BlobIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodSemanticsAttributes: u16 {
		const SETTER = 0x0001;
		const GETTER = 0x0002;
		const OTHER = 0x0004;
		const ADD_ON = 0x0008;
		const REMOVE_ON = 0x0010;
		const FIRE = 0x0020;
	}
}

impl_from_byte_stream!(MethodSemanticsAttributes);

#[derive(Debug, Clone, Table)]
pub struct MethodSemantics {
	pub flags: MethodSemanticsAttributes,
	pub method: RowIndex<MethodDef>,
	pub association: HasSemantics,
}

#[derive(Debug, Clone, Table)]
pub struct MethodImpl {
	pub class: RowIndex<TypeDef>,
	pub body: MethodDefOrRef,
	pub declaration: MethodDefOrRef,
}

#[derive(Debug, Clone, Table)]
pub struct ModuleRef {
	pub name: StringIndex,
}

#[derive(Debug, Clone, Table)]
pub struct TypeSpec {
	pub signature: BlobIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct PInvokeAttributes: u16 {
		const NO_MANGLE = 0x0001;

		const CHAR_SET_MASK = 0x0006;
		const CHAR_SET_NOT_SPEC = 0x0000;
		const CHAR_SET_ANSI = 0x0002;
		const CHAR_SET_UNICODE = 0x0004;
		const CHAR_SET_AUTO = 0x0006;

		const SUPPORTS_LAST_ERROR = 0x0040;

		const CALL_CONV_MASK = 0x0700;
		const CALL_CONV_PLATFORM_API = 0x0100;
		const CALL_CONV_CDECL = 0x0200;
		const CALL_CONV_STDCALL = 0x0300;
		const CALL_CONV_THISCALL = 0x0400;
		const CALL_CONV_FASTCALL = 0x0500;

		const BEST_FIT_MASK = 0x0030;
		const BEST_FIT_ENABLED = 0x0010;
		const BEST_FIT_DISABLED = 0x0020;

		const THROW_ON_UNMAPPABLE_CHAR_MASK = 0x3000;
		const THROW_ON_UNMAPPABLE_CHAR_ENABLED = 0x1000;
		const THROW_ON_UNMAPPABLE_CHAR_DISABLED = 0x2000;
	}
}

impl_from_byte_stream!(PInvokeAttributes);

#[derive(Debug, Clone, Table)]
pub struct ImplMap {
	pub flags: PInvokeAttributes,
	pub member_forwarded: MemberForwarded,
	pub import_name: StringIndex,
	pub import_scope: RowIndex<ModuleRef>,
}

#[derive(Debug, Clone, Table)]
pub struct FieldRVA {
	pub rva: u32,
	pub field: RowIndex<Field>,
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromRepr)]
pub enum AssemblyHashAlgorithm {
	None = 0x0000,
	Md5 = 0x8003,
	Sha1 = 0x8004,
	Sha256 = 0x800C,
	Sha384 = 0x800D,
	Sha512 = 0x800E,
}

impl FromByteStream for AssemblyHashAlgorithm {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let value = u32::read(stream, &())?;
		Self::from_repr(value as usize).ok_or_else(|| ErrorKind::InvalidData.into())
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct AssemblyFlags: u32 {
		const PUBLIC_KEY = 0x0001;
		const RETARGETABLE = 0x0100;
		const DISABLE_JIT_COMPILE_OPTIMIZER = 0x4000;
		const ENABLE_JIT_COMPILE_TRACKING = 0x8000;
	}
}

impl_from_byte_stream!(AssemblyFlags);

#[derive(Debug, Clone, Table)]
pub struct Assembly {
	pub hash_algorithm: AssemblyHashAlgorithm,
	pub major_version: u16,
	pub minor_version: u16,
	pub build_number: u16,
	pub revision_number: u16,
	pub flags: AssemblyFlags,
	pub public_key: BlobIndex,
	pub name: StringIndex,
	pub culture: StringIndex,
}

#[derive(Debug, Clone, Table)]
pub struct AssemblyRef {
	pub major_version: u16,
	pub minor_version: u16,
	pub build_number: u16,
	pub revision_number: u16,
	pub flags: AssemblyFlags,
	pub public_key_or_token: BlobIndex,
	pub name: StringIndex,
	pub culture: StringIndex,
	pub hash_value: BlobIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct FileAttributes: u32 {
		const CONTAINS_METADATA = 0x0000;
		const CONTAINS_NO_METADATA = 0x0001;
	}
}

impl_from_byte_stream!(FileAttributes);

#[derive(Debug, Clone, Table)]
pub struct File {
	pub flags: FileAttributes,
	pub name: StringIndex,
	pub hash_value: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct ExportedType {
	pub flags: TypeAttributes,
	pub type_def_id: u32,
	pub type_name: StringIndex,
	pub type_namespace: StringIndex,
	pub implementation: Implementation,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ManifestResourceAttributes: u32 {
		const VISIBILITY_MASK = 0x0007;
		const PUBLIC = 0x0001;
		const PRIVATE = 0x0002;
	}
}

impl_from_byte_stream!(ManifestResourceAttributes);

#[derive(Debug, Clone, Table)]
pub struct ManifestResource {
	pub offset: u32,
	pub flags: ManifestResourceAttributes,
	pub name: StringIndex,
	pub implementation: Implementation,
}

#[derive(Debug, Clone, Table)]
pub struct NestedClass {
	pub nested_class: RowIndex<TypeDef>,
	pub enclosing_class: RowIndex<TypeDef>,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct GenericParamAttributes: u16 {
		const VARIANCE_MASK = 0x0003;
		const NONE = 0x0000;
		const COVARIANT = 0x0001;
		const CONTRAVARIANT = 0x0002;

		const SPECIAL_CONSTRAINT_MASK = 0x001C;
		const REFERENCE_TYPE_CONSTRAINT = 0x0004;
		const NOT_NULLABLE_VALUE_TYPE_CONSTRAINT = 0x0008;
		const DEFAULT_CONSTRUCTOR_CONSTRAINT = 0x0010;
	}
}

impl_from_byte_stream!(GenericParamAttributes);

#[derive(Debug, Clone, Table)]
pub struct GenericParam {
	pub number: u16,
	pub flags: GenericParamAttributes,
	pub owner: TypeOrMethodDef,
	pub name: StringIndex,
}

#[derive(Debug, Clone, Table)]
pub struct MethodSpec {
	pub method: MethodDefOrRef,
	pub instantiation: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct GenericParamConstraint {
	pub owner: RowIndex<GenericParam>,
	pub constraint: TypeDefOrRef,
}
