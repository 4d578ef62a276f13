use crate::metadata::heaps::{BlobIndex, GuidIndex, StringIndex};
use crate::metadata::indices::coded_index::CodedIndexKind;
use crate::metadata::indices::row_index::RowIndex;
use crate::metadata::heaps::table::TableRow;

/// Number of `#~` table kinds with an assigned row (0x00-0x37 minus gaps,
/// rounded up to the table kind with the highest discriminant).
pub const TABLE_KIND_COUNT: usize = 55;
/// Number of distinct coded index encodings defined by ECMA-335 §II.24.2.6
/// that this crate reads (debug-info-only coded indices are not needed).
pub const CODED_INDEX_KIND_COUNT: usize = 13;

const ALL_CODED_INDEX_KINDS: [CodedIndexKind; CODED_INDEX_KIND_COUNT] = [
	CodedIndexKind::TypeDefOrRef,
	CodedIndexKind::HasConstant,
	CodedIndexKind::HasCustomAttribute,
	CodedIndexKind::HasFieldMarshal,
	CodedIndexKind::HasDeclSecurity,
	CodedIndexKind::MemberRefParent,
	CodedIndexKind::HasSemantics,
	CodedIndexKind::MethodDefOrRef,
	CodedIndexKind::MemberForwarded,
	CodedIndexKind::Implementation,
	CodedIndexKind::CustomAttributeType,
	CodedIndexKind::ResolutionScope,
	CodedIndexKind::TypeOrMethodDef,
];

/// Byte widths of every index kind the `#~` stream can embed in a row,
/// derived once from the stream header's `HeapSizes` byte and row counts.
#[derive(Debug, Clone)]
pub struct IndexSizes {
	pub guid: usize,
	pub blob: usize,
	pub string: usize,
	pub coded: [usize; CODED_INDEX_KIND_COUNT],
	pub tables: [usize; TABLE_KIND_COUNT],
}

/// Maps a field type to the width of the index it is encoded with, given
/// the containing stream's [`IndexSizes`]. Implemented by every field type
/// that a `#[derive(Table)]` row can use.
pub trait SizeOf<T> {
	fn size_of(&self) -> usize;
}

impl IndexSizes {
	pub const ZERO: &'static IndexSizes = &IndexSizes {
		guid: 0,
		blob: 0,
		string: 0,
		coded: [0; CODED_INDEX_KIND_COUNT],
		tables: [0; TABLE_KIND_COUNT],
	};

	pub fn new(heap_sizes: u8, table_lens: &[u32; TABLE_KIND_COUNT]) -> Self {
		let tables = {
			let mut tables = [0usize; TABLE_KIND_COUNT];
			for (size, len) in tables.iter_mut().zip(table_lens) {
				*size = 2 + 2 * (*len > 65536) as usize;
			}
			tables
		};

		let coded = {
			let mut coded = [0usize; CODED_INDEX_KIND_COUNT];
			for (size, kind) in coded.iter_mut().zip(ALL_CODED_INDEX_KINDS) {
				*size = kind.get_size(table_lens);
			}
			coded
		};

		Self {
			blob: 2 + 2 * ((heap_sizes & 0x4) != 0) as usize,
			guid: 2 + 2 * ((heap_sizes & 0x2) != 0) as usize,
			string: 2 + 2 * ((heap_sizes & 0x1) != 0) as usize,
			tables,
			coded,
		}
	}
}

impl AsRef<()> for IndexSizes {
	#[inline]
	fn as_ref(&self) -> &() {
		&()
	}
}

impl AsRef<IndexSizes> for IndexSizes {
	#[inline]
	fn as_ref(&self) -> &Self {
		self
	}
}

impl SizeOf<()> for IndexSizes {
	#[inline]
	fn size_of(&self) -> usize {
		0
	}
}

impl<const S: usize> SizeOf<[u8; S]> for IndexSizes {
	#[inline]
	fn size_of(&self) -> usize {
		S
	}
}

impl SizeOf<GuidIndex> for IndexSizes {
	#[inline]
	fn size_of(&self) -> usize {
		self.guid
	}
}

impl SizeOf<BlobIndex> for IndexSizes {
	#[inline]
	fn size_of(&self) -> usize {
		self.blob
	}
}

impl SizeOf<StringIndex> for IndexSizes {
	#[inline]
	fn size_of(&self) -> usize {
		self.string
	}
}

impl<T: TableRow> SizeOf<RowIndex<T>> for IndexSizes {
	#[inline]
	fn size_of(&self) -> usize {
		self.tables[T::KIND as usize]
	}
}
