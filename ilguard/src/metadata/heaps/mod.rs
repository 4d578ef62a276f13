use std::fmt::{Debug, Formatter};
use std::io::{Cursor, ErrorKind};
use std::sync::Arc;

use owning_ref::ArcRef;

pub use crate::metadata::heaps::blob::BlobHeap;
pub use crate::metadata::heaps::guid::GuidHeap;
pub use crate::metadata::heaps::string::{StringHeap, UserStringHeap};
use crate::metadata::heaps::table::TableHeap;
use crate::metadata::indices::metadata_token;
use crate::metadata::indices::sizes::IndexSizes;
use crate::utilities::{read_string_from_stream_into, FromByteStream};

pub mod blob;
pub mod guid;
pub mod string;
pub mod table;

#[derive(Debug)]
pub enum MetadataHeap {
	Blob(BlobHeap),
	Guid(GuidHeap),
	Table(TableHeap),
	String(StringHeap),
	UserString(UserStringHeap),
}

impl MetadataHeap {
	#[tracing::instrument(skip_all)]
	pub fn read(stream: &mut Cursor<&[u8]>, data: &ArcRef<[u8]>) -> std::io::Result<Arc<Self>> {
		let offset = u32::read(stream, &())? as usize;
		let size = u32::read(stream, &())? as usize;

		let mut name = [0u8; 32];
		let name = read_string_from_stream_into::<4>(stream, name.as_mut_slice())?;

		if offset + size > data.len() {
			return Err(ErrorKind::UnexpectedEof.into());
		}
		let slice = data.clone().map(|d| &d[offset..offset + size]);

		Ok(Arc::new(match name {
			"#Blob" => Self::Blob(BlobHeap::from(slice)),
			"#US" => Self::UserString(UserStringHeap::from(slice)),
			"#~" => Self::Table(TableHeap::try_from(slice)?),
			"#GUID" => Self::Guid(GuidHeap::try_from(slice)?),
			"#Strings" => Self::String(StringHeap::try_from(slice)?),
			_ => return Err(ErrorKind::InvalidData.into()),
		}))
	}
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StringIndex(pub usize);

impl FromByteStream for StringIndex {
	type Deps = IndexSizes;
	fn read(stream: &mut Cursor<&[u8]>, sizes: &Self::Deps) -> std::io::Result<Self> {
		let mut value = 0usize.to_ne_bytes();
		std::io::Read::read_exact(stream, &mut value[..sizes.string])?;
		Ok(Self(usize::from_le_bytes(value)))
	}
}

impl From<StringIndex> for metadata_token::StringToken {
	#[inline]
	fn from(value: StringIndex) -> Self {
		Self(value.0)
	}
}

impl From<StringIndex> for metadata_token::MetadataToken {
	#[inline]
	fn from(value: StringIndex) -> Self {
		metadata_token::StringToken(value.0).into()
	}
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlobIndex(pub usize);

impl FromByteStream for BlobIndex {
	type Deps = IndexSizes;
	fn read(stream: &mut Cursor<&[u8]>, sizes: &Self::Deps) -> std::io::Result<Self> {
		let mut value = 0usize.to_ne_bytes();
		std::io::Read::read_exact(stream, &mut value[..sizes.blob])?;
		Ok(Self(usize::from_le_bytes(value)))
	}
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuidIndex(pub usize);

impl FromByteStream for GuidIndex {
	type Deps = IndexSizes;
	fn read(stream: &mut Cursor<&[u8]>, sizes: &Self::Deps) -> std::io::Result<Self> {
		let mut value = 0usize.to_ne_bytes();
		std::io::Read::read_exact(stream, &mut value[..sizes.guid])?;
		Ok(Self(usize::from_le_bytes(value)))
	}
}

pub(crate) struct SizeDebugWrapper(usize);
impl Debug for SizeDebugWrapper {
	#[inline]
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str("[u8; ")?;
		Debug::fmt(&self.0, f)?;
		f.write_str("]")
	}
}
