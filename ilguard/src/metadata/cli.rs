//! The CLI header and metadata root: the part of a managed PE image that
//! turns a section of raw bytes into heaps and tables.

use std::io::{Cursor, Error, ErrorKind, Read, Seek, SeekFrom};
use std::sync::Arc;

use bitflags::bitflags;
use owning_ref::ArcRef;

use crate::metadata::heaps::table::TableHeap;
use crate::metadata::heaps::{BlobHeap, GuidHeap, MetadataHeap, StringHeap, UserStringHeap};
use crate::metadata::indices::MetadataToken;
use crate::metadata::pe::{PeFile, CLI_HEADER_DIRECTORY};
use crate::utilities::{impl_from_byte_stream, FromByteStream};

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct RuntimeFlags: u32 {
		const IL_ONLY = 0x1;
		const REQUIRE_32_BIT = 0x2;
		const IL_LIBRARY = 0x4;
		const STRONG_NAME_SIGNED = 0x8;
		const PREFER_32_BIT = 0x0002_0000;
	}
}

impl_from_byte_stream!(RuntimeFlags);

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct CliHeader {
	pub size_in_bytes: u32,
	pub major_runtime_version: u16,
	pub minor_runtime_version: u16,
	pub metadata_virtual_address: u32,
	pub metadata_size: u32,
	pub flags: RuntimeFlags,
	pub entry_point_token: MetadataToken,
	pub resources_virtual_address: u32,
	pub resources_size: u32,
	pub strong_name_signature: u64,
}

impl CliHeader {
	fn read(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
		let size_in_bytes = u32::read(stream, &())?;
		let major_runtime_version = u16::read(stream, &())?;
		let minor_runtime_version = u16::read(stream, &())?;
		let metadata_virtual_address = u32::read(stream, &())?;
		let metadata_size = u32::read(stream, &())?;
		let flags = RuntimeFlags::read(stream, &())?;
		// native entry points store a function pointer here instead of a
		// token; not meaningful for managed CAS enforcement either way.
		let raw_entry_point = u32::read(stream, &())?;
		let entry_point_token = MetadataToken::try_from(raw_entry_point).unwrap_or(MetadataToken::try_from(0x0600_0000).unwrap());
		let resources_virtual_address = u32::read(stream, &())?;
		let resources_size = u32::read(stream, &())?;
		let strong_name_signature = u64::read(stream, &())?;
		// code manager table, v-table fixups, export address table jumps,
		// managed native header: unused for CAS enforcement purposes.
		stream.seek(SeekFrom::Current(24))?;

		Ok(Self {
			size_in_bytes,
			major_runtime_version,
			minor_runtime_version,
			metadata_virtual_address,
			metadata_size,
			flags,
			entry_point_token,
			resources_virtual_address,
			resources_size,
			strong_name_signature,
		})
	}
}

#[derive(Debug, Clone)]
pub struct MetadataRoot {
	major_version: u16,
	minor_version: u16,
	version: Arc<str>,
	flags: u16,
	heaps: Arc<[Arc<MetadataHeap>]>,
}

impl MetadataRoot {
	#[tracing::instrument(skip_all)]
	pub fn read(data: ArcRef<[u8]>) -> std::io::Result<Self> {
		let mut stream = Cursor::new(data.as_ref());
		if u32::read(&mut stream, &())? != 0x4253_4A42 {
			return Err(ErrorKind::InvalidData.into());
		}

		let major_version = u16::read(&mut stream, &())?;
		let minor_version = u16::read(&mut stream, &())?;
		stream.seek(SeekFrom::Current(4))?; // Reserved

		let length = (u32::read(&mut stream, &())?).div_ceil(4) * 4;
		let mut bytes = vec![0u8; length as usize];
		stream.read_exact(&mut bytes)?;
		let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
		let Ok(version) = std::str::from_utf8(&bytes[..end]).map(Arc::<str>::from) else {
			return Err(ErrorKind::InvalidData.into());
		};

		let flags = u16::read(&mut stream, &())?;

		let stream_header_count = u16::read(&mut stream, &())? as usize;
		let mut heaps = Vec::with_capacity(stream_header_count);
		for _ in 0..stream_header_count {
			heaps.push(MetadataHeap::read(&mut stream, &data)?);
		}

		Ok(Self { major_version, minor_version, version, flags, heaps: Arc::from(heaps) })
	}

	pub fn flags(&self) -> u16 {
		self.flags
	}
	pub fn version(&self) -> &str {
		&self.version
	}
	pub fn minor_version(&self) -> u16 {
		self.minor_version
	}
	pub fn major_version(&self) -> u16 {
		self.major_version
	}

	#[allow(private_bounds)]
	pub fn get_heap<T>(&self) -> Option<&T>
	where
		Self: GetHeap<T>,
	{
		<Self as GetHeap<T>>::get_heap(self)
	}

	/// Assembles a metadata root from already-built heaps, bypassing the
	/// `#~` stream root format — for constructing fixture assemblies.
	pub fn from_heaps(major_version: u16, minor_version: u16, version: impl Into<Arc<str>>, flags: u16, heaps: Vec<Arc<MetadataHeap>>) -> Self {
		Self { major_version, minor_version, version: version.into(), flags, heaps: Arc::from(heaps) }
	}
}

#[derive(Debug)]
pub struct Assembly {
	pe_file: PeFile,
	cli_header: CliHeader,
	metadata_root: MetadataRoot,
}

impl Assembly {
	#[tracing::instrument(skip_all)]
	pub fn parse(data: Arc<[u8]>) -> std::io::Result<Self> {
		let pe_file = PeFile::parse(data)?;

		let Some(directory) = pe_file.optional_header.data_directory(CLI_HEADER_DIRECTORY) else {
			return Err(Error::new(ErrorKind::InvalidData, "not a managed assembly: no CLI header directory"));
		};
		let Some(header_bytes) = pe_file.resolve_rva(directory.virtual_address) else {
			return Err(ErrorKind::InvalidData.into());
		};
		let mut cursor = Cursor::new(header_bytes.as_ref());
		let cli_header = CliHeader::read(&mut cursor)?;

		let Some(metadata_bytes) = pe_file.resolve_rva(cli_header.metadata_virtual_address) else {
			return Err(ErrorKind::InvalidData.into());
		};
		let metadata_bytes = metadata_bytes.map(|d| &d[..cli_header.metadata_size as usize]);
		let metadata_root = MetadataRoot::read(metadata_bytes)?;

		Ok(Self { pe_file, cli_header, metadata_root })
	}

	/// Assembles an `Assembly` from an already-built PE container, CLI header
	/// and metadata root, bypassing image parsing entirely — for constructing
	/// fixture assemblies that drive the resolver/binding/guard layers
	/// without a real PE image behind them.
	pub fn from_parts(pe_file: PeFile, cli_header: CliHeader, metadata_root: MetadataRoot) -> Self {
		Self { pe_file, cli_header, metadata_root }
	}

	pub fn pe_file(&self) -> &PeFile {
		&self.pe_file
	}
	pub fn cli_header(&self) -> &CliHeader {
		&self.cli_header
	}
	pub fn metadata_root(&self) -> &MetadataRoot {
		&self.metadata_root
	}
	pub fn table_heap(&self) -> Option<&TableHeap> {
		self.metadata_root.get_heap()
	}
	pub fn blob_heap(&self) -> Option<&BlobHeap> {
		self.metadata_root.get_heap()
	}
	pub fn string_heap(&self) -> Option<&StringHeap> {
		self.metadata_root.get_heap()
	}
	pub fn guid_heap(&self) -> Option<&GuidHeap> {
		self.metadata_root.get_heap()
	}
	pub fn user_string_heap(&self) -> Option<&UserStringHeap> {
		self.metadata_root.get_heap()
	}
}

trait GetHeap<T> {
	fn get_heap(&self) -> Option<&T>;
}

impl GetHeap<BlobHeap> for MetadataRoot {
	fn get_heap(&self) -> Option<&BlobHeap> {
		self.heaps.iter().find_map(|h| match &**h {
			MetadataHeap::Blob(h) => Some(h),
			_ => None,
		})
	}
}

impl GetHeap<GuidHeap> for MetadataRoot {
	fn get_heap(&self) -> Option<&GuidHeap> {
		self.heaps.iter().find_map(|h| match &**h {
			MetadataHeap::Guid(h) => Some(h),
			_ => None,
		})
	}
}

impl GetHeap<StringHeap> for MetadataRoot {
	fn get_heap(&self) -> Option<&StringHeap> {
		self.heaps.iter().find_map(|h| match &**h {
			MetadataHeap::String(h) => Some(h),
			_ => None,
		})
	}
}

impl GetHeap<UserStringHeap> for MetadataRoot {
	fn get_heap(&self) -> Option<&UserStringHeap> {
		self.heaps.iter().find_map(|h| match &**h {
			MetadataHeap::UserString(h) => Some(h),
			_ => None,
		})
	}
}

impl GetHeap<TableHeap> for MetadataRoot {
	fn get_heap(&self) -> Option<&TableHeap> {
		self.heaps.iter().find_map(|h| match &**h {
			MetadataHeap::Table(h) => Some(h),
			_ => None,
		})
	}
}
