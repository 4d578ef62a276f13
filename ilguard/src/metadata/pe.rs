//! Minimal PE/COFF reader: just enough of the Windows executable container
//! format to locate the CLI header and, through it, the metadata root.
//!
//! Sections and header structures are stored as [`ArcRef`] slices into the
//! whole-file buffer so that an [`Assembly`](super::cli::Assembly) can be
//! handed to a loader and kept alive indefinitely without borrowing from a
//! caller-owned buffer.

use std::io::{Cursor, Error, ErrorKind, Seek, SeekFrom};
use std::sync::Arc;

use owning_ref::ArcRef;

use crate::utilities::{impl_from_byte_stream, FromByteStream};

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DosHeader {
	pub magic: u16,
	_reserved: [u8; 58],
	pub pe_header_offset: u32,
}

impl_from_byte_stream!(DosHeader, 0x5A4Du16);

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ImageFileHeader {
	pub machine: u16,
	pub number_of_sections: u16,
	pub time_date_stamp: u32,
	pub pointer_to_symbol_table: u32,
	pub number_of_symbols: u32,
	pub size_of_optional_header: u16,
	pub characteristics: u16,
}

impl_from_byte_stream!(ImageFileHeader);

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DataDirectory {
	pub virtual_address: u32,
	pub size: u32,
}

impl_from_byte_stream!(DataDirectory);

pub const DIRECTORY_COUNT: usize = 16;
/// Index of the CLI header data directory (`IMAGE_DIRECTORY_ENTRY_COMHEADER`).
pub const CLI_HEADER_DIRECTORY: usize = 14;

#[derive(Debug, Copy, Clone)]
pub struct ImageOptionalHeader32 {
	pub magic: u16,
	pub image_base: u32,
	pub section_alignment: u32,
	pub file_alignment: u32,
	pub size_of_image: u32,
	pub size_of_headers: u32,
	pub subsystem: u16,
	pub dll_characteristics: u16,
	pub number_of_rva_and_sizes: u32,
	pub data_directories: Vec<DataDirectory>,
}

#[derive(Debug, Copy, Clone)]
pub struct ImageOptionalHeader64 {
	pub magic: u16,
	pub image_base: u64,
	pub section_alignment: u32,
	pub file_alignment: u32,
	pub size_of_image: u32,
	pub size_of_headers: u32,
	pub subsystem: u16,
	pub dll_characteristics: u16,
	pub number_of_rva_and_sizes: u32,
	pub data_directories: Vec<DataDirectory>,
}

#[derive(Debug, Clone)]
pub enum ImageOptionalHeader {
	None,
	Pe32(Box<ImageOptionalHeader32Fields>),
	Pe64(Box<ImageOptionalHeader64Fields>),
}

#[derive(Debug, Clone)]
pub struct ImageOptionalHeader32Fields {
	pub image_base: u32,
	pub data_directories: Vec<DataDirectory>,
}

#[derive(Debug, Clone)]
pub struct ImageOptionalHeader64Fields {
	pub image_base: u64,
	pub data_directories: Vec<DataDirectory>,
}

impl ImageOptionalHeader {
	pub fn data_directory(&self, index: usize) -> Option<DataDirectory> {
		match self {
			ImageOptionalHeader::None => None,
			ImageOptionalHeader::Pe32(hdr) => hdr.data_directories.get(index).copied(),
			ImageOptionalHeader::Pe64(hdr) => hdr.data_directories.get(index).copied(),
		}
	}

	fn read(stream: &mut Cursor<&[u8]>, size: u16) -> std::io::Result<Self> {
		if size == 0 {
			return Ok(Self::None);
		}

		let start = stream.position();
		let magic = u16::read(stream, &())?;
		match magic {
			// PE32
			0x10B => {
				// skip the fixed fields we don't need up to NumberOfRvaAndSizes (offset 92 from magic)
				stream.seek(SeekFrom::Start(start + 68))?;
				let image_base = {
					stream.seek(SeekFrom::Start(start + 28))?;
					u32::read(stream, &())?
				};
				stream.seek(SeekFrom::Start(start + 92))?;
				let number_of_rva_and_sizes = u32::read(stream, &())?;
				let mut data_directories = Vec::with_capacity(number_of_rva_and_sizes as usize);
				for _ in 0..number_of_rva_and_sizes {
					data_directories.push(DataDirectory::read(stream, &())?);
				}
				Ok(Self::Pe32(Box::new(ImageOptionalHeader32Fields { image_base, data_directories })))
			},
			// PE32+
			0x20B => {
				let image_base = {
					stream.seek(SeekFrom::Start(start + 24))?;
					u64::read(stream, &())?
				};
				stream.seek(SeekFrom::Start(start + 108))?;
				let number_of_rva_and_sizes = u32::read(stream, &())?;
				let mut data_directories = Vec::with_capacity(number_of_rva_and_sizes as usize);
				for _ in 0..number_of_rva_and_sizes {
					data_directories.push(DataDirectory::read(stream, &())?);
				}
				Ok(Self::Pe64(Box::new(ImageOptionalHeader64Fields { image_base, data_directories })))
			},
			_ => Err(ErrorKind::InvalidData.into()),
		}
	}
}

#[derive(Debug, Clone)]
pub struct SectionHeader {
	pub name: [u8; 8],
	pub virtual_size: u32,
	pub virtual_address: u32,
	pub size_of_raw_data: u32,
	pub pointer_to_raw_data: u32,
}

impl SectionHeader {
	fn read(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
		let name = <[u8; 8]>::read(stream, &())?;
		let virtual_size = u32::read(stream, &())?;
		let virtual_address = u32::read(stream, &())?;
		let size_of_raw_data = u32::read(stream, &())?;
		let pointer_to_raw_data = u32::read(stream, &())?;
		// relocations/linenumbers/characteristics: 16 bytes, unused here
		stream.seek(SeekFrom::Current(16))?;
		Ok(Self { name, virtual_size, virtual_address, size_of_raw_data, pointer_to_raw_data })
	}

	pub fn name(&self) -> &str {
		let end = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
		std::str::from_utf8(&self.name[..end]).unwrap_or("")
	}
}

#[derive(Debug, Clone)]
pub struct PeFile {
	data: ArcRef<[u8]>,
	pub file_header: ImageFileHeader,
	pub optional_header: ImageOptionalHeader,
	pub sections: Vec<SectionHeader>,
}

impl PeFile {
	/// A PE container with no sections: stands in for the image behind a
	/// fixture `Assembly` that never resolves an RVA (every method body,
	/// field signature and local-variable signature is supplied directly
	/// instead of being read out of a section's raw bytes).
	pub fn empty() -> Self {
		let data = ArcRef::new(Arc::<[u8]>::from(Vec::new())).map(|d| &d[..]);
		Self {
			data,
			file_header: ImageFileHeader { machine: 0, number_of_sections: 0, time_date_stamp: 0, pointer_to_symbol_table: 0, number_of_symbols: 0, size_of_optional_header: 0, characteristics: 0 },
			optional_header: ImageOptionalHeader::None,
			sections: Vec::new(),
		}
	}

	pub fn parse(data: Arc<[u8]>) -> std::io::Result<Self> {
		let data = ArcRef::new(data).map(|d| &d[..]);
		let mut stream = Cursor::new(data.as_ref());

		let dos_header = DosHeader::read(&mut stream, &())?;
		stream.seek(SeekFrom::Start(dos_header.pe_header_offset as u64))?;

		let magic = u32::read(&mut stream, &())?;
		if magic != 0x00004550 {
			return Err(Error::new(ErrorKind::InvalidData, "missing PE signature"));
		}

		let file_header = ImageFileHeader::read(&mut stream, &())?;
		let optional_header_start = stream.position();
		let optional_header = ImageOptionalHeader::read(&mut stream, file_header.size_of_optional_header)?;
		stream.seek(SeekFrom::Start(optional_header_start + file_header.size_of_optional_header as u64))?;

		let mut sections = Vec::with_capacity(file_header.number_of_sections as usize);
		for _ in 0..file_header.number_of_sections {
			sections.push(SectionHeader::read(&mut stream)?);
		}

		Ok(Self { data, file_header, optional_header, sections })
	}

	/// Resolves a relative virtual address to the file-backed bytes that
	/// back it, from the start of the containing section's raw data to the
	/// end of that section.
	pub fn resolve_rva(&self, rva: u32) -> Option<ArcRef<[u8]>> {
		let section = self.sections.iter().find(|s| {
			let end = s.virtual_address.saturating_add(s.virtual_size.max(s.size_of_raw_data));
			(s.virtual_address..end).contains(&rva)
		})?;

		let offset = section.pointer_to_raw_data as usize + (rva - section.virtual_address) as usize;
		if offset > self.data.len() {
			return None;
		}

		Some(self.data.clone().map(|d| &d[offset..]))
	}
}
