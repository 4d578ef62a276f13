use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind};

use owning_ref::ArcRef;

use crate::metadata::heaps::{SizeDebugWrapper, StringIndex};

#[derive(Clone)]
pub struct StringHeap {
	data: ArcRef<[u8]>,
}

impl TryFrom<ArcRef<[u8]>> for StringHeap {
	type Error = Error;
	fn try_from(data: ArcRef<[u8]>) -> Result<Self, Self::Error> {
		match data.first() {
			Some(0) => Ok(Self { data }),
			_ => Err(ErrorKind::InvalidData.into()),
		}
	}
}

impl StringHeap {
	pub fn get(&self, idx: StringIndex) -> Option<&str> {
		let slice = self.data.get(idx.0..)?;
		let end = slice.iter().position(|c| *c == 0)?;
		std::str::from_utf8(&slice[..end]).ok()
	}
}

impl Debug for StringHeap {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("StringHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}

#[derive(Clone)]
pub struct UserStringHeap {
	data: ArcRef<[u8]>,
}

impl From<ArcRef<[u8]>> for UserStringHeap {
	fn from(data: ArcRef<[u8]>) -> Self {
		Self { data }
	}
}

impl UserStringHeap {
	/// Reads the UTF-16 user string at `idx` (ECMA-335 §II.24.2.4). The
	/// trailing byte flagging "non-ASCII content present" is informational
	/// only and not surfaced here.
	pub fn get(&self, idx: StringIndex) -> Option<String> {
		let data = self.data.get(idx.0..)?;
		let mut stream = std::io::Cursor::new(data);
		let len = crate::utilities::read_compressed_u32(&mut stream).ok()? as usize;
		if len == 0 {
			return Some(String::new());
		}
		let start = stream.position() as usize;
		let bytes = data.get(start..start + len - 1)?;
		let units = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]));
		char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)).collect::<String>().into()
	}
}

impl Debug for UserStringHeap {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("UserStringHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}
