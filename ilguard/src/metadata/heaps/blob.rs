use std::fmt::{Debug, Formatter};
use std::io::Cursor;

use owning_ref::ArcRef;

use crate::metadata::heaps::{BlobIndex, SizeDebugWrapper};
use crate::utilities::read_compressed_u32;

#[derive(Clone)]
pub struct BlobHeap {
	data: ArcRef<[u8]>,
}

impl From<ArcRef<[u8]>> for BlobHeap {
	fn from(data: ArcRef<[u8]>) -> Self {
		Self { data }
	}
}

impl BlobHeap {
	/// Reads the length-prefixed blob at `idx`. Index `0` is always the
	/// empty blob.
	pub fn get(&self, idx: BlobIndex) -> Option<&[u8]> {
		let data = self.data.get(idx.0..)?;
		let mut stream = Cursor::new(data);
		let len = read_compressed_u32(&mut stream).ok()? as usize;
		let start = stream.position() as usize;
		data.get(start..start + len)
	}
}

impl Debug for BlobHeap {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("BlobHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}
