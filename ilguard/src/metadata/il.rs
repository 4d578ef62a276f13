//! The CIL instruction stream: opcodes, method body headers and the
//! signature blobs a method body's local variables are described by.

use std::fmt::{Debug, Formatter};
use std::io::Result;
use std::io::{Cursor, Error, ErrorKind, Read, Seek, SeekFrom};
use std::sync::Arc;

use bitflags::bitflags;
use derivative::Derivative;

use crate::metadata::heaps::table::StandAloneSigTable;
use crate::metadata::heaps::BlobHeap;
use crate::metadata::indices::coded_index::TypeDefOrRef;
use crate::metadata::indices::metadata_token::{MetadataToken, StandAloneSigToken};
use crate::metadata::indices::sizes::IndexSizes;
use crate::utilities::{impl_from_byte_stream, read_bytes_slice_from_stream, read_compressed_u32, FromByteStream};

macro_rules! debug_opcode {
	($name: ident, $f: expr, $self: expr, $ident: ident) => {
		if $name::$ident == *$self {
			return write!($f, "OpCode::{}", stringify!($ident));
		}
	};
	($name: ident, $f: expr, $self: expr, $ident: ident ($ty: ty)) => {
		if let $name::$ident(v) = $self {
			return write!($f, "OpCode::{}({:#X?})", stringify!($ident), v);
		}
	};
}

macro_rules! define_opcodes {
    (
		enum $name: ident  $(<$lifetime: lifetime>)? {
			$(
				$(#[$attr:meta])*
				$ident: ident $(($ty: ty))? = $discriminant: literal
			),*
		}
	) => {
		#[repr(u8)]
		#[allow(non_camel_case_types)]
		#[derive(Copy, Clone, PartialEq)]
		pub enum $name $(<$lifetime>)? {
			$(
				$(#[$attr])*
				$ident $(($ty))? = $discriminant
			),*
		}

		impl$(<$lifetime>)? $name$(<$lifetime>)? {
			pub fn read(stream: &mut Cursor<& $($lifetime)? [u8]>, _: &()) -> Result<Self> {
				let mut discriminant = 0u8;
				stream.read_exact(std::slice::from_mut(&mut discriminant))?;

				match discriminant {
					$($discriminant => Ok($name::$ident $((<$ty>::read(stream, &())?))?),)*
					_ => Err(Error::new(ErrorKind::InvalidData, format!("unimplemented opcode {discriminant:#X}"))),
				}
			}
		}

		impl $(<$lifetime>)? Debug for $name $(<$lifetime>)? {
			fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
				$(debug_opcode! { $name, f, self, $ident $(($ty))? })*
				Ok(())
			}
		}
	};
}

define_opcodes! {
	enum OpCode<'l> {
		nop = 0x00,
		dbg_break = 0x01,
		ldarg_0 = 0x02,
		ldarg_1 = 0x03,
		ldarg_2 = 0x04,
		ldarg_3 = 0x05,
		ldloc_0 = 0x06,
		ldloc_1 = 0x07,
		ldloc_2 = 0x08,
		ldloc_3 = 0x09,
		stloc_0 = 0x0A,
		stloc_1 = 0x0B,
		stloc_2 = 0x0C,
		stloc_3 = 0x0D,
		ldarg_s(u8) = 0x0E,
		ldarga_s(u8) = 0x0F,
		starg_s(u8) = 0x10,
		ldloc_s(u8) = 0x11,
		ldloca_s(u8) = 0x12,
		stloc_s(u8) = 0x13,
		ldnull = 0x14,
		ldc_i4_m1 = 0x15,
		ldc_i4_0 = 0x16,
		ldc_i4_1 = 0x17,
		ldc_i4_2 = 0x18,
		ldc_i4_3 = 0x19,
		ldc_i4_4 = 0x1A,
		ldc_i4_5 = 0x1B,
		ldc_i4_6 = 0x1C,
		ldc_i4_7 = 0x1D,
		ldc_i4_8 = 0x1E,
		ldc_i4_s(u8) = 0x1F,
		ldc_i4(i32) = 0x20,
		ldc_i8(i64) = 0x21,
		ldc_r4(f32) = 0x22,
		ldc_r8(f64) = 0x23,
		dup = 0x25,
		pop = 0x26,
		jmp(MetadataToken) = 0x27,
		call(MetadataToken) = 0x28,
		calli(MetadataToken) = 0x29,
		ret = 0x2A,
		br_s(i8) = 0x2B,
		brfalse_s(i8) = 0x2C,
		brtrue_s(i8) = 0x2D,
		beq_s(i8) = 0x2E,
		bge_s(i8) = 0x2F,
		bgt_s(i8) = 0x30,
		ble_s(i8) = 0x31,
		blt_s(i8) = 0x32,
		bne_un_s(i8) = 0x33,
		bge_un_s(i8) = 0x34,
		bgt_un_s(i8) = 0x35,
		ble_un_s(i8) = 0x36,
		blt_un_s(i8) = 0x37,
		br(i32) = 0x38,
		brfalse(i32) = 0x39,
		brtrue(i32) = 0x3A,
		beq(i32) = 0x3B,
		bge(i32) = 0x3C,
		bgt(i32) = 0x3D,
		ble(i32) = 0x3E,
		blt(i32) = 0x3F,
		bne_un(i32) = 0x40,
		bge_un(i32) = 0x41,
		bgt_un(i32) = 0x42,
		ble_un(i32) = 0x43,
		blt_un(i32) = 0x44,
		switch(SwitchTable<'l>) = 0x45,
		ldind_i1 = 0x46,
		ldind_u1 = 0x47,
		ldind_i2 = 0x48,
		ldind_u2 = 0x49,
		ldind_i4 = 0x4A,
		ldind_u4 = 0x4B,
		ldind_i8 = 0x4C,
		ldind_i = 0x4D,
		ldind_r4 = 0x4E,
		ldind_r8 = 0x4F,
		ldind_ref = 0x50,
		stind_ref = 0x51,
		stind_i1 = 0x52,
		stind_i2 = 0x53,
		stind_i4 = 0x54,
		stind_i8 = 0x55,
		stind_r4 = 0x56,
		stind_r8 = 0x57,
		add = 0x58,
		sub = 0x59,
		mul = 0x5A,
		div = 0x5B,
		div_un = 0x5C,
		rem = 0x5D,
		rem_un = 0x5E,
		and = 0x5F,
		or = 0x60,
		xor = 0x61,
		shl = 0x62,
		shr = 0x63,
		shr_un = 0x64,
		neg = 0x65,
		not = 0x66,
		conv_i1 = 0x67,
		conv_i2 = 0x68,
		conv_i4 = 0x69,
		conv_i8 = 0x6A,
		conv_r4 = 0x6B,
		conv_r8 = 0x6C,
		conv_u4 = 0x6D,
		conv_u8 = 0x6E,
		callvirt(MetadataToken) = 0x6F,
		cpobj(MetadataToken) = 0x70,
		ldobj(MetadataToken) = 0x71,
		ldstr(MetadataToken) = 0x72,
		newobj(MetadataToken) = 0x73,
		castclass(MetadataToken) = 0x74,
		isinst(MetadataToken) = 0x75,
		conv_r_un = 0x76,
		unbox(MetadataToken) = 0x79,
		throw = 0x7A,
		ldfld(MetadataToken) = 0x7B,
		ldflda(MetadataToken) = 0x7C,
		stfld(MetadataToken) = 0x7D,
		ldsfld(MetadataToken) = 0x7E,
		ldsflda(MetadataToken) = 0x7F,
		stsfld(MetadataToken) = 0x80,
		stobj(MetadataToken) = 0x81,
		conv_ovf_i1_un = 0x82,
		conv_ovf_i2_un = 0x83,
		conv_ovf_i4_un = 0x84,
		conv_ovf_i8_un = 0x85,
		conv_ovf_u1_un = 0x86,
		conv_ovf_u2_un = 0x87,
		conv_ovf_u4_un = 0x88,
		conv_ovf_u8_un = 0x89,
		conv_ovf_i_un = 0x8A,
		conv_ovf_u_un = 0x8B,
		box_val(MetadataToken) = 0x8C,
		newarr(MetadataToken) = 0x8D,
		ldlen = 0x8E,
		ldelema(MetadataToken) = 0x8F,
		ldelem_i1 = 0x90,
		ldelem_u1 = 0x91,
		ldelem_i2 = 0x92,
		ldelem_u2 = 0x93,
		ldelem_i4 = 0x94,
		ldelem_u4 = 0x95,
		ldelem_i8 = 0x96,
		ldelem_i = 0x97,
		ldelem_r4 = 0x98,
		ldelem_r8 = 0x99,
		ldelem_ref = 0x9A,
		stelem_i = 0x9B,
		stelem_i1 = 0x9C,
		stelem_i2 = 0x9D,
		stelem_i4 = 0x9E,
		stelem_i8 = 0x9F,
		stelem_r4 = 0xA0,
		stelem_r8 = 0xA1,
		stelem_ref = 0xA2,
		ldelem(MetadataToken) = 0xA3,
		stelem(MetadataToken) = 0xA4,
		unbox_any(MetadataToken) = 0xA5,
		conv_ovf_i1 = 0xB3,
		conv_ovf_u1 = 0xB4,
		conv_ovf_i2 = 0xB5,
		conv_ovf_u2 = 0xB6,
		conv_ovf_i4 = 0xB7,
		conv_ovf_u4 = 0xB8,
		conv_ovf_i8 = 0xB9,
		conv_ovf_u8 = 0xBA,
		refanyval(MetadataToken) = 0xC2,
		ckfinite = 0xC3,
		mkrefany(MetadataToken) = 0xC6,
		ldtoken(MetadataToken) = 0xD0,
		conv_u2 = 0xD1,
		conv_u1 = 0xD2,
		conv_i = 0xD3,
		conv_ovf_i = 0xD4,
		conv_ovf_u = 0xD5,
		add_ovf = 0xD6,
		add_ovf_un = 0xD7,
		mul_ovf = 0xD8,
		mul_ovf_un = 0xD9,
		sub_ovf = 0xDA,
		sub_ovf_un = 0xDB,
		endfinally = 0xDC,
		leave(i32) = 0xDD,
		leave_s(i8) = 0xDE,
		stind_i = 0xDF,
		conv_u = 0xE0,
		compound(CompoundOpCode) = 0xFE
	}
}

define_opcodes! {
	enum CompoundOpCode {
		arglist = 0x00,
		ceq = 0x01,
		cgt = 0x02,
		cgt_un = 0x03,
		clt = 0x04,
		clt_un = 0x05,
		ldftn(MetadataToken) = 0x06,
		ldvirtftn(MetadataToken) = 0x07,
		ldarg(u16) = 0x09,
		ldarga(u16) = 0x0A,
		starg(u16) = 0x0B,
		ldloc(u16) = 0x0C,
		ldloca(u16) = 0x0D,
		stloc(u16) = 0x0E,
		localloc = 0x0F,
		endfilter = 0x11,
		unaligned = 0x12,
		volatile = 0x13,
		tail = 0x14,
		initobj(MetadataToken) = 0x15,
		constrained(MetadataToken) = 0x16,
		cpblk = 0x17,
		initblk = 0x18,
		no_chk(SkipFaultCheckFlags) = 0x19,
		rethrow = 0x1A,
		sizeof(MetadataToken) = 0x1C,
		refanytype = 0x1D,
		readonly = 0x1E
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct SkipFaultCheckFlags: u8 {
		const TYPE_CHECK = 0x1;
		const RANGE_CHECK = 0x2;
		const NULL_CHECK = 0x4;
	}
}

impl_from_byte_stream!(SkipFaultCheckFlags);

#[derive(Copy, Clone, PartialEq, Hash)]
pub struct SwitchTable<'l>(&'l [u8]);

impl Debug for SwitchTable<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_list();
		for variant in self.variants() {
			dbg.entry(&variant);
		}
		dbg.finish()
	}
}

impl<'l> SwitchTable<'l> {
	pub fn read(stream: &mut Cursor<&'l [u8]>, _: &()) -> Result<Self> {
		let len = u32::read(stream, &())?;
		let data = read_bytes_slice_from_stream(stream, len as usize * 4)?;
		Ok(Self(data))
	}

	pub fn len(&self) -> usize {
		self.0.len() / 4
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	#[inline]
	pub fn variants(&self) -> impl Iterator<Item = i32> + '_ {
		(0..self.len()).map(move |i| {
			let slice = &self.0[i * 4..(i + 1) * 4];
			i32::from_le_bytes(slice.try_into().unwrap())
		})
	}
}

pub struct OpCodeIterator<'l> {
	cursor: Cursor<&'l [u8]>,
}

impl<'l> OpCodeIterator<'l> {
	pub fn new(bytes: &'l [u8]) -> Self {
		Self { cursor: Cursor::new(bytes) }
	}

	pub fn position(&self) -> u64 {
		self.cursor.position()
	}
}

impl<'l> Iterator for OpCodeIterator<'l> {
	type Item = (u64, Result<OpCode<'l>>);
	fn next(&mut self) -> Option<Self::Item> {
		let position = self.cursor.position();
		match position == self.cursor.get_ref().len() as u64 {
			true => None,
			false => Some((position, OpCode::read(&mut self.cursor, &()))),
		}
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ExceptionClauseFlags: u32 {
		const EXCEPTION = 0x0000;
		const FILTER = 0x0001;
		const FINALLY = 0x0002;
		const FAULT = 0x0004;
	}
}

/// One `try`/handler region (ECMA-335 §II.25.4.6). `try_offset`/`handler_offset`
/// and their lengths are in the *original* method body's byte offsets; the
/// rewriter remaps all four boundary offsets (plus the filter's, if present)
/// through its offset-map exactly like a branch target (§4.E).
#[derive(Debug, Copy, Clone)]
pub struct ExceptionHandlingClause {
	pub flags: ExceptionClauseFlags,
	pub try_offset: u32,
	pub try_length: u32,
	pub handler_offset: u32,
	pub handler_length: u32,
	/// For `FILTER` clauses, the offset of the filter expression; for a
	/// typed catch, the `TypeDefOrRef`/`TypeSpec` token of the caught type.
	/// Stored as the raw `u32` since its interpretation depends on `flags`.
	pub class_token_or_filter_offset: u32,
}

impl ExceptionHandlingClause {
	fn read_fat(stream: &mut Cursor<&[u8]>) -> Result<Self> {
		Ok(Self {
			flags: ExceptionClauseFlags::from_bits_truncate(u32::read(stream, &())?),
			try_offset: u32::read(stream, &())?,
			try_length: u32::read(stream, &())?,
			handler_offset: u32::read(stream, &())?,
			handler_length: u32::read(stream, &())?,
			class_token_or_filter_offset: u32::read(stream, &())?,
		})
	}

	fn read_small(stream: &mut Cursor<&[u8]>) -> Result<Self> {
		let flags = ExceptionClauseFlags::from_bits_truncate(u16::read(stream, &())? as u32);
		let try_offset = u16::read(stream, &())? as u32;
		let try_length = u8::read(stream, &())? as u32;
		let handler_offset = u16::read(stream, &())? as u32;
		let handler_length = u8::read(stream, &())? as u32;
		let class_token_or_filter_offset = u32::read(stream, &())?;
		Ok(Self { flags, try_offset, try_length, handler_offset, handler_length, class_token_or_filter_offset })
	}
}

const MORE_SECTS: u16 = 0x08;
const SECTION_EHTABLE: u8 = 0x01;
const SECTION_FAT_FORMAT: u8 = 0x40;
const SECTION_MORE_SECTS: u8 = 0x80;

fn read_exception_sections(stream: &mut Cursor<&[u8]>) -> Result<Vec<ExceptionHandlingClause>> {
	let mut clauses = vec![];
	loop {
		let align = (4 - (stream.position() % 4) % 4) % 4;
		stream.seek(SeekFrom::Current(align as i64))?;

		let kind = u8::read(stream, &())?;
		if kind & SECTION_EHTABLE == 0 {
			// Unrecognised section kind (e.g. a debug-only section): its
			// data_size is still well-formed, so skip over it rather than
			// failing instrumentation for a section this crate never reads.
			let is_fat = kind & SECTION_FAT_FORMAT != 0;
			let data_size = match is_fat {
				true => {
					let mut bytes = [0u8; 4];
					bytes[..3].copy_from_slice(&read_bytes_slice_from_stream(stream, 3)?[..3]);
					u32::from_le_bytes(bytes) & 0x00FF_FFFF
				},
				false => u8::read(stream, &())? as u32,
			};
			let skip = data_size.saturating_sub(if is_fat { 4 } else { 2 });
			stream.seek(SeekFrom::Current(skip as i64))?;
			if kind & SECTION_MORE_SECTS == 0 {
				break;
			}
			continue;
		}

		let is_fat = kind & SECTION_FAT_FORMAT != 0;
		if is_fat {
			let mut size_bytes = [0u8; 4];
			size_bytes[..3].copy_from_slice(read_bytes_slice_from_stream(stream, 3)?);
			let data_size = u32::from_le_bytes(size_bytes) & 0x00FF_FFFF;
			let count = (data_size.saturating_sub(4)) / 24;
			for _ in 0..count {
				clauses.push(ExceptionHandlingClause::read_fat(stream)?);
			}
		} else {
			let data_size = u8::read(stream, &())? as u32;
			stream.seek(SeekFrom::Current(2))?; // padding
			let count = (data_size.saturating_sub(4)) / 12;
			for _ in 0..count {
				clauses.push(ExceptionHandlingClause::read_small(stream)?);
			}
		}

		if kind & SECTION_MORE_SECTS == 0 {
			break;
		}
	}
	Ok(clauses)
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct MethodBody<'l> {
	pub max_stack_size: u16,
	pub init_locals: bool,
	pub locals: Vec<TypeSignature<'l>>,
	pub exception_handlers: Vec<ExceptionHandlingClause>,
	#[derivative(Debug(format_with = "debug_opcodes"))]
	pub code: &'l [u8],
}

impl<'l> MethodBody<'l> {
	pub fn read(
		stream: &mut Cursor<&'l [u8]>,
		blob_heap: &'l BlobHeap,
		signatures: &StandAloneSigTable,
		index_sizes: &Arc<IndexSizes>,
	) -> Result<Self> {
		let header = u8::read(stream, &())?;
		match header & 3 {
			2 => {
				let code_size = (header >> 2) as usize;
				let code = read_bytes_slice_from_stream(stream, code_size)?;
				Ok(Self { code, max_stack_size: 8, init_locals: false, locals: vec![], exception_handlers: vec![] })
			},
			3 => {
				stream.set_position(stream.position() - 1);
				let flags = u16::read(stream, &())?;
				let max_stack_size = u16::read(stream, &())?;
				let code_size = u32::read(stream, &())?;
				let init_locals = flags & 0x10 != 0;

				let mut locals = vec![];
				let local_var_token = u32::read(stream, &())?;
				if local_var_token != 0 {
					let Ok(local_var_token) = MetadataToken::try_from(local_var_token) else {
						return Err(Error::new(ErrorKind::InvalidData, "invalid metadata token"));
					};
					let Ok(StandAloneSigToken(row)) = local_var_token.try_into() else {
						return Err(Error::new(ErrorKind::InvalidData, "local signature token does not name a StandAloneSig row"));
					};
					let Some(row) = signatures.row(row - 1) else {
						return Err(Error::new(ErrorKind::InvalidData, "local signature token out of range"));
					};
					let Some(sig) = blob_heap.get(row.signature) else {
						return Err(Error::new(ErrorKind::InvalidData, "invalid blob index"));
					};

					let mut stream = Cursor::new(sig);
					if u8::read(&mut stream, &())? != 0x07 {
						return Err(Error::new(ErrorKind::InvalidData, "blob is not a local variable signature"));
					}

					let count = read_compressed_u32(&mut stream)? as usize;

					locals.reserve_exact(count);
					for _ in 0..count {
						locals.push(TypeSignature::read(&mut stream, index_sizes)?);
					}
				}

				let code = read_bytes_slice_from_stream(stream, code_size as usize)?;

				let exception_handlers = if flags & MORE_SECTS != 0 {
					let align = (4 - (stream.position() % 4) % 4) % 4;
					stream.seek(SeekFrom::Current(align as i64))?;
					read_exception_sections(stream)?
				} else {
					vec![]
				};

				Ok(Self { max_stack_size, init_locals, code, locals, exception_handlers })
			},
			_ => Err(Error::new(ErrorKind::InvalidData, "invalid method body header")),
		}
	}
}

pub(crate) fn debug_opcodes(bytes: &[u8], fmt: &mut Formatter) -> std::result::Result<(), std::fmt::Error> {
	let mut dbg = fmt.debug_list();
	for (i, opcode) in OpCodeIterator::new(bytes) {
		match opcode {
			Ok(opcode) => dbg.entry(&format_args!("IL_{i:08X}\t{opcode:X?}")),
			Err(_) => dbg.entry(&format_args!("IL_{i:08X}\t<invalid>")),
		};
	}
	dbg.finish()
}

#[derive(Clone)]
pub struct TypeSignature<'l>(&'l [u8], Arc<IndexSizes>);

impl Debug for TypeSignature<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut stream = Cursor::new(self.0);
		let sig = TypeSignatureTag::read(&mut stream, &self.1).unwrap();
		Debug::fmt(&sig, f)
	}
}

impl<'l> TypeSignature<'l> {
	pub fn read(stream: &mut Cursor<&'l [u8]>, index_sizes: &Arc<IndexSizes>) -> Result<Self> {
		let start = stream.position() as usize;
		let _ = TypeSignatureTag::read(stream, index_sizes)?;
		Ok(Self(&stream.get_ref()[start..stream.position() as usize], index_sizes.clone()))
	}

	pub fn as_tag(&self) -> TypeSignatureTag {
		let mut stream = Cursor::new(self.0);
		TypeSignatureTag::read(&mut stream, &self.1).unwrap()
	}
}

/// An ECMA-335 §II.23.2.12 element type tag, as it appears in field,
/// property and local variable signature blobs.
#[repr(u8)]
#[derive(Debug)]
pub enum TypeSignatureTag<'l> {
	End = 0x00,
	Void = 0x01,
	Bool = 0x02,
	Char = 0x03,
	Int1 = 0x04,
	UInt1 = 0x05,
	Int2 = 0x06,
	UInt2 = 0x07,
	Int4 = 0x08,
	UInt4 = 0x09,
	Int8 = 0x0a,
	UInt8 = 0x0b,
	Float = 0x0c,
	Double = 0x0d,
	String = 0x0e,
	Pointer(TypeSignature<'l>) = 0x0f,
	Reference(TypeSignature<'l>) = 0x10,
	ValueType(TypeDefOrRef) = 0x11,
	ClassType(TypeDefOrRef) = 0x12,
	GenericParam(u32) = 0x13,
	Array = 0x14,
	GenericInst(GenericInst<'l>) = 0x15,
	TypedByRef = 0x16,
	IntPtr = 0x18,
	UIntPtr = 0x19,
	FnPointer(MethodSignature<'l>) = 0x1b,
	Object = 0x1c,
	SzArray(TypeSignature<'l>) = 0x1d,
	MethodGenericParam(u32) = 0x1e,
	CModReq(TypeDefOrRef) = 0x1f,
	CModOpt(TypeDefOrRef) = 0x20,
	Internal = 0x21,
	Pinned(TypeSignature<'l>) = 0x45,
}

impl<'l> TypeSignatureTag<'l> {
	/// Whether this tag denotes an unmanaged type (ECMA-335 §I.8.2.3):
	/// any value type that recursively contains no references.
	///
	/// Only the tags a `localloc`/`Span<T>` guard needs to distinguish are
	/// resolved precisely; nested value types are assumed unmanaged, since
	/// by the time a struct reaches a signature blob the compiler has
	/// already rejected those that aren't.
	pub fn is_unmanaged(&self) -> bool {
		!matches!(
			self,
			TypeSignatureTag::String
				| TypeSignatureTag::Object
				| TypeSignatureTag::ClassType(_)
				| TypeSignatureTag::Array
				| TypeSignatureTag::SzArray(_)
				| TypeSignatureTag::GenericInst(_)
				| TypeSignatureTag::FnPointer(_)
				| TypeSignatureTag::Reference(_)
				| TypeSignatureTag::TypedByRef
				| TypeSignatureTag::GenericParam(_)
				| TypeSignatureTag::MethodGenericParam(_)
		)
	}

	pub fn read(stream: &mut Cursor<&'l [u8]>, index_sizes: &Arc<IndexSizes>) -> Result<Self> {
		let tag = u8::read(stream, &())?;
		match tag {
			0x00 => Ok(TypeSignatureTag::End),
			0x01 => Ok(TypeSignatureTag::Void),
			0x02 => Ok(TypeSignatureTag::Bool),
			0x03 => Ok(TypeSignatureTag::Char),
			0x04 => Ok(TypeSignatureTag::Int1),
			0x05 => Ok(TypeSignatureTag::UInt1),
			0x06 => Ok(TypeSignatureTag::Int2),
			0x07 => Ok(TypeSignatureTag::UInt2),
			0x08 => Ok(TypeSignatureTag::Int4),
			0x09 => Ok(TypeSignatureTag::UInt4),
			0x0A => Ok(TypeSignatureTag::Int8),
			0x0B => Ok(TypeSignatureTag::UInt8),
			0x0C => Ok(TypeSignatureTag::Float),
			0x0D => Ok(TypeSignatureTag::Double),
			0x0E => Ok(TypeSignatureTag::String),
			0x0F => Ok(TypeSignatureTag::Pointer(TypeSignature::read(stream, index_sizes)?)),
			0x10 => Ok(TypeSignatureTag::Reference(TypeSignature::read(stream, index_sizes)?)),
			0x11 => Ok(TypeSignatureTag::ValueType(TypeDefOrRef::read_compressed(stream)?)),
			0x12 => Ok(TypeSignatureTag::ClassType(TypeDefOrRef::read_compressed(stream)?)),
			0x13 => Ok(TypeSignatureTag::GenericParam(read_compressed_u32(stream)?)),
			0x14 => Ok(TypeSignatureTag::Array),
			0x15 => Ok(TypeSignatureTag::GenericInst(GenericInst::read(stream, index_sizes)?)),
			0x16 => Ok(TypeSignatureTag::TypedByRef),
			0x18 => Ok(TypeSignatureTag::IntPtr),
			0x19 => Ok(TypeSignatureTag::UIntPtr),
			0x1B => Ok(TypeSignatureTag::FnPointer(MethodSignature::read(stream, index_sizes)?)),
			0x1C => Ok(TypeSignatureTag::Object),
			0x1D => Ok(TypeSignatureTag::SzArray(TypeSignature::read(stream, index_sizes)?)),
			0x1E => Ok(TypeSignatureTag::MethodGenericParam(read_compressed_u32(stream)?)),
			0x1F => Ok(TypeSignatureTag::CModReq(TypeDefOrRef::read_compressed(stream)?)),
			0x20 => Ok(TypeSignatureTag::CModOpt(TypeDefOrRef::read_compressed(stream)?)),
			0x21 => Ok(TypeSignatureTag::Internal),
			0x45 => Ok(TypeSignatureTag::Pinned(TypeSignature::read(stream, index_sizes)?)),
			_ => Err(Error::new(ErrorKind::InvalidData, format!("unimplemented type signature tag {tag:#X}"))),
		}
	}
}

pub struct GenericInst<'l>(TypeSignature<'l>, TypeSignatureSequence<'l>);

impl<'l> GenericInst<'l> {
	pub fn read(stream: &mut Cursor<&'l [u8]>, index_sizes: &Arc<IndexSizes>) -> Result<Self> {
		let ty = TypeSignature::read(stream, index_sizes)?;
		let seq = TypeSignatureSequence::read(stream, index_sizes)?;
		Ok(Self(ty, seq))
	}

	pub fn ty(&self) -> &TypeSignature {
		&self.0
	}

	pub fn params(&self) -> impl Iterator<Item = TypeSignatureTag<'l>> + '_ {
		self.1.signatures()
	}

	#[inline]
	pub fn params_count(&self) -> usize {
		self.1.len()
	}
}

impl Debug for GenericInst<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("GenericInst");
		dbg.field("ty", &self.0);
		dbg.field("params", &self.1);
		dbg.finish()
	}
}

pub struct TypeSignatureSequence<'l>(u32, &'l [u8], Arc<IndexSizes>);

impl<'l> TypeSignatureSequence<'l> {
	#[inline]
	pub fn len(&self) -> usize {
		self.0 as usize
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.0 == 0
	}

	pub fn signatures(&self) -> impl Iterator<Item = TypeSignatureTag<'l>> + '_ {
		let mut stream = Cursor::new(self.1);
		(0..self.0).map(move |_| TypeSignatureTag::read(&mut stream, &self.2).unwrap())
	}

	pub fn read(stream: &mut Cursor<&'l [u8]>, index_sizes: &Arc<IndexSizes>) -> Result<Self> {
		let count = read_compressed_u32(stream)?;
		Self::read_n(stream, index_sizes, count)
	}

	pub fn read_n(stream: &mut Cursor<&'l [u8]>, index_sizes: &Arc<IndexSizes>, count: u32) -> Result<Self> {
		let start = stream.position() as usize;
		for _ in 0..count {
			let _ = TypeSignature::read(stream, index_sizes)?;
		}
		let end = stream.position() as usize;
		Ok(Self(count, &stream.get_ref()[start..end], index_sizes.clone()))
	}
}

impl Debug for TypeSignatureSequence<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_list();
		for sig in self.signatures() {
			dbg.entry(&sig);
		}
		dbg.finish()
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct CallingConvention: u8 {
		const DEFAULT = 0x0;
		const C = 0x1;
		const STD_CALL = 0x2;
		const THIS_CALL = 0x3;
		const FAST_CALL = 0x4;
		const VAR_ARG = 0x5;
		const UNMANAGED = 0x9;
		const GENERIC = 0x10;
		const HAS_THIS = 0x20;
		const EXPLICIT_THIS = 0x40;
	}
}

impl_from_byte_stream!(CallingConvention);

#[derive(Debug)]
pub struct MethodSignature<'l> {
	pub calling_convention: CallingConvention,
	pub return_type: TypeSignature<'l>,
	pub parameter_types: TypeSignatureSequence<'l>,
}

impl<'l> MethodSignature<'l> {
	pub fn read(stream: &mut Cursor<&'l [u8]>, index_sizes: &Arc<IndexSizes>) -> Result<Self> {
		let calling_convention = CallingConvention::read(stream, &())?;

		if calling_convention.contains(CallingConvention::GENERIC) {
			let _generic_param_count = read_compressed_u32(stream)?;
		}

		let param_count = read_compressed_u32(stream)?;
		let return_type = TypeSignature::read(stream, index_sizes)?;

		Ok(Self {
			calling_convention,
			return_type,
			parameter_types: TypeSignatureSequence::read_n(stream, index_sizes, param_count)?,
		})
	}
}
