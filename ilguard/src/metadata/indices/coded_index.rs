use std::fmt::{Debug, Formatter};
use std::io::{Cursor, ErrorKind, Read};

use paste::paste;

use crate::metadata::heaps::table::TableKind;
use crate::metadata::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::metadata::indices::sizes::{IndexSizes, SizeOf};
use crate::utilities::{read_compressed_u32, FromByteStream};

macro_rules! define_coded_index {
	($($id: ident: [$($variant: ident),*]),*) => {
		#[repr(u32)]
		#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
		pub enum CodedIndexKind {
			$($id),*
		}

		$(
			#[repr(transparent)]
			#[derive(Copy, Clone, Eq, PartialEq, Hash)]
			pub struct $id(u32);

			impl Debug for $id {
				fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
					let token: MetadataToken = (*self).into();
					write!(f, "{}(", stringify!($id))?;
					self.0.fmt(f)?;
					write!(f, ") | ")?;
					token.fmt(f)
				}
			}

			impl TryFrom<u32> for $id {
				type Error = ();
				fn try_from(value: u32) -> Result<Self, Self::Error> {
					match CodedIndexKind::$id.is_valid(value) {
						false => Err(()),
						true => Ok(Self(value)),
					}
				}
			}

			impl FromByteStream for $id {
				type Deps = IndexSizes;
				fn read(stream: &mut Cursor<&[u8]>, sizes: &Self::Deps) -> std::io::Result<Self> {
					let size = <IndexSizes as SizeOf<$id>>::size_of(sizes);
					let mut bytes = 0u32.to_ne_bytes();
					stream.read_exact(&mut bytes[..size])?;
					let value = u32::from_le_bytes(bytes);
					Self::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
				}
			}

			impl SizeOf<$id> for IndexSizes {
				fn size_of(&self) -> usize {
					self.coded[CodedIndexKind::$id as usize]
				}
			}

			impl $id {
				pub fn read_compressed(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
					let value = read_compressed_u32(stream)?;
					Self::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
				}
			}

			impl From<$id> for MetadataToken {
				fn from(value: $id) -> Self {
					const BITS: u32 = CodedIndexKind::$id.mask_bits();
					let token = CodedIndexKind::$id.token_kind(value.0);
					let val = ((token as u32) << 24) | (value.0 >> BITS);
					MetadataToken::try_from(val).unwrap()
				}
			}

			paste! {
				$(
					impl TryFrom<$id> for crate::metadata::indices::metadata_token::[<$variant Token>] {
						type Error = ();
						fn try_from(value: $id) -> Result<Self, Self::Error> {
							use crate::metadata::indices::metadata_token::*;
							let token = MetadataToken::from(value);
							[<$variant Token>]::try_from(token)
						}
					}
				)*
			}
		)*

		const TABLES: &[&[TableKind]] = &[$(&[$(TableKind::$variant),*]),*];
		const TOKENS: &[&[MetadataTokenKind]] = &[$(&[$(MetadataTokenKind::$variant),*]),*];
	};
}

define_coded_index! {
	TypeDefOrRef: [TypeDef, TypeRef, TypeSpec],
	HasConstant: [Field, Param, Property],
	HasCustomAttribute: [
		MethodDef, Field, TypeRef, TypeDef, Param, InterfaceImpl, MemberRef,
		Module, DeclSecurity, Property, Event, StandAloneSig, ModuleRef,
		TypeSpec, Assembly, AssemblyRef, File, ExportedType,
		ManifestResource, GenericParam, GenericParamConstraint, MethodSpec
	],
	HasFieldMarshal: [Field, Param],
	HasDeclSecurity: [TypeDef, MethodDef, Assembly],
	MemberRefParent: [TypeDef, TypeRef, ModuleRef, MethodDef, TypeSpec],
	HasSemantics: [Event, Property],
	MethodDefOrRef: [MethodDef, MemberRef],
	MemberForwarded: [Field, MethodDef],
	Implementation: [File, AssemblyRef, ExportedType],
	CustomAttributeType: [MethodDef, MemberRef],
	ResolutionScope: [Module, ModuleRef, AssemblyRef, TypeRef],
	TypeOrMethodDef: [TypeDef, MethodDef]
}

impl CodedIndexKind {
	pub const fn get_size(&self, table_sizes: &[u32; 55]) -> usize {
		let mut i = 0;
		let mut max = 0;
		let bits = self.mask_bits();
		let tables = TABLES[*self as usize];
		while i < tables.len() {
			let table = tables[i];
			let size = table_sizes[table as usize] as usize;
			if max < size {
				max = size;
			}
			i += 1;
		}

		2 + 2 * (max > (1 << (16 - bits))) as usize
	}

	pub const fn mask(&self) -> u32 {
		match self {
			CodedIndexKind::CustomAttributeType => 0x7,
			_ => {
				let tokens = TABLES[*self as usize];
				match tokens.len() {
					0 | 1 => 0,
					_ => u32::MAX.overflowing_shr((tokens.len() as u32 - 1).leading_zeros()).0,
				}
			},
		}
	}

	pub const fn mask_bits(&self) -> u32 {
		match self {
			CodedIndexKind::CustomAttributeType => 0x3,
			_ => {
				let tokens = TABLES[*self as usize];
				32 - (tokens.len() as u32 - 1).leading_zeros()
			},
		}
	}

	pub const fn is_valid(&self, value: u32) -> bool {
		let discriminant = value & self.mask();
		match self {
			CodedIndexKind::CustomAttributeType => matches!(discriminant, 2 | 3),
			_ => {
				let tables = TABLES[*self as usize];
				((value & self.mask()) as usize) < tables.len()
			},
		}
	}

	pub const fn token_kind(&self, value: u32) -> MetadataTokenKind {
		let mask = self.mask();
		let discriminant = value & mask;
		match self {
			CodedIndexKind::CustomAttributeType => match discriminant {
				2 => MetadataTokenKind::MethodDef,
				3 => MetadataTokenKind::MemberRef,
				_ => unreachable!(),
			},
			_ => TOKENS[*self as usize][discriminant as usize],
		}
	}
}
