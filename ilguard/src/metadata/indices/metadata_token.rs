use std::fmt::{Debug, Formatter};
use std::io::{Cursor, ErrorKind};

use paste::paste;

use crate::utilities::FromByteStream;

macro_rules! define_metadata_token {
	($($id: ident = $discriminant: literal),*) => {
		#[repr(u32)]
		#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
		pub enum MetadataTokenKind {
			$($id = $discriminant),*
		}

		#[repr(transparent)]
		#[derive(Copy, Clone, Eq, PartialEq, Hash)]
		pub struct MetadataToken(u32);

		impl MetadataToken {
			pub fn kind(&self) -> MetadataTokenKind {
				let discriminant = (self.0 & 0xFF000000) >> 24;
				match discriminant {
					$($discriminant => MetadataTokenKind::$id,)*
					_ => unreachable!(),
				}
			}

			#[inline]
			pub fn index(&self) -> usize {
				(self.0 & 0x00FFFFFF) as usize
			}

			#[inline]
			pub fn raw(&self) -> u32 {
				self.0
			}
		}

		impl TryFrom<u32> for MetadataToken {
			type Error = ();
			fn try_from(value: u32) -> Result<Self, Self::Error> {
				let discriminant = (value & 0xFF000000) >> 24;
				match discriminant {
					$($discriminant => Ok(Self(value)),)*
					_ => Err(()),
				}
			}
		}

		paste! {
			$(
				#[repr(transparent)]
				#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
				pub struct [<$id Token>](pub usize);

				impl From<[<$id Token>]> for MetadataToken {
					fn from(value: [<$id Token>]) -> Self {
						MetadataToken(((MetadataTokenKind::$id as u32) << 24) | value.0 as u32)
					}
				}

				impl TryFrom<MetadataToken> for [<$id Token>] {
					type Error = ();
					fn try_from(value: MetadataToken) -> Result<Self, Self::Error> {
						match value.kind() {
							MetadataTokenKind::$id => Ok(Self(value.index())),
							_ => Err(()),
						}
					}
				}
			)*
		}
	};
}

impl Debug for MetadataToken {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "MetadataToken::{:?}(", self.kind())?;
		self.index().fmt(f)?;
		write!(f, ")")
	}
}

impl FromByteStream for MetadataToken {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let value = u32::read(stream, &())?;
		MetadataToken::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
	}
}

define_metadata_token! {
	Module = 0x00,
	TypeRef = 0x01,
	TypeDef = 0x02,
	Field = 0x04,
	MethodDef = 0x06,
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
	Event = 0x14,
	PropertyMap = 0x15,
	Property = 0x17,
	MethodSemantics = 0x18,
	MethodImpl = 0x19,
	ModuleRef = 0x1a,
	TypeSpec = 0x1b,
	ImplMap = 0x1c,
	FieldRVA = 0x1d,
	Assembly = 0x20,
	AssemblyRef = 0x23,
	File = 0x26,
	ExportedType = 0x27,
	ManifestResource = 0x28,
	NestedClass = 0x29,
	GenericParam = 0x2a,
	MethodSpec = 0x2b,
	GenericParamConstraint = 0x2c,

	String = 0x70
}
