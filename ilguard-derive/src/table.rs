use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields};

/// Generates a `<Name>Table` row store plus the glue that lets `<Name>` be
/// read row-by-row out of the `#~` stream.
///
/// Every field type must implement `FromByteStream` with a `Deps` that
/// `IndexSizes` can produce via `AsRef` - this holds for the primitive
/// integer types, the three heap index newtypes and every coded index,
/// so no per-field special casing is needed here.
pub fn derive(tokens: proc_macro::TokenStream) -> TokenStream {
	let DeriveInput { vis, ident, data, .. } = syn::parse(tokens).unwrap();

	let fields = match data {
		Data::Struct(data) => match data.fields {
			Fields::Named(fields) => fields.named,
			_ => panic!("Table can only be derived for structs with named fields"),
		},
		_ => panic!("Table can only be derived for structs"),
	};

	let table = format_ident!("{}Table", ident);
	let field_idents = fields.iter().map(|f| f.ident.clone().unwrap()).collect::<Vec<_>>();
	let field_types = fields.iter().map(|f| f.ty.clone()).collect::<Vec<_>>();

	quote! {
		#[derive(Debug)]
		#vis struct #table {
			rows: Vec<#ident>,
		}

		impl #table {
			pub fn read(
				stream: &mut std::io::Cursor<&[u8]>,
				sizes: &crate::metadata::indices::IndexSizes,
				len: usize,
			) -> std::io::Result<Self> {
				let mut rows = Vec::with_capacity(len);
				for _ in 0..len {
					rows.push(#ident {
						#(#field_idents: crate::utilities::FromByteStream::read(
							stream,
							::std::convert::AsRef::<<#field_types as crate::utilities::FromByteStream>::Deps>::as_ref(sizes),
						)?),*
					});
				}
				Ok(Self { rows })
			}

			pub fn rows(&self) -> &[#ident] {
				&self.rows
			}

			/// Builds a table directly from already-constructed rows, bypassing
			/// the `#~` stream byte format — for assembling fixture tables.
			pub fn from_rows(rows: Vec<#ident>) -> Self {
				Self { rows }
			}

			pub fn row(&self, index: usize) -> Option<&#ident> {
				self.rows.get(index)
			}
		}

		impl crate::metadata::heaps::table::Table for #table {
			fn len(&self) -> usize {
				self.rows.len()
			}

			fn kind(&self) -> crate::metadata::heaps::table::TableKind {
				crate::metadata::heaps::table::TableKind::#ident
			}
		}

		impl crate::metadata::heaps::table::TableRow for #ident {
			const KIND: crate::metadata::heaps::table::TableKind = crate::metadata::heaps::table::TableKind::#ident;
			type Table = #table;
		}
	}
}
