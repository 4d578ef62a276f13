//! Fixed-width index types used by the `#~` table stream: metadata tokens,
//! coded indices and plain row references, all sized against the heap and
//! table row counts recorded in the stream header.

pub mod coded_index;
pub mod metadata_token;
pub mod row_index;
pub mod sizes;

pub use metadata_token::{MetadataToken, MetadataTokenKind};
pub use row_index::RowIndex;
pub use sizes::{IndexSizes, SizeOf};
