//! Parsing of CLI (ECMA-335) assemblies: the PE container, the CLI header,
//! the metadata root and its heaps, and the IL instruction stream.
//!
//! Everything here is read-only. Rewriting method bodies happens one layer
//! up, in `cas::rewrite`, which consumes [`il::MethodBody`] and produces a
//! fresh instruction stream rather than mutating this one in place.

pub mod cli;
pub mod heaps;
pub mod il;
pub mod indices;
pub mod pe;

pub use cli::Assembly;
