//! Code-access security (CAS) enforcement for untrusted CLI (ECMA-335)
//! assemblies loaded as plug-in modules into a shared managed runtime.
//!
//! [`metadata`] is the read-only half: parsing a PE image's CLI header,
//! metadata heaps and tables, and decoding IL method bodies. [`cas`] is the
//! enforcement half built on top of it — bytecode rewriting, late-binding
//! resolution and the allow-list policy a [`cas::Loader`] instruments every
//! loaded module against. See `DESIGN.md` at the crate root for how each
//! piece maps back to the host runtime's own behaviour.
//!
//! ```no_run
//! use ilguard::cas::{CasPolicyBuilder, Loader};
//!
//! let policy = CasPolicyBuilder::new().build();
//! let loader = Loader::new(policy);
//! let module = loader.load_from_bytes(&std::fs::read("plugin.dll")?)?;
//! println!("instrumented {} methods", module.instrumented_methods());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cas;
pub mod metadata;
mod utilities;
