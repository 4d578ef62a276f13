//! Code-access security (CAS) for untrusted modules loaded into a shared
//! managed runtime: §3's data model and §4's nine components, laid out one
//! module per component.
//!
//! [`policy`] and [`binding`] compile human-authored allow-lists into the
//! O(1) [`identity::MemberId`] membership test (§4.A/§4.B); [`shim`] maps
//! sensitive library calls to safe replacements (§4.C); [`resolver`]
//! determines late-bound dispatch targets (§4.D); [`rewrite`] is the
//! generic instruction-buffer editor the loader drives (§4.E); [`guard`]
//! holds the per-call-site cache (§4.F); [`loader`] ties all of the above
//! together into the assembly loader/instrumentor and the runtime entry
//! points injected code calls into (§4.G); [`violation`] is the extension
//! point for what a denial actually does (§4.H); [`stackalloc`] verifies
//! the one safe `localloc` idiom (§4.I). [`error`] collects the error kinds
//! every other module raises.

pub mod binding;
pub mod error;
pub mod guard;
pub mod identity;
pub mod loader;
pub mod policy;
pub mod resolver;
pub mod rewrite;
pub mod shim;
pub mod stackalloc;
pub mod violation;

pub use binding::{Accessibility, TypeBinding};
pub use error::{BindingError, GuardError, InvalidStateError, LoadError, SecurityViolation, ViolationReason};
pub use identity::{MemberId, ModuleId};
pub use loader::{CallingAssembly, Loader, LoaderOptions, ModuleHandle};
pub use policy::{CasPolicy, CasPolicyBuilder};
pub use resolver::{DeclaredMethod, Receiver, ResolveError, ResolvedMethod};
pub use shim::{lookup_shim, register_shim, Shim, ShimTable, SignatureHash};
pub use violation::{DefaultViolationHandler, LoggingViolationHandler, RecordingViolationHandler, ViolationHandler};
