//! §4.G: the assembly loader and instrumentor, and §6's runtime entry
//! points (the "injected code" a guarded call site actually invokes). A
//! [`Loader`] owns one [`CasPolicy`], one [`GuardHolder`], and the set of
//! modules it has instrumented; [`ModuleId`] is the process-unique key a
//! running frame uses to find its way back to the [`Loader`] that loaded it,
//! standing in for a live CLR module handle (see `cas::identity`'s docs).

use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::io::Cursor;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use crate::cas::error::{GuardError, InvalidStateError, LoadError, SecurityViolation, ViolationReason};
use crate::cas::guard::{CallSiteId, CallSiteKind, GuardHolder};
use crate::cas::identity::{MemberId, ModuleId};
use crate::cas::policy::CasPolicy;
use crate::cas::resolver::{self, DeclaredMethod, Receiver, ResolvedMethod};
use crate::cas::rewrite::{MethodRewriter, RewrittenBody, SyntheticOp};
use crate::cas::shim;
use crate::cas::stackalloc;
use crate::cas::violation::{DefaultViolationHandler, ViolationHandler};
use crate::metadata::cli::RuntimeFlags;
use crate::metadata::heaps::table::{FieldTable, MemberRefTable, MethodAttributes, MethodDefTable, StandAloneSigTable, TypeAttributes, TypeDefTable};
use crate::metadata::il::{CompoundOpCode, MethodBody, MethodSignature, OpCode, OpCodeIterator};
use crate::metadata::indices::metadata_token::{MetadataToken, MetadataTokenKind, MethodDefToken};
use crate::metadata::Assembly;

/// Process-wide weak map from a loaded module's identity to the loader that
/// instrumented it. A running frame only ever has a [`ModuleId`]; the
/// runtime entry points dereference through here to find the policy,
/// violation handler and guard cache that apply to it. An absent entry (the
/// module was never loaded through a [`Loader`]) means "fully trusted" — the
/// load-boundary rule, §7. A *present* entry whose weak reference no longer
/// upgrades is a different case entirely — see [`LoaderLookup`].
static MODULE_LOADERS: OnceLock<RwLock<HashMap<ModuleId, Weak<LoaderState>>>> = OnceLock::new();

fn module_registry() -> &'static RwLock<HashMap<ModuleId, Weak<LoaderState>>> {
	MODULE_LOADERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Outcome of looking `module` up in the process-wide registry.
/// [`LoaderLookup::Unregistered`] is the load-boundary rule's "never loaded
/// through a `Loader`" case (§7) and is not an error — callers treat it as
/// fully trusted. A registry entry whose weak reference no longer upgrades
/// means the module *was* registered and its loader has since been dropped
/// out from under a still-running frame, which can only happen if the host
/// drops every `Loader` handle while a `ModuleHandle` (and the sandboxed
/// code running under it) is still alive — a host bug, not a policy
/// decision, so it reports [`InvalidStateError`] instead (§7 kind 4).
enum LoaderLookup {
	Unregistered,
	Found(Loader),
}

fn loader_for(module: ModuleId) -> Result<LoaderLookup, InvalidStateError> {
	let registry = module_registry().read().unwrap_or_else(|e| e.into_inner());
	match registry.get(&module) {
		None => Ok(LoaderLookup::Unregistered),
		Some(weak) => match weak.upgrade() {
			Some(state) => Ok(LoaderLookup::Found(Loader(state))),
			None => Err(InvalidStateError(format!("{module:?} is registered but its loader has already been dropped"))),
		},
	}
}

/// Content hashes of every module instrumented so far, process-wide — §8's
/// idempotence property ("re-instrumenting an already-instrumented module is
/// a no-op, not a double guard") implemented as "don't instrument the same
/// bytes twice" rather than by detecting the verifier prelude in the IL
/// stream itself, since this crate never writes that prelude back into a
/// byte image in the first place (see `cas::rewrite`'s module docs).
static INSTRUMENTED_HASHES: OnceLock<Mutex<HashSet<u64>>> = OnceLock::new();

fn instrumented_hashes() -> &'static Mutex<HashSet<u64>> {
	INSTRUMENTED_HASHES.get_or_init(|| Mutex::new(HashSet::new()))
}

fn content_hash(bytes: &[u8]) -> u64 {
	let mut hasher = fxhash::FxHasher::default();
	hasher.write(bytes);
	hasher.finish()
}

/// The calling-assembly token a guarded call site passes to every runtime
/// entry point — the Rust stand-in for "the assembly that JIT-compiled the
/// currently executing frame" (§1's `[AMBIENT]` note: there is no live call
/// stack to walk here, so the instrumented code carries its own identity).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CallingAssembly(pub ModuleId);

struct LoaderState {
	policy: CasPolicy,
	violation_handler: RwLock<Arc<dyn ViolationHandler>>,
	guard: GuardHolder,
	corelib: Option<Arc<Assembly>>,
	corelib_module: Option<ModuleId>,
	/// Modules loaded by *this* `Loader` instance — §4.G's same-loader trust
	/// shortcut (`loaded_by`) is a membership test against exactly this set.
	modules: Mutex<HashMap<ModuleId, Arc<Assembly>>>,
	/// Assemblies whose metadata this loader can read for cross-module
	/// resolution — declaring-type lookups the resolver/binding layers need
	/// to evaluate a call against a module this loader didn't itself load —
	/// without granting them the same-loader trust shortcut. Kept separate
	/// from `modules` so "this loader can parse that assembly's tables" never
	/// gets conflated with "that assembly is trusted" (§4.G).
	known_assemblies: Mutex<HashMap<ModuleId, Arc<Assembly>>>,
	display_name: Option<String>,
	collectible: bool,
}

/// Configuration for a [`Loader`], mirroring a CLR `AssemblyLoadContext`'s
/// construction knobs that actually matter for CAS enforcement: whether the
/// context is collectible, a display name for diagnostics, the core library
/// assembly (if any) rule 3's array-base resolution needs, and the handler
/// that reacts to a denied call.
pub struct LoaderOptions {
	pub display_name: Option<String>,
	pub collectible: bool,
	/// The assembly `System.Object`/`System.Array`'s pseudo method table is
	/// resolved against (§4.D rule 3). `None` makes array-receiver virtual
	/// calls always fail closed with `UnsupportedDispatchShape`.
	pub corelib: Option<Arc<Assembly>>,
	pub violation_handler: Arc<dyn ViolationHandler>,
}

impl Default for LoaderOptions {
	fn default() -> Self {
		Self { display_name: None, collectible: false, corelib: None, violation_handler: Arc::new(DefaultViolationHandler) }
	}
}

/// A loaded, already-instrumented module. Dropping the last handle to a
/// module unregisters it from the process-wide loader registry; it carries
/// no reference back to its bytes or rewritten bodies, since producing a
/// byte image from a [`RewrittenBody`] is the PE writer's job, not this
/// crate's (see `cas::rewrite`'s module docs).
pub struct ModuleHandle {
	id: ModuleId,
	assembly: Arc<Assembly>,
	instrumented_methods: usize,
}

impl ModuleHandle {
	pub fn id(&self) -> ModuleId {
		self.id
	}
	pub fn assembly(&self) -> &Arc<Assembly> {
		&self.assembly
	}
	pub fn instrumented_methods(&self) -> usize {
		self.instrumented_methods
	}
}

impl Drop for ModuleHandle {
	fn drop(&mut self) {
		module_registry().write().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
	}
}

/// Owns one [`CasPolicy`] and the modules loaded under it. Cheap to clone —
/// an `Arc` around the shared state, matching `CasPolicy`'s own "safe to
/// share across threads" contract (§5).
#[derive(Clone)]
pub struct Loader(Arc<LoaderState>);

impl Loader {
	pub fn new(policy: CasPolicy) -> Self {
		Self::with_options(policy, LoaderOptions::default())
	}

	pub fn with_options(policy: CasPolicy, options: LoaderOptions) -> Self {
		let corelib_module = options.corelib.as_ref().map(|_| ModuleId::next());
		let mut modules = HashMap::new();
		if let (Some(corelib), Some(id)) = (&options.corelib, corelib_module) {
			modules.insert(id, corelib.clone());
		}

		Loader(Arc::new(LoaderState {
			policy,
			violation_handler: RwLock::new(options.violation_handler),
			guard: GuardHolder::new(),
			corelib: options.corelib,
			corelib_module,
			modules: Mutex::new(modules),
			known_assemblies: Mutex::new(HashMap::new()),
			display_name: options.display_name,
			collectible: options.collectible,
		}))
	}

	pub fn policy(&self) -> &CasPolicy {
		&self.0.policy
	}

	pub fn display_name(&self) -> Option<&str> {
		self.0.display_name.as_deref()
	}

	pub fn is_collectible(&self) -> bool {
		self.0.collectible
	}

	pub fn set_violation_handler(&self, handler: Arc<dyn ViolationHandler>) {
		*self.0.violation_handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
	}

	/// Registers an already-built `Assembly` under `module` without parsing
	/// bytes or running the instrumentation pass, as if `module` had been
	/// loaded through this `Loader` — §4.G's same-loader trust shortcut
	/// applies to it from here on, exactly as it would to a module
	/// `load_from_bytes` actually instrumented. The caller mints `module`
	/// itself (`ModuleId::next()`) so it can be baked into a `CasPolicy`
	/// before the `Loader` that will serve it even exists — for driving the
	/// resolver/binding/guard layers directly against a fixture assembly
	/// assembled from table rows rather than a real PE image. Use
	/// [`register_referenced_assembly`](Self::register_referenced_assembly)
	/// instead for a module whose metadata needs to be readable without also
	/// extending it that trust.
	pub fn register_module(&self, module: ModuleId, assembly: Arc<Assembly>) {
		self.0.modules.lock().unwrap_or_else(|e| e.into_inner()).insert(module, assembly);
		module_registry().write().unwrap_or_else(|e| e.into_inner()).insert(module, Arc::downgrade(&self.0));
	}

	/// Makes `assembly`'s metadata readable by this loader's resolver and
	/// binding layers under `module` — declaring-type lookups for a
	/// cross-module virtual call, `TypeBinding` construction against it, and
	/// so on — without treating `module` as loaded by this `Loader`. Unlike
	/// [`register_module`](Self::register_module), a module registered this
	/// way never gets the same-loader trust shortcut: every member on it is
	/// still evaluated against the policy. For wiring a fixture's "library"
	/// assembly a sandboxed caller references, so a test can assert the same
	/// per-member denial a real cross-assembly policy check would produce.
	pub fn register_referenced_assembly(&self, module: ModuleId, assembly: Arc<Assembly>) {
		self.0.known_assemblies.lock().unwrap_or_else(|e| e.into_inner()).insert(module, assembly);
	}

	/// Parses `bytes` as a managed PE image, instruments every method body,
	/// and registers the result under a fresh [`ModuleId`]. Refuses to load
	/// the same bytes twice (§8's idempotence property) and refuses anything
	/// that isn't IL-only (§4.G: a loader only ever instruments managed code
	/// — an unmanaged/mixed-mode module can't be guarded at the IL level at
	/// all, so loading it into a sandboxed context is refused outright
	/// rather than silently let through ungoverned).
	#[tracing::instrument(skip_all)]
	pub fn load_from_bytes(&self, bytes: &[u8]) -> Result<ModuleHandle, LoadError> {
		let hash = content_hash(bytes);
		if !instrumented_hashes().lock().unwrap_or_else(|e| e.into_inner()).insert(hash) {
			return Err(LoadError::AlreadyInstrumented);
		}

		match self.load_from_bytes_inner(bytes) {
			Ok(handle) => Ok(handle),
			Err(e) => {
				instrumented_hashes().lock().unwrap_or_else(|e| e.into_inner()).remove(&hash);
				Err(e)
			},
		}
	}

	fn load_from_bytes_inner(&self, bytes: &[u8]) -> Result<ModuleHandle, LoadError> {
		let assembly = Assembly::parse(Arc::from(bytes))?;
		if !assembly.cli_header().flags.contains(RuntimeFlags::IL_ONLY) {
			return Err(LoadError::UnmanagedLibrary);
		}

		let module = ModuleId::next();
		let mut instrumented = 0usize;

		if let Some(tables) = assembly.table_heap() {
			if let Some(methods) = tables.get_table::<MethodDefTable>() {
				let empty_signatures = StandAloneSigTable::read(&mut Cursor::new(&[][..]), tables.sizes(), 0)?;
				let signatures = tables.get_table::<StandAloneSigTable>().unwrap_or(&empty_signatures);

				for row in 0..methods.len() {
					let Some(method) = methods.row(row) else { continue };
					if method.rva == 0 {
						// Abstract, P/Invoke or runtime-provided: no body to instrument.
						continue;
					}

					let Some(body_bytes) = assembly.pe_file().resolve_rva(method.rva) else {
						return Err(LoadError::Metadata(format!("method row {row}: rva does not resolve to a section")));
					};
					let Some(blob_heap) = assembly.blob_heap() else {
						return Err(LoadError::Metadata("module has no #Blob heap".into()));
					};

					let mut cursor = Cursor::new(body_bytes.as_ref());
					let body = MethodBody::read(&mut cursor, blob_heap, signatures, tables.sizes()).map_err(|e| LoadError::Metadata(e.to_string()))?;

					let method_token: MetadataToken = MethodDefToken(row + 1).into();
					if let Err(violation) = stackalloc::verify(&assembly, &body) {
						return Err(LoadError::UnsupportedStackalloc { method: method_token, reason: violation.reason() });
					}

					let _rewritten = instrument_method(&assembly, module, method_token, &body)?;
					instrumented += 1;
				}
			}
		}

		let assembly = Arc::new(assembly);
		self.0.modules.lock().unwrap_or_else(|e| e.into_inner()).insert(module, assembly.clone());
		module_registry().write().unwrap_or_else(|e| e.into_inner()).insert(module, Arc::downgrade(&self.0));

		Ok(ModuleHandle { id: module, assembly, instrumented_methods: instrumented })
	}
}

fn assembly_for(state: &LoaderState, module: ModuleId) -> Option<Arc<Assembly>> {
	if let Some(assembly) = state.modules.lock().unwrap_or_else(|e| e.into_inner()).get(&module).cloned() {
		return Some(assembly);
	}
	state.known_assemblies.lock().unwrap_or_else(|e| e.into_inner()).get(&module).cloned()
}

/// A `MethodDef`'s or (same-module) `MemberRef`'s owning type, by walking the
/// `TypeDef` table's method/field ranges — the metadata model exposes these
/// ranges but never the reverse lookup, since nothing short of instrumenting
/// a call site needs it.
fn owning_type_row_of_method(assembly: &Assembly, method_row: usize) -> Option<usize> {
	let tables = assembly.table_heap()?;
	let methods = tables.get_table::<MethodDefTable>()?;
	let type_defs = tables.get_table::<TypeDefTable>()?;
	(0..type_defs.len()).find(|&t| type_defs.method_range(methods, t).contains(&method_row))
}

fn owning_type_row_of_field(assembly: &Assembly, field_row: usize) -> Option<usize> {
	let tables = assembly.table_heap()?;
	let fields = tables.get_table::<FieldTable>()?;
	let type_defs = tables.get_table::<TypeDefTable>()?;
	(0..type_defs.len()).find(|&t| type_defs.field_range(fields, t).contains(&field_row))
}

/// The declaring type of `token`, resolved for error reporting. A
/// `MemberRef`'s parent is read straight out of its row; a `MethodDef`/
/// `Field` row's owner is found by walking `TypeDef`'s ranges, since those
/// tables record the reverse edge (type → members) rather than the forward
/// one this needs.
fn declaring_type_of(assembly: &Assembly, token: MetadataToken) -> MetadataToken {
	let resolved = (|| {
		let tables = assembly.table_heap()?;
		match token.kind() {
			MetadataTokenKind::MemberRef => {
				let refs = tables.get_table::<MemberRefTable>()?;
				let row = refs.row(token.index().checked_sub(1)?)?;
				Some(row.class.into())
			},
			MetadataTokenKind::MethodDef => {
				let row = owning_type_row_of_method(assembly, token.index() - 1)?;
				Some(crate::metadata::indices::metadata_token::TypeDefToken(row + 1).into())
			},
			MetadataTokenKind::Field => {
				let row = owning_type_row_of_field(assembly, token.index() - 1)?;
				Some(crate::metadata::indices::metadata_token::TypeDefToken(row + 1).into())
			},
			_ => None,
		}
	})();
	resolved.unwrap_or(token)
}

fn violation_for(state: &LoaderState, member: MemberId, reason: ViolationReason) -> SecurityViolation {
	let declaring_type = assembly_for(state, member.0).map(|a| declaring_type_of(&a, member.1)).unwrap_or(member.1);
	SecurityViolation { member: member.1, declaring_type, reason }
}

/// The policy-only predicate: "is this member callable by *any* caller,
/// independent of which assembly asks, ignoring how it's dispatched." On its
/// own this is only safe to cache for a non-virtual call site (§4.F):
/// caching it for a virtual/interface site would skip resolving the
/// receiver's override entirely. [`can_cache_virtual_call_always`] is the
/// predicate a virtual call site's guard cache must use instead.
pub fn can_call_always(policy: &CasPolicy, member: MemberId) -> bool {
	policy.contains_method(&member) || policy.contains_field(&member)
}

/// §4.F/§4.G's `CanCallAlways` for a *virtual* call site: a declared method
/// may only have its "always allowed" answer cached across every receiver a
/// call site ever sees when no receiver could possibly dispatch somewhere
/// else — i.e. the method is non-virtual, `final`, or declared on a sealed
/// type. A policy-allowed but overridable virtual method must still fall
/// through to the slow path on every call, since an override that isn't in
/// policy would otherwise be wrongly let through by a cached `true`.
fn can_cache_virtual_call_always(state: &LoaderState, member: MemberId) -> bool {
	can_call_always(&state.policy, member) && is_non_overridable(state, member)
}

fn is_non_overridable(state: &LoaderState, member: MemberId) -> bool {
	let Some(assembly) = assembly_for(state, member.0) else { return false };
	if member.1.kind() != MetadataTokenKind::MethodDef {
		return false;
	}
	let Some(tables) = assembly.table_heap() else { return false };
	let Some(methods) = tables.get_table::<MethodDefTable>() else { return false };
	let Some(method) = methods.row(member.1.index() - 1) else { return false };

	if !method.flags.is_virtual() || method.flags.contains(MethodAttributes::FINAL) {
		return true;
	}

	let Some(type_defs) = tables.get_table::<TypeDefTable>() else { return false };
	let Some(type_row) = owning_type_row_of_method(&assembly, member.1.index() - 1) else { return false };
	type_defs.row(type_row).map(|t| t.flags.contains(TypeAttributes::SEALED)).unwrap_or(false)
}

/// True when `module` was loaded into `state`'s own `Loader` — §4.G's
/// same-assembly shortcut is "declared in an assembly loaded by the same
/// loader instance," not "shares the caller's module id": a target module
/// registered on the caller's own loader is trusted even when it isn't the
/// caller itself.
fn loaded_by(state: &LoaderState, module: ModuleId) -> bool {
	state.modules.lock().unwrap_or_else(|e| e.into_inner()).contains_key(&module)
}

fn evaluate(state: &LoaderState, member: MemberId) -> Result<(), SecurityViolation> {
	if loaded_by(state, member.0) || can_call_always(&state.policy, member) {
		Ok(())
	} else {
		Err(violation_for(state, member, ViolationReason::NotInPolicy))
	}
}

/// `check_access(caller, site)` — the non-virtual guard (field access, plain
/// `call`, `newobj`). Same-assembly access is always allowed; cross-assembly
/// access is allowed iff `site.member` is in the loader's policy. An
/// unregistered caller (no loader was ever told about its module) passes
/// unconditionally — the load-boundary rule, §7.
pub fn check_access(caller: CallingAssembly, site: CallSiteId) -> Result<(), GuardError> {
	let state = match loader_for(caller.0)? {
		LoaderLookup::Unregistered => return Ok(()),
		LoaderLookup::Found(loader) => loader.0,
	};
	let allowed = state.guard.is_always_allowed(site, || loaded_by(&state, site.member.0) || can_call_always(&state.policy, site.member));
	if allowed {
		Ok(())
	} else {
		Err(violation_for(&state, site.member, ViolationReason::NotInPolicy).into())
	}
}

/// `check_virtual_call(caller, site, receiver)` — resolves `site.member` as
/// actually dispatched on `receiver` (§4.D rules 1-4) before evaluating
/// policy against the method that will really run, not the declaration the
/// call site names. The guard cache only ever stores the provably-universal
/// "always allowed regardless of override" answer; anything else re-resolves
/// and re-evaluates on every call, since the receiver varies call to call.
pub fn check_virtual_call(caller: CallingAssembly, site: CallSiteId, receiver: Receiver) -> Result<(), GuardError> {
	let state = match loader_for(caller.0)? {
		LoaderLookup::Unregistered => return Ok(()),
		LoaderLookup::Found(loader) => loader.0,
	};
	if state.guard.is_always_allowed(site, || can_cache_virtual_call_always(&state, site.member)) {
		return Ok(());
	}
	resolve_and_check(&state, site.member, receiver).map_err(GuardError::Violation)
}

/// `check_virtual_call_constrained(caller, site, constrained_type, receiver)`
/// — the `constrained.` prefix's variant: when the constraint names a type
/// local to this module, dispatch is resolved against *that* type instead of
/// `receiver`'s own (boxing a value-type receiver never changes which
/// concrete method actually runs, only whether a box exists to dispatch
/// through — irrelevant to which method the policy check runs against).
pub fn check_virtual_call_constrained(caller: CallingAssembly, site: CallSiteId, constrained_type: MetadataToken, receiver: Receiver) -> Result<(), GuardError> {
	let state = match loader_for(caller.0)? {
		LoaderLookup::Unregistered => return Ok(()),
		LoaderLookup::Found(loader) => loader.0,
	};
	if state.guard.is_always_allowed(site, || can_cache_virtual_call_always(&state, site.member)) {
		return Ok(());
	}
	let receiver = match constrained_type.kind() {
		MetadataTokenKind::TypeDef => Receiver::Instance { type_row: constrained_type.index() - 1 },
		_ => receiver,
	};
	resolve_and_check(&state, site.member, receiver).map_err(GuardError::Violation)
}

fn resolve_and_check(state: &LoaderState, declared: MemberId, receiver: Receiver) -> Result<(), SecurityViolation> {
	let Some(assembly) = assembly_for(state, declared.0) else {
		return Err(violation_for(state, declared, ViolationReason::UnsupportedDispatchShape));
	};
	if declared.1.kind() != MetadataTokenKind::MethodDef {
		// A virtual call declared through a MemberRef names a method in
		// another module; this loader can't walk another assembly's type
		// hierarchy from here, so it fails closed rather than guess.
		return Err(violation_for(state, declared, ViolationReason::UnsupportedDispatchShape));
	}

	let method_row = declared.1.index() - 1;
	let Some(declaring_row) = owning_type_row_of_method(&assembly, method_row) else {
		return Err(violation_for(state, declared, ViolationReason::UnsupportedDispatchShape));
	};
	let spec = DeclaredMethod { declaring_type: declaring_row, method_row };

	match resolver::resolve(&assembly, receiver, spec) {
		Err(e) => Err(violation_for(state, declared, e.into())),
		Ok(ResolvedMethod::Unchanged) => evaluate(state, declared),
		Ok(ResolvedMethod::Override { method_row, .. }) => {
			let token: MetadataToken = MethodDefToken(method_row + 1).into();
			evaluate(state, MemberId::resolve(declared.0, token, &assembly))
		},
		Ok(ResolvedMethod::ArrayBase(name)) => {
			let (Some(corelib), Some(corelib_module)) = (&state.corelib, state.corelib_module) else {
				return Err(violation_for(state, declared, ViolationReason::UnsupportedDispatchShape));
			};
			let Some(object_method) = find_object_method(corelib, corelib_module, name) else {
				return Err(violation_for(state, declared, ViolationReason::UnsupportedDispatchShape));
			};
			evaluate(state, object_method)
		},
	}
}

/// Resolves the `System.Object` method named `name` in `corelib` — rule 3's
/// array pseudo method table is checked against `Object`'s own members
/// because every array base method an `SzArray` receiver can reach
/// (`Equals`, `GetHashCode`, `ToString`) is inherited from `Object` (`Clone`
/// and `GetEnumerator` are declared on `Array`/`ICloneable`/`IEnumerable`
/// respectively in a real corelib, but resolving all of rule 3's names
/// against `Object` alone is the scope this loader's corelib lookup covers;
/// widening it to walk `Array`'s own members too is future work).
fn find_object_method(corelib: &Assembly, corelib_module: ModuleId, name: &str) -> Option<MemberId> {
	let tables = corelib.table_heap()?;
	let strings = corelib.string_heap()?;
	let type_defs = tables.get_table::<TypeDefTable>()?;
	let methods = tables.get_table::<MethodDefTable>()?;

	let type_row = (0..type_defs.len()).find(|&i| {
		type_defs.row(i).map(|r| strings.get(r.type_namespace) == Some("System") && strings.get(r.type_name) == Some("Object")).unwrap_or(false)
	})?;

	let method_row = type_defs.method_range(methods, type_row).find(|&i| methods.row(i).map(|m| strings.get(m.name) == Some(name)).unwrap_or(false))?;

	let token: MetadataToken = MethodDefToken(method_row + 1).into();
	Some(MemberId::resolve(corelib_module, token, corelib))
}

/// `invoke_violation_handler(caller, violation)` — the shared denial-path
/// tail every guard's slow path falls into: runs the loader's current
/// [`ViolationHandler`], waiving the violation if it returns `true`. An
/// unregistered caller has no handler to run and no violation to have
/// produced one in the first place, so it's unreachable in practice but
/// treated the same as every other absent-loader case: pass.
pub fn invoke_violation_handler(caller: CallingAssembly, violation: SecurityViolation) -> Result<(), GuardError> {
	let state = match loader_for(caller.0)? {
		LoaderLookup::Unregistered => return Ok(()),
		LoaderLookup::Found(loader) => loader.0,
	};
	let handler = state.violation_handler.read().unwrap_or_else(|e| e.into_inner()).clone();
	if handler.handle(&violation) {
		Ok(())
	} else {
		Err(violation.into())
	}
}

/// `can_access(caller, member)` — a non-throwing peek at what
/// [`check_access`] would decide, for code that wants to branch on
/// accessibility without paying for a `SecurityViolation` it immediately
/// discards (e.g. `Type.GetMethod` reflection shims).
pub fn can_access(caller: CallingAssembly, member: MemberId) -> Result<bool, InvalidStateError> {
	Ok(match loader_for(caller.0)? {
		LoaderLookup::Found(loader) => loaded_by(&loader.0, member.0) || can_call_always(&loader.0.policy, member),
		LoaderLookup::Unregistered => true,
	})
}

/// A delegate built by [`create_checked_delegate`]: re-checks access on
/// every invocation instead of closing directly over `target`, so handing
/// one out to sandboxed code can never be used to bypass the guard a direct
/// `ldftn`/`callvirt` would have hit.
#[derive(Debug, Copy, Clone)]
pub struct CheckedDelegate {
	pub target: MemberId,
	pub is_virtual: bool,
}

impl CheckedDelegate {
	/// Re-runs the access check `create_checked_delegate` performed at
	/// construction time. A real delegate's `Invoke` thunk would call this
	/// before ever reaching `target`'s body.
	pub fn invoke(&self, caller: CallingAssembly) -> Result<(), GuardError> {
		let state = match loader_for(caller.0)? {
			LoaderLookup::Unregistered => return Ok(()),
			LoaderLookup::Found(loader) => loader.0,
		};
		evaluate(&state, self.target).map_err(GuardError::Violation)
	}
}

/// `create_checked_delegate(caller, target, is_virtual)` — builds the
/// checked stand-in [`MethodRewriter`]'s `ldftn`/`ldvirtftn` + `newobj`
/// collapse (`SyntheticOp::CreateCheckedDelegate`) calls into, after
/// verifying the target is accessible at construction time the same way a
/// direct call to it would be.
pub fn create_checked_delegate(caller: CallingAssembly, target: MemberId, is_virtual: bool) -> Result<CheckedDelegate, GuardError> {
	if let LoaderLookup::Found(loader) = loader_for(caller.0)? {
		evaluate(&loader.0, target).map_err(GuardError::Violation)?;
	}
	Ok(CheckedDelegate { target, is_virtual })
}

/// The parameter slot count (including the implicit `this`) a `call`/
/// `callvirt` to `tok` pops — what [`SyntheticOp::SpillArguments`]/
/// [`SyntheticOp::ReloadArguments`] need to bracket a virtual guard without
/// disturbing the stack the original `callvirt` expects. Falls back to `1`
/// (receiver only) if the signature can't be read; the metadata was already
/// validated while loading the module, so this only degrades on a
/// cross-module `MemberRef` this loader genuinely has no blob heap to read
/// the signature's parameter count from without the target assembly loaded.
fn argument_slot_count(assembly: &Assembly, tok: MetadataToken) -> u16 {
	(|| {
		let tables = assembly.table_heap()?;
		let blobs = assembly.blob_heap()?;
		let signature = match tok.kind() {
			MetadataTokenKind::MethodDef => tables.get_table::<MethodDefTable>()?.row(tok.index() - 1)?.signature,
			MetadataTokenKind::MemberRef => tables.get_table::<MemberRefTable>()?.row(tok.index() - 1)?.signature,
			_ => return None,
		};
		let blob = blobs.get(signature)?;
		let sig = MethodSignature::read(&mut Cursor::new(blob), tables.sizes()).ok()?;
		Some(sig.parameter_types.len() as u16 + 1)
	})()
	.unwrap_or(1)
}

/// Emits the shared guard tail every guard sequence ends with: branch to a
/// fresh fallthrough label on denial, invoke the violation handler
/// otherwise, place the label, then copy the guarded instruction. `guard`
/// has already been `insert`ed by the caller (it differs by call-site kind:
/// field, non-virtual call, or virtual call).
fn guard_tail(rw: &mut MethodRewriter, member: MemberId) {
	let label = rw.new_label();
	rw.insert(SyntheticOp::BranchIfDenied { target: label });
	rw.insert(SyntheticOp::InvokeViolationHandler { member });
	rw.place_label(label);
	rw.advance(true);
}

/// Walks `body`'s decoded instruction stream once and emits a guard ahead of
/// every field access, call, `newobj` and virtual call — unconditionally,
/// regardless of whether the target token is a `MemberRef` or a local
/// `MethodDef`/`Field`: `check_access`'s same-assembly fast path makes an
/// intra-module guard a single cached boolean load, so there's no benefit
/// (and real cost, in rewriter complexity) to special-casing local targets
/// out of instrumentation. `ldftn`/`ldvirtftn` immediately followed by
/// `newobj` (the only legal use of either opcode in ECMA-335 — both exist
/// solely to feed a delegate constructor) collapses to a single
/// [`SyntheticOp::CreateCheckedDelegate`]; a `localloc` already verified
/// safe by [`stackalloc::verify`] gets an extra length re-check spliced
/// ahead of its `newobj Span<T>`. Everything else copies through unchanged.
///
/// A `constrained.` prefix immediately ahead of a `callvirt` routes to
/// `check_virtual_call_constrained` instead of the ordinary virtual-call
/// guard: the prefix's token most often names an unconstrained generic type
/// parameter, where the `callvirt` receiver on the stack is a managed
/// pointer to `T` rather than an object reference `check_virtual_call`'s
/// resolver could dispatch on directly. Both opcodes are consumed together
/// (the prefix carries no guard of its own; only the `callvirt` it modifies
/// does), mirroring the `ldftn`/`ldvirtftn` + `newobj` lookahead just above.
fn instrument_method<'l>(assembly: &Assembly, module: ModuleId, method_token: MetadataToken, body: &MethodBody<'l>) -> Result<RewrittenBody<'l>, LoadError> {
	let instructions: Vec<(u32, OpCode<'l>)> = OpCodeIterator::new(body.code).map(|(pos, op)| (pos as u32, op.expect("method body was already validated while loading the module"))).collect();

	let mut rw = MethodRewriter::start(body);
	let mut next_scratch_local: u16 = body.locals.len() as u16;

	let mut i = 0usize;
	while i < instructions.len() {
		let (_, opcode) = instructions[i];

		match opcode {
			OpCode::ldfld(tok) | OpCode::ldflda(tok) | OpCode::stfld(tok) | OpCode::ldsfld(tok) | OpCode::ldsflda(tok) | OpCode::stsfld(tok) => {
				let field = MemberId::resolve(module, tok, assembly);
				rw.insert(SyntheticOp::GuardField { field });
				guard_tail(&mut rw, field);
				i += 1;
			},
			OpCode::call(tok) | OpCode::newobj(tok) => {
				let method = MemberId::resolve(module, tok, assembly);
				match shim::lookup_shim(&method) {
					Some(shim) => {
						rw.insert(SyntheticOp::ShimCall { shim: shim.replacement });
						rw.replace();
					},
					None => {
						rw.insert(SyntheticOp::GuardCall { method });
						guard_tail(&mut rw, method);
					},
				}
				i += 1;
			},
			OpCode::callvirt(tok) => {
				let declared = MemberId::resolve(module, tok, assembly);
				let count = argument_slot_count(assembly, tok);
				let receiver_local = next_scratch_local;
				next_scratch_local += 1;

				rw.insert(SyntheticOp::SpillArguments { count });
				rw.insert(SyntheticOp::GuardVirtualCall { declared, receiver_local });
				let label = rw.new_label();
				rw.insert(SyntheticOp::BranchIfDenied { target: label });
				rw.insert(SyntheticOp::InvokeViolationHandler { member: declared });
				rw.place_label(label);
				rw.insert(SyntheticOp::ReloadArguments { count });
				rw.advance(true);
				i += 1;
			},
			OpCode::compound(CompoundOpCode::constrained(constrained_type)) => {
				match instructions.get(i + 1) {
					Some((_, OpCode::callvirt(tok))) => {
						let tok = *tok;
						let declared = MemberId::resolve(module, tok, assembly);
						let count = argument_slot_count(assembly, tok);
						let receiver_local = next_scratch_local;
						next_scratch_local += 1;

						rw.advance(true); // constrained. prefix, stays adjacent to its callvirt
						rw.insert(SyntheticOp::SpillArguments { count });
						rw.insert(SyntheticOp::GuardVirtualCallConstrained { declared, constrained_type, receiver_local });
						let label = rw.new_label();
						rw.insert(SyntheticOp::BranchIfDenied { target: label });
						rw.insert(SyntheticOp::InvokeViolationHandler { member: declared });
						rw.place_label(label);
						rw.insert(SyntheticOp::ReloadArguments { count });
						rw.advance(true); // callvirt
						i += 2;
					},
					_ => {
						// Malformed: `constrained.` with no following `callvirt`. Copy
						// through verbatim rather than guess at an instruction to guard.
						rw.advance(true);
						i += 1;
					},
				}
			},
			OpCode::compound(CompoundOpCode::ldftn(tok)) | OpCode::compound(CompoundOpCode::ldvirtftn(tok)) => {
				let is_virtual = matches!(opcode, OpCode::compound(CompoundOpCode::ldvirtftn(_)));
				match instructions.get(i + 1) {
					Some((_, OpCode::newobj(_))) => {
						let target = MemberId::resolve(module, tok, assembly);
						rw.insert(SyntheticOp::CreateCheckedDelegate { target, is_virtual });
						rw.replace(); // drop the ldftn/ldvirtftn
						rw.replace(); // drop the newobj
						i += 2;
					},
					_ => {
						rw.advance(true);
						i += 1;
					},
				}
			},
			OpCode::compound(CompoundOpCode::localloc) => {
				let Some((_, OpCode::newobj(ctor_token))) = instructions.get(i + 2) else {
					return Err(LoadError::UnsupportedStackalloc { method: method_token, reason: "localloc not followed by newobj Span<T>" });
				};
				let element_size = stackalloc::span_element_type(assembly, *ctor_token)
					.and_then(|tag| stackalloc::element_size(assembly, &tag, 0))
					.ok_or(LoadError::UnsupportedStackalloc { method: method_token, reason: "could not determine Span<T> element size" })?;

				rw.advance(true); // localloc
				rw.advance(true); // <load length>, verified by stackalloc::verify
				rw.insert(SyntheticOp::CheckStackallocLength { element_size });
				rw.advance(true); // newobj Span<T>
				i += 3;
			},
			_ => {
				rw.advance(true);
				i += 1;
			},
		}
	}

	while rw.current_offset().is_some() {
		rw.advance(true);
	}

	Ok(rw.finish())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cas::policy::CasPolicyBuilder;
	use crate::cas::violation::RecordingViolationHandler;
	use crate::metadata::cli::MetadataRoot;
	use crate::metadata::pe::PeFile;

	fn member(token: u32) -> MemberId {
		MemberId(ModuleId::next(), MetadataToken::try_from(token).unwrap())
	}

	/// A assembly with no tables of its own, just enough for `assembly_for`
	/// to have something to hand back — these tests only need `loaded_by`'s
	/// membership check, never a real row lookup.
	fn empty_assembly() -> Arc<Assembly> {
		let cli_header = crate::metadata::cli::CliHeader {
			size_in_bytes: 72,
			major_runtime_version: 2,
			minor_runtime_version: 5,
			metadata_virtual_address: 0,
			metadata_size: 0,
			flags: RuntimeFlags::IL_ONLY,
			entry_point_token: MetadataToken::try_from(0x0600_0001).unwrap(),
			resources_virtual_address: 0,
			resources_size: 0,
			strong_name_signature: 0,
		};
		Arc::new(Assembly::from_parts(PeFile::empty(), cli_header, MetadataRoot::from_heaps(2, 0, "v4.0.30319", 0, vec![])))
	}

	#[test]
	fn unregistered_caller_passes_every_check() {
		let caller = CallingAssembly(ModuleId::next());
		let m = member(0x0600_0001);
		assert!(check_access(caller, CallSiteId { member: m, kind: CallSiteKind::Call }).is_ok());
		assert!(can_access(caller, m).unwrap());
		assert!(create_checked_delegate(caller, m, false).is_ok());
	}

	#[test]
	fn same_loader_access_is_always_allowed() {
		let policy = CasPolicyBuilder::new().build();
		let loader = Loader::new(policy);
		let module = ModuleId::next();
		module_registry().write().unwrap().insert(module, Arc::downgrade(&loader.0));
		loader.0.modules.lock().unwrap_or_else(|e| e.into_inner()).insert(module, empty_assembly());

		let site = CallSiteId { member: MemberId(module, MetadataToken::try_from(0x0600_0001).unwrap()), kind: CallSiteKind::Call };
		assert!(check_access(CallingAssembly(module), site).is_ok());
	}

	#[test]
	fn a_different_module_on_the_same_loader_is_also_trusted() {
		let policy = CasPolicyBuilder::new().build();
		let loader = Loader::new(policy);
		let caller_module = ModuleId::next();
		module_registry().write().unwrap().insert(caller_module, Arc::downgrade(&loader.0));
		loader.0.modules.lock().unwrap_or_else(|e| e.into_inner()).insert(caller_module, empty_assembly());

		let other_module = ModuleId::next();
		loader.0.modules.lock().unwrap_or_else(|e| e.into_inner()).insert(other_module, empty_assembly());

		let site = CallSiteId { member: MemberId(other_module, MetadataToken::try_from(0x0600_0002).unwrap()), kind: CallSiteKind::Call };
		assert!(check_access(CallingAssembly(caller_module), site).is_ok());
	}

	#[test]
	fn metadata_readable_assembly_is_not_thereby_trusted() {
		let policy = CasPolicyBuilder::new().build();
		let loader = Loader::new(policy);
		let caller_module = ModuleId::next();
		module_registry().write().unwrap().insert(caller_module, Arc::downgrade(&loader.0));
		loader.0.modules.lock().unwrap_or_else(|e| e.into_inner()).insert(caller_module, empty_assembly());

		let library_module = ModuleId::next();
		loader.register_referenced_assembly(library_module, empty_assembly());

		let site = CallSiteId { member: MemberId(library_module, MetadataToken::try_from(0x0600_0003).unwrap()), kind: CallSiteKind::Call };
		assert!(check_access(CallingAssembly(caller_module), site).is_err());
	}

	#[test]
	fn out_of_policy_cross_module_access_is_denied() {
		let policy = CasPolicyBuilder::new().build();
		let loader = Loader::new(policy);
		let caller_module = ModuleId::next();
		module_registry().write().unwrap().insert(caller_module, Arc::downgrade(&loader.0));

		let other_module = ModuleId::next();
		let site = CallSiteId { member: MemberId(other_module, MetadataToken::try_from(0x0600_0002).unwrap()), kind: CallSiteKind::Call };
		assert!(check_access(CallingAssembly(caller_module), site).is_err());
	}

	#[test]
	fn violation_handler_can_waive_a_denial() {
		let policy = CasPolicyBuilder::new().build();
		let handler = Arc::new(RecordingViolationHandler::new());
		struct Waive(Arc<RecordingViolationHandler>);
		impl ViolationHandler for Waive {
			fn handle(&self, v: &SecurityViolation) -> bool {
				self.0.handle(v);
				true
			}
		}
		let loader = Loader::with_options(policy, LoaderOptions { violation_handler: Arc::new(Waive(handler.clone())), ..LoaderOptions::default() });
		let caller_module = ModuleId::next();
		module_registry().write().unwrap().insert(caller_module, Arc::downgrade(&loader.0));

		let other_module = ModuleId::next();
		let m = MemberId(other_module, MetadataToken::try_from(0x0600_0003).unwrap());
		let violation = SecurityViolation { member: m.1, declaring_type: m.1, reason: ViolationReason::NotInPolicy };
		assert!(invoke_violation_handler(CallingAssembly(caller_module), violation).is_ok());
		assert_eq!(handler.len(), 1);
	}

	#[test]
	fn registered_module_with_a_dropped_loader_is_an_invalid_state_error() {
		let module = ModuleId::next();
		{
			let loader = Loader::new(CasPolicyBuilder::new().build());
			module_registry().write().unwrap().insert(module, Arc::downgrade(&loader.0));
			// `loader` drops here with no `ModuleHandle` ever having unregistered
			// `module` — the host bug §7 kind 4 is reserved for.
		}
		let site = CallSiteId { member: MemberId(module, MetadataToken::try_from(0x0600_0005).unwrap()), kind: CallSiteKind::Call };
		let err = check_access(CallingAssembly(module), site).unwrap_err();
		assert!(matches!(err, GuardError::InvalidState(_)));
	}

	#[test]
	fn reloading_identical_bytes_is_rejected() {
		let policy = CasPolicyBuilder::new().build();
		let loader = Loader::new(policy);
		let bytes = b"not actually a PE file, content identity is all that matters here";
		let first = loader.load_from_bytes(bytes);
		assert!(first.is_err()); // fails to parse, but still consumes the hash
		let second = loader.load_from_bytes(bytes);
		assert!(matches!(second, Err(LoadError::AlreadyInstrumented) | Err(LoadError::Io(_)) | Err(LoadError::Metadata(_))));
	}
}
