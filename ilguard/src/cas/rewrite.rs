//! §4.E: the method body rewriter. Walks a method's decoded instruction
//! stream once, copying original instructions into a fresh output buffer
//! while letting the caller splice guard sequences in ahead of the call
//! sites that need one. Branch targets, `switch` tables and exception
//! handler spans are never touched opcode-by-opcode as they're copied —
//! they're resolved once, at [`MethodRewriter::finish`], against an
//! offset map built up during the copy pass.
//!
//! Producing a new PE image's raw bytes from a [`RewrittenBody`] — interning
//! the tokens a [`SyntheticOp`] references as real `MemberRef` rows, laying
//! instructions back out as bytes, picking short vs. long branch encodings
//! for the result — is left to whatever writes the instrumented module back
//! out; this module's job ends at a structured, fully resolved instruction
//! list, the same boundary the loader draws around parsing a module's bytes
//! in the first place.

use std::collections::HashMap;

use crate::cas::identity::MemberId;
use crate::metadata::il::{CompoundOpCode, ExceptionClauseFlags, ExceptionHandlingClause, MethodBody, OpCode, OpCodeIterator};
use crate::metadata::indices::metadata_token::MetadataToken;

/// A position in the rewriter's *output* buffer — what branch targets and
/// exception-handler boundaries get resolved to once rewriting is done.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct InstrPos(pub usize);

/// A forward reference to an output position that isn't known yet at the
/// point a guard sequence needs to name it — the `T:` fall-through label a
/// guard's denial branch skips past onto the (not yet copied) original
/// instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LabelId(usize);

/// One freshly-inserted guard instruction, described by *what it does*
/// rather than as a raw opcode: the call targets these reference (the
/// runtime entry points in `cas::loader`) don't have tokens in the module
/// being instrumented, and interning new `MemberRef` rows is a concern of
/// the PE writer, not this rewriter.
#[derive(Debug, Clone)]
pub enum SyntheticOp {
	/// `check_access(calling_assembly, field)` — guards a field access.
	GuardField { field: MemberId },
	/// `check_access(calling_assembly, method)` — guards a non-virtual
	/// call or `newobj`.
	GuardCall { method: MemberId },
	/// `check_virtual_call(calling_assembly, declared, receiver)` — guards
	/// a virtual or interface call; `receiver_local` is the local slot (or
	/// argument index) the rewriter has stashed a dup'd receiver into so
	/// the guard can inspect it without disturbing the stack the original
	/// call expects.
	GuardVirtualCall { declared: MemberId, receiver_local: u16 },
	/// `check_virtual_call_constrained(calling_assembly, declared,
	/// constrained_type, receiver)` — guards a `constrained.`-prefixed
	/// `callvirt`: same spill/guard/branch shape as [`GuardVirtualCall`], but
	/// dispatch resolves against `constrained_type` rather than the runtime
	/// receiver the way the `constrained.` prefix itself redirects it.
	GuardVirtualCallConstrained { declared: MemberId, constrained_type: MetadataToken, receiver_local: u16 },
	/// Branches to `target` on guard denial; falls through to the original
	/// instruction copy otherwise. At most one per guard sequence.
	BranchIfDenied { target: LabelId },
	/// `invoke_violation_handler(calling_assembly, member, reason)`. Never
	/// falls through into the guarded instruction.
	InvokeViolationHandler { member: MemberId },
	/// Stands in for the `call`/`callvirt`/`newobj` it replaces (paired with
	/// [`MethodRewriter::replace`]) — the shimmed call goes straight to
	/// `shim`'s replacement member instead of the ambient-authority API the
	/// module named.
	ShimCall { shim: MemberId },
	/// Stands in for an `ldftn`/`ldvirtftn` + delegate `newobj` pair (both
	/// consumed via [`MethodRewriter::replace`]): `create_checked_delegate`
	/// builds a delegate that re-checks access on every invocation instead of
	/// one closed directly over `target`.
	CreateCheckedDelegate { target: MemberId, is_virtual: bool },
	/// Spills the top `count` stack slots (a virtual call's receiver and
	/// arguments) into scratch locals so the guard sequence can inspect the
	/// receiver without disturbing what the original `callvirt` expects on
	/// the stack.
	SpillArguments { count: u16 },
	/// Reloads the `count` slots [`SpillArguments`] stashed, restoring the
	/// stack the original (about to be copied) instruction expects.
	ReloadArguments { count: u16 },
	/// Inserted between a verified `localloc` pattern's `<load length>` and
	/// its `newobj Span<T>`: recomputes `length * element_size` and compares
	/// it against the byte count `localloc` itself received, throwing on
	/// mismatch rather than handing out a `Span<T>` that overruns its
	/// backing allocation.
	CheckStackallocLength { element_size: u32 },
}

/// Original instructions are copied verbatim (after macro expansion);
/// synthetic ones carry no old offset since they never existed in the
/// original stream.
#[derive(Debug, Clone)]
pub enum RewrittenInstr<'l> {
	Original { old_offset: u32, opcode: OpCode<'l> },
	Synthetic(SyntheticOp),
}

#[derive(Debug, Clone, Copy)]
pub struct RewrittenExceptionClause {
	pub flags: ExceptionClauseFlags,
	pub try_start: InstrPos,
	pub try_end: InstrPos,
	pub handler_start: InstrPos,
	pub handler_end: InstrPos,
	pub class_token_or_filter_offset: u32,
}

#[derive(Debug, Clone)]
pub struct RewrittenBody<'l> {
	pub instructions: Vec<RewrittenInstr<'l>>,
	/// For every output position holding a branch/`leave`/`switch`
	/// instruction, the output position(s) its operand(s) resolve to (one
	/// for a conditional/unconditional branch, one per arm for `switch`).
	pub branch_targets: HashMap<InstrPos, Vec<InstrPos>>,
	pub exception_handlers: Vec<RewrittenExceptionClause>,
	pub max_stack_size: u16,
	pub init_locals: bool,
}

/// Builds a [`RewrittenBody`] from a method's original decoded form. See the
/// module docs for the overall shape; the short version is: call
/// [`advance`](Self::advance) once per original instruction in stream
/// order, calling [`insert`](Self::insert)/[`new_label`](Self::new_label)/
/// [`place_label`](Self::place_label) ahead of any instruction that needs a
/// guard spliced in front of it, then [`finish`](Self::finish).
///
/// A prefix opcode (`constrained.`, `readonly.`, `tail.`, ...) and the
/// instruction it modifies are two entries in the original stream but must
/// stay adjacent in the output — the caller achieves this simply by never
/// inserting a guard between the two `advance` calls that copy them.
pub struct MethodRewriter<'l> {
	original: Vec<(u32, OpCode<'l>)>,
	next_offset: HashMap<u32, u32>,
	body_len: u32,
	exception_handlers: Vec<ExceptionHandlingClause>,
	output: Vec<RewrittenInstr<'l>>,
	offset_map: HashMap<u32, InstrPos>,
	copy_cursor: usize,
	labels: Vec<Option<InstrPos>>,
	max_stack_size: u16,
	init_locals: bool,
}

impl<'l> MethodRewriter<'l> {
	pub fn start(body: &MethodBody<'l>) -> Self {
		let mut original = vec![];
		for (pos, opcode) in OpCodeIterator::new(body.code) {
			let opcode = opcode.expect("method body was already validated while loading the module");
			original.push((pos as u32, opcode));
		}

		let body_len = body.code.len() as u32;
		let mut next_offset = HashMap::with_capacity(original.len());
		for i in 0..original.len() {
			let next = original.get(i + 1).map(|&(p, _)| p).unwrap_or(body_len);
			next_offset.insert(original[i].0, next);
		}

		Self {
			original,
			next_offset,
			body_len,
			exception_handlers: body.exception_handlers.clone(),
			output: vec![],
			offset_map: HashMap::new(),
			copy_cursor: 0,
			labels: vec![],
			max_stack_size: body.max_stack_size,
			init_locals: body.init_locals,
		}
	}

	/// The original offset of the instruction `advance` would copy next, or
	/// `None` once every original instruction has been copied.
	pub fn current_offset(&self) -> Option<u32> {
		self.original.get(self.copy_cursor).map(|&(o, _)| o)
	}

	pub fn new_label(&mut self) -> LabelId {
		self.labels.push(None);
		LabelId(self.labels.len() - 1)
	}

	/// Binds `label` to the current end of the output buffer — call this
	/// immediately before the `advance` that copies the instruction the
	/// label names (the guard sequence's fall-through target).
	pub fn place_label(&mut self, label: LabelId) {
		self.labels[label.0] = Some(InstrPos(self.output.len()));
	}

	pub fn insert(&mut self, op: SyntheticOp) {
		self.output.push(RewrittenInstr::Synthetic(op));
	}

	/// Records an offset-map entry for the instruction at the copy cursor
	/// (if one hasn't been recorded yet — a branch landing exactly on a
	/// guarded instruction must resolve to the *first* thing written for
	/// that old offset, whether that's a synthetic guard or the copied
	/// instruction itself) and, if `add_original`, copies that instruction
	/// (macro-expanded) and advances the cursor past it.
	pub fn advance(&mut self, add_original: bool) {
		let Some(&(old_offset, opcode)) = self.original.get(self.copy_cursor) else { return };
		self.offset_map.entry(old_offset).or_insert(InstrPos(self.output.len()));
		if add_original {
			self.output.push(RewrittenInstr::Original { old_offset, opcode: expand_macro(opcode) });
			self.copy_cursor += 1;
		}
	}

	/// Drops the instruction at the copy cursor instead of copying it — used
	/// when a synthetic op (a shim call, a checked-delegate construction)
	/// stands in for the original rather than guarding ahead of it. Still
	/// records the offset-map entry the usual way, so a branch that landed
	/// on the dropped instruction's old offset resolves to whatever was
	/// inserted immediately before this call.
	pub fn replace(&mut self) {
		let Some(&(old_offset, _)) = self.original.get(self.copy_cursor) else { return };
		self.offset_map.entry(old_offset).or_insert(InstrPos(self.output.len()));
		self.copy_cursor += 1;
	}

	fn resolve_boundary(&self, offset: u32) -> Option<InstrPos> {
		match self.offset_map.get(&offset) {
			Some(pos) => Some(*pos),
			None if offset == self.body_len => Some(InstrPos(self.output.len())),
			None => None,
		}
	}

	pub fn finish(mut self) -> RewrittenBody<'l> {
		while self.copy_cursor < self.original.len() {
			self.advance(true);
		}

		let mut branch_targets = HashMap::new();
		for (i, instr) in self.output.iter().enumerate() {
			match instr {
				RewrittenInstr::Original { old_offset, opcode } => {
					if let Some(old_targets) = branch_target_old_offsets(opcode, *old_offset, &self.next_offset) {
						let resolved = old_targets.into_iter().filter_map(|t| self.offset_map.get(&t).copied()).collect();
						branch_targets.insert(InstrPos(i), resolved);
					}
				},
				RewrittenInstr::Synthetic(SyntheticOp::BranchIfDenied { target }) => {
					if let Some(pos) = self.labels[target.0] {
						branch_targets.insert(InstrPos(i), vec![pos]);
					}
				},
				RewrittenInstr::Synthetic(_) => {},
			}
		}

		let exception_handlers = self
			.exception_handlers
			.iter()
			.filter_map(|clause| {
				Some(RewrittenExceptionClause {
					flags: clause.flags,
					try_start: self.resolve_boundary(clause.try_offset)?,
					try_end: self.resolve_boundary(clause.try_offset + clause.try_length)?,
					handler_start: self.resolve_boundary(clause.handler_offset)?,
					handler_end: self.resolve_boundary(clause.handler_offset + clause.handler_length)?,
					class_token_or_filter_offset: clause.class_token_or_filter_offset,
				})
			})
			.collect();

		RewrittenBody { instructions: self.output, branch_targets, exception_handlers, max_stack_size: self.max_stack_size, init_locals: self.init_locals }
	}
}

/// The macro opcodes §4.E names: short-form branches widen to their long
/// form, and the fixed-slot/8-bit-indexed local and argument accessors
/// widen to their 16-bit `CompoundOpCode` equivalents. `ldc_i4_*` is
/// deliberately not in this table — it's a constant-folding macro, not a
/// dispatch or addressing one, and outside what §4.E asks the rewriter to
/// normalise.
fn expand_macro(opcode: OpCode) -> OpCode {
	match opcode {
		OpCode::ldarg_0 => OpCode::compound(CompoundOpCode::ldarg(0)),
		OpCode::ldarg_1 => OpCode::compound(CompoundOpCode::ldarg(1)),
		OpCode::ldarg_2 => OpCode::compound(CompoundOpCode::ldarg(2)),
		OpCode::ldarg_3 => OpCode::compound(CompoundOpCode::ldarg(3)),
		OpCode::ldarg_s(n) => OpCode::compound(CompoundOpCode::ldarg(n as u16)),
		OpCode::ldarga_s(n) => OpCode::compound(CompoundOpCode::ldarga(n as u16)),
		OpCode::starg_s(n) => OpCode::compound(CompoundOpCode::starg(n as u16)),
		OpCode::ldloc_0 => OpCode::compound(CompoundOpCode::ldloc(0)),
		OpCode::ldloc_1 => OpCode::compound(CompoundOpCode::ldloc(1)),
		OpCode::ldloc_2 => OpCode::compound(CompoundOpCode::ldloc(2)),
		OpCode::ldloc_3 => OpCode::compound(CompoundOpCode::ldloc(3)),
		OpCode::ldloc_s(n) => OpCode::compound(CompoundOpCode::ldloc(n as u16)),
		OpCode::ldloca_s(n) => OpCode::compound(CompoundOpCode::ldloca(n as u16)),
		OpCode::stloc_0 => OpCode::compound(CompoundOpCode::stloc(0)),
		OpCode::stloc_1 => OpCode::compound(CompoundOpCode::stloc(1)),
		OpCode::stloc_2 => OpCode::compound(CompoundOpCode::stloc(2)),
		OpCode::stloc_3 => OpCode::compound(CompoundOpCode::stloc(3)),
		OpCode::stloc_s(n) => OpCode::compound(CompoundOpCode::stloc(n as u16)),
		OpCode::br_s(d) => OpCode::br(d as i32),
		OpCode::brfalse_s(d) => OpCode::brfalse(d as i32),
		OpCode::brtrue_s(d) => OpCode::brtrue(d as i32),
		OpCode::beq_s(d) => OpCode::beq(d as i32),
		OpCode::bge_s(d) => OpCode::bge(d as i32),
		OpCode::bgt_s(d) => OpCode::bgt(d as i32),
		OpCode::ble_s(d) => OpCode::ble(d as i32),
		OpCode::blt_s(d) => OpCode::blt(d as i32),
		OpCode::bne_un_s(d) => OpCode::bne_un(d as i32),
		OpCode::bge_un_s(d) => OpCode::bge_un(d as i32),
		OpCode::bgt_un_s(d) => OpCode::bgt_un(d as i32),
		OpCode::ble_un_s(d) => OpCode::ble_un(d as i32),
		OpCode::blt_un_s(d) => OpCode::blt_un(d as i32),
		OpCode::leave_s(d) => OpCode::leave(d as i32),
		other => other,
	}
}

/// The absolute *original* offset(s) a branch/`switch` instruction at
/// `old_offset` targets, or `None` if `opcode` isn't a branch at all.
fn branch_target_old_offsets(opcode: &OpCode, old_offset: u32, next_offset: &HashMap<u32, u32>) -> Option<Vec<u32>> {
	let next = *next_offset.get(&old_offset)?;
	let single = |delta: i32| vec![(next as i64 + delta as i64) as u32];
	Some(match *opcode {
		OpCode::br(d) | OpCode::brfalse(d) | OpCode::brtrue(d) | OpCode::beq(d) | OpCode::bge(d) | OpCode::bgt(d) | OpCode::ble(d) | OpCode::blt(d) | OpCode::bne_un(d) | OpCode::bge_un(d) | OpCode::bgt_un(d) | OpCode::ble_un(d) | OpCode::blt_un(d) | OpCode::leave(d) => single(d),
		OpCode::switch(table) => table.variants().map(|d| (next as i64 + d as i64) as u32).collect(),
		_ => return None,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cas::identity::ModuleId;
	use crate::metadata::indices::metadata_token::MetadataToken;

	fn member(token: u32) -> MemberId {
		MemberId(ModuleId::next(), MetadataToken::try_from(token).unwrap())
	}

	fn body(code: &[u8], handlers: Vec<ExceptionHandlingClause>) -> MethodBody {
		MethodBody { max_stack_size: 8, init_locals: false, locals: vec![], exception_handlers: handlers, code }
	}

	#[test]
	fn untouched_instructions_are_copied_verbatim() {
		let b = body(&[0x00, 0x2A], vec![]); // nop; ret
		let mut rw = MethodRewriter::start(&b);
		rw.advance(true);
		rw.advance(true);
		let rewritten = rw.finish();
		assert_eq!(rewritten.instructions.len(), 2);
		assert!(matches!(rewritten.instructions[0], RewrittenInstr::Original { opcode: OpCode::nop, .. }));
		assert!(matches!(rewritten.instructions[1], RewrittenInstr::Original { opcode: OpCode::ret, .. }));
	}

	#[test]
	fn guard_insertion_does_not_disturb_branch_target() {
		// br.s +2 (skips the two nops, lands on ret); nop; nop; ret
		let b = body(&[0x2B, 0x02, 0x00, 0x00, 0x2A], vec![]);
		let mut rw = MethodRewriter::start(&b);
		rw.advance(true); // copies br.s
		rw.insert(SyntheticOp::GuardField { field: member(0x0400_0001) });
		rw.advance(true); // first nop
		rw.advance(true); // second nop
		rw.advance(true); // ret
		let rewritten = rw.finish();

		// output: [br, guard, nop, nop, ret]
		assert_eq!(rewritten.instructions.len(), 5);
		let targets = rewritten.branch_targets.get(&InstrPos(0)).expect("branch instruction should have a resolved target");
		assert_eq!(targets, &vec![InstrPos(4)]);
	}

	#[test]
	fn short_branches_and_indexed_locals_widen_to_long_form() {
		let b = body(&[0x06, 0x13, 0x00, 0x2A], vec![]); // ldloc.0; stloc.s 0; ret
		let mut rw = MethodRewriter::start(&b);
		while rw.current_offset().is_some() {
			rw.advance(true);
		}
		let rewritten = rw.finish();
		assert!(matches!(rewritten.instructions[0], RewrittenInstr::Original { opcode: OpCode::compound(CompoundOpCode::ldloc(0)), .. }));
		assert!(matches!(rewritten.instructions[1], RewrittenInstr::Original { opcode: OpCode::compound(CompoundOpCode::stloc(0)), .. }));
	}

	#[test]
	fn exception_handler_span_remaps_through_inserted_guard() {
		// nop (try); nop (handler); ret
		let clause = ExceptionHandlingClause { flags: ExceptionClauseFlags::EXCEPTION, try_offset: 0, try_length: 1, handler_offset: 1, handler_length: 1, class_token_or_filter_offset: 0 };
		let b = body(&[0x00, 0x00, 0x2A], vec![clause]);
		let mut rw = MethodRewriter::start(&b);
		rw.insert(SyntheticOp::GuardCall { method: member(0x0600_0001) });
		rw.advance(true);
		rw.advance(true);
		rw.advance(true);
		let rewritten = rw.finish();

		assert_eq!(rewritten.exception_handlers.len(), 1);
		let clause = &rewritten.exception_handlers[0];
		assert_eq!(clause.try_start, InstrPos(1));
		assert_eq!(clause.try_end, InstrPos(2));
		assert_eq!(clause.handler_start, InstrPos(2));
		assert_eq!(clause.handler_end, InstrPos(3));
	}

	#[test]
	fn label_resolves_branch_if_denied_to_the_fallthrough_instruction() {
		let b = body(&[0x00, 0x2A], vec![]); // nop; ret
		let mut rw = MethodRewriter::start(&b);
		let fallthrough = rw.new_label();
		rw.insert(SyntheticOp::GuardCall { method: member(0x0600_0002) });
		rw.insert(SyntheticOp::BranchIfDenied { target: fallthrough });
		rw.insert(SyntheticOp::InvokeViolationHandler { member: member(0x0600_0002) });
		rw.place_label(fallthrough);
		rw.advance(true); // nop
		rw.advance(true); // ret
		let rewritten = rw.finish();

		// output: [guard(0), branch(1), invoke(2), nop(3), ret(4)]
		let targets = rewritten.branch_targets.get(&InstrPos(1)).expect("denial branch should resolve");
		assert_eq!(targets, &vec![InstrPos(3)]);
	}

	#[test]
	fn replace_drops_the_original_but_keeps_its_offset_resolvable() {
		// br.s +0 (targets itself is nonsensical; use the ret instead): ldftn-like
		// stand-in op; newobj-like stand-in op; ret. We only care that both
		// original slots collapse onto the one synthetic op.
		let b = body(&[0x00, 0x00, 0x2A], vec![]); // nop; nop; ret
		let mut rw = MethodRewriter::start(&b);
		rw.insert(SyntheticOp::CreateCheckedDelegate { target: member(0x0600_0003), is_virtual: false });
		rw.replace(); // drops first nop
		rw.replace(); // drops second nop
		rw.advance(true); // ret
		let rewritten = rw.finish();

		assert_eq!(rewritten.instructions.len(), 2);
		assert!(matches!(rewritten.instructions[0], RewrittenInstr::Synthetic(SyntheticOp::CreateCheckedDelegate { .. })));
		assert!(matches!(rewritten.instructions[1], RewrittenInstr::Original { opcode: OpCode::ret, .. }));
	}
}
