//! Lowers an AST into a linear instruction stream.
//!
//! The compiler walks the tree once. Most nodes split into a header (emitted
//! before the children), the generic child walk (which inserts the Pop
//! between statement results) and a footer. Loops keep patch lists for the
//! labelled `loop`/`stop` requests raised inside them; a request that no loop
//! resolves is a compile error.

use std::collections::BTreeMap;
use std::rc::Rc;

use num_enum::TryFromPrimitive;
use strum::{Display, EnumString};

use crate::{
    arithmetic::{self, BinaryOp},
    ast::{AssignMode, DefKind, ExprMode, Node, NodeKind},
    error::{EvalError, EvalResult},
    loc::SourceLocation,
    machine::{Instruction, OpCode, Program, ProgramPtr, combined_version},
    value::Value,
};

/// Optimization levels.
///
/// `Debug` emits marker no-ops and dense debug info; `O0` is the default
/// with debug info only at operator and identifier sites; `O1` adds peephole
/// optimizations and constant folding; `O2` additionally elides scopes that
/// declare nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, TryFromPrimitive)]
#[repr(u8)]
pub enum OptLevel {
    Debug = 0,
    O0 = 1,
    O1 = 2,
    O2 = 3,
}

#[derive(Debug)]
struct LoopHead {
    label: String,
    /// First instruction of the loop (the back-jump target).
    instr: usize,
    /// Scope level at the loop head, for cleanup of early exits.
    scopes: usize,
    /// Stack slots the loop keeps alive that early exits must pop.
    pushes: usize,
}

#[derive(Debug)]
struct Request {
    label: String,
    /// Index of the placeholder jump to patch.
    pos: usize,
    /// Loop nesting depth at the request site.
    nested_level: usize,
}

/// Loop bookkeeping, one instance per function body.
#[derive(Debug, Default)]
struct LoopState {
    current_scopes: usize,
    head_stack: Vec<LoopHead>,
    loop_requests: Vec<Request>,
    stop_requests: Vec<Request>,
}

#[derive(Debug, Default)]
struct BuildState {
    node_level: usize,
    stack_node_level: Vec<usize>,
    scope_level: usize,
    loop_states: Vec<LoopState>,
    loop_index: usize,
    func_start: Vec<usize>,
    param_or: Vec<usize>,
    scope_start: Vec<usize>,
}

/// The AST to instruction-stream compiler.
#[derive(Debug, Default)]
pub struct Compiler {
    state: BuildState,
    opt: OptLevel,
    instructions: Vec<Instruction>,
    debug_info: BTreeMap<usize, SourceLocation>,
}

impl Default for OptLevel {
    fn default() -> Self {
        Self::O0
    }
}

impl Compiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles a file root into a program.
    pub fn compile(&mut self, root: &Node, opt: OptLevel) -> EvalResult<ProgramPtr> {
        let NodeKind::File { name } = root.kind() else {
            return Err(EvalError::compile("compiler expects a file root node", root.loc().clone()));
        };
        self.reset(opt);
        self.build(root)?;
        if self.opt == OptLevel::Debug {
            self.instructions.push(Instruction::bare(OpCode::ProgramEnd));
        }
        Ok(Rc::new(Program::new(
            name.clone(),
            self.opt,
            combined_version(),
            std::mem::take(&mut self.instructions),
            std::mem::take(&mut self.debug_info),
        )))
    }

    fn reset(&mut self, opt: OptLevel) {
        self.instructions.clear();
        self.instructions.reserve(128);
        self.debug_info.clear();
        self.opt = opt;
        self.state = BuildState::default();
        self.state.loop_states.push(LoopState::default()); // the main body
    }

    // --- small helpers ------------------------------------------------------

    fn emit(&mut self, op: OpCode) -> usize {
        self.instructions.push(Instruction::bare(op));
        self.instructions.len() - 1
    }

    fn emit_with(&mut self, op: OpCode, payload: Value) -> usize {
        self.instructions.push(Instruction::new(op, payload));
        self.instructions.len() - 1
    }

    fn note_debug(&mut self, idx: usize, loc: &SourceLocation) {
        if loc.is_set() {
            self.debug_info.insert(idx, loc.clone());
        }
    }

    fn note_debug_dense(&mut self, idx: usize, loc: &SourceLocation) {
        if self.opt == OptLevel::Debug {
            self.note_debug(idx, loc);
        }
    }

    fn note_debug_default(&mut self, idx: usize, loc: &SourceLocation) {
        if self.opt <= OptLevel::O0 {
            self.note_debug(idx, loc);
        }
    }

    fn patch_jump(&mut self, pos: usize, offset: i64) {
        self.instructions[pos].payload = Value::from(offset);
    }

    fn last_op(&self) -> Option<OpCode> {
        self.instructions.last().map(|i| i.op)
    }

    fn loop_state(&mut self) -> &mut LoopState {
        &mut self.state.loop_states[self.state.loop_index]
    }

    // --- the recursive walk -------------------------------------------------

    fn build(&mut self, node: &Node) -> EvalResult<()> {
        // reject early on every unfinished node
        node.check()?;

        self.state.node_level += 1;
        if self.state.node_level == 1 && self.state.stack_node_level.is_empty() {
            self.state.stack_node_level.push(1);
        }
        let result = self.build_inner(node);
        self.state.node_level -= 1;
        if let Some(&top) = self.state.stack_node_level.last() {
            if top > self.state.node_level {
                self.state.stack_node_level.pop();
            }
        }
        result
    }

    fn build_inner(&mut self, node: &Node) -> EvalResult<()> {
        // === header section: kinds handled completely here return early ===
        match node.kind() {
            NodeKind::RawInstr(instr) => {
                self.instructions.push(instr.clone());
                return Ok(());
            }
            NodeKind::Constant(value) => {
                self.emit_constant(value.clone());
                return Ok(());
            }
            NodeKind::Identifier(name) => {
                let idx = self.emit_with(OpCode::Load, Value::from(name.as_str()));
                self.note_debug_default(idx, node.loc());
                return Ok(());
            }
            NodeKind::Assign { shared, mode } => return self.build_assign(node, *shared, *mode),
            NodeKind::Binary(op) if matches!(op, BinaryOp::LogicalAnd | BinaryOp::LogicalOr) => {
                return self.build_short_circuit(node, *op);
            }
            NodeKind::Dot => {
                self.build(&node.children()[0])?;
                let key = dot_key_payload(&node.children()[1])?;
                self.emit_with(OpCode::Push, key);
                let idx = self.emit(OpCode::DotOp);
                self.note_debug_default(idx, node.loc());
                return Ok(());
            }
            NodeKind::If => return self.build_if(node),
            NodeKind::DefOp(kind) => return self.build_def_op(node, *kind),
            NodeKind::Loop { label } => return self.build_loop_request(node, label),
            NodeKind::Stop { label, .. } => return self.build_stop_request(node, label.clone()),
            NodeKind::Forall { label } => return self.build_forall(node, label.clone()),
            NodeKind::Suspend => {
                let idx = self.emit(OpCode::Suspend);
                self.note_debug_dense(idx, node.loc());
                // every statement must leave exactly one value on the stack
                self.emit_with(OpCode::Push, Value::nav());
                return Ok(());
            }
            NodeKind::Block { .. } => {
                let idx = self.emit(OpCode::EnterScope);
                if self.opt >= OptLevel::O2 {
                    self.state.scope_start.push(idx);
                }
                self.note_debug_dense(idx, node.loc());
                self.state.stack_node_level.push(self.state.node_level);
                self.state.scope_level += 1;
            }
            NodeKind::Expression { mode, .. } => {
                if *mode == ExprMode::Cond {
                    self.state.stack_node_level.push(self.state.node_level);
                }
                if self.opt == OptLevel::Debug {
                    let idx = self.emit(OpCode::ExprStart);
                    self.note_debug(idx, node.loc());
                }
            }
            NodeKind::ParamSpec { .. } => {
                let idx = self.emit_with(OpCode::ParamSpec, Value::from(node.child_count() as u64));
                self.note_debug_dense(idx, node.loc());
                // the parameter spec binds into its own scope
                let scope_idx = self.emit(OpCode::EnterScope);
                if self.opt >= OptLevel::O2 {
                    self.state.scope_start.push(scope_idx);
                }
                self.state.stack_node_level.push(self.state.node_level);
                self.state.scope_level += 1;
            }
            NodeKind::ParamList { .. } => {
                if self.opt == OptLevel::Debug {
                    let idx = self.emit(OpCode::ParamList);
                    self.note_debug(idx, node.loc());
                }
            }
            NodeKind::Else => {
                if self.opt == OptLevel::Debug {
                    let idx = self.emit(OpCode::Else);
                    self.note_debug(idx, node.loc());
                }
            }
            NodeKind::NoOp => {
                self.emit(OpCode::NoOpNav);
            }
            NodeKind::Repeat { label } => {
                let head = LoopHead {
                    label: label.clone(),
                    instr: self.instructions.len(),
                    scopes: self.state.scope_level,
                    pushes: 0,
                };
                self.loop_state().head_stack.push(head);
                if self.opt == OptLevel::Debug {
                    let idx = self.emit_with(OpCode::RepeatStart, Value::from(label.as_str()));
                    self.note_debug(idx, node.loc());
                }
            }
            NodeKind::Func { .. } => {
                let named = matches!(node.children().first().map(|c| c.kind()), Some(NodeKind::Identifier(_)));
                let name = if named {
                    node.children()[0].detail()
                } else {
                    "<lambda>".to_string()
                };
                let idx = self.emit_with(OpCode::FuncDef, Value::from(name));
                let name_loc = if named { node.children()[0].loc() } else { node.loc() };
                self.note_debug_default(idx, name_loc);
                self.state.func_start.push(self.instructions.len()); // the JumpRel below
                self.emit(OpCode::JumpRel);
                self.state.loop_states.push(LoopState {
                    current_scopes: self.state.scope_level,
                    ..LoopState::default()
                });
                self.state.loop_index += 1;
            }
            NodeKind::FromParam => {
                // the caller's location differs per call, no debug entry here
                self.emit(OpCode::FromParam);
                return Ok(());
            }
            NodeKind::FromParamOr => {
                self.state.param_or.push(self.instructions.len());
                self.emit(OpCode::FromParamOr);
            }
            _ => {}
        }

        // === body section: the generic child walk ===
        let child_count = node.child_count();
        for (i, child) in node.children().iter().enumerate() {
            self.build(child)?;
            if matches!(child.kind(), NodeKind::RawInstr(_)) {
                // assembly nodes manage the stack themselves
                continue;
            }
            // all but the last statement of a statement list must pop their
            // results to keep the stack clean
            let at_statement_level = self
                .state
                .stack_node_level
                .last()
                .is_some_and(|&top| top == self.state.node_level);
            if at_statement_level && i + 1 != child_count {
                match self.last_op() {
                    Some(OpCode::Push) => {
                        if self.opt >= OptLevel::O1 {
                            self.instructions.pop();
                        } else if self.opt == OptLevel::O0 {
                            *self.instructions.last_mut().expect("push present") = Instruction::bare(OpCode::NoOp);
                        } else {
                            self.emit(OpCode::Pop);
                        }
                    }
                    Some(OpCode::Replace) => {
                        if self.opt >= OptLevel::O1 {
                            // keep the length stable for jump targets: the
                            // Replace becomes a NoOp, a Pop still follows
                            *self.instructions.last_mut().expect("replace present") =
                                Instruction::bare(OpCode::NoOp);
                            self.emit(OpCode::Pop);
                        } else {
                            self.emit(OpCode::Pop);
                        }
                    }
                    _ => {
                        self.emit(OpCode::Pop);
                    }
                }
            }
        }

        // === footer section ===
        match node.kind() {
            NodeKind::Block { .. } => {
                if self.opt >= OptLevel::O2 {
                    if !self.optimize_scope() {
                        self.emit(OpCode::ExitScope);
                    }
                    self.state.scope_start.pop();
                } else {
                    let idx = self.emit(OpCode::ExitScope);
                    self.note_debug_dense(idx, node.loc());
                }
                self.state.scope_level -= 1;
            }
            NodeKind::Expression { mode, .. } => {
                if self.opt == OptLevel::Debug {
                    let idx = self.emit(OpCode::ExprEnd);
                    self.note_debug(idx, node.loc());
                }
                if *mode == ExprMode::ExprOrTuple && node.child_count() > 1 {
                    self.emit_with(OpCode::MakeTuple, Value::from(node.child_count() as u64));
                }
            }
            NodeKind::ParamList { .. } => {
                self.emit_with(OpCode::Push, Value::from(node.child_count() as u64));
            }
            NodeKind::Binary(op) => {
                if self.opt <= OptLevel::O0 {
                    let here = self.instructions.len();
                    self.note_debug(here, node.loc());
                }
                if !(self.opt >= OptLevel::O1 && self.try_fold_binary(*op)?) {
                    self.emit_with(OpCode::BinaryOp, Value::from(*op as u64));
                }
            }
            NodeKind::Bit(op) => {
                if self.opt <= OptLevel::O0 {
                    let here = self.instructions.len();
                    self.note_debug(here, node.loc());
                }
                if !(self.opt >= OptLevel::O1 && self.try_fold_bit(*op)?) {
                    self.emit_with(OpCode::BitOp, Value::from(*op as u64));
                }
            }
            NodeKind::IsType => {
                let idx = self.emit(OpCode::IsType);
                self.note_debug_default(idx, node.loc());
            }
            NodeKind::AsType => {
                let idx = self.emit(OpCode::AsType);
                self.note_debug_default(idx, node.loc());
            }
            NodeKind::Unary(op) => {
                if !(self.opt >= OptLevel::O1 && self.try_fold_unary(*op)?) {
                    let idx = self.emit_with(OpCode::UnaryOp, Value::from(*op as u64));
                    self.note_debug_default(idx, node.loc());
                }
            }
            NodeKind::CallFunc { .. } => {
                let name = callee_name(&node.children()[0]);
                let idx = self.emit_with(OpCode::CallFunc, Value::from(name));
                self.note_debug_default(idx, node.loc());
            }
            NodeKind::Subscript { .. } => {
                let idx = self.emit(OpCode::SubscriptGet);
                self.note_debug_default(idx, node.loc());
            }
            NodeKind::Yield => {
                let idx = self.emit(OpCode::Yield);
                self.note_debug_dense(idx, node.loc());
            }
            NodeKind::Return { .. } => {
                let scopes = self.state.scope_level - self.state.loop_states[self.state.loop_index].current_scopes;
                for _ in 0..scopes {
                    self.emit(OpCode::ExitScope);
                }
                self.emit(OpCode::Ret);
            }
            NodeKind::Exit { .. } => {
                self.emit(OpCode::ExitProgram);
            }
            NodeKind::Repeat { label } => self.close_repeat(node, label)?,
            NodeKind::Func { .. } => {
                // leave the parameter spec scope
                if self.opt >= OptLevel::O2 {
                    if !self.optimize_scope() {
                        self.emit(OpCode::ExitScope);
                    }
                    self.state.scope_start.pop();
                } else {
                    self.emit(OpCode::ExitScope);
                }
                self.state.scope_level -= 1;
                self.emit(OpCode::Ret);

                let func_start = self.state.func_start.pop().expect("pushed in header");
                let named = matches!(node.children().first().map(|c| c.kind()), Some(NodeKind::Identifier(_)));
                if named {
                    // the identifier child emitted a Load that is never reached
                    self.instructions[func_start + 1] = Instruction::bare(OpCode::NoOp);
                }
                // jump over the complete code of the function
                let offset = (self.instructions.len() - func_start) as i64;
                self.patch_jump(func_start, offset);

                self.state.loop_states.pop();
                self.state.loop_index -= 1;
            }
            NodeKind::ParamSpec { .. } => {
                // remove the last parameter binding result, if any
                if node.child_count() > 0 {
                    self.emit(OpCode::Pop);
                }
                self.emit(OpCode::ParamSpecClean);
            }
            NodeKind::FromParamOr => {
                // jump over the default code when the caller provided a value
                let pos = self.state.param_or.pop().expect("pushed in header");
                let offset = (self.instructions.len() - pos) as i64;
                self.patch_jump(pos, offset);
            }
            _ => {}
        }
        Ok(())
    }

    /// Emits a constant, fusing a preceding Pop into a Replace.
    fn emit_constant(&mut self, value: Value) {
        if self.opt != OptLevel::Debug && self.last_op() == Some(OpCode::Pop) {
            self.instructions.pop();
            if self.opt >= OptLevel::O1 {
                // neutralize Replace chains rendered dead by the removed Pop
                for instr in self.instructions.iter_mut().rev() {
                    if instr.op == OpCode::Replace {
                        *instr = Instruction::bare(OpCode::NoOp);
                    } else {
                        break;
                    }
                }
            }
            self.emit_with(OpCode::Replace, value);
        } else {
            self.emit_with(OpCode::Push, value);
        }
    }

    fn build_assign(&mut self, node: &Node, shared: bool, mode: AssignMode) -> EvalResult<()> {
        let lhs = &node.children()[0];
        match lhs.kind() {
            NodeKind::Identifier(name) => {
                // fuse a prior Pop into a Replace carrying the name
                if self.last_op() == Some(OpCode::Pop) {
                    *self.instructions.last_mut().expect("pop present") =
                        Instruction::new(OpCode::Replace, Value::from(name.as_str()));
                } else {
                    self.emit_with(OpCode::Push, Value::from(name.as_str()));
                }
                self.build(&node.children()[1])?;
                let op = match mode {
                    AssignMode::Assign => OpCode::Stor,
                    AssignMode::DefAssign => OpCode::DefVar,
                    AssignMode::ConstAssign => OpCode::ConstVar,
                };
                let idx = self.emit_with(op, Value::from(shared));
                self.note_debug_default(idx, node.loc());
                Ok(())
            }
            NodeKind::Dot => {
                self.build(&lhs.children()[0])?;
                let key = dot_key_payload(&lhs.children()[1])?;
                self.emit_with(OpCode::Push, key);
                self.build(&node.children()[1])?;
                let op = match mode {
                    AssignMode::Assign => OpCode::SetElement,
                    AssignMode::DefAssign => OpCode::DefElement,
                    AssignMode::ConstAssign => OpCode::ConstElement,
                };
                let idx = self.emit_with(op, Value::from(shared));
                self.note_debug_default(idx, lhs.children()[1].loc());
                Ok(())
            }
            NodeKind::Subscript { .. } => {
                self.build(&lhs.children()[0])?; // the tuple/buffer
                self.build(&lhs.children()[1])?; // the index values + count
                self.build(&node.children()[1])?; // the value
                let idx = self.emit_with(OpCode::SubscriptSet, Value::from(shared));
                self.note_debug_default(idx, node.children()[1].loc());
                Ok(())
            }
            _ => Err(EvalError::compile(
                "assignment target must be an identifier, element or subscript",
                lhs.loc().clone(),
            )),
        }
    }

    /// Short-circuit `and`/`or` with a jump over the RHS.
    fn build_short_circuit(&mut self, node: &Node, op: BinaryOp) -> EvalResult<()> {
        self.build(&node.children()[0])?;

        let pos = self.instructions.len();
        let already_tested = self.last_op() == Some(OpCode::Test);
        let jump_op = match (op, already_tested) {
            (BinaryOp::LogicalOr, true) => OpCode::JumpRelIf,
            (BinaryOp::LogicalOr, false) => OpCode::TestAndJumpRelIf,
            (_, true) => OpCode::JumpRelIfNot,
            (_, false) => OpCode::TestAndJumpRelIfNot,
        };
        let idx = self.emit(jump_op);
        self.note_debug_dense(idx, node.loc());

        // when not jumping, drop the LHS result before evaluating the RHS
        self.emit(OpCode::Pop);
        self.build(&node.children()[1])?;
        // avoid double tests for chained and/or combinations
        if self.last_op() != Some(OpCode::Test) {
            self.emit(OpCode::Test);
        }

        let offset = (self.instructions.len() - pos) as i64;
        self.patch_jump(pos, offset);
        Ok(())
    }

    fn build_if(&mut self, node: &Node) -> EvalResult<()> {
        if self.opt == OptLevel::Debug {
            let idx = self.emit(OpCode::If);
            self.note_debug(idx, node.loc());
        }

        // the condition gets its own scope: if (def a := check(), a) { .. }
        let scope_idx = self.emit(OpCode::EnterScope);
        if self.opt >= OptLevel::O2 {
            self.state.scope_start.push(scope_idx);
        }
        self.state.scope_level += 1;

        self.build(&node.children()[0])?;
        self.emit(OpCode::Test);

        let pos = self.instructions.len();
        self.emit(OpCode::JumpRelIfNot);
        self.emit(OpCode::Pop); // the condition result

        self.build(&node.children()[1])?;

        // +1 because a jump is inserted before the else branch
        let offset = (self.instructions.len() - pos + 1) as i64;
        self.patch_jump(pos, offset);

        if let Some(else_branch) = node.children().get(2) {
            let pos_else = self.instructions.len();
            self.emit(OpCode::JumpRel);
            self.emit(OpCode::Pop); // the condition result
            self.build(else_branch)?;
            let offset = (self.instructions.len() - pos_else) as i64;
            self.patch_jump(pos_else, offset);
        } else {
            // a missing else still produces a NaV
            self.emit_with(OpCode::JumpRel, Value::from(2i64));
            self.emit_with(OpCode::Replace, Value::nav());
        }

        if self.opt >= OptLevel::O2 {
            if !self.optimize_scope() {
                self.emit(OpCode::ExitScope);
            }
            self.state.scope_start.pop();
        } else {
            self.emit(OpCode::ExitScope);
        }
        self.state.scope_level -= 1;
        Ok(())
    }

    fn build_def_op(&mut self, node: &Node, kind: DefKind) -> EvalResult<()> {
        if kind == DefKind::Debug {
            if self.opt == OptLevel::Debug {
                let idx = self.emit_with(OpCode::Debug, Value::from(node.children()[0].detail()));
                self.note_debug(idx, node.loc());
            }
            // the statement still needs a result on the stack
            self.emit_with(OpCode::Push, Value::nav());
            return Ok(());
        }
        if self.opt <= OptLevel::O0 {
            let here = self.instructions.len();
            self.note_debug(here, node.loc());
        }
        let target = &node.children()[0];
        match target.kind() {
            NodeKind::Identifier(name) => match kind {
                DefKind::Undef => {
                    self.emit_with(OpCode::UndefVar, Value::from(name.as_str()));
                    Ok(())
                }
                DefKind::IsDef => {
                    self.emit_with(OpCode::IsDef, Value::from(name.as_str()));
                    Ok(())
                }
                _ => {
                    // bare def/const compiles to a placeholder
                    self.emit_with(OpCode::NotImplemented, Value::from(node.detail()));
                    Ok(())
                }
            },
            NodeKind::Dot => {
                self.build(&target.children()[0])?;
                let key = dot_key_payload(&target.children()[1])?;
                match kind {
                    DefKind::Undef => {
                        self.emit_with(OpCode::UndefElement, key);
                        Ok(())
                    }
                    DefKind::IsDef => {
                        self.emit_with(OpCode::IsDefElement, key);
                        Ok(())
                    }
                    _ => {
                        self.emit_with(OpCode::NotImplemented, Value::from(node.detail()));
                        Ok(())
                    }
                }
            }
            _ => {
                self.emit_with(OpCode::NotImplemented, Value::from(node.detail()));
                Ok(())
            }
        }
    }

    /// `loop [label]`: scope cleanup, a placeholder result, and a jump that
    /// the enclosing loop of matching label patches to its head.
    fn build_loop_request(&mut self, node: &Node, label: &str) -> EvalResult<()> {
        let mut pushes = 0usize;
        let mut found = None;
        for head in self.state.loop_states[self.state.loop_index].head_stack.iter().rev() {
            if head.label == label {
                found = Some(head.scopes);
                break;
            }
            pushes += head.pushes;
        }
        let Some(head_scopes) = found else {
            return Err(EvalError::compile(
                format!("no matching loop for loop statement found, label \"{label}\""),
                node.loc().clone(),
            ));
        };
        for _ in 0..(self.state.scope_level - head_scopes) {
            self.emit(OpCode::ExitScope);
        }
        for _ in 0..pushes {
            self.emit(OpCode::Pop);
        }
        // a loop statement produces a result, needed for stack consistency
        self.emit_with(OpCode::Push, Value::nav());

        let pos = self.instructions.len();
        let idx = self.emit(OpCode::JumpRel);
        self.note_debug_dense(idx, node.loc());
        let nested_level = self.state.loop_states[self.state.loop_index].head_stack.len();
        self.state.loop_states[self.state.loop_index].loop_requests.push(Request {
            label: label.to_string(),
            pos,
            nested_level,
        });
        Ok(())
    }

    /// `stop [label] [with expr]`: pop the working slots of the loops being
    /// left, produce the result, unwind scopes and jump past the loop.
    fn build_stop_request(&mut self, node: &Node, label: String) -> EvalResult<()> {
        if self.state.loop_states[self.state.loop_index].head_stack.is_empty() {
            // a stop without any loop halts the machine
            let idx = self.emit(OpCode::Halt);
            self.note_debug_dense(idx, node.loc());
            return Ok(());
        }
        let mut pushes = 0usize;
        let mut found = false;
        for head in self.state.loop_states[self.state.loop_index].head_stack.iter().rev() {
            pushes += head.pushes;
            if head.label == label {
                // stop also cleans up the matched loop itself
                found = true;
                break;
            }
        }
        if found {
            for _ in 0..pushes {
                self.emit(OpCode::Pop);
            }
        }

        if let Some(with_expr) = node.children().first() {
            self.build(with_expr)?;
        } else {
            self.emit_with(OpCode::Push, Value::nav());
        }

        let mut head_scopes = None;
        for head in self.state.loop_states[self.state.loop_index].head_stack.iter().rev() {
            if head.label == label {
                head_scopes = Some(head.scopes);
                break;
            }
        }
        let Some(head_scopes) = head_scopes else {
            return Err(EvalError::compile(
                format!("no matching loop for stop statement found, label \"{label}\""),
                node.loc().clone(),
            ));
        };
        for _ in 0..(self.state.scope_level - head_scopes) {
            self.emit(OpCode::ExitScope);
        }

        let pos = self.instructions.len();
        let idx = self.emit(OpCode::JumpRel);
        self.note_debug_dense(idx, node.loc());
        let nested_level = self.state.loop_states[self.state.loop_index].head_stack.len();
        self.state.loop_states[self.state.loop_index].stop_requests.push(Request {
            label,
            pos,
            nested_level,
        });
        Ok(())
    }

    fn close_repeat(&mut self, node: &Node, label: &str) -> EvalResult<()> {
        // `loop` statements jump to here: cleanup, then back to the head
        self.resolve_loop_requests(label);

        // remove the last body result, then loop back
        self.emit(OpCode::Pop);
        let head_instr = self.state.loop_states[self.state.loop_index]
            .head_stack
            .last()
            .expect("pushed in header")
            .instr;
        let offset = -((self.instructions.len() - head_instr) as i64);
        self.emit_with(OpCode::JumpRel, Value::from(offset));

        self.resolve_stop_requests(label);

        self.state.loop_states[self.state.loop_index].head_stack.pop();
        self.check_leftover_requests(node)?;

        if self.opt == OptLevel::Debug {
            let idx = self.emit_with(OpCode::RepeatEnd, Value::from(label));
            self.note_debug(idx, node.loc());
        }
        Ok(())
    }

    fn build_forall(&mut self, node: &Node, label: String) -> EvalResult<()> {
        // the induction variable name, then the sequence (or tuple)
        self.emit_with(OpCode::Push, Value::from(node.children()[0].detail()));
        self.build(&node.children()[1])?;

        // a new scope for the induction variable
        self.emit(OpCode::EnterScope);
        self.state.scope_level += 1;

        let head_pos = self.instructions.len();
        let idx = self.emit(OpCode::ForallHead);
        self.note_debug_dense(idx, node.loc());

        // the first iteration jumps over ForallNext
        self.emit_with(OpCode::JumpRel, Value::from(2i64));

        let head = LoopHead {
            label: label.clone(),
            instr: self.instructions.len(), // the ForallNext below
            scopes: self.state.scope_level,
            pushes: 2, // induction variable and sequence working slots
        };
        self.loop_state().head_stack.push(head);

        let next_pos = self.instructions.len();
        let next_idx = self.emit(OpCode::ForallNext);
        self.note_debug_dense(next_idx, node.loc());

        self.build(&node.children()[2])?;

        // `loop` statements jump to the back-jump below
        self.resolve_loop_requests(&label);

        let head_instr = self.state.loop_states[self.state.loop_index]
            .head_stack
            .last()
            .expect("pushed above")
            .instr;
        let offset = -((self.instructions.len() - head_instr) as i64);
        self.emit_with(OpCode::JumpRel, Value::from(offset));

        // exhaustion and the empty-iterable case both leave to right here
        let exit = self.instructions.len();
        self.patch_jump(next_pos, (exit - next_pos) as i64);
        self.patch_jump(head_pos, (exit - head_pos) as i64);

        self.resolve_stop_requests(&label);

        self.emit(OpCode::ExitScope);
        self.state.scope_level -= 1;

        self.state.loop_states[self.state.loop_index].head_stack.pop();
        self.check_leftover_requests(node)?;
        Ok(())
    }

    fn resolve_loop_requests(&mut self, label: &str) {
        let here = self.instructions.len();
        let depth = self.state.loop_states[self.state.loop_index].head_stack.len();
        let state = self.loop_state();
        let mut resolved = Vec::new();
        state.loop_requests.retain(|request| {
            if request.nested_level >= depth && request.label == label {
                resolved.push(request.pos);
                false
            } else {
                true
            }
        });
        for pos in resolved {
            self.instructions[pos].payload = Value::from((here - pos) as i64);
        }
    }

    fn resolve_stop_requests(&mut self, label: &str) {
        let here = self.instructions.len();
        let depth = self.state.loop_states[self.state.loop_index].head_stack.len();
        let state = self.loop_state();
        let mut resolved = Vec::new();
        state.stop_requests.retain(|request| {
            if request.nested_level >= depth && request.label == label {
                resolved.push(request.pos);
                false
            } else {
                true
            }
        });
        for pos in resolved {
            self.instructions[pos].payload = Value::from((here - pos) as i64);
        }
    }

    fn check_leftover_requests(&self, node: &Node) -> EvalResult<()> {
        let state = &self.state.loop_states[self.state.loop_index];
        if state.head_stack.is_empty() {
            if let Some(request) = state.stop_requests.first() {
                return Err(EvalError::compile(
                    format!("not all stop statements match a loop, label \"{}\"", request.label),
                    node.loc().clone(),
                ));
            }
            if let Some(request) = state.loop_requests.first() {
                return Err(EvalError::compile(
                    format!("not all loop statements match a loop, label \"{}\"", request.label),
                    node.loc().clone(),
                ));
            }
        }
        Ok(())
    }

    // --- peephole optimizations (O1+) --------------------------------------

    fn try_fold_unary(&mut self, op: crate::arithmetic::UnaryOp) -> EvalResult<bool> {
        let Some(last) = self.instructions.last() else {
            return Ok(false);
        };
        if matches!(last.op, OpCode::Push | OpCode::Replace) {
            let folded = arithmetic::static_exec_unary(op, &last.payload)?;
            self.instructions.last_mut().expect("present").payload = folded;
            return Ok(true);
        }
        Ok(false)
    }

    fn try_fold_binary(&mut self, op: BinaryOp) -> EvalResult<bool> {
        let n = self.instructions.len();
        if n < 2 {
            return Ok(false);
        }
        let both_const = matches!(self.instructions[n - 1].op, OpCode::Push | OpCode::Replace)
            && matches!(self.instructions[n - 2].op, OpCode::Push | OpCode::Replace);
        if !both_const {
            return Ok(false);
        }
        let folded = arithmetic::static_exec_binary(op, &self.instructions[n - 2].payload, &self.instructions[n - 1].payload)?;
        self.instructions[n - 2].payload = folded;
        self.instructions.pop();
        Ok(true)
    }

    fn try_fold_bit(&mut self, op: crate::arithmetic::BitOp) -> EvalResult<bool> {
        let n = self.instructions.len();
        if n < 2 {
            return Ok(false);
        }
        let both_const = matches!(self.instructions[n - 1].op, OpCode::Push | OpCode::Replace)
            && matches!(self.instructions[n - 2].op, OpCode::Push | OpCode::Replace);
        if !both_const {
            return Ok(false);
        }
        let folded = arithmetic::static_exec_bit(op, &self.instructions[n - 2].payload, &self.instructions[n - 1].payload)?;
        self.instructions[n - 2].payload = folded;
        self.instructions.pop();
        Ok(true)
    }

    /// O2 scope elision: a scope whose body declares nothing and never exits
    /// early collapses; the EnterScope becomes a NoOp so jump targets stay
    /// valid, the ExitScope is simply not emitted.
    fn optimize_scope(&mut self) -> bool {
        let Some(&start) = self.state.scope_start.last() else {
            return false;
        };
        let mut nested = 0usize;
        for idx in start + 1..self.instructions.len() {
            let op = self.instructions[idx].op;
            if nested == 0 && matches!(op, OpCode::DefVar | OpCode::ConstVar | OpCode::AutoVar | OpCode::FuncDef) {
                return false;
            }
            match op {
                OpCode::EnterScope => nested += 1,
                OpCode::ExitScope => {
                    if nested == 0 {
                        // cleanup code of a stop/loop/return leaves this scope
                        return false;
                    }
                    nested -= 1;
                }
                _ => {}
            }
        }
        self.instructions[start] = Instruction::bare(OpCode::NoOp);
        true
    }
}

/// The payload addressing a tuple element in the dot-operator lowerings.
fn dot_key_payload(rhs: &Node) -> EvalResult<Value> {
    match rhs.kind() {
        NodeKind::Identifier(name) => Ok(Value::from(name.as_str())),
        NodeKind::Constant(value) => Ok(value.clone()),
        _ => Err(EvalError::compile("dot operator: invalid access", rhs.loc().clone())),
    }
}

/// Display name for a call site: the identifier, or the joined dot branch.
fn callee_name(callee: &Node) -> String {
    match callee.kind() {
        NodeKind::Identifier(name) => name.clone(),
        NodeKind::Dot => {
            let mut parts = Vec::new();
            collect_dot_names(callee, &mut parts);
            parts.join(".")
        }
        _ => "<expr>".to_string(),
    }
}

fn collect_dot_names(node: &Node, out: &mut Vec<String>) {
    match node.kind() {
        NodeKind::Identifier(name) => out.push(name.clone()),
        NodeKind::Constant(value) => out.push(value.print_value()),
        NodeKind::Dot => {
            for child in node.children() {
                collect_dot_names(child, out);
            }
        }
        _ => {}
    }
}
