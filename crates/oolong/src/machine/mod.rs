//! The stack VM. Executes a [`Program`] against a [`Context`], maintaining an
//! operand stack and a call stack, honoring execution budgets, cooperative
//! suspension and an optional per-instruction callback.

mod constraints;
mod instruction;
mod program;

pub use constraints::{Constraints, DEFAULT_TIME_GRANULARITY};
pub use instruction::{Instruction, OpCode};
pub use program::{Program, ProgramPtr, combined_version};

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use strum::Display;

use crate::{
    arithmetic::{self, BinaryOp, BitOp, UnaryOp},
    ast,
    context::Context,
    control::EvalBreak,
    error::{ErrorKind, EvalError, EvalResult},
    func::{CompiledFunc, FunctionPtr},
    loc::SourceLocation,
    sequence::IntegerSequence,
    tuple::Tuple,
    types::TypeTag,
    value::{Value, ValueData},
};

/// Lifecycle states of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum State {
    /// No program present.
    Stopped,
    /// Instructions are actively processed.
    Running,
    /// Execution is suspended and can be continued.
    Suspended,
    /// Execution finished normally.
    Finished,
    /// Abnormal program end: HALT executed or an error occurred.
    Halted,
}

/// Why the machine halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MachineError {
    /// The halt instruction was executed.
    Halted,
    /// A script-level error was caught; see the stored exception.
    Exception,
    /// Not enough operand stack elements for the instruction.
    StackTooSmall,
    /// An unknown instruction was encountered.
    UnknownInstruction,
    /// A jump left the program.
    IllegalJump,
    /// The instruction (or its compilation) is not implemented.
    NotImplemented,
}

/// One frame of the call stack.
#[derive(Debug)]
pub struct CallStackEntry {
    /// Callee name when known.
    pub name: String,
    /// Return instruction index in the caller.
    pub ret: usize,
    /// Program holding the code being executed.
    pub program: ProgramPtr,
    /// Function object being executed, absent for the main frame.
    pub func: Option<FunctionPtr>,
}

/// Per-instruction callback: instruction, its index, and whether it was
/// reached by a jump.
pub type InstrCallback = Box<dyn FnMut(&Instruction, usize, bool)>;

/// Cloneable, thread-safe handle for requesting suspension of a running
/// machine from another thread.
#[derive(Debug, Clone)]
pub struct SuspendFlag(Arc<AtomicBool>);

impl SuspendFlag {
    /// Requests a suspend; honored at the next instruction boundary.
    pub fn request(&self) -> bool {
        self.0.store(true, Ordering::Release);
        true
    }
}

/// The stack VM.
///
/// Construct with [`Machine::new`] for single-thread use, or
/// [`Machine::with_thread_support`] to publish a stop flag that is polled
/// once per instruction so another thread can suspend execution.
pub struct Machine {
    stack: Vec<Value>,
    call_stack: Vec<CallStackEntry>,
    result: Option<Value>,
    error: Option<MachineError>,
    exception: Option<EvalError>,
    program: Option<ProgramPtr>,
    current: usize,
    state: State,
    stop_flag: Option<Arc<AtomicBool>>,
    instr_callback: Option<InstrCallback>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("state", &self.state)
            .field("current", &self.current)
            .field("stack_depth", &self.stack.len())
            .field("call_depth", &self.call_stack.len())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// A machine without thread-aware suspension.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(64),
            call_stack: Vec::with_capacity(32),
            result: None,
            error: None,
            exception: None,
            program: None,
            current: 0,
            state: State::Stopped,
            stop_flag: None,
            instr_callback: None,
        }
    }

    /// A machine publishing a stop flag for cross-thread suspend requests.
    #[must_use]
    pub fn with_thread_support() -> Self {
        let mut machine = Self::new();
        machine.stop_flag = Some(Arc::new(AtomicBool::new(false)));
        machine
    }

    #[must_use]
    pub fn has_thread_support(&self) -> bool {
        self.stop_flag.is_some()
    }

    /// Whether suspend requests from another thread can be issued on this
    /// instance.
    #[must_use]
    pub fn suspend_request_possible(&self) -> bool {
        self.has_thread_support()
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.state == State::Suspended
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.state == State::Halted
    }

    #[must_use]
    pub fn has_result(&self) -> bool {
        matches!(self.state, State::Finished | State::Suspended) && self.result.is_some()
    }

    /// Moves the result out; available in Finished and Suspended state.
    pub fn take_result(&mut self) -> Option<Value> {
        if matches!(self.state, State::Finished | State::Suspended) {
            self.result.take()
        } else {
            None
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<MachineError> {
        self.error
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.state == State::Halted && self.error.is_some()
    }

    /// Surfaces the stored error when the machine is halted.
    pub fn throw_possible_error(&self) -> EvalResult<()> {
        if self.state != State::Halted {
            return Ok(());
        }
        if let Some(exception) = &self.exception {
            return Err(exception.clone());
        }
        Err(match self.error {
            Some(MachineError::Halted) => EvalError::runtime("halt instruction was executed"),
            Some(MachineError::IllegalJump) => EvalError::runtime("jumped to illegal address/position"),
            Some(MachineError::NotImplemented) => EvalError::runtime("instruction not implemented"),
            Some(MachineError::UnknownInstruction) => EvalError::runtime("unknown instruction"),
            Some(MachineError::StackTooSmall) => EvalError::runtime("stack too small"),
            Some(MachineError::Exception) | None => EvalError::runtime("machine halted"),
        })
    }

    /// The operand stack; only meaningful when not running (debug surface).
    #[must_use]
    pub fn operand_stack(&self) -> &[Value] {
        &self.stack
    }

    /// The call stack; only meaningful when not running (debug surface).
    #[must_use]
    pub fn call_stack(&self) -> &[CallStackEntry] {
        &self.call_stack
    }

    /// The program counter where execution stopped. For Suspended state this
    /// points at the instruction executed next.
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current
    }

    #[must_use]
    pub fn main_program(&self) -> Option<&ProgramPtr> {
        self.program.as_ref()
    }

    /// Sets the per-instruction callback; must not be running.
    pub fn set_instr_callback(&mut self, callback: Option<InstrCallback>) -> EvalResult<()> {
        if self.state == State::Running {
            return Err(EvalError::runtime("machine is running, cannot set callback"));
        }
        self.instr_callback = callback;
        Ok(())
    }

    /// Resets all state from the previous run. Must not be running.
    pub fn reset(&mut self) -> EvalResult<()> {
        if self.state == State::Stopped {
            return Ok(());
        }
        if self.state == State::Running {
            return Err(EvalError::runtime("machine is running, cannot reset"));
        }
        self.program = None;
        self.stack.clear();
        self.call_stack.clear();
        self.result = None;
        self.error = None;
        self.exception = None;
        self.current = 0;
        if self.stop_flag.is_some() {
            self.stop_flag = Some(Arc::new(AtomicBool::new(false)));
        }
        self.state = State::Stopped;
        Ok(())
    }

    /// A handle other threads may use to request suspension.
    #[must_use]
    pub fn suspend_flag(&self) -> Option<SuspendFlag> {
        self.stop_flag.as_ref().map(|flag| SuspendFlag(flag.clone()))
    }

    /// Requests a suspend of the running machine. Returns `false` when the
    /// machine has no thread support.
    pub fn suspend(&self) -> bool {
        match &self.stop_flag {
            Some(flag) => {
                if self.state != State::Running {
                    return true; // worth checking the state after the call
                }
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Starts executing a new program. The machine must be stopped. Blocks
    /// until the program finishes, suspends or halts.
    pub fn exec(&mut self, program: &ProgramPtr, ctx: &mut Context, constraints: Constraints) -> EvalResult<()> {
        if self.state != State::Stopped {
            return Err(EvalError::runtime("machine must be in stopped state for exec"));
        }
        if program.compiler_version() != combined_version() {
            return Err(EvalError::runtime("invalid program: compiler version mismatch"));
        }
        self.program = Some(program.clone());
        // return from main is program end
        self.call_stack.push(CallStackEntry {
            name: "<main>".to_string(),
            ret: program.len(),
            program: program.clone(),
            func: None,
        });
        self.current = 0;
        self.state = State::Running;
        self.run(ctx, constraints);
        Ok(())
    }

    /// Continues a suspended program.
    pub fn continue_run(&mut self, ctx: &mut Context, constraints: Constraints) -> EvalResult<()> {
        if self.state != State::Suspended {
            return Err(EvalError::runtime("machine must be in suspended state for continue"));
        }
        self.result = None; // clear a possibly yielded result
        self.state = State::Running;
        self.run(ctx, constraints);
        Ok(())
    }

    /// Executes a subroutine of a program as if it were called: a dummy
    /// function object, the arguments and their count are placed on the
    /// stack, then execution starts at `start`.
    pub fn exec_subroutine(
        &mut self,
        program: &ProgramPtr,
        start: usize,
        ctx: &mut Context,
        params: Vec<Value>,
        loc: &SourceLocation,
    ) -> EvalResult<()> {
        if self.state != State::Stopped {
            return Err(EvalError::eval_at(
                "machine must be in stopped state for a subroutine call",
                loc.clone(),
            ));
        }
        if program.compiler_version() != combined_version() {
            return Err(EvalError::eval_at("invalid program: compiler version mismatch", loc.clone()));
        }
        if start > program.len() {
            return Err(EvalError::eval_at("illegal subroutine start address", loc.clone()));
        }
        self.stack.push(Value::nav()); // dummy function object
        let count = params.len() as u64;
        for param in params {
            self.stack.push(param);
        }
        self.stack.push(Value::from(count));
        self.program = Some(program.clone());
        self.current = start;
        self.call_stack.push(CallStackEntry {
            name: "<subroutine>".to_string(),
            ret: program.len(),
            program: program.clone(),
            func: None,
        });
        self.state = State::Running;
        self.run(ctx, Constraints::None);
        Ok(())
    }

    // --- the dispatch loop --------------------------------------------------

    fn run(&mut self, ctx: &mut Context, constraints: Constraints) {
        let started = Instant::now();
        let mut instr_count: u64 = 0;
        let mut running = true;
        let mut jumped = false;

        let mut program = match self.call_stack.last() {
            Some(frame) => frame.program.clone(),
            None => {
                self.error = Some(MachineError::IllegalJump);
                self.state = State::Halted;
                return;
            }
        };

        'dispatch: while running && self.current < program.len() {
            // an external suspend request wins before the next instruction
            if let Some(flag) = &self.stop_flag {
                if flag.swap(false, Ordering::Acquire) {
                    running = false;
                    break;
                }
            }

            match constraints {
                Constraints::InstrCount(max) => {
                    if instr_count >= max {
                        running = false;
                        break;
                    }
                }
                Constraints::Timed { limit, granularity } => {
                    if instr_count % granularity == 0 && started.elapsed() >= limit {
                        running = false;
                        break;
                    }
                }
                Constraints::None | Constraints::AutoContinue => {}
            }

            let instr = program.instructions()[self.current].clone();
            if let Some(callback) = &mut self.instr_callback {
                callback(&instr, self.current, jumped);
            }
            jumped = false;

            // a jump arm sets the new program counter and loops; everything
            // else falls through to the common increment at the bottom
            macro_rules! jump_to {
                ($target:expr) => {{
                    let target = $target;
                    if target < 0 {
                        self.error = Some(MachineError::IllegalJump);
                        break 'dispatch;
                    }
                    self.current = target as usize;
                    jumped = true;
                    instr_count += 1;
                    continue 'dispatch;
                }};
            }
            macro_rules! jump_rel {
                ($offset:expr) => {
                    jump_to!(self.current as i64 + $offset)
                };
            }
            macro_rules! stack_need {
                ($n:expr) => {
                    if self.stack.len() < $n {
                        self.error = Some(MachineError::StackTooSmall);
                        break 'dispatch;
                    }
                };
            }
            macro_rules! vm_try {
                ($expr:expr) => {
                    match $expr {
                        Ok(value) => value,
                        Err(err) => {
                            self.record_exception(err, &program);
                            break 'dispatch;
                        }
                    }
                };
            }

            match instr.op {
                OpCode::Halt => {
                    self.error = Some(MachineError::Halted);
                    break 'dispatch;
                }
                OpCode::ProgramEnd
                | OpCode::NoOp
                | OpCode::Debug
                | OpCode::ExprStart
                | OpCode::ExprEnd
                | OpCode::If
                | OpCode::Else
                | OpCode::RepeatStart
                | OpCode::RepeatEnd
                | OpCode::ParamList => {}
                OpCode::NoOpNav => self.stack.push(Value::nav()),
                OpCode::Push => self.stack.push(instr.payload.clone()),
                OpCode::Pop => {
                    stack_need!(1);
                    self.stack.pop();
                }
                OpCode::Replace => {
                    stack_need!(1);
                    *self.stack.last_mut().expect("length checked") = instr.payload.clone();
                }
                OpCode::Swap => {
                    stack_need!(2);
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                }
                OpCode::Load => {
                    let name = vm_try!(instr.payload.get_string());
                    let value = vm_try!(ctx.find_value(&name));
                    self.stack.push(value);
                }
                OpCode::Stor => {
                    stack_need!(2);
                    let shared = vm_try!(instr.payload.get_bool());
                    let val = self.stack.pop().expect("length checked");
                    let name = vm_try!(self.stack.last().expect("length checked").get_string());
                    let stored = match ctx.set_value(&name, &val, shared) {
                        Ok(stored) => stored,
                        Err(err)
                            if err.kind() == ErrorKind::UnknownIdentifier
                                && ctx.dialect.auto_define_unknown_identifiers =>
                        {
                            let mut val = val;
                            if !shared {
                                val.detach(true);
                            }
                            val.make_shared();
                            vm_try!(ctx.add_value(&name, val))
                        }
                        Err(err) => {
                            self.record_exception(err, &program);
                            break 'dispatch;
                        }
                    };
                    *self.stack.last_mut().expect("length checked") = stored;
                }
                OpCode::DefVar | OpCode::ConstVar | OpCode::AutoVar => {
                    stack_need!(2);
                    let shared = vm_try!(instr.payload.get_bool());
                    let mut val = self.stack.pop().expect("length checked");
                    let name = vm_try!(self.stack.last().expect("length checked").get_string());
                    if instr.op == OpCode::DefVar {
                        if shared {
                            if val.is_shared() && val.is_const() {
                                self.record_exception(EvalError::const_shared_assign(), &program);
                                break 'dispatch;
                            }
                        } else {
                            // unconditional copy so the defined value is mutable
                            val.detach(false);
                        }
                    } else if !shared && val.share_count() > 1 {
                        // only copy values living on some store already
                        val.detach(true);
                    }
                    val.make_shared();
                    if instr.op == OpCode::ConstVar {
                        val.make_const();
                    }
                    let stored = vm_try!(ctx.add_value(&name, val));
                    *self.stack.last_mut().expect("length checked") = stored;
                }
                OpCode::UndefVar => {
                    let name = vm_try!(instr.payload.get_string());
                    match ctx.remove_value(&name) {
                        Ok(_) => self.stack.push(Value::from(true)),
                        Err(err)
                            if err.kind() == ErrorKind::UnknownIdentifier
                                && ctx.dialect.undefine_unknown_identifiers_allowed =>
                        {
                            self.stack.push(Value::from(false));
                        }
                        Err(err) => {
                            self.record_exception(err, &program);
                            break 'dispatch;
                        }
                    }
                }
                OpCode::IsDef => {
                    let name = vm_try!(instr.payload.get_string());
                    match ctx.is_defined(&name) {
                        Some(distance) => self.stack.push(Value::from(distance)),
                        None => self.stack.push(Value::from(false)),
                    }
                }
                OpCode::MakeTuple => {
                    let count = vm_try!(instr.payload.get_u64()) as usize;
                    stack_need!(count);
                    let at = self.stack.len() - count;
                    let mut tuple = Tuple::new();
                    tuple.reserve(count);
                    for mut value in self.stack.split_off(at) {
                        value.make_shared();
                        tuple.append(value);
                    }
                    self.stack.push(Value::from(tuple).shared());
                }
                OpCode::SetElement | OpCode::DefElement | OpCode::ConstElement => {
                    stack_need!(3);
                    let shared = vm_try!(instr.payload.get_bool());
                    let val = self.stack.pop().expect("length checked");
                    let id = self.stack.pop().expect("length checked");
                    let obj = self.stack.last_mut().expect("length checked");
                    let element = vm_try!(apply_element_op(obj, &id, val, instr.op, shared));
                    *self.stack.last_mut().expect("length checked") = element;
                }
                OpCode::IsDefElement | OpCode::UndefElement => {
                    stack_need!(1);
                    let remove = instr.op == OpCode::UndefElement;
                    if remove && self.stack.last().expect("length checked").is_const() {
                        self.record_exception(
                            EvalError::eval("tuple is const, elements cannot be removed"),
                            &program,
                        );
                        break 'dispatch;
                    }
                    let outcome =
                        element_exists_or_remove(self.stack.last_mut().expect("length checked"), &instr.payload, remove);
                    let found = vm_try!(outcome);
                    *self.stack.last_mut().expect("length checked") = Value::from(found);
                }
                OpCode::SubscriptGet => {
                    stack_need!(2);
                    let count = vm_try!(self.stack.last().expect("length checked").get_u64()) as usize;
                    stack_need!(count + 2);
                    let s = self.stack.len();
                    let obj_at = s - (count + 2);
                    let loc = program.best_matching_location(self.current);
                    let result = {
                        let params = &self.stack[s - (count + 1)..s - 1];
                        vm_try!(ast::subscript_get_value(&self.stack[obj_at], params, &loc))
                    };
                    self.stack[obj_at] = result;
                    self.stack.truncate(obj_at + 1);
                }
                OpCode::SubscriptSet => {
                    stack_need!(3);
                    let shared = vm_try!(instr.payload.get_bool());
                    let s = self.stack.len();
                    let count = vm_try!(self.stack[s - 2].get_u64()) as usize;
                    stack_need!(count + 3);
                    let obj_at = s - (count + 3);
                    let loc = program.best_matching_location(self.current);
                    let result = {
                        let value = &self.stack[s - 1];
                        let params = &self.stack[s - (count + 2)..s - 2];
                        vm_try!(ast::subscript_set_value(
                            self.stack[obj_at].clone(),
                            params,
                            value,
                            shared,
                            &loc
                        ))
                    };
                    self.stack[obj_at] = result;
                    self.stack.truncate(obj_at + 1);
                }
                OpCode::UnaryOp => {
                    stack_need!(1);
                    let op = vm_try!(decode_op::<UnaryOp>(&instr.payload));
                    let operand = self.stack.last().expect("length checked");
                    let result = vm_try!(arithmetic::static_exec_unary(op, operand));
                    *self.stack.last_mut().expect("length checked") = result;
                }
                OpCode::BinaryOp => {
                    stack_need!(2);
                    let op = vm_try!(decode_op::<BinaryOp>(&instr.payload));
                    let s = self.stack.len();
                    let result = vm_try!(arithmetic::static_exec_binary(op, &self.stack[s - 2], &self.stack[s - 1]));
                    self.stack[s - 2] = result;
                    self.stack.pop();
                }
                OpCode::BitOp => {
                    stack_need!(2);
                    let op = vm_try!(decode_op::<BitOp>(&instr.payload));
                    let s = self.stack.len();
                    let result = vm_try!(arithmetic::static_exec_bit(op, &self.stack[s - 2], &self.stack[s - 1]));
                    self.stack[s - 2] = result;
                    self.stack.pop();
                }
                OpCode::IsType | OpCode::AsType => {
                    stack_need!(2);
                    let s = self.stack.len();
                    let result = if instr.op == OpCode::IsType {
                        vm_try!(arithmetic::static_exec_is_type(&self.stack[s - 2], &self.stack[s - 1]))
                    } else {
                        vm_try!(arithmetic::static_exec_as_type(&self.stack[s - 2], &self.stack[s - 1]))
                    };
                    self.stack[s - 2] = result;
                    self.stack.pop();
                }
                OpCode::DotOp => {
                    stack_need!(2);
                    let id = self.stack.pop().expect("length checked");
                    let obj = self.stack.last_mut().expect("length checked");
                    let element = vm_try!(dot_read(obj, &id));
                    *self.stack.last_mut().expect("length checked") = element;
                }
                OpCode::EnterScope => ctx.enter_scope(),
                OpCode::ExitScope => ctx.exit_scope(),
                OpCode::Test => {
                    stack_need!(1);
                    let result = vm_try!(self.stack.last().expect("length checked").get_as_bool());
                    *self.stack.last_mut().expect("length checked") = Value::from(result);
                }
                OpCode::JumpRel => {
                    let offset = vm_try!(instr.payload.get_i64());
                    jump_rel!(offset);
                }
                OpCode::JumpRelIf | OpCode::JumpRelIfNot | OpCode::TestAndJumpRelIf | OpCode::TestAndJumpRelIfNot => {
                    stack_need!(1);
                    let result = vm_try!(self.stack.last().expect("length checked").get_as_bool());
                    if matches!(instr.op, OpCode::TestAndJumpRelIf | OpCode::TestAndJumpRelIfNot) {
                        *self.stack.last_mut().expect("length checked") = Value::from(result);
                    }
                    let take = match instr.op {
                        OpCode::JumpRelIf | OpCode::TestAndJumpRelIf => result,
                        _ => !result,
                    };
                    if take {
                        let offset = vm_try!(instr.payload.get_i64());
                        jump_rel!(offset);
                    }
                }
                OpCode::ForallHead => {
                    stack_need!(2);
                    let s = self.stack.len();
                    let seq_val = self.stack[s - 1].clone();
                    let seq = match seq_val.data_tag() {
                        TypeTag::IntegerSequence => Some(vm_try!(seq_val.get_sequence())),
                        TypeTag::Tuple => {
                            let size = seq_val.length().unwrap_or(0);
                            if size == 0 {
                                None // empty iterable: skip the whole loop
                            } else {
                                Some(vm_try!(IntegerSequence::new(0, size as i64 - 1, 1)))
                            }
                        }
                        _ => {
                            vm_try!(Err(EvalError::eval(
                                "forall can only iterate an IntegerSequence or a Tuple"
                            )))
                        }
                    };
                    match seq {
                        None => {
                            self.stack[s - 2] = Value::nav();
                            self.stack.pop();
                            let offset = vm_try!(instr.payload.get_i64());
                            jump_rel!(offset);
                        }
                        Some(mut seq) => {
                            seq.reset();
                            let name = vm_try!(self.stack[s - 2].get_string());
                            let induction = vm_try!(ctx.add_value(&name, Value::from(seq.current()).shared()));
                            self.stack[s - 2] = induction;
                            self.stack[s - 1] = Value::sequence(seq).shared();
                        }
                    }
                }
                OpCode::ForallNext => {
                    stack_need!(3);
                    let s = self.stack.len();
                    let advanced = self.stack[s - 2].with_data_mut(|data| match data {
                        ValueData::Sequence(seq) => {
                            if seq.next() {
                                Ok(Some(seq.current()))
                            } else {
                                Ok(None)
                            }
                        }
                        _ => Err(EvalError::runtime("forall working stack is damaged")),
                    });
                    match vm_try!(advanced) {
                        Some(next) => {
                            let mut induction = self.stack[s - 3].clone();
                            vm_try!(induction.assign_i64(next));
                            self.stack.pop(); // clear the previous body result
                        }
                        None => {
                            let result = self.stack.pop().expect("length checked");
                            self.stack.pop(); // the sequence
                            *self.stack.last_mut().expect("length checked") = result;
                            let offset = vm_try!(instr.payload.get_i64());
                            jump_rel!(offset);
                        }
                    }
                }
                OpCode::CallFunc => {
                    stack_need!(2);
                    let count = vm_try!(self.stack.last().expect("length checked").get_u64()) as usize;
                    stack_need!(count + 2);
                    let func_at = self.stack.len() - (count + 2);
                    let func = vm_try!(self.stack[func_at].get_function());
                    if let Some(compiled) = func.as_compiled() {
                        let name = instr.payload.get_string().unwrap_or_else(|_| "<lambda>".to_string());
                        let callee_program = compiled.program().clone();
                        let start = compiled.start_address();
                        self.call_stack.push(CallStackEntry {
                            name,
                            ret: self.current + 1,
                            program: callee_program.clone(),
                            func: Some(func.clone()),
                        });
                        program = callee_program;
                        jump_to!(start as i64);
                    } else {
                        self.stack.pop(); // the argument count
                        let args = self.stack.split_off(self.stack.len() - count);
                        let loc = program.best_matching_location(self.current);
                        match func.call(ctx, args, &loc) {
                            Ok(result) => {
                                *self.stack.last_mut().expect("length checked") = result;
                            }
                            Err(EvalBreak::Exit(result)) => {
                                *self.stack.last_mut().expect("length checked") = result;
                                self.handle_exit(ctx);
                                let main = &self.call_stack[0];
                                program = main.program.clone();
                                jump_to!(main.ret as i64);
                            }
                            Err(EvalBreak::Error(err)) => {
                                self.record_exception(err, &program);
                                break 'dispatch;
                            }
                            Err(other) => {
                                self.record_exception(other.into_error(), &program);
                                break 'dispatch;
                            }
                        }
                    }
                }
                OpCode::FuncDef => {
                    let frame_program = self
                        .call_stack
                        .last()
                        .map_or_else(|| program.clone(), |frame| frame.program.clone());
                    let compiled = CompiledFunc::new(frame_program, self.current + 2);
                    let func: FunctionPtr = std::rc::Rc::new(compiled);
                    let value = Value::function(func).shared();
                    let name = vm_try!(instr.payload.get_string());
                    if name == "<lambda>" {
                        self.stack.push(value);
                    } else {
                        vm_try!(ctx.add_value(&name, value));
                        // usable in boolean expressions
                        self.stack.push(Value::from(true));
                    }
                }
                OpCode::Ret => {
                    if self.call_stack.is_empty() {
                        self.record_exception(
                            EvalError::runtime("no return address for return from function"),
                            &program,
                        );
                        break 'dispatch;
                    }
                    let ret = self.call_stack.last().expect("checked above").ret;
                    if self.call_stack.len() > 1 {
                        self.call_stack.pop(); // keep the main frame
                    }
                    program = self.call_stack.last().expect("main frame stays").program.clone();
                    jump_to!(ret as i64);
                }
                OpCode::ParamSpec => {
                    stack_need!(1);
                    // a working copy of the argument count for decrementing
                    let count = vm_try!(self.stack.last().expect("length checked").get_u64());
                    self.stack.push(Value::from(count));
                }
                OpCode::ParamSpecClean => {
                    stack_need!(3);
                    let left = vm_try!(self.stack.last().expect("length checked").get_u64());
                    if left != 0 {
                        let loc = self.caller_location();
                        self.record_exception(
                            EvalError::eval_at("too many arguments for function call", loc),
                            &program,
                        );
                        break 'dispatch;
                    }
                    self.stack.pop(); // working count
                    let orig = vm_try!(self.stack.pop().expect("length checked").get_u64()) as usize;
                    stack_need!(orig + 1);
                    self.stack.truncate(self.stack.len() - orig); // the consumed arguments
                    self.stack.pop(); // the function object
                }
                OpCode::FromParam | OpCode::FromParamOr => {
                    stack_need!(3);
                    let pos = self.stack.len() - 2;
                    let count = vm_try!(self.stack[pos].get_u64()) as usize;
                    if count == 0 {
                        if instr.op == OpCode::FromParam {
                            let loc = self.caller_location();
                            self.record_exception(
                                EvalError::eval_at("too few arguments for function call", loc),
                                &program,
                            );
                            break 'dispatch;
                        }
                        // FromParamOr: fall through into the default expression
                    } else {
                        stack_need!(3 + count);
                        let arg_at = pos - (1 + count);
                        let arg = std::mem::replace(&mut self.stack[arg_at], Value::nav());
                        self.stack.push(arg);
                        self.stack[pos] = Value::from((count - 1) as u64);
                        if instr.op == OpCode::FromParamOr {
                            // jump over the default parameter code
                            let offset = vm_try!(instr.payload.get_i64());
                            jump_rel!(offset);
                        }
                    }
                }
                OpCode::ExitProgram => {
                    self.handle_exit(ctx);
                    let main = &self.call_stack[0];
                    program = main.program.clone();
                    jump_to!(main.ret as i64);
                }
                OpCode::Suspend => {
                    if !constraints.is_auto_continue() {
                        running = false;
                    }
                }
                OpCode::Yield => {
                    // don't pop: every statement must leave one value and the
                    // cleanup code after the yield expects it
                    self.result = self.stack.last().cloned();
                    running = false;
                }
                OpCode::Catch | OpCode::NotImplemented => {
                    self.error = Some(MachineError::NotImplemented);
                    break 'dispatch;
                }
            }

            instr_count += 1;
            self.current += 1;
        }

        // --- epilogue: decide the final state -------------------------------

        if self.error.is_some() {
            self.state = State::Halted;
            return;
        }
        if !running {
            self.state = State::Suspended;
            return;
        }
        if let Some(frame) = self.call_stack.last() {
            if self.current > frame.program.len() {
                self.error = Some(MachineError::IllegalJump);
                self.state = State::Halted;
                return;
            }
        }
        if self.call_stack.len() == 1 {
            self.call_stack.pop();
        } else {
            self.exception = Some(EvalError::runtime("call stack depth != 1, Ret instruction missing?"));
            self.error = Some(MachineError::Exception);
            self.state = State::Halted;
            return;
        }
        if let Some(result) = self.stack.pop() {
            self.result = Some(result);
        }
        self.state = State::Finished;
    }

    /// Unwinds for `_Exit`: keep only the topmost stack value, drop all local
    /// scopes and all frames above main.
    fn handle_exit(&mut self, ctx: &mut Context) {
        if self.stack.len() > 1 {
            let top = self.stack.pop().expect("length checked");
            self.stack.clear();
            self.stack.push(top);
        }
        ctx.exit_all_local_scopes();
        self.call_stack.truncate(1);
    }

    /// Source location of the call site of the current frame, for arity
    /// errors raised inside the callee's parameter spec.
    fn caller_location(&self) -> SourceLocation {
        if self.call_stack.len() < 2 {
            return SourceLocation::default();
        }
        let caller = &self.call_stack[self.call_stack.len() - 2];
        let callee = &self.call_stack[self.call_stack.len() - 1];
        caller
            .program
            .location_for(callee.ret.saturating_sub(1))
            .cloned()
            .unwrap_or_default()
    }

    /// Records a caught script-level error, enriched with the best matching
    /// source location from the debug map.
    fn record_exception(&mut self, err: EvalError, program: &Program) {
        self.exception = Some(err.with_location(&program.best_matching_location(self.current)));
        self.error = Some(MachineError::Exception);
    }
}

fn decode_op<T: TryFrom<u64>>(payload: &Value) -> EvalResult<T> {
    let raw = payload.get_u64()?;
    T::try_from(raw).map_err(|_| EvalError::runtime("unknown operation ordinal in instruction payload"))
}

/// Set/Def/ConstElement: writes `val` into the element of `obj` addressed by
/// `id`, creating it for the define forms. Returns the element handle.
fn apply_element_op(obj: &mut Value, id: &Value, mut val: Value, op: OpCode, shared: bool) -> EvalResult<Value> {
    if obj.data_tag() != TypeTag::Tuple {
        return Err(EvalError::eval("dot operator: lhs is not a Tuple"));
    }
    if obj.is_const() {
        return Err(if op == OpCode::SetElement {
            EvalError::new(ErrorKind::ConstAssign, "tuple is const, elements cannot be changed")
        } else {
            EvalError::eval("tuple is const, elements cannot be added")
        });
    }
    if op == OpCode::SetElement {
        let element = obj.with_data_mut(|data| match data {
            ValueData::Tuple(tuple) => {
                let idx = tuple_index(tuple, id)?;
                let slot = tuple
                    .get_mut(idx)
                    .ok_or_else(|| EvalError::out_of_range("tuple element vanished"))?;
                slot.make_shared();
                Ok(slot.clone())
            }
            _ => Err(EvalError::eval("dot operator: lhs is not a Tuple")),
        });
        let mut element = element?;
        if shared {
            element.shared_assign_value(&val)?;
        } else {
            element.assign_value(&val)?;
        }
        return Ok(element);
    }

    // the define forms carry the assign-declaration semantics
    if op == OpCode::DefElement {
        if shared {
            if val.is_shared() && val.is_const() {
                return Err(EvalError::const_shared_assign());
            }
        } else {
            val.detach(false);
        }
    } else if !shared && val.share_count() > 1 {
        val.detach(true);
    }
    val.make_shared();
    if op == OpCode::ConstElement {
        val.make_const();
    }

    obj.with_data_mut(|data| {
        let ValueData::Tuple(tuple) = data else {
            return Err(EvalError::eval("dot operator: lhs is not a Tuple"));
        };
        if id.data_tag() == TypeTag::String {
            let key = id.get_string()?;
            if !tuple.append_key_value(&key, val.clone()) {
                return Err(EvalError::redefinition(&key));
            }
            tuple
                .get_by_key(&key)
                .cloned()
                .ok_or_else(|| EvalError::out_of_range("tuple element vanished"))
        } else {
            let idx = id.get_as_integer()?;
            if idx < 0 || idx as usize > tuple.size() {
                return Err(EvalError::out_of_range(format!("cannot append at index {idx}")));
            }
            if idx as usize != tuple.size() {
                return Err(EvalError::redefinition(&idx.to_string()));
            }
            tuple.append(val.clone());
            tuple
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| EvalError::out_of_range("tuple element vanished"))
        }
    })
}

/// IsDefElement / UndefElement over the tuple on top of the stack.
fn element_exists_or_remove(lhs: &mut Value, id: &Value, remove: bool) -> EvalResult<bool> {
    if lhs.data_tag() != TypeTag::Tuple {
        return Err(EvalError::eval("dot operator: lhs is not a Tuple"));
    }
    lhs.with_data_mut(|data| {
        let ValueData::Tuple(tuple) = data else {
            return Err(EvalError::eval("dot operator: lhs is not a Tuple"));
        };
        let idx = if id.data_tag() == TypeTag::String {
            tuple.index_of_key(&id.get_string()?)
        } else {
            usize::try_from(id.get_as_integer()?).ok().filter(|i| tuple.contains_idx(*i))
        };
        match idx {
            Some(idx) => {
                if remove {
                    tuple.remove_by_idx(idx);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    })
}

/// DotOp read: the element of `obj` addressed by the `id` value.
fn dot_read(obj: &mut Value, id: &Value) -> EvalResult<Value> {
    if obj.data_tag() != TypeTag::Tuple {
        return Err(EvalError::eval("dot operator: lhs is not a Tuple"));
    }
    let obj_const = obj.is_const();
    let element = obj.with_data_mut(|data| match data {
        ValueData::Tuple(tuple) => {
            let idx = tuple_index(tuple, id)?;
            let slot = tuple
                .get_mut(idx)
                .ok_or_else(|| EvalError::out_of_range("tuple element vanished"))?;
            slot.make_shared();
            Ok(slot.clone())
        }
        _ => Err(EvalError::eval("dot operator: lhs is not a Tuple")),
    });
    let mut element = element?;
    if obj_const {
        element.make_const();
    }
    Ok(element)
}

fn tuple_index(tuple: &Tuple, id: &Value) -> EvalResult<usize> {
    if id.data_tag() == TypeTag::String {
        let key = id.get_string()?;
        return tuple
            .index_of_key(&key)
            .ok_or_else(|| EvalError::unknown_identifier(&key));
    }
    let idx = id.get_as_integer()?;
    let idx = usize::try_from(idx).map_err(|_| EvalError::out_of_range("negative tuple index"))?;
    if !tuple.contains_idx(idx) {
        return Err(EvalError::out_of_range(format!("tuple has no element {idx}")));
    }
    Ok(idx)
}
