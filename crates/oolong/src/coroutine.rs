//! Runs compiled programs as coroutines: the script suspends itself (or is
//! suspended by constraints or by request) and yields values; the host
//! resumes it, optionally injecting input parameters between runs.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use strum::Display;

use crate::{
    context::Context,
    error::{EvalError, EvalResult},
    machine::{Constraints, Machine, ProgramPtr, State, SuspendFlag},
    value::Value,
};

/// Coroutine lifecycle, a thin view over the machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CoroutineState {
    /// No coroutine loaded.
    Stopped,
    /// A thread is inside `run`/`run_for`.
    Running,
    /// Suspended; can be resumed and accepts input parameters.
    Suspended,
    /// All instructions executed; no more values can be yielded.
    Finished,
    /// An error terminated the coroutine.
    Halted,
}

/// Drives one program as a resumable computation.
///
/// The engine owns one VM (with thread-aware suspension) and one private
/// context whose global scope stays clean across resumes: every loaded
/// coroutine executes inside a fresh local scope.
///
/// The lifecycle is protected: at most one `run`/`run_for` executes at a
/// time, and `suspend` may be called from any thread through
/// [`CoroutineEngine::suspend_handle`]. The value graph itself is *not*
/// protected; sharing values across threads needs external synchronization.
#[derive(Debug)]
pub struct CoroutineEngine {
    running: Arc<AtomicBool>,
    context: Context,
    machine: Machine,
    program: Option<ProgramPtr>,
}

impl CoroutineEngine {
    /// An engine with a fresh context; no coroutine loaded yet.
    #[must_use]
    pub fn new() -> Self {
        Self::with_context(Context::new())
    }

    /// Uses the given context for the coroutine. Any existing local scopes
    /// are removed.
    #[must_use]
    pub fn with_context(mut context: Context) -> Self {
        context.exit_all_local_scopes();
        Self {
            running: Arc::new(AtomicBool::new(false)),
            context,
            machine: Machine::with_thread_support(),
            program: None,
        }
    }

    /// Prepares the engine to execute `program` and immediately loads it.
    pub fn with_program(program: ProgramPtr) -> EvalResult<Self> {
        let mut engine = Self::new();
        engine.change_coroutine(program)?;
        Ok(engine)
    }

    #[must_use]
    pub fn state(&self) -> CoroutineState {
        if self.running.load(Ordering::Acquire) {
            return CoroutineState::Running;
        }
        match self.machine.state() {
            State::Stopped => CoroutineState::Stopped,
            State::Running => CoroutineState::Running,
            State::Suspended => CoroutineState::Suspended,
            State::Finished => CoroutineState::Finished,
            State::Halted => CoroutineState::Halted,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the coroutine can be continued (for yielding more values).
    #[must_use]
    pub fn can_be_continued(&self) -> bool {
        self.state() == CoroutineState::Suspended
    }

    /// Whether the coroutine is completely finished. Depending on the
    /// coroutine code this state might never be reached.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == CoroutineState::Finished
    }

    /// Access to the engine's private context, e.g. for registering host
    /// functions. Must not be used while the coroutine is running.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Replaces the loaded coroutine. The machine is reset, all local scopes
    /// are discarded, a fresh one is entered, and the program is pre-loaded
    /// by executing zero instructions (which initializes function tables and
    /// leaves the machine resumable at instruction zero).
    pub fn change_coroutine(&mut self, program: ProgramPtr) -> EvalResult<()> {
        if self.is_running() {
            return Err(EvalError::runtime("coroutine is running, cannot change it"));
        }
        self.machine.reset()?;
        self.context.exit_all_local_scopes();
        self.context.enter_scope();
        self.machine.exec(&program, &mut self.context, Constraints::max_instructions(0))?;
        self.program = Some(program);
        Ok(())
    }

    /// Resets and prepares the currently loaded coroutine again.
    pub fn reset(&mut self) -> EvalResult<()> {
        let Some(program) = self.program.clone() else {
            return Err(EvalError::runtime("no coroutine loaded"));
        };
        self.change_coroutine(program)
    }

    /// Whether a suspend request can be sent from another thread on this
    /// platform/build.
    #[must_use]
    pub fn is_suspend_request_possible(&self) -> bool {
        self.machine.suspend_request_possible()
    }

    /// Sends a suspend request to the running coroutine; honored at the next
    /// instruction boundary. Returns `false` when requests are not possible.
    pub fn suspend(&self) -> bool {
        self.machine.suspend()
    }

    /// A handle for requesting suspension from another thread.
    #[must_use]
    pub fn suspend_handle(&self) -> Option<SuspendFlag> {
        self.machine.suspend_flag()
    }

    /// Runs the coroutine until it yields, suspends, finishes or fails.
    /// Returns the yielded value if any, NaV otherwise.
    pub fn run(&mut self) -> EvalResult<Value> {
        self.run_for(Constraints::None)
    }

    /// Runs the coroutine under an execution budget.
    pub fn run_for(&mut self, constraints: Constraints) -> EvalResult<Value> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EvalError::runtime("coroutine is already running"));
        }
        let outcome = self.run_locked(constraints);
        self.running.store(false, Ordering::Release);
        outcome
    }

    fn run_locked(&mut self, constraints: Constraints) -> EvalResult<Value> {
        if !self.machine.is_suspended() {
            return Err(EvalError::runtime(
                "coroutine cannot be continued (finished, halted or not loaded)",
            ));
        }
        self.machine.continue_run(&mut self.context, constraints)?;
        self.machine.throw_possible_error()?;
        Ok(self.machine.take_result().unwrap_or_else(Value::nav))
    }

    /// Adds the given values as an `args` tuple plus an `argN` count into the
    /// coroutine's current scope so the next resumption sees them. The
    /// coroutine must be suspended.
    pub fn set_input_parameters(&mut self, params: Vec<Value>) -> EvalResult<()> {
        if self.state() != CoroutineState::Suspended {
            return Err(EvalError::runtime(
                "coroutine must be suspended for setting input parameters",
            ));
        }
        self.context.set_script_args(params)
    }
}

impl Default for CoroutineEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arithmetic::BinaryOp,
        ast::{DefKind, Node},
        compiler::{Compiler, OptLevel},
        loc::SourceLocation,
    };
    use std::rc::Rc;

    fn loc() -> SourceLocation {
        SourceLocation::default()
    }

    fn ptr(node: Node) -> Rc<Node> {
        Rc::new(node)
    }

    fn int(v: i64) -> Node {
        Node::constant(crate::value::Value::from(v), loc())
    }

    /// `def c := 0; repeat { yield c; c := c + 1 }`
    fn counting_coroutine() -> ProgramPtr {
        let mut def = Node::assign(false, loc());
        let mut d = Node::def_op(DefKind::Def, loc());
        d.add_child(ptr(Node::identifier("c", loc()))).unwrap();
        def.add_child(ptr(d)).unwrap();
        def.add_child(ptr(int(0))).unwrap();

        let mut yield_c = Node::yield_stmt(loc());
        yield_c.add_child(ptr(Node::identifier("c", loc()))).unwrap();

        let mut incr = Node::binary(BinaryOp::Plus, loc());
        incr.add_child(ptr(Node::identifier("c", loc()))).unwrap();
        incr.add_child(ptr(int(1))).unwrap();
        let mut assign = Node::assign(false, loc());
        assign.add_child(ptr(Node::identifier("c", loc()))).unwrap();
        assign.add_child(ptr(incr)).unwrap();

        let mut body = Node::block(loc());
        body.add_child(ptr(yield_c)).unwrap();
        body.add_child(ptr(assign)).unwrap();
        body.set_complete();
        let mut repeat = Node::repeat("", loc());
        repeat.add_child(ptr(body)).unwrap();

        let mut file = Node::file("counter", loc());
        file.add_child(ptr(def)).unwrap();
        file.add_child(ptr(repeat)).unwrap();
        Compiler::new().compile(&file, OptLevel::O0).unwrap()
    }

    #[test]
    fn yields_a_value_per_resume() {
        let mut engine = CoroutineEngine::with_program(counting_coroutine()).unwrap();
        for expected in 0..4i64 {
            let value = engine.run().unwrap();
            assert_eq!(value.get_i64().unwrap(), expected);
            assert_eq!(engine.state(), CoroutineState::Suspended);
        }
    }

    #[test]
    fn reset_restarts_from_the_beginning() {
        let mut engine = CoroutineEngine::with_program(counting_coroutine()).unwrap();
        assert_eq!(engine.run().unwrap().get_i64().unwrap(), 0);
        assert_eq!(engine.run().unwrap().get_i64().unwrap(), 1);
        engine.reset().unwrap();
        assert_eq!(engine.run().unwrap().get_i64().unwrap(), 0);
    }

    #[test]
    fn run_for_with_budget_suspends_mid_flight() {
        let mut engine = CoroutineEngine::with_program(counting_coroutine()).unwrap();
        // a tiny budget cannot even reach the first yield
        let value = engine.run_for(Constraints::max_instructions(2)).unwrap();
        assert_eq!(value.data_tag(), crate::types::TypeTag::NaV);
        assert_eq!(engine.state(), CoroutineState::Suspended);
        // a generous budget continues to the yield
        let value = engine.run_for(Constraints::max_instructions(1000)).unwrap();
        assert_eq!(value.get_i64().unwrap(), 0);
    }

    #[test]
    fn input_parameters_are_visible_to_the_next_resume() {
        // yield args[0] + argN
        let mut params = Node::param_list(loc());
        params.add_child(ptr(int(0))).unwrap();
        params.set_complete();
        let mut sub = Node::subscript(loc());
        sub.add_child(ptr(Node::identifier("args", loc()))).unwrap();
        sub.add_child(ptr(params)).unwrap();
        sub.set_complete();
        let mut add = Node::binary(BinaryOp::Plus, loc());
        add.add_child(ptr(sub)).unwrap();
        add.add_child(ptr(Node::identifier("argN", loc()))).unwrap();
        let mut y = Node::yield_stmt(loc());
        y.add_child(ptr(add)).unwrap();

        let mut file = Node::file("args_coro", loc());
        file.add_child(ptr(y)).unwrap();
        file.add_child(ptr(int(0))).unwrap();
        let program = Compiler::new().compile(&file, OptLevel::O0).unwrap();

        let mut engine = CoroutineEngine::with_program(program).unwrap();
        engine.set_input_parameters(vec![Value::from(41i64)]).unwrap();
        assert_eq!(engine.run().unwrap().get_i64().unwrap(), 42);
    }

    #[test]
    fn global_scope_stays_clean_across_coroutines() {
        let mut engine = CoroutineEngine::with_program(counting_coroutine()).unwrap();
        engine.run().unwrap();
        // `c` lives in the coroutine's local scope, not in the global one
        assert_eq!(engine.context.local_scope_count(), 1);
        engine.change_coroutine(counting_coroutine()).unwrap();
        assert_eq!(engine.context.local_scope_count(), 1);
        assert!(engine.context.find_value("c").is_err());
    }

    #[test]
    fn finished_coroutine_refuses_to_continue() {
        let mut file = Node::file("oneshot", loc());
        file.add_child(ptr(int(7))).unwrap();
        let program = Compiler::new().compile(&file, OptLevel::O0).unwrap();
        let mut engine = CoroutineEngine::with_program(program).unwrap();
        assert_eq!(engine.run().unwrap().get_i64().unwrap(), 7);
        assert!(engine.is_finished());
        assert!(engine.run().is_err());
    }
}
