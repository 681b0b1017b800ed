//! The embedding surface: context bootstrap with a load configuration,
//! host-function registration, variable injection, compilation and program
//! execution.

use std::rc::Rc;

use bitflags::bitflags;

use crate::{
    ast::Node,
    compiler::{Compiler, OptLevel},
    context::Context,
    control::NodeResult,
    error::{EvalError, EvalResult},
    func::{Callable, LibraryFunc},
    loc::SourceLocation,
    machine::{Constraints, Machine, ProgramPtr},
    parse::Parser,
    value::Value,
};

/// How much of the hosting library's surface gets bootstrapped into a fresh
/// context. Levels are not combinable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadLevel {
    /// Only types and version variables.
    Minimal,
    /// A reduced core without the full string/tuple utilities.
    CoreReduced,
    /// Full core: the language and its built-in types are fully usable.
    Core,
    /// Core plus utilities (clock, random, math helpers, ...).
    Util,
    /// Everything.
    Full,
}

bitflags! {
    /// Feature opt-outs applied on top of the load level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureOptOut: u32 {
        const NO_STDIN       = 0x0000_0100;
        const NO_STDERR      = 0x0000_0200;
        const NO_STDOUT      = 0x0000_0400;
        const NO_FILE_READ   = 0x0000_0800;
        const NO_FILE_WRITE  = 0x0000_1000;
        const NO_FILE_DELETE = 0x0000_2000;
        const NO_EVAL        = 0x0000_4000;
    }
}

impl FeatureOptOut {
    /// All stdio channels disabled.
    #[must_use]
    pub fn no_stdio() -> Self {
        Self::NO_STDIN | Self::NO_STDOUT | Self::NO_STDERR
    }

    /// All file access disabled.
    #[must_use]
    pub fn no_fileio() -> Self {
        Self::NO_FILE_READ | Self::NO_FILE_WRITE | Self::NO_FILE_DELETE
    }
}

/// The bootstrap configuration: a load level plus feature opt-outs.
#[derive(Debug, Clone, Copy)]
pub struct LoadConfig {
    pub level: LoadLevel,
    pub opt_out: FeatureOptOut,
}

impl LoadConfig {
    #[must_use]
    pub fn new(level: LoadLevel) -> Self {
        Self {
            level,
            opt_out: FeatureOptOut::empty(),
        }
    }

    #[must_use]
    pub fn with_opt_out(mut self, opt_out: FeatureOptOut) -> Self {
        self.opt_out |= opt_out;
        self
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self::new(LoadLevel::Full)
    }
}

/// The host-facing engine: owns a context and a machine, compiles ASTs and
/// executes programs. The actual library of built-in functions is provided
/// by the embedding host; the engine only wires the registration surface.
#[derive(Debug)]
pub struct Engine {
    context: Context,
    machine: Machine,
    config: LoadConfig,
    opt_level: OptLevel,
}

impl Engine {
    /// An engine bootstrapped with the full default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LoadConfig::default())
    }

    /// An engine bootstrapped with the given configuration.
    #[must_use]
    pub fn with_config(config: LoadConfig) -> Self {
        let mut engine = Self {
            context: Context::new(),
            machine: Machine::new(),
            config,
            opt_level: OptLevel::O0,
        };
        engine.bootstrap();
        engine
    }

    /// Version variables every level provides; the hosting library hooks its
    /// function registration in here per level and opt-outs.
    fn bootstrap(&mut self) {
        let version = crate::machine::combined_version();
        let _ = self
            .context
            .add_value("_version", Value::from(u64::from(version)).shared().into_const());
        let _ = self.context.add_value(
            "_core_level",
            Value::from(self.config.level as i64).shared().into_const(),
        );
    }

    #[must_use]
    pub fn config(&self) -> LoadConfig {
        self.config
    }

    /// Whether a feature survived the bootstrap opt-outs; hosts consult this
    /// when registering their file/stdio functions.
    #[must_use]
    pub fn is_feature_enabled(&self, feature: FeatureOptOut) -> bool {
        !self.config.opt_out.contains(feature)
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Default optimization level used by [`Engine::compile`].
    pub fn set_opt_level(&mut self, opt_level: OptLevel) {
        self.opt_level = opt_level;
    }

    // --- host surface -------------------------------------------------------

    /// Registers a host callback under a name in the current scope.
    pub fn register_host_function(
        &mut self,
        name: &str,
        func: impl Fn(&mut Context, Vec<Value>, &SourceLocation) -> NodeResult + 'static,
    ) -> EvalResult<()> {
        let callable: Rc<dyn Callable> = Rc::new(LibraryFunc::new(name, func));
        self.context
            .add_value(name, Value::function(callable).shared())
            .map(|_| ())
    }

    /// Adds a mutable variable holding a copy of `value`.
    pub fn add_var(&mut self, name: &str, mut value: Value) -> EvalResult<()> {
        value.detach(false);
        value.make_shared();
        self.context.add_value(name, value).map(|_| ())
    }

    /// Adds a variable sharing `value`: later mutation through either side is
    /// observed by both.
    pub fn add_shared_var(&mut self, name: &str, mut value: Value) -> EvalResult<()> {
        value.make_shared();
        self.context.add_value(name, value).map(|_| ())
    }

    /// Adds a const variable.
    pub fn add_const_var(&mut self, name: &str, mut value: Value) -> EvalResult<()> {
        value.make_shared();
        value.make_const();
        self.context.add_value(name, value).map(|_| ())
    }

    /// Injects `args`/`argN` script arguments into the current scope.
    pub fn set_script_args(&mut self, values: Vec<Value>) -> EvalResult<()> {
        self.context.set_script_args(values)
    }

    // --- parse / compile / execute -----------------------------------------

    /// Parses source text with the given parser implementation.
    pub fn parse_with(&mut self, parser: &mut dyn Parser, content: &str, name: &str) -> EvalResult<Node> {
        parser.parse(content, name)
    }

    /// Compiles an AST at the engine's default optimization level.
    pub fn compile(&self, root: &Node) -> EvalResult<ProgramPtr> {
        Compiler::new().compile(root, self.opt_level)
    }

    /// Compiles an AST at a chosen optimization level.
    pub fn compile_at(&self, root: &Node, opt_level: OptLevel) -> EvalResult<ProgramPtr> {
        Compiler::new().compile(root, opt_level)
    }

    /// Executes a compiled program against the engine's context and returns
    /// the result value. A program stopped by constraints or a suspend
    /// statement is reported as an error here; use a [`crate::coroutine::CoroutineEngine`]
    /// for resumable execution.
    pub fn exec_program(&mut self, program: &ProgramPtr, constraints: Constraints) -> EvalResult<Value> {
        self.machine.reset()?;
        self.machine.exec(program, &mut self.context, constraints)?;
        self.machine.throw_possible_error()?;
        if self.machine.is_suspended() {
            return Err(EvalError::runtime(
                "program suspended; use a coroutine engine for resumable execution",
            ));
        }
        Ok(self.machine.take_result().unwrap_or_else(Value::nav))
    }

    /// Evaluates an AST directly (AST-eval mode), without compilation.
    pub fn eval_ast(&mut self, root: &Node) -> EvalResult<Value> {
        match root.eval(&mut self.context) {
            Ok(value) => Ok(value),
            Err(signal) => Err(signal.into_error()),
        }
    }

    /// Compiles and runs an AST in one step.
    pub fn compile_and_run(&mut self, root: &Node, constraints: Constraints) -> EvalResult<Value> {
        let program = self.compile(root)?;
        self.exec_program(&program, constraints)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
