use std::{fmt, rc::Rc};

use crate::{
    ast::NodePtr,
    context::Context,
    control::{EvalBreak, NodeResult},
    error::EvalError,
    loc::SourceLocation,
    machine::{Machine, ProgramPtr},
    value::Value,
};

/// Anything callable from script code: script-defined functions (AST-backed),
/// compiled subroutines (bytecode-backed) and host-provided callbacks.
pub trait Callable {
    /// Invokes the function. Arguments arrive fully evaluated, left to right.
    fn call(&self, ctx: &mut Context, args: Vec<Value>, loc: &SourceLocation) -> NodeResult;

    /// Number of declared parameters, when known.
    fn param_count(&self) -> Option<usize> {
        None
    }

    /// Human readable parameter list for diagnostics.
    fn parameter_info(&self) -> String {
        "(...)".to_string()
    }

    /// The bytecode form, when this function is a compiled subroutine. The VM
    /// dispatches those with a call-stack frame instead of a nested call.
    fn as_compiled(&self) -> Option<&CompiledFunc> {
        None
    }
}

impl fmt::Debug for dyn Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.parameter_info())
    }
}

/// Shared handle to a callable.
pub type FunctionPtr = Rc<dyn Callable>;

/// A function defined in script code, carrying its parameter-spec subtree and
/// body block for direct AST evaluation.
pub struct ScriptFunc {
    param_spec: NodePtr,
    body: NodePtr,
}

impl ScriptFunc {
    #[must_use]
    pub fn new(param_spec: NodePtr, body: NodePtr) -> Self {
        Self { param_spec, body }
    }
}

impl Callable for ScriptFunc {
    fn call(&self, ctx: &mut Context, args: Vec<Value>, loc: &SourceLocation) -> NodeResult {
        ctx.with_call_scope(args, |ctx| {
            // binds formals by consuming the parameter queue
            self.param_spec.eval(ctx)?;
            if ctx.current_param_count() > 0 {
                return Err(EvalError::eval_at("too many arguments for function call", loc.clone()).into());
            }
            match self.body.eval(ctx) {
                Err(EvalBreak::Return(result)) => Ok(result),
                other => other,
            }
        })
    }

    fn param_count(&self) -> Option<usize> {
        Some(self.param_spec.child_count())
    }

    fn parameter_info(&self) -> String {
        let names: Vec<String> = self
            .param_spec
            .children()
            .iter()
            .filter_map(|param| param.children().first().map(|id| id.detail().to_string()))
            .collect();
        format!("({})", names.join(", "))
    }
}

impl fmt::Debug for ScriptFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptFunc{}", self.parameter_info())
    }
}

/// A function whose body lives as a subroutine inside a compiled program.
/// Called outside the VM it spins up a fresh machine for the subroutine.
#[derive(Debug, Clone)]
pub struct CompiledFunc {
    program: ProgramPtr,
    start: usize,
}

impl CompiledFunc {
    #[must_use]
    pub fn new(program: ProgramPtr, start: usize) -> Self {
        Self { program, start }
    }

    #[must_use]
    pub fn program(&self) -> &ProgramPtr {
        &self.program
    }

    /// First instruction of the subroutine body.
    #[must_use]
    pub fn start_address(&self) -> usize {
        self.start
    }
}

impl Callable for CompiledFunc {
    fn call(&self, ctx: &mut Context, args: Vec<Value>, loc: &SourceLocation) -> NodeResult {
        let mut machine = Machine::new();
        machine.exec_subroutine(&self.program, self.start, ctx, args, loc)?;
        machine.throw_possible_error()?;
        if machine.is_suspended() {
            return Err(EvalError::suspend_statement(loc.clone()).into());
        }
        Ok(machine.take_result().unwrap_or_else(Value::nav))
    }

    fn as_compiled(&self) -> Option<&CompiledFunc> {
        Some(self)
    }
}

/// A host callback registered with the context: reads its arguments and
/// produces a value.
pub struct LibraryFunc {
    name: String,
    func: Box<dyn Fn(&mut Context, Vec<Value>, &SourceLocation) -> NodeResult>,
}

impl LibraryFunc {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&mut Context, Vec<Value>, &SourceLocation) -> NodeResult + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Callable for LibraryFunc {
    fn call(&self, ctx: &mut Context, args: Vec<Value>, loc: &SourceLocation) -> NodeResult {
        (self.func)(ctx, args, loc)
    }

    fn parameter_info(&self) -> String {
        format!("<host {}>", self.name)
    }
}

impl fmt::Debug for LibraryFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LibraryFunc({})", self.name)
    }
}
