use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::{
    error::{EvalError, EvalResult},
    loc::SourceLocation,
    tuple::Tuple,
    types::TypeSystem,
    value::Value,
};

/// Language-behavior toggles carried by the context.
#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    /// `x := 1` on an unknown `x` silently defines it instead of failing.
    pub auto_define_unknown_identifiers: bool,
    /// `def x` without assignment is allowed (binds a NaV).
    pub declare_identifiers_without_assign_allowed: bool,
    /// `undef x` on an unknown `x` yields `false` instead of failing.
    pub undefine_unknown_identifiers_allowed: bool,
    /// Value-copied parameters bind const unless spelled otherwise.
    pub parameters_are_default_const: bool,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            auto_define_unknown_identifiers: false,
            declare_identifiers_without_assign_allowed: false,
            undefine_unknown_identifiers_allowed: false,
            parameters_are_default_const: true,
        }
    }
}

/// One scope: a name to value mapping in insertion order.
type Scope = IndexMap<String, Value>;

/// The scope-stack symbol table.
///
/// A root/global scope is always present; block, condition, loop and call
/// sites push and pop local scopes. Lookup resolves innermost-first. The
/// context additionally owns the current-call parameter queue stack and the
/// dialect toggles.
#[derive(Debug)]
pub struct Context {
    scopes: Vec<Scope>,
    param_queues: Vec<VecDeque<Value>>,
    pub dialect: Dialect,
    type_system: TypeSystem,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new()],
            param_queues: Vec::new(),
            dialect: Dialect::default(),
            type_system: TypeSystem::new(),
        }
    }

    #[must_use]
    pub fn type_system(&self) -> &TypeSystem {
        &self.type_system
    }

    pub fn type_system_mut(&mut self) -> &mut TypeSystem {
        &mut self.type_system
    }

    // --- scopes -------------------------------------------------------------

    pub fn enter_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    /// Pops the innermost local scope. The global scope is never popped.
    pub fn exit_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Number of local scopes (excluding the global one).
    #[must_use]
    pub fn local_scope_count(&self) -> usize {
        self.scopes.len() - 1
    }

    /// Pops local scopes until only the global one remains.
    pub fn exit_all_local_scopes(&mut self) {
        self.scopes.truncate(1);
    }

    // --- bindings -----------------------------------------------------------

    /// Adds a binding to the innermost scope. The value should already be in
    /// shared state so later lookups observe mutation. Fails on redefinition
    /// within the same scope.
    pub fn add_value(&mut self, name: &str, value: Value) -> EvalResult<Value> {
        let scope = self.scopes.last_mut().expect("global scope always present");
        if scope.contains_key(name) {
            return Err(EvalError::redefinition(name));
        }
        scope.insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Looks a name up, innermost-first.
    pub fn find_value(&self, name: &str) -> EvalResult<Value> {
        self.find_value_with_distance(name).map(|(v, _)| v)
    }

    /// Looks a name up and also reports the distance to the defining scope:
    /// 1 for the innermost scope, growing outwards.
    pub fn find_value_with_distance(&self, name: &str) -> EvalResult<(Value, i64)> {
        for (dist, scope) in self.scopes.iter().rev().enumerate() {
            if let Some(value) = scope.get(name) {
                return Ok((value.clone(), dist as i64 + 1));
            }
        }
        Err(EvalError::unknown_identifier(name))
    }

    /// Whether a name resolves; yields the scope distance when it does.
    #[must_use]
    pub fn is_defined(&self, name: &str) -> Option<i64> {
        self.find_value_with_distance(name).ok().map(|(_, d)| d)
    }

    /// Assigns to an existing binding, innermost-first. `shared` selects the
    /// share-assign semantics (`@=`) over the value-copy (`:=`).
    pub fn set_value(&mut self, name: &str, value: &Value, shared: bool) -> EvalResult<Value> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                if shared {
                    slot.shared_assign_value(value)?;
                } else {
                    slot.assign_value(value)?;
                }
                return Ok(slot.clone());
            }
        }
        Err(EvalError::unknown_identifier(name))
    }

    /// Removes a binding, innermost-first. Const bindings refuse.
    pub fn remove_value(&mut self, name: &str) -> EvalResult<Value> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get(name) {
                if slot.is_const() {
                    return Err(EvalError::eval("variable is const, const variables cannot be undefined"));
                }
                // shift_remove keeps the insertion order of the remaining names
                let removed = scope.shift_remove(name);
                return removed.ok_or_else(|| EvalError::unknown_identifier(name));
            }
        }
        Err(EvalError::unknown_identifier(name))
    }

    // --- parameter queue ----------------------------------------------------

    /// Establishes a fresh parameter queue for a call. Always paired with
    /// [`Context::drop_params`].
    pub fn push_params(&mut self, params: Vec<Value>) {
        self.param_queues.push(params.into());
    }

    /// Tears the innermost parameter queue down, returning how many values
    /// were left unconsumed.
    pub fn drop_params(&mut self) -> usize {
        self.param_queues.pop().map_or(0, |q| q.len())
    }

    #[must_use]
    pub fn current_param_count(&self) -> usize {
        self.param_queues.last().map_or(0, VecDeque::len)
    }

    /// Consumes the next value from the current parameter queue, front first.
    pub fn consume_param(&mut self) -> Option<Value> {
        self.param_queues.last_mut().and_then(VecDeque::pop_front)
    }

    // --- host conveniences --------------------------------------------------

    /// Injects `args` (a tuple of the given values) and `argN` (their count)
    /// into the innermost scope, replacing earlier injections in that scope.
    pub fn set_script_args(&mut self, values: Vec<Value>) -> EvalResult<()> {
        let scope = self.scopes.last_mut().expect("global scope always present");
        scope.shift_remove("args");
        scope.shift_remove("argN");
        let count = values.len();
        let mut tuple = Tuple::new();
        tuple.reserve(count);
        for mut value in values {
            value.make_shared();
            tuple.append(value);
        }
        self.add_value("args", Value::from(tuple).shared())?;
        self.add_value("argN", Value::from(count as i64).shared())?;
        Ok(())
    }

    /// Runs `f` inside a fresh scope with the given call parameters; scope
    /// and queue are torn down on every path.
    pub fn with_call_scope<R>(
        &mut self,
        params: Vec<Value>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.enter_scope();
        self.push_params(params);
        let result = f(self);
        self.param_queues.pop();
        self.exit_scope();
        result
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A located add, used where the caller has a source location at hand.
impl Context {
    pub fn add_value_at(&mut self, name: &str, value: Value, loc: &SourceLocation) -> EvalResult<Value> {
        self.add_value(name, value).map_err(|e| e.with_location(loc))
    }
}
