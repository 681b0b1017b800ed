//! The AST: a tree of tagged nodes, each carrying a source location and
//! per-kind completion rules. Every node evaluates directly against a
//! [`Context`] (AST-eval mode); the compiler lowers the same tree to
//! instructions. Both paths share the operation helpers in
//! [`crate::arithmetic`] so they stay observationally identical.

mod builder;

pub use builder::TreeBuilder;

use std::rc::Rc;

use crate::{
    arithmetic::{self, BinaryOp, BitOp, UnaryOp},
    context::Context,
    control::{EvalBreak, NodeResult},
    error::{ErrorKind, EvalError, EvalResult},
    func::{FunctionPtr, ScriptFunc},
    loc::SourceLocation,
    machine::Instruction,
    sequence::IntegerSequence,
    tuple::Tuple,
    types::TypeTag,
    value::{Value, ValueData},
};

/// Shared handle to a finished node. Trees are built through owned `Node`s
/// (see [`TreeBuilder`]) and wrapped on attachment.
pub type NodePtr = Rc<Node>;

/// Evaluation mode of an expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprMode {
    /// One child yields its value, several children compose a tuple.
    ExprOrTuple,
    /// Every child is evaluated in order, the last value is returned.
    Cond,
}

/// The three assignment modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignMode {
    /// Plain assignment to an existing binding or element.
    Assign,
    /// `def` declaring a new mutable binding.
    DefAssign,
    /// `const` declaring a new const binding.
    ConstAssign,
}

/// The define/undefine query family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefKind {
    Def,
    Undef,
    IsDef,
    Const,
    Debug,
}

/// Kind and per-kind payload of one AST node.
#[derive(Debug)]
pub enum NodeKind {
    Constant(Value),
    Identifier(String),
    Expression { mode: ExprMode, complete: bool },
    ParamList { complete: bool },
    ParamSpec { complete: bool },
    Unary(UnaryOp),
    Binary(BinaryOp),
    Bit(BitOp),
    Assign { shared: bool, mode: AssignMode },
    Dot,
    Subscript { complete: bool },
    IsType,
    AsType,
    If,
    Else,
    Block { complete: bool },
    Repeat { label: String },
    Forall { label: String },
    Loop { label: String },
    Stop { label: String, needs_expr: bool },
    Return { needs_expr: bool },
    Exit { needs_expr: bool },
    Yield,
    Suspend,
    Func { complete: bool },
    CallFunc { complete: bool },
    FromParam,
    FromParamOr,
    NoOp,
    DefOp(DefKind),
    /// A pre-built VM instruction, passed through by the compiler verbatim.
    /// Allows assembling programs without source text.
    RawInstr(Instruction),
    File { name: String },
}

/// One AST node: kind, children and source location.
#[derive(Debug)]
pub struct Node {
    kind: NodeKind,
    children: Vec<NodePtr>,
    loc: SourceLocation,
}

impl Node {
    #[must_use]
    pub fn new(kind: NodeKind, loc: SourceLocation) -> Self {
        Self {
            kind,
            children: Vec::new(),
            loc,
        }
    }

    // --- convenience constructors ------------------------------------------

    #[must_use]
    pub fn constant(value: Value, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Constant(value), loc)
    }

    #[must_use]
    pub fn identifier(name: impl Into<String>, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Identifier(name.into()), loc)
    }

    #[must_use]
    pub fn expression(mode: ExprMode, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Expression { mode, complete: false }, loc)
    }

    #[must_use]
    pub fn param_list(loc: SourceLocation) -> Self {
        Self::new(NodeKind::ParamList { complete: false }, loc)
    }

    #[must_use]
    pub fn param_spec(loc: SourceLocation) -> Self {
        Self::new(NodeKind::ParamSpec { complete: false }, loc)
    }

    #[must_use]
    pub fn unary(op: UnaryOp, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Unary(op), loc)
    }

    #[must_use]
    pub fn binary(op: BinaryOp, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Binary(op), loc)
    }

    #[must_use]
    pub fn bit(op: BitOp, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Bit(op), loc)
    }

    #[must_use]
    pub fn assign(shared: bool, loc: SourceLocation) -> Self {
        Self::new(
            NodeKind::Assign {
                shared,
                mode: AssignMode::Assign,
            },
            loc,
        )
    }

    #[must_use]
    pub fn dot(loc: SourceLocation) -> Self {
        Self::new(NodeKind::Dot, loc)
    }

    #[must_use]
    pub fn subscript(loc: SourceLocation) -> Self {
        Self::new(NodeKind::Subscript { complete: false }, loc)
    }

    #[must_use]
    pub fn if_stmt(loc: SourceLocation) -> Self {
        Self::new(NodeKind::If, loc)
    }

    #[must_use]
    pub fn else_stmt(loc: SourceLocation) -> Self {
        Self::new(NodeKind::Else, loc)
    }

    #[must_use]
    pub fn block(loc: SourceLocation) -> Self {
        Self::new(NodeKind::Block { complete: false }, loc)
    }

    #[must_use]
    pub fn repeat(label: impl Into<String>, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Repeat { label: label.into() }, loc)
    }

    #[must_use]
    pub fn forall(label: impl Into<String>, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Forall { label: label.into() }, loc)
    }

    #[must_use]
    pub fn loop_stmt(label: impl Into<String>, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Loop { label: label.into() }, loc)
    }

    #[must_use]
    pub fn stop(label: impl Into<String>, needs_expr: bool, loc: SourceLocation) -> Self {
        Self::new(
            NodeKind::Stop {
                label: label.into(),
                needs_expr,
            },
            loc,
        )
    }

    #[must_use]
    pub fn return_stmt(needs_expr: bool, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Return { needs_expr }, loc)
    }

    #[must_use]
    pub fn exit_stmt(needs_expr: bool, loc: SourceLocation) -> Self {
        Self::new(NodeKind::Exit { needs_expr }, loc)
    }

    #[must_use]
    pub fn yield_stmt(loc: SourceLocation) -> Self {
        Self::new(NodeKind::Yield, loc)
    }

    #[must_use]
    pub fn suspend_stmt(loc: SourceLocation) -> Self {
        Self::new(NodeKind::Suspend, loc)
    }

    #[must_use]
    pub fn func(loc: SourceLocation) -> Self {
        Self::new(NodeKind::Func { complete: false }, loc)
    }

    #[must_use]
    pub fn call_func(loc: SourceLocation) -> Self {
        Self::new(NodeKind::CallFunc { complete: false }, loc)
    }

    #[must_use]
    pub fn from_param(loc: SourceLocation) -> Self {
        Self::new(NodeKind::FromParam, loc)
    }

    #[must_use]
    pub fn from_param_or(loc: SourceLocation) -> Self {
        Self::new(NodeKind::FromParamOr, loc)
    }

    #[must_use]
    pub fn no_op(loc: SourceLocation) -> Self {
        Self::new(NodeKind::NoOp, loc)
    }

    #[must_use]
    pub fn def_op(kind: DefKind, loc: SourceLocation) -> Self {
        Self::new(NodeKind::DefOp(kind), loc)
    }

    #[must_use]
    pub fn file(name: impl Into<String>, loc: SourceLocation) -> Self {
        Self::new(NodeKind::File { name: name.into() }, loc)
    }

    // --- introspection ------------------------------------------------------

    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The kind name used in diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Constant(_) => "Constant",
            NodeKind::Identifier(_) => "Identifier",
            NodeKind::Expression { .. } => "Expression",
            NodeKind::ParamList { .. } => "ParamList",
            NodeKind::ParamSpec { .. } => "ParamSpec",
            NodeKind::Unary(_) => "UnOp",
            NodeKind::Binary(_) | NodeKind::Bit(_) => "BinOp",
            NodeKind::Assign { .. } => "Assign",
            NodeKind::Dot => "DotOp",
            NodeKind::Subscript { .. } => "Subscript",
            NodeKind::IsType => "IsType",
            NodeKind::AsType => "AsType",
            NodeKind::If => "If",
            NodeKind::Else => "Else",
            NodeKind::Block { .. } => "Block",
            NodeKind::Repeat { .. } => "Repeat",
            NodeKind::Forall { .. } => "Forall",
            NodeKind::Loop { .. } => "Loop",
            NodeKind::Stop { .. } => "Stop",
            NodeKind::Return { .. } => "Return",
            NodeKind::Exit { .. } => "Exit",
            NodeKind::Yield => "Yield",
            NodeKind::Suspend => "Suspend",
            NodeKind::Func { .. } => "Func",
            NodeKind::CallFunc { .. } => "CallFunc",
            NodeKind::FromParam => "FromParam",
            NodeKind::FromParamOr => "FromParamOr",
            NodeKind::NoOp => "NoOp",
            NodeKind::DefOp(_) => "DefOp",
            NodeKind::RawInstr(_) => "RawInstr",
            NodeKind::File { .. } => "File",
        }
    }

    /// The detail string: operator symbol, identifier name or label.
    #[must_use]
    pub fn detail(&self) -> String {
        match &self.kind {
            NodeKind::Constant(v) => v.print_value(),
            NodeKind::Identifier(name) => name.clone(),
            NodeKind::Unary(op) => op.to_string(),
            NodeKind::Binary(op) => op.to_string(),
            NodeKind::Bit(op) => op.to_string(),
            NodeKind::Assign { shared, .. } => if *shared { "@=" } else { ":=" }.to_string(),
            NodeKind::Dot => ".".to_string(),
            NodeKind::Repeat { label }
            | NodeKind::Forall { label }
            | NodeKind::Loop { label }
            | NodeKind::Stop { label, .. } => label.clone(),
            NodeKind::File { name } => name.clone(),
            _ => String::new(),
        }
    }

    #[must_use]
    pub fn loc(&self) -> &SourceLocation {
        &self.loc
    }

    #[must_use]
    pub fn children(&self) -> &[NodePtr] {
        &self.children
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Operator precedence following the C++ table. Value-like nodes are 0 so
    /// they become operands of any operator; statement nodes are `i32::MAX`
    /// so trailing expressions re-attach through the rebuilding pass.
    #[must_use]
    pub fn precedence(&self) -> i32 {
        match &self.kind {
            NodeKind::Dot | NodeKind::Subscript { .. } => 1,
            NodeKind::DefOp(_) => 2,
            NodeKind::Unary(_) => 3,
            NodeKind::Binary(op) => op.precedence(),
            NodeKind::Bit(op) => op.precedence(),
            NodeKind::Assign { .. } => 16,
            NodeKind::IsType | NodeKind::AsType => 4,
            NodeKind::Stop { .. } | NodeKind::Return { .. } | NodeKind::Exit { .. } | NodeKind::Yield => i32::MAX,
            _ => 0,
        }
    }

    /// Whether this node still waits for its left-hand side.
    #[must_use]
    pub fn needs_lhs(&self) -> bool {
        match &self.kind {
            NodeKind::Binary(_)
            | NodeKind::Bit(_)
            | NodeKind::Assign { .. }
            | NodeKind::Dot
            | NodeKind::Subscript { .. }
            | NodeKind::IsType
            | NodeKind::AsType => self.children.is_empty(),
            _ => false,
        }
    }

    /// Per-kind completion predicate; incomplete nodes reject evaluation and
    /// compilation.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match &self.kind {
            NodeKind::Constant(_)
            | NodeKind::Identifier(_)
            | NodeKind::Loop { .. }
            | NodeKind::Suspend
            | NodeKind::FromParam
            | NodeKind::NoOp
            | NodeKind::RawInstr(_)
            | NodeKind::File { .. } => true,
            NodeKind::Expression { complete, .. }
            | NodeKind::ParamList { complete }
            | NodeKind::ParamSpec { complete }
            | NodeKind::Subscript { complete }
            | NodeKind::Block { complete }
            | NodeKind::Func { complete }
            | NodeKind::CallFunc { complete } => *complete,
            NodeKind::Unary(_) | NodeKind::DefOp(_) | NodeKind::FromParamOr | NodeKind::Yield => {
                !self.children.is_empty()
            }
            NodeKind::Binary(_)
            | NodeKind::Bit(_)
            | NodeKind::Assign { .. }
            | NodeKind::Dot
            | NodeKind::IsType
            | NodeKind::AsType => self.children.len() > 1,
            NodeKind::If => self.children.len() >= 2,
            NodeKind::Else | NodeKind::Repeat { .. } => !self.children.is_empty(),
            NodeKind::Forall { .. } => self.children.len() > 2,
            NodeKind::Stop { needs_expr, .. }
            | NodeKind::Return { needs_expr }
            | NodeKind::Exit { needs_expr } => !needs_expr || !self.children.is_empty(),
        }
    }

    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        !self.is_complete()
    }

    /// Marks an explicitly-closed node (expressions, blocks, calls) complete.
    pub fn set_complete(&mut self) {
        match &mut self.kind {
            NodeKind::Expression { complete, .. }
            | NodeKind::ParamList { complete }
            | NodeKind::ParamSpec { complete }
            | NodeKind::Subscript { complete }
            | NodeKind::Block { complete }
            | NodeKind::Func { complete }
            | NodeKind::CallFunc { complete } => *complete = true,
            _ => {}
        }
    }

    /// Adds a child, enforcing the node-specific completion rules.
    pub fn add_child(&mut self, mut node: NodePtr) -> EvalResult<()> {
        if self.is_complete() && !matches!(self.kind, NodeKind::If | NodeKind::File { .. }) {
            return Err(EvalError::eval_at(
                format!("{} node is complete, cannot add another child", self.kind_name()),
                self.loc.clone(),
            ));
        }
        match &mut self.kind {
            NodeKind::Assign { mode, .. } => {
                // `def x := ...` / `const x := ...` arrive as a def-op wrapping
                // the identifier; the assign node absorbs the mode.
                if self.children.is_empty() {
                    if let NodeKind::DefOp(kind) = node.kind() {
                        match kind {
                            DefKind::Def => *mode = AssignMode::DefAssign,
                            DefKind::Const => *mode = AssignMode::ConstAssign,
                            _ => {
                                return Err(EvalError::eval_at(
                                    "unsupported define mode for assignment",
                                    self.loc.clone(),
                                ));
                            }
                        }
                        let inner = Rc::try_unwrap(node)
                            .map_err(|_| EvalError::runtime("def operand is shared during tree building"))?
                            .pop_child()?;
                        node = inner;
                    }
                }
                self.children.push(node);
            }
            NodeKind::Forall { .. } => {
                match self.children.len() {
                    0 => {
                        if !matches!(node.kind(), NodeKind::Identifier(_)) {
                            return Err(EvalError::eval_at(
                                "forall needs an identifier as first child",
                                self.loc.clone(),
                            ));
                        }
                    }
                    2 => {
                        if !matches!(node.kind(), NodeKind::Block { .. }) {
                            return Err(EvalError::eval_at(
                                "forall needs a block as last child",
                                self.loc.clone(),
                            ));
                        }
                    }
                    _ => {}
                }
                self.children.push(node);
            }
            NodeKind::DefOp(_) => {
                if !matches!(node.kind(), NodeKind::Identifier(_) | NodeKind::Dot) {
                    return Err(EvalError::eval_at(
                        "variable definition/undefinition requires an identifier name",
                        self.loc.clone(),
                    ));
                }
                self.children.push(node);
            }
            NodeKind::If => {
                if self.children.len() >= 3 {
                    return Err(EvalError::eval_at("if node is complete", self.loc.clone()));
                }
                if self.children.len() == 2 && !matches!(node.kind(), NodeKind::Else) {
                    return Err(EvalError::eval_at(
                        "only an else branch can follow a complete if",
                        self.loc.clone(),
                    ));
                }
                self.children.push(node);
            }
            NodeKind::File { .. } => self.children.push(node),
            _ => self.children.push(node),
        }
        Ok(())
    }

    /// Detaches and returns the most recently added child.
    pub fn pop_child(&mut self) -> EvalResult<NodePtr> {
        self.children
            .pop()
            .ok_or_else(|| EvalError::eval_at("no child available to detach", self.loc.clone()))
    }

    /// Precondition for evaluate/compile: the node and the parts it needs are
    /// structurally complete.
    pub fn check(&self) -> EvalResult<()> {
        if self.is_incomplete() {
            return Err(EvalError::eval_at(
                format!("{} node is incomplete", self.kind_name()),
                self.loc.clone(),
            ));
        }
        match &self.kind {
            NodeKind::Expression { .. } => {
                if self.children.is_empty() {
                    return Err(EvalError::eval_at("no inner expression node to evaluate", self.loc.clone()));
                }
            }
            NodeKind::Assign { mode, .. } => {
                let lhs = &self.children[0];
                let lhs_ok = matches!(lhs.kind(), NodeKind::Identifier(_) | NodeKind::Dot)
                    || (matches!(lhs.kind(), NodeKind::Subscript { .. }) && *mode == AssignMode::Assign);
                if !lhs_ok {
                    return Err(EvalError::eval_at(
                        "assignment target must be an identifier, element or subscript",
                        lhs.loc().clone(),
                    ));
                }
            }
            NodeKind::Subscript { .. } => {
                if self.children.len() < 2 {
                    return Err(EvalError::eval_at(
                        "subscript needs an operand and an index",
                        self.loc.clone(),
                    ));
                }
            }
            NodeKind::Func { .. } => {
                let named = matches!(self.children.first().map(|c| c.kind()), Some(NodeKind::Identifier(_)));
                let needed = if named { 3 } else { 2 };
                if self.children.len() < needed {
                    return Err(EvalError::eval_at(
                        "function definition misses its parameter spec or body",
                        self.loc.clone(),
                    ));
                }
            }
            NodeKind::CallFunc { .. } => {
                if self.children.len() < 2 {
                    return Err(EvalError::eval_at(
                        "function call misses its callee or parameter list",
                        self.loc.clone(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    // --- evaluation ---------------------------------------------------------

    /// Direct evaluation against a context (AST-eval mode).
    pub fn eval(&self, ctx: &mut Context) -> NodeResult {
        self.check()?;
        match &self.kind {
            NodeKind::Constant(value) => Ok(value.clone()),
            NodeKind::Identifier(name) => Ok(ctx.find_value(name).map_err(|e| e.with_location(&self.loc))?),
            NodeKind::Expression { mode, .. } => self.eval_expression(*mode, ctx),
            NodeKind::ParamList { .. } => Err(EvalError::eval_at(
                "a parameter list is consumed by its call, it has no value of its own",
                self.loc.clone(),
            )
            .into()),
            NodeKind::ParamSpec { .. } => self.eval_expression(ExprMode::Cond, ctx),
            NodeKind::Unary(op) => {
                let operand = self.children[0].eval(ctx)?;
                Ok(arithmetic::static_exec_unary(*op, &operand).map_err(|e| e.with_location(&self.loc))?)
            }
            NodeKind::Binary(op) => self.eval_binary(*op, ctx),
            NodeKind::Bit(op) => {
                let lhs = self.children[0].eval(ctx)?;
                let rhs = self.children[1].eval(ctx)?;
                Ok(arithmetic::static_exec_bit(*op, &lhs, &rhs).map_err(|e| e.with_location(&self.loc))?)
            }
            NodeKind::IsType => {
                let lhs = self.children[0].eval(ctx)?;
                let rhs = self.children[1].eval(ctx)?;
                Ok(arithmetic::static_exec_is_type(&lhs, &rhs).map_err(|e| e.with_location(&self.loc))?)
            }
            NodeKind::AsType => {
                let lhs = self.children[0].eval(ctx)?;
                let rhs = self.children[1].eval(ctx)?;
                Ok(arithmetic::static_exec_as_type(&lhs, &rhs).map_err(|e| e.with_location(&self.loc))?)
            }
            NodeKind::Assign { shared, mode } => self.eval_assign(*shared, *mode, ctx),
            NodeKind::Dot => self.dot_get(ctx),
            NodeKind::Subscript { .. } => self.subscript_get(ctx),
            NodeKind::If => with_scope(ctx, |ctx| {
                let cond = self.children[0]
                    .eval(ctx)?
                    .get_as_bool()
                    .map_err(|e| e.with_location(&self.loc))?;
                if cond {
                    self.children[1].eval(ctx)
                } else if let Some(else_branch) = self.children.get(2) {
                    else_branch.eval(ctx)
                } else {
                    Ok(Value::nav())
                }
            }),
            NodeKind::Else => self.children[0].eval(ctx),
            NodeKind::Block { .. } => with_scope(ctx, |ctx| {
                let mut result = Value::nav();
                for child in &self.children {
                    result = child.eval(ctx)?;
                }
                Ok(result)
            }),
            NodeKind::Repeat { label } => self.eval_repeat(label, ctx),
            NodeKind::Forall { label } => self.eval_forall(label, ctx),
            NodeKind::Loop { label } => Err(EvalBreak::LoopToHead { label: label.clone() }),
            NodeKind::Stop { label, .. } => {
                let result = match self.children.first() {
                    Some(child) => child.eval(ctx)?,
                    None => Value::nav(),
                };
                Err(EvalBreak::StopLoop {
                    label: label.clone(),
                    result,
                })
            }
            NodeKind::Return { .. } => {
                let result = match self.children.first() {
                    Some(child) => child.eval(ctx)?,
                    None => Value::nav(),
                };
                Err(EvalBreak::Return(result))
            }
            NodeKind::Exit { .. } => {
                let result = match self.children.first() {
                    Some(child) => child.eval(ctx)?,
                    None => Value::nav(),
                };
                Err(EvalBreak::Exit(result))
            }
            NodeKind::Yield | NodeKind::Suspend => Err(EvalError::suspend_statement(self.loc.clone()).into()),
            NodeKind::Func { .. } => self.eval_func_def(ctx),
            NodeKind::CallFunc { .. } => self.eval_call(ctx),
            NodeKind::FromParam => ctx.consume_param().ok_or_else(|| {
                EvalBreak::from(EvalError::eval_at("too few arguments for function call", self.loc.clone()))
            }),
            NodeKind::FromParamOr => match ctx.consume_param() {
                Some(value) => Ok(value),
                None => self.children[0].eval(ctx),
            },
            NodeKind::NoOp => Ok(Value::nav()),
            NodeKind::DefOp(kind) => self.eval_def_op(*kind, ctx),
            NodeKind::RawInstr(_) => Err(EvalError::eval_at(
                "assembly nodes are only supported for compiled programs",
                self.loc.clone(),
            )
            .into()),
            NodeKind::File { .. } => self.eval_file(ctx),
        }
    }

    /// Evaluates a whole file: statements in sequence, `_Exit` and a
    /// top-level `return` are normal terminations carrying the result.
    fn eval_file(&self, ctx: &mut Context) -> NodeResult {
        let mut result = Value::nav();
        for child in &self.children {
            match child.eval(ctx) {
                Ok(value) => result = value,
                Err(EvalBreak::Exit(value) | EvalBreak::Return(value)) => {
                    ctx.exit_all_local_scopes();
                    return Ok(value);
                }
                Err(EvalBreak::Error(err)) => return Err(err.into()),
                Err(other) => return Err(other.into_error().into()),
            }
        }
        Ok(result)
    }

    fn eval_expression(&self, mode: ExprMode, ctx: &mut Context) -> NodeResult {
        match mode {
            ExprMode::ExprOrTuple => {
                if self.children.len() == 1 {
                    self.children[0].eval(ctx)
                } else {
                    let mut tuple = Tuple::new();
                    tuple.reserve(self.children.len());
                    for child in &self.children {
                        let mut value = child.eval(ctx)?;
                        value.make_shared();
                        tuple.append(value);
                    }
                    Ok(Value::from(tuple).shared())
                }
            }
            ExprMode::Cond => {
                let mut result = Value::nav();
                for child in &self.children {
                    result = child.eval(ctx)?;
                }
                Ok(result)
            }
        }
    }

    fn eval_binary(&self, op: BinaryOp, ctx: &mut Context) -> NodeResult {
        let lhs = self.children[0].eval(ctx)?;
        // don't pre-compute rhs for the logical operators
        match op {
            BinaryOp::LogicalAnd => {
                let result = lhs.get_as_bool().map_err(|e| e.with_location(&self.loc))?
                    && self.children[1]
                        .eval(ctx)?
                        .get_as_bool()
                        .map_err(|e| e.with_location(&self.loc))?;
                Ok(Value::from(result))
            }
            BinaryOp::LogicalOr => {
                let result = lhs.get_as_bool().map_err(|e| e.with_location(&self.loc))?
                    || self.children[1]
                        .eval(ctx)?
                        .get_as_bool()
                        .map_err(|e| e.with_location(&self.loc))?;
                Ok(Value::from(result))
            }
            _ => {
                let rhs = self.children[1].eval(ctx)?;
                Ok(arithmetic::static_exec_binary(op, &lhs, &rhs).map_err(|e| e.with_location(&self.loc))?)
            }
        }
    }

    fn eval_assign(&self, shared: bool, mode: AssignMode, ctx: &mut Context) -> NodeResult {
        let lhs = &self.children[0];
        let is_id = matches!(lhs.kind(), NodeKind::Identifier(_));
        let mut val = self.children[1].eval(ctx)?;

        match mode {
            AssignMode::Assign => {
                if matches!(lhs.kind(), NodeKind::Subscript { .. }) {
                    return lhs.subscript_set(ctx, &val, shared);
                }
                let outcome = if is_id {
                    ctx.set_value(&lhs.detail(), &val, shared).map_err(EvalBreak::from)
                } else {
                    lhs.dot_set(ctx, &val, shared)
                };
                match outcome {
                    Ok(value) => Ok(value),
                    Err(EvalBreak::Error(err)) if err.kind() == ErrorKind::UnknownIdentifier => {
                        if ctx.dialect.auto_define_unknown_identifiers {
                            if !shared {
                                val.detach(true);
                            }
                            val.make_shared();
                            if is_id {
                                Ok(ctx.add_value_at(&lhs.detail(), val, lhs.loc())?)
                            } else {
                                lhs.dot_add(ctx, val)
                            }
                        } else {
                            Err(err.with_location(&self.loc).into())
                        }
                    }
                    Err(EvalBreak::Error(err)) => Err(err.with_location(&self.loc).into()),
                    Err(other) => Err(other),
                }
            }
            AssignMode::DefAssign => {
                if !shared {
                    // unconditional copy so the defined value is mutable
                    val.detach(false);
                } else if val.is_shared() && val.is_const() {
                    return Err(EvalError::const_shared_assign().with_location(&self.loc).into());
                }
                val.make_shared();
                if is_id {
                    Ok(ctx.add_value_at(&lhs.detail(), val, lhs.loc())?)
                } else {
                    lhs.dot_add(ctx, val)
                }
            }
            AssignMode::ConstAssign => {
                if !shared && val.share_count() > 1 {
                    // only copy values living on some store already
                    val.detach(true);
                }
                val.make_shared();
                val.make_const();
                if is_id {
                    Ok(ctx.add_value_at(&lhs.detail(), val, lhs.loc())?)
                } else {
                    lhs.dot_add(ctx, val)
                }
            }
        }
    }

    fn eval_repeat(&self, label: &str, ctx: &mut Context) -> NodeResult {
        with_scope(ctx, |ctx| {
            loop {
                match self.children[0].eval(ctx) {
                    Ok(_) => {}
                    Err(EvalBreak::LoopToHead { label: l }) if l == label => {}
                    Err(EvalBreak::StopLoop { label: l, result }) if l == label => return Ok(result),
                    Err(other) => return Err(other),
                }
            }
        })
    }

    fn eval_forall(&self, label: &str, ctx: &mut Context) -> NodeResult {
        with_scope(ctx, |ctx| {
            let seq_val = self.children[1].eval(ctx)?;
            let mut seq = match seq_val.data_tag() {
                TypeTag::IntegerSequence => seq_val.get_sequence().map_err(|e| e.with_location(&self.loc))?,
                TypeTag::Tuple => {
                    let size = seq_val.length().unwrap_or(0);
                    if size == 0 {
                        // an empty tuple runs the body zero times
                        return Ok(Value::nav());
                    }
                    IntegerSequence::new(0, size as i64 - 1, 1).map_err(|e| e.with_location(&self.loc))?
                }
                _ => {
                    return Err(EvalError::eval_at(
                        "forall can only iterate an IntegerSequence or a Tuple",
                        self.loc.clone(),
                    )
                    .into());
                }
            };
            seq.reset();

            let name = self.children[0].detail();
            let mut induction = ctx.add_value_at(
                &name,
                Value::from(seq.current()).shared(),
                self.children[0].loc(),
            )?;

            let mut result = Value::nav();
            loop {
                induction.assign_i64(seq.current()).map_err(|e| e.with_location(&self.loc))?;
                match self.children[2].eval(ctx) {
                    Ok(value) => {
                        result = value;
                        if !seq.next() {
                            break;
                        }
                    }
                    Err(EvalBreak::LoopToHead { label: l }) if l == label => {
                        if !seq.next() {
                            break;
                        }
                    }
                    Err(EvalBreak::StopLoop { label: l, result: r }) if l == label => {
                        result = r;
                        break;
                    }
                    Err(other) => return Err(other),
                }
            }
            Ok(result)
        })
    }

    fn eval_func_def(&self, ctx: &mut Context) -> NodeResult {
        let param_spec = self.children[self.children.len() - 2].clone();
        let body = self.children[self.children.len() - 1].clone();
        let func: FunctionPtr = Rc::new(ScriptFunc::new(param_spec, body));
        let value = Value::function(func).shared();

        if let NodeKind::Identifier(name) = self.children[0].kind() {
            ctx.add_value_at(name, value, self.children[0].loc())?;
            // usable in boolean expressions: use_xxx and (func test(a) {a*a})
            Ok(Value::from(true))
        } else {
            Ok(value)
        }
    }

    fn eval_call(&self, ctx: &mut Context) -> NodeResult {
        let callee = self.children[0].eval(ctx)?;
        let func = callee.get_function().map_err(|e| e.with_location(&self.loc))?;
        let args = self.children[1].eval_param_list(ctx)?;
        func.call(ctx, args, &self.loc)
    }

    fn eval_def_op(&self, kind: DefKind, ctx: &mut Context) -> NodeResult {
        let target = &self.children[0];
        let is_id = matches!(target.kind(), NodeKind::Identifier(_));
        match kind {
            DefKind::Def => {
                if ctx.dialect.declare_identifiers_without_assign_allowed && is_id {
                    Ok(ctx.add_value_at(&target.detail(), Value::nav().shared(), &self.loc)?)
                } else {
                    Err(EvalError::declare_without_assign(&target.detail(), self.loc.clone()).into())
                }
            }
            DefKind::Const => Err(EvalError::declare_without_assign(&target.detail(), self.loc.clone()).into()),
            DefKind::IsDef => {
                if is_id {
                    match ctx.is_defined(&target.detail()) {
                        Some(distance) => Ok(Value::from(distance)),
                        None => Ok(Value::from(false)),
                    }
                } else {
                    match target.eval(ctx) {
                        Ok(_) => Ok(Value::from(true)),
                        Err(EvalBreak::Error(e))
                            if matches!(e.kind(), ErrorKind::UnknownIdentifier | ErrorKind::OutOfRange) =>
                        {
                            Ok(Value::from(false))
                        }
                        Err(other) => Err(other),
                    }
                }
            }
            DefKind::Undef => {
                let outcome = if is_id {
                    ctx.remove_value(&target.detail()).map(|_| Value::from(true))
                } else {
                    match target.dot_remove(ctx) {
                        Ok(_) => Ok(Value::from(true)),
                        Err(EvalBreak::Error(e)) => Err(e),
                        Err(other) => return Err(other),
                    }
                };
                match outcome {
                    Ok(v) => Ok(v),
                    Err(e) if matches!(e.kind(), ErrorKind::UnknownIdentifier | ErrorKind::OutOfRange) => {
                        if ctx.dialect.undefine_unknown_identifiers_allowed {
                            Ok(Value::from(false))
                        } else {
                            Err(e.with_location(&self.loc).into())
                        }
                    }
                    Err(e) => Err(e.with_location(&self.loc).into()),
                }
            }
            DefKind::Debug => {
                match target.eval(ctx) {
                    Ok(val) => {
                        eprintln!(
                            "{} ({}, {}, sc:{}) : {}",
                            target.detail(),
                            val.type_info().name(),
                            if val.is_const() { "const" } else { "mutable" },
                            val.share_count(),
                            val.print_value()
                        );
                    }
                    Err(EvalBreak::Error(e)) if e.kind() == ErrorKind::UnknownIdentifier => {
                        eprintln!("{} : <undefined>", target.detail());
                    }
                    Err(other) => return Err(other),
                }
                Ok(Value::nav())
            }
        }
    }

    /// Evaluates a parameter list node into the argument vector, left to
    /// right.
    pub fn eval_param_list(&self, ctx: &mut Context) -> Result<Vec<Value>, EvalBreak> {
        let mut values = Vec::with_capacity(self.children.len());
        for child in &self.children {
            values.push(child.eval(ctx)?);
        }
        Ok(values)
    }

    // --- dot operator access paths -----------------------------------------

    /// Resolves the element index addressed by this dot node within `tuple`.
    fn dot_index(&self, tuple: &Tuple) -> EvalResult<usize> {
        let rhs = &self.children[1];
        let key: Option<String> = match rhs.kind() {
            NodeKind::Identifier(name) => Some(name.clone()),
            NodeKind::Constant(value) => {
                if value.data_tag() == TypeTag::String {
                    Some(value.get_string()?)
                } else {
                    None
                }
            }
            _ => {
                return Err(EvalError::eval_at("dot operator: invalid access", self.loc.clone()));
            }
        };
        if let Some(key) = key {
            return tuple
                .index_of_key(&key)
                .ok_or_else(|| EvalError::unknown_identifier(&key).with_location(&self.loc));
        }
        let idx = match rhs.kind() {
            NodeKind::Constant(value) => value.get_as_integer().map_err(|e| e.with_location(&self.loc))?,
            _ => return Err(EvalError::eval_at("dot operator: invalid access", self.loc.clone())),
        };
        let idx = usize::try_from(idx)
            .map_err(|_| EvalError::out_of_range("negative tuple index").with_location(&self.loc))?;
        if !tuple.contains_idx(idx) {
            return Err(EvalError::out_of_range(format!("tuple has no element {idx}")).with_location(&self.loc));
        }
        Ok(idx)
    }

    /// `lhs . rhs` read access: the element handle, const when the tuple is.
    pub fn dot_get(&self, ctx: &mut Context) -> NodeResult {
        let lhs = self.children[0].eval(ctx)?;
        if lhs.data_tag() != TypeTag::Tuple {
            return Err(EvalError::eval_at("dot operator: lhs is not a Tuple", self.loc.clone()).into());
        }
        let lhs_const = lhs.is_const();
        let mut lhs = lhs;
        let element = lhs.with_data_mut(|data| match data {
            ValueData::Tuple(tuple) => {
                let idx = self.dot_index(tuple)?;
                let slot = tuple
                    .get_mut(idx)
                    .ok_or_else(|| EvalError::out_of_range("tuple element vanished"))?;
                slot.make_shared();
                Ok(slot.clone())
            }
            _ => Err(EvalError::eval("dot operator: lhs is not a Tuple")),
        });
        let mut element = element.map_err(|e: EvalError| e.with_location(&self.loc))?;
        if lhs_const {
            element.make_const();
        }
        Ok(element)
    }

    /// `lhs . rhs := value` write access into an existing element.
    pub fn dot_set(&self, ctx: &mut Context, value: &Value, shared: bool) -> NodeResult {
        let lhs = self.children[0].eval(ctx)?;
        if lhs.data_tag() != TypeTag::Tuple {
            return Err(EvalError::eval_at("dot operator: lhs is not a Tuple", self.loc.clone()).into());
        }
        if lhs.is_const() {
            return Err(EvalError::new(
                ErrorKind::ConstAssign,
                "tuple is const, elements cannot be changed",
            )
            .with_location(&self.loc)
            .into());
        }
        let mut lhs = lhs;
        let element = lhs.with_data_mut(|data| match data {
            ValueData::Tuple(tuple) => {
                let idx = self.dot_index(tuple)?;
                let slot = tuple
                    .get_mut(idx)
                    .ok_or_else(|| EvalError::out_of_range("tuple element vanished"))?;
                slot.make_shared();
                Ok(slot.clone())
            }
            _ => Err(EvalError::eval("dot operator: lhs is not a Tuple")),
        });
        let mut element = element.map_err(|e: EvalError| e.with_location(&self.loc))?;
        if shared {
            element.shared_assign_value(value).map_err(|e| e.with_location(&self.loc))?;
        } else {
            element.assign_value(value).map_err(|e| e.with_location(&self.loc))?;
        }
        Ok(element)
    }

    /// `def lhs . rhs := value`: creates the element. Keys must be new,
    /// numeric append requires the index to equal the current size. The
    /// value's const flag travels with it.
    pub fn dot_add(&self, ctx: &mut Context, value: Value) -> NodeResult {
        let lhs = self.children[0].eval(ctx)?;
        if lhs.data_tag() != TypeTag::Tuple {
            return Err(EvalError::eval_at("dot operator: lhs is not a Tuple", self.loc.clone()).into());
        }
        if lhs.is_const() {
            return Err(EvalError::eval_at(
                "tuple is const, elements cannot be added",
                self.loc.clone(),
            )
            .into());
        }
        let rhs = &self.children[1];
        let key: Option<String> = match rhs.kind() {
            NodeKind::Identifier(name) => Some(name.clone()),
            NodeKind::Constant(v) if v.data_tag() == TypeTag::String => {
                Some(v.get_string().map_err(|e| e.with_location(&self.loc))?)
            }
            _ => None,
        };
        let mut lhs = lhs;
        let result = lhs.with_data_mut(|data| {
            let ValueData::Tuple(tuple) = data else {
                return Err(EvalError::eval("dot operator: lhs is not a Tuple"));
            };
            let mut value = value.clone();
            value.make_shared();
            if let Some(key) = key {
                if !tuple.append_key_value(&key, value) {
                    return Err(EvalError::redefinition(&key));
                }
                Ok(tuple.get_by_key(&key).map(Value::clone))
            } else {
                let idx = match rhs.kind() {
                    NodeKind::Constant(v) => v.get_as_integer()?,
                    _ => return Err(EvalError::eval("dot operator: invalid access")),
                };
                if idx < 0 || idx as usize > tuple.size() {
                    return Err(EvalError::out_of_range(format!("cannot append at index {idx}")));
                }
                if idx as usize != tuple.size() {
                    return Err(EvalError::redefinition(&idx.to_string()));
                }
                tuple.append(value);
                Ok(tuple.get(idx as usize).map(Value::clone))
            }
        });
        match result.map_err(|e| e.with_location(&self.loc))? {
            Some(element) => Ok(element),
            None => Err(EvalError::eval_at("dot operator: invalid access", self.loc.clone()).into()),
        }
    }

    /// `undef lhs . rhs`: removes the element, preserving element order.
    pub fn dot_remove(&self, ctx: &mut Context) -> NodeResult {
        let lhs = self.children[0].eval(ctx)?;
        if lhs.data_tag() != TypeTag::Tuple {
            return Err(EvalError::eval_at("dot operator: lhs is not a Tuple", self.loc.clone()).into());
        }
        if lhs.is_const() {
            return Err(EvalError::eval_at(
                "tuple is const, elements cannot be removed",
                self.loc.clone(),
            )
            .into());
        }
        let mut lhs = lhs;
        let removed = lhs.with_data_mut(|data| match data {
            ValueData::Tuple(tuple) => {
                let idx = self.dot_index(tuple)?;
                tuple
                    .remove_by_idx(idx)
                    .ok_or_else(|| EvalError::out_of_range("tuple element vanished"))
            }
            _ => Err(EvalError::eval("dot operator: lhs is not a Tuple")),
        });
        Ok(removed.map_err(|e| e.with_location(&self.loc))?)
    }

    // --- subscript operator access paths -----------------------------------

    /// `lhs[idx]` read access for tuples (index or key) and buffers (bytes).
    pub fn subscript_get(&self, ctx: &mut Context) -> NodeResult {
        let lhs = self.children[0].eval(ctx)?;
        let params = self.children[1].eval_param_list(ctx)?;
        Ok(subscript_get_value(&lhs, &params, &self.loc)?)
    }

    /// `lhs[idx] := value` write access.
    pub fn subscript_set(&self, ctx: &mut Context, value: &Value, shared: bool) -> NodeResult {
        let lhs = self.children[0].eval(ctx)?;
        let params = self.children[1].eval_param_list(ctx)?;
        Ok(subscript_set_value(lhs, &params, value, shared, &self.loc)?)
    }
}

/// Runs `f` inside a fresh local scope; the scope is popped on every path.
fn with_scope<R>(ctx: &mut Context, f: impl FnOnce(&mut Context) -> R) -> R {
    ctx.enter_scope();
    let result = f(ctx);
    ctx.exit_scope();
    result
}

/// Shared subscript read used by AST-eval and the VM.
pub fn subscript_get_value(lhs: &Value, params: &[Value], loc: &SourceLocation) -> EvalResult<Value> {
    let index = single_subscript_param(params, loc)?;
    match lhs.data_tag() {
        TypeTag::Tuple => {
            let mut lhs = lhs.clone();
            let lhs_const = lhs.is_const();
            let element = lhs.with_data_mut(|data| match data {
                ValueData::Tuple(tuple) => {
                    let idx = subscript_index(tuple, index, loc)?;
                    let slot = tuple
                        .get_mut(idx)
                        .ok_or_else(|| EvalError::out_of_range("tuple element vanished"))?;
                    slot.make_shared();
                    Ok(slot.clone())
                }
                _ => Err(EvalError::eval("subscript: lhs is not a Tuple")),
            });
            let mut element = element.map_err(|e| e.with_location(loc))?;
            if lhs_const {
                element.make_const();
            }
            Ok(element)
        }
        TypeTag::Buffer => lhs.with_data(|data| match data {
            ValueData::Buffer(buffer) => {
                let idx = index.get_as_integer().map_err(|e| e.with_location(loc))?;
                let idx = usize::try_from(idx)
                    .map_err(|_| EvalError::out_of_range("negative buffer index").with_location(loc))?;
                buffer
                    .get(idx)
                    .map(|byte| Value::from(*byte))
                    .ok_or_else(|| EvalError::out_of_range(format!("buffer has no byte {idx}")).with_location(loc))
            }
            _ => Err(EvalError::eval("subscript: lhs is not a Buffer")),
        }),
        _ => Err(EvalError::eval_at("subscript: lhs is not a Tuple or Buffer", loc.clone())),
    }
}

/// Shared subscript write used by AST-eval and the VM.
pub fn subscript_set_value(
    mut lhs: Value,
    params: &[Value],
    value: &Value,
    shared: bool,
    loc: &SourceLocation,
) -> EvalResult<Value> {
    if lhs.is_const() {
        return Err(
            EvalError::new(ErrorKind::ConstAssign, "value is const, elements cannot be changed").with_location(loc)
        );
    }
    let index = single_subscript_param(params, loc)?;
    match lhs.data_tag() {
        TypeTag::Tuple => {
            let element = lhs.with_data_mut(|data| match data {
                ValueData::Tuple(tuple) => {
                    let idx = subscript_index(tuple, index, loc)?;
                    let slot = tuple
                        .get_mut(idx)
                        .ok_or_else(|| EvalError::out_of_range("tuple element vanished"))?;
                    slot.make_shared();
                    Ok(slot.clone())
                }
                _ => Err(EvalError::eval("subscript: lhs is not a Tuple")),
            });
            let mut element = element.map_err(|e| e.with_location(loc))?;
            if shared {
                element.shared_assign_value(value).map_err(|e| e.with_location(loc))?;
            } else {
                element.assign_value(value).map_err(|e| e.with_location(loc))?;
            }
            Ok(element)
        }
        TypeTag::Buffer => {
            if value.data_tag() != TypeTag::U8 {
                return Err(EvalError::bad_value_cast("values for Buffer must be U8").with_location(loc));
            }
            let byte = value.get_u8().map_err(|e| e.with_location(loc))?;
            let idx = index.get_as_integer().map_err(|e| e.with_location(loc))?;
            let idx = usize::try_from(idx)
                .map_err(|_| EvalError::out_of_range("negative buffer index").with_location(loc))?;
            lhs.with_data_mut(|data| match data {
                ValueData::Buffer(buffer) => match buffer.get_mut(idx) {
                    Some(slot) => {
                        *slot = byte;
                        Ok(Value::from(byte))
                    }
                    None => Err(EvalError::out_of_range(format!("buffer has no byte {idx}")).with_location(loc)),
                },
                _ => Err(EvalError::eval("subscript: lhs is not a Buffer")),
            })
        }
        _ => Err(EvalError::eval_at("subscript: lhs is not a Tuple or Buffer", loc.clone())),
    }
}

fn single_subscript_param<'a>(params: &'a [Value], loc: &SourceLocation) -> EvalResult<&'a Value> {
    match params {
        [index] => Ok(index),
        [] => Err(EvalError::eval_at("subscript: no index or key operand present", loc.clone())),
        _ => Err(EvalError::eval_at(
            "subscript with more than one operand is not implemented",
            loc.clone(),
        )),
    }
}

fn subscript_index(tuple: &Tuple, index: &Value, loc: &SourceLocation) -> EvalResult<usize> {
    if index.data_tag() == TypeTag::String {
        let key = index.get_string().map_err(|e| e.with_location(loc))?;
        return tuple
            .index_of_key(&key)
            .ok_or_else(|| EvalError::unknown_identifier(&key).with_location(loc));
    }
    let idx = index.get_as_integer().map_err(|e| e.with_location(loc))?;
    let idx =
        usize::try_from(idx).map_err(|_| EvalError::out_of_range("negative tuple index").with_location(loc))?;
    if !tuple.contains_idx(idx) {
        return Err(EvalError::out_of_range(format!("tuple has no element {idx}")).with_location(loc));
    }
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLocation {
        SourceLocation::default()
    }

    fn ptr(node: Node) -> NodePtr {
        Rc::new(node)
    }

    /// `def <name> := <value>` as a finished assign node.
    fn def_assign(name: &str, value: Node) -> Node {
        let mut assign = Node::assign(false, loc());
        let mut def = Node::def_op(DefKind::Def, loc());
        def.add_child(ptr(Node::identifier(name, loc()))).unwrap();
        assign.add_child(ptr(def)).unwrap();
        assign.add_child(ptr(value)).unwrap();
        assign
    }

    fn int(v: i64) -> Node {
        Node::constant(Value::from(v), loc())
    }

    #[test]
    fn constant_and_identifier_eval() {
        let mut ctx = Context::new();
        assert_eq!(int(5).eval(&mut ctx).unwrap().get_i64().unwrap(), 5);

        ctx.add_value("x", Value::from(9i64).shared()).unwrap();
        let id = Node::identifier("x", loc());
        assert_eq!(id.eval(&mut ctx).unwrap().get_i64().unwrap(), 9);

        let missing = Node::identifier("nope", loc());
        match missing.eval(&mut ctx) {
            Err(EvalBreak::Error(e)) => assert_eq!(e.kind(), ErrorKind::UnknownIdentifier),
            other => panic!("expected unknown identifier, got {other:?}"),
        }
    }

    #[test]
    fn def_assign_then_plain_assign() {
        let mut ctx = Context::new();
        def_assign("c", int(0)).eval(&mut ctx).unwrap();
        assert_eq!(ctx.find_value("c").unwrap().get_i64().unwrap(), 0);

        let mut assign = Node::assign(false, loc());
        assign.add_child(ptr(Node::identifier("c", loc()))).unwrap();
        assign.add_child(ptr(int(42))).unwrap();
        assign.eval(&mut ctx).unwrap();
        assert_eq!(ctx.find_value("c").unwrap().get_i64().unwrap(), 42);
    }

    #[test]
    fn assign_to_unknown_identifier_fails_without_dialect() {
        let mut ctx = Context::new();
        let mut assign = Node::assign(false, loc());
        assign.add_child(ptr(Node::identifier("ghost", loc()))).unwrap();
        assign.add_child(ptr(int(1))).unwrap();
        match assign.eval(&mut ctx) {
            Err(EvalBreak::Error(e)) => assert_eq!(e.kind(), ErrorKind::UnknownIdentifier),
            other => panic!("unexpected {other:?}"),
        }

        ctx.dialect.auto_define_unknown_identifiers = true;
        assign.eval(&mut ctx).unwrap();
        assert_eq!(ctx.find_value("ghost").unwrap().get_i64().unwrap(), 1);
    }

    #[test]
    fn tuple_expression_composes_shared_elements() {
        let mut ctx = Context::new();
        let mut expr = Node::expression(ExprMode::ExprOrTuple, loc());
        expr.add_child(ptr(int(1))).unwrap();
        expr.add_child(ptr(int(2))).unwrap();
        expr.set_complete();
        let value = expr.eval(&mut ctx).unwrap();
        assert_eq!(value.data_tag(), TypeTag::Tuple);
        assert!(value.is_shared());
        let tuple = value.get_tuple().unwrap();
        assert_eq!(tuple.size(), 2);
        assert!(tuple.get(0).unwrap().is_shared());
    }

    #[test]
    fn repeat_with_stop_produces_loop_result() {
        // def c := 0; repeat { c := c + 1; if (c == 10) { stop } }; c
        let mut ctx = Context::new();
        def_assign("c", int(0)).eval(&mut ctx).unwrap();

        let mut incr = Node::binary(BinaryOp::Plus, loc());
        incr.add_child(ptr(Node::identifier("c", loc()))).unwrap();
        incr.add_child(ptr(int(1))).unwrap();
        let mut assign = Node::assign(false, loc());
        assign.add_child(ptr(Node::identifier("c", loc()))).unwrap();
        assign.add_child(ptr(incr)).unwrap();

        let mut cmp = Node::binary(BinaryOp::Eq, loc());
        cmp.add_child(ptr(Node::identifier("c", loc()))).unwrap();
        cmp.add_child(ptr(int(10))).unwrap();
        let mut then_block = Node::block(loc());
        then_block.add_child(ptr(Node::stop("", false, loc()))).unwrap();
        then_block.set_complete();
        let mut if_node = Node::if_stmt(loc());
        if_node.add_child(ptr(cmp)).unwrap();
        if_node.add_child(ptr(then_block)).unwrap();

        let mut body = Node::block(loc());
        body.add_child(ptr(assign)).unwrap();
        body.add_child(ptr(if_node)).unwrap();
        body.set_complete();

        let mut repeat = Node::repeat("", loc());
        repeat.add_child(ptr(body)).unwrap();

        repeat.eval(&mut ctx).unwrap();
        assert_eq!(ctx.find_value("c").unwrap().get_i64().unwrap(), 10);
        assert_eq!(ctx.local_scope_count(), 0);
    }

    #[test]
    fn forall_iterates_sequence_and_tuple() {
        let mut ctx = Context::new();
        def_assign("sum", int(0)).eval(&mut ctx).unwrap();

        let seq = IntegerSequence::new(1, 4, 1).unwrap();
        let mut body = Node::block(loc());
        let mut add = Node::binary(BinaryOp::Plus, loc());
        add.add_child(ptr(Node::identifier("sum", loc()))).unwrap();
        add.add_child(ptr(Node::identifier("i", loc()))).unwrap();
        let mut assign = Node::assign(false, loc());
        assign.add_child(ptr(Node::identifier("sum", loc()))).unwrap();
        assign.add_child(ptr(add)).unwrap();
        body.add_child(ptr(assign)).unwrap();
        body.set_complete();

        let mut forall = Node::forall("", loc());
        forall.add_child(ptr(Node::identifier("i", loc()))).unwrap();
        forall
            .add_child(ptr(Node::constant(Value::sequence(seq), loc())))
            .unwrap();
        forall.add_child(ptr(body)).unwrap();

        forall.eval(&mut ctx).unwrap();
        assert_eq!(ctx.find_value("sum").unwrap().get_i64().unwrap(), 10);
        assert_eq!(ctx.local_scope_count(), 0);
    }

    #[test]
    fn forall_over_empty_tuple_runs_zero_times() {
        let mut ctx = Context::new();
        let mut body = Node::block(loc());
        body.add_child(ptr(int(1))).unwrap();
        body.set_complete();
        let mut forall = Node::forall("", loc());
        forall.add_child(ptr(Node::identifier("i", loc()))).unwrap();
        forall
            .add_child(ptr(Node::constant(Value::from(Tuple::new()).shared(), loc())))
            .unwrap();
        forall.add_child(ptr(body)).unwrap();
        let result = forall.eval(&mut ctx).unwrap();
        assert_eq!(result.data_tag(), TypeTag::NaV);
    }

    #[test]
    fn function_definition_and_call() {
        // func add(a, b) { a + b }; add(2, 3)
        let mut ctx = Context::new();

        let mut spec = Node::param_spec(loc());
        for name in ["a", "b"] {
            let mut assign = Node::assign(false, loc());
            let mut def = Node::def_op(DefKind::Def, loc());
            def.add_child(ptr(Node::identifier(name, loc()))).unwrap();
            assign.add_child(ptr(def)).unwrap();
            assign.add_child(ptr(Node::from_param(loc()))).unwrap();
            spec.add_child(ptr(assign)).unwrap();
        }
        spec.set_complete();

        let mut sum = Node::binary(BinaryOp::Plus, loc());
        sum.add_child(ptr(Node::identifier("a", loc()))).unwrap();
        sum.add_child(ptr(Node::identifier("b", loc()))).unwrap();
        let mut body = Node::block(loc());
        body.add_child(ptr(sum)).unwrap();
        body.set_complete();

        let mut func = Node::func(loc());
        func.add_child(ptr(Node::identifier("add", loc()))).unwrap();
        func.add_child(ptr(spec)).unwrap();
        func.add_child(ptr(body)).unwrap();
        func.set_complete();
        assert!(func.eval(&mut ctx).unwrap().get_bool().unwrap());

        let mut params = Node::param_list(loc());
        params.add_child(ptr(int(2))).unwrap();
        params.add_child(ptr(int(3))).unwrap();
        params.set_complete();
        let mut call = Node::call_func(loc());
        call.add_child(ptr(Node::identifier("add", loc()))).unwrap();
        call.add_child(ptr(params)).unwrap();
        call.set_complete();

        assert_eq!(call.eval(&mut ctx).unwrap().get_i64().unwrap(), 5);
        assert_eq!(ctx.local_scope_count(), 0);

        // arity error: one argument too many
        let mut params = Node::param_list(loc());
        for v in [1, 2, 3] {
            params.add_child(ptr(int(v))).unwrap();
        }
        params.set_complete();
        let mut call = Node::call_func(loc());
        call.add_child(ptr(Node::identifier("add", loc()))).unwrap();
        call.add_child(ptr(params)).unwrap();
        call.set_complete();
        assert!(matches!(call.eval(&mut ctx), Err(EvalBreak::Error(_))));
        assert_eq!(ctx.local_scope_count(), 0);
    }

    #[test]
    fn default_parameter_via_from_param_or() {
        let mut ctx = Context::new();

        let mut spec = Node::param_spec(loc());
        let mut assign = Node::assign(false, loc());
        let mut def = Node::def_op(DefKind::Def, loc());
        def.add_child(ptr(Node::identifier("a", loc()))).unwrap();
        assign.add_child(ptr(def)).unwrap();
        let mut or = Node::from_param_or(loc());
        or.add_child(ptr(int(7))).unwrap();
        assign.add_child(ptr(or)).unwrap();
        spec.add_child(ptr(assign)).unwrap();
        spec.set_complete();

        let mut body = Node::block(loc());
        body.add_child(ptr(Node::identifier("a", loc()))).unwrap();
        body.set_complete();

        let mut func = Node::func(loc());
        func.add_child(ptr(spec)).unwrap();
        func.add_child(ptr(body)).unwrap();
        func.set_complete();
        let lambda = func.eval(&mut ctx).unwrap();
        let f = lambda.get_function().unwrap();

        let r = f.call(&mut ctx, vec![], &loc()).unwrap();
        assert_eq!(r.get_i64().unwrap(), 7);
        let r = f.call(&mut ctx, vec![Value::from(3i64)], &loc()).unwrap();
        assert_eq!(r.get_i64().unwrap(), 3);
    }

    #[test]
    fn dot_and_subscript_access() {
        let mut ctx = Context::new();
        let mut tuple = Tuple::new();
        tuple.append(Value::from(1i64).shared());
        tuple.append_key_value("name", Value::from("tea").shared());
        ctx.add_value("t", Value::from(tuple).shared()).unwrap();

        // t.name
        let mut dot = Node::dot(loc());
        dot.add_child(ptr(Node::identifier("t", loc()))).unwrap();
        dot.add_child(ptr(Node::identifier("name", loc()))).unwrap();
        assert_eq!(dot.eval(&mut ctx).unwrap().get_string().unwrap(), "tea");

        // t[0] := 9 then read back
        let mut params = Node::param_list(loc());
        params.add_child(ptr(int(0))).unwrap();
        params.set_complete();
        let mut sub = Node::subscript(loc());
        sub.add_child(ptr(Node::identifier("t", loc()))).unwrap();
        sub.add_child(ptr(params)).unwrap();
        sub.set_complete();

        let mut assign = Node::assign(false, loc());
        assign.add_child(ptr(sub)).unwrap();
        assign.add_child(ptr(int(9))).unwrap();
        assign.eval(&mut ctx).unwrap();

        let t = ctx.find_value("t").unwrap().get_tuple().unwrap();
        assert_eq!(t.get(0).unwrap().get_i64().unwrap(), 9);
    }

    #[test]
    fn const_tuple_rejects_element_writes() {
        let mut ctx = Context::new();
        let mut tuple = Tuple::new();
        tuple.append(Value::from(1i64).shared());
        ctx.add_value("t", Value::from(tuple).shared().into_const()).unwrap();

        let mut params = Node::param_list(loc());
        params.add_child(ptr(int(0))).unwrap();
        params.set_complete();
        let mut sub = Node::subscript(loc());
        sub.add_child(ptr(Node::identifier("t", loc()))).unwrap();
        sub.add_child(ptr(params)).unwrap();
        sub.set_complete();
        let mut assign = Node::assign(false, loc());
        assign.add_child(ptr(sub)).unwrap();
        assign.add_child(ptr(int(9))).unwrap();

        match assign.eval(&mut ctx) {
            Err(EvalBreak::Error(e)) => assert_eq!(e.kind(), ErrorKind::ConstAssign),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn yield_and_suspend_error_in_eval_mode() {
        let mut ctx = Context::new();
        let mut y = Node::yield_stmt(loc());
        y.add_child(ptr(int(1))).unwrap();
        match y.eval(&mut ctx) {
            Err(EvalBreak::Error(e)) => assert_eq!(e.kind(), ErrorKind::SuspendStatement),
            other => panic!("unexpected {other:?}"),
        }
        match Node::suspend_stmt(loc()).eval(&mut ctx) {
            Err(EvalBreak::Error(e)) => assert_eq!(e.kind(), ErrorKind::SuspendStatement),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exit_terminates_file_eval_normally() {
        let mut ctx = Context::new();
        let mut file = Node::file("main", loc());
        file.add_child(ptr(int(1))).unwrap();
        let mut exit = Node::exit_stmt(true, loc());
        exit.add_child(ptr(int(42))).unwrap();
        file.add_child(ptr(exit)).unwrap();
        file.add_child(ptr(int(2))).unwrap();

        let result = file.eval(&mut ctx).unwrap();
        assert_eq!(result.get_i64().unwrap(), 42);
        assert_eq!(ctx.local_scope_count(), 0);
    }

    #[test]
    fn share_semantics_scenarios() {
        // def a := (1,2); def b := a; b[0] := 9; a[0] == 1
        let mut ctx = Context::new();
        let mut expr = Node::expression(ExprMode::ExprOrTuple, loc());
        expr.add_child(ptr(int(1))).unwrap();
        expr.add_child(ptr(int(2))).unwrap();
        expr.set_complete();
        def_assign("a", expr).eval(&mut ctx).unwrap();

        def_assign("b", Node::identifier("a", loc())).eval(&mut ctx).unwrap();

        let set_b0 = |ctx: &mut Context, v: i64| {
            let mut params = Node::param_list(loc());
            params.add_child(ptr(int(0))).unwrap();
            params.set_complete();
            let mut sub = Node::subscript(loc());
            sub.add_child(ptr(Node::identifier("b", loc()))).unwrap();
            sub.add_child(ptr(params)).unwrap();
            sub.set_complete();
            let mut assign = Node::assign(false, loc());
            assign.add_child(ptr(sub)).unwrap();
            assign.add_child(ptr(int(v))).unwrap();
            assign.eval(ctx).unwrap();
        };
        set_b0(&mut ctx, 9);
        let a = ctx.find_value("a").unwrap().get_tuple().unwrap();
        assert_eq!(a.get(0).unwrap().get_i64().unwrap(), 1);

        // def c @= a; c[0] := 9; a[0] == 9
        let mut assign = Node::assign(true, loc());
        let mut def = Node::def_op(DefKind::Def, loc());
        def.add_child(ptr(Node::identifier("c", loc()))).unwrap();
        assign.add_child(ptr(def)).unwrap();
        assign.add_child(ptr(Node::identifier("a", loc()))).unwrap();
        assign.eval(&mut ctx).unwrap();

        let mut params = Node::param_list(loc());
        params.add_child(ptr(int(0))).unwrap();
        params.set_complete();
        let mut sub = Node::subscript(loc());
        sub.add_child(ptr(Node::identifier("c", loc()))).unwrap();
        sub.add_child(ptr(params)).unwrap();
        sub.set_complete();
        let mut set = Node::assign(false, loc());
        set.add_child(ptr(sub)).unwrap();
        set.add_child(ptr(int(9))).unwrap();
        set.eval(&mut ctx).unwrap();

        let a = ctx.find_value("a").unwrap().get_tuple().unwrap();
        assert_eq!(a.get(0).unwrap().get_i64().unwrap(), 9);
    }

    #[test]
    fn const_binding_rejects_reassignment() {
        let mut ctx = Context::new();
        let mut assign = Node::assign(false, loc());
        let mut konst = Node::def_op(DefKind::Const, loc());
        konst.add_child(ptr(Node::identifier("k", loc()))).unwrap();
        assign.add_child(ptr(konst)).unwrap();
        assign.add_child(ptr(int(5))).unwrap();
        assign.eval(&mut ctx).unwrap();

        let mut set = Node::assign(false, loc());
        set.add_child(ptr(Node::identifier("k", loc()))).unwrap();
        set.add_child(ptr(int(6))).unwrap();
        match set.eval(&mut ctx) {
            Err(EvalBreak::Error(e)) => assert_eq!(e.kind(), ErrorKind::ConstAssign),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn is_def_reports_scope_distance() {
        let mut ctx = Context::new();
        ctx.add_value("x", Value::from(1i64).shared()).unwrap();
        ctx.enter_scope();

        let mut isdef = Node::def_op(DefKind::IsDef, loc());
        isdef.add_child(ptr(Node::identifier("x", loc()))).unwrap();
        assert_eq!(isdef.eval(&mut ctx).unwrap().get_i64().unwrap(), 2);

        let mut isdef = Node::def_op(DefKind::IsDef, loc());
        isdef.add_child(ptr(Node::identifier("nope", loc()))).unwrap();
        assert!(!isdef.eval(&mut ctx).unwrap().get_bool().unwrap());
        ctx.exit_scope();
    }
}
