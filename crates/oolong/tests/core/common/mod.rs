//! Small AST construction helpers shared by the integration tests. They
//! build the same trees a parser would produce.

use std::rc::Rc;

use oolong::{
    AssignMode, BinaryOp, Compiler, Constraints, Context, DefKind, EvalError, ExprMode, Machine, Node, NodePtr,
    OptLevel, SourceLocation, Value,
};

pub fn loc() -> SourceLocation {
    SourceLocation::default()
}

pub fn ptr(node: Node) -> NodePtr {
    Rc::new(node)
}

pub fn int(v: i64) -> Node {
    Node::constant(Value::from(v), loc())
}

pub fn ident(name: &str) -> Node {
    Node::identifier(name, loc())
}

/// `def <name> := <value>` / `def <name> @= <value>`
pub fn def_assign(name: &str, value: Node, shared: bool) -> Node {
    let mut assign = Node::assign(shared, loc());
    let mut def = Node::def_op(DefKind::Def, loc());
    def.add_child(ptr(ident(name))).unwrap();
    assign.add_child(ptr(def)).unwrap();
    assign.add_child(ptr(value)).unwrap();
    assert!(matches!(
        assign.kind(),
        oolong::NodeKind::Assign {
            mode: AssignMode::DefAssign,
            ..
        }
    ));
    assign
}

/// `const <name> := <value>`
pub fn const_assign(name: &str, value: Node) -> Node {
    let mut assign = Node::assign(false, loc());
    let mut konst = Node::def_op(DefKind::Const, loc());
    konst.add_child(ptr(ident(name))).unwrap();
    assign.add_child(ptr(konst)).unwrap();
    assign.add_child(ptr(value)).unwrap();
    assign
}

/// `<target> := <value>` for an arbitrary finished LHS node.
pub fn assign_to(target: Node, value: Node) -> Node {
    let mut assign = Node::assign(false, loc());
    assign.add_child(ptr(target)).unwrap();
    assign.add_child(ptr(value)).unwrap();
    assign
}

pub fn binary(op: BinaryOp, lhs: Node, rhs: Node) -> Node {
    let mut node = Node::binary(op, loc());
    node.add_child(ptr(lhs)).unwrap();
    node.add_child(ptr(rhs)).unwrap();
    node
}

/// `(<elements>)` tuple literal expression.
pub fn tuple_expr(elements: Vec<Node>) -> Node {
    let mut expr = Node::expression(ExprMode::ExprOrTuple, loc());
    for element in elements {
        expr.add_child(ptr(element)).unwrap();
    }
    expr.set_complete();
    expr
}

/// `<target>[<index>]`
pub fn subscript(target: Node, index: Node) -> Node {
    let mut params = Node::param_list(loc());
    params.add_child(ptr(index)).unwrap();
    params.set_complete();
    let mut sub = Node::subscript(loc());
    sub.add_child(ptr(target)).unwrap();
    sub.add_child(ptr(params)).unwrap();
    sub.set_complete();
    sub
}

pub fn block(statements: Vec<Node>) -> Node {
    let mut node = Node::block(loc());
    for statement in statements {
        node.add_child(ptr(statement)).unwrap();
    }
    node.set_complete();
    node
}

pub fn if_then(cond: Node, then_block: Node) -> Node {
    let mut node = Node::if_stmt(loc());
    node.add_child(ptr(cond)).unwrap();
    node.add_child(ptr(then_block)).unwrap();
    node
}

pub fn repeat(body: Node) -> Node {
    let mut node = Node::repeat("", loc());
    node.add_child(ptr(body)).unwrap();
    node
}

pub fn yield_stmt(value: Node) -> Node {
    let mut node = Node::yield_stmt(loc());
    node.add_child(ptr(value)).unwrap();
    node
}

pub fn file(statements: Vec<Node>) -> Node {
    let mut node = Node::file("test", loc());
    for statement in statements {
        node.add_child(ptr(statement)).unwrap();
    }
    node
}

/// Compiles at `opt` and runs on a fresh machine/context pair.
pub fn compile_and_run(root: &Node, opt: OptLevel) -> Result<(Value, Context), EvalError> {
    let program = Compiler::new().compile(root, opt)?;
    let mut ctx = Context::new();
    let mut machine = Machine::new();
    machine.exec(&program, &mut ctx, Constraints::None)?;
    machine.throw_possible_error()?;
    assert!(machine.is_finished(), "machine ended in state {:?}", machine.state());
    let result = machine.take_result().unwrap_or_else(Value::nav);
    Ok((result, ctx))
}

/// Evaluates the AST directly against a fresh context.
pub fn eval_ast(root: &Node) -> Result<(Value, Context), EvalError> {
    let mut ctx = Context::new();
    match root.eval(&mut ctx) {
        Ok(value) => Ok((value, ctx)),
        Err(signal) => Err(signal.into_error()),
    }
}
