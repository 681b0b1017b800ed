//! End-to-end scenarios: source-level programs expressed as the AST a parser
//! would produce, run through both execution modes.

use oolong::{BinaryOp, ErrorKind, OptLevel, TypeTag};
use pretty_assertions::assert_eq;

use crate::common::*;

/// `def c := 0; repeat { c := c + 1; if( c == 10 ) { stop } }; c`
fn counting_program() -> oolong::Node {
    let incr = assign_to(ident("c"), binary(BinaryOp::Plus, ident("c"), int(1)));
    let cond = binary(BinaryOp::Eq, ident("c"), int(10));
    let stop = oolong::Node::stop("", false, loc());
    let if_node = if_then(cond, block(vec![stop]));
    file(vec![
        def_assign("c", int(0), false),
        repeat(block(vec![incr, if_node])),
        ident("c"),
    ])
}

#[test]
fn scenario_1_repeat_until_stop() {
    for opt in [OptLevel::Debug, OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let (result, ctx) = compile_and_run(&counting_program(), opt).unwrap();
        assert_eq!(result.get_i64().unwrap(), 10, "{opt}");
        assert_eq!(ctx.local_scope_count(), 0, "{opt}");
    }
    let (result, ctx) = eval_ast(&counting_program()).unwrap();
    assert_eq!(result.get_i64().unwrap(), 10);
    assert_eq!(ctx.local_scope_count(), 0);
}

/// `def t := (1, 2, 3); t[1] := 99; t`
#[test]
fn scenario_2_subscript_write() {
    let root = file(vec![
        def_assign("t", tuple_expr(vec![int(1), int(2), int(3)]), false),
        assign_to(subscript(ident("t"), int(1)), int(99)),
        ident("t"),
    ]);
    for opt in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let (result, _ctx) = compile_and_run(&root, opt).unwrap();
        assert_eq!(result.data_tag(), TypeTag::Tuple, "{opt}");
        let tuple = result.get_tuple().unwrap();
        let elems: Vec<i64> = (0..3).map(|i| tuple.get(i).unwrap().get_i64().unwrap()).collect();
        assert_eq!(elems, vec![1, 99, 3], "{opt}");
    }

    // read back t[1]
    let read_back = file(vec![
        def_assign("t", tuple_expr(vec![int(1), int(2), int(3)]), false),
        assign_to(subscript(ident("t"), int(1)), int(99)),
        subscript(ident("t"), int(1)),
    ]);
    let (result, _) = compile_and_run(&read_back, OptLevel::O0).unwrap();
    assert_eq!(result.get_i64().unwrap(), 99);
    let (result, _) = eval_ast(&read_back).unwrap();
    assert_eq!(result.get_i64().unwrap(), 99);
}

/// `const t := (1,2,3); t[0] := 9` fails with const-assign
#[test]
fn scenario_3_const_tuple_write_fails() {
    let root = file(vec![
        const_assign("t", tuple_expr(vec![int(1), int(2), int(3)])),
        assign_to(subscript(ident("t"), int(0)), int(9)),
    ]);
    let err = eval_ast(&root).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstAssign);
    let err = compile_and_run(&root, OptLevel::O0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstAssign);
}

/// `def a := (1,2); def b := a; b[0] := 9; a[0]` stays 1 (deep copy)
#[test]
fn scenario_4_value_copy_is_deep() {
    let root = file(vec![
        def_assign("a", tuple_expr(vec![int(1), int(2)]), false),
        def_assign("b", ident("a"), false),
        assign_to(subscript(ident("b"), int(0)), int(9)),
        subscript(ident("a"), int(0)),
    ]);
    for opt in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let (result, _) = compile_and_run(&root, opt).unwrap();
        assert_eq!(result.get_i64().unwrap(), 1, "{opt}");
    }
    let (result, _) = eval_ast(&root).unwrap();
    assert_eq!(result.get_i64().unwrap(), 1);
}

/// `def a := (1,2); def b @= a; b[0] := 9; a[0]` becomes 9 (shared)
#[test]
fn scenario_5_shared_assign_shares() {
    let root = file(vec![
        def_assign("a", tuple_expr(vec![int(1), int(2)]), false),
        def_assign("b", ident("a"), true),
        assign_to(subscript(ident("b"), int(0)), int(9)),
        subscript(ident("a"), int(0)),
    ]);
    for opt in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let (result, _) = compile_and_run(&root, opt).unwrap();
        assert_eq!(result.get_i64().unwrap(), 9, "{opt}");
    }
    let (result, _) = eval_ast(&root).unwrap();
    assert_eq!(result.get_i64().unwrap(), 9);
}

/// `1 + 2 * 3` at O1 folds to a single constant Push and evaluates to 7.
#[test]
fn scenario_7_o1_constant_folding() {
    let root = file(vec![binary(
        BinaryOp::Plus,
        int(1),
        binary(BinaryOp::Mul, int(2), int(3)),
    )]);
    let program = oolong::Compiler::new().compile(&root, OptLevel::O1).unwrap();
    assert!(program.instructions().iter().all(|i| i.op != oolong::OpCode::BinaryOp));
    let pushes: Vec<_> = program
        .instructions()
        .iter()
        .filter(|i| i.op == oolong::OpCode::Push)
        .collect();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].payload.get_i64().unwrap(), 7);

    let (result, _) = compile_and_run(&root, OptLevel::O1).unwrap();
    assert_eq!(result.get_i64().unwrap(), 7);
}

/// Const enforcement on plain bindings, in both modes.
#[test]
fn const_binding_enforcement() {
    let root = file(vec![const_assign("k", int(1)), assign_to(ident("k"), int(2))]);
    assert_eq!(eval_ast(&root).unwrap_err().kind(), ErrorKind::ConstAssign);
    assert_eq!(
        compile_and_run(&root, OptLevel::O0).unwrap_err().kind(),
        ErrorKind::ConstAssign
    );
}

/// Sharing a const value into a mutable slot fails at assignment time.
#[test]
fn const_shared_assign_enforcement() {
    let root = file(vec![
        const_assign("k", tuple_expr(vec![int(1), int(2)])),
        def_assign("m", ident("k"), true),
    ]);
    assert_eq!(eval_ast(&root).unwrap_err().kind(), ErrorKind::ConstSharedAssign);
    assert_eq!(
        compile_and_run(&root, OptLevel::O0).unwrap_err().kind(),
        ErrorKind::ConstSharedAssign
    );
}

/// `@@` identity and `@?` share count agree across modes.
#[test]
fn shared_with_identity_operator() {
    let shared_case = file(vec![
        def_assign("a", tuple_expr(vec![int(1)]), false),
        def_assign("b", ident("a"), true),
        binary(BinaryOp::Shared, ident("a"), ident("b")),
    ]);
    let copied_case = file(vec![
        def_assign("a", tuple_expr(vec![int(1)]), false),
        def_assign("b", ident("a"), false),
        binary(BinaryOp::Shared, ident("a"), ident("b")),
    ]);
    for root in [&shared_case, &copied_case] {
        let expected = std::ptr::eq(root, &shared_case);
        let (result, _) = eval_ast(root).unwrap();
        assert_eq!(result.get_bool().unwrap(), expected);
        let (result, _) = compile_and_run(root, OptLevel::O0).unwrap();
        assert_eq!(result.get_bool().unwrap(), expected);
    }
}

/// Assignment across differing types fails, NaV assignment is allowed.
#[test]
fn type_mismatch_and_nav_assignment() {
    let mismatch = file(vec![
        def_assign("x", int(1), false),
        assign_to(ident("x"), oolong::Node::constant(oolong::Value::from("text"), loc())),
    ]);
    assert_eq!(eval_ast(&mismatch).unwrap_err().kind(), ErrorKind::TypeMismatch);
    assert_eq!(
        compile_and_run(&mismatch, OptLevel::O0).unwrap_err().kind(),
        ErrorKind::TypeMismatch
    );

    let nav_ok = file(vec![
        def_assign("x", int(1), false),
        assign_to(ident("x"), oolong::Node::constant(oolong::Value::nav(), loc())),
        ident("x"),
    ]);
    let (result, _) = compile_and_run(&nav_ok, OptLevel::O0).unwrap();
    assert_eq!(result.data_tag(), TypeTag::NaV);
}

/// Labelled loops: `stop "outer"` from an inner loop leaves both.
#[test]
fn labelled_stop_leaves_the_outer_loop() {
    // def n := 0;
    // repeat "outer" { repeat "inner" { n := n + 1; stop "outer" } }; n
    let incr = assign_to(ident("n"), binary(BinaryOp::Plus, ident("n"), int(1)));
    let stop_outer = oolong::Node::stop("outer", false, loc());
    let mut inner = oolong::Node::repeat("inner", loc());
    inner.add_child(ptr(block(vec![incr, stop_outer]))).unwrap();
    let mut outer = oolong::Node::repeat("outer", loc());
    outer.add_child(ptr(block(vec![inner]))).unwrap();
    let root = file(vec![def_assign("n", int(0), false), outer, ident("n")]);

    for opt in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let (result, ctx) = compile_and_run(&root, opt).unwrap();
        assert_eq!(result.get_i64().unwrap(), 1, "{opt}");
        assert_eq!(ctx.local_scope_count(), 0, "{opt}");
    }
    let (result, _) = eval_ast(&root).unwrap();
    assert_eq!(result.get_i64().unwrap(), 1);
}

/// `stop with` carries the loop result.
#[test]
fn stop_with_carries_result() {
    let mut stop = oolong::Node::stop("", true, loc());
    stop.add_child(ptr(int(42))).unwrap();
    let root = file(vec![repeat(block(vec![stop]))]);
    for opt in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let (result, _) = compile_and_run(&root, opt).unwrap();
        assert_eq!(result.get_i64().unwrap(), 42, "{opt}");
    }
    let (result, _) = eval_ast(&root).unwrap();
    assert_eq!(result.get_i64().unwrap(), 42);
}

/// `loop` jumps back to the loop head, skipping the rest of the body.
#[test]
fn loop_statement_restarts_the_body() {
    // def c := 0; def skipped := 0;
    // repeat { c := c + 1; if (c >= 5) { stop }; loop; skipped := 99 }; skipped
    let incr = assign_to(ident("c"), binary(BinaryOp::Plus, ident("c"), int(1)));
    let stop = oolong::Node::stop("", false, loc());
    let guard = if_then(binary(BinaryOp::Ge, ident("c"), int(5)), block(vec![stop]));
    let never = assign_to(ident("skipped"), int(99));
    let body = block(vec![incr, guard, oolong::Node::loop_stmt("", loc()), never]);
    let root = file(vec![
        def_assign("c", int(0), false),
        def_assign("skipped", int(0), false),
        repeat(body),
        ident("skipped"),
    ]);

    for opt in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let (result, ctx) = compile_and_run(&root, opt).unwrap();
        assert_eq!(result.get_i64().unwrap(), 0, "{opt}");
        assert_eq!(ctx.find_value("c").unwrap().get_i64().unwrap(), 5, "{opt}");
        assert_eq!(ctx.local_scope_count(), 0, "{opt}");
    }
    let (result, ctx) = eval_ast(&root).unwrap();
    assert_eq!(result.get_i64().unwrap(), 0);
    assert_eq!(ctx.find_value("c").unwrap().get_i64().unwrap(), 5);
}

/// Unknown identifiers surface the dedicated error kind in both modes.
#[test]
fn unknown_identifier_error() {
    let root = file(vec![ident("ghost")]);
    assert_eq!(eval_ast(&root).unwrap_err().kind(), ErrorKind::UnknownIdentifier);
    assert_eq!(
        compile_and_run(&root, OptLevel::O0).unwrap_err().kind(),
        ErrorKind::UnknownIdentifier
    );
}

/// Dot access creates elements on def-assign and renumbers on undef.
#[test]
fn dot_define_and_remove() {
    // def t := (); ... actually start from a keyed pair via def-assign on dot
    let mut t_key = oolong::Node::dot(loc());
    t_key.add_child(ptr(ident("t"))).unwrap();
    t_key.add_child(ptr(ident("name"))).unwrap();
    let mut def_elem = oolong::Node::assign(false, loc());
    let mut def = oolong::Node::def_op(oolong::DefKind::Def, loc());
    def.add_child(ptr(t_key)).unwrap();
    def_elem.add_child(ptr(def)).unwrap();
    def_elem.add_child(ptr(int(7))).unwrap();

    let mut read = oolong::Node::dot(loc());
    read.add_child(ptr(ident("t"))).unwrap();
    read.add_child(ptr(ident("name"))).unwrap();

    let root = file(vec![
        def_assign("t", tuple_expr(vec![int(1), int(2)]), false),
        def_elem,
        read,
    ]);
    for opt in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let (result, _) = compile_and_run(&root, opt).unwrap();
        assert_eq!(result.get_i64().unwrap(), 7, "{opt}");
    }
    let (result, _) = eval_ast(&root).unwrap();
    assert_eq!(result.get_i64().unwrap(), 7);

    // undef t.name removes the element again; a later is_defined sees false
    let make_dot = || {
        let mut dot = oolong::Node::dot(loc());
        dot.add_child(ptr(ident("t"))).unwrap();
        dot.add_child(ptr(ident("name"))).unwrap();
        dot
    };
    let mut def_elem = oolong::Node::assign(false, loc());
    let mut def = oolong::Node::def_op(oolong::DefKind::Def, loc());
    def.add_child(ptr(make_dot())).unwrap();
    def_elem.add_child(ptr(def)).unwrap();
    def_elem.add_child(ptr(int(7))).unwrap();
    let mut undef = oolong::Node::def_op(oolong::DefKind::Undef, loc());
    undef.add_child(ptr(make_dot())).unwrap();
    let mut isdef = oolong::Node::def_op(oolong::DefKind::IsDef, loc());
    isdef.add_child(ptr(make_dot())).unwrap();
    let root = file(vec![
        def_assign("t", tuple_expr(vec![int(1), int(2)]), false),
        def_elem,
        undef,
        isdef,
    ]);
    for opt in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let (result, _) = compile_and_run(&root, opt).unwrap();
        assert!(!result.get_bool().unwrap(), "{opt}");
    }
    let (result, _) = eval_ast(&root).unwrap();
    assert!(!result.get_bool().unwrap());
}
