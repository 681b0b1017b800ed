//! Mode-equivalence and optimizer-soundness properties: for every program in
//! the battery, AST-eval and bytecode execution at every optimization level
//! produce the same observable result, and the machine ends balanced.

use oolong::{BinaryOp, BitOp, Node, OptLevel, UnaryOp};
use pretty_assertions::assert_eq;

use crate::common::*;

fn unary(op: UnaryOp, operand: Node) -> Node {
    let mut node = Node::unary(op, loc());
    node.add_child(ptr(operand)).unwrap();
    node
}

fn bit(op: BitOp, lhs: Node, rhs: Node) -> Node {
    let mut node = Node::bit(op, loc());
    node.add_child(ptr(lhs)).unwrap();
    node.add_child(ptr(rhs)).unwrap();
    node
}

/// The program battery; each entry builds a fresh tree.
fn battery() -> Vec<(&'static str, Box<dyn Fn() -> Node>)> {
    vec![
        ("arith_mixed", Box::new(|| {
            file(vec![binary(
                BinaryOp::Minus,
                binary(BinaryOp::Mul, int(6), int(7)),
                binary(BinaryOp::Div, int(10), int(5)),
            )])
        })),
        ("float_promotion", Box::new(|| {
            file(vec![binary(
                BinaryOp::Div,
                int(1),
                Node::constant(oolong::Value::from(2.0f64), loc()),
            )])
        })),
        ("string_concat", Box::new(|| {
            file(vec![binary(
                BinaryOp::StringConcat,
                Node::constant(oolong::Value::from("n = "), loc()),
                int(5),
            )])
        })),
        ("comparisons", Box::new(|| {
            file(vec![binary(
                BinaryOp::LogicalAnd,
                binary(BinaryOp::Lt, int(1), int(2)),
                binary(BinaryOp::Ne, int(3), int(4)),
            )])
        })),
        ("unary_chain", Box::new(|| {
            file(vec![unary(
                UnaryOp::Minus,
                binary(BinaryOp::Plus, int(20), unary(UnaryOp::Minus, int(62))),
            )])
        })),
        ("bit_ops", Box::new(|| {
            file(vec![bit(
                BitOp::Or,
                bit(BitOp::And, int(0b1100), int(0b1010)),
                bit(BitOp::Lsh, int(1), int(4)),
            )])
        })),
        ("typename_typeof", Box::new(|| {
            file(vec![unary(UnaryOp::Typename, int(1))])
        })),
        ("variables_and_blocks", Box::new(|| {
            file(vec![
                def_assign("x", int(2), false),
                block(vec![def_assign("y", int(3), false), assign_to(
                    ident("x"),
                    binary(BinaryOp::Mul, ident("x"), ident("y")),
                )]),
                ident("x"),
            ])
        })),
        ("if_else_chain", Box::new(|| {
            let mut else_node = Node::else_stmt(loc());
            else_node.add_child(ptr(block(vec![int(2)]))).unwrap();
            let mut if_node = if_then(
                binary(BinaryOp::Gt, int(1), int(5)),
                block(vec![int(1)]),
            );
            if_node.add_child(ptr(else_node)).unwrap();
            file(vec![if_node])
        })),
        ("loop_with_counter", Box::new(|| {
            let incr = assign_to(ident("c"), binary(BinaryOp::Plus, ident("c"), int(1)));
            let stop = Node::stop("", false, loc());
            let guard = if_then(binary(BinaryOp::Ge, ident("c"), int(5)), block(vec![stop]));
            file(vec![
                def_assign("c", int(0), false),
                repeat(block(vec![incr, guard])),
                ident("c"),
            ])
        })),
        ("tuple_literal_and_access", Box::new(|| {
            file(vec![
                def_assign("t", tuple_expr(vec![int(10), int(20), int(30)]), false),
                binary(
                    BinaryOp::Plus,
                    subscript(ident("t"), int(0)),
                    subscript(ident("t"), int(2)),
                ),
            ])
        })),
        ("forall_sum", Box::new(|| {
            let seq = oolong::IntegerSequence::new(1, 5, 2).unwrap();
            let add = assign_to(ident("s"), binary(BinaryOp::Plus, ident("s"), ident("i")));
            let mut forall = Node::forall("", loc());
            forall.add_child(ptr(ident("i"))).unwrap();
            forall
                .add_child(ptr(Node::constant(oolong::Value::sequence(seq), loc())))
                .unwrap();
            forall.add_child(ptr(block(vec![add]))).unwrap();
            file(vec![def_assign("s", int(0), false), forall, ident("s")])
        })),
    ]
}

#[test]
fn ast_eval_and_all_opt_levels_agree() {
    for (name, build) in battery() {
        let (ast_result, ast_ctx) = eval_ast(&build()).unwrap_or_else(|e| panic!("{name} (ast): {e}"));
        assert_eq!(ast_ctx.local_scope_count(), 0, "{name} (ast) scope balance");
        let expected = ast_result.print_value();

        for opt in [OptLevel::Debug, OptLevel::O0, OptLevel::O1, OptLevel::O2] {
            let (vm_result, vm_ctx) =
                compile_and_run(&build(), opt).unwrap_or_else(|e| panic!("{name} ({opt}): {e}"));
            assert_eq!(vm_result.print_value(), expected, "{name} at {opt}");
            assert_eq!(vm_ctx.local_scope_count(), 0, "{name} ({opt}) scope balance");
        }
    }
}

#[test]
fn errors_agree_between_modes() {
    let programs: Vec<(&str, Node, oolong::ErrorKind)> = vec![
        (
            "division_by_zero",
            file(vec![def_assign("z", int(0), false), binary(BinaryOp::Div, int(1), ident("z"))]),
            oolong::ErrorKind::DivisionByZero,
        ),
        (
            "modulo_float",
            file(vec![binary(
                BinaryOp::Mod,
                Node::constant(oolong::Value::from(1.5f64), loc()),
                int(2),
            )]),
            oolong::ErrorKind::ModuloWithFloatingPoint,
        ),
        (
            "shift_too_far",
            file(vec![{
                let mut node = Node::bit(BitOp::Lsh, loc());
                node.add_child(ptr(int(1))).unwrap();
                node.add_child(ptr(int(64))).unwrap();
                node
            }]),
            oolong::ErrorKind::OutOfRange,
        ),
    ];
    for (name, root, kind) in programs {
        assert_eq!(eval_ast(&root).unwrap_err().kind(), kind, "{name} (ast)");
        // folding surfaces the same error at compile time under O1; O0 keeps
        // it at runtime
        assert_eq!(compile_and_run(&root, OptLevel::O0).unwrap_err().kind(), kind, "{name} (vm)");
    }
}

#[test]
fn debug_level_only_adds_noise() {
    let root = file(vec![
        def_assign("x", int(1), false),
        assign_to(ident("x"), binary(BinaryOp::Plus, ident("x"), int(1))),
        ident("x"),
    ]);
    let plain = oolong::Compiler::new().compile(&root, OptLevel::O0).unwrap();
    let debug = oolong::Compiler::new().compile(&root, OptLevel::Debug).unwrap();
    // debug mode is a superset: more (no-op) instructions, same result
    assert!(debug.len() >= plain.len());
    let (a, _) = compile_and_run(&root, OptLevel::O0).unwrap();
    let (b, _) = compile_and_run(&root, OptLevel::Debug).unwrap();
    assert_eq!(a.print_value(), b.print_value());
}
