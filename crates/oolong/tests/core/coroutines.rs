//! Coroutine flows: yield/resume, pre-seeded state, input parameters and
//! constraint-driven suspension.

use oolong::{BinaryOp, Constraints, Context, CoroutineEngine, CoroutineState, OptLevel, Value};
use pretty_assertions::assert_eq;

use crate::common::*;

/// Scenario 6: `repeat { yield c; c := c + 1 }` with `c := 0` pre-seeded;
/// four resumes yield 0, 1, 2, 3, each leaving the coroutine suspended.
#[test]
fn scenario_6_pre_seeded_counter() {
    let body = block(vec![
        yield_stmt(ident("c")),
        assign_to(ident("c"), binary(BinaryOp::Plus, ident("c"), int(1))),
    ]);
    let root = file(vec![repeat(body)]);
    let program = oolong::Compiler::new().compile(&root, OptLevel::O0).unwrap();

    let mut ctx = Context::new();
    ctx.add_value("c", Value::from(0i64).shared()).unwrap();
    let mut engine = CoroutineEngine::with_context(ctx);
    engine.change_coroutine(program).unwrap();

    for expected in 0..4i64 {
        let value = engine.run().unwrap();
        assert_eq!(value.get_i64().unwrap(), expected);
        assert_eq!(engine.state(), CoroutineState::Suspended);
    }
}

#[test]
fn constraint_budget_preempts_between_yields() {
    // a coroutine that never yields: the host budget is the only brake
    let body = block(vec![assign_to(
        ident("c"),
        binary(BinaryOp::Plus, ident("c"), int(1)),
    )]);
    let root = file(vec![def_assign("c", int(0), false), repeat(body)]);
    let program = oolong::Compiler::new().compile(&root, OptLevel::O0).unwrap();

    let mut engine = CoroutineEngine::with_program(program).unwrap();
    for _ in 0..3 {
        engine.run_for(Constraints::max_instructions(50)).unwrap();
        assert!(engine.can_be_continued());
    }
}

#[test]
fn suspend_statement_suspends_the_coroutine() {
    let root = file(vec![
        def_assign("stage", int(1), false),
        oolong::Node::suspend_stmt(loc()),
        assign_to(ident("stage"), int(2)),
        ident("stage"),
    ]);
    let program = oolong::Compiler::new().compile(&root, OptLevel::O0).unwrap();
    let mut engine = CoroutineEngine::with_program(program).unwrap();

    let first = engine.run().unwrap();
    assert_eq!(engine.state(), CoroutineState::Suspended);
    // a suspend (unlike yield) transports no value
    assert_eq!(first.data_tag(), oolong::TypeTag::NaV);

    let second = engine.run().unwrap();
    assert!(engine.is_finished());
    assert_eq!(second.get_i64().unwrap(), 2);
}

#[test]
fn input_parameters_between_resumes() {
    // yield args[0] twice, with fresh inputs injected before each resume
    let stmt = |_: usize| yield_stmt(subscript(ident("args"), int(0)));
    let root = file(vec![stmt(0), stmt(1), int(0)]);
    let program = oolong::Compiler::new().compile(&root, OptLevel::O0).unwrap();

    let mut engine = CoroutineEngine::with_program(program).unwrap();
    engine.set_input_parameters(vec![Value::from(10i64)]).unwrap();
    assert_eq!(engine.run().unwrap().get_i64().unwrap(), 10);
    engine.set_input_parameters(vec![Value::from(20i64)]).unwrap();
    assert_eq!(engine.run().unwrap().get_i64().unwrap(), 20);
}

#[test]
fn halted_coroutine_reports_the_error() {
    // O0 does not fold, so the division stays a runtime error
    let root = file(vec![binary(BinaryOp::Div, int(1), int(0))]);
    let program = oolong::Compiler::new().compile(&root, OptLevel::O0).unwrap();
    let mut engine = CoroutineEngine::with_program(program).unwrap();
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), oolong::ErrorKind::DivisionByZero);
    assert_eq!(engine.state(), CoroutineState::Halted);
    assert!(!engine.can_be_continued());
}

#[test]
fn cross_thread_suspend_request() {
    // a busy loop; another thread requests the suspend
    let body = block(vec![assign_to(
        ident("c"),
        binary(BinaryOp::Plus, ident("c"), int(1)),
    )]);
    let root = file(vec![def_assign("c", int(0), false), repeat(body)]);
    let program = oolong::Compiler::new().compile(&root, OptLevel::O0).unwrap();
    let mut engine = CoroutineEngine::with_program(program).unwrap();
    assert!(engine.is_suspend_request_possible());

    let handle = engine.suspend_handle().unwrap();
    let requester = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        handle.request()
    });
    engine.run().unwrap();
    assert!(requester.join().unwrap());
    assert_eq!(engine.state(), CoroutineState::Suspended);
}
