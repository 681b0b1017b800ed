//! Program image persistence: round-trips over the observable fields and
//! loader rejection of malformed images.

use oolong::{BinaryOp, Constraints, Context, Machine, OptLevel, Program};
use pretty_assertions::assert_eq;

use crate::common::*;

fn sample_program(opt: OptLevel) -> oolong::ProgramPtr {
    let root = file(vec![
        def_assign("x", int(40), false),
        assign_to(ident("x"), binary(BinaryOp::Plus, ident("x"), int(2))),
        ident("x"),
    ]);
    oolong::Compiler::new().compile(&root, opt).unwrap()
}

#[test]
fn save_load_roundtrip_over_observable_fields() {
    for opt in [OptLevel::Debug, OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let program = sample_program(opt);
        let bytes = program.save().unwrap();
        let loaded = Program::load(&bytes, false).unwrap();

        assert_eq!(loaded.name(), program.name());
        assert_eq!(loaded.opt_level(), program.opt_level());
        assert_eq!(loaded.compiler_version(), program.compiler_version());
        assert_eq!(loaded.instructions(), program.instructions());
    }
}

#[test]
fn loaded_program_still_runs() {
    let program = sample_program(OptLevel::O0);
    let bytes = program.save().unwrap();
    let loaded = std::rc::Rc::new(Program::load(&bytes, false).unwrap());

    let mut ctx = Context::new();
    let mut machine = Machine::new();
    machine.exec(&loaded, &mut ctx, Constraints::None).unwrap();
    machine.throw_possible_error().unwrap();
    assert_eq!(machine.take_result().unwrap().get_i64().unwrap(), 42);
}

/// Scenario 8: mutate the magic, loading fails with "wrong magic number".
#[test]
fn mutated_magic_is_rejected() {
    let program = sample_program(OptLevel::O0);
    let mut bytes = program.save().unwrap();
    bytes[4] ^= 0x01; // first magic byte sits after the ".tsb" tag
    let err = Program::load(&bytes, false).unwrap_err();
    assert!(err.message().contains("wrong magic number"), "{err}");
}

#[test]
fn header_only_load_reads_metadata() {
    let program = sample_program(OptLevel::O2);
    let bytes = program.save().unwrap();
    let header = Program::load(&bytes, true).unwrap();
    assert_eq!(header.name(), "test");
    assert_eq!(header.opt_level(), OptLevel::O2);
    assert!(header.is_empty());
}

#[test]
fn truncation_anywhere_is_rejected() {
    let bytes = sample_program(OptLevel::O0).save().unwrap();
    for cut in [3, 7, 11, 13, bytes.len() / 2, bytes.len() - 1] {
        assert!(Program::load(&bytes[..cut], false).is_err(), "cut at {cut}");
    }
}
