#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked at the boundaries")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts mirror the two's-complement value model")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior is part of the arithmetic semantics")]
//! The execution core of an embeddable, dynamically-typed scripting
//! language: the value model with reference-counted sharing and
//! copy-on-detach semantics, the AST with direct evaluation, the bytecode
//! compiler with peephole optimization, the suspendable stack VM and the
//! coroutine engine multiplexing that VM into yield/resume flows.
//!
//! The textual parser and the standard library of built-in functions are
//! external collaborators: the core consumes a [`parse::Parser`] factory and
//! hosts register their functions through the [`Engine`].
//!
//! # Example
//!
//! ```
//! use oolong::{Constraints, Engine, Node, SourceLocation, Value};
//!
//! // 21 * 2, built programmatically (a parser would produce the same tree)
//! let loc = SourceLocation::default;
//! let mut mul = Node::binary(oolong::BinaryOp::Mul, loc());
//! mul.add_child(Node::constant(Value::from(21i64), loc()).into()).unwrap();
//! mul.add_child(Node::constant(Value::from(2i64), loc()).into()).unwrap();
//! let mut file = Node::file("demo", loc());
//! file.add_child(mul.into()).unwrap();
//!
//! let mut engine = Engine::new();
//! let program = engine.compile(&file).unwrap();
//! let result = engine.exec_program(&program, Constraints::None).unwrap();
//! assert_eq!(result.get_i64().unwrap(), 42);
//! ```

mod arithmetic;
mod ast;
mod compiler;
mod context;
mod control;
mod coroutine;
mod engine;
mod error;
mod func;
mod loc;
mod machine;
pub mod parse;
mod sequence;
mod tuple;
mod types;
mod value;

pub use crate::{
    arithmetic::{BinaryOp, BitOp, UnaryOp},
    ast::{AssignMode, DefKind, ExprMode, Node, NodeKind, NodePtr, TreeBuilder},
    compiler::{Compiler, OptLevel},
    context::{Context, Dialect},
    control::{EvalBreak, NodeResult},
    coroutine::{CoroutineEngine, CoroutineState},
    engine::{Engine, FeatureOptOut, LoadConfig, LoadLevel},
    error::{ErrorKind, EvalError, EvalResult},
    func::{Callable, CompiledFunc, FunctionPtr, LibraryFunc, ScriptFunc},
    loc::SourceLocation,
    machine::{
        CallStackEntry, Constraints, DEFAULT_TIME_GRANULARITY, Instruction, Machine, MachineError, OpCode, Program,
        ProgramPtr, State, SuspendFlag, combined_version,
    },
    sequence::IntegerSequence,
    tuple::Tuple,
    types::{TypeInfo, TypeSystem, TypeTag},
    value::{Buffer, PassthroughData, Value, ValueData},
};
