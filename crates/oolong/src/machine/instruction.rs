use std::fmt;

use num_enum::TryFromPrimitive;
use strum::{Display, EnumString, IntoStaticStr};

use crate::value::{Value, ValueData};

/// All opcodes of the stack VM.
///
/// The numeric values are part of the program image format; new opcodes go at
/// the end. `NotImplemented` keeps its all-ones value so that a default
/// initialized image region reads as halting instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, TryFromPrimitive)]
#[repr(u32)]
pub enum OpCode {
    /// (emergency) halt of the machine.
    Halt = 0,
    /// Same as NoOp but marking the regular program end.
    ProgramEnd = 1,
    /// Filler/placeholder, no effect.
    NoOp = 2,
    /// A NoOp that pushes a NaV, equivalent to `Push NaV`.
    NoOpNav = 3,
    /// Debug-build marker carrying a name; no effect at runtime.
    Debug = 4,
    ExprStart = 5,
    ExprEnd = 6,
    If = 7,
    Else = 8,
    RepeatStart = 9,
    RepeatEnd = 10,
    /// Pushes the payload constant.
    Push = 11,
    /// Pops one value.
    Pop = 12,
    /// Replaces the top of the stack with the payload (Pop+Push).
    Replace = 13,
    /// Swaps the two topmost values.
    Swap = 14,
    /// Loads the variable named by the payload and pushes it.
    Load = 15,
    /// Stores into an existing variable (payload: shared assign?).
    Stor = 16,
    /// Defines a mutable variable (payload: shared assign?).
    DefVar = 17,
    /// Defines a const variable (payload: shared assign?).
    ConstVar = 18,
    /// Defines a variable taking const/mutable from the origin (payload: shared?).
    AutoVar = 19,
    /// Undefines the variable named by the payload.
    UndefVar = 20,
    /// `is_defined` for the variable named by the payload.
    IsDef = 21,
    /// Creates a tuple from the top N stack values (payload: N).
    MakeTuple = 22,
    /// Writes top into element top-1 of tuple top-2 (payload: shared?).
    SetElement = 23,
    /// Creates a mutable element (payload: shared?).
    DefElement = 24,
    /// Creates a const element (payload: shared?).
    ConstElement = 25,
    /// `is_defined` for a tuple element (payload: key or index).
    IsDefElement = 26,
    /// Removes a tuple element (payload: key or index).
    UndefElement = 27,
    /// Subscript read.
    SubscriptGet = 28,
    /// Subscript write (payload: shared?).
    SubscriptSet = 29,
    /// Unary operation (payload: operation ordinal).
    UnaryOp = 30,
    /// Binary operation (payload: operation ordinal).
    BinaryOp = 31,
    /// The `is` type test.
    IsType = 32,
    /// The `as` type conversion.
    AsType = 33,
    /// Bit operation (payload: operation ordinal).
    BitOp = 34,
    /// Tuple element access by name or index from the stack.
    DotOp = 35,
    /// Opens a new local scope.
    EnterScope = 36,
    /// Closes the most recent local scope.
    ExitScope = 37,
    /// Converts the top of the stack to Bool.
    Test = 38,
    /// Unconditional relative jump (payload: offset).
    JumpRel = 39,
    /// Relative jump when the popped-as-bool top is true.
    JumpRelIf = 40,
    /// Relative jump when the popped-as-bool top is false.
    JumpRelIfNot = 41,
    /// Test + jump when true, keeping the Bool on the stack.
    TestAndJumpRelIf = 42,
    /// Test + jump when false, keeping the Bool on the stack.
    TestAndJumpRelIfNot = 43,
    /// Prepares a forall loop (payload: offset past the loop for an empty
    /// iterable).
    ForallHead = 44,
    /// Advances a forall loop (payload: offset past the loop on exhaustion).
    ForallNext = 45,
    /// Calls the function object below the arguments (payload: display name).
    CallFunc = 46,
    /// Debug marker for a parameter list.
    ParamList = 47,
    /// Defines a function whose body follows (payload: name or `<lambda>`).
    FuncDef = 48,
    /// Returns from the current subroutine frame.
    Ret = 49,
    /// Starts the parameter specification (payload: parameter count).
    ParamSpec = 50,
    /// Verifies the parameter queue is empty and tears the work area down.
    ParamSpecClean = 51,
    /// Binds the next pending argument.
    FromParam = 52,
    /// Binds the next pending argument or falls through to the default
    /// expression (payload: offset over the default code).
    FromParamOr = 53,
    /// Exits the program: unwinds scopes, clears the stack, carries a result.
    ExitProgram = 54,
    /// Suspends the program (unless constraints auto-continue).
    Suspend = 55,
    /// Suspends the program carrying the top of the stack as yielded value.
    Yield = 56,
    /// Reserved by the image format, halts with NotImplemented when executed.
    Catch = 57,
    /// Compilation placeholder, halts the machine.
    NotImplemented = u32::MAX,
}

/// One instruction: opcode plus optional payload value. Payloads are inline
/// primitives or strings; `MakeTuple`/`ParamSpec` carry counts, jumps carry
/// relative offsets, the variable group carries names or shared-assign flags.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: OpCode,
    pub payload: Value,
}

impl Instruction {
    #[must_use]
    pub fn new(op: OpCode, payload: Value) -> Self {
        Self { op, payload }
    }

    /// An instruction with a NaV payload.
    #[must_use]
    pub fn bare(op: OpCode) -> Self {
        Self {
            op,
            payload: Value::nav(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.data_tag() == crate::types::TypeTag::NaV {
            write!(f, "{}", self.op)
        } else {
            write!(f, "{} {}", self.op, self.payload.print_value())
        }
    }
}

impl PartialEq for Instruction {
    /// Structural equality over opcode and payload. Only the persistable
    /// payload variants compare by content; others never compare equal.
    fn eq(&self, other: &Self) -> bool {
        if self.op != other.op {
            return false;
        }
        self.payload.with_data(|a| {
            other.payload.with_data(|b| match (a, b) {
                (ValueData::NaV, ValueData::NaV) => true,
                (ValueData::Bool(x), ValueData::Bool(y)) => x == y,
                (ValueData::U8(x), ValueData::U8(y)) => x == y,
                (ValueData::I64(x), ValueData::I64(y)) => x == y,
                (ValueData::U64(x), ValueData::U64(y)) => x == y,
                (ValueData::F64(x), ValueData::F64(y)) => x.to_bits() == y.to_bits(),
                (ValueData::String(x), ValueData::String(y)) => x == y,
                _ => false,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_are_stable() {
        assert_eq!(OpCode::Halt as u32, 0);
        assert_eq!(OpCode::Push as u32, 11);
        assert_eq!(OpCode::Yield as u32, 56);
        assert_eq!(OpCode::try_from(46u32).unwrap(), OpCode::CallFunc);
        assert!(OpCode::try_from(1234u32).is_err());
    }

    #[test]
    fn instruction_equality_is_structural() {
        let a = Instruction::new(OpCode::Push, Value::from(1i64));
        let b = Instruction::new(OpCode::Push, Value::from(1i64));
        let c = Instruction::new(OpCode::Push, Value::from(2i64));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Instruction::bare(OpCode::Push));
        assert_eq!(Instruction::bare(OpCode::Pop), Instruction::bare(OpCode::Pop));
    }
}
