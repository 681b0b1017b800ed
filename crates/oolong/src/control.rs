use crate::{error::EvalError, value::Value};

/// Non-local control flow raised during AST evaluation, bubbling up through
/// `Result` until the matching node consumes it. Mirrors the control
/// statements of the language: `stop`, `loop`, `return` and `_Exit`.
///
/// Errors travel the same channel so a single `?` propagates both.
#[derive(Debug)]
pub enum EvalBreak {
    /// `stop [with <expr>]`: terminates the matching labelled loop.
    StopLoop { label: String, result: Value },
    /// `loop`: jumps back to the head of the matching labelled loop.
    LoopToHead { label: String },
    /// `return [with] <expr>`: leaves the current function.
    Return(Value),
    /// `_Exit [with] <expr>`: leaves the whole script (a normal termination).
    Exit(Value),
    /// An actual error.
    Error(EvalError),
}

impl From<EvalError> for EvalBreak {
    fn from(err: EvalError) -> Self {
        Self::Error(err)
    }
}

impl EvalBreak {
    /// Converts into a plain error; control signals that escaped to a place
    /// where they are not allowed become eval errors.
    #[must_use]
    pub fn into_error(self) -> EvalError {
        match self {
            Self::Error(err) => err,
            Self::StopLoop { label, .. } => EvalError::eval(if label.is_empty() {
                "no matching loop for stop statement found".to_string()
            } else {
                format!("no matching loop for stop statement found, label \"{label}\"")
            }),
            Self::LoopToHead { label } => EvalError::eval(if label.is_empty() {
                "no matching loop for loop statement found".to_string()
            } else {
                format!("no matching loop for loop statement found, label \"{label}\"")
            }),
            Self::Return(_) => EvalError::eval("return statement outside of a function"),
            Self::Exit(_) => EvalError::eval("exit statement escaped the script"),
        }
    }
}

/// Result of evaluating one AST node.
pub type NodeResult = Result<Value, EvalBreak>;
