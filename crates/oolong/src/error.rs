use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

use crate::loc::SourceLocation;

/// Result type alias for operations that can produce a script-level error.
pub type EvalResult<T> = Result<T, EvalError>;

/// Classification of every error the core surfaces to the host.
///
/// Uses strum derives for automatic `Display`, `FromStr` and `Into<&'static str>`
/// implementations. The string representation is the kebab-case kind name
/// (e.g. `UnknownIdentifier` -> "unknown-identifier").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// Failure while producing an AST from source text.
    Parsing,
    /// A binary operator arrived without a usable left-hand side.
    LhsMissing,
    /// Failure while lowering an AST to instructions.
    Compile,
    /// Broken or incomplete script code detected during evaluation.
    Eval,
    /// Generic runtime failure (internal inconsistencies, bad host usage).
    Runtime,
    /// A value could not be interpreted as the requested type.
    BadValueCast,
    /// A program image or other artifact could not be loaded.
    LoadFile,
    /// `def` / `const` without an assignment in a dialect that forbids it.
    DeclareWithoutAssign,
    /// Write to a const binding or element.
    ConstAssign,
    /// Shared-assign of a const value into a mutable slot.
    ConstSharedAssign,
    /// A name was defined twice in the same scope, or a tuple key twice.
    Redefinition,
    /// A name did not resolve in any scope, or a tuple key was absent.
    UnknownIdentifier,
    /// Index outside a container, or a numeric range violation.
    OutOfRange,
    /// Assignment or operation across incompatible types.
    TypeMismatch,
    /// Integer division or modulo by zero.
    DivisionByZero,
    /// `mod` applied to a floating point operand.
    ModuloWithFloatingPoint,
    /// A numeric conversion would not fit the target type.
    IntegerOverflow,
    /// `suspend` / `yield` reached in AST-eval mode.
    SuspendStatement,
}

/// The error type surfaced by evaluation, compilation and program loading.
///
/// Carries a kind, a human readable message and an optional source location.
/// The location is attached at the innermost site that knows it; outer layers
/// only fill it in when still unset (see [`EvalError::with_location`]).
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    kind: ErrorKind,
    message: String,
    loc: SourceLocation,
}

impl EvalError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            loc: SourceLocation::default(),
        }
    }

    #[must_use]
    pub fn located(kind: ErrorKind, message: impl Into<String>, loc: SourceLocation) -> Self {
        Self {
            kind,
            message: message.into(),
            loc,
        }
    }

    /// Attaches a location if none is set yet. The innermost location wins.
    #[must_use]
    pub fn with_location(mut self, loc: &SourceLocation) -> Self {
        if !self.loc.is_set() && loc.is_set() {
            self.loc = loc.clone();
        }
        self
    }

    /// Overwrites the location even when one is already set.
    pub fn set_location(&mut self, loc: SourceLocation) {
        self.loc = loc;
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn location(&self) -> &SourceLocation {
        &self.loc
    }

    // --- constructors for the common kinds, matching their canonical wording ---

    #[must_use]
    pub fn parsing(message: impl Into<String>, loc: SourceLocation) -> Self {
        Self::located(ErrorKind::Parsing, message, loc)
    }

    #[must_use]
    pub fn compile(message: impl Into<String>, loc: SourceLocation) -> Self {
        Self::located(ErrorKind::Compile, message, loc)
    }

    #[must_use]
    pub fn eval(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Eval, message)
    }

    #[must_use]
    pub fn eval_at(message: impl Into<String>, loc: SourceLocation) -> Self {
        Self::located(ErrorKind::Eval, message, loc)
    }

    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    #[must_use]
    pub fn bad_value_cast(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadValueCast, message)
    }

    #[must_use]
    pub fn load_file(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LoadFile, message)
    }

    #[must_use]
    pub fn declare_without_assign(name: &str, loc: SourceLocation) -> Self {
        Self::located(
            ErrorKind::DeclareWithoutAssign,
            format!("declaration of \"{name}\" without assignment is not allowed"),
            loc,
        )
    }

    #[must_use]
    pub fn const_assign() -> Self {
        Self::new(ErrorKind::ConstAssign, "value is const, cannot assign")
    }

    #[must_use]
    pub fn const_shared_assign() -> Self {
        Self::new(
            ErrorKind::ConstSharedAssign,
            "cannot share-assign a const value into a mutable variable",
        )
    }

    #[must_use]
    pub fn redefinition(name: &str) -> Self {
        Self::new(ErrorKind::Redefinition, format!("redefinition of \"{name}\""))
    }

    #[must_use]
    pub fn unknown_identifier(name: &str) -> Self {
        Self::new(ErrorKind::UnknownIdentifier, format!("unknown identifier \"{name}\""))
    }

    #[must_use]
    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfRange, message)
    }

    #[must_use]
    pub fn type_mismatch() -> Self {
        Self::new(ErrorKind::TypeMismatch, "types mismatch")
    }

    #[must_use]
    pub fn division_by_zero() -> Self {
        Self::new(ErrorKind::DivisionByZero, "division by zero")
    }

    #[must_use]
    pub fn modulo_with_floating_point() -> Self {
        Self::new(
            ErrorKind::ModuloWithFloatingPoint,
            "modulo is not defined for floating point operands",
        )
    }

    #[must_use]
    pub fn integer_overflow(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IntegerOverflow, message)
    }

    #[must_use]
    pub fn suspend_statement(loc: SourceLocation) -> Self {
        Self::located(
            ErrorKind::SuspendStatement,
            "suspend/yield statement is only supported for compiled programs",
            loc,
        )
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if self.loc.is_set() {
            write!(f, " (at {})", self.loc)?;
        }
        Ok(())
    }
}

impl std::error::Error for EvalError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_kebab_case() {
        assert_eq!(ErrorKind::UnknownIdentifier.to_string(), "unknown-identifier");
        assert_eq!(ErrorKind::ConstSharedAssign.to_string(), "const-shared-assign");
        assert_eq!(
            "modulo-with-floating-point".parse::<ErrorKind>().unwrap(),
            ErrorKind::ModuloWithFloatingPoint
        );
    }

    #[test]
    fn innermost_location_wins() {
        let inner = SourceLocation::line(3);
        let outer = SourceLocation::line(9);
        let err = EvalError::division_by_zero()
            .with_location(&inner)
            .with_location(&outer);
        assert_eq!(err.location().start_line(), 3);
    }

    #[test]
    fn display_carries_kind_and_location() {
        let err = EvalError::eval_at("broken", SourceLocation::at(2, 5));
        assert_eq!(err.to_string(), "eval: broken (at 2:5)");
    }
}
