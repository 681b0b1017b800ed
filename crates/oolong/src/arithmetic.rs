//! Type promotion rules and checked operations shared by AST evaluation and
//! the VM. Both execution paths call into these functions, which keeps the two
//! modes observationally identical.

use std::cmp::Ordering;

use num_enum::TryFromPrimitive;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    error::{ErrorKind, EvalError, EvalResult},
    types::TypeTag,
    value::{Value, ValueData},
};

/// Unary operations. Discriminants are stable, they travel as instruction
/// payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, TryFromPrimitive)]
#[repr(u64)]
pub enum UnaryOp {
    #[strum(serialize = "not")]
    LogicalNot = 0,
    #[strum(serialize = "bit_not")]
    BitNot = 1,
    #[strum(serialize = "-")]
    Minus = 2,
    #[strum(serialize = "+")]
    Plus = 3,
    #[strum(serialize = "@?")]
    ShareCount = 4,
    #[strum(serialize = "typename")]
    Typename = 5,
    #[strum(serialize = "typeof")]
    Typeof = 6,
}

/// Binary operations (without the bit group, which has its own opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, TryFromPrimitive)]
#[repr(u64)]
pub enum BinaryOp {
    #[strum(serialize = "and")]
    LogicalAnd = 0,
    #[strum(serialize = "or")]
    LogicalOr = 1,
    #[strum(serialize = "+")]
    Plus = 2,
    #[strum(serialize = "-")]
    Minus = 3,
    #[strum(serialize = "*")]
    Mul = 4,
    #[strum(serialize = "/")]
    Div = 5,
    #[strum(serialize = "mod")]
    Mod = 6,
    #[strum(serialize = "lt")]
    Lt = 7,
    #[strum(serialize = "le")]
    Le = 8,
    #[strum(serialize = "gt")]
    Gt = 9,
    #[strum(serialize = "ge")]
    Ge = 10,
    #[strum(serialize = "eq")]
    Eq = 11,
    #[strum(serialize = "ne")]
    Ne = 12,
    #[strum(serialize = "@@")]
    Shared = 13,
    #[strum(serialize = "%")]
    StringConcat = 14,
}

impl BinaryOp {
    /// Operator precedence, following the C++ conventions the language uses.
    #[must_use]
    pub fn precedence(self) -> i32 {
        match self {
            Self::Mul | Self::Div | Self::Mod => 5,
            Self::Plus | Self::Minus => 6,
            Self::StringConcat => 7,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 9,
            Self::Eq | Self::Ne => 10,
            Self::LogicalAnd => 14,
            Self::LogicalOr => 15,
            Self::Shared => 17,
        }
    }
}

/// Bit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, TryFromPrimitive)]
#[repr(u64)]
pub enum BitOp {
    #[strum(serialize = "bit_and")]
    And = 0,
    #[strum(serialize = "bit_or")]
    Or = 1,
    #[strum(serialize = "bit_xor")]
    Xor = 2,
    #[strum(serialize = "bit_lsh")]
    Lsh = 3,
    #[strum(serialize = "bit_rsh")]
    Rsh = 4,
}

impl BitOp {
    /// C++ precedence: shifts 7, `&` 11, `^` 12, `|` 13.
    #[must_use]
    pub fn precedence(self) -> i32 {
        match self {
            Self::Lsh | Self::Rsh => 7,
            Self::And => 11,
            Self::Xor => 12,
            Self::Or => 13,
        }
    }
}

/// Numeric operand after extraction from a value. Non-numeric values fall
/// back to their i64 conversion (strings parse, bools widen).
#[derive(Debug, Clone, Copy)]
enum Num {
    U8(u8),
    I64(i64),
    U64(u64),
    F64(f64),
}

fn extract_num(value: &Value) -> EvalResult<Num> {
    value.with_data(|data| match data {
        ValueData::U8(v) => Ok(Num::U8(*v)),
        ValueData::I64(v) => Ok(Num::I64(*v)),
        ValueData::U64(v) => Ok(Num::U64(*v)),
        ValueData::F64(v) => Ok(Num::F64(*v)),
        _ => Ok(Num::I64(value.get_as_integer()?)),
    })
}

/// The type a mixed pair computes and results in: floats always win, then the
/// widest unsigned, then i64, then u8. Mixed signed/unsigned of equal width
/// computes unsigned with two's-complement reinterpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Promoted {
    U8,
    I64,
    U64,
    F64,
}

fn promote(a: Num, b: Num) -> Promoted {
    let rank = |n: Num| match n {
        Num::U8(_) => Promoted::U8,
        Num::I64(_) => Promoted::I64,
        Num::U64(_) => Promoted::U64,
        Num::F64(_) => Promoted::F64,
    };
    let (ra, rb) = (rank(a), rank(b));
    if ra == Promoted::F64 || rb == Promoted::F64 {
        Promoted::F64
    } else if ra == Promoted::U64 || rb == Promoted::U64 {
        Promoted::U64
    } else if ra == Promoted::I64 || rb == Promoted::I64 {
        Promoted::I64
    } else {
        Promoted::U8
    }
}

fn as_u8(n: Num) -> u8 {
    match n {
        Num::U8(v) => v,
        Num::I64(v) => v as u8,
        Num::U64(v) => v as u8,
        Num::F64(v) => v as u8,
    }
}

fn as_i64(n: Num) -> i64 {
    match n {
        Num::U8(v) => i64::from(v),
        Num::I64(v) => v,
        Num::U64(v) => v as i64,
        Num::F64(v) => v as i64,
    }
}

fn as_u64(n: Num) -> u64 {
    match n {
        Num::U8(v) => u64::from(v),
        Num::I64(v) => v as u64,
        Num::U64(v) => v,
        Num::F64(v) => v as u64,
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::U8(v) => f64::from(v),
        Num::I64(v) => v as f64,
        Num::U64(v) => v as f64,
        Num::F64(v) => v,
    }
}

macro_rules! int_binary {
    ($kind:expr, $a:expr, $b:expr, $wrap_op:ident) => {
        match $kind {
            Promoted::U8 => Ok(Value::from(as_u8($a).$wrap_op(as_u8($b)))),
            Promoted::I64 => Ok(Value::from(as_i64($a).$wrap_op(as_i64($b)))),
            Promoted::U64 => Ok(Value::from(as_u64($a).$wrap_op(as_u64($b)))),
            Promoted::F64 => unreachable!("float handled before integer dispatch"),
        }
    };
}

/// Applies `+ - * / mod` with the promotion rules above.
pub fn apply_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    let a = extract_num(lhs)?;
    let b = extract_num(rhs)?;
    let kind = promote(a, b);

    if kind == Promoted::F64 {
        let (x, y) = (as_f64(a), as_f64(b));
        return match op {
            BinaryOp::Plus => Ok(Value::from(x + y)),
            BinaryOp::Minus => Ok(Value::from(x - y)),
            BinaryOp::Mul => Ok(Value::from(x * y)),
            BinaryOp::Div => Ok(Value::from(x / y)),
            BinaryOp::Mod => Err(EvalError::modulo_with_floating_point()),
            _ => Err(EvalError::eval("operator is not an arithmetic operation")),
        };
    }

    match op {
        BinaryOp::Plus => int_binary!(kind, a, b, wrapping_add),
        BinaryOp::Minus => int_binary!(kind, a, b, wrapping_sub),
        BinaryOp::Mul => int_binary!(kind, a, b, wrapping_mul),
        BinaryOp::Div => {
            if is_int_zero(b, kind) {
                return Err(EvalError::division_by_zero());
            }
            int_binary!(kind, a, b, wrapping_div)
        }
        BinaryOp::Mod => {
            if is_int_zero(b, kind) {
                return Err(EvalError::division_by_zero());
            }
            int_binary!(kind, a, b, wrapping_rem)
        }
        _ => Err(EvalError::eval("operator is not an arithmetic operation")),
    }
}

fn is_int_zero(n: Num, kind: Promoted) -> bool {
    match kind {
        Promoted::U8 => as_u8(n) == 0,
        Promoted::I64 => as_i64(n) == 0,
        Promoted::U64 => as_u64(n) == 0,
        Promoted::F64 => false,
    }
}

/// Applies unary `-` / `+`, keeping the operand's type.
pub fn apply_unary(op: UnaryOp, operand: &Value) -> EvalResult<Value> {
    let n = extract_num(operand)?;
    let negate = matches!(op, UnaryOp::Minus);
    Ok(match n {
        Num::U8(v) => Value::from(if negate { v.wrapping_neg() } else { v }),
        Num::I64(v) => Value::from(if negate { v.wrapping_neg() } else { v }),
        Num::U64(v) => Value::from(if negate { v.wrapping_neg() } else { v }),
        Num::F64(v) => Value::from(if negate { -v } else { v }),
    })
}

/// Bitwise complement, keeping the operand's integer type.
pub fn apply_bit_not(operand: &Value) -> EvalResult<Value> {
    let n = extract_num(operand)?;
    Ok(match n {
        Num::U8(v) => Value::from(!v),
        Num::I64(v) => Value::from(!v),
        Num::U64(v) => Value::from(!v),
        Num::F64(v) => Value::from(!(v as i64)),
    })
}

/// `bit_and` / `bit_or` / `bit_xor` with integer promotion.
pub fn apply_bit_logic(op: BitOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    let a = extract_num(lhs)?;
    let b = extract_num(rhs)?;
    let kind = match promote(a, b) {
        Promoted::F64 => Promoted::I64, // floats fall back to their integer conversion
        other => other,
    };
    match op {
        BitOp::And => int_binary!(kind, a, b, bitand_wrap),
        BitOp::Or => int_binary!(kind, a, b, bitor_wrap),
        BitOp::Xor => int_binary!(kind, a, b, bitxor_wrap),
        BitOp::Lsh | BitOp::Rsh => apply_bitshift(lhs, rhs, op == BitOp::Lsh),
    }
}

// thin wrappers so the int_binary! macro can name one method for all widths
trait BitWrap {
    fn bitand_wrap(self, rhs: Self) -> Self;
    fn bitor_wrap(self, rhs: Self) -> Self;
    fn bitxor_wrap(self, rhs: Self) -> Self;
}

macro_rules! impl_bit_wrap {
    ($($t:ty),*) => {$(
        impl BitWrap for $t {
            fn bitand_wrap(self, rhs: Self) -> Self { self & rhs }
            fn bitor_wrap(self, rhs: Self) -> Self { self | rhs }
            fn bitxor_wrap(self, rhs: Self) -> Self { self ^ rhs }
        }
    )*};
}
impl_bit_wrap!(u8, i64, u64);

/// Shifts: arithmetic on i64, logical on the unsigned types. The shift amount
/// must be strictly smaller than the operand's bit width.
pub fn apply_bitshift(lhs: &Value, rhs: &Value, left: bool) -> EvalResult<Value> {
    let amount = convert_to_u8(rhs)?;
    let too_big = |width: u32| {
        EvalError::out_of_range(format!(
            "bitshift amount {amount} is too big for a {width} bit operand"
        ))
    };
    lhs.with_data(|data| match data {
        ValueData::U8(v) => {
            if amount >= 8 {
                return Err(too_big(8));
            }
            Ok(Value::from(if left { v << amount } else { v >> amount }))
        }
        ValueData::U64(v) => {
            if amount >= 64 {
                return Err(too_big(64));
            }
            Ok(Value::from(if left { v << amount } else { v >> amount }))
        }
        ValueData::I64(v) => {
            if amount >= 64 {
                return Err(too_big(64));
            }
            // >> on i64 is an arithmetic shift
            Ok(Value::from(if left { v << amount } else { v >> amount }))
        }
        _ => Err(EvalError::new(
            ErrorKind::TypeMismatch,
            "bitshift is only possible for U8, u64 and i64",
        )),
    })
}

fn convert_to_u8(value: &Value) -> EvalResult<u8> {
    let n = extract_num(value)?;
    match n {
        // converting between the integer widths reinterprets two's complement,
        // floats are range checked
        Num::F64(v) => num_traits::cast::<f64, u8>(v)
            .ok_or_else(|| EvalError::integer_overflow(format!("{v} does not fit into U8"))),
        other => Ok(as_u8(other)),
    }
}

/// Total ordering of two values, implementing the full comparison ladder:
/// NaV first, floats, sign-correct integers, bools, strings, tuples, buffers,
/// type values; everything else refuses with `bad-value-cast`.
pub fn compare(lhs: &Value, rhs: &Value) -> EvalResult<Ordering> {
    // declared NaV compares equal to itself and below everything else
    let lnav_type = lhs.type_info().is_nav();
    let rnav_type = rhs.type_info().is_nav();
    if lnav_type && rnav_type {
        return Ok(Ordering::Equal);
    }
    if lnav_type {
        return Ok(if rhs.data_tag() == TypeTag::NaV {
            Ordering::Equal
        } else {
            Ordering::Less
        });
    }
    if rnav_type {
        return Ok(if lhs.data_tag() == TypeTag::NaV {
            Ordering::Equal
        } else {
            Ordering::Greater
        });
    }

    // same declared type, but one side's data may have become NaV
    if lhs.type_info().is_same(rhs.type_info()) {
        let lnav = lhs.data_tag() == TypeTag::NaV;
        let rnav = rhs.data_tag() == TypeTag::NaV;
        match (lnav, rnav) {
            (true, true) => return Ok(Ordering::Equal),
            (true, false) => return Ok(Ordering::Less),
            (false, true) => return Ok(Ordering::Greater),
            (false, false) => {}
        }
    }

    if lhs.data_tag() == TypeTag::F64 || rhs.data_tag() == TypeTag::F64 {
        let a = to_f64_for_compare(lhs)?;
        let b = to_f64_for_compare(rhs)?;
        return Ok(a.total_cmp(&b));
    }

    if lhs.type_info().is_arithmetic() || rhs.type_info().is_arithmetic() {
        return compare_integers(lhs, rhs);
    }

    if lhs.data_tag() == TypeTag::Bool || rhs.data_tag() == TypeTag::Bool {
        return Ok(lhs.get_as_bool()?.cmp(&rhs.get_as_bool()?));
    }

    if lhs.data_tag() == TypeTag::String || rhs.data_tag() == TypeTag::String {
        return Ok(lhs.get_as_string()?.cmp(&rhs.get_as_string()?));
    }

    if lhs.data_tag() == TypeTag::Tuple && rhs.data_tag() == TypeTag::Tuple {
        return compare_tuples(lhs, rhs);
    }

    if lhs.data_tag() == TypeTag::Buffer && rhs.data_tag() == TypeTag::Buffer {
        return lhs.with_data(|a| {
            rhs.with_data(|b| match (a, b) {
                (ValueData::Buffer(x), ValueData::Buffer(y)) => Ok(x.cmp(y)),
                _ => Err(EvalError::bad_value_cast("types do not match for comparison")),
            })
        });
    }

    if let (Some(a), Some(b)) = (lhs.as_type_info(), rhs.as_type_info()) {
        return Ok((a.tag() as u32, a.name()).cmp(&(b.tag() as u32, b.name())));
    }

    Err(EvalError::bad_value_cast("types do not match for comparison"))
}

fn to_f64_for_compare(value: &Value) -> EvalResult<f64> {
    Ok(as_f64(extract_num(value)?))
}

/// Sign-correct integer comparison across i64/u64/u8 mixtures.
fn compare_integers(lhs: &Value, rhs: &Value) -> EvalResult<Ordering> {
    enum Int {
        Signed(i64),
        Unsigned(u64),
    }
    let as_int = |v: &Value| -> EvalResult<Int> {
        v.with_data(|d| match d {
            ValueData::U8(x) => Ok(Int::Unsigned(u64::from(*x))),
            ValueData::U64(x) => Ok(Int::Unsigned(*x)),
            ValueData::I64(x) => Ok(Int::Signed(*x)),
            _ => Ok(Int::Signed(v.get_as_integer()?)),
        })
    };
    let a = as_int(lhs)?;
    let b = as_int(rhs)?;
    Ok(match (a, b) {
        (Int::Signed(x), Int::Signed(y)) => x.cmp(&y),
        (Int::Unsigned(x), Int::Unsigned(y)) => x.cmp(&y),
        (Int::Signed(x), Int::Unsigned(y)) => {
            if x < 0 {
                Ordering::Less
            } else {
                (x as u64).cmp(&y)
            }
        }
        (Int::Unsigned(x), Int::Signed(y)) => {
            if y < 0 {
                Ordering::Greater
            } else {
                x.cmp(&(y as u64))
            }
        }
    })
}

fn compare_tuples(lhs: &Value, rhs: &Value) -> EvalResult<Ordering> {
    let a = lhs.get_tuple()?;
    let b = rhs.get_tuple()?;
    for ((_, x), (_, y)) in a.iter().zip(b.iter()) {
        let ord = compare(x, y)?;
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(a.size().cmp(&b.size()))
}

pub fn equals(lhs: &Value, rhs: &Value) -> EvalResult<bool> {
    Ok(compare(lhs, rhs)? == Ordering::Equal)
}

/// The shared unary dispatcher both evaluators call.
pub fn static_exec_unary(op: UnaryOp, operand: &Value) -> EvalResult<Value> {
    match op {
        UnaryOp::LogicalNot => Ok(Value::from(!operand.get_as_bool()?)),
        UnaryOp::BitNot => apply_bit_not(operand),
        UnaryOp::Minus | UnaryOp::Plus => apply_unary(op, operand),
        UnaryOp::ShareCount => Ok(Value::from(operand.share_count())),
        UnaryOp::Typename => Ok(Value::from(operand.type_info().name())),
        UnaryOp::Typeof => Ok(Value::from_type_info(operand.type_info()).shared()),
    }
}

/// The shared binary dispatcher both evaluators call. The short-circuit
/// logical operators are handled by the callers and rejected here.
pub fn static_exec_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    match op {
        BinaryOp::LogicalAnd | BinaryOp::LogicalOr => Err(EvalError::runtime(
            "logical and/or must be lowered with short-circuit jumps",
        )),
        BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            apply_binary(op, lhs, rhs)
        }
        BinaryOp::Lt => Ok(Value::from(compare(lhs, rhs)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::from(compare(lhs, rhs)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::from(compare(lhs, rhs)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::from(compare(lhs, rhs)? != Ordering::Less)),
        BinaryOp::Eq => Ok(Value::from(equals(lhs, rhs)?)),
        BinaryOp::Ne => Ok(Value::from(!equals(lhs, rhs)?)),
        BinaryOp::Shared => Ok(Value::from(lhs.is_shared_with(rhs))),
        BinaryOp::StringConcat => {
            let mut s = lhs.get_as_string()?;
            s.push_str(&rhs.get_as_string()?);
            Ok(Value::from(s))
        }
    }
}

/// The shared bit-op dispatcher both evaluators call.
pub fn static_exec_bit(op: BitOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    apply_bit_logic(op, lhs, rhs)
}

/// The `is` operator: type identity of the left operand against a type value.
pub fn static_exec_is_type(lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    let Some(target) = rhs.as_type_info() else {
        return Err(EvalError::eval("rhs of 'is' operator must be a type"));
    };
    Ok(Value::from(lhs.type_info().is_same(&target)))
}

/// The `as` operator: checked conversion to another built-in type.
pub fn static_exec_as_type(lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    let Some(target) = rhs.as_type_info() else {
        return Err(EvalError::eval("rhs of 'as' operator must be a type"));
    };
    if lhs.type_info().is_same(&target) {
        let mut copy = lhs.clone();
        copy.detach(false);
        return Ok(copy);
    }
    match target.tag() {
        TypeTag::Bool => Ok(Value::from(lhs.get_as_bool()?)),
        TypeTag::U8 => Ok(Value::from(convert_to_u8(lhs)?)),
        TypeTag::I64 => {
            let n = extract_num(lhs)?;
            match n {
                Num::F64(v) => num_traits::cast::<f64, i64>(v)
                    .map(Value::from)
                    .ok_or_else(|| EvalError::integer_overflow(format!("{v} does not fit into i64"))),
                Num::U64(v) => i64::try_from(v)
                    .map(Value::from)
                    .map_err(|_| EvalError::integer_overflow(format!("{v} does not fit into i64"))),
                other => Ok(Value::from(as_i64(other))),
            }
        }
        TypeTag::U64 => {
            let n = extract_num(lhs)?;
            match n {
                Num::F64(v) => num_traits::cast::<f64, u64>(v)
                    .map(Value::from)
                    .ok_or_else(|| EvalError::integer_overflow(format!("{v} does not fit into u64"))),
                other => Ok(Value::from(as_u64(other))),
            }
        }
        TypeTag::F64 => Ok(Value::from(as_f64(extract_num(lhs)?))),
        TypeTag::String => Ok(Value::from(lhs.get_as_string()?)),
        _ => Err(EvalError::bad_value_cast(format!(
            "cannot convert to type {}",
            target.name()
        ))),
    }
}
