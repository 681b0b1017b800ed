use std::{
    any::Any,
    cell::RefCell,
    fmt,
    rc::Rc,
};

use crate::{
    error::{EvalError, EvalResult},
    func::FunctionPtr,
    sequence::IntegerSequence,
    tuple::Tuple,
    types::{self, TypeInfo, TypeTag},
};

/// Raw byte vector variant.
pub type Buffer = Vec<u8>;

/// Opaque host-owned payload, carried by reference and never inspected by the
/// core. Hosts downcast it back on retrieval.
#[derive(Clone)]
pub struct PassthroughData(pub Rc<dyn Any>);

impl PassthroughData {
    #[must_use]
    pub fn new(payload: Rc<dyn Any>) -> Self {
        Self(payload)
    }

    #[must_use]
    pub fn downcast<T: 'static>(&self) -> Option<Rc<T>> {
        self.0.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for PassthroughData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PassthroughData(..)")
    }
}

/// The bare variant stored inside a value cell.
#[derive(Debug, Clone)]
pub enum ValueData {
    NaV,
    Bool(bool),
    U8(u8),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    Tuple(Tuple),
    Buffer(Buffer),
    Sequence(IntegerSequence),
    Function(FunctionPtr),
    Passthrough(PassthroughData),
}

impl ValueData {
    #[must_use]
    pub fn tag(&self) -> TypeTag {
        match self {
            Self::NaV => TypeTag::NaV,
            Self::Bool(_) => TypeTag::Bool,
            Self::U8(_) => TypeTag::U8,
            Self::I64(_) => TypeTag::I64,
            Self::U64(_) => TypeTag::U64,
            Self::F64(_) => TypeTag::F64,
            Self::String(_) => TypeTag::String,
            Self::Tuple(_) => TypeTag::Tuple,
            Self::Buffer(_) => TypeTag::Buffer,
            Self::Sequence(_) => TypeTag::IntegerSequence,
            Self::Function(_) => TypeTag::Function,
            Self::Passthrough(_) => TypeTag::Passthrough,
        }
    }
}

/// Storage discipline of one value: a single-owner inline cell, or a
/// reference-counted shared cell observed by every handle.
#[derive(Debug, Clone)]
enum Cell {
    Inline(ValueData),
    Shared(Rc<RefCell<ValueData>>),
}

/// The common runtime value.
///
/// Every value carries its [`TypeInfo`], a const flag and the storage cell.
/// Cloning a handle to a shared value yields another handle onto the same
/// cell; cloning an inline value copies the data. `b := a` therefore detaches
/// while `b @= a` shares, and `@?` reports the cell's reference count.
///
/// The declared type outlives the data: assigning NaV into a typed slot keeps
/// the slot's type so a later assignment of the original type still succeeds.
#[derive(Debug, Clone)]
pub struct Value {
    cell: Cell,
    type_info: Rc<TypeInfo>,
    is_const: bool,
}

impl Value {
    // --- construction -------------------------------------------------------

    #[must_use]
    pub fn nav() -> Self {
        Self::new(ValueData::NaV)
    }

    /// Creates an inline, mutable value from bare data with the matching
    /// built-in type info.
    #[must_use]
    pub fn new(data: ValueData) -> Self {
        let type_info = types::builtin(data.tag());
        Self {
            cell: Cell::Inline(data),
            type_info,
            is_const: false,
        }
    }

    #[must_use]
    pub fn buffer(bytes: Buffer) -> Self {
        Self::new(ValueData::Buffer(bytes))
    }

    #[must_use]
    pub fn sequence(seq: IntegerSequence) -> Self {
        Self::new(ValueData::Sequence(seq))
    }

    #[must_use]
    pub fn function(func: FunctionPtr) -> Self {
        Self::new(ValueData::Function(func))
    }

    /// Wraps an opaque host payload with a (usually registered) type info.
    #[must_use]
    pub fn passthrough(payload: Rc<dyn Any>, type_info: Rc<TypeInfo>) -> Self {
        Self {
            cell: Cell::Inline(ValueData::Passthrough(PassthroughData::new(payload))),
            type_info,
            is_const: false,
        }
    }

    /// A first-class type value, as produced by the `typeof` operator.
    #[must_use]
    pub fn from_type_info(info: &TypeInfo) -> Self {
        Self {
            cell: Cell::Inline(ValueData::Passthrough(PassthroughData::new(Rc::new(info.clone())))),
            type_info: types::type_info_type(),
            is_const: false,
        }
    }

    /// Consumes self, returning the shared form.
    #[must_use]
    pub fn shared(mut self) -> Self {
        self.make_shared();
        self
    }

    /// Consumes self, returning the const form.
    #[must_use]
    pub fn into_const(mut self) -> Self {
        self.is_const = true;
        self
    }

    // --- type / mutability --------------------------------------------------

    #[must_use]
    pub fn type_info(&self) -> &Rc<TypeInfo> {
        &self.type_info
    }

    /// The tag of the *stored* data. May be `NaV` while the declared type is
    /// something else.
    #[must_use]
    pub fn data_tag(&self) -> TypeTag {
        match &self.cell {
            Cell::Inline(data) => data.tag(),
            Cell::Shared(cell) => cell.borrow().tag(),
        }
    }

    #[must_use]
    pub fn is_const(&self) -> bool {
        self.is_const
    }

    #[must_use]
    pub fn is_mutable(&self) -> bool {
        !self.is_const
    }

    pub fn make_const(&mut self) -> &mut Self {
        self.is_const = true;
        self
    }

    // --- sharing ------------------------------------------------------------

    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self.cell, Cell::Shared(_))
    }

    /// Number of handles sharing the cell; 0 for unshared values.
    #[must_use]
    pub fn share_count(&self) -> i64 {
        match &self.cell {
            Cell::Inline(_) => 0,
            Cell::Shared(cell) => i64::try_from(Rc::strong_count(cell)).unwrap_or(i64::MAX),
        }
    }

    /// Whether both handles observe the same shared cell (the `@@` operator).
    #[must_use]
    pub fn is_shared_with(&self, other: &Self) -> bool {
        match (&self.cell, &other.cell) {
            (Cell::Shared(a), Cell::Shared(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Moves the data into a reference counted cell, if not shared already.
    pub fn make_shared(&mut self) -> &mut Self {
        if let Cell::Inline(data) = &mut self.cell {
            let data = std::mem::replace(data, ValueData::NaV);
            self.cell = Cell::Shared(Rc::new(RefCell::new(data)));
        }
        self
    }

    /// Detaches this handle from any sharing: afterwards the cell is only
    /// referenced by this handle. Tuples are copied deeply. The detached
    /// value becomes mutable unless `keep_const` is set and it was const.
    pub fn detach(&mut self, keep_const: bool) -> &mut Self {
        if let Cell::Shared(cell) = &self.cell {
            if Rc::strong_count(cell) >= 2 {
                if self.data_tag() == TypeTag::Tuple {
                    let copy = self.deep_copy(keep_const);
                    self.cell = copy.cell;
                } else {
                    let data = cell.borrow().clone();
                    self.cell = Cell::Inline(data);
                }
            }
        }
        if self.is_const && !keep_const {
            self.is_const = false;
        }
        self
    }

    /// Deep copy: non-tuples detach-copy; tuples copy every element into a
    /// fresh shared cell, recursively. Nested elements keep their constness;
    /// the top level keeps const only when `keep_const` is set.
    #[must_use]
    pub fn deep_copy(&self, keep_const: bool) -> Self {
        if self.data_tag() != TypeTag::Tuple {
            let mut copy = self.clone();
            copy.detach(keep_const);
            return copy;
        }
        let copied = self.with_data(|data| match data {
            ValueData::Tuple(src) => deep_copy_tuple(src),
            _ => Tuple::new(),
        });
        Self {
            cell: Cell::Shared(Rc::new(RefCell::new(ValueData::Tuple(copied)))),
            type_info: self.type_info.clone(),
            is_const: self.is_const && keep_const,
        }
    }

    // --- data access --------------------------------------------------------

    pub fn with_data<R>(&self, f: impl FnOnce(&ValueData) -> R) -> R {
        match &self.cell {
            Cell::Inline(data) => f(data),
            Cell::Shared(cell) => f(&cell.borrow()),
        }
    }

    pub fn with_data_mut<R>(&mut self, f: impl FnOnce(&mut ValueData) -> R) -> R {
        match &mut self.cell {
            Cell::Inline(data) => f(data),
            Cell::Shared(cell) => f(&mut cell.borrow_mut()),
        }
    }

    fn write_data(&mut self, data: ValueData) {
        match &mut self.cell {
            Cell::Inline(slot) => *slot = data,
            Cell::Shared(cell) => *cell.borrow_mut() = data,
        }
    }

    #[must_use]
    pub fn clone_data(&self) -> ValueData {
        self.with_data(Clone::clone)
    }

    // --- assignment ---------------------------------------------------------

    /// Value-copy assignment (`:=` on an existing slot). Types must match,
    /// except that NaV may be assigned into any slot without changing its
    /// declared type. Tuple sources living on a store are copied deeply.
    pub fn assign_value(&mut self, other: &Self) -> EvalResult<()> {
        // a declared-NaV slot (`def x` without assignment) adopts any type
        if !self.type_info.is_same(&other.type_info) && !other.type_info.is_nav() && !self.type_info.is_nav() {
            return Err(EvalError::type_mismatch());
        }
        if self.is_const {
            return Err(EvalError::const_assign());
        }
        let data = if self.type_info.is_tag(TypeTag::Tuple) && other.share_count() > 1 {
            other.deep_copy(false).clone_data()
        } else {
            other.clone_data()
        };
        if self.type_info.is_nav() && !other.type_info.is_nav() {
            self.type_info = other.type_info.clone();
        }
        self.write_data(data);
        Ok(())
    }

    /// Share assignment (`@=` on an existing slot): afterwards both handles
    /// observe the same cell. Fails with `const-shared-assign` when the
    /// source is const (checked at assignment time, not at use time).
    pub fn shared_assign_value(&mut self, other: &Self) -> EvalResult<()> {
        if !self.type_info.is_same(&other.type_info) && !other.type_info.is_nav() && !self.type_info.is_nav() {
            return Err(EvalError::type_mismatch());
        }
        if self.is_const {
            return Err(EvalError::const_assign());
        }
        if other.is_const {
            return Err(EvalError::const_shared_assign());
        }
        if self.type_info.is_nav() && !other.type_info.is_nav() {
            self.type_info = other.type_info.clone();
        }
        self.cell = other.cell.clone();
        Ok(())
    }

    /// Writes a plain i64 through the handle, types must match. Used by the
    /// forall induction variable rebind.
    pub fn assign_i64(&mut self, v: i64) -> EvalResult<()> {
        if !self.type_info.is_tag(TypeTag::I64) {
            return Err(EvalError::type_mismatch());
        }
        if self.is_const {
            return Err(EvalError::const_assign());
        }
        self.write_data(ValueData::I64(v));
        Ok(())
    }

    // --- typed extractors ---------------------------------------------------

    pub fn get_bool(&self) -> EvalResult<bool> {
        self.with_data(|d| match d {
            ValueData::Bool(b) => Ok(*b),
            _ => Err(bad_cast("Bool", d)),
        })
    }

    pub fn get_u8(&self) -> EvalResult<u8> {
        self.with_data(|d| match d {
            ValueData::U8(v) => Ok(*v),
            _ => Err(bad_cast("U8", d)),
        })
    }

    pub fn get_i64(&self) -> EvalResult<i64> {
        self.with_data(|d| match d {
            ValueData::I64(v) => Ok(*v),
            _ => Err(bad_cast("i64", d)),
        })
    }

    pub fn get_u64(&self) -> EvalResult<u64> {
        self.with_data(|d| match d {
            ValueData::U64(v) => Ok(*v),
            _ => Err(bad_cast("u64", d)),
        })
    }

    pub fn get_f64(&self) -> EvalResult<f64> {
        self.with_data(|d| match d {
            ValueData::F64(v) => Ok(*v),
            _ => Err(bad_cast("f64", d)),
        })
    }

    pub fn get_string(&self) -> EvalResult<String> {
        self.with_data(|d| match d {
            ValueData::String(s) => Ok(s.clone()),
            _ => Err(bad_cast("String", d)),
        })
    }

    pub fn get_function(&self) -> EvalResult<FunctionPtr> {
        self.with_data(|d| match d {
            ValueData::Function(f) => Ok(f.clone()),
            _ => Err(bad_cast("Function", d)),
        })
    }

    pub fn get_sequence(&self) -> EvalResult<IntegerSequence> {
        self.with_data(|d| match d {
            ValueData::Sequence(s) => Ok(*s),
            _ => Err(bad_cast("IntegerSequence", d)),
        })
    }

    /// Clones the tuple payload out (the handles inside still share).
    pub fn get_tuple(&self) -> EvalResult<Tuple> {
        self.with_data(|d| match d {
            ValueData::Tuple(t) => Ok(t.clone()),
            _ => Err(bad_cast("Tuple", d)),
        })
    }

    #[must_use]
    pub fn buffer_len(&self) -> Option<usize> {
        self.with_data(|d| match d {
            ValueData::Buffer(b) => Some(b.len()),
            _ => None,
        })
    }

    /// The `TypeInfo` payload of a `typeof` result, if this is one.
    #[must_use]
    pub fn as_type_info(&self) -> Option<Rc<TypeInfo>> {
        self.with_data(|d| match d {
            ValueData::Passthrough(p) => p.downcast::<TypeInfo>(),
            _ => None,
        })
    }

    // --- conversions --------------------------------------------------------

    /// Converts the stored value to bool if possible.
    pub fn get_as_bool(&self) -> EvalResult<bool> {
        self.with_data(|d| match d {
            ValueData::NaV => Err(EvalError::bad_value_cast("value is NaV (Not A Value)")),
            ValueData::Bool(b) => Ok(*b),
            ValueData::U8(v) => Ok(*v != 0),
            ValueData::I64(v) => Ok(*v != 0),
            ValueData::U64(v) => Ok(*v != 0),
            ValueData::F64(v) => Ok(*v != 0.0),
            ValueData::String(s) => Ok(!s.is_empty()),
            ValueData::Tuple(t) => Ok(!t.is_empty()),
            ValueData::Buffer(b) => Ok(!b.is_empty()),
            _ => Err(EvalError::bad_value_cast("value is not convertible to Bool")),
        })
    }

    /// Converts the stored value to i64 if possible.
    pub fn get_as_integer(&self) -> EvalResult<i64> {
        self.with_data(|d| match d {
            ValueData::NaV => Err(EvalError::bad_value_cast("value is NaV (Not A Value)")),
            ValueData::Bool(b) => Ok(i64::from(*b)),
            ValueData::U8(v) => Ok(i64::from(*v)),
            ValueData::I64(v) => Ok(*v),
            ValueData::U64(v) => i64::try_from(*v)
                .map_err(|_| EvalError::bad_value_cast("u64 value is not convertible to i64")),
            ValueData::F64(v) => {
                if v.is_finite() {
                    Ok(*v as i64)
                } else {
                    Err(EvalError::bad_value_cast("f64 value is not convertible to i64"))
                }
            }
            ValueData::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| EvalError::bad_value_cast("String value is not convertible to i64")),
            _ => Err(EvalError::bad_value_cast("value is not convertible to i64")),
        })
    }

    /// Converts the stored value to a string if possible (no quoting).
    pub fn get_as_string(&self) -> EvalResult<String> {
        self.with_data(|d| match d {
            ValueData::Bool(b) => Ok(b.to_string()),
            ValueData::U8(v) => Ok(v.to_string()),
            ValueData::I64(v) => Ok(v.to_string()),
            ValueData::U64(v) => Ok(v.to_string()),
            ValueData::F64(v) => Ok(format_f64(*v)),
            ValueData::String(s) => Ok(s.clone()),
            ValueData::Passthrough(p) => p
                .downcast::<TypeInfo>()
                .map(|info| info.name().to_string())
                .ok_or_else(|| EvalError::bad_value_cast("value is not convertible to String")),
            _ => Err(EvalError::bad_value_cast("value is not convertible to String")),
        })
    }

    /// Human-readable rendering for diagnostics; strings are quoted, NaV and
    /// opaque payloads print a placeholder.
    #[must_use]
    pub fn print_value(&self) -> String {
        self.with_data(print_data)
    }

    /// Code-point aware length for strings; element/byte counts for the
    /// containers.
    #[must_use]
    pub fn length(&self) -> Option<usize> {
        self.with_data(|d| match d {
            ValueData::String(s) => Some(s.chars().count()),
            ValueData::Tuple(t) => Some(t.size()),
            ValueData::Buffer(b) => Some(b.len()),
            ValueData::Sequence(s) => usize::try_from(s.len()).ok(),
            _ => None,
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::new(ValueData::Bool(v))
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::new(ValueData::U8(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::new(ValueData::I64(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::new(ValueData::U64(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::new(ValueData::F64(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::new(ValueData::String(v.to_string()))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::new(ValueData::String(v))
    }
}

impl From<Tuple> for Value {
    fn from(v: Tuple) -> Self {
        Self::new(ValueData::Tuple(v))
    }
}

fn bad_cast(wanted: &str, got: &ValueData) -> EvalError {
    EvalError::bad_value_cast(format!("expected {wanted}, value holds {}", got.tag()))
}

fn format_f64(v: f64) -> String {
    if v.is_finite() {
        let mut buf = ryu::Buffer::new();
        buf.format(v).to_string()
    } else {
        v.to_string()
    }
}

fn print_data(data: &ValueData) -> String {
    match data {
        ValueData::NaV => "NaV".to_string(),
        ValueData::Bool(b) => b.to_string(),
        ValueData::U8(v) => v.to_string(),
        ValueData::I64(v) => v.to_string(),
        ValueData::U64(v) => v.to_string(),
        ValueData::F64(v) => format_f64(*v),
        ValueData::String(s) => format!("\"{s}\""),
        ValueData::Tuple(t) => {
            let mut out = String::from("(");
            for (i, (key, val)) in t.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if let Some(key) = key {
                    out.push_str(key);
                    out.push_str(": ");
                }
                out.push_str(&val.print_value());
            }
            out.push(')');
            out
        }
        ValueData::Buffer(b) => format!("<Buffer size={}>", b.len()),
        ValueData::Sequence(s) => s.to_string(),
        ValueData::Function(_) => "<function>".to_string(),
        ValueData::Passthrough(p) => match p.downcast::<TypeInfo>() {
            Some(info) => format!("<type {}>", info.name()),
            None => "<passthrough>".to_string(),
        },
    }
}

fn deep_copy_tuple(src: &Tuple) -> Tuple {
    let mut dest = Tuple::new();
    dest.reserve(src.size());
    for (key, val) in src.iter() {
        let mut copy = if val.data_tag() == TypeTag::Tuple {
            val.deep_copy(true)
        } else {
            let mut c = val.clone();
            c.detach(true);
            c.make_shared();
            c
        };
        copy.make_shared();
        match key {
            Some(key) => {
                dest.append_key_value(key, copy);
            }
            None => dest.append(copy),
        }
    }
    dest
}
