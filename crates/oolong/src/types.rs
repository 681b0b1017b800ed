use std::rc::Rc;

use ahash::AHashMap;
use num_enum::TryFromPrimitive;
use strum::{Display, IntoStaticStr};

/// Stable ordinal tag of every value variant.
///
/// The discriminants are part of the program image format and must never be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, IntoStaticStr, TryFromPrimitive)]
#[repr(u32)]
pub enum TypeTag {
    /// NaV - Not A Value. Distinguishable from absent and carries its own type.
    NaV = 0,
    Bool = 1,
    U8 = 2,
    I64 = 3,
    U64 = 4,
    F64 = 5,
    String = 6,
    Tuple = 7,
    Buffer = 8,
    IntegerSequence = 9,
    Function = 10,
    Passthrough = 11,
}

impl TypeTag {
    /// Whether values of this type participate in arithmetic promotion.
    #[must_use]
    pub fn is_arithmetic(self) -> bool {
        matches!(self, Self::Bool | Self::U8 | Self::I64 | Self::U64 | Self::F64)
    }
}

/// Runtime type identity: a tag plus a display name.
///
/// For the built-in variants the name equals the tag name. Hosts can register
/// named passthrough types in the [`TypeSystem`]; those share the
/// `Passthrough` tag but carry their own name, so `typename` distinguishes
/// them while the persistence format does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    tag: TypeTag,
    name: Rc<str>,
}

impl TypeInfo {
    #[must_use]
    pub fn new(tag: TypeTag, name: impl Into<Rc<str>>) -> Self {
        Self { tag, name: name.into() }
    }

    #[must_use]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same type identity: same tag and same name.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        self.tag == other.tag && self.name == other.name
    }

    #[must_use]
    pub fn is_tag(&self, tag: TypeTag) -> bool {
        self.tag == tag
    }

    #[must_use]
    pub fn is_arithmetic(&self) -> bool {
        self.tag.is_arithmetic()
    }

    #[must_use]
    pub fn is_nav(&self) -> bool {
        self.tag == TypeTag::NaV
    }
}

thread_local! {
    static BUILTINS: [Rc<TypeInfo>; 12] = [
        Rc::new(TypeInfo::new(TypeTag::NaV, "NaV")),
        Rc::new(TypeInfo::new(TypeTag::Bool, "Bool")),
        Rc::new(TypeInfo::new(TypeTag::U8, "u8")),
        Rc::new(TypeInfo::new(TypeTag::I64, "i64")),
        Rc::new(TypeInfo::new(TypeTag::U64, "u64")),
        Rc::new(TypeInfo::new(TypeTag::F64, "f64")),
        Rc::new(TypeInfo::new(TypeTag::String, "String")),
        Rc::new(TypeInfo::new(TypeTag::Tuple, "Tuple")),
        Rc::new(TypeInfo::new(TypeTag::Buffer, "Buffer")),
        Rc::new(TypeInfo::new(TypeTag::IntegerSequence, "IntegerSequence")),
        Rc::new(TypeInfo::new(TypeTag::Function, "Function")),
        Rc::new(TypeInfo::new(TypeTag::Passthrough, "Passthrough")),
    ];
}

/// Returns the shared `TypeInfo` for a built-in tag.
#[must_use]
pub fn builtin(tag: TypeTag) -> Rc<TypeInfo> {
    BUILTINS.with(|b| b[tag as usize].clone())
}

thread_local! {
    static TYPE_INFO_TYPE: Rc<TypeInfo> = Rc::new(TypeInfo::new(TypeTag::Passthrough, "TypeInfo"));
}

/// The type of first-class type values, as produced by the `typeof` operator.
/// Shares the `Passthrough` tag but has its own identity.
#[must_use]
pub fn type_info_type() -> Rc<TypeInfo> {
    TYPE_INFO_TYPE.with(Clone::clone)
}

/// Registry mapping type names to their `TypeInfo`.
///
/// Pre-populated with all built-ins; hosts register additional named
/// passthrough types for opaque payloads they hand into scripts.
#[derive(Debug)]
pub struct TypeSystem {
    by_name: AHashMap<Rc<str>, Rc<TypeInfo>>,
}

impl TypeSystem {
    #[must_use]
    pub fn new() -> Self {
        let mut by_name = AHashMap::new();
        BUILTINS.with(|b| {
            for info in b {
                by_name.insert(Rc::from(info.name()), info.clone());
            }
        });
        Self { by_name }
    }

    /// Registers a named passthrough type. Returns the registered info, or the
    /// already present one when the name was registered before with the same
    /// tag.
    pub fn register_passthrough(&mut self, name: &str) -> Rc<TypeInfo> {
        if let Some(existing) = self.by_name.get(name) {
            return existing.clone();
        }
        let info = Rc::new(TypeInfo::new(TypeTag::Passthrough, name));
        self.by_name.insert(Rc::from(name), info.clone());
        info
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<Rc<TypeInfo>> {
        self.by_name.get(name).cloned()
    }
}

impl Default for TypeSystem {
    fn default() -> Self {
        Self::new()
    }
}
