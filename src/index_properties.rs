// index_properties.rs - Composite equality keys
use std::fmt;
use std::rc::Rc;

/// One column of a join or group key.
///
/// Keys compare by value. Signed and unsigned integers are distinct variants,
/// so both sides of a joiner must produce the same Rust type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Char(char),
    Str(Rc<str>),
    /// Several keys compared together, built from a 2- or 3-tuple.
    Composite(Rc<[IndexKey]>),
}

impl IndexKey {
    /// The columns of a composite key, or the key itself.
    pub fn parts(&self) -> &[IndexKey] {
        match self {
            IndexKey::Composite(parts) => parts,
            single => std::slice::from_ref(single),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Null => f.write_str("null"),
            IndexKey::Bool(v) => write!(f, "{}", v),
            IndexKey::Int(v) => write!(f, "{}", v),
            IndexKey::UInt(v) => write!(f, "{}", v),
            IndexKey::Char(v) => write!(f, "{:?}", v),
            IndexKey::Str(v) => write!(f, "{:?}", v),
            IndexKey::Composite(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", part)?;
                }
                f.write_str(")")
            }
        }
    }
}

macro_rules! impl_index_key_from {
    ($variant:ident as $target:ty: $($source:ty),*) => {
        $(
            impl From<$source> for IndexKey {
                #[inline]
                fn from(value: $source) -> Self {
                    IndexKey::$variant(value as $target)
                }
            }
        )*
    };
}

impl_index_key_from!(Int as i64: i8, i16, i32, i64, isize);
impl_index_key_from!(UInt as u64: u8, u16, u32, u64, usize);

impl From<bool> for IndexKey {
    fn from(value: bool) -> Self {
        IndexKey::Bool(value)
    }
}

impl From<char> for IndexKey {
    fn from(value: char) -> Self {
        IndexKey::Char(value)
    }
}

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        IndexKey::Str(Rc::from(value))
    }
}

impl From<String> for IndexKey {
    fn from(value: String) -> Self {
        IndexKey::Str(Rc::from(value))
    }
}

impl From<Rc<str>> for IndexKey {
    fn from(value: Rc<str>) -> Self {
        IndexKey::Str(value)
    }
}

impl<T: Into<IndexKey>> From<Option<T>> for IndexKey {
    fn from(value: Option<T>) -> Self {
        value.map_or(IndexKey::Null, Into::into)
    }
}

impl<A: Into<IndexKey>, B: Into<IndexKey>> From<(A, B)> for IndexKey {
    fn from((a, b): (A, B)) -> Self {
        IndexKey::Composite(Rc::from(vec![a.into(), b.into()]))
    }
}

impl<A: Into<IndexKey>, B: Into<IndexKey>, C: Into<IndexKey>> From<(A, B, C)> for IndexKey {
    fn from((a, b, c): (A, B, C)) -> Self {
        IndexKey::Composite(Rc::from(vec![a.into(), b.into(), c.into()]))
    }
}

/// Immutable composite key derived from all equal-joiner columns of one side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexProperties {
    /// No joiner columns: every tuple matches every other tuple.
    None,
    Single(IndexKey),
    Many(Box<[IndexKey]>),
}

impl IndexProperties {
    pub fn len(&self) -> usize {
        match self {
            IndexProperties::None => 0,
            IndexProperties::Single(_) => 1,
            IndexProperties::Many(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, column: usize) -> Option<&IndexKey> {
        match self {
            IndexProperties::None => None,
            IndexProperties::Single(key) => (column == 0).then_some(key),
            IndexProperties::Many(keys) => keys.get(column),
        }
    }
}

impl fmt::Display for IndexProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexProperties::None => f.write_str("[]"),
            IndexProperties::Single(key) => write!(f, "[{}]", key),
            IndexProperties::Many(keys) => {
                f.write_str("[")?;
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", key)?;
                }
                f.write_str("]")
            }
        }
    }
}
