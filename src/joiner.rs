// joiner.rs - Equal joiners
use crate::index_properties::IndexKey;
use crate::tuple::Tuple;
use std::fmt;
use std::rc::Rc;

/// Extracts one key column from a tuple.
pub type KeyExtractor = Rc<dyn Fn(&Tuple) -> IndexKey>;

/// One equality column: `left(l) == right(r)`.
#[derive(Clone)]
pub struct EqualJoiner {
    pub(crate) left: KeyExtractor,
    pub(crate) right: KeyExtractor,
}

impl fmt::Debug for EqualJoiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EqualJoiner")
            .field("left", &"<function>")
            .field("right", &"<function>")
            .finish()
    }
}

/// The joiner columns of one join or exists stream. Tuples match when every
/// column is equal; no columns means every pair matches.
#[derive(Debug, Clone, Default)]
pub struct Joiners {
    equal: Vec<EqualJoiner>,
}

impl Joiners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality column. Both sides must produce the same key type.
    pub fn equal<K, L, R>(mut self, left: L, right: R) -> Self
    where
        K: Into<IndexKey>,
        L: Fn(&Tuple) -> K + 'static,
        R: Fn(&Tuple) -> K + 'static,
    {
        self.equal.push(EqualJoiner {
            left: Rc::new(move |tuple| left(tuple).into()),
            right: Rc::new(move |tuple| right(tuple).into()),
        });
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.equal.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.equal.is_empty()
    }

    pub(crate) fn left_mappings(&self) -> Vec<KeyExtractor> {
        self.equal.iter().map(|joiner| joiner.left.clone()).collect()
    }

    pub(crate) fn right_mappings(&self) -> Vec<KeyExtractor> {
        self.equal.iter().map(|joiner| joiner.right.clone()).collect()
    }
}
