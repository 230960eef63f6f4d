// tuple.rs
use crate::fact::{downcast_fact, Fact, FactRef};
use crate::group_node::GroupPart;
use crate::if_exists_node::CounterId;
use crate::index_properties::IndexProperties;
use crate::state::TupleState;
use slotmap::new_key_type;
use smallvec::SmallVec;
use std::fmt;

new_key_type! {
    /// Arena handle of a tuple. Handles are never reused for another tuple,
    /// so they double as the tuple's identity.
    pub struct TupleId;
}

/// Facts carried by a tuple; joins of up to four facts stay inline.
pub type Facts = SmallVec<[FactRef; 4]>;

/// One row flowing through the network.
///
/// Equality is identity: two tuples with equal facts are still different
/// tuples. Compare [`TupleId`]s, never tuples.
pub struct Tuple {
    serial: u64,
    facts: Facts,
    pub(crate) state: TupleState,
}

impl Tuple {
    pub(crate) fn new(serial: u64, facts: Facts) -> Self {
        Self {
            serial,
            facts,
            state: TupleState::Creating,
        }
    }

    /// Creation order of this tuple within its arena.
    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[inline]
    pub fn state(&self) -> TupleState {
        self.state
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.facts.len()
    }

    #[inline]
    pub fn facts(&self) -> &[FactRef] {
        &self.facts
    }

    /// The fact at `index`, if present and of type `T`.
    #[inline]
    pub fn fact<T: 'static>(&self, index: usize) -> Option<&T> {
        self.facts.get(index).and_then(|f| downcast_fact::<T>(&**f))
    }

    pub(crate) fn set_fact(&mut self, index: usize, fact: FactRef) -> bool {
        match self.facts.get_mut(index) {
            Some(slot) => {
                *slot = fact;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let facts: Vec<&dyn Fact> = self.facts.iter().map(|fact| &**fact).collect();
        f.debug_struct("Tuple")
            .field("serial", &self.serial)
            .field("state", &self.state)
            .field("facts", &facts)
            .finish()
    }
}

/// Node-private data kept in a tuple's extension slot.
#[derive(Debug, Clone)]
pub enum StoreEntry {
    /// Join or exists key computed when the tuple entered the node.
    Properties(IndexProperties),
    /// Group membership and the inverse of its accumulator contribution.
    GroupPart(GroupPart),
    /// Exists-counter owned by the left tuple.
    Counter(CounterId),
    /// Match weight a scorer added for this tuple.
    MatchWeight(i64),
    /// Tuples a map or flatten node derived from this tuple.
    Mapped(SmallVec<[TupleId; 2]>),
}
