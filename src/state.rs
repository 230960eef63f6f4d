// state.rs - Tuple state management

use std::fmt;

/// Lifecycle state of a tuple (or of an exists-counter) inside the network.
///
/// Every state carries two flags. A *dirty* state sits in some node's dirty
/// queue waiting for the next flush; an *active* state is visible downstream
/// (or about to be).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TupleState {
    /// Freshly created, not yet propagated.
    Creating,
    /// Propagated before and changed since; flushes as retract + insert.
    Updating,
    /// Propagated and stable.
    Ok,
    /// Propagated and invalidated; flushes as a retract.
    Dying,
    /// Terminal.
    Dead,
    /// Invalidated before it was ever propagated.
    Aborting,
}

/// What a flush must send downstream for one dirty tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushStep {
    pub retract: bool,
    pub insert: bool,
    pub next: TupleState,
}

impl TupleState {
    #[inline]
    pub fn is_dirty(self) -> bool {
        matches!(
            self,
            TupleState::Creating | TupleState::Updating | TupleState::Dying | TupleState::Aborting
        )
    }

    #[inline]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TupleState::Creating | TupleState::Updating | TupleState::Ok
        )
    }

    /// State after the tuple is invalidated, and whether it must be enqueued.
    ///
    /// Returns `None` for `Dead`, which can never be invalidated again.
    pub(crate) fn invalidated(self) -> Option<(TupleState, bool)> {
        match self {
            TupleState::Ok => Some((TupleState::Dying, true)),
            TupleState::Creating => Some((TupleState::Aborting, false)),
            TupleState::Updating => Some((TupleState::Dying, false)),
            TupleState::Dying | TupleState::Aborting => Some((self, false)),
            TupleState::Dead => None,
        }
    }

    /// State after an already propagated tuple changes, and whether it must be enqueued.
    pub(crate) fn updated(self) -> Option<(TupleState, bool)> {
        match self {
            TupleState::Ok => Some((TupleState::Updating, true)),
            TupleState::Creating | TupleState::Updating => Some((self, false)),
            TupleState::Dying | TupleState::Dead | TupleState::Aborting => None,
        }
    }

    /// Downstream calls and resting state for a dirty tuple being flushed.
    pub(crate) fn flush_step(self) -> Option<FlushStep> {
        let step = |retract, insert, next| FlushStep { retract, insert, next };
        match self {
            TupleState::Creating => Some(step(false, true, TupleState::Ok)),
            TupleState::Updating => Some(step(true, true, TupleState::Ok)),
            TupleState::Dying => Some(step(true, false, TupleState::Dead)),
            TupleState::Aborting => Some(step(false, false, TupleState::Dead)),
            TupleState::Ok | TupleState::Dead => None,
        }
    }
}

impl Default for TupleState {
    fn default() -> Self {
        TupleState::Dead
    }
}

impl fmt::Display for TupleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TupleState::Creating => "CREATING",
            TupleState::Updating => "UPDATING",
            TupleState::Ok => "OK",
            TupleState::Dying => "DYING",
            TupleState::Dead => "DEAD",
            TupleState::Aborting => "ABORTING",
        };
        f.write_str(name)
    }
}
