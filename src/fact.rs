// fact.rs - Fact trait
use std::any::Any;
use std::fmt::Debug;
use std::rc::Rc;

/// Anything that can flow through the network as a fact.
///
/// Implemented for every `Debug + 'static` type, so planning entities,
/// group keys and collector results all qualify without boilerplate.
pub trait Fact: Debug + 'static {
    /// Returns the fact as a `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Name of the concrete type, for diagnostics.
    fn type_name(&self) -> &'static str;
}

impl<T: Debug + 'static> Fact for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline]
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Shared, immutable fact reference as stored inside tuples.
pub type FactRef = Rc<dyn Fact>;

/// Downcast a fact trait object to a concrete type.
///
/// Takes `&dyn Fact` rather than `&FactRef`: the blanket impl also covers
/// `Rc<dyn Fact>` itself, so calling `as_any` on the `Rc` would downcast the
/// pointer instead of the fact.
#[inline]
pub fn downcast_fact<T: 'static>(fact: &dyn Fact) -> Option<&T> {
    fact.as_any().downcast_ref::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Lesson {
        room: u32,
    }

    #[test]
    fn test_downcast_through_rc() {
        let fact: FactRef = Rc::new(Lesson { room: 7 });
        assert_eq!(downcast_fact::<Lesson>(&*fact), Some(&Lesson { room: 7 }));
        assert_eq!(downcast_fact::<u32>(&*fact), None);
        assert!((*fact).type_name().ends_with("Lesson"));
    }
}
