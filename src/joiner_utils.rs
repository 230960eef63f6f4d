// joiner_utils.rs - Composite key extraction
use crate::index_properties::IndexProperties;
use crate::joiner::{Joiners, KeyExtractor};
use crate::tuple::Tuple;
use std::rc::Rc;

/// Computes the full composite key of one side of a join.
pub type IndexMapping = Rc<dyn Fn(&Tuple) -> IndexProperties>;

pub struct JoinerUtils;

impl JoinerUtils {
    pub fn combine_left_mappings(joiners: &Joiners) -> IndexMapping {
        Self::combine(joiners.left_mappings())
    }

    pub fn combine_right_mappings(joiners: &Joiners) -> IndexMapping {
        Self::combine(joiners.right_mappings())
    }

    /// Zero and one column never allocate; only the general case builds a key array.
    pub fn combine(mut mappings: Vec<KeyExtractor>) -> IndexMapping {
        match mappings.len() {
            0 => Rc::new(|_: &Tuple| IndexProperties::None),
            1 => {
                let mapping = mappings.remove(0);
                Rc::new(move |tuple: &Tuple| IndexProperties::Single(mapping(tuple)))
            }
            _ => {
                let mappings: Rc<[KeyExtractor]> = mappings.into();
                Rc::new(move |tuple: &Tuple| {
                    IndexProperties::Many(mappings.iter().map(|mapping| mapping(tuple)).collect())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactRef;
    use crate::index_properties::IndexKey;
    use crate::tuple::Facts;
    use smallvec::smallvec;

    #[derive(Debug)]
    struct Lesson {
        room: u32,
        teacher: &'static str,
    }

    #[derive(Debug)]
    struct Room {
        id: u32,
        owner: &'static str,
    }

    fn tuple_of(fact: FactRef) -> Tuple {
        let facts: Facts = smallvec![fact];
        Tuple::new(0, facts)
    }

    #[test]
    fn test_zero_columns() {
        let mapping = JoinerUtils::combine_left_mappings(&Joiners::new());
        let tuple = tuple_of(Rc::new(1u8));
        assert_eq!(mapping(&tuple), IndexProperties::None);
    }

    #[test]
    fn test_single_column() {
        let joiners = Joiners::new().equal(
            |t: &Tuple| t.fact::<Lesson>(0).map(|l| l.room),
            |t: &Tuple| t.fact::<Room>(0).map(|r| r.id),
        );
        let lesson = tuple_of(Rc::new(Lesson { room: 4, teacher: "Ada" }));
        let room = tuple_of(Rc::new(Room { id: 4, owner: "Bob" }));

        let left = JoinerUtils::combine_left_mappings(&joiners)(&lesson);
        let right = JoinerUtils::combine_right_mappings(&joiners)(&room);
        assert_eq!(left, IndexProperties::Single(IndexKey::UInt(4)));
        assert_eq!(left, right);
    }

    #[test]
    fn test_many_columns_keep_order() {
        let joiners = Joiners::new()
            .equal(
                |t: &Tuple| t.fact::<Lesson>(0).map(|l| l.room),
                |t: &Tuple| t.fact::<Room>(0).map(|r| r.id),
            )
            .equal(
                |t: &Tuple| t.fact::<Lesson>(0).map(|l| l.teacher),
                |t: &Tuple| t.fact::<Room>(0).map(|r| r.owner),
            );
        assert_eq!(joiners.len(), 2);

        let lesson = tuple_of(Rc::new(Lesson { room: 4, teacher: "Ada" }));
        let room = tuple_of(Rc::new(Room { id: 4, owner: "Bob" }));
        let left = JoinerUtils::combine_left_mappings(&joiners)(&lesson);
        let right = JoinerUtils::combine_right_mappings(&joiners)(&room);

        assert_eq!(left.len(), 2);
        assert_eq!(left.get(1), Some(&IndexKey::from("Ada")));
        assert_ne!(left, right, "second column differs");
    }
}
