use std::any::Any;
use std::sync::Arc;

/// A token naming an observable field of a record (sort keys, associated
/// values). Tokens are compared by string content, so two descriptors using
/// the same name refer to the same field.
pub type FieldKey = &'static str;

/// A cached associated value.
///
/// The cache is deliberately type-erased: the concrete type is validated at
/// the access call site (see [`crate::CollectionController::associated_value`]),
/// not inside the cache.
pub type AssocValue = Arc<dyn Any + Send + Sync>;

/// Identifies a displayed record as a (section index, in-section position)
/// pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Locator {
    pub section: usize,
    pub item: usize,
}

impl Locator {
    pub fn new(section: usize, item: usize) -> Self {
        Self { section, item }
    }
}

/// A single structural transition, parameterized over the location type:
/// [`Locator`] for record events, a section index for section events.
///
/// Events are emitted in an order such that applying them sequentially to a
/// naive mirrored list reproduces the controller's final state exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChangeEvent<L> {
    Insert(L),
    Delete(L),
    Update(L),
    Move { from: L, to: L },
}
