use thiserror::Error;

/// Recoverable error conditions.
///
/// Nothing in this enum aborts the controller. `NotFound` is surfaced only by
/// [`crate::CollectionController::remove`]; every other operation degrades to
/// a logged skip. `Stale` is an internal discard reason for asynchronous
/// results that arrived after their target became invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    /// The operation referenced a record that is no longer tracked.
    #[error("record not found: {id}")]
    NotFound { id: String },

    /// An asynchronous result arrived for a superseded epoch and was
    /// discarded.
    #[error("stale result discarded (epoch {got}, current {current})")]
    Stale { got: u64, current: u64 },
}

/// A raw payload that failed to construct a record.
///
/// Creation broadcasts carry `Result<Arc<R>, MalformedRecord>`; a malformed
/// candidate is logged and dropped, it never reaches the fetched set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record: {reason}")]
pub struct MalformedRecord {
    pub reason: String,
}

impl MalformedRecord {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
