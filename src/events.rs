use std::sync::Arc;

use crate::controller::CollectionController;
use crate::record::TrackedRecord;
use crate::types::{ChangeEvent, Locator};

/// Consumer of structural change events.
///
/// Methods take `&self` (keep interior mutability on your side) and receive
/// the controller, which is already in its post-mutation state: querying it
/// from inside a callback is safe and observes the final layout of the
/// batch.
///
/// Replaying the `record_changed`/`section_changed` calls of one batch, in
/// order, against a naive mirrored list reproduces that layout exactly.
pub trait ChangeEventSink<R: TrackedRecord>: Send + Sync {
    fn will_change_batch(&self, controller: &CollectionController<R>) {
        let _ = controller;
    }

    fn record_changed(
        &self,
        controller: &CollectionController<R>,
        record: &Arc<R>,
        event: ChangeEvent<Locator>,
    );

    /// `name` is the section key; for section inserts the section already
    /// exists at the event's index, for deletes it is already gone.
    fn section_changed(
        &self,
        controller: &CollectionController<R>,
        name: &str,
        event: ChangeEvent<usize>,
    );

    fn did_change_batch(&self, controller: &CollectionController<R>) {
        let _ = controller;
    }
}
