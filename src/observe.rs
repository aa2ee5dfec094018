use std::collections::HashMap;
use std::sync::Arc;

use crate::record::{Subscription, TrackedRecord};
use crate::schedule::{Task, TaskHandle};
use crate::FieldKey;

/// Per-record set of cancelable subscriptions: payload, deleted flag, and
/// one per sort-relevant field.
///
/// Subscriptions are keyed by identity, not embedded in the record, and the
/// whole set for a record is dropped atomically when it leaves the tracked
/// set. Observers only enqueue tasks; a task for an identity that is no
/// longer tracked is skipped at drain time, so a record can never receive a
/// structural mutation from a stale callback.
pub(crate) struct ObservationRegistry<R: TrackedRecord> {
    subscriptions: HashMap<R::Id, Vec<Subscription>>,
}

impl<R: TrackedRecord> ObservationRegistry<R> {
    pub(crate) fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
        }
    }

    pub(crate) fn track(
        &mut self,
        record: &Arc<R>,
        sort_fields: &[FieldKey],
        handle: &TaskHandle<R>,
    ) {
        let id = record.identity();
        let mut subs = Vec::with_capacity(sort_fields.len() + 2);

        let (h, observed) = (handle.clone(), id.clone());
        subs.push(record.on_payload_change(Arc::new(move || {
            h.push(Task::PayloadChanged(observed.clone()));
        })));

        let (h, observed) = (handle.clone(), id.clone());
        subs.push(record.on_deleted_change(Arc::new(move || {
            h.push(Task::DeletedChanged(observed.clone()));
        })));

        for &field in sort_fields {
            let (h, observed) = (handle.clone(), id.clone());
            subs.push(record.on_field_change(
                field,
                Arc::new(move || {
                    h.push(Task::SortKeyChanged(observed.clone()));
                }),
            ));
        }

        if self.subscriptions.insert(id.clone(), subs).is_some() {
            rwarn!(id = ?id, "observation registry: replaced existing subscriptions");
        }
    }

    pub(crate) fn untrack(&mut self, id: &R::Id) {
        self.subscriptions.remove(id);
    }

    pub(crate) fn clear(&mut self) {
        self.subscriptions.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}
