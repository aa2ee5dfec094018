use std::collections::HashMap;

use crate::error::ControllerError;
use crate::record::{Subscription, TrackedRecord};
use crate::types::{AssocValue, FieldKey};

/// State of one `(identity, field)` cache entry.
pub(crate) enum CacheSlot {
    /// A batched fetch covering this entry is in flight.
    Pending,
    /// Resolved; `None` is a valid terminal value (the source had nothing
    /// for this identity). The invalidation subscription, if any, cancels
    /// when the entry is dropped.
    Resolved {
        value: Option<AssocValue>,
        _invalidation: Option<Subscription>,
    },
}

/// Windowed associated-value cache. One batched request per window, never
/// one per record.
///
/// The cache itself is passive bookkeeping; the controller computes windows,
/// issues requests, and marshals completions back through the scheduler. The
/// epoch counter guards against batch completions that arrive after a flush:
/// such results refer to entries that no longer exist and are discarded.
pub(crate) struct AssociatedValueCache<R: TrackedRecord> {
    entries: HashMap<(R::Id, FieldKey), CacheSlot>,
    epoch: u64,
}

impl<R: TrackedRecord> AssociatedValueCache<R> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            epoch: 0,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn slot(&self, id: &R::Id, field: FieldKey) -> Option<&CacheSlot> {
        self.entries.get(&(id.clone(), field))
    }

    pub(crate) fn is_known(&self, id: &R::Id, field: FieldKey) -> bool {
        self.entries.contains_key(&(id.clone(), field))
    }

    pub(crate) fn mark_pending(&mut self, id: R::Id, field: FieldKey) {
        self.entries.insert((id, field), CacheSlot::Pending);
    }

    /// Transitions a pending entry to resolved. Returns `false` when the
    /// entry is gone or was already resolved (e.g. the record was removed
    /// while the batch was in flight).
    pub(crate) fn resolve(
        &mut self,
        id: &R::Id,
        field: FieldKey,
        value: Option<AssocValue>,
        invalidation: Option<Subscription>,
    ) -> bool {
        match self.entries.get_mut(&(id.clone(), field)) {
            Some(slot @ CacheSlot::Pending) => {
                *slot = CacheSlot::Resolved {
                    value,
                    _invalidation: invalidation,
                };
                true
            }
            _ => false,
        }
    }

    /// Validates a completion against the current epoch.
    pub(crate) fn check_epoch(&self, got: u64) -> Result<(), ControllerError> {
        if got == self.epoch {
            Ok(())
        } else {
            Err(ControllerError::Stale {
                got,
                current: self.epoch,
            })
        }
    }

    /// Drops a single entry; returns whether it existed.
    pub(crate) fn invalidate(&mut self, id: &R::Id, field: FieldKey) -> bool {
        self.entries.remove(&(id.clone(), field)).is_some()
    }

    /// Entries never outlive their record's presence in the fetched set.
    pub(crate) fn remove_record(&mut self, id: &R::Id) {
        self.entries.retain(|(eid, _), _| eid != id);
    }

    /// Wholesale drop (memory pressure). Bumping the epoch invalidates every
    /// in-flight batch.
    pub(crate) fn flush(&mut self) {
        rdebug!(entries = self.entries.len(), "association cache flushed");
        self.entries.clear();
        self.epoch += 1;
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
