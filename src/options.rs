use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::MalformedRecord;
use crate::events::ChangeEventSink;
use crate::ordering::OrderingSpec;
use crate::record::{Broadcast, TrackedRecord};
use crate::schedule::WakeCallback;
use crate::types::{AssocValue, FieldKey};
use crate::ChangeObserver;
use crate::Subscription;

type IdOf<R> = <R as TrackedRecord>::Id;

/// One-shot completion for a bulk fetch.
pub type FetchCompletion<R> = Box<dyn FnOnce(Vec<Arc<R>>) + Send>;

/// The external bulk-fetch collaborator, invoked on `perform_fetch`.
///
/// The completion may run on any thread; the controller marshals the result
/// back to the affinity thread. By contract the completion must eventually be
/// invoked — a source that never completes leaves the controller without a
/// fetched set, which is a caller bug, not a recoverable state.
pub type FetchSource<R> = Arc<dyn Fn(FetchCompletion<R>) + Send + Sync>;

/// Completion for a batched associated-value fetch. Identities missing from
/// the mapping resolve to `None` (a valid, terminal, non-retrying state).
pub type AssociationCompletion<R> =
    Box<dyn FnOnce(HashMap<IdOf<R>, AssocValue>) + Send>;

/// The external associated-value collaborator. Receives the whole restricted
/// window in a single call; issuing one request per record is exactly what
/// the windowing exists to avoid.
pub type AssociationSource<R> =
    Arc<dyn Fn(FieldKey, Vec<IdOf<R>>, AssociationCompletion<R>) + Send + Sync>;

/// Wires an invalidation observer to the external source of a resolved
/// associated value. Firing the observer invalidates exactly that cache
/// entry and re-emits an update for the owning record.
pub type AssociationInvalidationHook<R> =
    Arc<dyn Fn(&Arc<R>, FieldKey, ChangeObserver) -> Subscription + Send + Sync>;

/// Predicate applied to creation-broadcast candidates before insertion.
pub type InclusionCheck<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// Payload of a creation broadcast: a constructed record, or the reason the
/// raw payload failed to become one (logged and dropped).
pub type CreationEvent<R> = Result<Arc<R>, MalformedRecord>;

/// Configuration for [`crate::CollectionController`].
///
/// Cheap to clone: collaborators are stored as `Arc`s, so embedders can
/// tweak a few knobs and hand the options over without reallocating
/// closures.
pub struct ControllerOptions<R: TrackedRecord> {
    pub ordering: OrderingSpec<R>,

    /// When `true` (the default), change requests arriving before the next
    /// processing tick are collapsed into one batched reconciliation per
    /// kind. When `false`, direct calls reconcile synchronously and queued
    /// tasks are applied one at a time.
    pub coalesce: bool,

    /// Window size for associated-value faulting, centered on the accessed
    /// record's flat index. `0` means the whole fetched set.
    pub associated_window_size: usize,

    /// Batches larger than this are sorted on a worker thread and applied
    /// on the next tick.
    pub large_batch_threshold: usize,

    pub fetch_source: Option<FetchSource<R>>,
    pub association_source: Option<AssociationSource<R>>,
    pub association_invalidation: Option<AssociationInvalidationHook<R>>,
    pub inclusion_check: Option<InclusionCheck<R>>,

    pub creation_broadcast: Option<Arc<dyn Broadcast<CreationEvent<R>>>>,
    pub reset_broadcast: Option<Arc<dyn Broadcast<()>>>,
    pub memory_pressure: Option<Arc<dyn Broadcast<()>>>,

    /// Receives the structural change events.
    pub sink: Option<Arc<dyn ChangeEventSink<R>>>,

    /// Fired (once per tick) when deferred work is queued; the host should
    /// schedule a `flush()` on the affinity thread.
    pub on_work: Option<WakeCallback>,
}

impl<R: TrackedRecord> ControllerOptions<R> {
    pub fn new(ordering: OrderingSpec<R>) -> Self {
        Self {
            ordering,
            coalesce: true,
            associated_window_size: 0,
            large_batch_threshold: 100,
            fetch_source: None,
            association_source: None,
            association_invalidation: None,
            inclusion_check: None,
            creation_broadcast: None,
            reset_broadcast: None,
            memory_pressure: None,
            sink: None,
            on_work: None,
        }
    }

    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn with_associated_window_size(mut self, size: usize) -> Self {
        self.associated_window_size = size;
        self
    }

    pub fn with_large_batch_threshold(mut self, threshold: usize) -> Self {
        self.large_batch_threshold = threshold;
        self
    }

    pub fn with_fetch_source(
        mut self,
        source: impl Fn(FetchCompletion<R>) + Send + Sync + 'static,
    ) -> Self {
        self.fetch_source = Some(Arc::new(source));
        self
    }

    pub fn with_association_source(
        mut self,
        source: impl Fn(FieldKey, Vec<IdOf<R>>, AssociationCompletion<R>) + Send + Sync + 'static,
    ) -> Self {
        self.association_source = Some(Arc::new(source));
        self
    }

    pub fn with_association_invalidation(
        mut self,
        hook: impl Fn(&Arc<R>, FieldKey, ChangeObserver) -> Subscription + Send + Sync + 'static,
    ) -> Self {
        self.association_invalidation = Some(Arc::new(hook));
        self
    }

    pub fn with_inclusion_check(
        mut self,
        check: impl Fn(&R) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.inclusion_check = Some(Arc::new(check));
        self
    }

    pub fn with_creation_broadcast(
        mut self,
        broadcast: Arc<dyn Broadcast<CreationEvent<R>>>,
    ) -> Self {
        self.creation_broadcast = Some(broadcast);
        self
    }

    pub fn with_reset_broadcast(mut self, broadcast: Arc<dyn Broadcast<()>>) -> Self {
        self.reset_broadcast = Some(broadcast);
        self
    }

    pub fn with_memory_pressure(mut self, broadcast: Arc<dyn Broadcast<()>>) -> Self {
        self.memory_pressure = Some(broadcast);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeEventSink<R>>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_on_work(mut self, on_work: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_work = Some(Arc::new(on_work));
        self
    }
}

impl<R: TrackedRecord> Clone for ControllerOptions<R> {
    fn clone(&self) -> Self {
        Self {
            ordering: self.ordering.clone(),
            coalesce: self.coalesce,
            associated_window_size: self.associated_window_size,
            large_batch_threshold: self.large_batch_threshold,
            fetch_source: self.fetch_source.clone(),
            association_source: self.association_source.clone(),
            association_invalidation: self.association_invalidation.clone(),
            inclusion_check: self.inclusion_check.clone(),
            creation_broadcast: self.creation_broadcast.clone(),
            reset_broadcast: self.reset_broadcast.clone(),
            memory_pressure: self.memory_pressure.clone(),
            sink: self.sink.clone(),
            on_work: self.on_work.clone(),
        }
    }
}

impl<R: TrackedRecord> fmt::Debug for ControllerOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerOptions")
            .field("ordering", &self.ordering)
            .field("coalesce", &self.coalesce)
            .field("associated_window_size", &self.associated_window_size)
            .field("large_batch_threshold", &self.large_batch_threshold)
            .finish_non_exhaustive()
    }
}
