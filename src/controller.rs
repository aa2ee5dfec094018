use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::cache::{AssociatedValueCache, CacheSlot};
use crate::engine::{Emitted, Reconciliation, ReconciliationEngine, SortContext};
use crate::error::ControllerError;
use crate::observe::ObservationRegistry;
use crate::options::{ControllerOptions, CreationEvent};
use crate::record::TrackedRecord;
use crate::schedule::{spawn_sort, CoalescingScheduler, Task};
use crate::sections::Section;
use crate::types::{AssocValue, ChangeEvent, FieldKey, Locator};

/// A live, ordered, sectioned projection over a dynamically changing
/// collection of externally-sourced records.
///
/// The controller owns the fetched set, its section/index bookkeeping, the
/// per-record observations, the coalescing scheduler, and the associated
/// value cache, and reconciles them incrementally: consumers receive a
/// minimal sequence of insert/delete/move/update events instead of full
/// re-renders.
///
/// # Threading
///
/// The controller is a single-owner value driven from one thread (asserted
/// in debug builds). Work that originates elsewhere — observation callbacks,
/// fetch/association completions, broadcasts, background sorts — is queued
/// and applied when the host calls [`flush`](Self::flush) on that thread;
/// queuing fires the configured `on_work` callback once per tick.
pub struct CollectionController<R: TrackedRecord> {
    options: ControllerOptions<R>,
    engine: ReconciliationEngine<R>,
    registry: ObservationRegistry<R>,
    scheduler: CoalescingScheduler<R>,
    cache: AssociatedValueCache<R>,
    observed_fields: Vec<FieldKey>,
    has_fetched: bool,
    sort_epoch: u64,
    affinity: ThreadId,
    _broadcast_subscriptions: Vec<crate::Subscription>,
}

impl<R: TrackedRecord> CollectionController<R> {
    pub fn new(options: ControllerOptions<R>) -> Self {
        let scheduler = CoalescingScheduler::new(options.on_work.clone());
        let handle = scheduler.handle();

        let mut broadcast_subscriptions = Vec::new();
        if let Some(broadcast) = &options.creation_broadcast {
            let h = handle.clone();
            let check = options.inclusion_check.clone();
            broadcast_subscriptions.push(broadcast.subscribe(Arc::new(
                move |event: &CreationEvent<R>| match event {
                    Ok(record) => {
                        if check.as_ref().is_none_or(|c| c(record)) {
                            h.push(Task::Insert(Arc::clone(record)));
                        } else {
                            rtrace!("creation broadcast: candidate excluded");
                        }
                    }
                    Err(e) => {
                        rwarn!(reason = %e.reason, "creation broadcast: malformed record dropped");
                    }
                },
            )));
        }
        if let Some(broadcast) = &options.reset_broadcast {
            let h = handle.clone();
            broadcast_subscriptions.push(broadcast.subscribe(Arc::new(move |_| {
                h.push(Task::Fetch);
            })));
        }
        if let Some(broadcast) = &options.memory_pressure {
            let h = handle.clone();
            broadcast_subscriptions.push(broadcast.subscribe(Arc::new(move |_| {
                h.push(Task::FlushCache);
            })));
        }

        let observed_fields = options.ordering.observed_fields();
        let engine = ReconciliationEngine::new(options.ordering.clone());
        Self {
            options,
            engine,
            registry: ObservationRegistry::new(),
            scheduler,
            cache: AssociatedValueCache::new(),
            observed_fields,
            has_fetched: false,
            sort_epoch: 0,
            affinity: thread::current().id(),
            _broadcast_subscriptions: broadcast_subscriptions,
        }
    }

    pub fn options(&self) -> &ControllerOptions<R> {
        &self.options
    }

    // ------------------------------------------------------------------
    // Fetching and direct mutation
    // ------------------------------------------------------------------

    /// Invokes the fetch source; its completion is marshalled back and
    /// applied as an `assign` on the next [`flush`](Self::flush).
    pub fn perform_fetch(&mut self) {
        self.assert_affinity();
        let Some(source) = self.options.fetch_source.clone() else {
            rwarn!("perform_fetch: no fetch source configured");
            return;
        };
        let handle = self.scheduler.handle();
        source(Box::new(move |records| {
            handle.push(Task::Assign(records));
        }));
    }

    /// Coalesced re-fetch request (also what a data-reset broadcast turns
    /// into).
    pub fn schedule_fetch(&mut self) {
        self.assert_affinity();
        if self.options.coalesce {
            self.scheduler.handle().push(Task::Fetch);
        } else {
            self.perform_fetch();
        }
    }

    /// Replaces the base fetch set, emitting a minimal diff against the
    /// current one. Batches above the large-batch threshold are sorted on a
    /// worker thread and applied on the next tick.
    pub fn assign(&mut self, records: Vec<Arc<R>>) {
        self.assert_affinity();
        self.has_fetched = true;
        // Any in-flight background sort is now stale.
        self.sort_epoch += 1;
        if records.len() > self.options.large_batch_threshold {
            let (target, context) = self.engine.begin_assign(records);
            spawn_sort(
                target,
                context,
                self.sort_epoch,
                true,
                self.scheduler.handle(),
            );
            return;
        }
        let reconciliation = self.engine.assign(records);
        self.apply(reconciliation);
    }

    /// Inserts externally-created records; deleted or already-present
    /// identities are filtered out.
    pub fn insert_new(&mut self, records: Vec<Arc<R>>) {
        self.assert_affinity();
        let batch = self.engine.filter_insertable(records);
        if batch.is_empty() {
            return;
        }
        if batch.len() > self.options.large_batch_threshold {
            spawn_sort(
                batch,
                self.engine.sort_context(),
                self.sort_epoch,
                false,
                self.scheduler.handle(),
            );
            return;
        }
        let reconciliation = self.engine.apply_inserts(batch);
        self.apply(reconciliation);
    }

    /// Removes one record immediately.
    pub fn remove(&mut self, id: &R::Id) -> Result<(), ControllerError> {
        self.assert_affinity();
        let reconciliation = self.engine.remove(id)?;
        self.apply(reconciliation);
        Ok(())
    }

    /// Full teardown: every record, then every section, then all
    /// observations and cache entries.
    pub fn remove_all(&mut self) {
        self.assert_affinity();
        // A background sort still in flight must not resurrect the set.
        self.sort_epoch += 1;
        let reconciliation = self.engine.remove_all();
        // Wholesale teardown instead of per-record upkeep; the epoch bump in
        // `flush` also invalidates any in-flight association batch.
        self.registry.clear();
        self.cache.flush();
        self.emit(&reconciliation.events);
    }

    // ------------------------------------------------------------------
    // Scheduled (coalescable) mutation
    // ------------------------------------------------------------------

    /// Requests an `update` emission for a record whose payload changed.
    /// With coalescing enabled this is collapsed with other requests
    /// arriving before the next tick; otherwise it reconciles immediately.
    pub fn schedule_reload(&mut self, id: R::Id) {
        self.assert_affinity();
        if self.options.coalesce {
            self.scheduler.handle().push(Task::PayloadChanged(id));
        } else {
            self.route_payload_change(id);
        }
    }

    /// Requests insertion of an externally-created record.
    pub fn schedule_insert(&mut self, record: Arc<R>) {
        self.assert_affinity();
        if self.options.coalesce {
            self.scheduler.handle().push(Task::Insert(record));
        } else {
            self.insert_new(vec![record]);
        }
    }

    /// Whether deferred work is queued for the next [`flush`](Self::flush).
    pub fn has_pending(&self) -> bool {
        self.scheduler.is_armed()
    }

    /// Drains and applies all deferred work. Call on the affinity thread,
    /// typically in response to the `on_work` callback.
    pub fn flush(&mut self) {
        self.assert_affinity();
        let tasks = self.scheduler.drain();
        if tasks.is_empty() {
            return;
        }
        rtrace!(tasks = tasks.len(), coalesce = self.options.coalesce, "flush");
        if self.options.coalesce {
            self.flush_coalesced(tasks);
        } else {
            for task in tasks {
                self.apply_task(task);
            }
        }
    }

    // ------------------------------------------------------------------
    // Associated values
    // ------------------------------------------------------------------

    /// Current associated value for `(id, field)`, or `None` when the value
    /// is not yet resolved.
    ///
    /// A miss faults a whole window of up to `associated_window_size`
    /// records centered on the record's flat index (the whole set when the
    /// size is 0), restricted to entries that are neither cached nor already
    /// pending, and issues exactly one batched request for it. Resolution
    /// arrives via [`flush`](Self::flush) and emits an `update` per newly
    /// resolved record.
    pub fn associated_value(&mut self, id: &R::Id, field: FieldKey) -> Option<AssocValue> {
        self.assert_affinity();
        match self.cache.slot(id, field) {
            Some(CacheSlot::Resolved { value, .. }) => return value.clone(),
            Some(CacheSlot::Pending) => return None,
            None => {}
        }
        let Some(slot) = self.engine.state().slot_of(id) else {
            rtrace!(id = ?id, "associated_value: record not tracked");
            return None;
        };
        let Some(source) = self.options.association_source.clone() else {
            return None;
        };

        let flat_ids = self.engine.state().flat_ids();
        let window = self.options.associated_window_size;
        let (start, end) = if window == 0 {
            (0, flat_ids.len())
        } else {
            let start = slot.flat.saturating_sub(window / 2);
            let end = (start + window).min(flat_ids.len());
            (end.saturating_sub(window), end)
        };

        let mut requested = Vec::new();
        for fid in &flat_ids[start..end] {
            if !self.cache.is_known(fid, field) {
                self.cache.mark_pending(fid.clone(), field);
                requested.push(fid.clone());
            }
        }
        if requested.is_empty() {
            return None;
        }
        rdebug!(field, count = requested.len(), "association batch fetch");

        let handle = self.scheduler.handle();
        let epoch = self.cache.epoch();
        let ids = requested.clone();
        source(
            field,
            requested,
            Box::new(move |values| {
                handle.push(Task::AssociationsResolved {
                    field,
                    epoch,
                    requested: ids,
                    values,
                });
            }),
        );
        None
    }

    /// Drops every cache entry (e.g. on memory pressure) and re-emits an
    /// `update` for every displayed record: values become unresolved again,
    /// to be re-faulted on next access.
    pub fn flush_associations(&mut self) {
        self.assert_affinity();
        self.cache.flush();
        let mut events = Vec::new();
        self.engine.state().for_each(|record, locator| {
            events.push(Emitted::Record {
                record: Arc::clone(record),
                event: ChangeEvent::Update(locator),
            });
        });
        self.emit(&events);
    }

    // ------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------

    pub fn sections(&self) -> &[Section<R>] {
        self.engine.state().sections()
    }

    pub fn object_at(&self, locator: Locator) -> Option<&Arc<R>> {
        self.engine.state().record_at(locator)
    }

    pub fn locator_for(&self, id: &R::Id) -> Option<Locator> {
        self.engine.state().locator_of(id)
    }

    /// The displayed position after `locator`, crossing section boundaries.
    pub fn locator_after(&self, locator: Locator) -> Option<Locator> {
        let sections = self.sections();
        let section = sections.get(locator.section)?;
        if locator.item + 1 < section.len() {
            return Some(Locator::new(locator.section, locator.item + 1));
        }
        if locator.section + 1 < sections.len() {
            return Some(Locator::new(locator.section + 1, 0));
        }
        None
    }

    /// The displayed position before `locator`, crossing section boundaries.
    pub fn locator_before(&self, locator: Locator) -> Option<Locator> {
        if locator.item > 0 {
            return Some(Locator::new(locator.section, locator.item - 1));
        }
        let prev = locator.section.checked_sub(1)?;
        let section = self.sections().get(prev)?;
        Some(Locator::new(prev, section.len() - 1))
    }

    pub fn fetched_records(&self) -> Vec<Arc<R>> {
        let mut out = Vec::with_capacity(self.len());
        self.engine
            .state()
            .for_each(|record, _| out.push(Arc::clone(record)));
        out
    }

    pub fn fetched_ids(&self) -> Vec<R::Id> {
        self.engine.state().flat_ids()
    }

    pub fn for_each_fetched(&self, f: impl FnMut(&Arc<R>, Locator)) {
        self.engine.state().for_each(f);
    }

    /// Whether a fetch has completed (stays true even if the set later
    /// empties).
    pub fn has_fetched_objects(&self) -> bool {
        self.has_fetched
    }

    pub fn len(&self) -> usize {
        self.engine.state().flat_len()
    }

    pub fn is_empty(&self) -> bool {
        self.engine.state().is_empty()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn assert_affinity(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.affinity,
            "CollectionController must be driven from its owning thread"
        );
    }

    fn flush_coalesced(&mut self, tasks: Vec<Task<R>>) {
        let mut removes: Vec<R::Id> = Vec::new();
        let mut moves: Vec<R::Id> = Vec::new();
        let mut reloads: Vec<R::Id> = Vec::new();
        let mut inserts: Vec<Arc<R>> = Vec::new();
        let mut association_tasks: Vec<Task<R>> = Vec::new();
        let mut fetch = false;

        for task in tasks {
            match task {
                Task::Assign(records) => self.assign(records),
                Task::SortedAssign {
                    records,
                    context,
                    epoch,
                } => self.apply_sorted_assign(records, context, epoch),
                Task::SortedInsert { records, epoch } => self.apply_sorted_insert(records, epoch),
                Task::Insert(record) => {
                    if !inserts.iter().any(|r| r.identity() == record.identity()) {
                        inserts.push(record);
                    }
                }
                Task::PayloadChanged(id) => {
                    if !reloads.contains(&id) {
                        reloads.push(id);
                    }
                }
                Task::DeletedChanged(id) => {
                    if !removes.contains(&id) {
                        removes.push(id);
                    }
                }
                Task::SortKeyChanged(id) => {
                    if !moves.contains(&id) {
                        moves.push(id);
                    }
                }
                Task::Fetch => fetch = true,
                t @ (Task::AssociationsResolved { .. }
                | Task::AssociationInvalidated { .. }
                | Task::FlushCache) => association_tasks.push(t),
            }
        }

        // A payload change on a record whose deleted flag is now set is a
        // removal, not a reload.
        let mut reload_batch = Vec::with_capacity(reloads.len());
        for id in reloads {
            match self.engine.state().locator_of(&id) {
                Some(locator) => {
                    let deleted = self
                        .engine
                        .state()
                        .record_at(locator)
                        .is_some_and(|r| r.is_deleted());
                    if deleted {
                        if !removes.contains(&id) {
                            removes.push(id);
                        }
                    } else {
                        reload_batch.push(id);
                    }
                }
                None => rdebug!(id = ?id, "reload: record no longer tracked, skipped"),
            }
        }

        for id in removes {
            match self.engine.remove(&id) {
                Ok(reconciliation) => self.apply(reconciliation),
                Err(e) => rdebug!(error = %e, "scheduled remove skipped"),
            }
        }
        for id in moves {
            let reconciliation = self.engine.relocate(&id);
            self.apply(reconciliation);
        }
        if !inserts.is_empty() {
            self.insert_new(inserts);
        }
        if !reload_batch.is_empty() {
            let reconciliation = self.engine.reload(&reload_batch);
            self.apply(reconciliation);
        }

        for task in association_tasks {
            self.apply_task(task);
        }
        if fetch {
            self.perform_fetch();
        }
    }

    fn apply_task(&mut self, task: Task<R>) {
        match task {
            Task::Assign(records) => self.assign(records),
            Task::SortedAssign {
                records,
                context,
                epoch,
            } => self.apply_sorted_assign(records, context, epoch),
            Task::SortedInsert { records, epoch } => self.apply_sorted_insert(records, epoch),
            Task::Insert(record) => self.insert_new(vec![record]),
            Task::PayloadChanged(id) => self.route_payload_change(id),
            Task::DeletedChanged(id) => match self.engine.remove(&id) {
                Ok(reconciliation) => self.apply(reconciliation),
                Err(e) => rdebug!(error = %e, "scheduled remove skipped"),
            },
            Task::SortKeyChanged(id) => {
                let reconciliation = self.engine.relocate(&id);
                self.apply(reconciliation);
            }
            Task::Fetch => self.perform_fetch(),
            Task::AssociationsResolved {
                field,
                epoch,
                requested,
                values,
            } => self.apply_association_batch(field, epoch, requested, values),
            Task::AssociationInvalidated { id, field } => {
                if self.cache.invalidate(&id, field) {
                    let reconciliation = self.engine.reload(std::slice::from_ref(&id));
                    self.apply(reconciliation);
                }
            }
            Task::FlushCache => self.flush_associations(),
        }
    }

    fn apply_sorted_assign(&mut self, records: Vec<Arc<R>>, context: SortContext<R>, epoch: u64) {
        if epoch != self.sort_epoch {
            rdebug!(epoch, current = self.sort_epoch, "stale background sort discarded");
            return;
        }
        let reconciliation = self.engine.apply_sorted(records, context);
        self.apply(reconciliation);
    }

    fn apply_sorted_insert(&mut self, records: Vec<Arc<R>>, epoch: u64) {
        if epoch != self.sort_epoch {
            rdebug!(epoch, current = self.sort_epoch, "stale background sort discarded");
            return;
        }
        // Re-validate: records may have been assigned or deleted while the
        // sort was in flight.
        let batch = self.engine.filter_insertable(records);
        if batch.is_empty() {
            return;
        }
        let reconciliation = self.engine.apply_inserts(batch);
        self.apply(reconciliation);
    }

    fn route_payload_change(&mut self, id: R::Id) {
        let Some(locator) = self.engine.state().locator_of(&id) else {
            rdebug!(id = ?id, "reload: record no longer tracked, skipped");
            return;
        };
        let deleted = self
            .engine
            .state()
            .record_at(locator)
            .is_some_and(|r| r.is_deleted());
        let reconciliation = if deleted {
            match self.engine.remove(&id) {
                Ok(r) => r,
                Err(_) => return,
            }
        } else {
            self.engine.reload(std::slice::from_ref(&id))
        };
        self.apply(reconciliation);
    }

    fn apply_association_batch(
        &mut self,
        field: FieldKey,
        epoch: u64,
        requested: Vec<R::Id>,
        values: std::collections::HashMap<R::Id, AssocValue>,
    ) {
        if let Err(e) = self.cache.check_epoch(epoch) {
            rwarn!(error = %e, field, "association batch discarded");
            return;
        }
        let mut events = Vec::new();
        for id in requested {
            let Some(locator) = self.engine.state().locator_of(&id) else {
                // The record left the set while the batch was in flight.
                self.cache.invalidate(&id, field);
                continue;
            };
            let record = match self.engine.state().record_at(locator) {
                Some(r) => Arc::clone(r),
                None => continue,
            };
            let value = values.get(&id).cloned();
            let invalidation = match (&value, &self.options.association_invalidation) {
                (Some(_), Some(hook)) => {
                    let handle = self.scheduler.handle();
                    let observed = id.clone();
                    Some(hook(
                        &record,
                        field,
                        Arc::new(move || {
                            handle.push(Task::AssociationInvalidated {
                                id: observed.clone(),
                                field,
                            });
                        }),
                    ))
                }
                _ => None,
            };
            if self.cache.resolve(&id, field, value, invalidation) {
                events.push(Emitted::Record {
                    record,
                    event: ChangeEvent::Update(locator),
                });
            }
        }
        self.emit(&events);
    }

    /// Registry/cache upkeep for a membership delta, then event emission.
    /// State is final before the first sink call.
    fn apply(&mut self, reconciliation: Reconciliation<R>) {
        for record in &reconciliation.removed {
            let id = record.identity();
            self.registry.untrack(&id);
            self.cache.remove_record(&id);
        }
        if !reconciliation.added.is_empty() {
            let handle = self.scheduler.handle();
            for record in &reconciliation.added {
                self.registry.track(record, &self.observed_fields, &handle);
            }
        }
        self.emit(&reconciliation.events);
    }

    fn emit(&self, events: &[Emitted<R>]) {
        if events.is_empty() {
            return;
        }
        let Some(sink) = self.options.sink.clone() else {
            return;
        };
        sink.will_change_batch(self);
        for event in events {
            match event {
                Emitted::Record { record, event } => sink.record_changed(self, record, *event),
                Emitted::Section { name, event } => sink.section_changed(self, name, *event),
            }
        }
        sink.did_change_batch(self);
    }

    #[cfg(test)]
    pub(crate) fn tracked_observation_count(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    pub(crate) fn cached_association_count(&self) -> usize {
        self.cache.len()
    }
}

impl<R: TrackedRecord> std::fmt::Debug for CollectionController<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionController")
            .field("sections", &self.sections().len())
            .field("records", &self.len())
            .field("has_fetched", &self.has_fetched)
            .field("pending", &self.has_pending())
            .finish_non_exhaustive()
    }
}
