use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::diff::diff_keys;
use crate::error::ControllerError;
use crate::ordering::{FetchOrder, OrderingSpec};
use crate::record::TrackedRecord;
use crate::sections::{Section, SectionedState};
use crate::types::{ChangeEvent, Locator};

/// One event produced by a reconciliation, in the exact order a consumer
/// should apply it to a mirrored list.
pub(crate) enum Emitted<R> {
    Record {
        record: Arc<R>,
        event: ChangeEvent<Locator>,
    },
    Section {
        name: String,
        event: ChangeEvent<usize>,
    },
}

/// The result of one atomic engine operation: the ordered events plus the
/// membership delta. `added`/`removed` list only records that actually
/// entered or left the fetched set; a retained record re-inserted at a new
/// position appears in neither.
pub(crate) struct Reconciliation<R> {
    pub events: Vec<Emitted<R>>,
    pub added: Vec<Arc<R>>,
    pub removed: Vec<Arc<R>>,
}

impl<R> Reconciliation<R> {
    pub(crate) fn empty() -> Self {
        Self {
            events: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Everything needed to sort a batch off the affinity thread: a cloned
/// comparator chain and the pending rank table. Cheap to build (the
/// closures are `Arc`s), safe to ship to a worker. For an assign, the rank
/// table it carries is installed only when the sorted result is applied, so
/// a superseded sort never touches the live table.
pub(crate) struct SortContext<R: TrackedRecord> {
    ordering: OrderingSpec<R>,
    order: FetchOrder<R::Id>,
}

impl<R: TrackedRecord> SortContext<R> {
    pub(crate) fn sort(&self, records: &mut [Arc<R>]) {
        records.sort_by(|a, b| {
            let ord = self.ordering.compare(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
            self.order.rank(&a.identity()).cmp(&self.order.rank(&b.identity()))
        });
    }
}

/// Computes and applies insert/delete/move/update transitions against the
/// ordered, sectioned collection.
///
/// Every public operation is individually atomic against the in-memory
/// model: state is fully mutated before the caller sees any event, so a
/// consumer reacting to an event observes consistent post-mutation state.
pub(crate) struct ReconciliationEngine<R: TrackedRecord> {
    ordering: OrderingSpec<R>,
    fetch_order: FetchOrder<R::Id>,
    state: SectionedState<R>,
}

impl<R: TrackedRecord> ReconciliationEngine<R> {
    pub(crate) fn new(ordering: OrderingSpec<R>) -> Self {
        Self {
            ordering,
            fetch_order: FetchOrder::new(),
            state: SectionedState::new(),
        }
    }

    pub(crate) fn state(&self) -> &SectionedState<R> {
        &self.state
    }

    pub(crate) fn ordering(&self) -> &OrderingSpec<R> {
        &self.ordering
    }

    /// Replaces the base fetch set with `records`, emitting a minimal diff.
    pub(crate) fn assign(&mut self, records: Vec<Arc<R>>) -> Reconciliation<R> {
        let (mut target, context) = self.begin_assign(records);
        context.sort(&mut target);
        self.apply_sorted(target, context)
    }

    /// First half of `assign`: deduplicates identities, swaps in existing
    /// instances for carried-over identities, and computes the unioned
    /// fetch-order table into the returned [`SortContext`]. Nothing is
    /// committed here; [`Self::apply_sorted`] installs the table, so large
    /// batches can be sorted off-thread and discarded without side effects.
    pub(crate) fn begin_assign(
        &mut self,
        records: Vec<Arc<R>>,
    ) -> (Vec<Arc<R>>, SortContext<R>) {
        let mut seen: HashSet<R::Id> = HashSet::with_capacity(records.len());
        let mut target: Vec<Arc<R>> = Vec::with_capacity(records.len());
        for record in records {
            let id = record.identity();
            if !seen.insert(id.clone()) {
                rwarn!(id = ?id, "assign: duplicate identity dropped");
                continue;
            }
            // Instance preservation: keep the tracked instance so existing
            // field subscriptions and consumer references stay valid.
            match self.state.slot_of(&id) {
                Some(slot) => match self.state.record_at(slot.locator) {
                    Some(existing) => target.push(Arc::clone(existing)),
                    None => target.push(record),
                },
                None => target.push(record),
            }
        }

        let ids: Vec<R::Id> = target.iter().map(|r| r.identity()).collect();
        let context = SortContext {
            ordering: self.ordering.clone(),
            order: self.fetch_order.unioned(ids.iter()),
        };
        (target, context)
    }

    /// Second half of `assign`: commits the context's rank table, then diffs
    /// the current flat sequence against the sorted target and applies
    /// removals (descending) then insertions (ascending), recording events
    /// as each element lands.
    pub(crate) fn apply_sorted(
        &mut self,
        target: Vec<Arc<R>>,
        context: SortContext<R>,
    ) -> Reconciliation<R> {
        self.fetch_order = context.order;
        let old_ids = self.state.flat_ids();
        let new_ids: Vec<R::Id> = target.iter().map(|r| r.identity()).collect();
        let diff = diff_keys(&old_ids, &new_ids);
        rdebug!(
            old = old_ids.len(),
            new = new_ids.len(),
            removals = diff.removals.len(),
            insertions = diff.insertions.len(),
            "assign"
        );

        let old_set: HashSet<&R::Id> = old_ids.iter().collect();
        let new_set: HashSet<&R::Id> = new_ids.iter().collect();

        let mut events = Vec::new();
        let mut added = Vec::new();
        let mut removed = Vec::new();

        // Removals descend over old flat indexes, so every locator captured
        // here is still valid when its turn comes.
        let locators = self.state.flat_locators();
        for &i in &diff.removals {
            let locator = locators[i];
            let record = self.state.remove_member(locator);
            events.push(Emitted::Record {
                record: Arc::clone(&record),
                event: ChangeEvent::Delete(locator),
            });
            self.drop_section_if_empty(locator.section, &mut events);
            if !new_set.contains(&old_ids[i]) {
                removed.push(record);
            }
        }

        for &j in &diff.insertions {
            let record = Arc::clone(&target[j]);
            self.insert_record(Arc::clone(&record), &mut events);
            if !old_set.contains(&new_ids[j]) {
                added.push(record);
            }
        }

        Reconciliation {
            events,
            added,
            removed,
        }
    }

    /// Inserts externally-created records: deleted or already-present
    /// identities are filtered out, the remainder is sorted and inserted
    /// one element at a time.
    pub(crate) fn insert_new(&mut self, records: Vec<Arc<R>>) -> Reconciliation<R> {
        let batch = self.filter_insertable(records);
        self.apply_inserts(batch)
    }

    /// Filters an insert batch (deleted, already tracked, duplicate within
    /// the batch). Split out so large batches can be sorted off-thread
    /// before [`Self::apply_inserts`].
    pub(crate) fn filter_insertable(&self, records: Vec<Arc<R>>) -> Vec<Arc<R>> {
        let mut seen: HashSet<R::Id> = HashSet::with_capacity(records.len());
        let mut batch = Vec::with_capacity(records.len());
        for record in records {
            let id = record.identity();
            if record.is_deleted() {
                rdebug!(id = ?id, "insert_new: deleted record skipped");
                continue;
            }
            if self.state.contains(&id) {
                rdebug!(id = ?id, "insert_new: already tracked, skipped");
                continue;
            }
            if !seen.insert(id) {
                continue;
            }
            batch.push(record);
        }
        batch
    }

    pub(crate) fn apply_inserts(&mut self, mut batch: Vec<Arc<R>>) -> Reconciliation<R> {
        // Ranks are assigned at apply time, not at spawn time; a presort
        // that gets discarded leaves no residue in the table.
        for record in &batch {
            self.fetch_order.note(record.identity());
        }
        let ctx = self.sort_context();
        ctx.sort(&mut batch);

        let mut events = Vec::new();
        for record in &batch {
            self.insert_record(Arc::clone(record), &mut events);
        }
        Reconciliation {
            events,
            added: batch,
            removed: Vec::new(),
        }
    }

    pub(crate) fn sort_context(&self) -> SortContext<R> {
        SortContext {
            ordering: self.ordering.clone(),
            order: self.fetch_order.clone(),
        }
    }

    /// Removes one record. The only engine operation that surfaces
    /// `NotFound`; callers that tolerate absence check first or downgrade
    /// the error to a log line.
    pub(crate) fn remove(&mut self, id: &R::Id) -> Result<Reconciliation<R>, ControllerError> {
        let Some(slot) = self.state.slot_of(id) else {
            return Err(ControllerError::NotFound {
                id: format!("{id:?}"),
            });
        };
        let locator = slot.locator;
        let record = self.state.remove_member(locator);
        self.fetch_order.forget(id);

        let mut events = vec![Emitted::Record {
            record: Arc::clone(&record),
            event: ChangeEvent::Delete(locator),
        }];
        self.drop_section_if_empty(locator.section, &mut events);

        Ok(Reconciliation {
            events,
            added: Vec::new(),
            removed: vec![record],
        })
    }

    /// Re-seats a record whose sort-relevant field changed.
    ///
    /// Classifies the transition: same section → `Move` (or `Update` when
    /// the position is unaffected); section change between surviving
    /// sections → `Move`; section emptied and/or created → delete+insert
    /// with the accompanying section events, since a `Move` is meaningless
    /// across a section add/remove boundary.
    ///
    /// Not finding the record is not fatal: the record raced with its own
    /// removal and the change is simply dropped.
    pub(crate) fn relocate(&mut self, id: &R::Id) -> Reconciliation<R> {
        let Some(slot) = self.state.slot_of(id) else {
            rwarn!(id = ?id, "relocate: record no longer tracked, ignoring");
            return Reconciliation::empty();
        };
        let from = slot.locator;
        let record = match self.state.record_at(from) {
            Some(r) => Arc::clone(r),
            None => return Reconciliation::empty(),
        };
        let old_name = self.state.sections()[from.section].name().to_string();
        let new_name = self.ordering.section_name(&record);

        let mut events = Vec::new();
        if old_name == new_name {
            let record = self.state.remove_member(from);
            let item = self.ideal_member_index(from.section, &record);
            let to = Locator::new(from.section, item);
            self.state.insert_member(from.section, item, record.clone());
            if to == from {
                events.push(Emitted::Record {
                    record,
                    event: ChangeEvent::Update(from),
                });
            } else {
                events.push(Emitted::Record {
                    record,
                    event: ChangeEvent::Move { from, to },
                });
            }
        } else {
            let old_empties = self.state.sections()[from.section].len() == 1;
            let existing_target = self.state.section_index_named(&new_name);
            match existing_target {
                Some(si) if !old_empties => {
                    let record = self.state.remove_member(from);
                    let item = self.ideal_member_index(si, &record);
                    self.state.insert_member(si, item, record.clone());
                    events.push(Emitted::Record {
                        record,
                        event: ChangeEvent::Move {
                            from,
                            to: Locator::new(si, item),
                        },
                    });
                }
                _ => {
                    // Section boundary changes: express as delete+insert.
                    let record = self.state.remove_member(from);
                    events.push(Emitted::Record {
                        record: Arc::clone(&record),
                        event: ChangeEvent::Delete(from),
                    });
                    self.drop_section_if_empty(from.section, &mut events);
                    self.insert_record(record, &mut events);
                }
            }
        }

        Reconciliation {
            events,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Emits an `Update` at the current locator for every record still
    /// tracked; the rest are skipped.
    pub(crate) fn reload(&mut self, ids: &[R::Id]) -> Reconciliation<R> {
        let mut events = Vec::new();
        for id in ids {
            let Some(locator) = self.state.locator_of(id) else {
                rtrace!(id = ?id, "reload: record no longer tracked, skipped");
                continue;
            };
            if let Some(record) = self.state.record_at(locator) {
                events.push(Emitted::Record {
                    record: Arc::clone(record),
                    event: ChangeEvent::Update(locator),
                });
            }
        }
        Reconciliation {
            events,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Full teardown: one delete per record in reverse flat order, then one
    /// per section in reverse index order.
    pub(crate) fn remove_all(&mut self) -> Reconciliation<R> {
        let mut flat: Vec<(Arc<R>, Locator)> = Vec::with_capacity(self.state.flat_len());
        self.state
            .for_each(|record, locator| flat.push((Arc::clone(record), locator)));

        let mut events = Vec::new();
        let mut removed = Vec::with_capacity(flat.len());
        for (record, locator) in flat.into_iter().rev() {
            events.push(Emitted::Record {
                record: Arc::clone(&record),
                event: ChangeEvent::Delete(locator),
            });
            removed.push(record);
        }
        for si in (0..self.state.sections().len()).rev() {
            events.push(Emitted::Section {
                name: self.state.sections()[si].name().to_string(),
                event: ChangeEvent::Delete(si),
            });
        }

        self.state.clear();
        self.fetch_order.clear();

        Reconciliation {
            events,
            added: Vec::new(),
            removed,
        }
    }

    /// Single-element insert maintaining section bookkeeping: finds (or
    /// creates) the target section, binary-searches the in-section position,
    /// and records the section-then-record events.
    fn insert_record(&mut self, record: Arc<R>, events: &mut Vec<Emitted<R>>) -> Locator {
        let name = self.ordering.section_name(&record);
        match self.state.section_index_named(&name) {
            Some(si) => {
                let item = self.ideal_member_index(si, &record);
                self.state.insert_member(si, item, Arc::clone(&record));
                let locator = Locator::new(si, item);
                events.push(Emitted::Record {
                    record,
                    event: ChangeEvent::Insert(locator),
                });
                locator
            }
            None => {
                let si = self.ideal_section_index(&name);
                self.state
                    .insert_section(si, Section::solo(name.clone(), Arc::clone(&record)));
                events.push(Emitted::Section {
                    name,
                    event: ChangeEvent::Insert(si),
                });
                let locator = Locator::new(si, 0);
                events.push(Emitted::Record {
                    record,
                    event: ChangeEvent::Insert(locator),
                });
                locator
            }
        }
    }

    fn drop_section_if_empty(&mut self, section: usize, events: &mut Vec<Emitted<R>>) {
        if self.state.sections()[section].is_empty() {
            let dropped = self.state.remove_section(section);
            events.push(Emitted::Section {
                name: dropped.name().to_string(),
                event: ChangeEvent::Delete(section),
            });
        }
    }

    /// First position whose element is not ordered before the candidate.
    fn ideal_member_index(&self, section: usize, candidate: &Arc<R>) -> usize {
        self.state.sections()[section]
            .members()
            .partition_point(|m| self.full_compare(m, candidate) == Ordering::Less)
    }

    fn ideal_section_index(&self, name: &str) -> usize {
        self.state
            .sections()
            .partition_point(|s| self.ordering.compare_names(s.name(), name) == Ordering::Less)
    }

    fn full_compare(&self, a: &Arc<R>, b: &Arc<R>) -> Ordering {
        let ord = self.ordering.compare(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
        self.fetch_order
            .rank(&a.identity())
            .cmp(&self.fetch_order.rank(&b.identity()))
    }
}
