use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use crate::record::TrackedRecord;
use crate::types::Locator;

/// A named run of consecutive records.
///
/// Sections are created and destroyed implicitly as their membership
/// transitions to/from empty; a section with zero members is never observable.
pub struct Section<R> {
    name: String,
    members: Vec<Arc<R>>,
}

impl<R> Section<R> {
    pub(crate) fn solo(name: String, record: Arc<R>) -> Self {
        Self {
            name,
            members: vec![record],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[Arc<R>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<R: std::fmt::Debug> std::fmt::Debug for Section<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section")
            .field("name", &self.name)
            .field("members", &self.members)
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Slot {
    pub locator: Locator,
    pub flat: usize,
}

/// The section list and the flat sequence as two synchronized views of one
/// logical set, plus the identity → slot table.
///
/// The slot table is rebuilt lazily: every mutation marks it stale, the next
/// read rebuilds it in one O(n) pass. Within a reconciliation batch this
/// amortizes the rebuild across all mutations instead of paying per element.
pub(crate) struct SectionedState<R: TrackedRecord> {
    sections: Vec<Section<R>>,
    slots: RefCell<HashMap<R::Id, Slot>>,
    slots_stale: Cell<bool>,
}

impl<R: TrackedRecord> SectionedState<R> {
    pub(crate) fn new() -> Self {
        Self {
            sections: Vec::new(),
            slots: RefCell::new(HashMap::new()),
            slots_stale: Cell::new(false),
        }
    }

    pub(crate) fn sections(&self) -> &[Section<R>] {
        &self.sections
    }

    pub(crate) fn flat_len(&self) -> usize {
        self.sections.iter().map(|s| s.members.len()).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub(crate) fn record_at(&self, locator: Locator) -> Option<&Arc<R>> {
        self.sections
            .get(locator.section)
            .and_then(|s| s.members.get(locator.item))
    }

    pub(crate) fn slot_of(&self, id: &R::Id) -> Option<Slot> {
        if self.slots_stale.replace(false) {
            self.rebuild_slots();
        }
        self.slots.borrow().get(id).copied()
    }

    pub(crate) fn locator_of(&self, id: &R::Id) -> Option<Locator> {
        self.slot_of(id).map(|s| s.locator)
    }

    pub(crate) fn contains(&self, id: &R::Id) -> bool {
        self.slot_of(id).is_some()
    }

    /// Identities in flat (display) order.
    pub(crate) fn flat_ids(&self) -> Vec<R::Id> {
        let mut ids = Vec::with_capacity(self.flat_len());
        for section in &self.sections {
            for member in &section.members {
                ids.push(member.identity());
            }
        }
        ids
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(&Arc<R>, Locator)) {
        for (si, section) in self.sections.iter().enumerate() {
            for (ii, member) in section.members.iter().enumerate() {
                f(member, Locator::new(si, ii));
            }
        }
    }

    /// Locators in flat order (snapshot; used by the engine while applying a
    /// batch of removals whose indexes were computed against this layout).
    pub(crate) fn flat_locators(&self) -> Vec<Locator> {
        let mut out = Vec::with_capacity(self.flat_len());
        self.for_each(|_, loc| out.push(loc));
        out
    }

    pub(crate) fn section_index_named(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    pub(crate) fn insert_section(&mut self, index: usize, section: Section<R>) {
        self.sections.insert(index, section);
        self.slots_stale.set(true);
    }

    pub(crate) fn remove_section(&mut self, index: usize) -> Section<R> {
        self.slots_stale.set(true);
        self.sections.remove(index)
    }

    pub(crate) fn insert_member(&mut self, section: usize, item: usize, record: Arc<R>) {
        self.sections[section].members.insert(item, record);
        self.slots_stale.set(true);
    }

    pub(crate) fn remove_member(&mut self, locator: Locator) -> Arc<R> {
        self.slots_stale.set(true);
        self.sections[locator.section].members.remove(locator.item)
    }

    pub(crate) fn clear(&mut self) {
        self.sections.clear();
        self.slots.borrow_mut().clear();
        self.slots_stale.set(false);
    }

    fn rebuild_slots(&self) {
        let mut slots = self.slots.borrow_mut();
        slots.clear();
        let mut flat = 0;
        for (si, section) in self.sections.iter().enumerate() {
            for (ii, member) in section.members.iter().enumerate() {
                slots.insert(
                    member.identity(),
                    Slot {
                        locator: Locator::new(si, ii),
                        flat,
                    },
                );
                flat += 1;
            }
        }
    }
}

impl<R: TrackedRecord> Default for SectionedState<R> {
    fn default() -> Self {
        Self::new()
    }
}
