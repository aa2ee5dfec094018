use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::FieldKey;

/// A comparator over two records.
pub type Comparator<R> = Arc<dyn Fn(&R, &R) -> Ordering + Send + Sync>;

/// Extracts the section name for a record.
pub type SectionKeyFn<R> = Arc<dyn Fn(&R) -> String + Send + Sync>;

/// One entry of the comparator chain.
///
/// `field` names the record field the comparator reads; the controller
/// registers a change observer for it so mutations trigger relocation.
pub struct SortDescriptor<R> {
    pub field: FieldKey,
    pub ascending: bool,
    compare: Comparator<R>,
}

impl<R> SortDescriptor<R> {
    pub fn new(
        field: FieldKey,
        ascending: bool,
        compare: impl Fn(&R, &R) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        Self {
            field,
            ascending,
            compare: Arc::new(compare),
        }
    }

    /// Convenience constructor closing over a key extractor.
    pub fn by_key<T: Ord>(
        field: FieldKey,
        ascending: bool,
        key: impl Fn(&R) -> T + Send + Sync + 'static,
    ) -> Self {
        Self::new(field, ascending, move |a, b| key(a).cmp(&key(b)))
    }

    fn compare(&self, a: &R, b: &R) -> Ordering {
        let ord = (self.compare)(a, b);
        if self.ascending { ord } else { ord.reverse() }
    }
}

impl<R> Clone for SortDescriptor<R> {
    fn clone(&self) -> Self {
        Self {
            field: self.field,
            ascending: self.ascending,
            compare: Arc::clone(&self.compare),
        }
    }
}

impl<R> fmt::Debug for SortDescriptor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortDescriptor")
            .field("field", &self.field)
            .field("ascending", &self.ascending)
            .finish_non_exhaustive()
    }
}

/// The leading, section-driving entry of an [`OrderingSpec`].
///
/// Records compare by section name before any [`SortDescriptor`] runs, and
/// the same name (with the same ascending sense) orders the section list
/// itself.
pub struct SectionDescriptor<R> {
    pub field: FieldKey,
    pub ascending: bool,
    key: SectionKeyFn<R>,
}

impl<R> SectionDescriptor<R> {
    pub fn new(
        field: FieldKey,
        ascending: bool,
        key: impl Fn(&R) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            field,
            ascending,
            key: Arc::new(key),
        }
    }
}

impl<R> Clone for SectionDescriptor<R> {
    fn clone(&self) -> Self {
        Self {
            field: self.field,
            ascending: self.ascending,
            key: Arc::clone(&self.key),
        }
    }
}

impl<R> fmt::Debug for SectionDescriptor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionDescriptor")
            .field("field", &self.field)
            .field("ascending", &self.ascending)
            .finish_non_exhaustive()
    }
}

/// A chain of comparators plus an optional section key.
///
/// `compare` composes left-to-right and returns the first non-equal result;
/// the fetch-sequence tiebreak is applied by the engine on top of this, so
/// two records never compare equal in the fully ordered sequence.
pub struct OrderingSpec<R> {
    section: Option<SectionDescriptor<R>>,
    descriptors: Vec<SortDescriptor<R>>,
}

impl<R> OrderingSpec<R> {
    pub fn new() -> Self {
        Self {
            section: None,
            descriptors: Vec::new(),
        }
    }

    pub fn with_section(mut self, section: SectionDescriptor<R>) -> Self {
        self.section = Some(section);
        self
    }

    pub fn with_descriptor(mut self, descriptor: SortDescriptor<R>) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn is_sectioned(&self) -> bool {
        self.section.is_some()
    }

    /// The section key for a record; the empty string when no section
    /// descriptor is configured (all records share one unnamed section).
    pub fn section_name(&self, record: &R) -> String {
        match &self.section {
            Some(s) => (s.key)(record),
            None => String::new(),
        }
    }

    /// Orders section names with the section descriptor's ascending sense.
    pub(crate) fn compare_names(&self, a: &str, b: &str) -> Ordering {
        let ord = a.cmp(b);
        match &self.section {
            Some(s) if !s.ascending => ord.reverse(),
            _ => ord,
        }
    }

    /// The explicit comparator chain: section name first, then descriptors.
    /// Returns `Equal` when every configured comparator ties.
    pub fn compare(&self, a: &R, b: &R) -> Ordering {
        if self.section.is_some() {
            let ord = self.compare_names(&self.section_name(a), &self.section_name(b));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        for d in &self.descriptors {
            let ord = d.compare(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Every field whose mutation can change a record's position.
    pub(crate) fn observed_fields(&self) -> Vec<FieldKey> {
        let mut fields: Vec<FieldKey> = Vec::with_capacity(self.descriptors.len() + 1);
        if let Some(s) = &self.section {
            fields.push(s.field);
        }
        for d in &self.descriptors {
            if !fields.contains(&d.field) {
                fields.push(d.field);
            }
        }
        fields
    }
}

impl<R> Default for OrderingSpec<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for OrderingSpec<R> {
    fn clone(&self) -> Self {
        Self {
            section: self.section.clone(),
            descriptors: self.descriptors.clone(),
        }
    }
}

impl<R> fmt::Debug for OrderingSpec<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderingSpec")
            .field("section", &self.section)
            .field("descriptors", &self.descriptors)
            .finish()
    }
}

/// Identity → fetch-sequence rank.
///
/// Ranks break sort ties deterministically: records that compare equal under
/// every explicit comparator keep the relative order in which they were
/// first fetched. A full `assign` unions ranks (carried-over identities keep
/// theirs, new identities are appended after all existing ranks); incremental
/// inserts append without disturbing anything.
#[derive(Clone, Debug)]
pub(crate) struct FetchOrder<Id> {
    ranks: HashMap<Id, u64>,
    next: u64,
}

impl<Id: Clone + Eq + Hash> FetchOrder<Id> {
    pub(crate) fn new() -> Self {
        Self {
            ranks: HashMap::new(),
            next: 0,
        }
    }

    pub(crate) fn rank(&self, id: &Id) -> u64 {
        // Unranked identities sort last; this only happens transiently for
        // candidates that are being compared before `note` runs.
        self.ranks.get(id).copied().unwrap_or(u64::MAX)
    }

    /// Assigns the next rank to `id` if it has none.
    pub(crate) fn note(&mut self, id: Id) {
        self.ranks.entry(id).or_insert_with(|| {
            let r = self.next;
            self.next += 1;
            r
        });
    }

    /// A copy of the table rebuilt for a new base set: survivors keep their
    /// ranks, fresh identities are appended in iteration order, everything
    /// else is pruned. The live table is untouched, so a re-fetch that is
    /// later superseded leaves no trace in it.
    pub(crate) fn unioned<'a>(&self, ids: impl Iterator<Item = &'a Id>) -> Self
    where
        Id: 'a,
    {
        let mut next = self.next;
        let mut ranks: HashMap<Id, u64> = HashMap::new();
        for id in ids {
            match self.ranks.get(id) {
                Some(&r) => {
                    ranks.insert(id.clone(), r);
                }
                None => {
                    ranks.insert(id.clone(), next);
                    next += 1;
                }
            }
        }
        Self { ranks, next }
    }

    pub(crate) fn forget(&mut self, id: &Id) {
        self.ranks.remove(id);
    }

    pub(crate) fn clear(&mut self) {
        self.ranks.clear();
        self.next = 0;
    }
}
