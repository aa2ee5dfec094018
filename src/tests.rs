use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::engine::ReconciliationEngine;
use crate::{
    AssocValue, AssociationCompletion, Broadcast, BroadcastHub, ChangeEvent, ChangeEventSink,
    ChangeObserver, CollectionController, ControllerError, ControllerOptions, CreationEvent,
    FetchCompletion, FieldKey, Locator, MalformedRecord, OrderingSpec, SectionDescriptor,
    SortDescriptor, Subscription, TrackedRecord,
};

// Dependency-free PRNG, good enough for shuffling test data.
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// Reference-identity test record with hand-rolled observer plumbing.
struct Row {
    id: u32,
    group: Mutex<String>,
    title: Mutex<String>,
    deleted: AtomicBool,
    payload_hub: BroadcastHub<()>,
    deleted_hub: BroadcastHub<()>,
    field_hubs: Mutex<HashMap<FieldKey, Arc<BroadcastHub<()>>>>,
}

impl Row {
    fn new(id: u32, group: &str, title: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            group: Mutex::new(group.to_string()),
            title: Mutex::new(title.to_string()),
            deleted: AtomicBool::new(false),
            payload_hub: BroadcastHub::new(),
            deleted_hub: BroadcastHub::new(),
            field_hubs: Mutex::new(HashMap::new()),
        })
    }

    fn title(&self) -> String {
        self.title.lock().unwrap().clone()
    }

    fn group(&self) -> String {
        self.group.lock().unwrap().clone()
    }

    fn field_hub(&self, field: FieldKey) -> Arc<BroadcastHub<()>> {
        Arc::clone(self.field_hubs.lock().unwrap().entry(field).or_default())
    }

    fn set_title(&self, title: &str) {
        *self.title.lock().unwrap() = title.to_string();
        self.field_hub("title").publish(&());
    }

    fn set_group(&self, group: &str) {
        *self.group.lock().unwrap() = group.to_string();
        self.field_hub("group").publish(&());
    }

    fn touch(&self) {
        self.payload_hub.publish(&());
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, AtomicOrdering::SeqCst);
        self.deleted_hub.publish(&());
    }
}

impl TrackedRecord for Row {
    type Id = u32;

    fn identity(&self) -> u32 {
        self.id
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(AtomicOrdering::SeqCst)
    }

    fn on_payload_change(&self, observer: ChangeObserver) -> Subscription {
        self.payload_hub.subscribe(Arc::new(move |_| observer()))
    }

    fn on_deleted_change(&self, observer: ChangeObserver) -> Subscription {
        self.deleted_hub.subscribe(Arc::new(move |_| observer()))
    }

    fn on_field_change(&self, field: FieldKey, observer: ChangeObserver) -> Subscription {
        self.field_hub(field).subscribe(Arc::new(move |_| observer()))
    }
}

fn title_ordering() -> OrderingSpec<Row> {
    OrderingSpec::new().with_descriptor(SortDescriptor::by_key("title", true, Row::title))
}

fn grouped_ordering() -> OrderingSpec<Row> {
    OrderingSpec::new()
        .with_section(SectionDescriptor::new("group", true, Row::group))
        .with_descriptor(SortDescriptor::by_key("title", true, Row::title))
}

/// Sink that replays every event against a naive mirrored list and asserts
/// the mirror matches the controller's layout at the end of each batch.
#[derive(Default)]
struct MirrorSink {
    mirror: Mutex<Vec<(String, Vec<u32>)>>,
    record_events: Mutex<Vec<ChangeEvent<Locator>>>,
    section_events: Mutex<Vec<ChangeEvent<usize>>>,
    batches: AtomicUsize,
}

impl MirrorSink {
    fn layout(controller: &CollectionController<Row>) -> Vec<(String, Vec<u32>)> {
        controller
            .sections()
            .iter()
            .map(|s| {
                (
                    s.name().to_string(),
                    s.members().iter().map(|r| r.id).collect(),
                )
            })
            .collect()
    }

    fn record_log(&self) -> Vec<ChangeEvent<Locator>> {
        self.record_events.lock().unwrap().clone()
    }

    fn section_log(&self) -> Vec<ChangeEvent<usize>> {
        self.section_events.lock().unwrap().clone()
    }

    fn clear_log(&self) {
        self.record_events.lock().unwrap().clear();
        self.section_events.lock().unwrap().clear();
    }

    fn batch_count(&self) -> usize {
        self.batches.load(AtomicOrdering::SeqCst)
    }
}

impl ChangeEventSink<Row> for MirrorSink {
    fn record_changed(
        &self,
        _controller: &CollectionController<Row>,
        record: &Arc<Row>,
        event: ChangeEvent<Locator>,
    ) {
        let mut mirror = self.mirror.lock().unwrap();
        match event {
            ChangeEvent::Insert(loc) => mirror[loc.section].1.insert(loc.item, record.id),
            ChangeEvent::Delete(loc) => {
                let gone = mirror[loc.section].1.remove(loc.item);
                assert_eq!(gone, record.id, "delete targeted the wrong mirror slot");
            }
            ChangeEvent::Update(loc) => {
                assert_eq!(mirror[loc.section].1[loc.item], record.id);
            }
            ChangeEvent::Move { from, to } => {
                let gone = mirror[from.section].1.remove(from.item);
                assert_eq!(gone, record.id, "move targeted the wrong mirror slot");
                mirror[to.section].1.insert(to.item, record.id);
            }
        }
        self.record_events.lock().unwrap().push(event);
    }

    fn section_changed(
        &self,
        _controller: &CollectionController<Row>,
        name: &str,
        event: ChangeEvent<usize>,
    ) {
        let mut mirror = self.mirror.lock().unwrap();
        match event {
            ChangeEvent::Insert(i) => mirror.insert(i, (name.to_string(), Vec::new())),
            ChangeEvent::Delete(i) => {
                let (gone, members) = mirror.remove(i);
                assert_eq!(gone, name);
                assert!(members.is_empty(), "section deleted while still populated");
            }
            ChangeEvent::Update(i) => assert_eq!(mirror[i].0, name),
            ChangeEvent::Move { from, to } => {
                let section = mirror.remove(from);
                mirror.insert(to, section);
            }
        }
        self.section_events.lock().unwrap().push(event);
    }

    fn did_change_batch(&self, controller: &CollectionController<Row>) {
        self.batches.fetch_add(1, AtomicOrdering::SeqCst);
        assert_eq!(
            *self.mirror.lock().unwrap(),
            Self::layout(controller),
            "replayed mirror diverged from controller layout"
        );
    }
}

fn controller_with(ordering: OrderingSpec<Row>) -> (CollectionController<Row>, Arc<MirrorSink>) {
    let sink = Arc::new(MirrorSink::default());
    let options = ControllerOptions::new(ordering).with_sink(sink.clone());
    (CollectionController::new(options), sink)
}

fn wait_pending(controller: &CollectionController<Row>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !controller.has_pending() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for deferred work"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn assign_builds_sorted_sections() {
    let (mut c, _sink) = controller_with(grouped_ordering());
    c.assign(vec![
        Row::new(1, "b", "delta"),
        Row::new(2, "a", "bravo"),
        Row::new(3, "a", "alpha"),
        Row::new(4, "b", "charlie"),
    ]);
    let names: Vec<&str> = c.sections().iter().map(|s| s.name()).collect();
    assert_eq!(names, ["a", "b"]);
    assert_eq!(c.fetched_ids(), [3, 2, 4, 1]);
    assert_eq!(c.len(), 4);
    assert!(c.has_fetched_objects());
    assert_eq!(c.locator_for(&4), Some(Locator::new(1, 0)));
    assert_eq!(c.object_at(Locator::new(0, 1)).unwrap().id, 2);
}

#[test]
fn ties_keep_fetch_order() {
    let (mut c, _sink) = controller_with(title_ordering());
    c.assign(vec![
        Row::new(1, "", "same"),
        Row::new(2, "", "same"),
        Row::new(3, "", "same"),
    ]);
    assert_eq!(c.fetched_ids(), [1, 2, 3]);
    // A re-fetch delivering the same identities in a different order must
    // not reshuffle records that compare equal.
    c.assign(vec![
        Row::new(3, "", "same"),
        Row::new(1, "", "same"),
        Row::new(2, "", "same"),
    ]);
    assert_eq!(c.fetched_ids(), [1, 2, 3]);
}

#[test]
fn identical_reassign_is_silent() {
    let (mut c, sink) = controller_with(title_ordering());
    let rows = vec![Row::new(1, "", "a"), Row::new(2, "", "b")];
    c.assign(rows.clone());
    sink.clear_log();
    let before = sink.batch_count();
    c.assign(rows);
    assert_eq!(sink.batch_count(), before);
    assert!(sink.record_log().is_empty());
}

#[test]
fn reassign_preserves_instances() {
    let (mut c, _sink) = controller_with(title_ordering());
    let original = Row::new(1, "", "a");
    c.assign(vec![Arc::clone(&original), Row::new(2, "", "b")]);
    // A re-fetch typically constructs fresh instances for the same
    // identities; consumers holding the old one must keep seeing updates.
    c.assign(vec![Row::new(1, "", "a"), Row::new(3, "", "c")]);
    let kept = c.object_at(c.locator_for(&1).unwrap()).unwrap();
    assert!(Arc::ptr_eq(kept, &original));
}

#[test]
fn assign_diff_touches_only_changes() {
    let (mut c, sink) = controller_with(title_ordering());
    c.assign(vec![
        Row::new(1, "", "a"),
        Row::new(2, "", "c"),
        Row::new(3, "", "e"),
    ]);
    sink.clear_log();
    c.assign(vec![
        Row::new(1, "", "a"),
        Row::new(4, "", "b"),
        Row::new(3, "", "e"),
    ]);
    assert_eq!(
        sink.record_log(),
        vec![
            ChangeEvent::Delete(Locator::new(0, 1)),
            ChangeEvent::Insert(Locator::new(0, 1)),
        ]
    );
}

#[test]
fn reorder_on_reassign_is_delete_insert_pair_plus_insert() {
    let (mut c, sink) = controller_with(title_ordering());
    let b = Row::new(2, "", "b");
    c.assign(vec![Row::new(1, "", "a"), Arc::clone(&b), Row::new(3, "", "c")]);
    sink.clear_log();
    // The store mutated b's sort key in place; the re-fetch reflects the
    // new order. The reposition is a delete+insert pair of the same
    // instance, plus one insert for the newcomer, never a full rebuild.
    *b.title.lock().unwrap() = "z".to_string();
    c.assign(vec![
        Row::new(1, "", "a"),
        Row::new(3, "", "c"),
        Row::new(2, "", "z"),
        Row::new(4, "", "d"),
    ]);
    assert_eq!(c.fetched_ids(), [1, 3, 4, 2]);
    assert_eq!(
        sink.record_log(),
        vec![
            ChangeEvent::Delete(Locator::new(0, 1)),
            ChangeEvent::Insert(Locator::new(0, 2)),
            ChangeEvent::Insert(Locator::new(0, 3)),
        ]
    );
    assert!(Arc::ptr_eq(c.object_at(Locator::new(0, 3)).unwrap(), &b));
}

#[test]
fn duplicate_identities_first_wins() {
    let (mut c, _sink) = controller_with(title_ordering());
    let first = Row::new(1, "", "a");
    c.assign(vec![Arc::clone(&first), Row::new(1, "", "z")]);
    assert_eq!(c.len(), 1);
    assert!(Arc::ptr_eq(c.object_at(Locator::new(0, 0)).unwrap(), &first));
}

#[test]
fn insert_new_skips_deleted_and_tracked() {
    let (mut c, _sink) = controller_with(title_ordering());
    c.assign(vec![Row::new(1, "", "a")]);
    let dead = Row::new(2, "", "b");
    dead.mark_deleted();
    c.insert_new(vec![dead, Row::new(1, "", "dup"), Row::new(3, "", "c")]);
    assert_eq!(c.fetched_ids(), [1, 3]);
}

#[test]
fn scheduled_inserts_batch_on_flush() {
    let (mut c, sink) = controller_with(title_ordering());
    c.assign(vec![Row::new(1, "", "b")]);
    sink.clear_log();
    c.schedule_insert(Row::new(2, "", "a"));
    c.schedule_insert(Row::new(3, "", "c"));
    c.schedule_insert(Row::new(2, "", "zzz"));
    assert_eq!(c.len(), 1);
    c.flush();
    assert_eq!(c.fetched_ids(), [2, 1, 3]);
    assert_eq!(
        sink.record_log(),
        vec![
            ChangeEvent::Insert(Locator::new(0, 0)),
            ChangeEvent::Insert(Locator::new(0, 2)),
        ]
    );
}

#[test]
fn remove_reports_not_found() {
    let (mut c, _sink) = controller_with(title_ordering());
    c.assign(vec![Row::new(1, "", "a")]);
    assert!(c.remove(&1).is_ok());
    assert!(matches!(
        c.remove(&1),
        Err(ControllerError::NotFound { .. })
    ));
    assert!(c.is_empty());
}

#[test]
fn sections_appear_and_disappear_with_membership() {
    let (mut c, sink) = controller_with(grouped_ordering());
    c.assign(vec![Row::new(1, "a", "x"), Row::new(2, "b", "y")]);
    sink.clear_log();
    c.remove(&2).unwrap();
    assert_eq!(sink.record_log(), vec![ChangeEvent::Delete(Locator::new(1, 0))]);
    assert_eq!(sink.section_log(), vec![ChangeEvent::Delete(1)]);

    sink.clear_log();
    c.schedule_insert(Row::new(3, "b", "y"));
    c.flush();
    assert_eq!(sink.section_log(), vec![ChangeEvent::Insert(1)]);
    assert_eq!(sink.record_log(), vec![ChangeEvent::Insert(Locator::new(1, 0))]);
}

#[test]
fn remove_all_tears_down_in_reverse_order() {
    let (mut c, sink) = controller_with(grouped_ordering());
    c.assign(vec![Row::new(1, "a", "x"), Row::new(2, "b", "y")]);
    sink.clear_log();
    c.remove_all();
    assert_eq!(
        sink.record_log(),
        vec![
            ChangeEvent::Delete(Locator::new(1, 0)),
            ChangeEvent::Delete(Locator::new(0, 0)),
        ]
    );
    assert_eq!(
        sink.section_log(),
        vec![ChangeEvent::Delete(1), ChangeEvent::Delete(0)]
    );
    assert!(c.is_empty());
    assert!(c.has_fetched_objects());
    assert_eq!(c.tracked_observation_count(), 0);
}

#[test]
fn payload_change_coalesces_to_one_update() {
    let (mut c, sink) = controller_with(title_ordering());
    let row = Row::new(1, "", "a");
    c.assign(vec![Arc::clone(&row)]);
    sink.clear_log();
    row.touch();
    row.touch();
    row.touch();
    assert!(c.has_pending());
    c.flush();
    assert_eq!(sink.record_log(), vec![ChangeEvent::Update(Locator::new(0, 0))]);
    assert!(!c.has_pending());
}

#[test]
fn deleted_flag_change_removes_record() {
    let (mut c, sink) = controller_with(title_ordering());
    let row = Row::new(1, "", "a");
    c.assign(vec![Arc::clone(&row), Row::new(2, "", "b")]);
    sink.clear_log();
    row.mark_deleted();
    c.flush();
    assert_eq!(c.fetched_ids(), [2]);
    assert_eq!(sink.record_log(), vec![ChangeEvent::Delete(Locator::new(0, 0))]);
}

#[test]
fn payload_change_on_deleted_record_removes() {
    let (mut c, _sink) = controller_with(title_ordering());
    let row = Row::new(1, "", "a");
    c.assign(vec![Arc::clone(&row)]);
    // The deleted flag flips without its own notification; the payload
    // change must still be routed as a removal.
    row.deleted.store(true, AtomicOrdering::SeqCst);
    row.touch();
    c.flush();
    assert!(c.is_empty());
}

#[test]
fn sort_key_change_emits_move() {
    let (mut c, sink) = controller_with(title_ordering());
    let row = Row::new(1, "", "a");
    c.assign(vec![Arc::clone(&row), Row::new(2, "", "b"), Row::new(3, "", "c")]);
    sink.clear_log();
    row.set_title("z");
    c.flush();
    assert_eq!(c.fetched_ids(), [2, 3, 1]);
    assert_eq!(
        sink.record_log(),
        vec![ChangeEvent::Move {
            from: Locator::new(0, 0),
            to: Locator::new(0, 2),
        }]
    );
}

#[test]
fn sort_key_change_in_place_emits_update() {
    let (mut c, sink) = controller_with(title_ordering());
    let row = Row::new(2, "", "b");
    c.assign(vec![Row::new(1, "", "a"), Arc::clone(&row), Row::new(3, "", "d")]);
    sink.clear_log();
    row.set_title("c");
    c.flush();
    assert_eq!(sink.record_log(), vec![ChangeEvent::Update(Locator::new(0, 1))]);
}

#[test]
fn group_change_between_surviving_sections_moves() {
    let (mut c, sink) = controller_with(grouped_ordering());
    let row = Row::new(2, "a", "n");
    c.assign(vec![Row::new(1, "a", "m"), Arc::clone(&row), Row::new(3, "b", "z")]);
    sink.clear_log();
    row.set_group("b");
    c.flush();
    assert_eq!(
        sink.record_log(),
        vec![ChangeEvent::Move {
            from: Locator::new(0, 1),
            to: Locator::new(1, 0),
        }]
    );
    assert!(sink.section_log().is_empty());
}

#[test]
fn group_change_across_section_boundary_is_delete_insert() {
    let (mut c, sink) = controller_with(grouped_ordering());
    let row = Row::new(1, "a", "m");
    c.assign(vec![Arc::clone(&row), Row::new(2, "b", "z")]);
    sink.clear_log();
    row.set_group("c");
    c.flush();
    assert_eq!(
        sink.record_log(),
        vec![
            ChangeEvent::Delete(Locator::new(0, 0)),
            ChangeEvent::Insert(Locator::new(1, 0)),
        ]
    );
    assert_eq!(
        sink.section_log(),
        vec![ChangeEvent::Delete(0), ChangeEvent::Insert(1)]
    );
}

#[test]
fn direct_mode_applies_immediately() {
    let sink = Arc::new(MirrorSink::default());
    let options = ControllerOptions::new(title_ordering())
        .with_coalesce(false)
        .with_sink(sink.clone());
    let mut c = CollectionController::new(options);
    c.assign(vec![Row::new(1, "", "a")]);
    sink.clear_log();
    c.schedule_reload(1);
    assert_eq!(sink.record_log(), vec![ChangeEvent::Update(Locator::new(0, 0))]);
    c.schedule_insert(Row::new(2, "", "b"));
    assert_eq!(c.len(), 2);
}

#[test]
fn wake_fires_once_per_arming() {
    let wakes = Arc::new(AtomicUsize::new(0));
    let w = Arc::clone(&wakes);
    let options = ControllerOptions::new(title_ordering()).with_on_work(move || {
        w.fetch_add(1, AtomicOrdering::SeqCst);
    });
    let mut c = CollectionController::new(options);
    let row = Row::new(1, "", "a");
    c.assign(vec![Arc::clone(&row)]);
    row.touch();
    row.touch();
    assert_eq!(wakes.load(AtomicOrdering::SeqCst), 1);
    c.flush();
    row.touch();
    assert_eq!(wakes.load(AtomicOrdering::SeqCst), 2);
}

#[test]
fn creation_broadcast_inserts_accepted_records() {
    let hub: Arc<BroadcastHub<CreationEvent<Row>>> = Arc::new(BroadcastHub::new());
    let options = ControllerOptions::new(title_ordering())
        .with_creation_broadcast(hub.clone())
        .with_inclusion_check(|r: &Row| !r.title().starts_with('x'));
    let mut c = CollectionController::new(options);
    c.assign(Vec::new());
    hub.publish(&Ok(Row::new(1, "", "a")));
    hub.publish(&Ok(Row::new(2, "", "xz")));
    hub.publish(&Err(MalformedRecord::new("missing title")));
    c.flush();
    assert_eq!(c.fetched_ids(), [1]);

    // A creation event for an identity already in the set is a no-op.
    hub.publish(&Ok(Row::new(1, "", "a2")));
    c.flush();
    assert_eq!(c.fetched_ids(), [1]);
    assert_eq!(c.object_at(Locator::new(0, 0)).unwrap().title(), "a");
}

#[test]
fn reset_broadcast_runs_fetch_source() {
    let hub: Arc<BroadcastHub<()>> = Arc::new(BroadcastHub::new());
    let fetches = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fetches);
    let options = ControllerOptions::new(title_ordering())
        .with_reset_broadcast(hub.clone())
        .with_fetch_source(move |done: FetchCompletion<Row>| {
            f.fetch_add(1, AtomicOrdering::SeqCst);
            done(vec![Row::new(7, "", "g")]);
        });
    let mut c = CollectionController::new(options);
    c.perform_fetch();
    c.flush();
    assert_eq!(c.fetched_ids(), [7]);

    hub.publish(&());
    c.flush(); // runs the fetch source
    c.flush(); // applies the completion's assign
    assert_eq!(fetches.load(AtomicOrdering::SeqCst), 2);
    assert_eq!(c.fetched_ids(), [7]);
}

#[test]
fn large_batches_sort_on_a_worker() {
    let options = ControllerOptions::new(title_ordering()).with_large_batch_threshold(2);
    let mut c = CollectionController::new(options);
    c.assign(vec![
        Row::new(1, "", "d"),
        Row::new(2, "", "b"),
        Row::new(3, "", "c"),
        Row::new(4, "", "a"),
    ]);
    assert!(c.is_empty());
    wait_pending(&c);
    c.flush();
    assert_eq!(c.fetched_ids(), [4, 2, 3, 1]);
}

#[test]
fn remove_all_invalidates_in_flight_sort() {
    let options = ControllerOptions::new(title_ordering()).with_large_batch_threshold(2);
    let mut c = CollectionController::new(options);
    c.assign(vec![Row::new(1, "", "c"), Row::new(2, "", "a"), Row::new(3, "", "b")]);
    c.remove_all();
    wait_pending(&c);
    c.flush();
    assert!(c.is_empty());
    assert!(c.fetched_ids().is_empty());
}

#[test]
fn superseded_sort_leaves_tie_ranks_untouched() {
    let options = ControllerOptions::new(title_ordering()).with_large_batch_threshold(2);
    let mut c = CollectionController::new(options);
    c.assign(vec![Row::new(1, "", "same"), Row::new(2, "", "same")]);
    // An in-flight re-fetch that drops record 1...
    c.assign(vec![
        Row::new(2, "", "same"),
        Row::new(3, "", "same"),
        Row::new(4, "", "same"),
    ]);
    // ...is superseded before it lands by one that keeps it. Record 1 must
    // keep its original tie rank, not re-enter as the newest.
    c.assign(vec![Row::new(2, "", "same"), Row::new(1, "", "same")]);
    assert_eq!(c.fetched_ids(), [1, 2]);
    wait_pending(&c);
    c.flush();
    assert_eq!(c.fetched_ids(), [1, 2]);
}

#[test]
fn discarded_insert_sort_leaves_no_rank_residue() {
    let options = ControllerOptions::new(title_ordering()).with_large_batch_threshold(2);
    let mut c = CollectionController::new(options);
    c.assign(vec![Row::new(1, "", "same")]);
    // Large insert batch heads to the worker...
    c.insert_new(vec![
        Row::new(2, "", "same"),
        Row::new(3, "", "same"),
        Row::new(4, "", "same"),
    ]);
    // ...and is superseded by a re-fetch before it lands. Record 5 must
    // rank ahead of record 2 purely by fetch position; no rank from the
    // discarded batch may survive.
    c.assign(vec![Row::new(5, "", "same"), Row::new(2, "", "same")]);
    assert_eq!(c.fetched_ids(), [5, 2]);
    wait_pending(&c);
    c.flush();
    assert_eq!(c.fetched_ids(), [5, 2]);
}

#[test]
fn superseded_background_sort_is_discarded() {
    let options = ControllerOptions::new(title_ordering()).with_large_batch_threshold(2);
    let mut c = CollectionController::new(options);
    c.assign(vec![Row::new(1, "", "d"), Row::new(2, "", "b"), Row::new(3, "", "c")]);
    // A newer assign supersedes the in-flight sort.
    c.assign(vec![Row::new(9, "", "q")]);
    assert_eq!(c.fetched_ids(), [9]);
    wait_pending(&c);
    c.flush();
    assert_eq!(c.fetched_ids(), [9]);
}

#[test]
fn associated_values_fault_in_windows() {
    let requests: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(Vec::new()));
    let req = Arc::clone(&requests);
    let options = ControllerOptions::new(title_ordering())
        .with_associated_window_size(3)
        .with_association_source(
            move |field, ids: Vec<u32>, done: AssociationCompletion<Row>| {
                assert_eq!(field, "thumb");
                req.lock().unwrap().push(ids.clone());
                let mut values = HashMap::new();
                for id in ids {
                    if id != 4 {
                        values.insert(id, Arc::new(format!("v{id}")) as AssocValue);
                    }
                }
                done(values);
            },
        );
    let mut c = CollectionController::new(options);
    c.assign(vec![
        Row::new(1, "", "a"),
        Row::new(2, "", "b"),
        Row::new(3, "", "c"),
        Row::new(4, "", "d"),
        Row::new(5, "", "e"),
    ]);
    assert!(c.associated_value(&3, "thumb").is_none());
    assert_eq!(*requests.lock().unwrap(), vec![vec![2, 3, 4]]);
    c.flush();
    let value = c.associated_value(&3, "thumb").unwrap();
    assert_eq!(value.downcast_ref::<String>().unwrap(), "v3");
    // Window neighbors resolved in the same batch, no new request.
    assert!(c.associated_value(&2, "thumb").is_some());
    // Resolved-to-nothing is terminal, not retried.
    assert!(c.associated_value(&4, "thumb").is_none());
    assert_eq!(requests.lock().unwrap().len(), 1);
    // Outside the resolved window a fresh batch is issued, restricted to
    // unknown entries.
    assert!(c.associated_value(&1, "thumb").is_none());
    assert_eq!(*requests.lock().unwrap(), vec![vec![2, 3, 4], vec![1]]);
}

#[test]
fn pending_window_entries_do_not_refault() {
    let requests: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(Vec::new()));
    let held: Arc<Mutex<Option<AssociationCompletion<Row>>>> = Arc::new(Mutex::new(None));
    let req = Arc::clone(&requests);
    let h = Arc::clone(&held);
    let options = ControllerOptions::new(title_ordering())
        .with_associated_window_size(3)
        .with_association_source(move |_field, ids: Vec<u32>, done| {
            req.lock().unwrap().push(ids);
            *h.lock().unwrap() = Some(done);
        });
    let mut c = CollectionController::new(options);
    c.assign(vec![
        Row::new(1, "", "a"),
        Row::new(2, "", "b"),
        Row::new(3, "", "c"),
        Row::new(4, "", "d"),
        Row::new(5, "", "e"),
    ]);
    assert!(c.associated_value(&3, "thumb").is_none());
    // While the batch is in flight, accesses anywhere inside its window
    // must not issue a second request.
    assert!(c.associated_value(&2, "thumb").is_none());
    assert!(c.associated_value(&4, "thumb").is_none());
    assert!(c.associated_value(&3, "thumb").is_none());
    assert_eq!(*requests.lock().unwrap(), vec![vec![2, 3, 4]]);

    let done = held.lock().unwrap().take().unwrap();
    done(HashMap::from([
        (2, Arc::new("v2".to_string()) as AssocValue),
        (3, Arc::new("v3".to_string()) as AssocValue),
        (4, Arc::new("v4".to_string()) as AssocValue),
    ]));
    c.flush();
    assert!(c.associated_value(&3, "thumb").is_some());
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[test]
fn invalidation_hook_drops_the_entry() {
    let observers: Arc<Mutex<Vec<ChangeObserver>>> = Arc::new(Mutex::new(Vec::new()));
    let obs = Arc::clone(&observers);
    let options = ControllerOptions::new(title_ordering())
        .with_association_source(|_field, ids: Vec<u32>, done: AssociationCompletion<Row>| {
            done(ids
                .into_iter()
                .map(|id| (id, Arc::new(id) as AssocValue))
                .collect());
        })
        .with_association_invalidation(move |_record, _field, observer| {
            obs.lock().unwrap().push(observer);
            Subscription::empty()
        });
    let mut c = CollectionController::new(options);
    c.assign(vec![Row::new(1, "", "a")]);
    assert!(c.associated_value(&1, "thumb").is_none());
    c.flush();
    assert!(c.associated_value(&1, "thumb").is_some());
    assert_eq!(c.cached_association_count(), 1);

    let observer = Arc::clone(&observers.lock().unwrap()[0]);
    observer();
    c.flush();
    assert_eq!(c.cached_association_count(), 0);
    // Next access re-faults.
    assert!(c.associated_value(&1, "thumb").is_none());
    assert_eq!(c.cached_association_count(), 1);
}

#[test]
fn memory_pressure_flushes_cache_and_reannounces() {
    let hub: Arc<BroadcastHub<()>> = Arc::new(BroadcastHub::new());
    let sink = Arc::new(MirrorSink::default());
    let options = ControllerOptions::new(title_ordering())
        .with_memory_pressure(hub.clone())
        .with_sink(sink.clone())
        .with_association_source(|_field, ids: Vec<u32>, done: AssociationCompletion<Row>| {
            done(ids
                .into_iter()
                .map(|id| (id, Arc::new(id) as AssocValue))
                .collect());
        });
    let mut c = CollectionController::new(options);
    c.assign(vec![Row::new(1, "", "a"), Row::new(2, "", "b")]);
    c.associated_value(&1, "thumb");
    c.flush();
    assert_eq!(c.cached_association_count(), 2);

    sink.clear_log();
    hub.publish(&());
    c.flush();
    assert_eq!(c.cached_association_count(), 0);
    assert_eq!(
        sink.record_log(),
        vec![
            ChangeEvent::Update(Locator::new(0, 0)),
            ChangeEvent::Update(Locator::new(0, 1)),
        ]
    );
}

#[test]
fn late_association_batch_is_discarded() {
    let held: Arc<Mutex<Option<AssociationCompletion<Row>>>> = Arc::new(Mutex::new(None));
    let h = Arc::clone(&held);
    let options =
        ControllerOptions::new(title_ordering()).with_association_source(move |_field, _ids, done| {
            *h.lock().unwrap() = Some(done);
        });
    let mut c = CollectionController::new(options);
    c.assign(vec![Row::new(1, "", "a")]);
    c.associated_value(&1, "thumb");
    c.flush_associations(); // bumps the epoch under the in-flight batch
    let done = held.lock().unwrap().take().unwrap();
    done(HashMap::from([(1, Arc::new(1u32) as AssocValue)]));
    c.flush();
    assert_eq!(c.cached_association_count(), 0);
    assert!(c.associated_value(&1, "thumb").is_none());
}

#[test]
fn association_result_for_departed_record_is_dropped() {
    let held: Arc<Mutex<Option<AssociationCompletion<Row>>>> = Arc::new(Mutex::new(None));
    let h = Arc::clone(&held);
    let options =
        ControllerOptions::new(title_ordering()).with_association_source(move |_field, _ids, done| {
            *h.lock().unwrap() = Some(done);
        });
    let mut c = CollectionController::new(options);
    c.assign(vec![Row::new(1, "", "a"), Row::new(2, "", "b")]);
    c.associated_value(&1, "thumb");
    c.remove(&1).unwrap();
    let done = held.lock().unwrap().take().unwrap();
    done(HashMap::from([
        (1, Arc::new(1u32) as AssocValue),
        (2, Arc::new(2u32) as AssocValue),
    ]));
    c.flush();
    assert!(c.associated_value(&2, "thumb").is_some());
    assert_eq!(c.cached_association_count(), 1);
}

#[test]
fn locator_navigation_crosses_sections() {
    let (mut c, _sink) = controller_with(grouped_ordering());
    c.assign(vec![
        Row::new(1, "a", "x"),
        Row::new(2, "a", "y"),
        Row::new(3, "b", "z"),
    ]);
    assert_eq!(c.locator_before(Locator::new(0, 0)), None);
    assert_eq!(c.locator_after(Locator::new(0, 1)), Some(Locator::new(1, 0)));
    assert_eq!(c.locator_before(Locator::new(1, 0)), Some(Locator::new(0, 1)));
    assert_eq!(c.locator_after(Locator::new(1, 0)), None);
}

#[test]
fn dropping_the_controller_silences_observers() {
    let row = Row::new(1, "", "a");
    {
        let (mut c, _sink) = controller_with(title_ordering());
        c.assign(vec![Arc::clone(&row)]);
        assert!(row.payload_hub.subscriber_count() > 0);
    }
    row.touch();
    assert_eq!(row.payload_hub.subscriber_count(), 0);
}

#[test]
fn broadcast_subscription_cancels_on_drop() {
    let hub: BroadcastHub<u32> = BroadcastHub::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&seen);
    let sub = hub.subscribe(Arc::new(move |v| {
        s.fetch_add(*v as usize, AtomicOrdering::SeqCst);
    }));
    hub.publish(&2);
    assert_eq!(hub.subscriber_count(), 1);
    drop(sub);
    hub.publish(&3);
    assert_eq!(seen.load(AtomicOrdering::SeqCst), 2);
    assert_eq!(hub.subscriber_count(), 0);
}

#[test]
fn diff_keys_produces_ordered_minimal_edits() {
    use crate::diff::diff_keys;
    let diff = diff_keys(&[1, 2, 3, 4], &[2, 3, 5, 4]);
    assert_eq!(diff.removals, [0]);
    assert_eq!(diff.insertions, [2]);

    let diff = diff_keys(&[1, 2, 3], &[3, 1, 2]);
    assert_eq!(diff.removals, [2]);
    assert_eq!(diff.insertions, [0]);

    let diff = diff_keys::<u32>(&[], &[1]);
    assert!(diff.removals.is_empty());
    assert_eq!(diff.insertions, [0]);
}

#[test]
fn diff_applies_removals_descending_then_insertions_ascending() {
    use crate::diff::diff_keys;
    let old = [1u32, 2, 3, 4, 5, 6];
    let new = [6u32, 4, 2];
    let diff = diff_keys(&old, &new);

    let mut descending = diff.removals.clone();
    descending.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(descending, diff.removals);
    let mut ascending = diff.insertions.clone();
    ascending.sort_unstable();
    assert_eq!(ascending, diff.insertions);

    let mut seq: Vec<u32> = old.to_vec();
    for &i in &diff.removals {
        seq.remove(i);
    }
    for &j in &diff.insertions {
        seq.insert(j, new[j]);
    }
    assert_eq!(seq, new);
}

#[test]
fn fetch_order_union_keeps_survivor_ranks() {
    use crate::ordering::FetchOrder;
    let empty = FetchOrder::new();
    let order = empty.unioned([1, 2, 3].iter());
    assert!(order.rank(&1) < order.rank(&2));
    let order = order.unioned([3, 9, 2].iter());
    assert!(order.rank(&2) < order.rank(&3));
    assert!(order.rank(&3) < order.rank(&9));
    assert_eq!(order.rank(&1), u64::MAX);
    // The source table is untouched by the union.
    assert_eq!(empty.rank(&1), u64::MAX);
}

#[test]
fn engine_insert_new_is_filter_plus_apply() {
    let mut engine = ReconciliationEngine::new(title_ordering());
    assert!(!engine.ordering().is_sectioned());
    let recon = engine.insert_new(vec![Row::new(1, "", "b"), Row::new(2, "", "a")]);
    assert_eq!(recon.added.len(), 2);
    assert_eq!(engine.state().flat_ids(), [2, 1]);
}

#[test]
fn randomized_churn_keeps_mirror_consistent() {
    let mut rng = Lcg::new(0x5eed);
    let sink = Arc::new(MirrorSink::default());
    let options = ControllerOptions::new(grouped_ordering())
        .with_sink(sink.clone())
        .with_large_batch_threshold(usize::MAX);
    let mut c = CollectionController::new(options);
    let groups = ["g0", "g1", "g2"];
    let mut live: Vec<Arc<Row>> = Vec::new();
    let mut next_id = 0u32;

    for round in 0..200u32 {
        match rng.below(6) {
            0 => {
                let mut batch: Vec<Arc<Row>> = Vec::new();
                for row in &live {
                    if rng.below(2) == 0 {
                        batch.push(Arc::clone(row));
                    }
                }
                for _ in 0..rng.below(4) {
                    next_id += 1;
                    let row = Row::new(
                        next_id,
                        groups[rng.below(3) as usize],
                        &format!("t{:02}", rng.below(50)),
                    );
                    batch.push(Arc::clone(&row));
                    live.push(row);
                }
                c.assign(batch);
            }
            1 => {
                next_id += 1;
                let row = Row::new(
                    next_id,
                    groups[rng.below(3) as usize],
                    &format!("t{:02}", rng.below(50)),
                );
                live.push(Arc::clone(&row));
                c.schedule_insert(row);
            }
            2 if !live.is_empty() => {
                let row = &live[rng.below(live.len() as u64) as usize];
                row.set_title(&format!("t{:02}", rng.below(50)));
            }
            3 if !live.is_empty() => {
                let row = &live[rng.below(live.len() as u64) as usize];
                row.set_group(groups[rng.below(3) as usize]);
            }
            4 if !live.is_empty() => {
                live[rng.below(live.len() as u64) as usize].touch();
            }
            5 if !live.is_empty() => {
                let row = live.swap_remove(rng.below(live.len() as u64) as usize);
                row.mark_deleted();
            }
            _ => {}
        }
        if round % 3 == 0 {
            c.flush();
        }
    }
    c.flush();

    // Final state is duplicate-free and fully ordered.
    let mut ids = c.fetched_ids();
    assert_eq!(ids.len(), c.len());
    ids.sort_unstable();
    let before = ids.len();
    ids.dedup();
    assert_eq!(ids.len(), before);

    let records = c.fetched_records();
    let ordering = grouped_ordering();
    for pair in records.windows(2) {
        assert_ne!(
            ordering.compare(&pair[0], &pair[1]),
            std::cmp::Ordering::Greater
        );
    }
    assert!(sink.batch_count() > 0);
}
