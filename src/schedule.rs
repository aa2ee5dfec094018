use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use crate::engine::SortContext;
use crate::record::TrackedRecord;
use crate::types::{AssocValue, FieldKey};

/// Fired when deferred work lands in an empty queue; the host should arrange
/// for [`crate::CollectionController::flush`] to run on the affinity thread.
pub type WakeCallback = Arc<dyn Fn() + Send + Sync>;

/// A deferred unit of work bound for the affinity thread.
///
/// Everything that can originate off-thread (observation callbacks, fetch
/// and association completions, background sorts, broadcasts) is expressed
/// as a task; shared state is only ever touched while draining.
pub(crate) enum Task<R: TrackedRecord> {
    /// Replace the base fetch set (fetch completion).
    Assign(Vec<Arc<R>>),
    /// A background-sorted assign target, guarded by the sort epoch. Carries
    /// the sort context so the pending rank table commits only on apply.
    SortedAssign {
        records: Vec<Arc<R>>,
        context: SortContext<R>,
        epoch: u64,
    },
    /// A background-sorted insert batch, guarded by the sort epoch.
    SortedInsert { records: Vec<Arc<R>>, epoch: u64 },
    /// An externally-created candidate record.
    Insert(Arc<R>),
    PayloadChanged(R::Id),
    DeletedChanged(R::Id),
    SortKeyChanged(R::Id),
    /// Run (or re-run) the fetch source.
    Fetch,
    AssociationsResolved {
        field: FieldKey,
        epoch: u64,
        requested: Vec<R::Id>,
        values: HashMap<R::Id, AssocValue>,
    },
    AssociationInvalidated { id: R::Id, field: FieldKey },
    FlushCache,
}

struct Shared {
    armed: AtomicBool,
    wake: Option<WakeCallback>,
}

/// A clonable producer endpoint for [`Task`]s.
///
/// Pushing into an un-armed queue arms it and fires the wake callback once;
/// further pushes before the next drain stay silent (debounce-to-latest-tick,
/// not debounce-to-quiescence).
pub(crate) struct TaskHandle<R: TrackedRecord> {
    tx: Sender<Task<R>>,
    shared: Arc<Shared>,
}

impl<R: TrackedRecord> Clone for TaskHandle<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: TrackedRecord> TaskHandle<R> {
    pub(crate) fn push(&self, task: Task<R>) {
        // A send error means the controller is gone; late callbacks from
        // already-cancelled sources are dropped by design.
        if self.tx.send(task).is_err() {
            rtrace!("task dropped: controller no longer exists");
            return;
        }
        if !self.shared.armed.swap(true, Ordering::SeqCst) {
            if let Some(wake) = &self.shared.wake {
                wake();
            }
        }
    }
}

/// Collapses repeated requests arriving before the next processing tick into
/// one drained batch.
pub(crate) struct CoalescingScheduler<R: TrackedRecord> {
    rx: Receiver<Task<R>>,
    handle: TaskHandle<R>,
}

impl<R: TrackedRecord> CoalescingScheduler<R> {
    pub(crate) fn new(wake: Option<WakeCallback>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            handle: TaskHandle {
                tx,
                shared: Arc::new(Shared {
                    armed: AtomicBool::new(false),
                    wake,
                }),
            },
        }
    }

    pub(crate) fn handle(&self) -> TaskHandle<R> {
        self.handle.clone()
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.handle.shared.armed.load(Ordering::SeqCst)
    }

    /// Takes everything queued so far. Disarms first, so a push that races
    /// the drain re-arms and re-wakes for the next tick.
    pub(crate) fn drain(&mut self) -> Vec<Task<R>> {
        self.handle.shared.armed.store(false, Ordering::SeqCst);
        self.rx.try_iter().collect()
    }
}

/// Sorts a large batch on a worker thread and posts the result back as a
/// task. The epoch lets the drain discard results superseded by a newer
/// assign.
pub(crate) fn spawn_sort<R: TrackedRecord>(
    mut records: Vec<Arc<R>>,
    context: SortContext<R>,
    epoch: u64,
    assign: bool,
    handle: TaskHandle<R>,
) {
    thread::spawn(move || {
        context.sort(&mut records);
        let task = if assign {
            Task::SortedAssign {
                records,
                context,
                epoch,
            }
        } else {
            Task::SortedInsert { records, epoch }
        };
        handle.push(task);
    });
}
