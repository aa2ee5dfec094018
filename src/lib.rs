//! A headless incremental sectioned collection controller.
//!
//! `resultset` keeps an ordered, sectioned, observable projection over a
//! dynamically changing collection of records, in the spirit of Core Data's
//! `NSFetchedResultsController` but decoupled from any storage layer or UI
//! toolkit. Feed it records from any source (a bulk fetch, a creation
//! broadcast, direct inserts) and it reconciles the displayed set
//! incrementally, handing consumers a minimal ordered stream of
//! insert/delete/move/update events instead of full reloads.
//!
//! # Core pieces
//!
//! - [`CollectionController`] owns the fetched set and drives everything.
//! - [`OrderingSpec`] declares the sort comparator chain and the optional
//!   section key; ties fall back to fetch order, so display order is always
//!   total and deterministic.
//! - [`TrackedRecord`] is the contract records implement: a stable identity,
//!   a deleted flag, and change-observer registration per field.
//! - [`ChangeEventSink`] receives the structural events; replaying one
//!   batch's events in order against a naive mirrored list reproduces the
//!   controller's final layout exactly.
//! - [`ControllerOptions`] wires in the external collaborators: fetch
//!   source, associated-value source, creation/reset/memory-pressure
//!   broadcasts, inclusion check.
//!
//! # Threading model
//!
//! The controller is single-owner, not `Sync`: it lives on one thread and is
//! driven from there. Callbacks and completions from other threads are
//! queued internally; the `on_work` callback fires (once per quiet period)
//! to tell the host to call [`CollectionController::flush`] on the owning
//! thread. With coalescing enabled (the default), changes accumulating
//! between flushes collapse into batched reconciliations.
//!
//! # Example
//!
//! ```ignore
//! let ordering = OrderingSpec::new()
//!     .with_descriptor(SortDescriptor::by_key("title", true, |r: &Note| {
//!         r.title()
//!     }));
//! let options = ControllerOptions::new(ordering)
//!     .with_sink(sink)
//!     .with_on_work(move || event_loop.schedule_flush());
//! let mut controller = CollectionController::new(options);
//! controller.assign(initial_records);
//! ```

#![forbid(unsafe_code)]

#[macro_use]
mod macros;

mod cache;
mod controller;
mod diff;
mod engine;
mod error;
mod events;
mod observe;
mod options;
mod ordering;
mod record;
mod schedule;
mod sections;
mod types;

#[cfg(test)]
mod tests;

pub use controller::CollectionController;
pub use error::{ControllerError, MalformedRecord};
pub use events::ChangeEventSink;
pub use options::{
    AssociationCompletion, AssociationInvalidationHook, AssociationSource, ControllerOptions,
    CreationEvent, FetchCompletion, FetchSource, InclusionCheck,
};
pub use ordering::{Comparator, OrderingSpec, SectionDescriptor, SectionKeyFn, SortDescriptor};
pub use record::{Broadcast, BroadcastHandler, BroadcastHub, ChangeObserver, Subscription, TrackedRecord};
pub use schedule::WakeCallback;
pub use sections::Section;
pub use types::{AssocValue, ChangeEvent, FieldKey, Locator};
