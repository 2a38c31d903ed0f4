//! Module containing support for the Aggregate pattern.
//!
//! ## What is an Aggregate?
//!
//! An [Aggregate] is the most important concept in your domain: it
//! represents a consistency boundary around one of the entities your
//! business domain is composed of, whose state is derived purely from
//! the ordered sequence of Domain Events recorded for it.
//!
//! In `eventum`, an [Aggregate] wraps one [State] instance together with
//! the bookkeeping needed to persist it through an Event Store:
//!
//! * the **original version**, i.e. the [Version] of the last Domain Event
//!   recorded in the Event Stream at load time (or nothing, for a new
//!   instance that has never been stored);
//! * the ordered list of **pending changes**, i.e. the Domain Events
//!   applied since load time that have not been appended yet;
//! * the **current version**, always equal to the original version
//!   advanced by one for each pending change.
//!
//! State transitions happen exclusively by [applying][Aggregate::apply]
//! Domain Events, folded through the [State]'s reducer table. The state
//! value is replaced on each application, never mutated in place.
//!
//! Use an [aggregate Repository][repository::Repository] to load and
//! store [Aggregate] instances from and to an Event Store.

use std::fmt::{Debug, Formatter};

use crate::event;
use crate::state::{Fold, State};
use crate::version::Version;

pub mod repository;
pub mod snapshot;

pub use repository::{EventSourced, Repository};
pub use snapshot::Snapshot;

/// All possible error types returned by the [Aggregate] existence guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Error returned by [`Aggregate::ensure_exists`] when the instance
    /// has no recorded nor pending Domain Events.
    #[error("aggregate was not found")]
    NotFound,

    /// Error returned by [`Aggregate::ensure_does_not_exist`] when the
    /// instance has recorded or pending Domain Events already.
    #[error("aggregate already exists")]
    AlreadyExists,
}

/// An [Aggregate] manages a domain entity [State], acting as a
/// _transaction boundary_.
///
/// Check out the [module-level documentation][self] for more information.
pub struct Aggregate<S>
where
    S: State,
{
    state: S,
    fold: Fold<S, S::Event>,
    original_version: Option<Version>,
    changes: Vec<event::Envelope<S::Event>>,
}

impl<S> Default for Aggregate<S>
where
    S: State,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Debug for Aggregate<S>
where
    S: State + Debug,
    S::Event: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregate")
            .field("state", &self.state)
            .field("original_version", &self.original_version)
            .field("changes", &self.changes)
            .finish()
    }
}

impl<S> Aggregate<S>
where
    S: State,
{
    /// Creates a new [Aggregate] instance with the zero-value [State]
    /// and no recorded Domain Events.
    pub fn new() -> Self {
        Self::with_fold(S::fold())
    }

    /// Creates a new [Aggregate] instance using the specified reducer
    /// table instead of [`State::fold`].
    ///
    /// Useful together with a [Repository][repository::EventSourced]
    /// factory, when reducers capture injected dependencies.
    pub fn with_fold(fold: Fold<S, S::Event>) -> Self {
        Self {
            state: S::default(),
            fold,
            original_version: None,
            changes: Vec::default(),
        }
    }

    /// Returns a reference to the current [State].
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Returns the [Version] of the last Domain Event recorded in the
    /// Event Stream at load time, or `None` for a new instance.
    pub fn original_version(&self) -> Option<Version> {
        self.original_version
    }

    /// Returns the [Version] the Event Stream will have once the pending
    /// changes are stored, or `None` for a new instance with no
    /// pending changes.
    pub fn current_version(&self) -> Option<Version> {
        match self.original_version {
            Some(version) => Some(version + self.changes.len() as Version),
            None => (self.changes.len() as Version).checked_sub(1),
        }
    }

    /// Returns the ordered list of pending Domain Events, applied on
    /// this instance but not yet stored.
    pub fn changes(&self) -> &[event::Envelope<S::Event>] {
        &self.changes
    }

    /// Applies a new Domain Event to the [Aggregate]: the event is
    /// recorded as a pending change, folded into the current [State],
    /// and the current version advances by one.
    pub fn apply(&mut self, event: impl Into<event::Envelope<S::Event>>) {
        let event = event.into();

        self.state = self.fold.apply(std::mem::take(&mut self.state), &event.message);
        self.changes.push(event);
    }

    /// Replays a full ordered Event Stream history, resetting the
    /// [State] to its zero-value first.
    ///
    /// The original version is set from the [Version] of the last
    /// Domain Event replayed, and pending changes are discarded.
    pub fn load<I>(&mut self, events: I)
    where
        I: IntoIterator<Item = event::Persisted<S::Event>>,
    {
        self.state = S::default();
        self.original_version = None;
        self.changes.clear();

        self.replay(events);
    }

    /// Hydrates the [Aggregate] directly from a [Snapshot], skipping
    /// the Event Stream replay entirely.
    pub fn load_snapshot(&mut self, snapshot: Snapshot<S>) {
        self.state = snapshot.state;
        self.original_version = Some(snapshot.version);
        self.changes.clear();
    }

    /// Creates a [Snapshot] out of the current [State] and version.
    ///
    /// Returns `None` when the instance has no recorded nor pending
    /// Domain Events, as there is no version to snapshot yet.
    pub fn snapshot(&self) -> Option<Snapshot<S>>
    where
        S: Clone,
    {
        Some(Snapshot {
            state: self.state.clone(),
            version: self.current_version()?,
        })
    }

    /// Fails with [`Error::NotFound`] unless the instance has recorded
    /// or pending Domain Events.
    ///
    /// Use this guard in command handlers that operate on entities
    /// expected to exist already.
    pub fn ensure_exists(&self) -> Result<(), Error> {
        match self.current_version() {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }

    /// Fails with [`Error::AlreadyExists`] if the instance has recorded
    /// or pending Domain Events.
    ///
    /// Use this guard in command handlers that create new entities.
    pub fn ensure_does_not_exist(&self) -> Result<(), Error> {
        match self.current_version() {
            Some(_) => Err(Error::AlreadyExists),
            None => Ok(()),
        }
    }

    /// Takes the list of pending Domain Events from the current instance,
    /// resetting it to its default (empty) value.
    #[doc(hidden)]
    pub fn take_changes(&mut self) -> Vec<event::Envelope<S::Event>> {
        std::mem::take(&mut self.changes)
    }

    /// Marks the pending changes taken from this instance as committed
    /// at the specified [Version].
    #[doc(hidden)]
    pub fn mark_committed(&mut self, version: Version) {
        self.original_version = Some(version);
    }

    /// Folds additional [Persisted][event::Persisted] Domain Events on
    /// top of the current state, advancing the original version.
    pub(crate) fn replay<I>(&mut self, events: I)
    where
        I: IntoIterator<Item = event::Persisted<S::Event>>,
    {
        for persisted in events {
            self.state = self
                .fold
                .apply(std::mem::take(&mut self.state), &persisted.event.message);

            self.original_version = Some(persisted.version);
        }
    }
}


#[cfg(test)]
mod test {
    use super::test_support::persisted;
    use super::*;
    use crate::state::test_order_domain::{Order, OrderEvent, OrderItem};
    use crate::stream::StreamName;

    fn item(sku: &str) -> OrderItem {
        OrderItem {
            sku: sku.to_owned(),
            quantity: 1,
        }
    }

    #[test]
    fn a_new_aggregate_has_no_versions_and_does_not_exist() {
        let order = Aggregate::<Order>::new();

        assert_eq!(None, order.original_version());
        assert_eq!(None, order.current_version());
        assert_eq!(Err(Error::NotFound), order.ensure_exists());
        assert_eq!(Ok(()), order.ensure_does_not_exist());
    }

    #[test]
    fn applying_events_records_pending_changes_and_advances_the_version() {
        let mut order = Aggregate::<Order>::new();

        order.apply(OrderEvent::ItemWasAdded { item: item("sku-1") });
        order.apply(OrderEvent::WasPlaced);

        assert_eq!(None, order.original_version());
        assert_eq!(Some(1), order.current_version());
        assert_eq!(2, order.changes().len());
        assert!(order.state().placed);
        assert_eq!(Ok(()), order.ensure_exists());
        assert_eq!(Err(Error::AlreadyExists), order.ensure_does_not_exist());
    }

    #[test]
    fn loading_a_history_sets_the_original_version_from_the_last_event() {
        let stream_id = StreamName::from("Order-42");
        let mut order = Aggregate::<Order>::new();

        order.load(vec![
            persisted(
                stream_id.clone(),
                0,
                0,
                OrderEvent::ItemWasAdded { item: item("sku-1") },
            ),
            persisted(stream_id, 1, 1, OrderEvent::WasPlaced),
        ]);

        assert_eq!(Some(1), order.original_version());
        assert_eq!(Some(1), order.current_version());
        assert!(order.changes().is_empty());
        assert!(order.state().placed);
    }

    #[test]
    fn snapshots_round_trip_state_and_version() {
        let stream_id = StreamName::from("Order-42");
        let mut order = Aggregate::<Order>::new();

        order.load(vec![
            persisted(
                stream_id.clone(),
                0,
                0,
                OrderEvent::ItemWasAdded { item: item("sku-1") },
            ),
            persisted(stream_id, 1, 1, OrderEvent::WasPlaced),
        ]);

        let snapshot = order.snapshot().expect("the aggregate has a version");

        let mut restored = Aggregate::<Order>::new();
        restored.load_snapshot(snapshot);

        assert_eq!(order.state(), restored.state());
        assert_eq!(order.current_version(), restored.current_version());
    }

    #[test]
    fn snapshotting_a_new_aggregate_yields_nothing() {
        let order = Aggregate::<Order>::new();

        assert!(order.snapshot().is_none());
    }
}
