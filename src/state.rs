//! Module containing the state folding engine: the registry of pure
//! event reducers that derive an entity state from its Domain Events.
//!
//! ## What is folding?
//!
//! In Event Sourcing, the state of an entity is not stored directly:
//! it is derived by replaying the ordered sequence of Domain Events
//! recorded for it, applying each event to the previous state value
//! through a **reducer**, a pure function `(old_state, event) -> new_state`.
//!
//! ## Folding in `eventum`
//!
//! The [State] trait binds an entity state type to its reducer table,
//! expressed as a [Fold] value: an explicit map from a stable event type
//! name (the [`Message::name`][crate::message::Message::name]) to the
//! reducer for that event type.
//!
//! The table is built once, at registration time, and duplicate
//! registrations are detected there rather than at message-dispatch time.
//! Folding an event type with no registered reducer leaves the state
//! unchanged: this makes state types forward-compatible with event types
//! introduced by newer versions of the application.
//!
//! ```rust
//! use eventum::state::{Fold, State};
//! use eventum::message::Message;
//!
//! #[derive(Debug, Default, Clone, PartialEq, Eq)]
//! struct Counter {
//!     value: i64,
//! }
//!
//! #[derive(Debug, Clone, PartialEq, Eq)]
//! enum CounterEvent {
//!     Incremented,
//!     Decremented,
//! }
//!
//! impl Message for CounterEvent {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             CounterEvent::Incremented => "CounterWasIncremented",
//!             CounterEvent::Decremented => "CounterWasDecremented",
//!         }
//!     }
//! }
//!
//! impl State for Counter {
//!     type Id = String;
//!     type Event = CounterEvent;
//!
//!     fn type_name() -> &'static str {
//!         "Counter"
//!     }
//!
//!     fn fold() -> Fold<Self, Self::Event> {
//!         Fold::new()
//!             .on("CounterWasIncremented", |state: Counter, _| Counter {
//!                 value: state.value + 1,
//!             })
//!             .on("CounterWasDecremented", |state: Counter, _| Counter {
//!                 value: state.value - 1,
//!             })
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};

use crate::message;

/// A pure reducer, folding one Domain Event into the previous state value
/// to produce the next one.
///
/// To enforce immutability, reducers take ownership of the previous state
/// and return the new version of it.
pub type Reducer<S, Evt> = Box<dyn Fn(S, &Evt) -> S + Send + Sync>;

/// This error is returned by [`Fold::try_on`] when a reducer has already
/// been registered for the same event type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a reducer is already registered for event type: {name}")]
pub struct DuplicateReducer {
    /// The event type name that was registered twice.
    pub name: &'static str,
}

/// A closed table of [Reducer]s, keyed by the stable event type name
/// of the Domain Events they apply.
///
/// Check out the [module-level documentation][self] for more information.
pub struct Fold<S, Evt>
where
    Evt: message::Message,
{
    reducers: HashMap<&'static str, Reducer<S, Evt>>,
}

impl<S, Evt> Default for Fold<S, Evt>
where
    Evt: message::Message,
{
    fn default() -> Self {
        Self {
            reducers: HashMap::default(),
        }
    }
}

impl<S, Evt> Debug for Fold<S, Evt>
where
    Evt: message::Message,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.reducers.keys().collect();
        names.sort();

        f.debug_struct("Fold").field("reducers", &names).finish()
    }
}

impl<S, Evt> Fold<S, Evt>
where
    Evt: message::Message,
{
    /// Creates a new, empty reducer table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the [Reducer] for the specified event type name.
    ///
    /// # Errors
    ///
    /// Fails with [DuplicateReducer] if a reducer has already been
    /// registered for the same event type name.
    pub fn try_on<F>(mut self, name: &'static str, reducer: F) -> Result<Self, DuplicateReducer>
    where
        F: Fn(S, &Evt) -> S + Send + Sync + 'static,
    {
        if self.reducers.insert(name, Box::new(reducer)).is_some() {
            return Err(DuplicateReducer { name });
        }

        Ok(self)
    }

    /// Registers the [Reducer] for the specified event type name.
    ///
    /// # Panics
    ///
    /// Panics if a reducer has already been registered for the same event
    /// type name. Use [`Fold::try_on`] to handle the failure instead.
    #[must_use]
    #[track_caller]
    pub fn on<F>(self, name: &'static str, reducer: F) -> Self
    where
        F: Fn(S, &Evt) -> S + Send + Sync + 'static,
    {
        match self.try_on(name, reducer) {
            Ok(fold) => fold,
            Err(err) => panic!("{err}"),
        }
    }

    /// Returns whether a reducer has been registered for the specified
    /// event type name.
    pub fn handles(&self, name: &str) -> bool {
        self.reducers.contains_key(name)
    }

    /// Folds a single Domain Event into the specified state value.
    ///
    /// An event type with no registered reducer leaves the state
    /// unchanged, without error.
    pub fn apply(&self, state: S, event: &Evt) -> S {
        match self.reducers.get(event.name()) {
            Some(reducer) => reducer(state, event),
            None => state,
        }
    }

    /// Folds an ordered list of Domain Events into the specified
    /// state value.
    pub fn apply_all<'a, I>(&self, state: S, events: I) -> S
    where
        I: IntoIterator<Item = &'a Evt>,
        Evt: 'a,
    {
        events
            .into_iter()
            .fold(state, |state, event| self.apply(state, event))
    }
}

/// A [State] represents the Domain Entity data structure of an
/// [Aggregate][crate::aggregate::Aggregate], derived purely from its
/// ordered sequence of Domain Events.
///
/// The `Default` value of the implementing type is the zero-value the
/// event replay starts from.
pub trait State: Default + Sized + Send + Sync {
    /// The type used to uniquely identify one instance of this entity.
    type Id: Display + Eq + Send + Sync;

    /// The Domain Events that express mutations of this entity state,
    /// usually an `enum`.
    type Event: message::Message + Send + Sync;

    /// A unique name identifier for this entity type, used to derive
    /// the [StreamName][crate::stream::StreamName] of its instances.
    fn type_name() -> &'static str;

    /// Returns the reducer table used to fold Domain Events into
    /// this state type.
    fn fold() -> Fold<Self, Self::Event>;
}

#[cfg(test)]
pub(crate) mod test_order_domain {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    pub(crate) struct Order {
        pub(crate) items: Vec<OrderItem>,
        pub(crate) placed: bool,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct OrderItem {
        pub(crate) sku: String,
        pub(crate) quantity: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) enum OrderEvent {
        ItemWasAdded { item: OrderItem },
        WasPlaced,
    }

    impl message::Message for OrderEvent {
        fn name(&self) -> &'static str {
            match self {
                OrderEvent::ItemWasAdded { .. } => "OrderItemWasAdded",
                OrderEvent::WasPlaced => "OrderWasPlaced",
            }
        }
    }

    impl State for Order {
        type Id = String;
        type Event = OrderEvent;

        fn type_name() -> &'static str {
            "Order"
        }

        fn fold() -> Fold<Self, Self::Event> {
            Fold::new()
                .on("OrderItemWasAdded", |mut order: Order, event| {
                    if let OrderEvent::ItemWasAdded { item } = event {
                        order.items.push(item.clone());
                    }
                    order
                })
                .on("OrderWasPlaced", |order: Order, _| Order {
                    placed: true,
                    ..order
                })
        }
    }
}
