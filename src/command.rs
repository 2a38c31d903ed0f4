//! Module containing support for Domain Commands.
//!
//! Following the Domain-driven Design definition, a Command expresses the
//! intent of an Actor (e.g. a Customer, a User, a System, etc.) to modify
//! the state of the system in some way.
//!
//! To modify the state of the system through a Command, you must
//! implement a Command [Handler] which, in an Event-sourced system,
//! should make use of an [Aggregate][crate::aggregate::Aggregate] to
//! evaluate the validity of the Command submitted, and emit Domain
//! Events as a result (through the [Event Store][crate::event::store::Store]).

use std::future::Future;

use async_trait::async_trait;

use crate::message;

/// A Command represents an intent by an Actor (e.g. a User, or a System)
/// to mutate the state of the system.
///
/// In an event-sourced system, a Command is represented as a
/// [Message][message::Message].
pub type Envelope<T> = message::Envelope<T>;

/// A software component that is able to handle Commands of a certain type,
/// and mutate the state as a result of the command handling, or fail.
///
/// In an event-sourced system, the Command [Handler] should use an
/// [Aggregate][crate::aggregate::Aggregate] to evaluate a Command to
/// ensure business invariants are respected.
#[async_trait]
pub trait Handler<T>: Send + Sync
where
    T: message::Message,
{
    /// The error type returned by the Handler while handling a Command.
    ///
    /// Prefer error types that keep conflict, not-found and validation
    /// failures distinguishable, so that callers can map each outcome
    /// precisely.
    type Error: Send + Sync;

    /// Handles a Command and returns an error if the handling has failed.
    ///
    /// Since Commands are solely modifying the state of the system,
    /// they do not return anything to the caller but the result of the operation
    /// (expressed by a [Result] type).
    async fn handle(&self, command: Envelope<T>) -> Result<(), Self::Error>;
}

#[async_trait]
impl<T, Err, F, Fut> Handler<T> for F
where
    T: message::Message + Send + Sync + 'static,
    Err: Send + Sync,
    F: Send + Sync + Fn(Envelope<T>) -> Fut,
    Fut: Send + Sync + Future<Output = Result<(), Err>>,
{
    type Error = Err;

    async fn handle(&self, command: Envelope<T>) -> Result<(), Self::Error> {
        self(command).await
    }
}

#[cfg(test)]
mod test_order_use_cases {
    use async_trait::async_trait;

    use crate::aggregate::repository::{self, Repository};
    use crate::event::store::InMemory;
    use crate::state::test_order_domain::{Order, OrderEvent, OrderItem};
    use crate::{aggregate, command, message};

    struct PlaceOrder {
        order_id: String,
    }

    impl message::Message for PlaceOrder {
        fn name(&self) -> &'static str {
            "PlaceOrder"
        }
    }

    /// All the distinguishable outcomes of handling a [PlaceOrder] command.
    #[derive(Debug, thiserror::Error)]
    enum PlaceOrderError {
        #[error(transparent)]
        NotFound(aggregate::Error),
        #[error(transparent)]
        Conflict(repository::StoreError),
        #[error("failed to place order: {0}")]
        Other(#[from] anyhow::Error),
    }

    struct PlaceOrderHandler<R>(R)
    where
        R: Repository<Order>;

    #[async_trait]
    impl<R> command::Handler<PlaceOrder> for PlaceOrderHandler<R>
    where
        R: Repository<Order>,
    {
        type Error = PlaceOrderError;

        async fn handle(
            &self,
            command: command::Envelope<PlaceOrder>,
        ) -> Result<(), Self::Error> {
            let id = command.message.order_id;

            let mut order = self
                .0
                .load(&id)
                .await
                .map_err(anyhow::Error::from)
                .map_err(PlaceOrderError::Other)?;

            order.ensure_exists().map_err(PlaceOrderError::NotFound)?;

            order.apply(OrderEvent::WasPlaced);

            self.0
                .store(&id, &mut order)
                .await
                .map_err(|err| match err {
                    repository::StoreError::Conflict(_) => PlaceOrderError::Conflict(err),
                    other => PlaceOrderError::Other(other.into()),
                })?;

            Ok(())
        }
    }

    fn add_item_command(order_id: &str) -> (String, OrderEvent) {
        (
            order_id.to_owned(),
            OrderEvent::ItemWasAdded {
                item: OrderItem {
                    sku: "sku-1".to_owned(),
                    quantity: 1,
                },
            },
        )
    }

    #[tokio::test]
    async fn it_places_an_existing_order() {
        use crate::command::Handler;

        let repository = repository::EventSourced::<Order, _>::from(InMemory::default());

        let (id, seed_event) = add_item_command("42");
        let mut order = repository.load(&id).await.expect("load should not fail");
        order.apply(seed_event);
        repository
            .store(&id, &mut order)
            .await
            .expect("store should not fail");

        let handler = PlaceOrderHandler(repository.clone());

        handler
            .handle(command::Envelope::from(PlaceOrder {
                order_id: id.clone(),
            }))
            .await
            .expect("the order exists, placing it should not fail");

        let placed = repository.load(&id).await.expect("load should not fail");
        assert!(placed.state().placed);
    }

    #[tokio::test]
    async fn it_fails_to_place_an_order_that_does_not_exist() {
        use crate::command::Handler;

        let repository = repository::EventSourced::<Order, _>::from(InMemory::default());
        let handler = PlaceOrderHandler(repository);

        let error = handler
            .handle(command::Envelope::from(PlaceOrder {
                order_id: "missing".to_owned(),
            }))
            .await
            .expect_err("the order does not exist");

        assert!(matches!(error, PlaceOrderError::NotFound(_)));
    }
}
