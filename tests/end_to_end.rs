//! Full-stack tests: command side (aggregate + repository + event store)
//! wired to the read side (subscription + handlers + checkpoints).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use eventum::aggregate::repository::EventSourced;
use eventum::aggregate::Repository;
use eventum::checkpoint::{self, Store as CheckpointStore};
use eventum::event::store::InMemory;
use eventum::event::Persisted;
use eventum::message::Message;
use eventum::state::{Fold, State};
use eventum::subscription::{
    Consumer, EventHandler, Handling, Subscription, SubscriptionId,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Order {
    placed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum OrderEvent {
    Placed,
}

impl Message for OrderEvent {
    fn name(&self) -> &'static str {
        match self {
            OrderEvent::Placed => "OrderPlaced",
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
        Fold::new().on("OrderPlaced", |order: Order, _| Order {
            placed: true,
            ..order
        })
    }
}

#[derive(Clone, Default)]
struct OrderProjection {
    placed_orders: Arc<Mutex<Vec<String>>>,
}

impl OrderProjection {
    fn placed(&self) -> Vec<String> {
        self.placed_orders
            .lock()
            .expect("acquire lock on placed orders")
            .clone()
    }
}

#[async_trait]
impl EventHandler<OrderEvent> for OrderProjection {
    async fn handle(&self, event: &Persisted<OrderEvent>) -> anyhow::Result<Handling> {
        match event.event.message {
            OrderEvent::Placed => {
                self.placed_orders
                    .lock()
                    .expect("acquire lock on placed orders")
                    .push(event.stream_id.to_string());

                Ok(Handling::Success)
            }
        }
    }
}

async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("condition was not met in time");
}

#[tokio::test]
async fn a_placed_order_reaches_the_subscriber_and_is_checkpointed_once() {
    let event_store = InMemory::<OrderEvent>::default();
    let checkpoint_store = checkpoint::InMemory::default();
    let subscription_id = SubscriptionId::from("projection:orders");

    let repository = EventSourced::<Order, _>::from(event_store.clone());
    let projection = OrderProjection::default();

    // Command side: place a brand new order.
    let id = "42".to_owned();
    let mut order = repository.load(&id).await.expect("load should not fail");

    order
        .ensure_does_not_exist()
        .expect("the order is brand new");
    order.apply(OrderEvent::Placed);

    let result = repository
        .store(&id, &mut order)
        .await
        .expect("store should not fail");

    assert_eq!(Some(0), result.next_expected_version());

    // Read side: subscribe from the start position.
    let handle = Subscription::new(
        subscription_id.clone(),
        event_store,
        checkpoint_store.clone(),
        Consumer::new().add_handler(projection.clone()),
    )
    .start()
    .await
    .expect("the subscription should start");

    wait_until(|| !projection.placed().is_empty()).await;

    handle.stop().await.expect("stop should not fail");

    assert_eq!(vec!["Order-42".to_owned()], projection.placed());

    // Exactly one checkpoint store call, carrying position 0.
    let history = checkpoint_store.history();
    assert_eq!(1, history.len());
    assert_eq!(Some(0), history[0].position);
    assert_eq!(subscription_id, history[0].subscription_id);
}

#[tokio::test]
async fn a_restarted_subscription_resumes_where_it_left_off() {
    let event_store = InMemory::<OrderEvent>::default();
    let checkpoint_store = checkpoint::InMemory::default();
    let subscription_id = SubscriptionId::from("projection:orders");

    let repository = EventSourced::<Order, _>::from(event_store.clone());
    let projection = OrderProjection::default();

    let first_id = "1".to_owned();
    let mut first = repository
        .load(&first_id)
        .await
        .expect("load should not fail");
    first.apply(OrderEvent::Placed);
    repository
        .store(&first_id, &mut first)
        .await
        .expect("store should not fail");

    // First run: process the first order, then shut down.
    let handle = Subscription::new(
        subscription_id.clone(),
        event_store.clone(),
        checkpoint_store.clone(),
        Consumer::new().add_handler(projection.clone()),
    )
    .start()
    .await
    .expect("the subscription should start");

    wait_until(|| projection.placed().len() == 1).await;
    handle.stop().await.expect("stop should not fail");

    // A second order is placed while the subscription is down.
    let second_id = "2".to_owned();
    let mut second = repository
        .load(&second_id)
        .await
        .expect("load should not fail");
    second.apply(OrderEvent::Placed);
    repository
        .store(&second_id, &mut second)
        .await
        .expect("store should not fail");

    // Second run: only the new order is delivered.
    let handle = Subscription::new(
        subscription_id.clone(),
        event_store,
        checkpoint_store.clone(),
        Consumer::new().add_handler(projection.clone()),
    )
    .start()
    .await
    .expect("the subscription should start");

    wait_until(|| projection.placed().len() == 2).await;
    handle.stop().await.expect("stop should not fail");

    assert_eq!(
        vec!["Order-1".to_owned(), "Order-2".to_owned()],
        projection.placed()
    );

    let last = checkpoint_store
        .get_last(&subscription_id)
        .await
        .expect("get_last should not fail");

    assert_eq!(Some(1), last.position);
}
