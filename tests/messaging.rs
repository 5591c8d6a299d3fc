//! End-to-end scenarios of the messaging runtime over the in-memory broker.

mod support;

use futures_util::{future::BoxFuture, FutureExt};
use rabbitmq_messaging::{
    channel::{BrokerChannel, ChannelFactory},
    message::{MessageProperties, OutboundMessage},
    queue::QueueDefinition,
    topology::{DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE},
    transport_error::TRANSPORT_ERROR_MESSAGE_TYPE,
    ConsumerConfiguration, ConsumerSerializerErrorPolicy, HandlerError, Message,
    MessagingConfiguration, MessagingError, MessagingRuntime, PublisherConfiguration,
    TransportError,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use support::{wait_until, InMemoryBroker};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    id: u32,
}

impl Message for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "orders.OrderPlaced";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderCancelled {
    id: u32,
}

impl Message for OrderCancelled {
    const MESSAGE_TYPE: &'static str = "orders.OrderCancelled";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InvoiceIssued {
    number: String,
}

impl Message for InvoiceIssued {
    const MESSAGE_TYPE: &'static str = "billing.InvoiceIssued";
}

type Received = Arc<Mutex<Vec<(String, u32)>>>;

type Handler<M> = Box<dyn Fn(M, CancellationToken) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

fn recording(consumer: &'static str, received: Received) -> Handler<OrderPlaced> {
    Box::new(move |msg: OrderPlaced, _token: CancellationToken| {
        let received = received.clone();
        async move {
            received.lock().unwrap().push((consumer.to_owned(), msg.id));
            Ok::<(), HandlerError>(())
        }
        .boxed()
    })
}

fn failing(attempts: Arc<AtomicUsize>) -> Handler<OrderPlaced> {
    Box::new(move |_msg: OrderPlaced, _token: CancellationToken| {
        let attempts = attempts.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), HandlerError>(HandlerError::from("payment gateway unavailable"))
        }
        .boxed()
    })
}

fn runtime(
    broker: &Arc<InMemoryBroker>,
    consumers: Vec<ConsumerConfiguration>,
) -> MessagingRuntime<InMemoryBroker> {
    let config = consumers
        .into_iter()
        .fold(
            MessagingConfiguration::builder().connection_string("amqp://localhost:5672/%2f"),
            |builder, consumer| builder.consumer(consumer),
        )
        .build()
        .unwrap();

    MessagingRuntime::with_channel_factory(config, broker.clone())
}

async fn inject_raw(broker: &Arc<InMemoryBroker>, queue: &str, payload: &[u8]) {
    let channel = broker.create_channel().await.unwrap();
    channel
        .publish(OutboundMessage::direct(
            queue,
            payload.to_vec(),
            MessageProperties::persistent(OrderPlaced::MESSAGE_TYPE),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn should_deliver_one_copy_of_a_broadcast_to_each_consumer() {
    let broker = InMemoryBroker::new();
    let received = Received::default();
    let runtime = runtime(
        &broker,
        ["billing", "shipping", "analytics"]
            .into_iter()
            .map(|name| {
                ConsumerConfiguration::builder(name)
                    .subscribe::<OrderPlaced, _>(recording(name, received.clone()))
                    .build()
                    .unwrap()
            })
            .collect(),
    );
    runtime.start().await.unwrap();

    runtime
        .publisher()
        .broadcast(&OrderPlaced { id: 17 }, &CancellationToken::new())
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || received.lock().unwrap().len() == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut consumers: Vec<(String, u32)> = received.lock().unwrap().clone();
    consumers.sort();
    assert_eq!(
        consumers,
        vec![
            ("analytics".to_owned(), 17),
            ("billing".to_owned(), 17),
            ("shipping".to_owned(), 17),
        ]
    );

    runtime.stop().await;
}

#[tokio::test]
async fn should_retry_then_dead_letter_a_message_that_keeps_failing() {
    let broker = InMemoryBroker::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let reported = Arc::new(Mutex::new(Vec::<TransportError>::new()));
    let sink = reported.clone();

    let runtime = runtime(
        &broker,
        vec![
            ConsumerConfiguration::builder("fulfillment")
                .retries(3, Duration::from_millis(100))
                .subscribe::<OrderPlaced, _>(failing(attempts.clone()))
                .build()
                .unwrap(),
            ConsumerConfiguration::builder("error-monitor")
                .subscribe::<TransportError, _>(move |err: TransportError, _token: CancellationToken| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(err);
                        Ok::<(), HandlerError>(())
                    }
                })
                .build()
                .unwrap(),
        ],
    );
    runtime.start().await.unwrap();

    runtime
        .publisher()
        .broadcast(&OrderPlaced { id: 5 }, &CancellationToken::new())
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || broker.ready(DEAD_LETTER_QUEUE).len() == 1).await);
    assert!(wait_until(TIMEOUT, || reported.lock().unwrap().len() == 3).await);

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(broker.rejected(), 1);

    let retry_counts: Vec<u32> = broker
        .published_to("fulfillment.Retry")
        .iter()
        .map(|msg| msg.properties.retry_count)
        .collect();
    assert_eq!(retry_counts, vec![1, 2, 3]);

    assert_eq!(broker.published_to(TRANSPORT_ERROR_MESSAGE_TYPE).len(), 3);
    assert!(reported.lock().unwrap().iter().all(|err| {
        err.origin == "fulfillment" && err.message == "payment gateway unavailable"
    }));

    let dead = broker.ready(DEAD_LETTER_QUEUE);
    assert_eq!(dead[0].properties.message_type, OrderPlaced::MESSAGE_TYPE);
    assert_eq!(dead[0].properties.retry_count, 3);

    runtime.stop().await;
}

#[tokio::test]
async fn should_report_and_drop_failures_when_retries_are_disabled() {
    let broker = InMemoryBroker::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let runtime = runtime(
        &broker,
        vec![ConsumerConfiguration::builder("fulfillment")
            .retries(0, Duration::ZERO)
            .subscribe::<OrderPlaced, _>(failing(attempts.clone()))
            .build()
            .unwrap()],
    );
    runtime.start().await.unwrap();

    runtime
        .publisher()
        .broadcast(&OrderPlaced { id: 8 }, &CancellationToken::new())
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || broker.acked() == 1).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(broker.published_to(TRANSPORT_ERROR_MESSAGE_TYPE).len(), 1);
    assert!(broker.published_to("fulfillment.Retry").is_empty());
    assert!(broker.ready(DEAD_LETTER_QUEUE).is_empty());

    runtime.stop().await;
}

#[tokio::test]
async fn should_send_only_to_the_destination_queue() {
    let broker = InMemoryBroker::new();
    let received = Received::default();
    let runtime = runtime(
        &broker,
        ["billing", "shipping"]
            .into_iter()
            .map(|name| {
                ConsumerConfiguration::builder(name)
                    .subscribe::<OrderPlaced, _>(recording(name, received.clone()))
                    .build()
                    .unwrap()
            })
            .collect(),
    );
    runtime.start().await.unwrap();

    runtime
        .publisher()
        .send("billing", &OrderPlaced { id: 3 }, &CancellationToken::new())
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || !received.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        received.lock().unwrap().clone(),
        vec![("billing".to_owned(), 3)]
    );

    runtime.stop().await;
}

#[tokio::test]
async fn should_ack_messages_of_unsubscribed_types() {
    let broker = InMemoryBroker::new();
    let received = Received::default();
    let runtime = runtime(
        &broker,
        vec![ConsumerConfiguration::builder("billing")
            .subscribe::<OrderPlaced, _>(recording("billing", received.clone()))
            .build()
            .unwrap()],
    );
    runtime.start().await.unwrap();

    runtime
        .publisher()
        .send("billing", &OrderCancelled { id: 4 }, &CancellationToken::new())
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || broker.acked() == 1).await);
    assert!(received.lock().unwrap().is_empty());
    assert_eq!(broker.unacked(), 0);

    runtime.stop().await;
}

#[tokio::test]
async fn should_settle_malformed_payloads_by_serializer_policy() {
    let broker = InMemoryBroker::new();
    let received = Received::default();
    let runtime = runtime(
        &broker,
        vec![
            ConsumerConfiguration::builder("strict")
                .on_serialization_error(ConsumerSerializerErrorPolicy::DeadLetter)
                .subscribe::<OrderPlaced, _>(recording("strict", received.clone()))
                .build()
                .unwrap(),
            ConsumerConfiguration::builder("lenient")
                .on_serialization_error(ConsumerSerializerErrorPolicy::Ignore)
                .subscribe::<OrderPlaced, _>(recording("lenient", received.clone()))
                .build()
                .unwrap(),
        ],
    );
    runtime.start().await.unwrap();

    inject_raw(&broker, "strict", b"{not json").await;
    assert!(wait_until(TIMEOUT, || broker.ready(DEAD_LETTER_QUEUE).len() == 1).await);
    assert_eq!(broker.rejected(), 1);

    inject_raw(&broker, "lenient", b"{not json").await;
    assert!(wait_until(TIMEOUT, || broker.acked() == 1).await);
    assert_eq!(broker.ready(DEAD_LETTER_QUEUE).len(), 1);

    assert!(received.lock().unwrap().is_empty());

    runtime.stop().await;
}

#[tokio::test]
async fn should_provision_topology_on_start_and_release_it_on_stop() {
    let broker = InMemoryBroker::new();
    let received = Received::default();
    let config = MessagingConfiguration::builder()
        .connection_string("amqp://localhost:5672/%2f")
        .publisher(
            PublisherConfiguration::builder()
                .publishes::<InvoiceIssued>()
                .build(),
        )
        .consumer(
            ConsumerConfiguration::builder("billing")
                .max_message_count(100)
                .subscribe::<OrderPlaced, _>(recording("billing", received))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let runtime = MessagingRuntime::with_channel_factory(config, broker.clone());

    runtime.start().await.unwrap();

    for exchange in [
        TRANSPORT_ERROR_MESSAGE_TYPE,
        DEAD_LETTER_EXCHANGE,
        OrderPlaced::MESSAGE_TYPE,
        InvoiceIssued::MESSAGE_TYPE,
    ] {
        let def = broker.exchange(exchange).unwrap();
        assert!(def.is_durable(), "{exchange} should be durable");
    }

    for queue in ["billing", "billing.Retry"] {
        let def = broker.queue(queue).unwrap();
        assert_eq!(def.dead_letter_exchange(), Some(DEAD_LETTER_EXCHANGE));
        assert_eq!(def.max_length_limit(), Some(100));
        assert_eq!(broker.consumer_count(queue), 1);
    }

    let bindings: Vec<(String, String)> = broker
        .bindings()
        .iter()
        .map(|b| (b.queue_name().to_owned(), b.exchange_name().to_owned()))
        .collect();
    assert!(bindings.contains(&(DEAD_LETTER_QUEUE.to_owned(), DEAD_LETTER_EXCHANGE.to_owned())));
    assert!(bindings.contains(&("billing".to_owned(), OrderPlaced::MESSAGE_TYPE.to_owned())));
    assert!(!bindings.iter().any(|(queue, _)| queue == "billing.Retry"));

    assert!(matches!(
        runtime.start().await,
        Err(MessagingError::Configuration(_))
    ));

    runtime.stop().await;

    assert_eq!(broker.consumer_count("billing"), 0);
    assert_eq!(broker.consumer_count("billing.Retry"), 0);
    assert!(broker.is_shut_down());
    assert!(runtime.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn should_process_deliveries_concurrently_and_isolate_failures() {
    let broker = InMemoryBroker::new();
    let second_done = Arc::new(Notify::new());
    let first_overlapped = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(Mutex::new(Vec::<u32>::new()));

    let handler = {
        let second_done = second_done.clone();
        let first_overlapped = first_overlapped.clone();
        let completed = completed.clone();
        move |msg: OrderPlaced, _token: CancellationToken| {
            let second_done = second_done.clone();
            let first_overlapped = first_overlapped.clone();
            let completed = completed.clone();
            async move {
                match msg.id {
                    1 => {
                        let overlapped = tokio::time::timeout(TIMEOUT, second_done.notified())
                            .await
                            .is_ok();
                        first_overlapped.store(overlapped, Ordering::SeqCst);
                    }
                    2 => second_done.notify_one(),
                    _ => return Err(HandlerError::from("inventory service unavailable")),
                }
                completed.lock().unwrap().push(msg.id);
                Ok::<(), HandlerError>(())
            }
        }
    };

    let runtime = runtime(
        &broker,
        vec![ConsumerConfiguration::builder("fulfillment")
            .max_concurrency(4)
            .retries(0, Duration::ZERO)
            .subscribe::<OrderPlaced, _>(handler)
            .build()
            .unwrap()],
    );
    runtime.start().await.unwrap();

    let publisher = runtime.publisher();
    for id in [1, 3, 2] {
        publisher
            .send("fulfillment", &OrderPlaced { id }, &CancellationToken::new())
            .await
            .unwrap();
    }

    assert!(wait_until(TIMEOUT, || broker.acked() == 3).await);

    assert!(first_overlapped.load(Ordering::SeqCst));
    assert_eq!(completed.lock().unwrap().clone(), vec![2, 1]);
    assert_eq!(broker.published_to(TRANSPORT_ERROR_MESSAGE_TYPE).len(), 1);
    assert_eq!(broker.rejected(), 0);
    assert_eq!(broker.unacked(), 0);

    runtime.stop().await;
}

#[tokio::test]
async fn should_release_a_partial_start_and_allow_another_attempt() {
    let broker = InMemoryBroker::new();
    let conflicting = broker.create_channel().await.unwrap();
    conflicting
        .declare_queue(&QueueDefinition::new("second"))
        .await
        .unwrap();

    let received = Received::default();
    let runtime = runtime(
        &broker,
        ["first", "second"]
            .into_iter()
            .map(|name| {
                ConsumerConfiguration::builder(name)
                    .subscribe::<OrderPlaced, _>(recording(name, received.clone()))
                    .build()
                    .unwrap()
            })
            .collect(),
    );

    assert_eq!(
        runtime.start().await,
        Err(MessagingError::DeclareQueue("second".to_owned()))
    );
    assert!(!runtime.is_running().await);
    assert_eq!(broker.open_channels(), 1);
    assert_eq!(broker.consumer_count("first"), 0);

    assert_eq!(
        runtime.start().await,
        Err(MessagingError::DeclareQueue("second".to_owned()))
    );
    assert_eq!(broker.open_channels(), 1);

    runtime.stop().await;
}

#[tokio::test]
async fn should_refuse_to_restart_or_publish_after_stop() {
    let broker = InMemoryBroker::new();
    let received = Received::default();
    let runtime = runtime(
        &broker,
        vec![ConsumerConfiguration::builder("billing")
            .subscribe::<OrderPlaced, _>(recording("billing", received))
            .build()
            .unwrap()],
    );
    runtime.start().await.unwrap();
    assert!(runtime.is_running().await);

    runtime.stop().await;

    assert!(!runtime.is_running().await);
    assert_eq!(
        runtime.start().await,
        Err(MessagingError::Configuration(
            "messaging runtime was stopped".to_owned()
        ))
    );
    assert_eq!(broker.consumer_count("billing"), 0);

    let result = runtime
        .publisher()
        .broadcast(&OrderPlaced { id: 9 }, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(MessagingError::Publish { .. })));
}

#[test]
fn should_reject_duplicate_subscriptions_before_anything_runs() {
    let received = Received::default();

    let result = ConsumerConfiguration::builder("billing")
        .subscribe::<OrderPlaced, _>(recording("billing", received.clone()))
        .subscribe::<OrderPlaced, _>(recording("billing", received))
        .build();

    assert!(matches!(result, Err(MessagingError::Configuration(_))));
}
