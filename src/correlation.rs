//! Request/response correlation.
//!
//! A request expecting a reply gets its own response topic, derived from the
//! request topic and id (see [`response_topic`]). Before the request is
//! published:
//!
//! 1. A throwaway record (null message) is published to the response topic
//!    so the topic exists before anyone subscribes to it
//! 2. Once that publish completes, a one-shot listener subscribes from
//!    offset 1, skipping the creation record, outside any consumer group
//! 3. The listener hands the first record to the response handler and stops
//!
//! At most one reply is consumed per request. The listener has no timeout;
//! callers needing a bounded wait cancel it through its
//! [`CancellationToken`].

use tokio::task::{JoinError, JoinHandle};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::response_topic,
    process::ProcessLauncher,
    producer::{Completion, Producer, ProducerHook, PublishError, ResponseHandler},
    subscriber::{Subscribe, SubscribeError, SubscribeOptions, Subscription},
};

/// Subscription parameters of a response listener.
pub const RESPONSE_SUBSCRIPTION: SubscribeOptions = SubscribeOptions {
    group: false,
    // Offset 0 holds the record that created the topic
    offset: 1,
    exit: true,
};

/// How a response listener finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// A reply was received and handed to the response handler.
    Received,
    /// The listener was cancelled before a reply arrived.
    Cancelled,
    /// The subscription ended without delivering a reply.
    Closed,
}

/// One-shot listener for the reply to a request.
#[derive(Debug)]
pub struct ResponseListener {
    topic: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<ListenerOutcome, CorrelationError>>,
}

impl ResponseListener {
    /// Name of the response topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop waiting for the reply.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling the listener, e.g. from a timeout task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the listener to finish.
    pub async fn wait(self) -> Result<ListenerOutcome, CorrelationError> {
        self.task.await.map_err(CorrelationError::aborted)?
    }
}

impl<L, S, HK> Producer<L, S, HK>
where
    L: ProcessLauncher + 'static,
    S: Subscribe + 'static,
    HK: ProducerHook + 'static,
{
    /// Provision the response topic for request `id` on `topic` and attach
    /// `handler` to it.
    ///
    /// Returns once the topic-creating publish is running; subscribing
    /// happens in the background after it completes.
    #[tracing::instrument(skip(self, handler))]
    pub async fn await_response(
        &self,
        topic: &str,
        id: &uuid::Uuid,
        handler: ResponseHandler,
        brokers: &str,
    ) -> Result<ResponseListener, CorrelationError> {
        let response_topic = response_topic(topic, id);

        let creation = self
            .dispatch(
                &response_topic,
                &Envelope::new(serde_json::Value::Null),
                brokers,
                None,
            )
            .await
            .map_err(CorrelationError::provision)?;

        let subscription = Subscription {
            topic: response_topic.clone(),
            brokers: brokers.to_owned(),
            options: RESPONSE_SUBSCRIPTION,
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(
            creation,
            std::sync::Arc::clone(&self.subscriber),
            subscription,
            handler,
            cancel.clone(),
        ));

        Ok(ResponseListener {
            topic: response_topic,
            cancel,
            task,
        })
    }
}

async fn listen<S: Subscribe>(
    creation: Completion,
    subscriber: std::sync::Arc<S>,
    subscription: Subscription,
    handler: ResponseHandler,
    cancel: CancellationToken,
) -> Result<ListenerOutcome, CorrelationError> {
    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(ListenerOutcome::Cancelled),
        status = creation.wait() => status.map_err(CorrelationError::provision)?,
    };
    if !status.success() {
        tracing::warn!(
            topic = %subscription.topic,
            %status,
            "Response topic creation exited with non-zero status"
        );
    }

    let topic = subscription.topic.clone();
    let mut records = subscriber
        .subscribe(subscription, cancel.clone())
        .await
        .map_err(CorrelationError::subscribe)?;

    let next = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(ListenerOutcome::Cancelled),
        next = records.next() => next,
    };

    match next {
        Some(Ok(record)) => {
            tracing::info!(%topic, offset = ?record.offset, "Response received");
            handler(record);
            Ok(ListenerOutcome::Received)
        }
        Some(Err(err)) => Err(CorrelationError::subscribe(err)),
        None => Ok(ListenerOutcome::Closed),
    }
}

/// Error returned by the correlation layer.
#[derive(Debug)]
pub struct CorrelationError {
    context: SpanTrace,
    kind: CorrelationErrorKind,
}

/// Correlation errors kind.
#[derive(Debug)]
pub enum CorrelationErrorKind {
    /// The response topic could not be created.
    Provision(PublishError),
    /// Subscribing to the response topic failed.
    Subscribe(SubscribeError),
    /// The listener task was aborted.
    Aborted(JoinError),
}

impl CorrelationError {
    fn new(kind: CorrelationErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn provision(err: PublishError) -> Self {
        Self::new(CorrelationErrorKind::Provision(err))
    }

    fn subscribe(err: SubscribeError) -> Self {
        Self::new(CorrelationErrorKind::Subscribe(err))
    }

    fn aborted(err: JoinError) -> Self {
        Self::new(CorrelationErrorKind::Aborted(err))
    }

    pub fn kind(&self) -> &CorrelationErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CorrelationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CorrelationErrorKind::Provision(err) => writeln!(f, "Provision error: {err}"),
            CorrelationErrorKind::Subscribe(err) => writeln!(f, "Subscribe error: {err}"),
            CorrelationErrorKind::Aborted(err) => writeln!(f, "Listener aborted: {err}"),
        }?;
        std::fmt::Display::fmt(&self.context, f)
    }
}

impl std::error::Error for CorrelationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CorrelationErrorKind::Provision(err) => Some(err),
            CorrelationErrorKind::Subscribe(err) => Some(err),
            CorrelationErrorKind::Aborted(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::{
        ProducerConfig, PublishRequest,
        process::{ExitStatus, ProcessEvent, RecordingLauncher},
        subscriber::{InMemorySubscriber, Record},
    };

    fn producer(
        dir: &std::path::Path,
        launcher: RecordingLauncher,
        broker: InMemorySubscriber,
    ) -> Producer<RecordingLauncher, InMemorySubscriber> {
        let config = ProducerConfig::default()
            .with_executable("kafkacat")
            .with_tmp_dir(dir)
            .with_brokers("localhost:9092");
        Producer::new(config, launcher, broker)
    }

    fn collecting_handler() -> (Arc<Mutex<Vec<Record>>>, impl FnOnce(Record) + Send + 'static) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        (received, move |record| sink.lock().unwrap().push(record))
    }

    #[tokio::test]
    async fn response_topic_is_provisioned_before_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RecordingLauncher::new();
        let producer = producer(dir.path(), launcher.clone(), InMemorySubscriber::new());
        let (_, handler) = collecting_handler();

        let publication = producer
            .publish(
                PublishRequest::new("orders", json!({ "sku": "A1" }))
                    .with_response_handler(handler),
            )
            .await
            .unwrap();

        let id = publication.envelope.id;
        let expected = format!("response.orders.{id}");
        assert_eq!(publication.envelope.response_topic.as_deref(), Some(expected.as_str()));
        assert_eq!(publication.response.as_ref().unwrap().topic(), expected);

        let launches = launcher.launches().await;
        assert_eq!(launches.len(), 2);

        assert_eq!(launches[0].arg("-t"), Some(expected.as_str()));
        let creation: serde_json::Value =
            serde_json::from_str(launches[0].staged.as_deref().unwrap()).unwrap();
        assert_eq!(creation["message"], json!(null));
        assert!(creation.get("response_topic").is_none());

        assert_eq!(launches[1].arg("-t"), Some("orders"));
        let request: serde_json::Value =
            serde_json::from_str(launches[1].staged.as_deref().unwrap()).unwrap();
        assert_eq!(request["response_topic"], json!(expected));
        assert_eq!(request["message"], json!({ "sku": "A1" }));

        publication.completion.wait().await.unwrap();
        publication.response.unwrap().cancel();
    }

    #[tokio::test]
    async fn listener_consumes_exactly_one_reply() {
        let dir = tempfile::tempdir().unwrap();
        let broker = InMemorySubscriber::new();
        let producer = producer(dir.path(), RecordingLauncher::new(), broker.clone());
        let (received, handler) = collecting_handler();

        let publication = producer
            .publish(PublishRequest::new("orders", json!(1)).with_response_handler(handler))
            .await
            .unwrap();
        let listener = publication.response.unwrap();

        broker.append(listener.topic(), "created").await;
        broker.append(listener.topic(), "first reply").await;
        broker.append(listener.topic(), "second reply").await;

        let topic = listener.topic().to_owned();
        assert_eq!(listener.wait().await.unwrap(), ListenerOutcome::Received);

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, "first reply");
        assert_eq!(received[0].offset, Some(1));

        assert_eq!(
            broker.subscriptions().await,
            vec![Subscription {
                topic,
                brokers: "localhost:9092".to_owned(),
                options: RESPONSE_SUBSCRIPTION,
            }]
        );
    }

    #[tokio::test]
    async fn cancelled_listener_never_calls_handler() {
        let dir = tempfile::tempdir().unwrap();
        let producer = producer(
            dir.path(),
            RecordingLauncher::new(),
            InMemorySubscriber::new(),
        );
        let (received, handler) = collecting_handler();

        let publication = producer
            .publish(PublishRequest::new("orders", json!(1)).with_response_handler(handler))
            .await
            .unwrap();
        let listener = publication.response.unwrap();

        listener.cancellation_token().cancel();

        assert_eq!(listener.wait().await.unwrap(), ListenerOutcome::Cancelled);
        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_topic_creation_fails_the_listener() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RecordingLauncher::scripted(|launch| {
            if launch.arg("-t").is_some_and(|topic| topic.starts_with("response.")) {
                vec![
                    ProcessEvent::Stderr("topic authorization failed".into()),
                    ProcessEvent::Exited(ExitStatus::from_code(1)),
                ]
            } else {
                vec![ProcessEvent::Exited(ExitStatus::from_code(0))]
            }
        });
        let broker = InMemorySubscriber::new();
        let producer = producer(dir.path(), launcher, broker.clone());
        let (_, handler) = collecting_handler();

        let publication = producer
            .publish(PublishRequest::new("orders", json!(1)).with_response_handler(handler))
            .await
            .unwrap();

        assert!(publication.completion.wait().await.unwrap().success());

        let err = publication.response.unwrap().wait().await.unwrap_err();
        assert!(matches!(err.kind(), CorrelationErrorKind::Provision(_)));
        assert!(broker.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn await_response_uses_given_brokers() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RecordingLauncher::new();
        let broker = InMemorySubscriber::new();
        let producer = producer(dir.path(), launcher.clone(), broker.clone());
        let id = uuid::Uuid::new_v4();
        let (_, handler) = collecting_handler();

        let listener = producer
            .await_response("orders", &id, Box::new(handler), "kafka-1:9092")
            .await
            .unwrap();

        assert_eq!(listener.topic(), response_topic("orders", &id));
        assert_eq!(launcher.launches().await[0].arg("-b"), Some("kafka-1:9092"));

        broker.append(listener.topic(), "created").await;
        broker.append(listener.topic(), "reply").await;
        assert_eq!(listener.wait().await.unwrap(), ListenerOutcome::Received);
        assert_eq!(broker.subscriptions().await[0].brokers, "kafka-1:9092");
    }
}
