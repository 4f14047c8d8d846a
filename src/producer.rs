//! Publish operation.
//!
//! This module implements publishing an [`Envelope`] through the external
//! publisher:
//!
//! - Serializes the envelope into a staging file
//! - Launches the publisher with the staging file and target topic
//! - Supervises the publisher until it exits, logging its output
//! - Removes the staging file and reports the exit status
//!
//! When a response handler is supplied, the correlation layer provisions the
//! response topic before the request itself is staged (see
//! [`Producer::await_response`]).

use std::{
    future::Future,
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    Envelope, ProducerConfig,
    correlation::{CorrelationError, ResponseListener},
    process::{ExitStatus, ProcessEvent, ProcessHandle, ProcessLauncher},
    staging::{StagingFile, staging_path},
    subscriber::{Record, Subscribe},
};

/// Callback invoked with the single reply to a request.
pub type ResponseHandler = Box<dyn FnOnce(Record) + Send + 'static>;

/// Callback invoked with the publisher exit status.
pub type CompletionCallback = Box<dyn FnOnce(ExitStatus) + Send + 'static>;

/// A publish request.
///
/// ```rust
/// use elytron::PublishRequest;
///
/// let request = PublishRequest::new("orders", serde_json::json!({ "sku": "A1" }))
///     .with_response_handler(|reply| println!("reply: {}", reply.payload))
///     .on_complete(|status| println!("published with code {status}"))
///     .with_brokers("kafka-1:9092,kafka-2:9092");
/// ```
pub struct PublishRequest {
    pub topic: String,
    pub message: serde_json::Value,
    pub response_handler: Option<ResponseHandler>,
    pub on_complete: Option<CompletionCallback>,
    /// Broker list overriding [`ProducerConfig::brokers`] for this publish.
    pub brokers: Option<String>,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, message: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            message,
            response_handler: None,
            on_complete: None,
            brokers: None,
        }
    }

    /// Expect a reply, delivered once to `handler`.
    pub fn with_response_handler<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Record) + Send + 'static,
    {
        self.response_handler = Some(Box::new(handler));
        self
    }

    /// Be notified of the publisher exit status.
    ///
    /// Registering a callback also makes errors reported by the publisher
    /// non-fatal: they are logged and the callback still fires.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(ExitStatus) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn with_brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }
}

impl std::fmt::Debug for PublishRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishRequest")
            .field("topic", &self.topic)
            .field("message", &self.message)
            .field("response_handler", &self.response_handler.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("brokers", &self.brokers)
            .finish()
    }
}

/// Result of a publish.
///
/// Returned as soon as the publisher is running. The publish itself finishes
/// in the background; await [`Publication::completion`] to observe it.
#[derive(Debug)]
pub struct Publication {
    /// The envelope that was staged.
    pub envelope: Envelope,
    /// Listener for the reply, when a response handler was supplied.
    pub response: Option<ResponseListener>,
    /// Completion of the publisher.
    pub completion: Completion,
}

/// Completion of a running publisher.
#[derive(Debug)]
pub struct Completion(JoinHandle<Result<ExitStatus, PublishError>>);

impl Completion {
    /// Wait for the publisher to exit and its staging file to be removed.
    ///
    /// A non-zero exit status is not an error: it is returned for the caller
    /// to act on.
    pub async fn wait(self) -> Result<ExitStatus, PublishError> {
        self.0.await.map_err(PublishError::aborted)?
    }
}

/// Publisher of envelopes through an external process.
///
/// Generic parameters:
/// - `L`: Process launcher running the publisher
/// - `S`: Subscription backend used to await replies
/// - `HK`: Hook implementation for lifecycle events
pub struct Producer<L, S, HK = DefaultProducerHook> {
    pub(crate) config: Arc<ProducerConfig>,
    pub(crate) launcher: Arc<L>,
    pub(crate) subscriber: Arc<S>,
    pub(crate) hook: Arc<HK>,
}

impl<L, S, HK> Clone for Producer<L, S, HK> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            launcher: Arc::clone(&self.launcher),
            subscriber: Arc::clone(&self.subscriber),
            hook: Arc::clone(&self.hook),
        }
    }
}

impl<L, S> Producer<L, S, DefaultProducerHook>
where
    L: ProcessLauncher + 'static,
    S: Subscribe + 'static,
{
    /// Create a new producer with the default hook implementation.
    pub fn new(config: ProducerConfig, launcher: L, subscriber: S) -> Self {
        Self {
            config: Arc::new(config),
            launcher: Arc::new(launcher),
            subscriber: Arc::new(subscriber),
            hook: Arc::new(DefaultProducerHook),
        }
    }
}

impl<L, S, HK> Producer<L, S, HK>
where
    L: ProcessLauncher + 'static,
    S: Subscribe + 'static,
    HK: ProducerHook + 'static,
{
    /// Replace the producer hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ProducerHook>(self, hook: HK2) -> Producer<L, S, HK2> {
        Producer {
            config: self.config,
            launcher: self.launcher,
            subscriber: self.subscriber,
            hook: Arc::new(hook),
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Publish a message.
    ///
    /// In order:
    /// - Provisions a response topic, when a response handler is given
    /// - Writes the envelope to its staging file
    /// - Launches the publisher on that file
    ///
    /// Returns once the publisher runs. An empty topic fails before any I/O;
    /// a staging write failure fails before any process is launched.
    #[tracing::instrument(skip(self, request), fields(topic = %request.topic))]
    pub async fn publish(&self, request: PublishRequest) -> Result<Publication, PublishError> {
        let PublishRequest {
            topic,
            message,
            response_handler,
            on_complete,
            brokers,
        } = request;

        if topic.is_empty() {
            return Err(PublishError::usage("A topic argument is required"));
        }

        let brokers = brokers.unwrap_or_else(|| self.config.brokers.clone());
        let mut envelope = Envelope::new(message);

        let response = match response_handler {
            Some(handler) => {
                let listener = self
                    .await_response(&topic, &envelope.id, handler, &brokers)
                    .await
                    .map_err(PublishError::correlation)?;
                self.hook.on_awaiting_response(listener.topic());
                envelope.response_topic = Some(listener.topic().to_owned());
                Some(listener)
            }
            None => None,
        };

        let completion = match self.dispatch(&topic, &envelope, &brokers, on_complete).await {
            Ok(completion) => completion,
            Err(err) => {
                // No request went out, so no reply can arrive
                if let Some(listener) = &response {
                    listener.cancel();
                }
                return Err(err);
            }
        };

        Ok(Publication {
            envelope,
            response,
            completion,
        })
    }

    /// Stage `envelope` and launch the publisher for it.
    pub(crate) async fn dispatch(
        &self,
        topic: &str,
        envelope: &Envelope,
        brokers: &str,
        on_complete: Option<CompletionCallback>,
    ) -> Result<Completion, PublishError> {
        let payload = envelope.to_json().map_err(PublishError::serialize)?;
        self.hook.on_producing(topic, &payload);

        let path = staging_path(
            &self.config.tmp_dir,
            &self.config.prefix,
            topic,
            &envelope.id,
        );
        let staged = StagingFile::write(path, payload.as_bytes())
            .await
            .map_err(PublishError::staging)?;
        self.hook.on_staged(staged.path());

        let args = publish_args(brokers, topic, staged.path());
        let process = match self.launcher.launch(&self.config.executable, &args).await {
            Ok(process) => process,
            Err(err) => {
                // Nobody will read the file
                staged.remove().await.map_err(PublishError::staging)?;
                return Err(PublishError::launch(err));
            }
        };

        let handle = tokio::spawn(supervise(
            process,
            staged,
            on_complete,
            Arc::clone(&self.hook),
        ));

        Ok(Completion(handle))
    }
}

/// Arguments publishing the contents of `file` to `topic`.
fn publish_args(brokers: &str, topic: &str, file: &Path) -> Vec<String> {
    vec![
        "-P".to_owned(),
        "-T".to_owned(),
        "-b".to_owned(),
        brokers.to_owned(),
        "-t".to_owned(),
        topic.to_owned(),
        file.to_string_lossy().into_owned(),
    ]
}

/// Drive a publisher to termination, then clean up after it.
///
/// Diagnostic output is fatal only when no completion callback is
/// registered. The staging file is removed whatever the outcome and the
/// callback fires exactly once, before a removal failure is reported.
async fn supervise<HK: ProducerHook>(
    mut process: ProcessHandle,
    staged: StagingFile,
    on_complete: Option<CompletionCallback>,
    hook: Arc<HK>,
) -> Result<ExitStatus, PublishError> {
    let fatal = on_complete.is_none();
    let mut publisher_error = None;

    let status = loop {
        match process.next_event().await {
            Some(ProcessEvent::Stdout(data)) => hook.on_publisher_output(&data),
            Some(ProcessEvent::Stderr(data)) => {
                hook.on_publisher_error(&data, fatal);
                if fatal && publisher_error.is_none() {
                    publisher_error = Some(data);
                }
            }
            Some(ProcessEvent::Exited(status)) => break status,
            None => break ExitStatus::unknown(),
        }
    };
    hook.on_publisher_exit(status);

    let path = staged.path().to_owned();
    let removed = staged.remove().await;

    if let Some(callback) = on_complete {
        callback(status);
    }

    removed.map_err(PublishError::staging)?;
    hook.on_staging_removed(&path);

    match publisher_error {
        Some(data) => Err(PublishError::publisher(data)),
        None => Ok(status),
    }
}

/// Tower `Service` implementation for `Producer`.
///
/// Lets publishes be composed with middleware such as timeouts or
/// concurrency limits.
impl<L, S, HK> Service<PublishRequest> for Producer<L, S, HK>
where
    L: ProcessLauncher + 'static,
    S: Subscribe + 'static,
    HK: ProducerHook + 'static,
{
    type Response = Publication;
    type Error = PublishError;
    type Future = Pin<Box<dyn Future<Output = Result<Publication, PublishError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: PublishRequest) -> Self::Future {
        let producer = self.clone();
        Box::pin(async move { producer.publish(req).await })
    }
}

/// Error returned when a publish fails.
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Classification of publish errors.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The request was invalid; nothing was written or launched.
    Usage(&'static str),
    /// The envelope could not be serialized.
    Serialize(serde_json::Error),
    /// The staging file could not be written or removed.
    Staging(std::io::Error),
    /// The publisher could not be launched.
    Launch(std::io::Error),
    /// The publisher reported an error and no completion callback was
    /// registered to observe it.
    Publisher(String),
    /// The response topic could not be provisioned.
    Correlation(Box<CorrelationError>),
    /// The task supervising the publisher was aborted.
    Aborted(JoinError),
}

impl PublishError {
    fn new(kind: PublishErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn usage(reason: &'static str) -> Self {
        Self::new(PublishErrorKind::Usage(reason))
    }

    fn serialize(err: serde_json::Error) -> Self {
        Self::new(PublishErrorKind::Serialize(err))
    }

    fn staging(err: std::io::Error) -> Self {
        Self::new(PublishErrorKind::Staging(err))
    }

    fn launch(err: std::io::Error) -> Self {
        Self::new(PublishErrorKind::Launch(err))
    }

    fn publisher(data: String) -> Self {
        Self::new(PublishErrorKind::Publisher(data))
    }

    fn correlation(err: CorrelationError) -> Self {
        Self::new(PublishErrorKind::Correlation(Box::new(err)))
    }

    fn aborted(err: JoinError) -> Self {
        Self::new(PublishErrorKind::Aborted(err))
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::Usage(reason) => writeln!(f, "Usage error: {reason}"),
            PublishErrorKind::Serialize(err) => writeln!(f, "Serde error: {err}"),
            PublishErrorKind::Staging(err) => writeln!(f, "Staging file error: {err}"),
            PublishErrorKind::Launch(err) => writeln!(f, "Producer launch error: {err}"),
            PublishErrorKind::Publisher(data) => writeln!(f, "Producer logged an error: {data}"),
            PublishErrorKind::Correlation(err) => writeln!(f, "Correlation error: {err}"),
            PublishErrorKind::Aborted(err) => writeln!(f, "Producer task aborted: {err}"),
        }?;
        std::fmt::Display::fmt(&self.context, f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::Usage(_) | PublishErrorKind::Publisher(_) => None,
            PublishErrorKind::Serialize(err) => Some(err),
            PublishErrorKind::Staging(err) => Some(err),
            PublishErrorKind::Launch(err) => Some(err),
            PublishErrorKind::Correlation(err) => Some(err.as_ref()),
            PublishErrorKind::Aborted(err) => Some(err),
        }
    }
}

/// Hook trait for observing publish lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait ProducerHook: Send + Sync {
    fn on_producing(&self, topic: &str, payload: &str);
    fn on_staged(&self, path: &Path);
    fn on_awaiting_response(&self, response_topic: &str);
    fn on_publisher_output(&self, data: &str);
    /// `fatal` is set when no completion callback will observe the error.
    fn on_publisher_error(&self, data: &str, fatal: bool);
    fn on_publisher_exit(&self, status: ExitStatus);
    fn on_staging_removed(&self, path: &Path);
}

/// Default producer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultProducerHook;

impl ProducerHook for DefaultProducerHook {
    fn on_producing(&self, topic: &str, payload: &str) {
        tracing::info!(%topic, %payload, "Producing message");
    }

    fn on_staged(&self, path: &Path) {
        tracing::debug!(?path, "Staging file written");
    }

    fn on_awaiting_response(&self, response_topic: &str) {
        tracing::info!(%response_topic, "Awaiting response");
    }

    fn on_publisher_output(&self, data: &str) {
        tracing::info!(%data, "Producer logged some data");
    }

    fn on_publisher_error(&self, data: &str, fatal: bool) {
        tracing::error!(%data, fatal, "Producer logged an error");
    }

    fn on_publisher_exit(&self, status: ExitStatus) {
        if status.success() {
            tracing::info!(%status, "Producer exited");
        } else {
            tracing::error!(%status, "Producer exited with non-zero status");
        }
    }

    fn on_staging_removed(&self, path: &Path) {
        tracing::debug!(?path, "Staging file removed");
    }
}
