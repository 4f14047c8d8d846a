//! Topic subscription capability.
//!
//! Consuming records is delegated to a [`Subscribe`] backend. The correlation
//! layer only needs "subscribe to a topic from an offset, optionally stopping
//! after the first record", which both backends provide:
//!
//! - [`Kafkacat`]: Runs a kafkacat consumer through a
//!   [`ProcessLauncher`](crate::process::ProcessLauncher)
//! - [`InMemorySubscriber`]: Per-topic in-memory logs for tests

mod inmemory;
mod kafkacat;

use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::process::ExitStatus;

pub use inmemory::InMemorySubscriber;
pub use kafkacat::Kafkacat;

/// A record consumed from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic the record was read from.
    pub topic: String,
    /// Offset of the record, when the backend reports it.
    pub offset: Option<i64>,
    /// Raw record payload.
    pub payload: String,
}

impl Record {
    /// Decode the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// How a subscription consumes its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Join the configured consumer group instead of reading independently.
    pub group: bool,
    /// First offset to read.
    pub offset: i64,
    /// End the subscription after the first record.
    pub exit: bool,
}

/// A subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    /// Comma separated broker list.
    pub brokers: String,
    pub options: SubscribeOptions,
}

/// Stream of records produced by a subscription.
pub type RecordStream = BoxStream<'static, Result<Record, SubscribeError>>;

/// Trait implemented by subscription backends.
///
/// The returned stream should:
/// - Yield records in offset order, starting at `options.offset`
/// - End after the first record when `options.exit` is set
/// - End when the provided [`CancellationToken`] is cancelled
#[async_trait::async_trait]
pub trait Subscribe: Send + Sync {
    async fn subscribe(
        &self,
        subscription: Subscription,
        cancel: CancellationToken,
    ) -> Result<RecordStream, SubscribeError>;
}

/// Error returned by subscription backends.
#[derive(Debug)]
pub struct SubscribeError {
    context: SpanTrace,
    kind: SubscribeErrorKind,
}

/// Subscription errors kind.
#[derive(Debug)]
pub enum SubscribeErrorKind {
    /// The consumer process could not be started.
    Launch(std::io::Error),
    /// The consumer process terminated unsuccessfully.
    Exited(ExitStatus),
    /// Errors originating from the backend.
    Backend(tower::BoxError),
}

impl SubscribeError {
    pub fn launch(err: std::io::Error) -> Self {
        Self::new(SubscribeErrorKind::Launch(err))
    }

    pub fn exited(status: ExitStatus) -> Self {
        Self::new(SubscribeErrorKind::Exited(status))
    }

    pub fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::new(SubscribeErrorKind::Backend(err))
    }

    fn new(kind: SubscribeErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &SubscribeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SubscribeErrorKind::Launch(err) => writeln!(f, "Consumer launch error: {err}"),
            SubscribeErrorKind::Exited(status) => {
                writeln!(f, "Consumer exited with code: {status}")
            }
            SubscribeErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
        }?;
        std::fmt::Display::fmt(&self.context, f)
    }
}

impl std::error::Error for SubscribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SubscribeErrorKind::Launch(err) => Some(err),
            SubscribeErrorKind::Exited(_) => None,
            SubscribeErrorKind::Backend(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_payload_decodes_as_json() {
        let record = Record {
            topic: "response.orders.1".to_owned(),
            offset: Some(1),
            payload: r#"{"status":"accepted"}"#.to_owned(),
        };

        let value: serde_json::Value = record.json().unwrap();
        assert_eq!(value["status"], "accepted");
        assert!(
            Record {
                payload: "not json".to_owned(),
                ..record
            }
            .json::<serde_json::Value>()
            .is_err()
        );
    }
}
