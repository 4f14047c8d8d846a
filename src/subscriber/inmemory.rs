use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::subscriber::{Record, RecordStream, Subscribe, SubscribeError, Subscription};

/// In-memory subscription backend for tests or local pipelines.
///
/// Records are appended to per-topic logs with [`InMemorySubscriber::append`]
/// and delivered to subscriptions starting at their requested offset, so a
/// subscriber sees records appended both before and after it subscribed.
///
/// Consumer groups are not modelled; every subscription reads independently.
#[derive(Clone)]
pub struct InMemorySubscriber {
    state: Arc<Mutex<State>>,
    live: broadcast::Sender<Record>,
}

#[derive(Default)]
struct State {
    logs: HashMap<String, Vec<String>>,
    subscriptions: Vec<Subscription>,
}

impl InMemorySubscriber {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            state: Arc::default(),
            live,
        }
    }

    /// Append `payload` to `topic` and return its offset.
    pub async fn append(&self, topic: &str, payload: impl Into<String>) -> i64 {
        let payload = payload.into();
        let mut state = self.state.lock().await;
        let log = state.logs.entry(topic.to_owned()).or_default();
        log.push(payload.clone());
        let offset = (log.len() - 1) as i64;

        // Sent under the lock so subscribers never miss or repeat a record
        let _ = self.live.send(Record {
            topic: topic.to_owned(),
            offset: Some(offset),
            payload,
        });

        offset
    }

    /// Return every subscription requested so far, oldest first.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().await.subscriptions.clone()
    }
}

impl Default for InMemorySubscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Subscribe for InMemorySubscriber {
    #[tracing::instrument(skip(self, cancel))]
    async fn subscribe(
        &self,
        subscription: Subscription,
        cancel: CancellationToken,
    ) -> Result<RecordStream, SubscribeError> {
        let (backlog, mut live) = {
            let mut state = self.state.lock().await;
            state.subscriptions.push(subscription.clone());

            let start = subscription.options.offset.max(0) as usize;
            let backlog: Vec<Record> = state
                .logs
                .get(&subscription.topic)
                .map(|log| {
                    log.iter()
                        .enumerate()
                        .skip(start)
                        .map(|(offset, payload)| Record {
                            topic: subscription.topic.clone(),
                            offset: Some(offset as i64),
                            payload: payload.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            (backlog, self.live.subscribe())
        };

        let Subscription { topic, options, .. } = subscription;
        let mut next_offset = backlog
            .last()
            .and_then(|record| record.offset)
            .map_or(options.offset.max(0), |offset| offset + 1);

        let stream = async_stream::stream! {
            let mut done = false;
            for record in backlog {
                yield Ok(record);
                if options.exit {
                    done = true;
                    break;
                }
            }

            while !done {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = live.recv() => received,
                };

                match received {
                    Ok(record) if record.topic == topic && record.offset >= Some(next_offset) => {
                        next_offset = record.offset.map_or(next_offset, |offset| offset + 1);
                        yield Ok(record);
                        if options.exit {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%topic, skipped, "In-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::subscriber::SubscribeOptions;

    fn subscription(offset: i64, exit: bool) -> Subscription {
        Subscription {
            topic: "replies".to_owned(),
            brokers: "memory".to_owned(),
            options: SubscribeOptions {
                group: false,
                offset,
                exit,
            },
        }
    }

    #[tokio::test]
    async fn replays_backlog_from_offset() {
        let broker = InMemorySubscriber::new();
        broker.append("replies", "created").await;
        broker.append("replies", "reply").await;

        let mut stream = broker
            .subscribe(subscription(1, true), CancellationToken::new())
            .await
            .unwrap();

        let record = stream.next().await.unwrap().unwrap();
        assert_eq!(record.offset, Some(1));
        assert_eq!(record.payload, "reply");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn delivers_records_appended_after_subscribing() {
        let broker = InMemorySubscriber::new();
        broker.append("replies", "created").await;

        let mut stream = broker
            .subscribe(subscription(1, false), CancellationToken::new())
            .await
            .unwrap();

        broker.append("other", "ignored").await;
        broker.append("replies", "first").await;
        broker.append("replies", "second").await;

        assert_eq!(stream.next().await.unwrap().unwrap().payload, "first");
        assert_eq!(stream.next().await.unwrap().unwrap().payload, "second");
        assert_eq!(broker.subscriptions().await, vec![subscription(1, false)]);
    }

    #[tokio::test]
    async fn cancellation_ends_live_stream() {
        let broker = InMemorySubscriber::new();
        let cancel = CancellationToken::new();
        let mut stream = broker
            .subscribe(subscription(0, true), cancel.clone())
            .await
            .unwrap();

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
