use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    ProducerConfig,
    process::{ProcessEvent, ProcessLauncher},
    subscriber::{Record, RecordStream, Subscribe, SubscribeError, Subscription},
};

/// Subscription backend running a kafkacat consumer.
///
/// The consumer is started through a [`ProcessLauncher`], so tests can swap
/// in a fake process exactly as they do for publishing. Records are read in
/// kafkacat's JSON envelope (`-J`), one object per line, so payloads may
/// span several lines. Diagnostic output is logged.
///
/// ## Mapping
///
/// - `options.group` → `-G <group> <topic>` (balanced consumer), otherwise
///   `-C -t <topic> -o <offset>`
/// - `options.exit` → `-c 1`
/// - `brokers` → `-b <brokers>`
#[derive(Clone)]
pub struct Kafkacat<L> {
    launcher: L,
    executable: String,
    group: String,
}

impl<L> Kafkacat<L> {
    /// Create a subscriber using the executable and group from `config`.
    pub fn new(launcher: L, config: &ProducerConfig) -> Self {
        Self {
            launcher,
            executable: config.executable.clone(),
            group: config.group.clone(),
        }
    }

    fn args(&self, subscription: &Subscription) -> Vec<String> {
        let options = subscription.options;
        let mut args = vec!["-b".to_owned(), subscription.brokers.clone()];

        if options.group {
            args.extend(["-G".to_owned(), self.group.clone()]);
        } else {
            args.extend([
                "-C".to_owned(),
                "-t".to_owned(),
                subscription.topic.clone(),
                "-o".to_owned(),
                options.offset.to_string(),
            ]);
        }

        if options.exit {
            args.extend(["-c".to_owned(), "1".to_owned()]);
        }

        args.extend(["-u".to_owned(), "-J".to_owned()]);

        if options.group {
            args.push(subscription.topic.clone());
        }

        args
    }
}

#[async_trait::async_trait]
impl<L> Subscribe for Kafkacat<L>
where
    L: ProcessLauncher,
{
    #[tracing::instrument(skip(self, cancel))]
    async fn subscribe(
        &self,
        subscription: Subscription,
        cancel: CancellationToken,
    ) -> Result<RecordStream, SubscribeError> {
        let args = self.args(&subscription);
        let mut process = self
            .launcher
            .launch(&self.executable, &args)
            .await
            .map_err(SubscribeError::launch)?;

        let Subscription { topic, options, .. } = subscription;

        let stream = async_stream::stream! {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => None,
                    event = process.next_event() => event,
                };

                match event {
                    Some(ProcessEvent::Stdout(line)) => {
                        let record = parse_record(&topic, &line);
                        let delivered = record.is_ok();
                        yield record;
                        if delivered && options.exit {
                            break;
                        }
                    }
                    Some(ProcessEvent::Stderr(line)) => {
                        tracing::warn!(%topic, %line, "Consumer logged an error");
                    }
                    Some(ProcessEvent::Exited(status)) => {
                        if !status.success() {
                            yield Err(SubscribeError::exited(status));
                        }
                        break;
                    }
                    None => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// A message as printed by `kafkacat -J`.
#[derive(Deserialize)]
struct Message {
    offset: Option<i64>,
    payload: Option<String>,
}

fn parse_record(topic: &str, line: &str) -> Result<Record, SubscribeError> {
    let message: Message =
        serde_json::from_str(line).map_err(|err| SubscribeError::backend(Box::new(err)))?;

    Ok(Record {
        topic: topic.to_owned(),
        offset: message.offset,
        payload: message.payload.unwrap_or_default(),
    })
}
