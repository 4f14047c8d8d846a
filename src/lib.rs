#![doc = include_str!("../README.md")]

mod config;
pub mod correlation;
pub mod envelope;
pub mod process;
mod producer;
pub mod staging;
pub mod subscriber;

#[doc(inline)]
pub use config::ProducerConfig;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use correlation::{CorrelationError, CorrelationErrorKind, ListenerOutcome, ResponseListener};

#[doc(inline)]
pub use process::{CommandLauncher, ExitStatus, ProcessLauncher};

#[doc(inline)]
pub use producer::{
    Completion, CompletionCallback, DefaultProducerHook, Producer, ProducerHook, Publication,
    PublishError, PublishErrorKind, PublishRequest, ResponseHandler,
};

#[doc(inline)]
pub use subscriber::{Kafkacat, Record, Subscribe, SubscribeError, SubscribeOptions};
