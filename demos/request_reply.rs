use std::time::Duration;

use elytron::{
    CommandLauncher, Kafkacat, ListenerOutcome, Producer, ProducerConfig, PublishRequest,
};
use serde::{Deserialize, Serialize};
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Order {
    sku: String,
    quantity: u32,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = ProducerConfig::default();
    let subscriber = Kafkacat::new(CommandLauncher::new(), &config);
    let producer = Producer::new(config, CommandLauncher::new(), subscriber);

    let order = Order {
        sku: "A1".to_owned(),
        quantity: 2,
    };
    let request = PublishRequest::new("orders", serde_json::to_value(&order).unwrap())
        .with_response_handler(|reply| tracing::info!(payload = %reply.payload, "Got reply"))
        .on_complete(|status| tracing::info!(%status, "Request published"));

    let publication = producer.publish(request).await.unwrap();
    tracing::info!(
        id = %publication.envelope.id,
        response_topic = ?publication.envelope.response_topic,
        "Request staged"
    );

    publication.completion.wait().await.unwrap();

    let Some(listener) = publication.response else {
        return;
    };

    let cancel = listener.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
    });

    match listener.wait().await.unwrap() {
        ListenerOutcome::Received => tracing::info!("Reply handled"),
        ListenerOutcome::Cancelled => tracing::warn!("No reply within 30s"),
        ListenerOutcome::Closed => tracing::warn!("Response subscription closed"),
    }
}
