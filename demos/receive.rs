use serde::{Deserialize, Serialize};
use terrier::{ClientConfig, ConnectionParameters, Json, SyncClient};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct Person {
    firstname: String,
    lastname: String,
}

fn main() -> terrier::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    tracing_subscriber::fmt::init();

    let config = ClientConfig::default()
        .with_durable(true)
        .with_auto_ack(false);
    let mut client = SyncClient::new(config);
    client.connect(&ConnectionParameters::from_env())?;

    info!("waiting for messages, press Ctrl-C to exit");
    client.receive("test", |channel, delivery| {
        let Json(person) = delivery.payload::<Json<Person>>()?;
        info!(?person, delivery_tag = delivery.delivery_tag(), "received");
        SyncClient::commit_ack(channel, &delivery.context)
    })
}
