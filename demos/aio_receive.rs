use serde::{Deserialize, Serialize};
use terrier::{AsyncClient, ClientConfig, ConnectionParameters, Json};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct Person {
    firstname: String,
    lastname: String,
}

#[tokio::main]
async fn main() -> terrier::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    tracing_subscriber::fmt::init();

    let config = ClientConfig::default()
        .with_durable(true)
        .with_auto_ack(false);
    let mut client = AsyncClient::new(config);
    client.connect(&ConnectionParameters::from_env()).await?;

    let tag = client
        .receive("test", |delivery| async move {
            let Json(person) = delivery.payload::<Json<Person>>()?;
            info!(?person, delivery_tag = delivery.delivery_tag(), "received");
            delivery.ack().await
        })
        .await?;
    info!(consumer = %tag, "waiting for messages, press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;
    client.disconnect().await
}
