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

    let mut client = SyncClient::new(ClientConfig::default().with_durable(true));
    client.connect(&ConnectionParameters::from_env())?;

    let person = Person {
        firstname: "John".into(),
        lastname: "Doe".into(),
    };
    info!(?person, "sending");
    client.send("test", &Json(person))?;

    client.disconnect()
}
