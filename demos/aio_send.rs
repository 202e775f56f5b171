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

    let mut client = AsyncClient::new(ClientConfig::default().with_durable(true));
    client.connect(&ConnectionParameters::from_env()).await?;

    for (firstname, lastname) in [("John", "Doe"), ("Jane", "Roe")] {
        let person = Person {
            firstname: firstname.into(),
            lastname: lastname.into(),
        };
        info!(?person, "sending");
        client.send("test", &Json(person)).await?;
    }

    client.disconnect().await
}
