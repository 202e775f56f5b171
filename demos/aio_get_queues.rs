use terrier::{AsyncClient, ClientConfig, ManagementOptions};
use tracing::info;

#[tokio::main]
async fn main() -> terrier::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    tracing_subscriber::fmt::init();

    let client = AsyncClient::new(ClientConfig::default());
    for queue in client.get_list_queues(&ManagementOptions::from_env()).await? {
        info!(%queue, "queue");
    }
    Ok(())
}
