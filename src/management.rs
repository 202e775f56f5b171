//! Read-only access to the RabbitMQ management HTTP API.
//!
//! This is independent from the AMQP connection: it only shares the client's
//! configuration surface.

use crate::{Error, Result};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagementOptions {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// `None` lists the queues of every virtual host.
    pub virtual_host: Option<String>,
}

impl Default for ManagementOptions {
    fn default() -> Self {
        Self {
            user: "guest".into(),
            password: "guest".into(),
            host: "localhost".into(),
            port: 15672,
            virtual_host: None,
        }
    }
}

impl ManagementOptions {
    /// Defaults overridden by `AMQP_HOST`, `AMQP_USER` and `AMQP_PASSWORD`,
    /// the same variables [`ConnectionParameters::from_env`] reads.
    ///
    /// [`ConnectionParameters::from_env`]: crate::ConnectionParameters::from_env
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(host) = std::env::var("AMQP_HOST") {
            options.host = host;
        }
        if let Ok(user) = std::env::var("AMQP_USER") {
            options.user = user;
        }
        if let Ok(password) = std::env::var("AMQP_PASSWORD") {
            options.password = password;
        }
        options
    }

    pub fn queues_url(&self) -> String {
        let virtual_host = self
            .virtual_host
            .as_deref()
            .map(|vhost| utf8_percent_encode(vhost, NON_ALPHANUMERIC).to_string())
            .unwrap_or_default();
        format!(
            "http://{}:{}/api/queues/{}",
            self.host, self.port, virtual_host
        )
    }
}

#[derive(Deserialize)]
struct QueueSummary {
    name: String,
}

/// Names of the queues the broker reports, in the order it reports them.
pub async fn list_queues(options: &ManagementOptions) -> Result<Vec<String>> {
    let url = options.queues_url();
    debug!(%url, "listing queues");
    let body = reqwest::Client::new()
        .get(&url)
        .basic_auth(&options.user, Some(&options.password))
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    parse_queue_names(&body)
}

fn parse_queue_names(body: &[u8]) -> Result<Vec<String>> {
    let queues: Vec<QueueSummary> =
        serde_json::from_slice(body).map_err(|e| Error::InvalidResponse(e.to_string()))?;
    Ok(queues.into_iter().map(|queue| queue.name).collect())
}
