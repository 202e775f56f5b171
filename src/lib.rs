#![warn(rust_2018_idioms)]

//! terrier
//!
//! A small messaging layer over an AMQP 0.9.1 broker, targeting especially RabbitMQ.
//!
//! Two clients expose the same operations (connect, send, publish, receive,
//! acknowledge, delete, disconnect) with different concurrency contracts:
//!
//! * [`SyncClient`] blocks the calling thread; `receive` runs the consume loop
//!   until the callback stops it.
//! * [`AsyncClient`] runs inside tokio; `receive` registers a subscription and
//!   returns immediately.
//!
//! Both make sure the queues and exchanges they touch exist before using them,
//! see [`ResolvePolicy`]. Message bodies go through a [`Payload`] codec; use
//! [`Json`] for anything serde can handle.
//!
//! The broker is reached through the [`transport`] traits. [`AmqpConnector`]
//! implements them with lapin, [`MemoryBroker`] in-process.
//!
//! ## Feature switches
//!
//! * `native-tls`: enable amqps support through native-tls
//! * `openssl`: enable amqps support through openssl
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use terrier::{ClientConfig, ConnectionParameters, Json, Result, SyncClient};
//! use tracing::info;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Person {
//!     firstname: String,
//!     lastname: String,
//! }
//!
//! fn main() -> Result<()> {
//!     tracing_subscriber::fmt::init();
//!
//!     let mut client = SyncClient::new(ClientConfig::default().with_auto_ack(false));
//!     client.connect(&ConnectionParameters::default())?;
//!
//!     let person = Person {
//!         firstname: "John".into(),
//!         lastname: "Doe".into(),
//!     };
//!     client.send("people", &Json(person))?;
//!
//!     client.receive("people", |channel, delivery| {
//!         let Json(person) = delivery.payload::<Json<Person>>()?;
//!         info!(?person, "received");
//!         SyncClient::commit_ack(channel, &delivery.context)?;
//!         channel.stop_consuming();
//!         Ok(())
//!     })?;
//!
//!     client.disconnect()
//! }
//! ```

pub use acker::{Acker, Acknowledge};
pub use amqp::AmqpConnector;
pub use async_client::AsyncClient;
pub use channel_status::{ChannelState, ChannelStatus};
pub use configuration::{ClientConfig, ConnectionParameters};
pub use error::{Error, Result};
pub use exchange::ExchangeRef;
pub use management::{list_queues, ManagementOptions};
pub use memory::MemoryBroker;
pub use message::{Delivery, DeliveryContext, DeliveryMode, Message};
pub use payload::{Json, Payload};
pub use queue::{Queue, QueueRef};
pub use session::ConnectionState;
pub use sync_client::{ChannelHandle, SyncClient};
pub use topology::{Resolution, ResolvePolicy};
pub use transport::{BrokerChannel, BrokerConnection, Connector, Consumer};

pub use lapin;

pub mod amqp;
pub mod management;
pub mod memory;
pub mod transport;

mod acker;
mod async_client;
mod channel_status;
mod configuration;
mod error;
mod exchange;
mod id_sequence;
mod message;
mod payload;
mod queue;
mod session;
mod sync_client;
mod topology;
