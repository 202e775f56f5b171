//! [`transport`](crate::transport) implementation on top of lapin.

use crate::{
    acker::{Acker, Acknowledge},
    channel_status::ChannelState,
    configuration::ConnectionParameters,
    exchange::ExchangeRef,
    message::{Delivery, DeliveryContext, DeliveryMode, Message},
    queue::{Queue, QueueRef},
    transport::{BrokerChannel, BrokerConnection, Connector, Consumer},
    Result,
};
use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties, ConnectionProperties, ExchangeKind,
};
use std::fmt;
use tracing::{debug, trace};

/// Which executor and reactor lapin runs its connection on.
#[derive(Clone, Default)]
enum Runtime {
    /// lapin's own default (async-global-executor).
    #[default]
    Default,
    /// The tokio runtime current at connection time.
    Tokio,
    Custom(ConnectionProperties),
}

/// Connects through lapin.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    runtime: Runtime,
}

impl AmqpConnector {
    /// Run the connection on the tokio runtime that calls
    /// [`connect`](Connector::connect).
    pub fn tokio() -> Self {
        Self {
            runtime: Runtime::Tokio,
        }
    }

    /// Use caller-built properties, typically carrying a custom executor and
    /// reactor.
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self {
            runtime: Runtime::Custom(properties),
        }
    }

    fn properties(&self) -> ConnectionProperties {
        let properties = match &self.runtime {
            Runtime::Default => ConnectionProperties::default(),
            Runtime::Tokio => ConnectionProperties::default()
                .with_executor(tokio_executor_trait::Tokio::current())
                .with_reactor(tokio_reactor_trait::Tokio),
            Runtime::Custom(properties) => properties.clone(),
        };
        properties.with_connection_name(env!("CARGO_PKG_NAME").into())
    }
}

impl fmt::Debug for AmqpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runtime = match self.runtime {
            Runtime::Default => "default",
            Runtime::Tokio => "tokio",
            Runtime::Custom(_) => "custom",
        };
        f.debug_struct("AmqpConnector")
            .field("runtime", &runtime)
            .finish()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn connect(&self, parameters: &ConnectionParameters) -> Result<AmqpConnection> {
        let connection = lapin::Connection::connect(&parameters.url(), self.properties()).await?;
        debug!(host=%parameters.host, "amqp connection established");
        Ok(AmqpConnection(connection))
    }
}

pub struct AmqpConnection(lapin::Connection);

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn create_channel(&self) -> Result<AmqpChannel> {
        Ok(AmqpChannel(self.0.create_channel().await?))
    }

    async fn close(&self) -> Result<()> {
        self.0.close(200, "OK").await?;
        Ok(())
    }
}

impl fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AmqpConnection").finish()
    }
}

#[derive(Debug)]
pub struct AmqpChannel(lapin::Channel);

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.0.id()
    }

    fn state(&self) -> ChannelState {
        self.0.status().state().into()
    }

    async fn queue_declare(&self, queue: &QueueRef, passive: bool) -> Result<Queue> {
        let options = QueueDeclareOptions {
            passive,
            durable: queue.durable,
            auto_delete: queue.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let declared = self
            .0
            .queue_declare(&queue.name, options, FieldTable::default())
            .await?;
        Ok(declared.into())
    }

    async fn exchange_declare(&self, exchange: &ExchangeRef, passive: bool) -> Result<()> {
        let options = ExchangeDeclareOptions {
            passive,
            auto_delete: exchange.auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.0
            .exchange_declare(
                &exchange.name,
                ExchangeKind::Direct,
                options,
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.0
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn basic_publish(&self, exchange: &str, message: Message) -> Result<()> {
        let properties = match message.delivery_mode {
            Some(mode) => BasicProperties::default().with_delivery_mode(mode.as_amqp()),
            None => BasicProperties::default(),
        };
        trace!(exchange, routing_key=%message.routing_key, persistent=message.persistent(), "publishing");
        // Publisher confirms are never enabled on this channel, so there is
        // nothing to wait for beyond the frame being handed over.
        self.0
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.data,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<Consumer> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };
        let channel_id = self.id();
        let consumer = self
            .0
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        let deliveries = consumer.map(move |delivery| {
            delivery
                .map(|delivery| into_delivery(channel_id, delivery))
                .map_err(Into::into)
        });
        Ok(Consumer::new(consumer_tag, deliveries))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<u32> {
        Ok(self
            .0
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?)
    }

    async fn exchange_delete(&self, exchange: &str) -> Result<()> {
        self.0
            .exchange_delete(exchange, ExchangeDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.0.close(200, "OK").await?;
        Ok(())
    }
}

struct AmqpAcker(lapin::message::Delivery);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

fn into_delivery(channel_id: u16, mut delivery: lapin::message::Delivery) -> Delivery {
    let data = std::mem::take(&mut delivery.data);
    let delivery_mode = (*delivery.properties.delivery_mode()).and_then(DeliveryMode::from_amqp);
    let exchange = delivery.exchange.as_str().to_string();
    let routing_key = delivery.routing_key.as_str().to_string();
    let redelivered = delivery.redelivered;
    let delivery_tag = delivery.delivery_tag;
    Delivery {
        context: DeliveryContext::new(delivery_tag, channel_id, Acker::new(AmqpAcker(delivery))),
        exchange,
        routing_key,
        redelivered,
        delivery_mode,
        data,
    }
}
