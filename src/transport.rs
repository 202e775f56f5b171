use crate::{
    channel_status::ChannelState, configuration::ConnectionParameters, exchange::ExchangeRef,
    message::Delivery, queue::Queue, queue::QueueRef, Message, Result,
};
use async_trait::async_trait;
use futures_core::Stream;
use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

/// Opens broker sessions. Wire-level AMQP is entirely the implementor's
/// business; the clients only drive the operations below.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: BrokerConnection;

    async fn connect(&self, parameters: &ConnectionParameters) -> Result<Self::Connection>;
}

/// A live session to a broker. Closing it invalidates every channel created
/// from it and ends their consumers.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Self::Channel>;

    async fn close(&self) -> Result<()>;
}

/// A channel on a [`BrokerConnection`].
///
/// Any channel-level broker error (a failed passive declare, a declaration
/// conflict, an unknown delivery tag) leaves the channel
/// [`Closed`](ChannelState::Closed); every later operation on it fails.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn id(&self) -> u16;

    fn state(&self) -> ChannelState;

    /// With `passive`, only assert that the queue exists; its flags are ignored.
    async fn queue_declare(&self, queue: &QueueRef, passive: bool) -> Result<Queue>;

    /// With `passive`, only assert that the exchange exists.
    async fn exchange_declare(&self, exchange: &ExchangeRef, passive: bool) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Fire-and-forget: returns once the message is handed to the broker.
    async fn basic_publish(&self, exchange: &str, message: Message) -> Result<()>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool)
        -> Result<Consumer>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Returns the number of messages the queue held.
    async fn queue_delete(&self, queue: &str) -> Result<u32>;

    async fn exchange_delete(&self, exchange: &str) -> Result<()>;

    /// Close the channel, cancelling its consumers. Unacknowledged
    /// deliveries go back to their queue.
    async fn close(&self) -> Result<()>;
}

type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Deliveries for one subscription, in the order the broker sent them.
///
/// The stream ends when the consumer is cancelled or its channel closes.
pub struct Consumer {
    tag: String,
    deliveries: DeliveryStream,
}

impl Consumer {
    pub fn new<S>(tag: &str, deliveries: S) -> Self
    where
        S: Stream<Item = Result<Delivery>> + Send + 'static,
    {
        Self {
            tag: tag.to_string(),
            deliveries: Box::pin(deliveries),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Stream for Consumer {
    type Item = Result<Delivery>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.deliveries.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("tag", &self.tag).finish()
    }
}
