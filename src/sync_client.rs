use crate::{
    amqp::AmqpConnector,
    channel_status::ChannelState,
    configuration::{ClientConfig, ConnectionParameters},
    exchange::ExchangeRef,
    message::{Delivery, DeliveryContext, Message},
    payload::Payload,
    session::{ClientState, ConnectionState, Session},
    topology::{ResolvePolicy, TopologyResolver},
    transport::{BrokerChannel, Connector},
    Error, Result,
};
use async_global_executor::block_on;
use futures_lite::StreamExt;
use std::cell::Cell;
use tracing::{debug, trace, warn};

/// Blocking client: every call runs to completion on the calling thread.
///
/// One instance owns one connection and one channel and must stay on one
/// thread; run several instances for concurrency.
///
/// ```rust,no_run
/// use terrier::{ConnectionParameters, Result, SyncClient};
///
/// fn main() -> Result<()> {
///     let mut client = SyncClient::new(Default::default());
///     client.connect(&ConnectionParameters::default())?;
///     client.send("test", &"hello".to_string())?;
///     client.receive("test", |_channel, delivery| {
///         println!("received {:?}", delivery.data);
///         Ok(())
///     })
/// }
/// ```
pub struct SyncClient<C: Connector = AmqpConnector> {
    connector: C,
    config: ClientConfig,
    state: ClientState<C>,
}

impl SyncClient<AmqpConnector> {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(AmqpConnector::default(), config)
    }
}

impl<C: Connector> SyncClient<C> {
    pub fn with_connector(connector: C, config: ClientConfig) -> Self {
        Self {
            connector,
            config,
            state: ClientState::default(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Open the connection and its channel.
    pub fn connect(&mut self, parameters: &ConnectionParameters) -> Result<()> {
        self.state.ensure_unconnected()?;
        let session = block_on(Session::open(&self.connector, parameters))?;
        self.state = ClientState::Connected(session);
        Ok(())
    }

    /// Close the connection. The client cannot be used afterwards.
    pub fn disconnect(&mut self) -> Result<()> {
        let session = self.state.take()?;
        block_on(session.close())
    }

    /// Publish through the default exchange, routed to `queue`.
    pub fn send<P: Payload>(&mut self, queue: &str, payload: &P) -> Result<()> {
        self.publish("", queue, payload)
    }

    /// Publish to `exchange` with `queue` as routing key, making sure the
    /// queue (and the exchange unless it is the default one) exists first.
    pub fn publish<P: Payload>(&mut self, exchange: &str, queue: &str, payload: &P) -> Result<()> {
        let message = Message::new(
            queue,
            payload.to_message()?.into_bytes(),
            self.config.delivery_mode(),
        );
        let queue = self.config.queue(queue);
        let exchange_ref = self.config.exchange(exchange);
        let queue_resolver = TopologyResolver::new(self.queue_policy());
        let exchange_resolver = TopologyResolver::new(self.config.exchange_policy());
        let session = self.state.session()?;
        block_on(async {
            queue_resolver.resolve(session, &queue).await?;
            if !ExchangeRef::is_default(exchange) {
                exchange_resolver.resolve(session, &exchange_ref).await?;
            }
            trace!(exchange, queue=%queue.name, "publish");
            session.channel().basic_publish(exchange, message).await
        })
    }

    /// Consume `queue`, calling `callback` for every delivery in the order
    /// the broker sends them. Blocks until the consumer ends: the callback
    /// called [`ChannelHandle::stop_consuming`] or returned an error, or the
    /// connection went away.
    ///
    /// Without auto-ack, the callback has to acknowledge each delivery through
    /// [`commit_ack`](Self::commit_ack).
    pub fn receive<F>(&mut self, queue: &str, mut callback: F) -> Result<()>
    where
        F: FnMut(&ChannelHandle<'_, C>, Delivery) -> Result<()>,
    {
        let auto_ack = self.config.auto_ack;
        let queue = self.config.queue(queue);
        let resolver = TopologyResolver::new(self.queue_policy());
        let session = self.state.session()?;
        block_on(resolver.resolve(session, &queue))?;
        let consumer_tag = session.next_consumer_tag();
        let channel = session.channel();
        let mut consumer = block_on(channel.basic_consume(&queue.name, &consumer_tag, auto_ack))?;
        debug!(queue=%queue.name, consumer=%consumer_tag, auto_ack, "consuming");

        let handle = ChannelHandle {
            channel,
            stopped: Cell::new(false),
        };
        let result = loop {
            match block_on(consumer.next()) {
                Some(Ok(delivery)) => {
                    if let Err(err) = callback(&handle, delivery) {
                        break Err(err);
                    }
                    if handle.stopped.get() {
                        break Ok(());
                    }
                }
                Some(Err(err)) => break Err(err),
                None => {
                    debug!(consumer=%consumer_tag, "consumer ended");
                    return Ok(());
                }
            }
        };
        if channel.state() == ChannelState::Open {
            if let Err(err) = block_on(channel.basic_cancel(&consumer_tag)) {
                warn!(consumer=%consumer_tag, error=%err, "failed to cancel consumer");
            }
        }
        result
    }

    /// Delete a queue, returning how many messages it held.
    pub fn delete_queue(&mut self, queue: &str) -> Result<u32> {
        let session = self.state.session()?;
        block_on(async { session.usable_channel().await?.queue_delete(queue).await })
    }

    pub fn delete_exchange(&mut self, exchange: &str) -> Result<()> {
        let session = self.state.session()?;
        block_on(async {
            session
                .usable_channel()
                .await?
                .exchange_delete(exchange)
                .await
        })
    }

    /// Bind `queue` to `exchange`, routed by the queue name.
    pub fn bind_queue(&mut self, queue: &str, exchange: &str) -> Result<()> {
        let session = self.state.session()?;
        block_on(async {
            session
                .usable_channel()
                .await?
                .queue_bind(queue, exchange, queue)
                .await
        })
    }

    /// Acknowledge a delivery from inside a [`receive`](Self::receive)
    /// callback. Needed exactly once per delivery when auto-ack is off.
    pub fn commit_ack(channel: &ChannelHandle<'_, C>, context: &DeliveryContext) -> Result<()> {
        channel.ack(context)
    }

    fn queue_policy(&self) -> ResolvePolicy {
        self.config
            .queue_policy
            .unwrap_or(ResolvePolicy::DeclareAlways)
    }
}

impl<C: Connector> Drop for SyncClient<C> {
    fn drop(&mut self) {
        if let Ok(session) = self.state.take() {
            if let Err(err) = block_on(session.close()) {
                warn!(error=%err, "failed to close connection on drop");
            }
        }
    }
}

/// The channel a [`SyncClient::receive`] callback is running on.
pub struct ChannelHandle<'a, C: Connector> {
    channel: &'a crate::session::ChannelOf<C>,
    stopped: Cell<bool>,
}

impl<C: Connector> ChannelHandle<'_, C> {
    pub fn id(&self) -> u16 {
        self.channel.id()
    }

    /// Return from `receive` once the current callback returns.
    pub fn stop_consuming(&self) {
        self.stopped.set(true);
    }

    fn ack(&self, context: &DeliveryContext) -> Result<()> {
        if context.channel_id != self.channel.id() {
            return Err(Error::InvalidChannel(context.channel_id));
        }
        if self.channel.state() == ChannelState::Closed {
            return Err(Error::InvalidChannelState(ChannelState::Closed));
        }
        block_on(context.ack())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::MemoryBroker, message::DeliveryMode, payload::Json};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Person {
        firstname: String,
        lastname: String,
    }

    fn client(broker: &MemoryBroker, config: ClientConfig) -> SyncClient<MemoryBroker> {
        let mut client = SyncClient::with_connector(broker.clone(), config);
        client.connect(&ConnectionParameters::default()).unwrap();
        client
    }

    #[test]
    fn operations_need_a_connection() {
        let mut client =
            SyncClient::with_connector(MemoryBroker::default(), ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Unconnected);
        assert_eq!(client.send("q", &"x".to_string()), Err(Error::NotConnected));
        assert_eq!(client.delete_queue("q"), Err(Error::NotConnected));
        assert_eq!(client.disconnect(), Err(Error::NotConnected));
        assert_eq!(client.state(), ConnectionState::Unconnected);
    }

    #[test]
    fn disconnected_is_terminal() {
        let broker = MemoryBroker::default();
        let mut client = client(&broker, ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(
            client.connect(&ConnectionParameters::default()),
            Err(Error::AlreadyConnected)
        );

        client.disconnect().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.send("q", &"x".to_string()), Err(Error::NotConnected));
        assert_eq!(
            client.connect(&ConnectionParameters::default()),
            Err(Error::NotConnected)
        );
    }

    #[test]
    fn person_round_trip() {
        let broker = MemoryBroker::default();
        let mut producer = client(&broker, ClientConfig::default());
        let mut consumer = client(&broker, ClientConfig::default());
        let john = Person {
            firstname: "John".into(),
            lastname: "Doe".into(),
        };
        producer.send("test", &Json(john.clone())).unwrap();

        let mut received = Vec::new();
        consumer
            .receive("test", |channel, delivery| {
                assert_eq!(
                    delivery.data,
                    br#"{"firstname":"John","lastname":"Doe"}"#.to_vec()
                );
                received.push(delivery.payload::<Json<Person>>()?.into_inner());
                channel.stop_consuming();
                Ok(())
            })
            .unwrap();
        assert_eq!(received, vec![john]);
        assert_eq!(broker.message_count("test"), Some(0));
        assert_eq!(broker.consumer_count("test"), Some(0));
    }

    #[test]
    fn deliveries_keep_publish_order() {
        let broker = MemoryBroker::default();
        let mut client = client(&broker, ClientConfig::default());
        for n in 1..=5 {
            client.send("numbers", &n.to_string()).unwrap();
        }

        let mut received = Vec::new();
        client
            .receive("numbers", |channel, delivery| {
                received.push(delivery.payload::<String>()?);
                if received.len() == 5 {
                    channel.stop_consuming();
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(received, vec!["1", "2", "3", "4", "5"]);
    }

    #[test]
    fn delivery_mode_follows_durability() {
        let broker = MemoryBroker::default();
        for (durable, expected) in [(true, Some(DeliveryMode::Persistent)), (false, None)] {
            let mut client = client(&broker, ClientConfig::default().with_durable(durable));
            let queue = format!("mode-{}", durable);
            client.send(&queue, &"x".to_string()).unwrap();
            client
                .receive(&queue, |channel, delivery| {
                    assert_eq!(delivery.delivery_mode, expected);
                    channel.stop_consuming();
                    Ok(())
                })
                .unwrap();
        }
    }

    #[test]
    fn durable_messages_survive_a_restart() {
        let broker = MemoryBroker::default();
        client(&broker, ClientConfig::default().with_durable(true))
            .send("orders", &"kept".to_string())
            .unwrap();
        client(&broker, ClientConfig::default())
            .send("events", &"lost".to_string())
            .unwrap();

        broker.restart();
        assert_eq!(broker.queue_names(), vec!["orders"]);
        assert_eq!(broker.message_count("orders"), Some(1));
    }

    #[test]
    fn repeated_sends_declare_once() {
        let broker = MemoryBroker::default();
        for durable in [false, true] {
            let queue = format!("jobs-{}", durable);
            let mut client = client(&broker, ClientConfig::default().with_durable(durable));
            client.send(&queue, &"a".to_string()).unwrap();
            client.send(&queue, &"b".to_string()).unwrap();
            assert_eq!(broker.message_count(&queue), Some(2));
        }
        assert_eq!(broker.queue_names(), vec!["jobs-false", "jobs-true"]);
    }

    #[test]
    fn conflicting_declaration_is_surfaced() {
        let broker = MemoryBroker::default();
        client(&broker, ClientConfig::default().with_durable(true))
            .send("shared", &"a".to_string())
            .unwrap();

        let mut other = client(&broker, ClientConfig::default());
        let err = other.send("shared", &"b".to_string()).unwrap_err();
        assert!(err.is_declaration_conflict());
        // The broker closed the channel; the next operation gets a new one.
        other.send("private", &"c".to_string()).unwrap();

        let mut lenient = client(
            &broker,
            ClientConfig::default().with_queue_policy(ResolvePolicy::AssertFirst),
        );
        lenient.send("shared", &"d".to_string()).unwrap();
        assert_eq!(broker.message_count("shared"), Some(2));
    }

    #[test]
    fn manual_ack_is_single_use() {
        let broker = MemoryBroker::default();
        let mut client = client(&broker, ClientConfig::default().with_auto_ack(false));
        client.send("work", &"job".to_string()).unwrap();
        client
            .receive("work", |channel, delivery| {
                SyncClient::commit_ack(channel, &delivery.context)?;
                assert!(delivery.context.acknowledged());
                assert_eq!(
                    SyncClient::commit_ack(channel, &delivery.context),
                    Err(Error::InvalidAck)
                );
                channel.stop_consuming();
                Ok(())
            })
            .unwrap();
        client.disconnect().unwrap();
        assert_eq!(broker.message_count("work"), Some(0));
    }

    #[test]
    fn unacknowledged_deliveries_come_back() {
        let broker = MemoryBroker::default();
        let config = ClientConfig::default().with_auto_ack(false);
        let mut first = client(&broker, config.clone());
        first.send("work", &"job".to_string()).unwrap();
        first
            .receive("work", |channel, delivery| {
                assert!(!delivery.redelivered);
                channel.stop_consuming();
                Ok(())
            })
            .unwrap();
        assert_eq!(broker.message_count("work"), Some(0));
        first.disconnect().unwrap();
        assert_eq!(broker.message_count("work"), Some(1));

        let mut second = client(&broker, config);
        second
            .receive("work", |channel, delivery| {
                assert!(delivery.redelivered);
                assert_eq!(delivery.payload::<String>()?, "job");
                SyncClient::commit_ack(channel, &delivery.context)?;
                channel.stop_consuming();
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn callback_error_stops_consuming() {
        let broker = MemoryBroker::default();
        let mut client = client(&broker, ClientConfig::default());
        client.send("numbers", &"1".to_string()).unwrap();
        client.send("numbers", &"two".to_string()).unwrap();

        let mut seen = Vec::new();
        let err = client
            .receive("numbers", |_, delivery| {
                let body = delivery.payload::<String>()?;
                let n: u32 = body
                    .parse()
                    .map_err(|_| Error::InvalidPayload(body.clone()))?;
                seen.push(n);
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, Error::InvalidPayload("two".into()));
        assert_eq!(seen, vec![1]);
        assert_eq!(broker.consumer_count("numbers"), Some(0));
    }

    #[test]
    fn publish_through_a_bound_exchange() {
        let broker = MemoryBroker::default();
        let mut client = client(&broker, ClientConfig::default());
        client.publish("events", "audit", &"first".to_string()).unwrap();
        assert!(broker.has_exchange("events"));
        // Not bound yet: the message is dropped.
        assert_eq!(broker.message_count("audit"), Some(0));

        client.bind_queue("audit", "events").unwrap();
        client.publish("events", "audit", &"second".to_string()).unwrap();
        assert_eq!(broker.message_count("audit"), Some(1));

        assert_eq!(client.delete_queue("audit"), Ok(1));
        client.delete_exchange("events").unwrap();
        assert!(!broker.has_exchange("events"));
        assert!(broker.queue_names().is_empty());
    }

    #[test]
    fn deleting_a_missing_queue_fails_then_recovers() {
        let broker = MemoryBroker::default();
        let mut client = client(&broker, ClientConfig::default());
        assert!(matches!(client.delete_queue("ghost"), Err(Error::NotFound(_))));
        client.send("real", &"x".to_string()).unwrap();
        assert_eq!(broker.message_count("real"), Some(1));
    }
}
