//! An in-process broker speaking the [`transport`](crate::transport) traits.
//!
//! It follows the AMQP 0-9-1 behaviours the clients depend on: channel-level
//! errors close the channel, deliveries are tagged per channel, unacknowledged
//! messages go back to their queue when their channel goes away, and a
//! restart only keeps durable queues and persistent messages. Routing is
//! limited to the default exchange and direct bindings.

use crate::{
    acker::{Acker, Acknowledge},
    channel_status::{ChannelState, ChannelStatus},
    configuration::ConnectionParameters,
    exchange::ExchangeRef,
    id_sequence::IdSequence,
    message::{Delivery, DeliveryContext, DeliveryMode, Message},
    queue::{Queue, QueueRef},
    transport::{BrokerChannel, BrokerConnection, Connector, Consumer},
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fmt, io,
    sync::{Arc, Weak},
};
use tracing::{debug, trace};

type ChannelKey = (u64, u16);

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            state: Arc::new_cyclic(|me| Mutex::new(BrokerState::new(me.clone()))),
        }
    }
}

impl MemoryBroker {
    /// Queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        self.state.lock().queues.keys().cloned().collect()
    }

    /// Messages waiting in the queue, not counting unacknowledged ones.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.consumers.len())
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    /// Simulate a broker restart: every connection drops, non-durable queues
    /// and exchanges vanish and durable queues keep only persistent messages.
    pub fn restart(&self) {
        let mut state = self.state.lock();
        let connections = state.connections.drain().collect::<Vec<_>>();
        for connection in connections {
            state.close_connection(connection);
        }
        state.queues.retain(|_, queue| queue.durable);
        for queue in state.queues.values_mut() {
            queue
                .messages
                .retain(|message| message.delivery_mode == Some(DeliveryMode::Persistent));
        }
        state.exchanges.clear();
        debug!(queues = state.queues.len(), "broker restarted");
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MemoryBroker");
        if let Some(state) = self.state.try_lock() {
            debug
                .field("queues", &state.queues.keys().collect::<Vec<_>>())
                .field("exchanges", &state.exchanges.keys().collect::<Vec<_>>())
                .field("connections", &state.connections.len());
        }
        debug.finish()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, parameters: &ConnectionParameters) -> Result<MemoryConnection> {
        let id = {
            let mut state = self.state.lock();
            let id = state.connection_ids.next();
            state.connections.insert(id);
            id
        };
        trace!(id, user=%parameters.username, "memory connection opened");
        Ok(MemoryConnection {
            broker: self.clone(),
            id,
            channel_ids: Mutex::new(IdSequence::with_max(u16::MAX)),
        })
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    channel_ids: Mutex<IdSequence<u16>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains(&self.id) {
            return Err(connection_closed());
        }
        let key = (self.id, self.channel_ids.lock().next());
        let status = ChannelStatus::default();
        state.channels.insert(
            key,
            ChannelEntry {
                status: status.clone(),
                delivery_tags: IdSequence::new(),
                unacked: BTreeMap::new(),
            },
        );
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            key,
            status,
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state.lock();
        if !state.connections.remove(&self.id) {
            return Err(connection_closed());
        }
        state.close_connection(self.id);
        Ok(())
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    key: ChannelKey,
    status: ChannelStatus,
}

impl MemoryChannel {
    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, BrokerState>> {
        let state = self.broker.state.lock();
        if self.status.closed() {
            return Err(Error::InvalidChannelState(ChannelState::Closed));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.key.1
    }

    fn state(&self) -> ChannelState {
        self.status.state()
    }

    async fn queue_declare(&self, queue: &QueueRef, passive: bool) -> Result<Queue> {
        let mut state = self.lock()?;
        let conflict = match state.queues.get(&queue.name) {
            Some(existing) if passive => return Ok(existing.info(&queue.name)),
            Some(existing) => {
                if existing.durable != queue.durable {
                    Some(("durable", queue.durable, existing.durable))
                } else if existing.auto_delete != queue.auto_delete {
                    Some(("auto_delete", queue.auto_delete, existing.auto_delete))
                } else {
                    return Ok(existing.info(&queue.name));
                }
            }
            None if passive => {
                let error =
                    Error::NotFound(format!("NOT_FOUND - no queue '{}' in vhost '/'", queue.name));
                return Err(state.channel_error(self.key, error));
            }
            None => None,
        };
        if let Some((arg, received, current)) = conflict {
            let error = Error::PreconditionFailed(format!(
                "PRECONDITION_FAILED - inequivalent arg '{}' for queue '{}' in vhost '/': received '{}' but current is '{}'",
                arg, queue.name, received, current
            ));
            return Err(state.channel_error(self.key, error));
        }
        state.queues.insert(
            queue.name.clone(),
            QueueState {
                durable: queue.durable,
                auto_delete: queue.auto_delete,
                ..QueueState::default()
            },
        );
        trace!(queue=%queue.name, durable=queue.durable, auto_delete=queue.auto_delete, "queue declared");
        Ok(Queue::new(queue.name.clone(), 0, 0))
    }

    async fn exchange_declare(&self, exchange: &ExchangeRef, passive: bool) -> Result<()> {
        let mut state = self.lock()?;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if !passive && existing.auto_delete != exchange.auto_delete => {
                let error = Error::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'auto_delete' for exchange '{}' in vhost '/': received '{}' but current is '{}'",
                    exchange.name, exchange.auto_delete, existing.auto_delete
                ));
                Err(state.channel_error(self.key, error))
            }
            Some(_) => Ok(()),
            None if passive => {
                let error = Error::NotFound(format!(
                    "NOT_FOUND - no exchange '{}' in vhost '/'",
                    exchange.name
                ));
                Err(state.channel_error(self.key, error))
            }
            None => {
                state.exchanges.insert(
                    exchange.name.clone(),
                    ExchangeState {
                        auto_delete: exchange.auto_delete,
                        bindings: Vec::new(),
                    },
                );
                trace!(exchange=%exchange.name, "exchange declared");
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock()?;
        if !state.queues.contains_key(queue) {
            let error = Error::NotFound(format!("NOT_FOUND - no queue '{}' in vhost '/'", queue));
            return Err(state.channel_error(self.key, error));
        }
        match state.exchanges.get_mut(exchange) {
            Some(existing) => {
                let binding = (routing_key.to_string(), queue.to_string());
                if !existing.bindings.contains(&binding) {
                    existing.bindings.push(binding);
                }
                Ok(())
            }
            None => {
                let error =
                    Error::NotFound(format!("NOT_FOUND - no exchange '{}' in vhost '/'", exchange));
                Err(state.channel_error(self.key, error))
            }
        }
    }

    async fn basic_publish(&self, exchange: &str, message: Message) -> Result<()> {
        let mut state = self.lock()?;
        let targets = if ExchangeRef::is_default(exchange) {
            vec![message.routing_key.clone()]
        } else {
            match state.exchanges.get(exchange) {
                Some(existing) => existing
                    .bindings
                    .iter()
                    .filter(|(key, _)| *key == message.routing_key)
                    .map(|(_, queue)| queue.clone())
                    .collect(),
                None => {
                    let error = Error::NotFound(format!(
                        "NOT_FOUND - no exchange '{}' in vhost '/'",
                        exchange
                    ));
                    return Err(state.channel_error(self.key, error));
                }
            }
        };
        let stored = Stored {
            exchange: exchange.to_string(),
            routing_key: message.routing_key,
            data: message.data,
            delivery_mode: message.delivery_mode,
            redelivered: false,
        };
        let mut routed = false;
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.messages.push_back(stored.clone());
                routed = true;
                state.dispatch(&target);
            }
        }
        if !routed {
            trace!(exchange, routing_key=%stored.routing_key, "unroutable message dropped");
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<Consumer> {
        let mut state = self.lock()?;
        let (sender, receiver) = flume::unbounded();
        match state.queues.get_mut(queue) {
            Some(existing) => {
                existing.consumers.push(ConsumerEntry {
                    tag: consumer_tag.to_string(),
                    channel: self.key,
                    auto_ack,
                    sender,
                });
                existing.had_consumers = true;
            }
            None => {
                let error =
                    Error::NotFound(format!("NOT_FOUND - no queue '{}' in vhost '/'", queue));
                return Err(state.channel_error(self.key, error));
            }
        }
        state.dispatch(queue);
        Ok(Consumer::new(consumer_tag, receiver.into_stream()))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.lock()?;
        let key = self.key;
        state.remove_consumers(|consumer| consumer.channel == key && consumer.tag == consumer_tag);
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<u32> {
        let mut state = self.lock()?;
        match state.queues.remove(queue) {
            Some(removed) => {
                state.unbind_queue(queue);
                Ok(removed.messages.len() as u32)
            }
            None => {
                let error =
                    Error::NotFound(format!("NOT_FOUND - no queue '{}' in vhost '/'", queue));
                Err(state.channel_error(self.key, error))
            }
        }
    }

    async fn exchange_delete(&self, exchange: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.exchanges.remove(exchange).is_none() {
            let error =
                Error::NotFound(format!("NOT_FOUND - no exchange '{}' in vhost '/'", exchange));
            return Err(state.channel_error(self.key, error));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.close_channel(self.key);
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    channel: ChannelKey,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let state = self.state.upgrade().ok_or_else(connection_closed)?;
        let mut state = state.lock();
        let entry = state
            .channels
            .get_mut(&self.channel)
            .ok_or(Error::InvalidChannelState(ChannelState::Closed))?;
        if entry.unacked.remove(&self.delivery_tag).is_some() {
            return Ok(());
        }
        let error = Error::PreconditionFailed(format!(
            "PRECONDITION_FAILED - unknown delivery tag {}",
            self.delivery_tag
        ));
        Err(state.channel_error(self.channel, error))
    }
}

struct BrokerState {
    queues: BTreeMap<String, QueueState>,
    exchanges: BTreeMap<String, ExchangeState>,
    channels: HashMap<ChannelKey, ChannelEntry>,
    connections: HashSet<u64>,
    connection_ids: IdSequence<u64>,
    /// Handed to ackers, which must not keep the broker alive.
    me: Weak<Mutex<BrokerState>>,
}

impl BrokerState {
    fn new(me: Weak<Mutex<BrokerState>>) -> Self {
        Self {
            queues: BTreeMap::new(),
            exchanges: BTreeMap::new(),
            channels: HashMap::new(),
            connections: HashSet::new(),
            connection_ids: IdSequence::new(),
            me,
        }
    }

    /// Close the channel on behalf of the broker and hand the error back.
    fn channel_error(&mut self, key: ChannelKey, error: Error) -> Error {
        debug!(connection = key.0, channel = key.1, %error, "channel closed by broker");
        self.close_channel(key);
        error
    }

    fn close_channel(&mut self, key: ChannelKey) {
        let Some(entry) = self.channels.remove(&key) else {
            return;
        };
        entry.status.close();
        self.remove_consumers(|consumer| consumer.channel == key);
        let mut touched = Vec::new();
        for (_, (queue, mut message)) in entry.unacked.into_iter().rev() {
            if let Some(existing) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                existing.messages.push_front(message);
                touched.push(queue);
            }
        }
        touched.dedup();
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection: u64) {
        let keys = self
            .channels
            .keys()
            .filter(|key| key.0 == connection)
            .copied()
            .collect::<Vec<_>>();
        for key in keys {
            self.close_channel(key);
        }
    }

    /// Drop matching consumers, which ends their delivery streams, then
    /// delete auto-delete queues left without consumers.
    fn remove_consumers<F: Fn(&ConsumerEntry) -> bool>(&mut self, matches: F) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| !matches(consumer));
        }
        let orphans = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.auto_delete && queue.had_consumers && queue.consumers.is_empty())
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for name in orphans {
            debug!(queue=%name, "auto-delete queue lost its last consumer");
            self.queues.remove(&name);
            self.unbind_queue(&name);
        }
    }

    /// Auto-delete exchanges go away with their last binding.
    fn unbind_queue(&mut self, queue: &str) {
        self.exchanges.retain(|name, exchange| {
            let bound = exchange.bindings.len();
            exchange.bindings.retain(|(_, target)| target != queue);
            let orphaned = exchange.auto_delete && bound > 0 && exchange.bindings.is_empty();
            if orphaned {
                debug!(exchange=%name, "auto-delete exchange lost its last binding");
            }
            !orphaned
        });
    }

    /// Push waiting messages to the queue's consumers, round-robin.
    fn dispatch(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        while !queue.consumers.is_empty() {
            let Some(message) = queue.messages.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            let consumer = &queue.consumers[index];
            let delivered = match self.channels.get_mut(&consumer.channel) {
                Some(channel) => {
                    let delivery_tag = channel.delivery_tags.next();
                    let acker = Acker::new(MemoryAcker {
                        state: self.me.clone(),
                        channel: consumer.channel,
                        delivery_tag,
                    });
                    let delivery = Delivery {
                        context: DeliveryContext::new(delivery_tag, consumer.channel.1, acker),
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        redelivered: message.redelivered,
                        delivery_mode: message.delivery_mode,
                        data: message.data.clone(),
                    };
                    let sent = consumer.sender.send(Ok(delivery)).is_ok();
                    if sent && !consumer.auto_ack {
                        channel
                            .unacked
                            .insert(delivery_tag, (name.to_string(), message.clone()));
                    }
                    sent
                }
                None => false,
            };
            if delivered {
                trace!(queue = name, consumer=%consumer.tag, "message delivered");
                queue.next_consumer = index + 1;
            } else {
                queue.consumers.remove(index);
                queue.messages.push_front(message);
            }
        }
    }
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    auto_delete: bool,
    messages: VecDeque<Stored>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
    had_consumers: bool,
}

impl QueueState {
    fn info(&self, name: &str) -> Queue {
        Queue::new(
            name.to_string(),
            self.messages.len() as u32,
            self.consumers.len() as u32,
        )
    }
}

struct ExchangeState {
    auto_delete: bool,
    /// (routing key, queue)
    bindings: Vec<(String, String)>,
}

struct ChannelEntry {
    status: ChannelStatus,
    delivery_tags: IdSequence<u64>,
    unacked: BTreeMap<u64, (String, Stored)>,
}

struct ConsumerEntry {
    tag: String,
    channel: ChannelKey,
    auto_ack: bool,
    sender: flume::Sender<Result<Delivery>>,
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    delivery_mode: Option<DeliveryMode>,
    redelivered: bool,
}

fn connection_closed() -> Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed").into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_global_executor::block_on;
    use futures_lite::StreamExt;

    fn channel(broker: &MemoryBroker) -> (MemoryConnection, MemoryChannel) {
        block_on(async {
            let connection = broker
                .connect(&ConnectionParameters::default())
                .await
                .unwrap();
            let channel = connection.create_channel().await.unwrap();
            (connection, channel)
        })
    }

    async fn next_body(consumer: &mut Consumer) -> Vec<u8> {
        consumer.next().await.unwrap().unwrap().data
    }

    fn message(queue: &str, body: &str, delivery_mode: Option<DeliveryMode>) -> Message {
        Message::new(queue, body.as_bytes().to_vec(), delivery_mode)
    }

    #[test]
    fn restart_keeps_durable_queues_and_persistent_messages() {
        let broker = MemoryBroker::default();
        let (_connection, channel) = channel(&broker);
        block_on(async {
            channel
                .queue_declare(&QueueRef::new("durable", true, false), false)
                .await
                .unwrap();
            channel
                .queue_declare(&QueueRef::new("transient", false, false), false)
                .await
                .unwrap();
            channel
                .exchange_declare(&ExchangeRef::new("events", false), false)
                .await
                .unwrap();
            let persistent = Some(DeliveryMode::Persistent);
            channel
                .basic_publish("", message("durable", "kept", persistent))
                .await
                .unwrap();
            channel
                .basic_publish("", message("durable", "lost", None))
                .await
                .unwrap();
        });

        broker.restart();
        assert_eq!(broker.queue_names(), vec!["durable"]);
        assert_eq!(broker.message_count("durable"), Some(1));
        assert!(!broker.has_exchange("events"));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn closing_a_channel_requeues_unacked_deliveries() {
        let broker = MemoryBroker::default();
        let (connection, channel) = channel(&broker);
        block_on(async {
            channel
                .queue_declare(&QueueRef::new("work", false, false), false)
                .await
                .unwrap();
            for body in ["a", "b"] {
                channel
                    .basic_publish("", message("work", body, None))
                    .await
                    .unwrap();
            }
            let mut consumer = channel.basic_consume("work", "c1", false).await.unwrap();
            let first = consumer.next().await.unwrap().unwrap();
            assert_eq!(first.delivery_tag(), 1);
            first.ack().await.unwrap();
            let second = consumer.next().await.unwrap().unwrap();
            assert_eq!(second.delivery_tag(), 2);
            assert_eq!(broker.message_count("work"), Some(0));

            channel.close().await.unwrap();
            assert_eq!(broker.message_count("work"), Some(1));
            assert!(consumer.next().await.is_none());

            let channel = connection.create_channel().await.unwrap();
            let mut consumer = channel.basic_consume("work", "c2", true).await.unwrap();
            let again = consumer.next().await.unwrap().unwrap();
            assert!(again.redelivered);
            assert_eq!(again.data, b"b".to_vec());
            assert_eq!(again.delivery_tag(), 1);
        });
    }

    #[test]
    fn unknown_delivery_tag_closes_the_channel() {
        let broker = MemoryBroker::default();
        let (_connection, channel) = channel(&broker);
        block_on(async {
            channel
                .queue_declare(&QueueRef::new("work", false, false), false)
                .await
                .unwrap();
            channel
                .basic_publish("", message("work", "a", None))
                .await
                .unwrap();
            let mut consumer = channel.basic_consume("work", "c1", true).await.unwrap();
            let delivery = consumer.next().await.unwrap().unwrap();
            // Already acknowledged by the broker on delivery.
            assert!(matches!(
                delivery.ack().await,
                Err(Error::PreconditionFailed(_))
            ));
        });
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn consumers_share_a_queue_round_robin() {
        let broker = MemoryBroker::default();
        let (_connection, channel) = channel(&broker);
        block_on(async {
            channel
                .queue_declare(&QueueRef::new("work", false, false), false)
                .await
                .unwrap();
            let mut first = channel.basic_consume("work", "c1", true).await.unwrap();
            let mut second = channel.basic_consume("work", "c2", true).await.unwrap();
            for body in ["1", "2", "3", "4"] {
                channel
                    .basic_publish("", message("work", body, None))
                    .await
                    .unwrap();
            }
            assert_eq!(next_body(&mut first).await, b"1");
            assert_eq!(next_body(&mut second).await, b"2");
            assert_eq!(next_body(&mut first).await, b"3");
            assert_eq!(next_body(&mut second).await, b"4");
        });
    }

    #[test]
    fn auto_delete_entities_follow_their_users() {
        let broker = MemoryBroker::default();
        let (_connection, channel) = channel(&broker);
        block_on(async {
            channel
                .queue_declare(&QueueRef::new("temp", false, true), false)
                .await
                .unwrap();
            channel
                .exchange_declare(&ExchangeRef::new("fleeting", true), false)
                .await
                .unwrap();
            channel.queue_bind("temp", "fleeting", "temp").await.unwrap();
            let consumer = channel.basic_consume("temp", "c1", true).await.unwrap();
            assert_eq!(broker.consumer_count("temp"), Some(1));

            channel.basic_cancel(consumer.tag()).await.unwrap();
        });
        assert!(broker.queue_names().is_empty());
        assert!(!broker.has_exchange("fleeting"));
    }

    #[test]
    fn closed_channels_refuse_operations() {
        let broker = MemoryBroker::default();
        let (connection, channel) = channel(&broker);
        block_on(async {
            let err = channel
                .exchange_declare(&ExchangeRef::new("missing", false), true)
                .await
                .unwrap_err();
            assert_eq!(
                err,
                Error::NotFound("NOT_FOUND - no exchange 'missing' in vhost '/'".into())
            );
            assert_eq!(
                channel.queue_delete("anything").await,
                Err(Error::InvalidChannelState(ChannelState::Closed))
            );

            connection.close().await.unwrap();
            assert!(connection.create_channel().await.is_err());
            assert!(connection.close().await.is_err());
        });
    }
}
