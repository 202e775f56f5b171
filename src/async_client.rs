use crate::{
    amqp::AmqpConnector,
    channel_status::ChannelState,
    configuration::{ClientConfig, ConnectionParameters},
    exchange::ExchangeRef,
    management::{self, ManagementOptions},
    message::{Delivery, Message},
    payload::Payload,
    session::{ChannelOf, ClientState, ConnectionState, Session},
    topology::{ResolvePolicy, TopologyResolver},
    transport::{BrokerChannel, BrokerConnection, Connector},
    Error, Result,
};
use futures_lite::StreamExt;
use std::{future::Future, sync::Arc};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, error, trace, warn};

/// Client for use inside a tokio runtime.
///
/// [`receive`](Self::receive) registers a subscription and returns at once;
/// its callback then runs on a spawned task, one delivery at a time, in the
/// order the broker sends them. Subscriptions on the same client run
/// concurrently with each other.
///
/// The client owns one connection and one channel for publishing and topology
/// operations. Each subscription opens a further channel on that connection
/// and closes it when it ends.
///
/// Dropping a connected client ends its subscriptions and closes the
/// connection in the background, which needs a running tokio runtime. Call
/// [`disconnect`](Self::disconnect) to wait for the close and see its outcome.
///
/// ```rust,no_run
/// use terrier::{AsyncClient, ConnectionParameters, Result};
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let mut client = AsyncClient::new(Default::default());
///     client.connect(&ConnectionParameters::default()).await?;
///     client
///         .receive("test", |delivery| async move {
///             println!("received {:?}", delivery.payload::<String>());
///             Ok(())
///         })
///         .await?;
///     client.send("test", &"hello".to_string()).await
/// }
/// ```
pub struct AsyncClient<C: Connector = AmqpConnector> {
    connector: C,
    config: ClientConfig,
    state: ClientState<C>,
    subscriptions: Vec<Subscription<ChannelOf<C>>>,
}

struct Subscription<Ch> {
    channel: Arc<Ch>,
    task: JoinHandle<()>,
}

impl AsyncClient<AmqpConnector> {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(AmqpConnector::tokio(), config)
    }
}

impl<C: Connector> AsyncClient<C> {
    pub fn with_connector(connector: C, config: ClientConfig) -> Self {
        Self {
            connector,
            config,
            state: ClientState::default(),
            subscriptions: Vec::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub async fn connect(&mut self, parameters: &ConnectionParameters) -> Result<()> {
        self.state.ensure_unconnected()?;
        let session = Session::open(&self.connector, parameters).await?;
        self.state = ClientState::Connected(session);
        Ok(())
    }

    /// Close the connection, ending every subscription.
    pub async fn disconnect(&mut self) -> Result<()> {
        let session = self.state.take()?;
        let closed = session.close().await;
        for subscription in self.subscriptions.drain(..) {
            subscription.task.abort();
        }
        closed
    }

    pub async fn send<P: Payload>(&mut self, queue: &str, payload: &P) -> Result<()> {
        self.publish("", queue, payload).await
    }

    pub async fn publish<P: Payload>(
        &mut self,
        exchange: &str,
        queue: &str,
        payload: &P,
    ) -> Result<()> {
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
        queue_resolver.resolve(session, &queue).await?;
        if !ExchangeRef::is_default(exchange) {
            exchange_resolver.resolve(session, &exchange_ref).await?;
        }
        trace!(exchange, queue=%queue.name, "publish");
        session.channel().basic_publish(exchange, message).await
    }

    /// Subscribe `callback` to `queue` and return the consumer tag.
    ///
    /// Each subscription consumes on a channel of its own, so a broker error
    /// on the client's channel does not end it. Without auto-ack the callback
    /// has to acknowledge each delivery, with [`Delivery::ack`] or
    /// [`commit_ack`](Self::commit_ack), before it returns. A callback error
    /// ends the subscription.
    pub async fn receive<F, Fut>(&mut self, queue: &str, mut callback: F) -> Result<String>
    where
        F: FnMut(Delivery) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let auto_ack = self.config.auto_ack;
        let queue = self.config.queue(queue);
        let resolver = TopologyResolver::new(self.queue_policy());
        let session = self.state.session()?;
        resolver.resolve(session, &queue).await?;
        let consumer_tag = session.next_consumer_tag();
        let channel = session.open_channel().await?;
        let mut consumer = channel
            .basic_consume(&queue.name, &consumer_tag, auto_ack)
            .await?;
        debug!(queue=%queue.name, consumer=%consumer_tag, channel=channel.id(), auto_ack, "subscribed");

        let tag = consumer_tag.clone();
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let outcome = match delivery {
                    Ok(delivery) => callback(delivery).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = outcome {
                    error!(consumer=%tag, error=%err, "subscription failed");
                    break;
                }
            }
            if task_channel.state() == ChannelState::Open {
                if let Err(err) = task_channel.close().await {
                    warn!(consumer=%tag, error=%err, "failed to close subscription channel");
                }
            }
            debug!(consumer=%tag, "subscription ended");
        });
        self.subscriptions
            .retain(|subscription| !subscription.task.is_finished());
        self.subscriptions.push(Subscription { channel, task });
        Ok(consumer_tag)
    }

    pub async fn delete_queue(&mut self, queue: &str) -> Result<u32> {
        let session = self.state.session()?;
        session.usable_channel().await?.queue_delete(queue).await
    }

    pub async fn delete_exchange(&mut self, exchange: &str) -> Result<()> {
        let session = self.state.session()?;
        session
            .usable_channel()
            .await?
            .exchange_delete(exchange)
            .await
    }

    /// Bind `queue` to `exchange`, routed by the queue name.
    pub async fn bind_queue(&mut self, queue: &str, exchange: &str) -> Result<()> {
        let session = self.state.session()?;
        session
            .usable_channel()
            .await?
            .queue_bind(queue, exchange, queue)
            .await
    }

    /// Acknowledge a delivery received by one of this client's subscriptions,
    /// from outside its callback.
    ///
    /// A [`receive`](Self::receive) callback cannot borrow the client; it
    /// acknowledges through [`Delivery::ack`], which enforces the same
    /// once-per-delivery rule.
    pub async fn commit_ack(&self, delivery: &Delivery) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let channel_id = delivery.context.channel_id;
        let subscription = self
            .subscriptions
            .iter()
            .find(|subscription| subscription.channel.id() == channel_id)
            .ok_or(Error::InvalidChannel(channel_id))?;
        if subscription.channel.state() == ChannelState::Closed {
            return Err(Error::InvalidChannelState(ChannelState::Closed));
        }
        delivery.ack().await
    }

    /// Queue names as reported by the management API.
    pub async fn get_list_queues(&self, options: &ManagementOptions) -> Result<Vec<String>> {
        management::list_queues(options).await
    }

    fn queue_policy(&self) -> ResolvePolicy {
        self.config
            .queue_policy
            .unwrap_or(ResolvePolicy::AssertFirst)
    }
}

impl<C: Connector> Drop for AsyncClient<C> {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.task.abort();
        }
        if let Ok(session) = self.state.take() {
            close_in_background(session.into_connection());
        }
    }
}

fn close_in_background<Conn: BrokerConnection>(connection: Conn) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(err) = connection.close().await {
                    warn!(error=%err, "failed to close connection on drop");
                }
            });
        }
        Err(_) => warn!("dropped outside a tokio runtime, connection left to the broker"),
    }
}
