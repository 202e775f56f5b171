use crate::{
    channel_status::ChannelState,
    configuration::ConnectionParameters,
    id_sequence::IdSequence,
    transport::{BrokerChannel, BrokerConnection, Connector},
    Error, Result,
};
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) type ConnectionOf<C> = <C as Connector>::Connection;
pub(crate) type ChannelOf<C> = <ConnectionOf<C> as BrokerConnection>::Channel;

/// Lifecycle of a client: `Unconnected -> Connected -> Disconnected`.
/// `Disconnected` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Connected,
    Disconnected,
}

/// The one connection and one channel a client owns.
pub(crate) struct Session<C: Connector> {
    connection: ConnectionOf<C>,
    channel: Arc<ChannelOf<C>>,
    consumer_tags: IdSequence<u64>,
}

impl<C: Connector> Session<C> {
    pub(crate) async fn open(connector: &C, parameters: &ConnectionParameters) -> Result<Self> {
        let connection = connector.connect(parameters).await?;
        let channel = connection.create_channel().await?;
        info!(host=%parameters.host, port=?parameters.port, vhost=%parameters.vhost, channel=channel.id(), "connected");
        Ok(Self {
            connection,
            channel: Arc::new(channel),
            consumer_tags: IdSequence::new(),
        })
    }

    pub(crate) fn channel(&self) -> &ChannelOf<C> {
        &self.channel
    }

    /// An extra channel on the same connection, owned by the caller.
    pub(crate) async fn open_channel(&self) -> Result<Arc<ChannelOf<C>>> {
        Ok(Arc::new(self.connection.create_channel().await?))
    }

    /// Replace the channel with a fresh one from the same connection.
    pub(crate) async fn reopen_channel(&mut self) -> Result<&ChannelOf<C>> {
        let previous = self.channel.id();
        self.channel = Arc::new(self.connection.create_channel().await?);
        debug!(previous, channel = self.channel.id(), "reopened channel");
        Ok(self.channel.as_ref())
    }

    /// The channel, reopened first if an earlier broker error closed it.
    pub(crate) async fn usable_channel(&mut self) -> Result<&ChannelOf<C>> {
        if self.channel.state() == ChannelState::Closed {
            self.reopen_channel().await
        } else {
            Ok(self.channel.as_ref())
        }
    }

    pub(crate) fn next_consumer_tag(&mut self) -> String {
        format!("terrier-{}-{}", self.channel.id(), self.consumer_tags.next())
    }

    pub(crate) fn into_connection(self) -> ConnectionOf<C> {
        self.connection
    }

    pub(crate) async fn close(self) -> Result<()> {
        self.connection.close().await?;
        info!("disconnected");
        Ok(())
    }
}

/// Client-side state machine wrapped around an optional [`Session`].
pub(crate) enum ClientState<C: Connector> {
    Unconnected,
    Connected(Session<C>),
    Disconnected,
}

impl<C: Connector> Default for ClientState<C> {
    fn default() -> Self {
        ClientState::Unconnected
    }
}

impl<C: Connector> ClientState<C> {
    pub(crate) fn state(&self) -> ConnectionState {
        match self {
            ClientState::Unconnected => ConnectionState::Unconnected,
            ClientState::Connected(_) => ConnectionState::Connected,
            ClientState::Disconnected => ConnectionState::Disconnected,
        }
    }

    pub(crate) fn ensure_unconnected(&self) -> Result<()> {
        match self {
            ClientState::Unconnected => Ok(()),
            ClientState::Connected(_) => Err(Error::AlreadyConnected),
            ClientState::Disconnected => Err(Error::NotConnected),
        }
    }

    pub(crate) fn session(&mut self) -> Result<&mut Session<C>> {
        match self {
            ClientState::Connected(session) => Ok(session),
            _ => Err(Error::NotConnected),
        }
    }

    /// Move to `Disconnected`, handing back the session if there was one.
    pub(crate) fn take(&mut self) -> Result<Session<C>> {
        match std::mem::replace(self, ClientState::Disconnected) {
            ClientState::Connected(session) => Ok(session),
            ClientState::Unconnected => {
                *self = ClientState::Unconnected;
                Err(Error::NotConnected)
            }
            ClientState::Disconnected => Err(Error::NotConnected),
        }
    }
}
