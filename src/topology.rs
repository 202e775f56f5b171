//! Make sure a queue or exchange is usable on the session's channel before
//! an operation touches it.
//!
//! Two policies exist:
//!
//! * [`ResolvePolicy::DeclareAlways`] issues an idempotent declare with the
//!   client's parameters every time. A no-op if an identical entity exists, a
//!   `PRECONDITION_FAILED` surfaced to the caller if a conflicting one does.
//! * [`ResolvePolicy::AssertFirst`] runs a passive declare first, so an entity
//!   created elsewhere with other flags is used as-is. When the passive check
//!   fails the broker closes the channel, so the resolver reopens it and falls
//!   back to a regular declare.

use crate::{
    channel_status::ChannelState,
    exchange::ExchangeRef,
    queue::{Queue, QueueRef},
    session::{ChannelOf, Session},
    transport::{BrokerChannel, Connector},
    Result,
};
use async_trait::async_trait;
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvePolicy {
    AssertFirst,
    DeclareAlways,
}

/// How an entity ended up usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The passive check found it.
    Existing,
    /// Declared up front under [`ResolvePolicy::DeclareAlways`].
    Declared,
    /// The passive check failed; declared after recovering the channel.
    Recovered,
}

/// The `ensure`/`declare` pair the resolver is parameterized by.
#[async_trait]
pub(crate) trait Declare<Ch: BrokerChannel>: Send + Sync {
    type Handle: Send;

    fn name(&self) -> &str;

    /// Passive check: fails if the entity does not exist.
    async fn ensure(&self, channel: &Ch) -> Result<Self::Handle>;

    async fn declare(&self, channel: &Ch) -> Result<Self::Handle>;
}

#[async_trait]
impl<Ch: BrokerChannel> Declare<Ch> for QueueRef {
    type Handle = Queue;

    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure(&self, channel: &Ch) -> Result<Queue> {
        channel.queue_declare(self, true).await
    }

    async fn declare(&self, channel: &Ch) -> Result<Queue> {
        channel.queue_declare(self, false).await
    }
}

#[async_trait]
impl<Ch: BrokerChannel> Declare<Ch> for ExchangeRef {
    type Handle = ();

    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure(&self, channel: &Ch) -> Result<()> {
        channel.exchange_declare(self, true).await
    }

    async fn declare(&self, channel: &Ch) -> Result<()> {
        channel.exchange_declare(self, false).await
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct TopologyResolver {
    policy: ResolvePolicy,
}

impl TopologyResolver {
    pub(crate) fn new(policy: ResolvePolicy) -> Self {
        Self { policy }
    }

    pub(crate) async fn resolve<C, E>(
        &self,
        session: &mut Session<C>,
        entity: &E,
    ) -> Result<(E::Handle, Resolution)>
    where
        C: Connector,
        E: Declare<ChannelOf<C>>,
    {
        let channel = session.usable_channel().await?;
        match self.policy {
            ResolvePolicy::DeclareAlways => {
                let handle = entity.declare(channel).await?;
                trace!(name = entity.name(), "declared");
                Ok((handle, Resolution::Declared))
            }
            ResolvePolicy::AssertFirst => match entity.ensure(channel).await {
                Ok(handle) => {
                    trace!(name = entity.name(), "exists");
                    Ok((handle, Resolution::Existing))
                }
                Err(err) if err.is_topology_conflict() => {
                    debug!(name = entity.name(), error=%err, "passive check failed, declaring");
                    let channel = if channel.state() == ChannelState::Closed {
                        session.reopen_channel().await?
                    } else {
                        warn!(name = entity.name(), "passive check failed on a channel still open");
                        session.channel()
                    };
                    let handle = entity.declare(channel).await?;
                    Ok((handle, Resolution::Recovered))
                }
                Err(err) => Err(err),
            },
        }
    }
}
