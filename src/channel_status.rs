use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tracing::trace;

/// Shared view of a channel's state, updated by whoever observes the broker
/// closing it.
#[derive(Clone, Default)]
pub struct ChannelStatus(Arc<Mutex<Inner>>);

impl ChannelStatus {
    pub fn open(&self) -> bool {
        self.0.lock().state == ChannelState::Open
    }

    pub fn closed(&self) -> bool {
        self.0.lock().state == ChannelState::Closed
    }

    pub fn state(&self) -> ChannelState {
        self.0.lock().state
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        let mut inner = self.0.lock();
        if inner.state != state {
            trace!(from=?inner.state, to=?state, "channel state transition");
        }
        inner.state = state;
    }

    pub(crate) fn close(&self) {
        self.set_state(ChannelState::Closed);
    }
}

/// A channel is usable until the broker (or the client) closes it. A closed
/// channel never reopens; a new one has to be created on the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Open,
    Closed,
}

impl From<lapin::ChannelState> for ChannelState {
    fn from(state: lapin::ChannelState) -> Self {
        match state {
            lapin::ChannelState::Connected => ChannelState::Open,
            _ => ChannelState::Closed,
        }
    }
}

impl fmt::Debug for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ChannelStatus");
        if let Some(inner) = self.0.try_lock() {
            debug.field("state", &inner.state);
        }
        debug.finish()
    }
}

#[derive(Default)]
struct Inner {
    state: ChannelState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let status = ChannelStatus::default();
        let observer = status.clone();
        assert!(observer.open());
        status.close();
        assert!(observer.closed());
        assert_eq!(observer.state(), ChannelState::Closed);
    }

    #[test]
    fn only_connected_lapin_channels_are_open() {
        assert_eq!(
            ChannelState::from(lapin::ChannelState::Connected),
            ChannelState::Open
        );
        assert_eq!(
            ChannelState::from(lapin::ChannelState::Closing),
            ChannelState::Closed
        );
        assert_eq!(
            ChannelState::from(lapin::ChannelState::Error),
            ChannelState::Closed
        );
    }
}
