use crate::{Error, Result};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Transport side of an acknowledgement: sends `basic.ack` for one delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// Acknowledges exactly one delivery.
///
/// Clones share the same delivery: once any of them acknowledged it, further
/// calls fail with [`Error::InvalidAck`] without reaching the broker.
#[derive(Clone)]
pub struct Acker {
    inner: Arc<dyn Acknowledge>,
    used: Arc<AtomicBool>,
}

impl Acker {
    pub fn new<A: Acknowledge + 'static>(inner: A) -> Self {
        Self {
            inner: Arc::new(inner),
            used: Arc::default(),
        }
    }

    pub async fn ack(&self) -> Result<()> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidAck);
        }
        self.inner.ack().await
    }

    pub fn used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker").field("used", &self.used()).finish()
    }
}
