use crate::{acker::Acker, payload::Payload, Error, Result};

/// Delivery mode message property, as carried by `basic.publish`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

impl DeliveryMode {
    pub fn from_amqp(mode: u8) -> Option<Self> {
        match mode {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }

    pub fn as_amqp(self) -> u8 {
        self as u8
    }
}

/// An outgoing message, routed by its routing key (the destination queue name).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub routing_key: String,
    pub data: Vec<u8>,
    /// `None` leaves the property unset, which the broker treats as transient.
    pub delivery_mode: Option<DeliveryMode>,
}

impl Message {
    pub fn new(routing_key: &str, data: Vec<u8>, delivery_mode: Option<DeliveryMode>) -> Self {
        Self {
            routing_key: routing_key.to_string(),
            data,
            delivery_mode,
        }
    }

    pub fn persistent(&self) -> bool {
        self.delivery_mode == Some(DeliveryMode::Persistent)
    }
}

/// What a consumer needs to acknowledge a delivery: the broker-assigned tag
/// and the channel it was delivered on.
#[derive(Clone, Debug)]
pub struct DeliveryContext {
    pub delivery_tag: u64,
    pub channel_id: u16,
    acker: Acker,
}

impl DeliveryContext {
    pub fn new(delivery_tag: u64, channel_id: u16, acker: Acker) -> Self {
        Self {
            delivery_tag,
            channel_id,
            acker,
        }
    }

    pub(crate) async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub fn acknowledged(&self) -> bool {
        self.acker.used()
    }
}

/// A message received by a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub context: DeliveryContext,

    /// Empty when the message went through the default exchange.
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub delivery_mode: Option<DeliveryMode>,
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn delivery_tag(&self) -> u64 {
        self.context.delivery_tag
    }

    /// Parse the body with the given payload codec.
    pub fn payload<P: Payload>(&self) -> Result<P> {
        let message =
            std::str::from_utf8(&self.data).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        P::from_message(message)
    }

    /// Acknowledge this delivery. Only meaningful when consuming without auto-ack.
    pub async fn ack(&self) -> Result<()> {
        self.context.ack().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acker::Acknowledge;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Acknowledge for Noop {
        async fn ack(&self) -> Result<()> {
            Ok(())
        }
    }

    fn delivery(data: &[u8]) -> Delivery {
        Delivery {
            context: DeliveryContext::new(1, 1, Acker::new(Noop)),
            exchange: String::new(),
            routing_key: "test".into(),
            redelivered: false,
            delivery_mode: None,
            data: data.to_vec(),
        }
    }

    #[test]
    fn delivery_mode_values() {
        assert_eq!(DeliveryMode::Persistent.as_amqp(), 2);
        assert_eq!(DeliveryMode::from_amqp(1), Some(DeliveryMode::Transient));
        assert_eq!(DeliveryMode::from_amqp(0), None);
    }

    #[test]
    fn payload_parses_utf8_bodies() {
        let body: String = delivery(b"hello").payload().unwrap();
        assert_eq!(body, "hello");
        assert!(matches!(
            delivery(&[0xff, 0xfe]).payload::<String>(),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn clones_share_the_acknowledgement() {
        let delivery = delivery(b"x");
        let copy = delivery.clone();
        async_global_executor::block_on(async {
            delivery.ack().await.unwrap();
            assert_eq!(copy.ack().await, Err(Error::InvalidAck));
        });
        assert!(copy.context.acknowledged());
    }
}
