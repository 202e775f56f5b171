use std::borrow::Borrow;

/// The parameters a queue is declared with.
///
/// Declaring the same name with different flags than an existing queue is a
/// broker error (`PRECONDITION_FAILED`), not something the client resolves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueRef {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl QueueRef {
    pub fn new(name: &str, durable: bool, auto_delete: bool) -> Self {
        Self {
            name: name.to_string(),
            durable,
            auto_delete,
        }
    }
}

/// A queue as reported by the broker in `queue.declare-ok`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Queue {
    name: String,
    message_count: u32,
    consumer_count: u32,
}

impl Queue {
    pub fn new(name: String, message_count: u32, consumer_count: u32) -> Self {
        Self {
            name,
            message_count,
            consumer_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumer_count
    }
}

impl Borrow<str> for Queue {
    fn borrow(&self) -> &str {
        self.name.as_str()
    }
}

impl From<lapin::Queue> for Queue {
    fn from(queue: lapin::Queue) -> Self {
        Self::new(
            queue.name().as_str().to_string(),
            queue.message_count(),
            queue.consumer_count(),
        )
    }
}
