use std::fmt;

/// Integer types usable as channel ids, delivery tags or counters.
pub(crate) trait SequenceId: Copy + PartialEq + fmt::Debug {
    const ZERO: Self;

    fn successor(self) -> Self;
}

impl SequenceId for u16 {
    const ZERO: Self = 0;

    fn successor(self) -> Self {
        self.wrapping_add(1)
    }
}

impl SequenceId for u64 {
    const ZERO: Self = 0;

    fn successor(self) -> Self {
        self.wrapping_add(1)
    }
}

/// Hands out ids from 1 upwards, starting over at 1 after `max`.
///
/// Zero is never produced: AMQP reserves channel 0 for the connection and
/// numbers delivery tags from 1.
#[derive(Debug)]
pub(crate) struct IdSequence<T> {
    max: Option<T>,
    next: T,
}

impl<T: SequenceId> IdSequence<T> {
    pub(crate) fn new() -> Self {
        Self {
            max: None,
            next: T::ZERO,
        }
    }

    pub(crate) fn with_max(max: T) -> Self {
        Self {
            max: (max != T::ZERO).then_some(max),
            ..Self::new()
        }
    }

    pub(crate) fn next(&mut self) -> T {
        if self.next == T::ZERO {
            self.next = self.next.successor();
        }
        let id = self.next;
        self.next = if self.max == Some(id) {
            T::ZERO
        } else {
            id.successor()
        };
        id
    }
}
