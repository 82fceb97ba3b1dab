//! Fixed-capacity FIFO used for connection send queues and the bus's
//! self-send queue.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::protocol::Message;

/// A bounded FIFO of `Rc<Message>`. Push fails once `capacity` entries are
/// queued; pop returns `None` on an empty queue.
pub struct RingBuffer {
    messages: VecDeque<Rc<Message>>,
    capacity: usize,
}

impl RingBuffer {
    /// Create an empty ring buffer with the given fixed capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a message onto the tail. Fails with `NoSpaceLeft` if full,
    /// returning the message back to the caller so it can be unrefed.
    pub fn push(&mut self, message: Rc<Message>) -> Result<(), Rc<Message>> {
        if self.full() {
            return Err(message);
        }
        self.messages.push_back(message);
        Ok(())
    }

    /// Pop the head message, if any.
    pub fn pop(&mut self) -> Option<Rc<Message>> {
        self.messages.pop_front()
    }

    /// Peek the head message without removing it.
    pub fn peek(&self) -> Option<&Rc<Message>> {
        self.messages.front()
    }

    /// Whether the queue holds no messages.
    pub fn empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the queue is at capacity.
    pub fn full(&self) -> bool {
        self.messages.len() >= self.capacity
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Drain and drop every queued message (their `Rc`s are dropped,
    /// releasing the bus's hold on each).
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Header, DEFAULT_SECTOR_SIZE};

    fn message() -> Rc<Message> {
        Message::create_header_only(Header::default(), DEFAULT_SECTOR_SIZE)
    }

    #[test]
    fn push_pop_preserves_order() {
        let mut ring = RingBuffer::new(3);
        let (a, b, c) = (message(), message(), message());
        ring.push(Rc::clone(&a)).unwrap();
        ring.push(Rc::clone(&b)).unwrap();
        ring.push(Rc::clone(&c)).unwrap();

        assert!(Rc::ptr_eq(&ring.pop().unwrap(), &a));
        assert!(Rc::ptr_eq(&ring.pop().unwrap(), &b));
        assert!(Rc::ptr_eq(&ring.pop().unwrap(), &c));
        assert!(ring.pop().is_none());
    }

    #[test]
    fn push_fails_at_capacity_and_returns_message() {
        let mut ring = RingBuffer::new(1);
        ring.push(message()).unwrap();
        assert!(ring.full());

        let overflow = message();
        let rejected = ring.push(Rc::clone(&overflow)).unwrap_err();
        assert!(Rc::ptr_eq(&rejected, &overflow));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn peek_does_not_remove() {
        let mut ring = RingBuffer::new(2);
        let m = message();
        ring.push(Rc::clone(&m)).unwrap();
        assert!(Rc::ptr_eq(ring.peek().unwrap(), &m));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn empty_reports_correctly() {
        let mut ring = RingBuffer::new(2);
        assert!(ring.empty());
        ring.push(message()).unwrap();
        assert!(!ring.empty());
    }
}
