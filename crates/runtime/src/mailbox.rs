//! Per-process message queue.

use std::collections::VecDeque;

use crate::copy::Message;

/// FIFO of pending messages.
///
/// Always accessed under the owning process's control lock, so delivery
/// order on this queue is the order senders acquired that lock. For any
/// single sender that is its program order.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: VecDeque<Message>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.queue.push_back(msg);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything queued, returning how many messages were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcValue;

    #[test]
    fn test_fifo_order() {
        let mut mailbox = Mailbox::new();
        for i in 0..5i64 {
            mailbox.push(Message::from(i));
        }
        assert_eq!(mailbox.len(), 5);

        let drained: Vec<GcValue> = std::iter::from_fn(|| mailbox.pop())
            .map(|m| m.root().clone())
            .collect();
        assert_eq!(drained, (0..5).map(GcValue::Int).collect::<Vec<_>>());
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_clear_reports_count() {
        let mut mailbox = Mailbox::new();
        mailbox.push(Message::from("a"));
        mailbox.push(Message::from("b"));
        assert_eq!(mailbox.clear(), 2);
        assert!(mailbox.pop().is_none());
    }
}
