//! Per-port reorder buffer for user messages.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::message::UserMessage;

/// First stamp a freshly created port expects and assigns.
pub const INITIAL_SEQUENCE_NUM: u64 = 1;

/// Sentinel stamp carried by a deferred proxy ack; never assigned to a
/// message.
pub const INVALID_SEQUENCE_NUM: u64 = u64::MAX;

/// Min-heap wrapper so [`BinaryHeap`] pops the lowest stamp first.
#[derive(Debug)]
struct Sequenced(UserMessage);

impl PartialEq for Sequenced {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence_num() == other.0.sequence_num()
    }
}

impl Eq for Sequenced {}

impl PartialOrd for Sequenced {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sequenced {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.sequence_num().cmp(&self.0.sequence_num())
    }
}

/// Buffers received messages until their stamps form a contiguous run.
///
/// The queue holds a cursor, `next_sequence_num`, naming the one stamp it is
/// willing to release next; everything else waits in the heap regardless of
/// arrival order. `has_next` reporting acts as an edge trigger for the
/// embedder's wakeups and is suppressed entirely while the queue is not
/// signalable (a port still riding inside an unread message must not wake
/// anyone).
#[derive(Debug)]
pub struct MessageQueue {
    heap: BinaryHeap<Sequenced>,
    next_sequence_num: u64,
    signalable: bool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::with_next_sequence_num(INITIAL_SEQUENCE_NUM)
    }

    pub fn with_next_sequence_num(next_sequence_num: u64) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence_num,
            signalable: true,
        }
    }

    /// The stamp of the next message this queue will release.
    pub fn next_sequence_num(&self) -> u64 {
        self.next_sequence_num
    }

    pub fn set_signalable(&mut self, signalable: bool) {
        self.signalable = signalable;
    }

    pub fn has_next_message(&self) -> bool {
        matches!(self.heap.peek(), Some(head) if head.0.sequence_num() == self.next_sequence_num)
    }

    /// Buffer a received message. Returns whether the head of the queue is
    /// now in order (always `false` while non-signalable).
    pub fn accept_message(&mut self, message: UserMessage) -> bool {
        debug_assert_ne!(message.sequence_num(), 0, "unstamped message queued");
        self.heap.push(Sequenced(message));
        self.signalable && self.has_next_message()
    }

    /// Release the head message if it is in order and the selector accepts it.
    pub fn next_message_if(
        &mut self,
        selector: Option<&dyn Fn(&UserMessage) -> bool>,
    ) -> Option<UserMessage> {
        if !self.has_next_message() {
            return None;
        }
        if let Some(selector) = selector {
            let head = &self.heap.peek()?.0;
            if !selector(head) {
                return None;
            }
        }
        let message = self.heap.pop()?.0;
        self.next_sequence_num += 1;
        Some(message)
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(sequence_num: u64) -> UserMessage {
        let mut message = UserMessage::new(format!("m{sequence_num}"));
        message.set_sequence_num(sequence_num);
        message
    }

    #[test]
    fn releases_in_stamp_order_regardless_of_arrival() {
        let mut queue = MessageQueue::new();
        assert!(!queue.accept_message(stamped(3)));
        assert!(!queue.accept_message(stamped(2)));
        assert!(queue.accept_message(stamped(1)));

        for expected in 1..=3u64 {
            let message = queue.next_message_if(None).expect("in-order message");
            assert_eq!(message.sequence_num(), expected);
        }
        assert!(queue.next_message_if(None).is_none());
        assert_eq!(queue.next_sequence_num(), 4);
    }

    #[test]
    fn holds_head_until_gap_fills() {
        let mut queue = MessageQueue::new();
        queue.accept_message(stamped(2));
        assert!(!queue.has_next_message());
        assert!(queue.next_message_if(None).is_none());

        queue.accept_message(stamped(1));
        assert!(queue.has_next_message());
        assert_eq!(queue.next_message_if(None).unwrap().sequence_num(), 1);
        assert_eq!(queue.next_message_if(None).unwrap().sequence_num(), 2);
    }

    #[test]
    fn selector_can_refuse_head() {
        let mut queue = MessageQueue::new();
        queue.accept_message(stamped(1));

        let refuse = |_: &UserMessage| false;
        assert!(queue.next_message_if(Some(&refuse)).is_none());
        assert_eq!(queue.next_sequence_num(), 1);

        let accept = |_: &UserMessage| true;
        assert_eq!(
            queue.next_message_if(Some(&accept)).unwrap().sequence_num(),
            1
        );
    }

    #[test]
    fn non_signalable_queue_never_reports_readiness() {
        let mut queue = MessageQueue::new();
        queue.set_signalable(false);
        assert!(!queue.accept_message(stamped(1)));
        // The message is still there; only the wakeup is suppressed.
        assert!(queue.has_next_message());

        queue.set_signalable(true);
        assert!(queue.accept_message(stamped(2)));
    }

    #[test]
    fn initial_cursor_can_start_mid_stream() {
        let mut queue = MessageQueue::with_next_sequence_num(5);
        assert!(!queue.accept_message(stamped(6)));
        assert!(queue.accept_message(stamped(5)));
        assert_eq!(queue.next_message_if(None).unwrap().sequence_num(), 5);
    }
}
