//! The thread-safe carrier for termination requests and progress messages.

use crate::message::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default message queue capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Thread-safe signal carrier between an executor and an observer.
///
/// Holds two independent pieces of state:
///
/// - a **termination flag**, set by a controller thread via
///   [`request_termination`](Self::request_termination) and polled by the
///   executor's watchdog hook;
/// - a **bounded message queue** of [`Message`]s, filled by the executor
///   and drained by the observer.
///
/// The executor side never blocks: setting the flag is a single atomic
/// store, and [`send`](Self::send) drops the oldest queued message rather
/// than waiting when the queue is full.
///
/// # Example
///
/// ```
/// use opseq_comm::{CommChannel, Message, MessageKind};
/// use std::sync::Arc;
///
/// let channel = Arc::new(CommChannel::new(16));
///
/// channel.send(Message::sequence(MessageKind::SequenceStarted, "go"));
/// assert_eq!(
///     channel.try_recv().map(|m| m.kind),
///     Some(MessageKind::SequenceStarted),
/// );
///
/// assert!(!channel.is_termination_requested());
/// channel.request_termination();
/// channel.request_termination(); // idempotent
/// assert!(channel.is_termination_requested());
/// ```
#[derive(Debug)]
pub struct CommChannel {
    terminate_requested: AtomicBool,
    queue: Mutex<VecDeque<Message>>,
    ready: Condvar,
    capacity: usize,
}

impl CommChannel {
    /// Creates a channel whose queue holds at most `capacity` messages.
    ///
    /// A zero capacity is bumped to 1 so that [`send`](Self::send) always
    /// retains the newest message.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            terminate_requested: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Requests cooperative termination of the running sequence.
    ///
    /// Idempotent and lock-free. The executor observes the flag at its
    /// next watchdog tick; once observed, the script does not resume.
    pub fn request_termination(&self) {
        self.terminate_requested.store(true, Ordering::Release);
    }

    /// Returns whether termination has been requested.
    #[must_use]
    pub fn is_termination_requested(&self) -> bool {
        self.terminate_requested.load(Ordering::Acquire)
    }

    /// Clears the termination flag, readying the channel for reuse.
    ///
    /// Call only between executions; the executor never clears the flag
    /// itself.
    pub fn reset_termination(&self) {
        self.terminate_requested.store(false, Ordering::Release);
    }

    /// Enqueues a message without ever blocking the sender.
    ///
    /// When the queue is at capacity the oldest message is dropped to
    /// make room, so an absent observer costs the executor nothing but
    /// the newest `capacity` messages are always retained.
    pub fn send(&self, message: Message) {
        let mut queue = self.queue.lock();
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(message);
        self.ready.notify_one();
    }

    /// Removes and returns the oldest queued message, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    /// Blocks until a message is available and returns it.
    #[must_use]
    pub fn recv(&self) -> Message {
        let mut queue = self.queue.lock();
        loop {
            if let Some(message) = queue.pop_front() {
                return message;
            }
            self.ready.wait(&mut queue);
        }
    }

    /// Blocks up to `timeout` for a message.
    ///
    /// Returns `None` if the timeout elapses with the queue still empty.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            if self.ready.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    /// Returns the number of currently queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns `true` if no messages are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Default for CommChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
