//! Byte-accounted message queues with quenching.
//!
//! Both per-session queues (incoming commands, outgoing messages) count
//! their payload bytes. Pushing always succeeds; crossing the quench
//! threshold upward sets the `quenched` flag, crossing back down clears
//! it, and both edges wake every waiter. The broker suspends receiving
//! while `incoming` is quenched; the commander defers popping new
//! commands while `outgoing` is quenched.

use std::{
    collections::VecDeque,
    pin::pin,
    sync::{Mutex, MutexGuard},
};

use conclave_proto::Message;
use tokio::sync::Notify;

/// Fixed per-message accounting overhead on top of the payload bytes.
const MSG_OVERHEAD: usize = 50;

/// Byte-accounted FIFO of protocol messages.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    /// Woken when a message arrives, the queue closes, or quench clears.
    changed: Notify,
    quench_at: usize,
}

struct Inner {
    queue: VecDeque<Message>,
    bytes: usize,
    quenched: bool,
    closed: bool,
}

fn account(msg: &Message) -> usize {
    msg.payload_len() + MSG_OVERHEAD
}

impl MessageQueue {
    /// Create a queue quenching above `quench_at` bytes.
    #[must_use]
    pub fn new(quench_at: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                bytes: 0,
                quenched: false,
                closed: false,
            }),
            changed: Notify::new(),
            quench_at,
        }
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Held only across queue manipulation; a poisoned lock means a
        // panic mid-push, unrecoverable for the session either way.
        self.inner.lock().expect("message queue mutex poisoned")
    }

    /// Append a message. Always succeeds; may set the quench flag.
    pub fn push(&self, msg: Message) {
        let mut inner = self.lock();
        inner.bytes += account(&msg);
        inner.queue.push_back(msg);
        if inner.bytes > self.quench_at && !inner.quenched {
            inner.quenched = true;
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    fn pop_locked(&self, inner: &mut Inner) -> Option<Message> {
        let msg = inner.queue.pop_front()?;
        inner.bytes -= account(&msg);
        if inner.quenched && inner.bytes <= self.quench_at {
            inner.quenched = false;
        }
        Some(msg)
    }

    /// Pop one message, waiting until one is available. `None` once the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(msg) = self.pop_locked(&mut inner) {
                    drop(inner);
                    self.changed.notify_waiters();
                    return Some(msg);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Pop one message without waiting.
    pub fn try_pop(&self) -> Option<Message> {
        let msg = {
            let mut inner = self.lock();
            self.pop_locked(&mut inner)
        };
        if msg.is_some() {
            self.changed.notify_waiters();
        }
        msg
    }

    /// Pop a batch: at least one message, then more while the running
    /// byte total stays under `max_bytes`. Waits for the first message;
    /// `None` once closed and drained.
    pub async fn pop_batch(&self, max_bytes: usize) -> Option<Vec<Message>> {
        let first = self.pop().await?;
        let mut total = account(&first);
        let mut batch = vec![first];

        {
            let mut inner = self.lock();
            while total < max_bytes {
                match self.pop_locked(&mut inner) {
                    Some(msg) => {
                        total += account(&msg);
                        batch.push(msg);
                    },
                    None => break,
                }
            }
        }
        self.changed.notify_waiters();
        Some(batch)
    }

    /// Drain whatever is queued right now.
    pub fn drain(&self) -> Vec<Message> {
        let drained: Vec<Message> = {
            let mut inner = self.lock();
            let msgs = inner.queue.drain(..).collect();
            inner.bytes = 0;
            inner.quenched = false;
            msgs
        };
        self.changed.notify_waiters();
        drained
    }

    /// True while the byte count sits above the quench threshold.
    pub fn is_quenched(&self) -> bool {
        self.lock().quenched
    }

    /// Wait until the queue is not quenched.
    pub async fn unquenched(&self) {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();
            if !self.lock().quenched {
                return;
            }
            notified.await;
        }
    }

    /// Close the queue: pending messages stay poppable, waiters wake.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// Queued byte count.
    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Queued message count.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use conclave_proto::types;

    use super::*;

    fn msg_of(payload_bytes: usize) -> Message {
        let mut msg = Message::new(types::RES_OK);
        msg.put_bin(&vec![0u8; payload_bytes]);
        msg
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = MessageQueue::new(1024);
        for i in 0..5u64 {
            let mut m = Message::new(types::RES_OK);
            m.id = i;
            q.push(m);
        }
        for i in 0..5u64 {
            assert_eq!(q.pop().await.unwrap().id, i);
        }
    }

    #[tokio::test]
    async fn quench_sets_on_upward_and_clears_on_downward_crossing() {
        let q = MessageQueue::new(1000);
        assert!(!q.is_quenched());

        q.push(msg_of(600));
        assert!(!q.is_quenched());
        q.push(msg_of(600));
        assert!(q.is_quenched());

        q.try_pop().unwrap();
        assert!(!q.is_quenched());
        assert!(q.try_pop().is_some());
        assert!(q.try_pop().is_none());
    }

    #[tokio::test]
    async fn pop_batch_respects_byte_cap() {
        let q = MessageQueue::new(usize::MAX);
        for _ in 0..10 {
            q.push(msg_of(100));
        }
        let batch = q.pop_batch(300).await.unwrap();
        // First message always pops; more follow while under the cap.
        assert!(batch.len() >= 2 && batch.len() < 10, "batch of {}", batch.len());
        assert_eq!(q.len(), 10 - batch.len());
    }

    #[tokio::test]
    async fn closed_queue_drains_then_ends() {
        let q = MessageQueue::new(1024);
        q.push(msg_of(1));
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn unquenched_wakes_when_flag_clears() {
        let q = std::sync::Arc::new(MessageQueue::new(100));
        q.push(msg_of(200));
        assert!(q.is_quenched());

        let waiter = {
            let q = std::sync::Arc::clone(&q);
            tokio::spawn(async move { q.unquenched().await })
        };
        tokio::task::yield_now().await;
        q.try_pop().unwrap();
        waiter.await.unwrap();
    }
}
