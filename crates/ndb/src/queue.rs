//! Bounded event queue between sources and the engine.
//!
//! Sources and API callers put [`Message`]s on the queue; the engine is the
//! only consumer. Control messages (flush, mark-failed, sync barriers, read
//! lock) ride the same channel so they are processed in order with the
//! events that precede them. The shutdown poison pill bypasses the channel:
//! the receiver checks it before every dequeue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, mpsc};

use crate::engine::Command;
use crate::error::{Error, Result};
use crate::event::Event;

/// Control messages handled by the engine itself.
#[derive(Debug)]
pub enum Control {
    /// Stop the engine. Delivered through [`EventQueue::shutdown`].
    Shutdown,
    /// Barrier: wake `notify` once everything queued before it is loaded.
    Sync {
        /// Target the barrier belongs to (for logging).
        target: String,
        /// Signal to wake.
        notify: Arc<Notify>,
    },
    /// Drop every row of a target.
    Flush(String),
    /// Mark every row of a target as failed.
    MarkFailed(String),
    /// Close the read gate while a target restarts.
    ReadLock(String),
    /// Reopen the read gate.
    ReadUnlock(String),
}

/// An item on the queue.
#[derive(Debug)]
pub enum Message {
    /// A batch of events from one source.
    Events {
        /// Originating source, if any.
        source: Option<String>,
        /// Events in arrival order.
        events: Vec<Event>,
    },
    /// Engine control.
    Control(Control),
    /// Store request from the API side.
    Request(Command),
}

/// Producer side of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

/// Consumer side of the queue, owned by the engine.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<Message>,
    shutdown: Arc<Notify>,
    stopped: bool,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shutdown = Arc::new(Notify::new());
        let queue = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: shutdown.clone(),
        };
        let receiver = EventReceiver {
            rx,
            shutdown,
            stopped: false,
        };
        (queue, receiver)
    }

    /// Put a message, waiting for room. Fails once the queue is shut down.
    pub async fn put(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Shutdown);
        }
        self.tx.send(msg).await.map_err(|_| Error::Shutdown)
    }

    /// Put a batch of events.
    pub async fn put_events(&self, source: Option<&str>, events: Vec<Event>) -> Result<()> {
        self.put(Message::Events {
            source: source.map(str::to_string),
            events,
        })
        .await
    }

    /// Put a control message.
    pub async fn put_control(&self, control: Control) -> Result<()> {
        self.put(Message::Control(control)).await
    }

    /// Put a message without waiting. Used from synchronous contexts (drop).
    pub fn try_put(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Shutdown);
        }
        self.tx
            .try_send(msg)
            .map_err(|e| Error::Transport(format!("queue: {e}")))
    }

    /// Deliver the poison pill. Later puts fail with [`Error::Shutdown`].
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }

    /// Check whether the queue is shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of messages waiting to be consumed.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl EventReceiver {
    /// Receive the next message.
    ///
    /// The shutdown signal wins over queued messages. Returns `None` once
    /// the shutdown was reported or every producer is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.stopped {
            return None;
        }
        let msg = tokio::select! {
            biased;
            _ = self.shutdown.notified() => Some(Message::Control(Control::Shutdown)),
            msg = self.rx.recv() => msg,
        };
        if matches!(msg, Some(Message::Control(Control::Shutdown)) | None) {
            self.stopped = true;
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RTM_NEWLINK;

    #[tokio::test]
    async fn test_fifo_and_depth() {
        let (queue, mut rx) = EventQueue::new(8);
        queue
            .put_events(Some("a"), vec![Event::new(RTM_NEWLINK).sequence(1)])
            .await
            .unwrap();
        queue
            .put_events(Some("a"), vec![Event::new(RTM_NEWLINK).sequence(2)])
            .await
            .unwrap();
        assert_eq!(queue.depth(), 2);

        for expected in [1, 2] {
            match rx.recv().await {
                Some(Message::Events { events, .. }) => {
                    assert_eq!(events[0].header.sequence, expected)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_bypasses_backlog() {
        let (queue, mut rx) = EventQueue::new(8);
        queue.put_events(None, vec![]).await.unwrap();
        queue.shutdown();

        assert!(matches!(
            rx.recv().await,
            Some(Message::Control(Control::Shutdown))
        ));
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            queue.put_events(None, vec![]).await,
            Err(Error::Shutdown)
        ));
    }
}
