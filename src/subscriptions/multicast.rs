//! Lazy-connect multicast: one upstream, many subscribers.
//!
//! The first subscriber triggers the upstream connection (the initial
//! snapshot). Later subscribers are sent a replay of the current snapshot
//! before they join the live tail, so every subscriber sees a complete
//! `Initial … EndOfInitial` sequence before any live chunk.

use crate::types::StreamChunk;
use crossbeam_channel::Sender;
use tracing::warn;

/// What the owner must do after [`LazyConnect::attach`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attach {
    /// First subscriber while idle: run the initial snapshot now.
    Connect,
    /// Already connected: the subscriber was sent the replay and is live.
    Joined,
    /// The subscriber went away during replay.
    Dropped,
}

/// One attached subscriber.
#[derive(Debug)]
struct Subscriber {
    sender: Sender<StreamChunk>,
    /// Chunks sent so far.
    sent: usize,
    /// Leading chunks that belong to its snapshot.
    snapshot: usize,
}

impl Subscriber {
    fn new(sender: Sender<StreamChunk>) -> Self {
        Self {
            sender,
            sent: 0,
            snapshot: 0,
        }
    }

    fn send_snapshot(&mut self, chunk: StreamChunk) -> bool {
        if self.sender.send(chunk).is_err() {
            return false;
        }
        self.sent += 1;
        self.snapshot += 1;
        true
    }

    /// Unread live chunks. Snapshot chunks come first on the channel, so
    /// whatever has been read is taken off the snapshot before the tail.
    fn backlog(&self) -> usize {
        let unread = self.sender.len();
        let read = self.sent.saturating_sub(unread);
        let unread_snapshot = self.snapshot.saturating_sub(read);
        unread.saturating_sub(unread_snapshot)
    }
}

/// Subscriber set for one emitter.
///
/// Snapshot chunks (the initial burst and replays) are always delivered.
/// Live chunks are only delivered while a subscriber's unread backlog stays
/// under `max_backlog`; past that it gets an `Error` and is detached.
#[derive(Debug, Default)]
pub struct LazyConnect {
    connected: bool,
    /// 0 = no limit.
    max_backlog: usize,
    subscribers: Vec<Subscriber>,
}

impl LazyConnect {
    pub fn new(max_backlog: usize) -> Self {
        Self {
            max_backlog,
            ..Self::default()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Add a subscriber. `sender` should be unbounded; the backlog limit is
    /// enforced here.
    ///
    /// `replay` is only called when already connected; its chunks go to the
    /// new subscriber alone, ahead of anything published afterwards.
    pub fn attach<F>(&mut self, sender: Sender<StreamChunk>, replay: F) -> Attach
    where
        F: FnOnce() -> Vec<StreamChunk>,
    {
        let mut subscriber = Subscriber::new(sender);
        if !self.connected {
            self.connected = true;
            self.subscribers.push(subscriber);
            return Attach::Connect;
        }

        for chunk in replay() {
            if !subscriber.send_snapshot(chunk) {
                warn!("subscriber went away during snapshot replay");
                return Attach::Dropped;
            }
        }
        self.subscribers.push(subscriber);
        Attach::Joined
    }

    /// Send a snapshot chunk to every subscriber, regardless of backlog.
    pub fn deliver(&mut self, chunk: &StreamChunk) -> usize {
        self.subscribers
            .retain_mut(|sub| sub.send_snapshot(chunk.clone()));
        self.subscribers.len()
    }

    /// Send a live chunk to every subscriber. Subscribers that are gone are
    /// removed; subscribers over their backlog get an `Error` and are
    /// removed. Returns how many received the chunk.
    pub fn publish(&mut self, chunk: &StreamChunk) -> usize {
        let max_backlog = self.max_backlog;
        let before = self.subscribers.len();
        self.subscribers.retain_mut(|sub| {
            if max_backlog > 0 && sub.backlog() >= max_backlog {
                let _ = sub.sender.send(StreamChunk::Error {
                    message: format!(
                        "subscriber fell more than {} chunks behind; stream closed",
                        max_backlog
                    ),
                });
                return false;
            }
            if sub.sender.send(chunk.clone()).is_err() {
                return false;
            }
            sub.sent += 1;
            true
        });
        let dropped = before - self.subscribers.len();
        if dropped > 0 {
            warn!(dropped, kind = chunk.kind(), "dropped slow or closed subscribers");
        }
        self.subscribers.len()
    }

    /// Connection failed: tell the current subscribers, detach them, and go
    /// back to idle so the next subscriber retries.
    pub fn fail(&mut self, message: &str) {
        let error = StreamChunk::Error {
            message: message.to_string(),
        };
        for sub in self.subscribers.drain(..) {
            let _ = sub.sender.send(error.clone());
        }
        self.connected = false;
    }

    /// End every stream. Dropping the senders closes the channels.
    pub fn close(&mut self) {
        self.subscribers.clear();
        self.connected = false;
    }
}
