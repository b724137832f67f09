//! Subscription types for live query views.

use crate::query::EmitterKey;
use crate::types::StreamChunk;
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Configuration for the subscription engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Quiet period that closes a sort-reconciliation batch.
    /// Default: 50ms
    pub coalesce_window: Duration,

    /// Longest a batch may stay open after its first change.
    /// Default: 250ms
    pub max_coalesce_delay: Duration,

    /// Max unread live chunks per subscriber before it gets an `Error` and
    /// is dropped. The initial snapshot never counts. 0 means unbounded.
    /// Default: 1000
    pub subscriber_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(50),
            max_coalesce_delay: Duration::from_millis(250),
            subscriber_buffer: 1000,
        }
    }
}

/// Lifecycle of an emitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitterState {
    /// Built, waiting for its first subscriber.
    Unstarted,
    /// Running the initial snapshot.
    Initializing,
    /// Classifying live changes.
    Live,
    /// Finished; no further chunks.
    TornDown,
}

/// Handle to one subscriber's view of a live query.
pub struct LiveQuery {
    key: EmitterKey,
    receiver: Receiver<StreamChunk>,
}

impl LiveQuery {
    pub(crate) fn new(key: EmitterKey, receiver: Receiver<StreamChunk>) -> Self {
        Self { key, receiver }
    }

    /// Identity of the emitter backing this stream.
    pub fn key(&self) -> &EmitterKey {
        &self.key
    }

    /// Receive the next chunk (blocking). Errors once the stream has ended.
    pub fn recv(&self) -> Result<StreamChunk, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a chunk (non-blocking).
    pub fn try_recv(&self) -> Result<StreamChunk, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<StreamChunk, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Blocking iterator that ends with the stream.
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, StreamChunk> {
        self.receiver.iter()
    }

    pub fn receiver(&self) -> &Receiver<StreamChunk> {
        &self.receiver
    }
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("key", &self.key)
            .field("pending", &self.receiver.len())
            .finish()
    }
}
