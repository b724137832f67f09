//! Emitter: one collection's change feed turned into one query's live view.
//!
//! Each emitter owns a worker thread. Everything the worker touches
//! (membership, the coalescing buffer, the subscriber set) is owned by that
//! thread, so classification never races with emission and no locking is
//! needed across emitters.

use super::coalesce::Coalescer;
use super::multicast::{Attach, LazyConnect};
use super::types::{EmitterState, EngineConfig};
use crate::error::{LiveError, Result};
use crate::query::{EmitterKey, Filter, QueryOptions};
use crate::reconcile::reconcile;
use crate::store::{DocumentStore, FeedEvent, Pipeline};
use crate::types::{Document, DocumentId, OperationType, RawChange, StreamChunk};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, error, trace, warn};

/// Messages handled by an emitter's worker.
pub enum Command {
    /// A new subscriber.
    Subscribe(Sender<StreamChunk>),
    /// An event from the collection's change feed.
    Feed(FeedEvent),
    /// Report current membership, in view order.
    Inspect(Sender<Vec<DocumentId>>),
    Shutdown,
}

/// Handle to a running emitter, owned by the registry.
pub struct Emitter {
    id: u64,
    key: EmitterKey,
    inbox: Sender<Command>,
    state: Arc<RwLock<EmitterState>>,
    worker: Option<JoinHandle<()>>,
}

impl Emitter {
    /// Build an emitter and start its worker. Nothing is queried until the
    /// first subscriber arrives.
    pub fn spawn(
        id: u64,
        key: EmitterKey,
        options: QueryOptions,
        store: Arc<dyn DocumentStore>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let filter = options.parsed_filter()?;
        let pipeline = Pipeline::from_options(&options)?;
        let (inbox, commands) = unbounded();
        let state = Arc::new(RwLock::new(EmitterState::Unstarted));

        let worker = Worker {
            key: key.clone(),
            options,
            filter,
            pipeline,
            store,
            commands,
            state: Arc::clone(&state),
            multicast: LazyConnect::new(config.subscriber_buffer),
            membership: Membership::default(),
            confirmed: Vec::new(),
            buffer: Coalescer::new(config.coalesce_window, config.max_coalesce_delay),
        };

        let handle = std::thread::Builder::new()
            .name(format!("emitter-{}", key.fingerprint()))
            .spawn(move || worker.run())?;

        debug!(emitter = id, key = ?key, "emitter spawned");
        Ok(Self {
            id,
            key,
            inbox,
            state,
            worker: Some(handle),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &EmitterKey {
        &self.key
    }

    /// Sender for feed events into this emitter.
    pub fn inbox(&self) -> Sender<Command> {
        self.inbox.clone()
    }

    pub fn state(&self) -> EmitterState {
        *self.state.read()
    }

    pub fn is_alive(&self) -> bool {
        self.state() != EmitterState::TornDown
    }

    /// Attach a subscriber and return its chunk stream.
    ///
    /// The backlog limit from [`EngineConfig::subscriber_buffer`] applies to
    /// live chunks only.
    pub fn subscribe(&self) -> Result<Receiver<StreamChunk>> {
        let (sender, receiver) = unbounded();
        self.inbox
            .send(Command::Subscribe(sender))
            .map_err(|_| LiveError::FeedClosed(self.key.collection().to_string()))?;
        Ok(receiver)
    }

    /// Current membership in view order, or None if the worker is gone.
    pub fn membership(&self, timeout: Duration) -> Option<Vec<DocumentId>> {
        let (tx, rx) = bounded(1);
        self.inbox.send(Command::Inspect(tx)).ok()?;
        rx.recv_timeout(timeout).ok()
    }

    /// Stop the worker and end every subscriber stream. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.inbox.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(emitter = self.id, "emitter worker panicked");
            }
            debug!(emitter = self.id, key = ?self.key, "emitter torn down");
        }
        *self.state.write() = EmitterState::TornDown;
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Ids currently in view, in provisional view order, with the latest
/// document emitted for each.
#[derive(Debug, Default)]
struct Membership {
    order: Vec<DocumentId>,
    docs: HashMap<DocumentId, Document>,
}

impl Membership {
    fn contains(&self, id: &DocumentId) -> bool {
        self.docs.contains_key(id)
    }

    fn len(&self) -> usize {
        self.docs.len()
    }

    /// Add or refresh a document. New ids go to `position` (or the back).
    fn upsert(&mut self, doc: Document, position: Option<usize>) {
        if !self.docs.contains_key(doc.id()) {
            let at = position.unwrap_or(self.order.len()).min(self.order.len());
            self.order.insert(at, doc.id().clone());
        }
        self.docs.insert(doc.id().clone(), doc);
    }

    fn remove(&mut self, id: &DocumentId) -> bool {
        if self.docs.remove(id).is_some() {
            self.order.retain(|x| x != id);
            true
        } else {
            false
        }
    }

    fn reorder(&mut self, sequence: &[DocumentId]) {
        self.order = sequence
            .iter()
            .filter(|id| self.docs.contains_key(*id))
            .cloned()
            .collect();
    }

    fn clear(&mut self) {
        self.order.clear();
        self.docs.clear();
    }

    /// Initial chunks for the current view, as replayed to late subscribers.
    fn snapshot(&self) -> Vec<StreamChunk> {
        let mut chunks: Vec<StreamChunk> = self
            .order
            .iter()
            .filter_map(|id| self.docs.get(id))
            .map(|doc| StreamChunk::Initial {
                document: doc.clone(),
            })
            .collect();
        chunks.push(StreamChunk::EndOfInitial);
        chunks
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Worker {
    key: EmitterKey,
    options: QueryOptions,
    filter: Option<Filter>,
    pipeline: Pipeline,
    store: Arc<dyn DocumentStore>,
    commands: Receiver<Command>,
    state: Arc<RwLock<EmitterState>>,
    multicast: LazyConnect,
    membership: Membership,
    /// Order returned by the last authoritative query.
    confirmed: Vec<DocumentId>,
    /// Order-affecting changes awaiting reconciliation.
    buffer: Coalescer<RawChange>,
}

impl Worker {
    fn run(mut self) {
        let span = debug_span!("emitter", key = %self.key.fingerprint());
        let _enter = span.enter();

        loop {
            let next = match self.buffer.deadline() {
                Some(deadline) => match self.commands.recv_deadline(deadline) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.commands.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                },
            };

            let flow = match next {
                Some(cmd) => self.handle(cmd),
                None => Flow::Continue,
            };
            if flow == Flow::Stop {
                break;
            }

            if self.buffer.is_due(Instant::now()) && self.reconcile_order() == Flow::Stop {
                break;
            }
        }
        // Drop tears down.
    }

    fn state(&self) -> EmitterState {
        *self.state.read()
    }

    fn set_state(&self, state: EmitterState) {
        *self.state.write() = state;
    }

    fn collection(&self) -> &str {
        self.key.collection()
    }

    fn handle(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Subscribe(sender) => {
                self.subscribe(sender);
                Flow::Continue
            }
            Command::Feed(FeedEvent::Change(change)) => {
                if self.state() != EmitterState::Live {
                    trace!(op = ?change.operation_type, "ignoring change before initial sync");
                    return Flow::Continue;
                }
                self.on_change(change)
            }
            Command::Feed(FeedEvent::Error(message)) => {
                self.fail(&format!("change feed failed: {}", message));
                Flow::Stop
            }
            Command::Inspect(reply) => {
                let _ = reply.send(self.membership.order.clone());
                Flow::Continue
            }
            Command::Shutdown => Flow::Stop,
        }
    }

    fn tear_down(&mut self) {
        // Mark dead first: once a stream ends the registry must see it.
        self.set_state(EmitterState::TornDown);
        self.multicast.close();
        self.membership.clear();
        self.buffer.clear();
    }
    /// Terminal failure: every subscriber gets an error, then the streams end.
    fn fail(&mut self, message: &str) {
        error!(%message, "emitter failed");
        self.multicast.publish(&StreamChunk::Error {
            message: message.to_string(),
        });
        self.tear_down();
    }

    // --- Subscribers ---

    fn subscribe(&mut self, sender: Sender<StreamChunk>) {
        let membership = &self.membership;
        match self.multicast.attach(sender, || membership.snapshot()) {
            Attach::Connect => self.connect(),
            Attach::Joined => {
                debug!(subscribers = self.multicast.subscriber_count(), "late subscriber joined")
            }
            Attach::Dropped => {}
        }
    }

    /// Run the initial snapshot and go live.
    fn connect(&mut self) {
        self.set_state(EmitterState::Initializing);

        match self.store.aggregate(self.collection(), &self.pipeline) {
            Ok(docs) => {
                self.confirmed = docs.iter().map(|d| d.id().clone()).collect();
                for document in docs {
                    self.emit_snapshot(StreamChunk::Initial { document });
                }
                self.emit_snapshot(StreamChunk::EndOfInitial);
                self.set_state(EmitterState::Live);
                debug!(members = self.membership.len(), "initial sync complete");
            }
            Err(e) => {
                warn!(error = %e, "initial snapshot failed");
                self.multicast.fail(&format!("initial snapshot failed: {}", e));
                self.membership.clear();
                self.confirmed.clear();
                self.set_state(EmitterState::Unstarted);
            }
        }
    }

    // --- Emission ---

    /// Apply a chunk to membership, then send it to every subscriber.
    fn emit(&mut self, chunk: StreamChunk) {
        self.record(&chunk, None);
        self.multicast.publish(&chunk);
    }

    /// Emit part of the initial snapshot; never subject to the backlog limit.
    fn emit_snapshot(&mut self, chunk: StreamChunk) {
        self.record(&chunk, None);
        self.multicast.deliver(&chunk);
    }

    /// Emit an admission at a specific provisional position.
    fn emit_at(&mut self, chunk: StreamChunk, position: usize) {
        self.record(&chunk, Some(position));
        self.multicast.publish(&chunk);
    }

    fn record(&mut self, chunk: &StreamChunk, position: Option<usize>) {
        match chunk {
            StreamChunk::Initial { document }
            | StreamChunk::Insert { document }
            | StreamChunk::Update { document }
            | StreamChunk::Replace { document } => {
                self.membership.upsert(document.clone(), position);
            }
            StreamChunk::Delete { key } | StreamChunk::Expunge { key } => {
                self.membership.remove(key);
            }
            StreamChunk::Order { sequence, .. } => self.membership.reorder(sequence),
            StreamChunk::EndOfInitial | StreamChunk::Error { .. } => {}
        }
    }

    /// Apply the projection to an outgoing document.
    fn shape(&self, doc: Document) -> Document {
        match &self.options.projection {
            Some(fields) => doc.project(fields),
            None => doc,
        }
    }

    // --- Classification ---

    fn has_sort(&self) -> bool {
        !self.options.sort.is_empty()
    }

    /// Sorted or offset views: any change can shift which ids are in the
    /// window, so the store decides after each batch.
    fn windowed(&self) -> bool {
        self.has_sort() || self.options.skip_count() > 0
    }

    fn passes_filter(&self, doc: &Document) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(doc))
    }

    fn saturated(&self) -> bool {
        self.options
            .limit_count()
            .is_some_and(|limit| self.membership.len() >= limit)
    }

    /// A newcomer can only be placed with a correct rank.
    fn needs_rank_for_newcomer(&self) -> bool {
        self.saturated() || self.options.skip_count() > 0
    }

    fn sort_relevant(&self, change: &RawChange) -> bool {
        match change.operation_type {
            OperationType::Update => change
                .update_description
                .as_ref()
                .map_or(true, |d| d.touched_paths().any(|p| self.options.sort_touches(p))),
            _ => true,
        }
    }

    fn defer(&mut self, change: RawChange) {
        trace!(op = ?change.operation_type, "deferred to reconciliation");
        self.buffer.push(change, Instant::now());
    }

    fn on_change(&mut self, change: RawChange) -> Flow {
        match change.operation_type {
            OperationType::Insert => self.on_insert(change),
            OperationType::Delete => self.on_delete(change),
            OperationType::Update | OperationType::Replace => self.on_update(change),
            OperationType::Drop => {
                debug!("collection dropped");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn on_insert(&mut self, change: RawChange) {
        let Some(doc) = change.full_document.as_ref() else {
            return;
        };
        if !self.passes_filter(doc) {
            return;
        }
        if self.windowed() {
            self.defer(change);
            return;
        }
        if self.saturated() || self.membership.contains(doc.id()) {
            return;
        }
        let document = self.shape(doc.clone());
        self.emit(StreamChunk::Insert { document });
    }

    fn on_delete(&mut self, change: RawChange) {
        let Some(id) = change.document_id().cloned() else {
            return;
        };
        if self.membership.contains(&id) {
            self.emit(StreamChunk::Delete { key: id });
            self.backfill();
        }
        if self.windowed() {
            self.defer(change);
        }
    }

    fn on_update(&mut self, change: RawChange) {
        let Some(id) = change.document_id().cloned() else {
            return;
        };
        let Some(doc) = change.full_document.clone() else {
            // Deleted right after the update; the delete event follows.
            trace!(id = %id, "update without post-image ignored");
            return;
        };
        let is_member = self.membership.contains(&id);

        if self.passes_filter(&doc) {
            if !is_member && self.needs_rank_for_newcomer() {
                self.defer(change);
                return;
            }
            let document = self.shape(doc);
            let chunk = match change.operation_type {
                OperationType::Replace => StreamChunk::Replace { document },
                _ => StreamChunk::Update { document },
            };
            self.emit(chunk);
            if self.has_sort() && (!is_member || self.sort_relevant(&change)) {
                self.defer(change);
            }
        } else if is_member {
            self.emit(StreamChunk::Expunge { key: id });
            self.backfill();
            if self.windowed() {
                self.defer(change);
            }
        } else if self.options.skip_count() > 0 {
            // Leaving the filter ahead of the window shifts it.
            self.defer(change);
        }
    }

    /// Refill one slot after a member left a bounded view.
    fn backfill(&mut self) {
        let Some(limit) = self.options.limit_count() else {
            return;
        };
        let members = self.membership.len();
        if members >= limit {
            return;
        }

        let window = self.pipeline.window(
            self.options.skip_count().saturating_add(members),
            Some(limit - members),
        );
        match self.store.aggregate(self.collection(), &window) {
            Ok(docs) => {
                let next = docs
                    .into_iter()
                    .find(|d| !self.membership.contains(d.id()));
                if let Some(document) = next {
                    trace!(id = %document.id(), "backfilled");
                    self.emit(StreamChunk::Initial { document });
                }
            }
            Err(e) => {
                warn!(error = %e, "backfill failed");
                self.multicast.publish(&StreamChunk::Error {
                    message: format!("backfill failed: {}", e),
                });
            }
        }
    }

    // --- Sort reconciliation ---

    /// Drain the coalescing buffer and bring the view in line with the store.
    fn reconcile_order(&mut self) -> Flow {
        let changes = self.buffer.drain();
        if changes.is_empty() || self.state() != EmitterState::Live {
            return Flow::Continue;
        }

        // Optimistic inserts ahead of the authoritative query. With an
        // offset the window start is unknown, so only the query decides.
        let optimistic = self.options.skip_count() == 0;
        let mut seen = HashSet::new();
        let mut inserts: Vec<Document> = changes
            .iter()
            .filter(|c| optimistic && c.operation_type == OperationType::Insert)
            .filter_map(|c| c.full_document.clone())
            .filter(|d| self.passes_filter(d) && !self.membership.contains(d.id()))
            .filter(|d| seen.insert(d.id().clone()))
            .collect();
        let id_desc = self.options.sorts_by_id_desc();
        if id_desc {
            inserts.reverse();
        }
        for (i, doc) in inserts.into_iter().enumerate() {
            let document = self.shape(doc);
            if id_desc {
                self.emit_at(StreamChunk::Insert { document }, i);
            } else {
                self.emit(StreamChunk::Insert { document });
            }
        }

        let fresh = match self.store.aggregate(self.collection(), &self.pipeline) {
            Ok(docs) => docs,
            Err(e) => {
                self.fail(&format!("reconciliation failed: {}", e));
                return Flow::Stop;
            }
        };
        let fresh_ids: Vec<DocumentId> = fresh.iter().map(|d| d.id().clone()).collect();
        let fresh_set: HashSet<&DocumentId> = fresh_ids.iter().collect();

        let evicted: Vec<DocumentId> = self
            .membership
            .order
            .iter()
            .filter(|id| !fresh_set.contains(id))
            .cloned()
            .collect();
        for key in evicted {
            self.emit(StreamChunk::Expunge { key });
        }
        for document in fresh {
            if !self.membership.contains(document.id()) {
                self.emit(StreamChunk::Insert { document });
            }
        }

        let provisional = self.membership.order.clone();
        if provisional != fresh_ids || self.confirmed != fresh_ids {
            let result = reconcile(&provisional, &fresh_ids);
            debug!(
                batch = changes.len(),
                distance = result.distance,
                members = fresh_ids.len(),
                "order reconciled"
            );
            self.emit(StreamChunk::Order {
                sequence: fresh_ids.clone(),
                moves: result.moves,
            });
        }
        self.confirmed = fresh_ids;
        Flow::Continue
    }
}

impl Drop for Worker {
    /// Also runs on unwind: a panicking worker ends its streams with an
    /// `Error` and is marked torn down.
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("emitter worker panicked");
            self.multicast.fail("emitter worker panicked");
        }
        self.tear_down();
    }
}
