//! The document store the engine consumes.
//!
//! The engine needs two things from a store: an aggregation
//! (match → sort → skip → limit → project) and a per-collection change feed.
//! [`MemoryStore`] implements both in process.

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::query::{compare_documents, Filter, QueryOptions, SortSpec};
use crate::types::{Document, RawChange};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;

/// A source of documents and their changes.
pub trait DocumentStore: Send + Sync + 'static {
    /// Run `pipeline` against `collection` and return the documents in order.
    fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>>;

    /// Open a live change feed on `collection`.
    fn watch(&self, collection: &str) -> Result<ChangeFeed>;
}

/// An aggregation: match → sort → skip → limit → project.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pipeline {
    pub filter: Option<Filter>,
    pub sort: Vec<SortSpec>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub projection: Option<Vec<String>>,
}

impl Pipeline {
    /// The pipeline that produces the full view of `options`.
    pub fn from_options(options: &QueryOptions) -> Result<Self> {
        Ok(Self {
            filter: options.parsed_filter()?,
            sort: options.sort.clone(),
            skip: options.skip_count(),
            limit: options.limit_count(),
            projection: options.projection.clone(),
        })
    }

    /// Same match/sort/projection, different window.
    pub fn window(&self, skip: usize, limit: Option<usize>) -> Self {
        Self {
            skip,
            limit,
            ..self.clone()
        }
    }

    /// Evaluate over documents given in natural order.
    ///
    /// Reference semantics for in-process stores.
    pub fn run<'a, I>(&self, docs: I) -> Vec<Document>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut matched: Vec<&Document> = docs
            .into_iter()
            .filter(|d| self.filter.as_ref().map_or(true, |f| f.matches(d)))
            .collect();

        if !self.sort.is_empty() {
            matched.sort_by(|a, b| compare_documents(a, b, &self.sort));
        }

        let limit = self.limit.unwrap_or(usize::MAX);
        matched
            .into_iter()
            .skip(self.skip)
            .take(limit)
            .map(|d| match &self.projection {
                Some(fields) => d.project(fields),
                None => d.clone(),
            })
            .collect()
    }
}

/// Event delivered by a change feed.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    Change(RawChange),
    /// The feed failed; no further events follow.
    Error(String),
}

/// A live change feed for one collection. Dropping it closes the feed.
pub struct ChangeFeed {
    collection: String,
    receiver: Receiver<FeedEvent>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl ChangeFeed {
    /// Create a feed and the sender a store publishes into.
    pub fn channel(collection: &str) -> (Sender<FeedEvent>, ChangeFeed) {
        let (sender, receiver) = unbounded();
        (sender, ChangeFeed::new(collection, receiver))
    }

    pub fn new(collection: &str, receiver: Receiver<FeedEvent>) -> Self {
        Self {
            collection: collection.to_string(),
            receiver,
            on_close: None,
        }
    }

    /// Run `f` when the feed is dropped.
    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn receiver(&self) -> &Receiver<FeedEvent> {
        &self.receiver
    }
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("collection", &self.collection)
            .field("pending", &self.receiver.len())
            .finish()
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}
