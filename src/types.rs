//! Core types for the live query engine.

use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field under which every document carries its identifier.
pub const ID_FIELD: &str = "_id";

/// Unique identifier for a document within a collection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        DocumentId(s)
    }
}

/// A JSON document. The body is always an object containing `_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Document {
    id: DocumentId,
    body: Map<String, Value>,
}

impl Document {
    /// Build a document from an id and a JSON object of fields.
    ///
    /// Non-object `fields` are discarded; any `_id` inside `fields` is
    /// overwritten by `id`.
    pub fn new(id: impl Into<DocumentId>, fields: Value) -> Self {
        let id = id.into();
        let mut body = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert(ID_FIELD.to_string(), Value::String(id.0.clone()));
        Self { id, body }
    }

    /// Parse a document from a JSON object carrying a string or numeric `_id`.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut body) = value else {
            return Err(LiveError::Serialization(
                "document must be a JSON object".to_string(),
            ));
        };
        let id = match body.get(ID_FIELD) {
            Some(Value::String(s)) => DocumentId(s.clone()),
            Some(Value::Number(n)) => DocumentId(n.to_string()),
            _ => {
                return Err(LiveError::Serialization(format!(
                    "document is missing a string `{}`",
                    ID_FIELD
                )))
            }
        };
        body.insert(ID_FIELD.to_string(), Value::String(id.0.clone()));
        Ok(Self { id, body })
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// The full body, including `_id`.
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Top-level field lookup.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// Keep only the named top-level fields (plus `_id`).
    pub fn project(&self, fields: &[String]) -> Document {
        let mut body = Map::new();
        for field in fields {
            if let Some(v) = self.body.get(field) {
                body.insert(field.clone(), v.clone());
            }
        }
        body.insert(ID_FIELD.to_string(), Value::String(self.id.0.clone()));
        Document {
            id: self.id.clone(),
            body,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

impl TryFrom<Value> for Document {
    type Error = LiveError;

    fn try_from(value: Value) -> Result<Self> {
        Document::from_value(value)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

/// Kind of mutation reported by a change feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    /// The whole collection was dropped.
    Drop,
}

/// Key of the document a change applies to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentKey {
    pub id: DocumentId,
}

/// Field-level description of an update.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Paths that were set, with their new values.
    pub updated_fields: Map<String, Value>,
    /// Paths that were removed.
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    /// All paths touched by this update.
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> {
        self.updated_fields
            .keys()
            .map(String::as_str)
            .chain(self.removed_fields.iter().map(String::as_str))
    }
}

/// A raw mutation event as produced by a change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    /// Feed-assigned event id (resume token).
    pub id: u64,
    pub operation_type: OperationType,
    /// Absent only for `drop`.
    pub document_key: Option<DocumentKey>,
    pub update_description: Option<UpdateDescription>,
    /// Post-image for insert/update/replace. `None` on update/replace means
    /// the document was deleted before the lookup happened.
    pub full_document: Option<Document>,
}

impl RawChange {
    /// Id of the affected document, if any.
    pub fn document_id(&self) -> Option<&DocumentId> {
        self.document_key.as_ref().map(|k| &k.id)
    }
}

/// A single reordering step: move `id` from index `from` to index `to`.
///
/// Moves are applied in sequence; each index refers to the list as it stands
/// after all previous moves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub id: DocumentId,
    pub from: usize,
    pub to: usize,
}

/// Chunks emitted on a live query stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    /// A document that is part of the initial (or backfilled) view.
    Initial { document: Document },
    /// All initial documents have been sent.
    EndOfInitial,
    /// A document entered the view.
    Insert { document: Document },
    /// A document in the view changed.
    Update { document: Document },
    /// A document in the view was replaced wholesale.
    Replace { document: Document },
    /// A document was deleted from the collection.
    Delete { key: DocumentId },
    /// A document still exists but left this view.
    Expunge { key: DocumentId },
    /// Authoritative order of the view. Supersedes provisional ordering.
    Order {
        sequence: Vec<DocumentId>,
        moves: Vec<Move>,
    },
    /// Stream failure.
    Error { message: String },
}

impl StreamChunk {
    /// Id of the document this chunk concerns, if any.
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            StreamChunk::Initial { document }
            | StreamChunk::Insert { document }
            | StreamChunk::Update { document }
            | StreamChunk::Replace { document } => Some(document.id()),
            StreamChunk::Delete { key } | StreamChunk::Expunge { key } => Some(key),
            _ => None,
        }
    }

    /// Short name of the chunk kind, for logs and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamChunk::Initial { .. } => "initial",
            StreamChunk::EndOfInitial => "end_of_initial",
            StreamChunk::Insert { .. } => "insert",
            StreamChunk::Update { .. } => "update",
            StreamChunk::Replace { .. } => "replace",
            StreamChunk::Delete { .. } => "delete",
            StreamChunk::Expunge { .. } => "expunge",
            StreamChunk::Order { .. } => "order",
            StreamChunk::Error { .. } => "error",
        }
    }
}
