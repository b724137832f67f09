//! Query options and the canonical keys derived from them.

use super::filter::{compare_values, get_path, Filter};
use crate::error::{LiveError, Result};
use crate::types::{Document, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Sort direction for one field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One entry of an ordered sort specification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

/// Options of a live query. Immutable once an emitter is built from them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Mongo-style JSON filter (None = everything).
    #[serde(default)]
    pub filter: Option<Value>,

    /// Ordered sort keys; earlier entries take precedence.
    #[serde(default)]
    pub sort: Vec<SortSpec>,

    /// Number of leading results to skip.
    #[serde(default)]
    pub skip: Option<usize>,

    /// Maximum number of results in the view. `Some(0)` means unbounded.
    #[serde(default)]
    pub limit: Option<usize>,

    /// Top-level fields to keep in emitted documents (`_id` is always kept).
    #[serde(default)]
    pub projection: Option<Vec<String>>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Append a sort key.
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn projection<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Effective skip (absent = 0).
    pub fn skip_count(&self) -> usize {
        self.skip.unwrap_or(0)
    }

    /// Effective limit; `None` when unbounded.
    pub fn limit_count(&self) -> Option<usize> {
        self.limit.filter(|l| *l > 0)
    }

    /// Parse the filter, if any.
    pub fn parsed_filter(&self) -> Result<Option<Filter>> {
        self.filter.as_ref().map(Filter::parse).transpose()
    }

    /// True when the sort is exactly `_id` descending.
    pub fn sorts_by_id_desc(&self) -> bool {
        matches!(
            self.sort.as_slice(),
            [SortSpec { field, direction: SortDirection::Desc }] if field == ID_FIELD
        )
    }

    /// Whether any sort key overlaps `path` (equal, or one is a dotted
    /// prefix of the other).
    pub fn sort_touches(&self, path: &str) -> bool {
        self.sort
            .iter()
            .any(|s| paths_overlap(&s.field, path))
    }

    /// Normalized copy: duplicate sort keys dropped, zero limit cleared,
    /// projection sorted and deduplicated, filter canonicalized.
    pub fn normalized(&self) -> QueryOptions {
        let mut sort: Vec<SortSpec> = Vec::with_capacity(self.sort.len());
        for spec in &self.sort {
            if !sort.iter().any(|s| s.field == spec.field) {
                sort.push(spec.clone());
            }
        }

        let projection = self.projection.as_ref().map(|fields| {
            let mut fields = fields.clone();
            fields.sort();
            fields.dedup();
            fields
        });

        QueryOptions {
            filter: self.filter.as_ref().map(canonicalize),
            sort,
            skip: self.skip.filter(|s| *s > 0),
            limit: self.limit_count(),
            projection,
        }
    }

    /// Canonical serialization, identical for structurally equal options.
    pub fn canonical(&self) -> Result<String> {
        let value = serde_json::to_value(self.normalized())?;
        Ok(serde_json::to_string(&canonicalize(&value))?)
    }

    /// Validate everything that can be checked without a store.
    pub fn validate(&self) -> Result<()> {
        self.parsed_filter()?;
        for spec in &self.sort {
            if spec.field.is_empty() {
                return Err(LiveError::InvalidOptions("empty sort field".to_string()));
            }
        }
        if let Some(fields) = &self.projection {
            if fields.iter().any(|f| f.is_empty()) {
                return Err(LiveError::InvalidOptions(
                    "empty projection field".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn paths_overlap(a: &str, b: &str) -> bool {
    fn is_prefix(prefix: &str, path: &str) -> bool {
        path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'.'
    }
    a == b || is_prefix(a, b) || is_prefix(b, a)
}

/// Rebuild a JSON value with object keys in sorted order and integral
/// floats collapsed to integers.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => {
            if n.is_f64() {
                if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f.abs() < 9.0e15 {
                        return Value::Number(Number::from(f as i64));
                    }
                }
            }
            Value::Number(n.clone())
        }
        other => other.clone(),
    }
}

/// Compare two documents by a sort specification, falling back to `_id`.
pub fn compare_documents(a: &Document, b: &Document, sort: &[SortSpec]) -> Ordering {
    for spec in sort {
        let ord = match (get_path(a, &spec.field), get_path(b, &spec.field)) {
            (Some(x), Some(y)) => compare_values(x, y),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return match spec.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
        }
    }
    a.id().cmp(b.id())
}

/// Identity of an emitter: the collection plus canonical options.
///
/// Struct-based, so a collection name can never alias part of another key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EmitterKey {
    collection: String,
    options: String,
}

impl EmitterKey {
    pub fn new(collection: &str, options: &QueryOptions) -> Result<Self> {
        Ok(Self {
            collection: collection.to_string(),
            options: options.canonical()?,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Short stable hash for log fields.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.collection.len() as u64).to_le_bytes());
        hasher.update(self.collection.as_bytes());
        hasher.update(self.options.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for EmitterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmitterKey({}:{})", self.collection, self.fingerprint())
    }
}

impl fmt::Display for EmitterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.collection, self.options)
    }
}
