//! Query layer: filters, sort order, and canonical option keys.
//!
//! Used both by emitters (to classify changes locally) and by the in-memory
//! store (to answer aggregations), so the two always agree on membership.

mod filter;
mod options;

pub use filter::{compare_values, get_path, values_equal, Filter};
pub use options::{
    canonicalize, compare_documents, EmitterKey, QueryOptions, SortDirection, SortSpec,
};
