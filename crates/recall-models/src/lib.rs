//! Data models for Recall.
//!
//! Defines the types shared between the storage layer, the retrieval
//! services and the HTTP layer: memory records and their closed
//! enumerations, search results, assembled prompt context, and the
//! shapes used by fact extraction.

mod context;
mod extraction;
mod memory;

pub use context::*;
pub use extraction::*;
pub use memory::*;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Prefix for memory record ids.
pub const MEMORY_ID_PREFIX: &str = "mem";

/// Generate a new id prefixed by the entity kind, e.g. `mem_3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
