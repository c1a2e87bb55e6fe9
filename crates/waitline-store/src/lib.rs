//! # waitline-store
//!
//! Persistent state for the Waitline pipeline: the deduplication set, the
//! processed-file catalog and failure tally, the per-entity index, and the
//! canonical partitioned CSV writer.
//!
//! All writers here run under the pipeline lock — there is at most one
//! writer per store at a time. The dedup set and entity index live in
//! single-file embedded SQLite databases; the catalogs are JSON files with
//! write-replace semantics.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod csvio;
pub mod dedup;
pub mod entity_index;
pub mod error;
pub mod writer;

pub use catalog::{FailureEntry, FailureTally, ProcessedCatalog};
pub use dedup::DedupSet;
pub use entity_index::{EntityIndex, EntityRecord, ModelingCandidate};
pub use error::{Result, StoreError};
pub use writer::{CanonicalWriter, WriteReport};
