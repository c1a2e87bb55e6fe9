//! # waitline-ingest
//!
//! Source-side components of the Waitline pipeline:
//!
//! - **Source store**: read-only listing + streaming over historical
//!   objects, with filesystem and in-memory backends
//! - **Classification**: routing each source key to its format variant
//! - **Parsers**: standby, new-fastpass, and legacy-fastpass readers that
//!   all emit the canonical observation
//! - **Ingest driver**: incremental discovery, retries, quarantine, and
//!   exactly-once file accounting
//! - **Morning merge**: folding yesterday's staged live rows into the
//!   canonical store
//! - **Live poller**: the queue-times feed, gated by park operating windows

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod classify;
pub mod error;
pub mod fastpass;
pub mod ingest;
pub mod live;
pub mod merge;
pub mod source;
pub mod standby;

pub use classify::FileClass;
pub use error::{IngestError, Result};
pub use ingest::{IngestOptions, IngestReport, Ingestor};
pub use live::{LivePoller, LivePollerOptions, PollReport};
pub use merge::{merge_yesterday_staging, MergeReport};
pub use source::{FsSourceStore, MemorySourceStore, SourceObject, SourceStore};
