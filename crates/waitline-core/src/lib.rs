//! # waitline-core
//!
//! Core abstractions for the Waitline wait-time pipeline.
//!
//! This crate provides the foundational types used across all Waitline
//! components:
//!
//! - **Canonical Observation**: The four-column fact row and its validation
//! - **Park Derivations**: Entity-prefix park codes, property timezones,
//!   and the 6 AM operational-date rule
//! - **State Primitives**: Atomic write-replace, cross-process locks,
//!   the pipeline status record, and the output-root layout
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `waitline-core` is the **only** crate allowed to define shared
//! primitives. Every stateful component (stores, ingest, modeling) builds
//! on the handles defined here; the output root is passed explicitly, not
//! discovered ambiently.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod atomic;
pub mod config;
pub mod error;
pub mod layout;
pub mod lock;
pub mod observability;
pub mod observation;
pub mod parkdate;
pub mod parks;
pub mod retry;
pub mod status;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use waitline_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::layout::RootLayout;
    pub use crate::lock::{LockGuard, LockInfo, ProcessLock};
    pub use crate::observation::{DedupKey, Observation, WaitTimeType};
    pub use crate::parkdate::{mins_since_6am, park_date};
    pub use crate::parks::{park_code_for_entity, property_timezone};
    pub use crate::retry::RetryPolicy;
    pub use crate::status::{PipelineStatus, Step, StepState};
}

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use layout::RootLayout;
pub use lock::{LockGuard, LockInfo, ProcessLock};
pub use observability::{init_logging, LogFormat};
pub use observation::{DedupKey, Observation, WaitTimeType};
pub use parkdate::{mins_since_6am, park_date};
pub use parks::{park_code_for_entity, property_timezone};
pub use retry::RetryPolicy;
pub use status::{PipelineStatus, Step, StepState};
