//! # waitline-model
//!
//! The per-entity modeling engine:
//!
//! - **Dimensions**: calendar, season, entity, and versioned park-hours
//!   tables consumed as CSV inputs
//! - **Features**: the modeling feature table built from an entity's fact
//!   rows and the dimensions
//! - **Encoding**: the persistent, append-only categorical label map
//! - **Training**: the `RegressorTrainer` seam, the boosted-tree default
//!   engine, and the mean-model fallback
//! - **Posted aggregates**: future-date POSTED imputation medians
//! - **Curves**: forecast and backfill generation at 5-minute slots
//! - **WTI**: the per-park Wait Time Index
//! - **Batch**: bounded-parallel training orchestration

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

pub mod aggregates;
pub mod batch;
pub mod curves;
pub mod dimensions;
pub mod encoding;
pub mod error;
pub mod features;
pub mod gbt;
pub mod trainer;
pub mod wti;

pub use aggregates::{build_posted_aggregates, PostedAggregates};
pub use batch::{train_batch, BatchOptions, BatchOutcome, EntityOutcome};
pub use curves::{generate_backfill, generate_forecast, time_slots};
pub use dimensions::{Dimensions, ParkHoursLookup};
pub use encoding::EncodingMap;
pub use error::{ModelError, Result};
pub use features::{FeatureTable, TargetKind};
pub use trainer::{Hyperparams, MeanModel, RegressorTrainer, TrainedArtifact};
