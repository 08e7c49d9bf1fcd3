//! Lazy batch pipelines over keyed datasets
//!
//! This crate provides the building blocks for processing large datasets in
//! batches: an [`Index`] of item keys, a [`Dataset`] that turns key subsets
//! into batches, and a [`Pipeline`] that records named actions and applies
//! them to each batch only when batches are requested.
//!
//! ```ignore
//! let dataset = Dataset::new(Index::range(1_000), |keys| Ok(Images::empty(keys)));
//! let pipeline = dataset
//!     .pipeline()
//!     .append("load", Args::positional(["/data/images"]))
//!     .append("resize", Args::new().kwarg("shape", [64, 64]))
//!     .then("dump");
//!
//! pipeline.run(32, true, true)?;
//! ```

#![warn(missing_docs)]

pub mod action;
pub mod batch;
pub mod batches;
pub mod dataset;
pub mod error;
pub mod index;
pub mod key;
pub mod paired;
pub mod pipeline;
pub mod schedule;
pub mod split;

// Re-export key types for convenience
pub use action::{ActionCall, ActionChain, Args, Value};
pub use batch::{ActionFn, ActionRegistry, Batch, Items};
pub use batches::Batches;
pub use dataset::{BatchFactory, Dataset, DatasetBuilder};
pub use error::{Error, Result};
pub use index::Index;
pub use key::Key;
pub use paired::PairedDataset;
pub use pipeline::Pipeline;
pub use schedule::{CancelToken, GenBatch, IterConfig, Materialize, RunStats};
pub use split::{Split, DEFAULT_SPLIT_NAMES};
