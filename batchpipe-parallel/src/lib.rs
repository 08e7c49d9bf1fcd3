//! Parallel batch preparation for batchpipe pipelines
//!
//! The core crate executes every batch on the caller's thread. This crate
//! adds a [`Prefetcher`] that materializes upcoming batches on worker threads
//! without changing the order batches are delivered in.

#![warn(missing_docs)]

pub mod error;
pub mod prefetch;

pub use error::{Error, Result};
pub use prefetch::{PrefetchConfig, Prefetcher};

use std::sync::Arc;

use batchpipe_core::Materialize;

/// Prefetching for anything the engine can materialize
pub trait PrefetchExt: Materialize + Sized + 'static
where
    Self::Output: 'static,
{
    /// Move `self` behind an `Arc` and start prefetching from it
    fn prefetch(self, config: &PrefetchConfig) -> Result<Prefetcher<Self>> {
        Prefetcher::new(Arc::new(self), config)
    }
}

impl<M> PrefetchExt for M
where
    M: Materialize + 'static,
    M::Output: 'static,
{
}
