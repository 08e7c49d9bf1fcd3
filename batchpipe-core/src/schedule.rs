//! Pipeline execution scheduling
//!
//! The engine shared by pipelines and paired datasets: it turns an iteration
//! config into a stream of key chunks, materializes one batch per chunk and
//! folds the recorded actions over it. Everything runs on the caller's thread;
//! a step is finished before the next one starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::action::ActionCall;
use crate::batch::Batch;
use crate::batches::Batches;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::Key;

/// Configuration for iterating over an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterConfig {
    /// Keys per batch
    pub batch_size: usize,

    /// Whether every pass visits keys in a fresh random order
    pub shuffle: bool,

    /// Seed for shuffling; drawn at random when unset
    pub seed: Option<u64>,

    /// Passes over the index before stopping, `None` to repeat forever
    pub n_epochs: Option<usize>,
}

impl Default for IterConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            seed: None,
            n_epochs: Some(1),
        }
    }
}

impl IterConfig {
    /// One unshuffled pass with the given batch size
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Config from the classic `(batch_size, shuffle, one_pass)` triple
    pub fn from_flags(batch_size: usize, shuffle: bool, one_pass: bool) -> Self {
        Self {
            batch_size,
            shuffle,
            seed: None,
            n_epochs: one_pass.then_some(1),
        }
    }

    /// Set shuffling
    #[must_use]
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Fix the shuffle seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Stop after a single pass
    #[must_use]
    pub fn one_pass(self) -> Self {
        self.epochs(1)
    }

    /// Stop after `n_epochs` passes
    #[must_use]
    pub fn epochs(mut self, n_epochs: usize) -> Self {
        self.n_epochs = Some(n_epochs);
        self
    }

    /// Repeat passes forever
    #[must_use]
    pub fn repeat(mut self) -> Self {
        self.n_epochs = None;
        self
    }

    /// Whether iteration stops after a single pass
    pub fn is_one_pass(&self) -> bool {
        self.n_epochs == Some(1)
    }

    /// Check the config for values that cannot drive an iteration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be a positive integer"));
        }
        if self.n_epochs == Some(0) {
            return Err(Error::config("n_epochs must be positive when set"));
        }
        Ok(())
    }

    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// The seed a cursor built from this config uses
    pub(crate) fn resolve_seed(&self) -> u64 {
        match self.seed {
            Some(seed) => seed,
            None if self.shuffle => {
                let seed: u64 = rand::rng().random();
                debug!(seed, "no shuffle seed configured, drew one");
                seed
            }
            None => 0,
        }
    }
}

/// Statistics from pipeline execution
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    /// Number of items processed
    pub items_processed: u64,

    /// Number of batches processed
    pub batches_processed: u64,

    /// Number of full passes over the index
    pub epochs_completed: usize,

    /// Total execution time
    pub execution_time: Duration,

    /// Time spent building batches and applying actions
    pub materialize_time: Duration,
}

/// Shared flag for abandoning a run between steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clear a previous cancellation
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Something that turns a key chunk into a realized output
///
/// Implemented by pipelines (one batch per chunk) and paired datasets (one
/// batch per side, same chunk). The engine only needs this seam.
pub trait Materialize: Send + Sync {
    /// Key type of the index being traversed
    type Key: Key;

    /// What one step produces
    type Output: Send;

    /// The keys iteration runs over
    fn index(&self) -> &Index<Self::Key>;

    /// Build and process the output for one chunk
    fn materialize(&self, keys: &Index<Self::Key>) -> Result<Self::Output>;

    /// Checks run once before the first chunk is materialized
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Apply recorded calls to a batch, in order
///
/// Stops at the first failure. The batch keeps whatever the actions before the
/// failing one did to it. An action that leaves the batch with different keys
/// fails the chain at its position.
pub fn apply_chain<'a, B, I>(batch: &mut B, calls: I) -> Result<()>
where
    B: Batch,
    I: IntoIterator<Item = &'a ActionCall>,
{
    let registry = B::actions();
    let keys = batch.index().clone();
    for (position, call) in calls.into_iter().enumerate() {
        let action = registry.resolve(&call.name)?;
        let failure = |source: anyhow::Error| Error::ChainFailure {
            action: call.name.clone(),
            position,
            last_applied: position.checked_sub(1),
            source: source.into(),
        };
        action(batch, &call.args).map_err(&failure)?;
        if batch.index() != &keys {
            return Err(failure(anyhow::anyhow!("action changed the batch keys")));
        }
    }
    Ok(())
}

/// Lazily realized outputs, one per key chunk
///
/// Yields `Err` at most once; the iterator is finished after an error.
pub struct GenBatch<'a, M: Materialize> {
    source: &'a M,
    batches: Batches<M::Key>,
    cancel: Option<CancelToken>,
    stats: RunStats,
    started: Instant,
    done: bool,
}

impl<'a, M: Materialize> GenBatch<'a, M> {
    /// Start iterating `source` according to `config`
    pub fn new(source: &'a M, config: &IterConfig) -> Result<Self> {
        source.validate()?;
        let batches = source.index().iter_batches(config)?;

        Ok(Self {
            source,
            batches,
            cancel: None,
            stats: RunStats::default(),
            started: Instant::now(),
            done: false,
        })
    }

    /// Stop with `Cancelled` once `token` is cancelled
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The underlying chunk cursor
    pub fn batches(&self) -> &Batches<M::Key> {
        &self.batches
    }

    /// Statistics so far
    pub fn stats(&self) -> RunStats {
        RunStats {
            epochs_completed: self.batches.epochs_completed(),
            execution_time: self.started.elapsed(),
            ..self.stats.clone()
        }
    }
}

impl<M: Materialize> Iterator for GenBatch<'_, M> {
    type Item = Result<M::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            self.done = true;
            return Some(Err(Error::Cancelled));
        }

        let Some(keys) = self.batches.next() else {
            self.done = true;
            return None;
        };

        let step_start = Instant::now();
        let output = self.source.materialize(&keys);
        self.stats.materialize_time += step_start.elapsed();

        match output {
            Ok(output) => {
                self.stats.items_processed += keys.len() as u64;
                self.stats.batches_processed += 1;
                Some(Ok(output))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Drive `source` over its whole batch sequence, discarding every output
///
/// With an endless config this only returns on error or cancellation.
pub fn run_to_end<M: Materialize>(
    source: &M,
    config: &IterConfig,
    cancel: Option<CancelToken>,
) -> Result<RunStats> {
    let mut steps = GenBatch::new(source, config)?;
    if let Some(token) = cancel {
        steps = steps.with_cancel(token);
    }

    info!(
        keys = source.index().len(),
        batch_size = config.batch_size,
        shuffle = config.shuffle,
        n_epochs = ?config.n_epochs,
        "run started"
    );

    for output in steps.by_ref() {
        output?;
    }

    let stats = steps.stats();
    info!(
        batches = stats.batches_processed,
        items = stats.items_processed,
        epochs = stats.epochs_completed,
        elapsed = ?stats.execution_time,
        "run finished"
    );
    Ok(stats)
}
