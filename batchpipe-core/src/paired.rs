//! Paired datasets
//!
//! Two pipelines over the same key set, iterated together. Each step cuts one
//! key chunk and builds a batch per side from exactly that chunk, so the
//! primary and secondary batches of a step always describe the same items.

use std::fmt;

use tracing::{debug, info};

use crate::batch::Batch;
use crate::batches::Batches;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::render;
use crate::pipeline::Pipeline;
use crate::schedule::{self, CancelToken, GenBatch, IterConfig, Materialize, RunStats};
use crate::split::Split;

/// Missing keys listed in a synchronization error
const SHOWN_MISSING: usize = 5;

/// Two pipelines kept in lockstep over one key set
pub struct PairedDataset<P: Batch, S: Batch<Key = P::Key>> {
    primary: Pipeline<P>,
    secondary: Pipeline<S>,
    seed: Option<u64>,
    cursor: Option<Batches<P::Key>>,
    cancel: CancelToken,
}

impl<P: Batch, S: Batch<Key = P::Key>> PairedDataset<P, S> {
    /// Pair two pipelines whose indexes hold the same keys
    ///
    /// Key order may differ; iteration follows the primary order.
    pub fn new(primary: Pipeline<P>, secondary: Pipeline<S>) -> Result<Self> {
        let (left, right) = (primary.index(), secondary.index());
        if !left.same_keys(right) {
            return Err(Error::Synchronization(describe_mismatch(left, right)));
        }

        debug!(keys = left.len(), "paired datasets");
        Ok(Self {
            primary,
            secondary,
            seed: None,
            cursor: None,
            cancel: CancelToken::new(),
        })
    }

    /// Pair two datasets with no actions recorded on either side
    pub fn from_datasets(primary: &Dataset<P>, secondary: &Dataset<S>) -> Result<Self> {
        Self::new(primary.pipeline(), secondary.pipeline())
    }

    /// Fix the shuffle seed used by `run` and `next_batch`
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self.cursor = None;
        self
    }

    /// The shared keys, in primary order
    pub fn index(&self) -> &Index<P::Key> {
        self.primary.index()
    }

    /// Number of paired items
    pub fn len(&self) -> usize {
        self.index().len()
    }

    /// Whether there is nothing to iterate
    pub fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    /// The primary pipeline
    pub fn primary(&self) -> &Pipeline<P> {
        &self.primary
    }

    /// The secondary pipeline
    pub fn secondary(&self) -> &Pipeline<S> {
        &self.secondary
    }

    /// Check the actions of both sides
    pub fn validate(&self) -> Result<()> {
        self.primary.validate()?;
        self.secondary.validate()
    }

    /// Build and process both batches for `keys`
    pub fn materialize(&self, keys: &Index<P::Key>) -> Result<(P, S)> {
        let primary = self.primary.materialize(keys)?;
        let secondary = self.secondary.materialize(keys)?;

        if primary.keys() != secondary.keys() {
            return Err(Error::Synchronization(format!(
                "paired batches diverged after processing: {} primary keys, {} secondary keys",
                primary.len(),
                secondary.len()
            )));
        }
        Ok((primary, secondary))
    }

    fn seeded(&self, config: &IterConfig) -> IterConfig {
        let mut config = config.clone();
        if config.seed.is_none() {
            config.seed = self.seed;
        }
        config
    }

    /// Realized batch pairs, produced as the iterator is advanced
    pub fn gen_batch(&self, config: &IterConfig) -> Result<GenBatch<'_, Self>> {
        Ok(GenBatch::new(self, &self.seeded(config))?.with_cancel(self.cancel.clone()))
    }

    /// Process every pair and discard the results
    pub fn run(&self, batch_size: usize, shuffle: bool, one_pass: bool) -> Result<RunStats> {
        self.run_with(&IterConfig::from_flags(batch_size, shuffle, one_pass))
    }

    /// Process pairs according to a full config and discard the results
    pub fn run_with(&self, config: &IterConfig) -> Result<RunStats> {
        info!(
            primary = %self.primary.id(),
            secondary = %self.secondary.id(),
            "running paired pipelines"
        );
        schedule::run_to_end(self, &self.seeded(config), Some(self.cancel.clone()))
    }

    /// The next batch pair from an endless, internally kept sequence
    ///
    /// Both sides advance together. Changing `batch_size` or `shuffle` starts
    /// a new sequence.
    pub fn next_batch(&mut self, batch_size: usize, shuffle: bool) -> Result<(P, S)> {
        let stale = self
            .cursor
            .as_ref()
            .is_none_or(|cursor| cursor.batch_size() != batch_size || cursor.is_shuffled() != shuffle);

        if stale {
            self.validate()?;
            let config = self.seeded(&IterConfig::from_flags(batch_size, shuffle, false));
            self.cursor = Some(self.index().iter_batches(&config)?);
        }

        let keys = self
            .cursor
            .as_mut()
            .and_then(Iterator::next)
            .ok_or(Error::Exhausted)?;
        self.materialize(&keys)
    }

    /// Drop the `next_batch` sequence
    pub fn reset_iter(&mut self) {
        self.cursor = None;
    }

    /// Split into paired `train`, `test` and `validation` subsets
    ///
    /// Both sides of every part are scoped to the same keys.
    pub fn cv_split(&self, proportions: &[f64], shuffle_seed: Option<u64>) -> Result<Split<Self>> {
        self.index()
            .split(proportions, shuffle_seed)?
            .try_map(|_, index| self.scoped(&index))
    }

    fn scoped(&self, index: &Index<P::Key>) -> Result<Self> {
        Ok(Self {
            primary: self.primary.with_index(index)?,
            secondary: self.secondary.with_index(index)?,
            seed: self.seed,
            cursor: None,
            cancel: CancelToken::new(),
        })
    }

    /// Token that cancels `run` and `gen_batch` between steps
    ///
    /// Clones get a token of their own. Cancellation sticks until
    /// [`CancelToken::reset`].
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

fn describe_mismatch<K: crate::key::Key>(primary: &Index<K>, secondary: &Index<K>) -> String {
    let missing = |from: &Index<K>, to: &Index<K>| {
        from.difference(to)
            .into_iter()
            .take(SHOWN_MISSING)
            .map(render)
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut message = format!(
        "primary has {} keys, secondary has {}",
        primary.len(),
        secondary.len()
    );
    let only_primary = missing(primary, secondary);
    if !only_primary.is_empty() {
        message.push_str(&format!("; missing from secondary: {only_primary}"));
    }
    let only_secondary = missing(secondary, primary);
    if !only_secondary.is_empty() {
        message.push_str(&format!("; missing from primary: {only_secondary}"));
    }
    message
}

impl<P: Batch, S: Batch<Key = P::Key>> Materialize for PairedDataset<P, S> {
    type Key = P::Key;
    type Output = (P, S);

    fn index(&self) -> &Index<P::Key> {
        PairedDataset::index(self)
    }

    fn materialize(&self, keys: &Index<P::Key>) -> Result<(P, S)> {
        PairedDataset::materialize(self, keys)
    }

    fn validate(&self) -> Result<()> {
        PairedDataset::validate(self)
    }
}

impl<P: Batch, S: Batch<Key = P::Key>> Clone for PairedDataset<P, S> {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            secondary: self.secondary.clone(),
            seed: self.seed,
            cursor: self.cursor.clone(),
            cancel: CancelToken::new(),
        }
    }
}

impl<P: Batch, S: Batch<Key = P::Key>> fmt::Debug for PairedDataset<P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairedDataset")
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}
