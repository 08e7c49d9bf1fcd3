//! Datasets: an index bound to a batch constructor

use std::fmt;
use std::sync::Arc;

use crate::batch::Batch;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::render;
use crate::pipeline::Pipeline;
use crate::split::Split;

/// Builds a batch for a key subset
///
/// Any `Fn(Index<K>) -> anyhow::Result<B>` closure qualifies.
pub trait BatchFactory<B: Batch>: Send + Sync {
    /// Create a fresh batch for `keys`
    fn make_batch(&self, keys: Index<B::Key>) -> anyhow::Result<B>;
}

impl<B, F> BatchFactory<B> for F
where
    B: Batch,
    F: Fn(Index<B::Key>) -> anyhow::Result<B> + Send + Sync,
{
    fn make_batch(&self, keys: Index<B::Key>) -> anyhow::Result<B> {
        self(keys)
    }
}

/// A dataset pairs one index with one batch constructor
///
/// Every batch it creates covers a subset of its index. Cloning is cheap and
/// shares the index and the constructor.
pub struct Dataset<B: Batch> {
    /// The keys this dataset spans
    index: Index<B::Key>,

    /// Batch constructor
    factory: Arc<dyn BatchFactory<B>>,
}

impl<B: Batch> Dataset<B> {
    /// Create a dataset from a constructor closure
    pub fn new<F>(index: Index<B::Key>, factory: F) -> Self
    where
        F: Fn(Index<B::Key>) -> anyhow::Result<B> + Send + Sync + 'static,
    {
        Self::from_factory(index, factory)
    }

    /// Create a dataset from any batch constructor
    pub fn from_factory(index: Index<B::Key>, factory: impl BatchFactory<B> + 'static) -> Self {
        Self {
            index,
            factory: Arc::new(factory),
        }
    }

    /// Start building a dataset
    pub fn builder() -> DatasetBuilder<B> {
        DatasetBuilder::new()
    }

    /// The keys this dataset spans
    pub fn index(&self) -> &Index<B::Key> {
        &self.index
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the dataset has no items
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Create a batch for `keys`
    ///
    /// `keys` must be a subset of this dataset's index, and the batch returned
    /// by the constructor must not carry keys from outside it.
    pub fn create_batch(&self, keys: &Index<B::Key>) -> Result<B> {
        if let Some(key) = keys.iter().find(|key| !self.index.contains(key)) {
            return Err(Error::UnknownKey(render(key)));
        }

        let batch = self
            .factory
            .make_batch(keys.clone())
            .map_err(|source| Error::BatchConstruction(source.into()))?;

        if let Some(key) = batch.keys().iter().find(|key| !self.index.contains(key)) {
            return Err(Error::BatchConstruction(
                format!("constructor produced key {} outside the dataset index", render(key)).into(),
            ));
        }

        Ok(batch)
    }

    /// The same constructor over a subset of the index
    pub fn subset(&self, index: &Index<B::Key>) -> Result<Self> {
        if let Some(key) = index.iter().find(|key| !self.index.contains(key)) {
            return Err(Error::UnknownKey(render(key)));
        }

        Ok(Self {
            index: index.clone(),
            factory: Arc::clone(&self.factory),
        })
    }

    /// Split into `train`, `test` and `validation` datasets
    pub fn cv_split(&self, proportions: &[f64], shuffle_seed: Option<u64>) -> Result<Split<Self>> {
        self.index
            .split(proportions, shuffle_seed)?
            .try_map(|_, index| self.subset(&index))
    }

    /// An empty pipeline over this dataset
    pub fn pipeline(&self) -> Pipeline<B> {
        Pipeline::new(self)
    }
}

impl<B: Batch> Clone for Dataset<B> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<B: Batch> fmt::Debug for Dataset<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("batch_type", &std::any::type_name::<B>())
            .field("len", &self.index.len())
            .finish()
    }
}

/// A builder for creating datasets
pub struct DatasetBuilder<B: Batch> {
    /// The keys of the dataset
    index: Option<Index<B::Key>>,

    /// The batch constructor
    factory: Option<Arc<dyn BatchFactory<B>>>,
}

impl<B: Batch> DatasetBuilder<B> {
    /// Create a new dataset builder
    pub fn new() -> Self {
        Self {
            index: None,
            factory: None,
        }
    }

    /// Set the index of the dataset
    #[must_use]
    pub fn index(mut self, index: Index<B::Key>) -> Self {
        self.index = Some(index);
        self
    }

    /// Set the batch constructor
    #[must_use]
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(Index<B::Key>) -> anyhow::Result<B> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Build the dataset
    pub fn build(self) -> Result<Dataset<B>> {
        let index = self
            .index
            .ok_or_else(|| Error::config("an index is required to build a dataset"))?;

        let factory = self
            .factory
            .ok_or_else(|| Error::config("a batch constructor is required to build a dataset"))?;

        Ok(Dataset { index, factory })
    }
}

impl<B: Batch> Default for DatasetBuilder<B> {
    fn default() -> Self {
        Self::new()
    }
}
