//! Iteration over an index in fixed-size chunks

use std::iter::FusedIterator;

use tracing::debug;

use crate::error::Result;
use crate::index::Index;
use crate::key::Key;
use crate::schedule::IterConfig;

/// A cursor that slices an [`Index`] into consecutive chunks
///
/// The shuffle seed, the current epoch and the position inside the epoch are
/// plain fields of this value, so two cursors over the same index never
/// influence each other. Epoch `e` uses the order `index.shuffle(seed + e)`.
#[derive(Debug, Clone)]
pub struct Batches<K: Key> {
    /// The index being traversed
    index: Index<K>,

    /// Key order for the current epoch
    order: Index<K>,

    /// Keys per chunk
    batch_size: usize,

    /// Whether each epoch is reshuffled
    shuffle: bool,

    /// Base seed for per-epoch shuffles
    seed: u64,

    /// Number of passes before the sequence ends, `None` for endless
    n_epochs: Option<usize>,

    /// Zero-based epoch the cursor is in
    epoch: usize,

    /// Position of the next key to hand out in `order`
    cursor: usize,

    /// Set once a finite sequence has produced its last chunk
    finished: bool,
}

impl<K: Key> Batches<K> {
    pub(crate) fn new(index: Index<K>, config: &IterConfig) -> Result<Self> {
        config.validate()?;

        let seed = config.resolve_seed();
        let order = if config.shuffle {
            index.shuffle(seed)
        } else {
            index.clone()
        };

        Ok(Self {
            index,
            order,
            batch_size: config.batch_size,
            shuffle: config.shuffle,
            seed,
            n_epochs: config.n_epochs,
            epoch: 0,
            cursor: 0,
            finished: false,
        })
    }

    /// The index being traversed
    pub fn index(&self) -> &Index<K> {
        &self.index
    }

    /// Keys per chunk
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether epochs are shuffled
    pub fn is_shuffled(&self) -> bool {
        self.shuffle
    }

    /// Base seed used for shuffling
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Zero-based epoch of the next chunk
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Position inside the current epoch
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether the sequence is finite
    pub fn is_finite(&self) -> bool {
        self.n_epochs.is_some()
    }

    /// Whether a finite sequence has ended
    pub fn is_finished(&self) -> bool {
        self.finished || self.index.is_empty()
    }

    /// Number of passes fully handed out so far
    pub fn epochs_completed(&self) -> usize {
        if !self.order.is_empty() && self.cursor >= self.order.len() {
            self.epoch + 1
        } else {
            self.epoch
        }
    }

    /// Chunks in one pass, counting the short final chunk
    pub fn batches_per_epoch(&self) -> usize {
        self.index.len().div_ceil(self.batch_size)
    }

    /// Rewind to the first chunk of epoch zero
    pub fn reset(&mut self) {
        self.epoch = 0;
        self.cursor = 0;
        self.finished = false;
        self.order = if self.shuffle {
            self.index.shuffle(self.seed)
        } else {
            self.index.clone()
        };
        debug!(seed = self.seed, "batch cursor reset");
    }

    /// Move to the next epoch, or finish if the epoch budget is spent
    fn advance_epoch(&mut self) -> bool {
        if let Some(n_epochs) = self.n_epochs {
            if self.epoch + 1 >= n_epochs {
                self.finished = true;
                return false;
            }
        }

        self.epoch += 1;
        self.cursor = 0;
        if self.shuffle {
            self.order = self.index.shuffle(self.seed.wrapping_add(self.epoch as u64));
        }
        debug!(epoch = self.epoch, keys = self.index.len(), "starting pass over index");
        true
    }
}

impl<K: Key> Iterator for Batches<K> {
    type Item = Index<K>;

    fn next(&mut self) -> Option<Index<K>> {
        if self.is_finished() {
            return None;
        }
        if self.cursor >= self.order.len() && !self.advance_epoch() {
            return None;
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let chunk = self.order.slice(self.cursor..end);
        self.cursor = end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.is_finished() {
            return (0, Some(0));
        }
        let Some(n_epochs) = self.n_epochs else {
            return (usize::MAX, None);
        };

        let in_epoch = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        let later = (n_epochs - self.epoch - 1) * self.batches_per_epoch();
        (in_epoch + later, Some(in_epoch + later))
    }
}

impl<K: Key> FusedIterator for Batches<K> {}
