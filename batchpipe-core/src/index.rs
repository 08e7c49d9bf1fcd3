//! Ordered, duplicate-free collections of item keys
//!
//! An [`Index`] says *what data exists*. It never touches item data: every
//! operation here returns another index whose keys are taken verbatim from
//! the parent.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::batches::Batches;
use crate::error::{Error, Result};
use crate::key::{render, Key};
use crate::schedule::IterConfig;
use crate::split::{Split, DEFAULT_SPLIT_NAMES};

/// Slack allowed when checking that split proportions sum to at most 1.0
const PROPORTION_TOLERANCE: f64 = 1e-9;

/// An ordered sequence of unique keys
///
/// Cloning is cheap: the key storage is shared.
#[derive(Clone)]
pub struct Index<K: Key> {
    /// Keys in index order
    keys: Arc<Vec<K>>,

    /// Position of every key in `keys`
    positions: Arc<HashMap<K, usize>>,
}

impl<K: Key> Index<K> {
    /// Create an index, failing on the first duplicate key
    pub fn new(keys: Vec<K>) -> Result<Self> {
        let mut positions = HashMap::with_capacity(keys.len());
        for (position, key) in keys.iter().enumerate() {
            if positions.insert(key.clone(), position).is_some() {
                return Err(Error::Uniqueness { key: render(key) });
            }
        }

        Ok(Self {
            keys: Arc::new(keys),
            positions: Arc::new(positions),
        })
    }

    /// Create an index with no keys
    pub fn empty() -> Self {
        Self::from_unique(Vec::new())
    }

    /// Build an index from keys already known to be unique
    pub(crate) fn from_unique(keys: Vec<K>) -> Self {
        let positions: HashMap<K, usize> = keys
            .iter()
            .enumerate()
            .map(|(position, key)| (key.clone(), position))
            .collect();
        debug_assert_eq!(positions.len(), keys.len(), "keys must be unique");

        Self {
            keys: Arc::new(keys),
            positions: Arc::new(positions),
        }
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the index holds no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in index order
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Iterate over keys in index order
    pub fn iter(&self) -> std::slice::Iter<'_, K> {
        self.keys.iter()
    }

    /// Key at the given position
    pub fn get(&self, position: usize) -> Option<&K> {
        self.keys.get(position)
    }

    /// Whether the key belongs to this index
    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// Position of a key in index order
    pub fn position(&self, key: &K) -> Option<usize> {
        self.positions.get(key).copied()
    }

    /// Keys matching the predicate, in parent order
    pub fn subset_by<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&K) -> bool,
    {
        Self::from_unique(self.keys.iter().filter(|key| predicate(key)).cloned().collect())
    }

    /// The given keys as an index, in parent order
    ///
    /// Every key must belong to this index and appear at most once.
    pub fn subset(&self, keys: &[K]) -> Result<Self> {
        let mut selected = Vec::with_capacity(keys.len());
        let mut seen = HashSet::with_capacity(keys.len());

        for key in keys {
            let position = self
                .position(key)
                .ok_or_else(|| Error::UnknownKey(render(key)))?;
            if !seen.insert(position) {
                return Err(Error::Uniqueness { key: render(key) });
            }
            selected.push(position);
        }

        selected.sort_unstable();
        Ok(Self::from_unique(
            selected.into_iter().map(|position| self.keys[position].clone()).collect(),
        ))
    }

    /// A permutation of this index, fully determined by `seed`
    pub fn shuffle(&self, seed: u64) -> Self {
        let mut keys = self.keys.as_ref().clone();
        keys.shuffle(&mut StdRng::seed_from_u64(seed));
        Self::from_unique(keys)
    }

    /// Consecutive keys in `range`
    pub(crate) fn slice(&self, range: Range<usize>) -> Self {
        Self::from_unique(self.keys[range].to_vec())
    }

    /// Whether both indexes hold the same key set, regardless of order
    pub fn same_keys(&self, other: &Self) -> bool {
        self.len() == other.len() && other.iter().all(|key| self.contains(key))
    }

    /// Keys of this index missing from `other`, in this index's order
    pub fn difference<'a>(&'a self, other: &Self) -> Vec<&'a K> {
        self.iter().filter(|key| !other.contains(key)).collect()
    }

    /// Partition into chunks of `batch_size` keys
    ///
    /// The final chunk may be short; it is never dropped or padded. With
    /// `one_pass` the sequence ends after the last chunk, otherwise it
    /// restarts (reshuffling when `shuffle` is set) forever.
    pub fn batches(&self, batch_size: usize, shuffle: bool, one_pass: bool) -> Result<Batches<K>> {
        self.iter_batches(&IterConfig::from_flags(batch_size, shuffle, one_pass))
    }

    /// Partition into chunks according to a full iteration config
    pub fn iter_batches(&self, config: &IterConfig) -> Result<Batches<K>> {
        Batches::new(self.clone(), config)
    }

    /// Split into `train`, `test` and `validation` by proportion
    ///
    /// Up to three proportions are accepted and named in that order. Keys not
    /// covered by the proportions land in the unnamed remainder.
    pub fn split(&self, proportions: &[f64], shuffle_seed: Option<u64>) -> Result<Split<Self>> {
        if proportions.len() > DEFAULT_SPLIT_NAMES.len() {
            return Err(Error::config(format!(
                "at most {} unnamed proportions are supported, got {}; use split_named",
                DEFAULT_SPLIT_NAMES.len(),
                proportions.len()
            )));
        }

        let parts: Vec<(&str, f64)> = DEFAULT_SPLIT_NAMES
            .iter()
            .copied()
            .zip(proportions.iter().copied())
            .collect();
        self.split_named(&parts, shuffle_seed)
    }

    /// Split into named contiguous ranges sized by proportion
    ///
    /// When `shuffle_seed` is given the index is shuffled once before the
    /// ranges are cut. Range boundaries are the rounded cumulative proportions,
    /// so proportions summing to 1.0 leave an empty remainder.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn split_named(&self, parts: &[(&str, f64)], shuffle_seed: Option<u64>) -> Result<Split<Self>> {
        if parts.is_empty() {
            return Err(Error::config("at least one split proportion is required"));
        }

        let mut names = HashSet::with_capacity(parts.len());
        for &(name, proportion) in parts {
            if !names.insert(name) {
                return Err(Error::config(format!("split name `{name}` is used twice")));
            }
            if !(0.0..=1.0).contains(&proportion) {
                return Err(Error::Range(format!(
                    "proportion for `{name}` must lie in [0, 1], got {proportion}"
                )));
            }
        }

        let total: f64 = parts.iter().map(|&(_, proportion)| proportion).sum();
        if total > 1.0 + PROPORTION_TOLERANCE {
            return Err(Error::config(format!(
                "split proportions sum to {total}, which exceeds 1.0"
            )));
        }

        let source = match shuffle_seed {
            Some(seed) => self.shuffle(seed),
            None => self.clone(),
        };
        let len = source.len();

        let mut cumulative = 0.0;
        let mut start = 0;
        let mut named = Vec::with_capacity(parts.len());
        for &(name, proportion) in parts {
            cumulative += proportion;
            let end = ((cumulative * len as f64).round() as usize).clamp(start, len);
            named.push((name.to_string(), source.slice(start..end)));
            start = end;
        }
        let remainder = source.slice(start..len);

        debug!(
            keys = len,
            parts = named.len(),
            remainder = remainder.len(),
            "split index"
        );

        Ok(Split::new(named, remainder))
    }
}

impl Index<usize> {
    /// Keys `0..len`
    pub fn range(len: usize) -> Self {
        Self::from_unique((0..len).collect())
    }
}

impl<K: Key> TryFrom<Vec<K>> for Index<K> {
    type Error = Error;

    fn try_from(keys: Vec<K>) -> Result<Self> {
        Self::new(keys)
    }
}

impl<K: Key> PartialEq for Index<K> {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys
    }
}

impl<K: Key> Eq for Index<K> {}

impl<K: Key> fmt::Debug for Index<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 8;
        let mut list = f.debug_list();
        list.entries(self.keys.iter().take(SHOWN));
        if self.len() > SHOWN {
            list.entry(&format_args!("... {} more", self.len() - SHOWN));
        }
        list.finish()
    }
}

impl<'a, K: Key> IntoIterator for &'a Index<K> {
    type Item = &'a K;
    type IntoIter = std::slice::Iter<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
