//! Item key capability

use std::fmt::Debug;
use std::hash::Hash;

/// An opaque identifier for one data item
///
/// Any hashable, comparable, thread-safe value qualifies: integers, strings,
/// paths, tuples of those.
pub trait Key: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

pub(crate) fn render<K: Key>(key: &K) -> String {
    format!("{key:?}")
}
