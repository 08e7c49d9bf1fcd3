//! Batch capability and per-variant action registries
//!
//! A batch type qualifies by implementing [`Batch`]: it exposes the key subset
//! it was built for and a registry of named actions. Registries are per type,
//! so two batch types may both register `"load"` and mean different things.
//!
//! ```ignore
//! impl Batch for ImageBatch {
//!     type Key = String;
//!
//!     fn index(&self) -> &Index<String> {
//!         &self.index
//!     }
//!
//!     fn actions() -> &'static ActionRegistry<Self> {
//!         static ACTIONS: OnceLock<ActionRegistry<ImageBatch>> = OnceLock::new();
//!         ACTIONS.get_or_init(|| {
//!             ActionRegistry::new()
//!                 .with_action("load", ImageBatch::load)
//!                 .with_action("resize", ImageBatch::resize)
//!         })
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::action::Args;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::Key;

/// A registered action: transforms the batch in place, or replaces it
pub type ActionFn<B> = Arc<dyn Fn(&mut B, &Args) -> anyhow::Result<()> + Send + Sync>;

/// Named actions available on one batch type
pub struct ActionRegistry<B> {
    actions: HashMap<String, ActionFn<B>>,
}

impl<B: 'static> ActionRegistry<B> {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action, builder style
    ///
    /// A later registration under the same name replaces the earlier one.
    #[must_use]
    pub fn with_action<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&mut B, &Args) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.actions.insert(name.clone(), Arc::new(action)).is_some() {
            warn!(action = %name, batch_type = self.batch_type(), "action registered twice, keeping the last one");
        }
        self
    }

    /// Register an action, rejecting names already taken
    pub fn register<F>(&mut self, name: impl Into<String>, action: F) -> Result<()>
    where
        F: Fn(&mut B, &Args) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.actions.contains_key(&name) {
            return Err(Error::config(format!(
                "action `{name}` is already registered on `{}`",
                self.batch_type()
            )));
        }
        self.actions.insert(name, Arc::new(action));
        Ok(())
    }

    /// Look up an action by name
    pub fn get(&self, name: &str) -> Option<&ActionFn<B>> {
        self.actions.get(name)
    }

    /// Look up an action, failing with `UnknownAction`
    pub fn resolve(&self, name: &str) -> Result<&ActionFn<B>> {
        self.get(name).ok_or_else(|| Error::UnknownAction {
            action: name.to_string(),
            batch_type: self.batch_type(),
        })
    }

    /// Whether an action is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action is registered
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Type name of the batch variant this registry serves
    pub fn batch_type(&self) -> &'static str {
        std::any::type_name::<B>()
    }
}

impl<B: 'static> Default for ActionRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: 'static> fmt::Debug for ActionRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("batch_type", &self.batch_type())
            .field("actions", &self.names())
            .finish()
    }
}

/// A realized chunk of data for a key subset
pub trait Batch: Sized + Send + 'static {
    /// Key type of the index this batch is cut from
    type Key: Key;

    /// Keys this batch was built for
    fn index(&self) -> &Index<Self::Key>;

    /// Actions available on this batch type
    fn actions() -> &'static ActionRegistry<Self>;

    /// Keys in batch order
    fn keys(&self) -> &[Self::Key] {
        self.index().keys()
    }

    /// Number of items
    fn len(&self) -> usize {
        self.index().len()
    }

    /// Whether the batch holds no keys
    fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    /// Apply one action by name
    ///
    /// Failures of the action itself are reported as a chain failure at
    /// position 0.
    fn apply(&mut self, name: &str, args: &Args) -> Result<()> {
        let action = Self::actions().resolve(name)?;
        action(self, args).map_err(|source| Error::ChainFailure {
            action: name.to_string(),
            position: 0,
            last_applied: None,
            source: source.into(),
        })
    }

    /// Apply one action by name and hand the batch back, for chaining
    fn applied(mut self, name: &str, args: &Args) -> Result<Self> {
        self.apply(name, args)?;
        Ok(self)
    }
}

/// Key-to-item storage for batch implementations
///
/// Holds the batch keys and whatever has been loaded or derived for them so
/// far. Items can be filled in incrementally; a key may have no item yet.
#[derive(Debug, Clone)]
pub struct Items<K: Key, V> {
    index: Index<K>,
    data: HashMap<K, V>,
}

impl<K: Key, V> Items<K, V> {
    /// Storage for `index` with no items loaded
    pub fn new(index: Index<K>) -> Self {
        Self {
            data: HashMap::with_capacity(index.len()),
            index,
        }
    }

    /// The batch keys
    pub fn index(&self) -> &Index<K> {
        &self.index
    }

    /// Item for a key, if loaded
    pub fn get(&self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    /// Mutable item for a key, if loaded
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.data.get_mut(key)
    }

    /// Store an item; keys outside the batch are rejected
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        if !self.index.contains(&key) {
            return Err(Error::UnknownKey(crate::key::render(&key)));
        }
        Ok(self.data.insert(key, value))
    }

    /// Number of keys with an item
    pub fn loaded(&self) -> usize {
        self.data.len()
    }

    /// Whether every key has an item
    pub fn is_complete(&self) -> bool {
        self.data.len() == self.index.len()
    }

    /// Loaded items in batch key order
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.index
            .iter()
            .filter_map(|key| self.data.get(key).map(|value| (key, value)))
    }

    /// Apply `f` to every loaded item
    pub fn update<F: FnMut(&K, &mut V)>(&mut self, mut f: F) {
        for (key, value) in &mut self.data {
            f(key, value);
        }
    }

    /// Items in batch key order, `None` for keys not yet loaded
    pub fn values(&self) -> Vec<Option<&V>> {
        self.index.iter().map(|key| self.data.get(key)).collect()
    }
}
