//! Lazy pipelines
//!
//! A [`Pipeline`] records action calls against a data source and does no work
//! until batches are requested. Recording is explicit (`append`), and every
//! recording returns a new pipeline value; the receiver is left untouched.
//!
//! Action names are only resolved against the batch type's registry when the
//! pipeline first executes, so an unknown name surfaces from `run`,
//! `next_batch` or `execute_for`, never from `append`.

use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::action::{ActionCall, ActionChain, Args};
use crate::batch::Batch;
use crate::batches::Batches;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::schedule::{self, CancelToken, GenBatch, IterConfig, Materialize, RunStats};

/// Where a pipeline gets its batches from
enum Source<B: Batch> {
    /// Build batches directly from a dataset
    Dataset(Dataset<B>),

    /// Replay a parent pipeline first
    Parent(Arc<Pipeline<B>>),
}

impl<B: Batch> Clone for Source<B> {
    fn clone(&self) -> Self {
        match self {
            Source::Dataset(dataset) => Source::Dataset(dataset.clone()),
            Source::Parent(parent) => Source::Parent(Arc::clone(parent)),
        }
    }
}

/// A recorded, not yet executed chain of actions bound to a data source
pub struct Pipeline<B: Batch> {
    /// Identifier of this pipeline value, used in logs
    id: Uuid,

    /// Data source or parent pipeline
    source: Source<B>,

    /// Calls recorded on this pipeline, after the parent's
    chain: ActionChain,

    /// Shuffle seed applied when a config does not carry one
    seed: Option<u64>,

    /// Lazily created cursor behind `next_batch`
    cursor: Option<Batches<B::Key>>,

    /// Cancellation flag observed by `run`
    cancel: CancelToken,
}

impl<B: Batch> Pipeline<B> {
    /// An empty pipeline over `dataset`
    pub fn new(dataset: &Dataset<B>) -> Self {
        Self::with_chain(dataset, ActionChain::new())
    }

    /// A pipeline over `dataset` with calls already recorded
    pub fn with_chain(dataset: &Dataset<B>, chain: ActionChain) -> Self {
        Self::from_source(Source::Dataset(dataset.clone()), chain, None)
    }

    /// A pipeline that replays `parent` and then its own calls
    pub fn from_parent(parent: &Pipeline<B>) -> Self {
        Self::from_source(
            Source::Parent(Arc::new(parent.snapshot())),
            ActionChain::new(),
            parent.seed,
        )
    }

    fn from_source(source: Source<B>, chain: ActionChain, seed: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            chain,
            seed,
            cursor: None,
            cancel: CancelToken::new(),
        }
    }

    /// Same definition without iteration state
    fn snapshot(&self) -> Self {
        Self {
            id: self.id,
            source: self.source.clone(),
            chain: self.chain.clone(),
            seed: self.seed,
            cursor: None,
            cancel: CancelToken::new(),
        }
    }

    /// A new pipeline value with the same definition
    fn derive(&self) -> Self {
        Self::from_source(self.source.clone(), self.chain.clone(), self.seed)
    }

    /// Record a call to `name`; nothing runs yet
    #[must_use]
    pub fn append(&self, name: impl Into<String>, args: Args) -> Self {
        let mut next = self.derive();
        next.chain.push(ActionCall::new(name, args));
        next
    }

    /// Record a call to `name` without arguments
    #[must_use]
    pub fn then(&self, name: impl Into<String>) -> Self {
        self.append(name, Args::new())
    }

    /// Record every call of `chain`
    #[must_use]
    pub fn append_chain(&self, chain: &ActionChain) -> Self {
        let mut next = self.derive();
        next.chain.extend(chain);
        next
    }

    /// This pipeline followed by every action of `other`
    ///
    /// The data source of `other` is ignored.
    #[must_use]
    pub fn concat(&self, other: &Pipeline<B>) -> Self {
        self.append_chain(&other.chain())
    }

    /// Fix the shuffle seed used by `run` and `next_batch`
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self.cursor = None;
        self
    }

    /// Identifier of this pipeline value
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The dataset at the root of this pipeline
    pub fn dataset(&self) -> &Dataset<B> {
        match &self.source {
            Source::Dataset(dataset) => dataset,
            Source::Parent(parent) => parent.dataset(),
        }
    }

    /// The keys this pipeline iterates over
    pub fn index(&self) -> &Index<B::Key> {
        self.dataset().index()
    }

    /// The parent pipeline, if this one was built from another
    pub fn parent(&self) -> Option<&Pipeline<B>> {
        match &self.source {
            Source::Parent(parent) => Some(parent.as_ref()),
            Source::Dataset(_) => None,
        }
    }

    /// Calls recorded on this pipeline itself, excluding the parent's
    pub fn own_chain(&self) -> &ActionChain {
        &self.chain
    }

    /// Every call this pipeline applies, parent calls first
    pub fn chain(&self) -> ActionChain {
        let mut chain = ActionChain::new();
        for call in self.calls() {
            chain.push(call.clone());
        }
        chain
    }

    /// Number of actions applied per batch
    pub fn num_actions(&self) -> usize {
        self.calls().len()
    }

    fn calls(&self) -> Vec<&ActionCall> {
        let mut calls = Vec::new();
        self.collect_calls(&mut calls);
        calls
    }

    fn collect_calls<'a>(&'a self, out: &mut Vec<&'a ActionCall>) {
        if let Source::Parent(parent) = &self.source {
            parent.collect_calls(out);
        }
        out.extend(self.chain.iter());
    }

    /// JSON description of the pipeline
    pub fn describe(&self) -> Result<String> {
        let description = json!({
            "id": self.id,
            "batch_type": std::any::type_name::<B>(),
            "keys": self.index().len(),
            "seed": self.seed,
            "actions": self.chain(),
        });
        Ok(serde_json::to_string_pretty(&description)?)
    }

    /// Check that every recorded action exists on `B`
    pub fn validate(&self) -> Result<()> {
        let registry = B::actions();
        match self.calls().into_iter().find(|call| !registry.contains(&call.name)) {
            Some(call) => Err(Error::UnknownAction {
                action: call.name.clone(),
                batch_type: registry.batch_type(),
            }),
            None => Ok(()),
        }
    }

    /// Apply every recorded action to `batch`, in recording order
    ///
    /// On failure the batch keeps the effects of the actions that completed,
    /// and the error names the failing action and its position.
    pub fn execute_for(&self, batch: &mut B) -> Result<()> {
        schedule::apply_chain(batch, self.calls())
    }

    /// Build the batch for `keys` and apply every recorded action
    ///
    /// The returned batch holds exactly `keys`; an action that changes them
    /// fails with [`Error::ChainFailure`].
    pub fn materialize(&self, keys: &Index<B::Key>) -> Result<B> {
        let mut batch = self.dataset().create_batch(keys)?;
        self.execute_for(&mut batch)?;
        Ok(batch)
    }

    fn seeded(&self, config: &IterConfig) -> IterConfig {
        let mut config = config.clone();
        if config.seed.is_none() {
            config.seed = self.seed;
        }
        config
    }

    /// Realized batches, one per chunk, produced as the iterator is advanced
    pub fn gen_batch(&self, config: &IterConfig) -> Result<GenBatch<'_, Self>> {
        Ok(GenBatch::new(self, &self.seeded(config))?.with_cancel(self.cancel.clone()))
    }

    /// Process the whole index and discard the batches
    ///
    /// Used for side effects such as writing preprocessed output. Without
    /// `one_pass` this only returns on error or cancellation.
    pub fn run(&self, batch_size: usize, shuffle: bool, one_pass: bool) -> Result<RunStats> {
        self.run_with(&IterConfig::from_flags(batch_size, shuffle, one_pass))
    }

    /// Process the index according to a full config and discard the batches
    pub fn run_with(&self, config: &IterConfig) -> Result<RunStats> {
        info!(pipeline = %self.id, actions = self.num_actions(), "running pipeline");
        schedule::run_to_end(self, &self.seeded(config), Some(self.cancel.clone()))
    }

    /// The next realized batch from an endless, internally kept sequence
    ///
    /// The sequence is created on the first call and restarts (reshuffling
    /// when `shuffle` is set) each time the index is exhausted. Changing
    /// `batch_size` or `shuffle` between calls starts a new sequence.
    pub fn next_batch(&mut self, batch_size: usize, shuffle: bool) -> Result<B> {
        let stale = self
            .cursor
            .as_ref()
            .is_none_or(|cursor| cursor.batch_size() != batch_size || cursor.is_shuffled() != shuffle);

        if stale {
            self.validate()?;
            let config = self.seeded(&IterConfig::from_flags(batch_size, shuffle, false));
            let cursor = self.index().iter_batches(&config)?;
            debug!(pipeline = %self.id, batch_size, shuffle, seed = cursor.seed(), "created batch cursor");
            self.cursor = Some(cursor);
        }

        let keys = self
            .cursor
            .as_mut()
            .and_then(Iterator::next)
            .ok_or(Error::Exhausted)?;
        self.materialize(&keys)
    }

    /// Drop the `next_batch` sequence; the next call starts from scratch
    pub fn reset_iter(&mut self) {
        self.cursor = None;
    }

    /// The `next_batch` cursor, once created
    pub fn cursor(&self) -> Option<&Batches<B::Key>> {
        self.cursor.as_ref()
    }

    /// The same actions bound to a subset of the dataset
    pub fn with_index(&self, index: &Index<B::Key>) -> Result<Self> {
        let dataset = self.dataset().subset(index)?;
        Ok(Self::from_source(Source::Dataset(dataset), self.chain(), self.seed))
    }

    /// Token that cancels `run` and `gen_batch` between steps
    ///
    /// Every pipeline owns its token, clones included. A cancelled token stays
    /// cancelled, so later runs fail with [`Error::Cancelled`] until
    /// [`CancelToken::reset`] is called.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl<B: Batch> Clone for Pipeline<B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            source: self.source.clone(),
            chain: self.chain.clone(),
            seed: self.seed,
            cursor: self.cursor.clone(),
            cancel: CancelToken::new(),
        }
    }
}

impl<B: Batch> fmt::Debug for Pipeline<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.calls().iter().map(|call| call.name.as_str()).collect();
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("batch_type", &std::any::type_name::<B>())
            .field("keys", &self.index().len())
            .field("actions", &names)
            .finish()
    }
}

impl<B: Batch> Add for Pipeline<B> {
    type Output = Pipeline<B>;

    fn add(self, other: Pipeline<B>) -> Pipeline<B> {
        self.concat(&other)
    }
}

impl<B: Batch> Add<&Pipeline<B>> for &Pipeline<B> {
    type Output = Pipeline<B>;

    fn add(self, other: &Pipeline<B>) -> Pipeline<B> {
        self.concat(other)
    }
}

impl<B: Batch> Materialize for Pipeline<B> {
    type Key = B::Key;
    type Output = B;

    fn index(&self) -> &Index<B::Key> {
        Pipeline::index(self)
    }

    fn materialize(&self, keys: &Index<B::Key>) -> Result<B> {
        Pipeline::materialize(self, keys)
    }

    fn validate(&self) -> Result<()> {
        Pipeline::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ActionRegistry;
    use anyhow::bail;
    use std::sync::OnceLock;

    #[derive(Debug)]
    struct Value {
        index: Index<usize>,
        value: f64,
        trace: Vec<String>,
    }

    impl Batch for Value {
        type Key = usize;

        fn index(&self) -> &Index<usize> {
            &self.index
        }

        fn actions() -> &'static ActionRegistry<Self> {
            static ACTIONS: OnceLock<ActionRegistry<Value>> = OnceLock::new();
            ACTIONS.get_or_init(|| {
                ActionRegistry::new()
                    .with_action("double", |b: &mut Value, _: &Args| {
                        b.value *= 2.0;
                        b.trace.push("double".into());
                        Ok(())
                    })
                    .with_action("add", |b: &mut Value, args: &Args| {
                        b.value += args.at::<f64>(0)?;
                        b.trace.push("add".into());
                        Ok(())
                    })
                    .with_action("fail", |_: &mut Value, _: &Args| bail!("refused"))
                    .with_action("drop_first", |b: &mut Value, _: &Args| {
                        let first = b.index.get(0).copied();
                        b.index = b.index.subset_by(|key| Some(*key) != first);
                        Ok(())
                    })
            })
        }
    }

    fn dataset(len: usize) -> Dataset<Value> {
        Dataset::new(Index::range(len), |index| {
            Ok(Value {
                value: index.len() as f64,
                index,
                trace: Vec::new(),
            })
        })
    }

    fn value(start: f64) -> Value {
        Value {
            index: Index::range(1),
            value: start,
            trace: Vec::new(),
        }
    }

    #[test]
    fn test_double_twice() {
        let pipeline = dataset(1).pipeline().then("double").then("double");
        let mut batch = value(5.0);
        pipeline.execute_for(&mut batch).unwrap();
        assert_eq!(batch.value, 20.0);
    }

    #[test]
    fn test_recording_does_not_mutate_receiver() {
        let base = dataset(4).pipeline().then("double");
        let extended = base.append("add", Args::positional([1.0]));
        assert_eq!(base.num_actions(), 1);
        assert_eq!(extended.num_actions(), 2);
        assert_ne!(base.id(), extended.id());
    }

    #[test]
    fn test_actions_run_in_recording_order() {
        let pipeline = dataset(1)
            .pipeline()
            .append("add", Args::positional([1.0]))
            .then("double")
            .append("add", Args::positional([3.0]));
        let mut batch = value(0.0);
        pipeline.execute_for(&mut batch).unwrap();
        assert_eq!(batch.value, 5.0);
        assert_eq!(batch.trace, vec!["add", "double", "add"]);
    }

    #[test]
    fn test_unknown_action_deferred_to_execution() {
        let pipeline = dataset(4).pipeline().then("double").then("resize");
        let err = pipeline.run(2, false, true).unwrap_err();
        assert!(matches!(err, Error::UnknownAction { ref action, .. } if action == "resize"));
    }

    #[test]
    fn test_chain_failure_keeps_partial_state() {
        let pipeline = dataset(1).pipeline().then("double").then("fail").then("double");
        let mut batch = value(3.0);
        let err = pipeline.execute_for(&mut batch).unwrap_err();
        match err {
            Error::ChainFailure {
                action,
                position,
                last_applied,
                ..
            } => {
                assert_eq!(action, "fail");
                assert_eq!(position, 1);
                assert_eq!(last_applied, Some(0));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(batch.value, 6.0);
    }

    #[test]
    fn test_action_changing_keys_fails_chain() {
        let pipeline = dataset(6).pipeline().then("double").then("drop_first");
        let keys = pipeline.index().subset(&[2, 3]).unwrap();
        match pipeline.materialize(&keys).unwrap_err() {
            Error::ChainFailure {
                action, position, ..
            } => {
                assert_eq!(action, "drop_first");
                assert_eq!(position, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(pipeline.run(2, false, true), Err(Error::ChainFailure { .. })));
    }

    #[test]
    fn test_parent_replayed_first() {
        let parent = dataset(1).pipeline().append("add", Args::positional([1.0]));
        let child = Pipeline::from_parent(&parent).then("double");
        let mut batch = value(0.0);
        child.execute_for(&mut batch).unwrap();
        assert_eq!(batch.value, 2.0);
        assert!(child.parent().is_some());
        assert_eq!(child.own_chain().len(), 1);
        assert_eq!(child.num_actions(), 2);
    }

    #[test]
    fn test_concat() {
        let ds = dataset(1);
        let a = ds.pipeline().then("double");
        let b = ds.pipeline().append("add", Args::positional([1.0]));
        let joined = &a + &b;
        let names: Vec<_> = joined.chain().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["double", "add"]);
    }

    #[test]
    fn test_run_counts_every_batch() {
        let stats = dataset(10).pipeline().then("double").run(3, false, true).unwrap();
        assert_eq!(stats.batches_processed, 4);
        assert_eq!(stats.items_processed, 10);
        assert_eq!(stats.epochs_completed, 1);
    }

    #[test]
    fn test_next_batch_never_exhausts() {
        let mut pipeline = dataset(5).pipeline().then("double").with_seed(9);
        let mut seen = Vec::new();
        for _ in 0..7 {
            let batch = pipeline.next_batch(2, true).unwrap();
            assert_eq!(batch.value, batch.len() as f64 * 2.0);
            seen.extend_from_slice(batch.keys());
        }
        // first epoch covers every key exactly once
        let mut first: Vec<_> = seen[..5].to_vec();
        first.sort_unstable();
        assert_eq!(first, vec![0, 1, 2, 3, 4]);
        assert_eq!(pipeline.cursor().unwrap().epoch(), 2);
    }

    #[test]
    fn test_next_batch_restarts_on_new_settings() {
        let mut pipeline = dataset(6).pipeline();
        assert_eq!(pipeline.next_batch(4, false).unwrap().keys(), &[0, 1, 2, 3]);
        assert_eq!(pipeline.next_batch(2, false).unwrap().keys(), &[0, 1]);
        pipeline.reset_iter();
        assert_eq!(pipeline.next_batch(2, false).unwrap().keys(), &[0, 1]);
    }

    #[test]
    fn test_next_batch_on_empty_index() {
        let mut pipeline = dataset(0).pipeline();
        assert!(matches!(pipeline.next_batch(2, false), Err(Error::Exhausted)));
    }

    #[test]
    fn test_with_index_scopes_keys() {
        let pipeline = dataset(10).pipeline().then("double");
        let sub = pipeline.index().subset(&[7, 8]).unwrap();
        let scoped = pipeline.with_index(&sub).unwrap();
        let batches: Vec<_> = scoped.gen_batch(&IterConfig::new(5)).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].keys(), &[7, 8]);
        assert_eq!(batches[0].value, 4.0);
    }

    #[test]
    fn test_cancel_token_stops_run() {
        let pipeline = dataset(4).pipeline();
        pipeline.cancel_token().cancel();
        assert!(matches!(pipeline.run(2, false, false), Err(Error::Cancelled)));
        assert!(matches!(pipeline.run(2, false, true), Err(Error::Cancelled)));

        pipeline.cancel_token().reset();
        assert_eq!(pipeline.run(2, false, true).unwrap().batches_processed, 2);
    }

    #[test]
    fn test_clone_has_its_own_cancel_token() {
        let pipeline = dataset(4).pipeline().then("double");
        let copy = pipeline.clone();
        copy.cancel_token().cancel();
        assert!(matches!(copy.run(2, false, true), Err(Error::Cancelled)));
        assert_eq!(pipeline.run(2, false, true).unwrap().batches_processed, 2);
        assert_eq!(copy.id(), pipeline.id());
    }

    #[test]
    fn test_describe_lists_actions() {
        let pipeline = dataset(3).pipeline().append("add", Args::positional([2.0]));
        let description: serde_json::Value = serde_json::from_str(&pipeline.describe().unwrap()).unwrap();
        assert_eq!(description["keys"], 3);
        assert_eq!(description["actions"][0]["name"], "add");
    }
}
