//! Recorded action invocations
//!
//! A pipeline never calls an action while it is being built. It stores an
//! [`ActionCall`]: the action name plus its positional and keyword arguments.
//! Arguments are JSON values so that a chain can be printed, saved and
//! replayed without knowing any batch type.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;

/// A single argument value
pub type Value = serde_json::Value;

/// Positional and keyword arguments of one action call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    /// Positional arguments in call order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positional: Vec<Value>,

    /// Keyword arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keyword: BTreeMap<String, Value>,
}

impl Args {
    /// No arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments from positional values
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            positional: values.into_iter().map(Into::into).collect(),
            keyword: BTreeMap::new(),
        }
    }

    /// Append a positional argument
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Raw positional argument
    pub fn get(&self, position: usize) -> Option<&Value> {
        self.positional.get(position)
    }

    /// Raw keyword argument
    pub fn get_kw(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// Positional argument decoded into `T`
    pub fn at<T: DeserializeOwned>(&self, position: usize) -> anyhow::Result<T> {
        let value = self
            .get(position)
            .ok_or_else(|| anyhow!("missing positional argument {position}"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("positional argument {position} has the wrong type"))
    }

    /// Keyword argument decoded into `T`
    pub fn kw<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .get_kw(name)
            .ok_or_else(|| anyhow!("missing keyword argument `{name}`"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("keyword argument `{name}` has the wrong type"))
    }

    /// Keyword argument decoded into `T`, or `default` when absent
    pub fn kw_or<T: DeserializeOwned>(&self, name: &str, default: T) -> anyhow::Result<T> {
        match self.get_kw(name) {
            Some(_) => self.kw(name),
            None => Ok(default),
        }
    }

    /// Total number of arguments
    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    /// Whether there are no arguments at all
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

/// One recorded invocation: action name plus arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    /// Registered action name
    pub name: String,

    /// Arguments passed at recording time
    #[serde(default, skip_serializing_if = "Args::is_empty")]
    pub args: Args,
}

impl ActionCall {
    /// Create a call record
    pub fn new(name: impl Into<String>, args: Args) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// An append-only list of action calls
///
/// Calls can only be added at the tail, so replaying a chain always applies
/// the same actions in the same order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionChain {
    calls: Vec<ActionCall>,
}

impl ActionChain {
    /// An empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call at the tail
    #[must_use]
    pub fn append(mut self, name: impl Into<String>, args: Args) -> Self {
        self.push(ActionCall::new(name, args));
        self
    }

    /// Record a call without arguments at the tail
    #[must_use]
    pub fn then(self, name: impl Into<String>) -> Self {
        self.append(name, Args::new())
    }

    /// Record a call at the tail in place
    pub fn push(&mut self, call: ActionCall) {
        self.calls.push(call);
    }

    /// Append every call of `other`, in order
    pub fn extend(&mut self, other: &ActionChain) {
        self.calls.extend(other.calls.iter().cloned());
    }

    /// Recorded calls in order
    pub fn calls(&self) -> &[ActionCall] {
        &self.calls
    }

    /// Iterate over recorded calls
    pub fn iter(&self) -> std::slice::Iter<'_, ActionCall> {
        self.calls.iter()
    }

    /// Number of recorded calls
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Check every recorded name against the action registry of `B`
    pub fn validate_for<B: Batch>(&self) -> Result<()> {
        let registry = B::actions();
        match self.calls.iter().find(|call| !registry.contains(&call.name)) {
            Some(call) => Err(Error::UnknownAction {
                action: call.name.clone(),
                batch_type: registry.batch_type(),
            }),
            None => Ok(()),
        }
    }

    /// Bind this chain to a data source
    pub fn bind<B: Batch>(&self, dataset: &Dataset<B>) -> Pipeline<B> {
        Pipeline::with_chain(dataset, self.clone())
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl<'a> IntoIterator for &'a ActionChain {
    type Item = &'a ActionCall;
    type IntoIter = std::slice::Iter<'a, ActionCall>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
