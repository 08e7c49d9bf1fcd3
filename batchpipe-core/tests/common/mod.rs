#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{bail, Context};
use batchpipe_core::{ActionRegistry, Args, Batch, Dataset, Index, Items};

/// Numeric readings keyed by position; `load` fills value `key` for each key.
pub struct Readings {
    index: Index<usize>,
    pub values: Items<usize, f64>,
    pub trace: Vec<i64>,
}

impl Readings {
    pub fn new(index: Index<usize>) -> Self {
        Self {
            values: Items::new(index.clone()),
            index,
            trace: Vec::new(),
        }
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().map(|(_, v)| v).sum()
    }

    fn load(&mut self, _: &Args) -> anyhow::Result<()> {
        for key in self.index.iter() {
            self.values.insert(*key, *key as f64)?;
        }
        Ok(())
    }

    fn scale(&mut self, args: &Args) -> anyhow::Result<()> {
        let factor: f64 = args.at(0)?;
        self.values.update(|_, v| *v *= factor);
        Ok(())
    }

    fn push(&mut self, args: &Args) -> anyhow::Result<()> {
        self.trace.push(args.at(0)?);
        Ok(())
    }

    fn dump(&mut self, args: &Args) -> anyhow::Result<()> {
        let dir: PathBuf = args.kw("dir")?;
        let Some(first) = self.index.get(0) else {
            return Ok(());
        };
        let path = dir.join(format!("batch_{first:04}.csv"));
        let mut file = fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        for (key, value) in self.values.iter() {
            writeln!(file, "{key},{value}")?;
        }
        Ok(())
    }
}

impl Batch for Readings {
    type Key = usize;

    fn index(&self) -> &Index<usize> {
        &self.index
    }

    fn actions() -> &'static ActionRegistry<Self> {
        static ACTIONS: OnceLock<ActionRegistry<Readings>> = OnceLock::new();
        ACTIONS.get_or_init(|| {
            ActionRegistry::new()
                .with_action("load", Readings::load)
                .with_action("scale", Readings::scale)
                .with_action("push", Readings::push)
                .with_action("dump", Readings::dump)
                .with_action("fail", |_: &mut Readings, _: &Args| bail!("sensor offline"))
        })
    }
}

/// Labels for the same keys as `Readings`
pub struct Labels {
    index: Index<usize>,
    pub labels: Vec<String>,
}

impl Batch for Labels {
    type Key = usize;

    fn index(&self) -> &Index<usize> {
        &self.index
    }

    fn actions() -> &'static ActionRegistry<Self> {
        static ACTIONS: OnceLock<ActionRegistry<Labels>> = OnceLock::new();
        ACTIONS.get_or_init(|| {
            ActionRegistry::new().with_action("label", |b: &mut Labels, _: &Args| {
                b.labels = b.index.iter().map(|k| format!("class_{}", k % 3)).collect();
                Ok(())
            })
        })
    }
}

pub fn readings(len: usize) -> Dataset<Readings> {
    Dataset::new(Index::range(len), |index| Ok(Readings::new(index)))
}

pub fn labels(index: Index<usize>) -> Dataset<Labels> {
    Dataset::new(index, |index| {
        Ok(Labels {
            index,
            labels: Vec::new(),
        })
    })
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
