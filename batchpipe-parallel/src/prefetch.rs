//! Background batch preparation
//!
//! A [`Prefetcher`] materializes upcoming batches on worker threads while the
//! consumer works on the current one. One feeder thread owns the key cursor
//! and numbers every chunk; workers build and process chunks in any order;
//! the consumer reorders results by number. Output order is therefore the
//! order a single-threaded `next_batch` loop with the same config produces.
//!
//! The feeder takes a permit before handing out a chunk and the consumer
//! returns it when that chunk is delivered, so at most `depth + workers`
//! chunks are materialized or in progress but not yet delivered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use batchpipe_core::{Batches, Index, IterConfig, Key, Materialize};
use crossbeam::channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Configuration for a prefetcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Keys per batch
    pub batch_size: usize,

    /// Whether every pass visits keys in a fresh random order
    pub shuffle: bool,

    /// Seed for shuffling; drawn at random when unset
    pub seed: Option<u64>,

    /// Passes over the index before stopping, `None` to repeat forever
    pub n_epochs: Option<usize>,

    /// Number of worker threads
    pub workers: usize,

    /// Chunks prepared ahead of the consumer, on top of one per worker
    pub depth: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            seed: None,
            n_epochs: None,
            workers: num_cpus::get(),
            depth: 2,
        }
    }
}

impl PrefetchConfig {
    /// Endless iteration with the given batch size
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
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

    /// Stop after `n_epochs` passes
    #[must_use]
    pub fn epochs(mut self, n_epochs: usize) -> Self {
        self.n_epochs = Some(n_epochs);
        self
    }

    /// Set the number of worker threads
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set how many chunks are queued ahead
    #[must_use]
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// The iteration part of this config
    pub fn iter_config(&self) -> IterConfig {
        IterConfig {
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            seed: self.seed,
            n_epochs: self.n_epochs,
        }
    }

    /// Check the config
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidArgument("workers must be at least 1".into()));
        }
        if self.depth == 0 {
            return Err(Error::InvalidArgument("depth must be at least 1".into()));
        }
        self.iter_config().validate()?;
        Ok(())
    }

    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(batchpipe_core::Error::from)?;
        config.validate()?;
        Ok(config)
    }
}

type Job<K> = (u64, Index<K>);
type Done<T> = (u64, batchpipe_core::Result<T>);

/// Materializes batches ahead of the consumer on worker threads
///
/// Dropping the prefetcher stops and joins every thread.
pub struct Prefetcher<M: Materialize> {
    /// Finished batches, tagged with their sequence number
    results: Option<Receiver<Done<M::Output>>>,

    /// Batches that arrived before their turn
    pending: BTreeMap<u64, batchpipe_core::Result<M::Output>>,

    /// Sequence number handed out next
    next_seq: u64,

    /// Shutdown flag shared with every thread
    shutdown: Arc<AtomicBool>,

    /// Returns a lookahead permit to the feeder per delivered batch
    permits: Option<Sender<()>>,

    /// Feeder and worker threads
    threads: Vec<JoinHandle<()>>,

    /// Set after the last batch or the first error
    done: bool,
}

impl<M> Prefetcher<M>
where
    M: Materialize + 'static,
    M::Output: 'static,
{
    /// Start prefetching from `source`
    pub fn new(source: Arc<M>, config: &PrefetchConfig) -> Result<Self> {
        config.validate()?;
        source.validate()?;
        let batches = source.index().iter_batches(&config.iter_config())?;

        let window = config.depth + config.workers;
        let (done_tx, done_rx) = bounded::<Done<M::Output>>(window);
        let (permit_tx, permit_rx) = bounded::<()>(window);
        for _ in 0..window {
            permit_tx.send(()).map_err(|_| Error::Disconnected)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(config.workers + 1);
        let channels = Channels {
            done: done_tx,
            permits: permit_rx,
        };
        let spawned = spawn_threads(&mut threads, source, batches, config, channels, &shutdown);

        // On a spawn failure, dropping this value stops and joins whatever started
        let prefetcher = Self {
            results: Some(done_rx),
            pending: BTreeMap::new(),
            next_seq: 0,
            shutdown,
            permits: Some(permit_tx),
            threads,
            done: false,
        };
        spawned?;

        info!(
            workers = config.workers,
            depth = config.depth,
            batch_size = config.batch_size,
            "prefetcher started"
        );
        Ok(prefetcher)
    }

    /// The next batch, waiting for it if it is not ready
    pub fn next_batch(&mut self) -> Result<M::Output> {
        self.next()
            .unwrap_or(Err(Error::Core(batchpipe_core::Error::Exhausted)))
    }

    /// Number of batches handed to the consumer so far
    pub fn delivered(&self) -> u64 {
        self.next_seq
    }
}

impl<M> Iterator for Prefetcher<M>
where
    M: Materialize + 'static,
    M::Output: 'static,
{
    type Item = Result<M::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if let Some(output) = self.pending.remove(&self.next_seq) {
                self.next_seq += 1;
                if let Some(permits) = &self.permits {
                    // fails only once the feeder has finished
                    let _ = permits.send(());
                }
                if output.is_err() {
                    self.done = true;
                }
                return Some(output.map_err(Error::from));
            }

            let received = self.results.as_ref().map(Receiver::recv);
            match received {
                Some(Ok((seq, output))) => {
                    self.pending.insert(seq, output);
                }
                _ => {
                    self.done = true;
                    // Every sender is gone: either the sequence ended or a
                    // thread died with batches still owed
                    if self.pending.is_empty() {
                        debug!(batches = self.next_seq, "prefetch sequence finished");
                        return None;
                    }
                    return Some(Err(Error::Disconnected));
                }
            }
        }
    }
}

impl<M: Materialize> Drop for Prefetcher<M> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // closing both channels unblocks workers waiting to send and the
        // feeder waiting for a permit
        self.results.take();
        self.permits.take();
        self.pending.clear();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("prefetch thread panicked");
            }
        }
    }
}

/// Thread-side ends of the result and permit channels
struct Channels<T> {
    done: Sender<Done<T>>,
    permits: Receiver<()>,
}

fn spawn_threads<M>(
    threads: &mut Vec<JoinHandle<()>>,
    source: Arc<M>,
    batches: Batches<M::Key>,
    config: &PrefetchConfig,
    channels: Channels<M::Output>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()>
where
    M: Materialize + 'static,
    M::Output: 'static,
{
    let Channels { done: done_tx, permits } = channels;
    let (job_tx, job_rx) = bounded::<Job<M::Key>>(config.depth);

    for worker_id in 0..config.workers {
        let source = Arc::clone(&source);
        let job_rx = job_rx.clone();
        let done_tx = done_tx.clone();
        let shutdown = Arc::clone(shutdown);
        spawn(threads, format!("batchpipe-worker-{worker_id}"), move || {
            work(source.as_ref(), &job_rx, &done_tx, &shutdown);
        })?;
    }

    let shutdown = Arc::clone(shutdown);
    spawn(threads, "batchpipe-feeder".to_string(), move || {
        feed(batches, &job_tx, &permits, &shutdown);
    })
}

fn spawn<F>(threads: &mut Vec<JoinHandle<()>>, name: String, body: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new().name(name).spawn(body).map_err(Error::Spawn)?;
    threads.push(handle);
    Ok(())
}

fn feed<K: Key>(
    batches: Batches<K>,
    jobs: &Sender<Job<K>>,
    permits: &Receiver<()>,
    shutdown: &AtomicBool,
) {
    for (seq, keys) in (0u64..).zip(batches) {
        if permits.recv().is_err() || shutdown.load(Ordering::SeqCst) {
            return;
        }
        if jobs.send((seq, keys)).is_err() {
            return;
        }
    }
}

fn work<M: Materialize>(
    source: &M,
    jobs: &Receiver<Job<M::Key>>,
    done: &Sender<Done<M::Output>>,
    shutdown: &AtomicBool,
) {
    while let Ok((seq, keys)) = jobs.recv() {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        if done.send((seq, source.materialize(&keys))).is_err() {
            return;
        }
    }
}
