//! End-to-end scenarios for datasets, pipelines and paired datasets.
//!
//! Tests cover:
//! - Chunking a small named index
//! - Deferred execution and action ordering
//! - Chain failures and unknown actions
//! - Writing batches through a storage action
//! - Paired datasets and cross-validation splits

mod common;
use common::{init_tracing, labels, readings, Readings};

use std::fs;

use anyhow::Result;
use batchpipe_core::{ActionChain, Args, Batch, Error, Index, IterConfig, PairedDataset, Pipeline};
use test_case::test_case;

// ================================================================================================
// 1. Index chunking
// ================================================================================================

fn named_keys() -> Index<String> {
    Index::new((1..=10).map(|i| format!("k{i}")).collect()).unwrap()
}

#[test_case(3, &[3, 3, 3, 1] ; "short final chunk kept")]
#[test_case(5, &[5, 5] ; "even split")]
#[test_case(10, &[10] ; "single chunk")]
#[test_case(12, &[10] ; "batch larger than index")]
fn test_one_pass_chunk_sizes(batch_size: usize, expected: &[usize]) -> Result<()> {
    let sizes: Vec<usize> = named_keys()
        .batches(batch_size, false, true)?
        .map(|chunk| chunk.len())
        .collect();
    assert_eq!(sizes, expected);
    Ok(())
}

#[test]
fn test_chunks_follow_index_order() -> Result<()> {
    let chunks: Vec<Vec<String>> = named_keys()
        .batches(3, false, true)?
        .map(|chunk| chunk.keys().to_vec())
        .collect();
    assert_eq!(chunks[0], vec!["k1", "k2", "k3"]);
    assert_eq!(chunks[3], vec!["k10"]);
    Ok(())
}

#[test]
fn test_shuffled_pass_covers_every_key_once() -> Result<()> {
    let index = named_keys();
    let mut seen: Vec<String> = index
        .iter_batches(&IterConfig::new(4).with_shuffle(true).with_seed(17))?
        .flat_map(|chunk| chunk.keys().to_vec())
        .collect();
    seen.sort();
    let mut expected = index.keys().to_vec();
    expected.sort();
    assert_eq!(seen, expected);
    Ok(())
}

// ================================================================================================
// 2. Deferred execution
// ================================================================================================

#[test_case(0, 5.0 ; "no scaling")]
#[test_case(1, 10.0 ; "scaled once")]
#[test_case(2, 20.0 ; "scaled twice")]
fn test_recorded_scaling(times: usize, expected: f64) -> Result<()> {
    let dataset = readings(10);
    let mut pipeline = dataset.pipeline().then("load");
    for _ in 0..times {
        pipeline = pipeline.append("scale", Args::positional([2.0]));
    }

    let keys = dataset.index().subset(&[5])?;
    let batch = pipeline.materialize(&keys)?;
    assert_eq!(batch.sum(), expected);
    Ok(())
}

#[test]
fn test_nothing_runs_until_requested() -> Result<()> {
    // "fail" is recorded but only raises once a batch is processed
    let pipeline = readings(4).pipeline().then("load").then("fail");
    assert_eq!(pipeline.num_actions(), 2);

    let err = pipeline.run(2, false, true).unwrap_err();
    assert_eq!(err.failed_position(), Some(1));
    Ok(())
}

#[test]
fn test_unknown_action_names_the_batch_type() {
    let err = readings(4).pipeline().then("load").then("resize").run(2, false, true).unwrap_err();
    match err {
        Error::UnknownAction { action, batch_type } => {
            assert_eq!(action, "resize");
            assert!(batch_type.ends_with("Readings"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_chain_failure_keeps_earlier_effects() -> Result<()> {
    let pipeline = readings(4)
        .pipeline()
        .then("load")
        .append("scale", Args::positional([3.0]))
        .then("fail");

    let mut batch = Readings::new(Index::new(vec![1, 2])?);
    let err = pipeline.execute_for(&mut batch).unwrap_err();
    match err {
        Error::ChainFailure {
            action,
            position,
            last_applied,
            ..
        } => {
            assert_eq!(action, "fail");
            assert_eq!(position, 2);
            assert_eq!(last_applied, Some(1));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(batch.sum(), 9.0);
    Ok(())
}

#[test]
fn test_template_chain_bound_later() -> Result<()> {
    let template = ActionChain::new()
        .then("load")
        .append("scale", Args::positional([0.5]));
    let restored = ActionChain::from_json(&template.to_json()?)?;

    let dataset = readings(8);
    let pipeline: Pipeline<Readings> = restored.bind(&dataset);
    let batch = pipeline.materialize(&dataset.index().subset(&[2, 4])?)?;
    assert_eq!(batch.sum(), 3.0);
    Ok(())
}

#[test]
fn test_gen_batch_yields_processed_batches() -> Result<()> {
    let pipeline = readings(7).pipeline().then("load");
    let sums: Vec<f64> = pipeline
        .gen_batch(&IterConfig::new(3))?
        .map(|batch| batch.map(|b| b.sum()))
        .collect::<batchpipe_core::Result<_>>()?;
    assert_eq!(sums, vec![3.0, 12.0, 6.0]);
    Ok(())
}

#[test]
fn test_run_for_several_epochs() -> Result<()> {
    let stats = readings(10)
        .pipeline()
        .then("load")
        .run_with(&IterConfig::new(4).with_shuffle(true).with_seed(2).epochs(3))?;
    assert_eq!(stats.epochs_completed, 3);
    assert_eq!(stats.batches_processed, 9);
    assert_eq!(stats.items_processed, 30);
    Ok(())
}

// ================================================================================================
// 3. Storage collaborator
// ================================================================================================

#[test]
fn test_dump_writes_every_item_once() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let dir_arg = dir.path().to_string_lossy().into_owned();

    let stats = readings(10)
        .pipeline()
        .then("load")
        .append("scale", Args::positional([10.0]))
        .append("dump", Args::new().kwarg("dir", dir_arg))
        .run(4, false, true)?;
    assert_eq!(stats.batches_processed, 3);

    let mut files: Vec<_> = fs::read_dir(dir.path())?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    files.sort();
    assert_eq!(files, vec!["batch_0000.csv", "batch_0004.csv", "batch_0008.csv"]);

    let last = fs::read_to_string(dir.path().join("batch_0008.csv"))?;
    assert_eq!(last.lines().collect::<Vec<_>>(), vec!["8,80", "9,90"]);
    Ok(())
}

// ================================================================================================
// 4. Paired datasets and splits
// ================================================================================================

#[test]
fn test_paired_sides_share_keys() -> Result<()> {
    let primary = readings(9);
    let secondary = labels(primary.index().shuffle(3));
    let mut paired = PairedDataset::new(primary.pipeline().then("load"), secondary.pipeline().then("label"))?
        .with_seed(8);

    for _ in 0..5 {
        let (values, tags) = paired.next_batch(4, true)?;
        assert_eq!(values.keys(), tags.keys());
        assert_eq!(values.values.loaded(), tags.labels.len());
    }
    Ok(())
}

#[test_case(&[0, 1, 2], &[0, 1] ; "secondary missing a key")]
#[test_case(&[0, 1], &[0, 1, 2] ; "primary missing a key")]
#[test_case(&[0, 1, 2], &[0, 1, 3] ; "different keys")]
fn test_paired_mismatch(primary: &[usize], secondary: &[usize]) -> Result<()> {
    let primary = readings(4).subset(&Index::new(primary.to_vec())?)?;
    let secondary = labels(Index::new(secondary.to_vec())?);
    let err = PairedDataset::from_datasets(&primary, &secondary).unwrap_err();
    assert!(matches!(err, Error::Synchronization(_)));
    Ok(())
}

#[test_case(&[0.7, 0.2, 0.1], &[70, 20, 10], 0 ; "full cover")]
#[test_case(&[0.5, 0.25], &[50, 25], 25 ; "remainder left over")]
#[test_case(&[1.0], &[100], 0 ; "train only")]
fn test_paired_cv_split(proportions: &[f64], sizes: &[usize], remainder: usize) -> Result<()> {
    let primary = readings(100);
    let secondary = labels(primary.index().clone());
    let paired = PairedDataset::from_datasets(&primary, &secondary)?;

    let split = paired.cv_split(proportions, Some(42))?;
    let got: Vec<usize> = split.iter().map(|(_, part)| part.len()).collect();
    assert_eq!(got, sizes);
    assert_eq!(split.remainder().len(), remainder);

    let train = split.train().unwrap();
    for (_, part) in split.iter().skip(1) {
        assert!(part.index().iter().all(|k| !train.index().contains(k)));
    }
    Ok(())
}

#[test]
fn test_cv_split_rejects_overfull_proportions() {
    let primary = readings(10);
    let paired = PairedDataset::from_datasets(&primary, &labels(primary.index().clone())).unwrap();
    assert!(matches!(paired.cv_split(&[0.6, 0.6], None), Err(Error::Configuration(_))));
}
