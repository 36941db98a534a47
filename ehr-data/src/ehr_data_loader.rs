use crate::cohort::{Cohort, EhrDims};
use crate::episode::{Episode, EvalTask, TaskBatch};
use crate::folds::*;
use crate::subset::Subset;

use candle_util::candle_core::Device;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;

// seed streams
const STREAM_FOLDS: u64 = 1;
const STREAM_SOURCE_SUPPORT: u64 = 2;
const STREAM_EPISODE: u64 = 3;
const STREAM_EPISODE_VAL: u64 = 4;

pub struct DataLoaderArgs {
    pub n_classes: usize,
    pub n_fold: usize,
    pub n_visits: Option<usize>,
    pub n_codes: Option<usize>,
    pub meta_batch_size: usize,
    /// samples per support/query set at test time
    pub update_batch_size: usize,
    /// samples per support/query set in meta-training episodes
    pub train_update_batch_size: usize,
    pub n_total_batches: usize,
    pub finetune_val_ratio: f32,
    pub seed: u64,
}

struct FoldSplit {
    target_train_pools: Vec<Vec<usize>>,
    target_val: Vec<usize>,
    tt_train: Vec<usize>,
    tt_val: Vec<usize>,
    tt_test: Vec<usize>,
}

/// Cohorts of a source/target/true-target experiment with their
/// fold partitions and episode samplers
pub struct EhrDataLoader {
    pub n_fold: usize,
    args: DataLoaderArgs,
    dims: EhrDims,
    source: Vec<Arc<Cohort>>,
    source_pools: Vec<Vec<Vec<usize>>>,
    target: Arc<Cohort>,
    true_target: Arc<Cohort>,
    folds: Vec<FoldSplit>,
    source_support: Subset,
}

impl EhrDataLoader {
    /// Read every task from `data_dir`
    pub fn load(
        data_dir: &Path,
        source: &[Box<str>],
        target: &str,
        true_target: &str,
        args: DataLoaderArgs,
    ) -> anyhow::Result<Self> {
        let source = source
            .iter()
            .map(|s| Cohort::read(data_dir, s))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let target = Cohort::read(data_dir, target)?;
        let true_target = Cohort::read(data_dir, true_target)?;
        Self::from_cohorts(source, target, true_target, args)
    }

    pub fn from_cohorts(
        source: Vec<Cohort>,
        target: Cohort,
        true_target: Cohort,
        args: DataLoaderArgs,
    ) -> anyhow::Result<Self> {
        if source.is_empty() {
            return Err(anyhow::anyhow!("need at least one source task"));
        }
        if args.n_fold < 2 {
            return Err(anyhow::anyhow!("n_fold must be at least 2, got {}", args.n_fold));
        }
        if args.meta_batch_size == 0 || args.update_batch_size == 0 || args.train_update_batch_size == 0 {
            return Err(anyhow::anyhow!("batch sizes must be positive"));
        }

        for c in source.iter().chain([&target, &true_target]) {
            c.check_labels(args.n_classes)?;
            if c.is_empty() {
                return Err(anyhow::anyhow!("{}: empty cohort", c.name));
            }
        }
        for c in [&target, &true_target] {
            if c.len() < args.n_fold {
                return Err(anyhow::anyhow!(
                    "{}: {} samples cannot fill {} folds",
                    c.name,
                    c.len(),
                    args.n_fold
                ));
            }
        }

        let dims = {
            let mut all: Vec<&Cohort> = source.iter().collect();
            all.push(&target);
            all.push(&true_target);
            EhrDims::infer(&all, args.n_visits, args.n_codes)?
        };

        info!(
            "EHR input: {} visits x {} codes, {} classes",
            dims.n_visits, dims.n_codes, args.n_classes
        );

        let source: Vec<Arc<Cohort>> = source.into_iter().map(Arc::new).collect();
        let target = Arc::new(target);
        let true_target = Arc::new(true_target);

        let source_pools = source
            .iter()
            .map(|c| c.class_pools(args.n_classes))
            .collect::<Vec<_>>();

        let mut rng = StdRng::seed_from_u64(derive_seed(args.seed, STREAM_FOLDS, 0));
        let target_folds = stratified_kfold(&target.labels, args.n_fold, &mut rng);
        let tt_folds = stratified_kfold(&true_target.labels, args.n_fold, &mut rng);

        let mut folds = Vec::with_capacity(args.n_fold);
        for i in 0..args.n_fold {
            let target_rest: Vec<usize> = others(&target_folds, i);
            let tt_rest: Vec<usize> = others(&tt_folds, i);
            let (tt_train, tt_val) = stratified_holdout(
                &tt_rest,
                &true_target.labels,
                args.finetune_val_ratio,
                &mut rng,
            );
            folds.push(FoldSplit {
                target_train_pools: target.pools_of(&target_rest, args.n_classes),
                target_val: target_folds[i].clone(),
                tt_train,
                tt_val,
                tt_test: tt_folds[i].clone(),
            });
        }

        // a fixed support set for test-time adaptation
        let source_support = {
            let mut rng = StdRng::seed_from_u64(derive_seed(args.seed, STREAM_SOURCE_SUPPORT, 0));
            let parts = sample_sources(
                &source,
                &source_pools,
                args.update_batch_size,
                &mut rng,
            )?;
            Subset::concat(&parts)
        };

        for (c, p) in source.iter().zip(source_pools.iter()) {
            info!("source {}: {} samples, class sizes {:?}", c.name, c.len(), class_sizes(p));
        }
        info!(
            "simulated target {}: {} samples; true target {}: {} samples; {} folds",
            target.name,
            target.len(),
            true_target.name,
            true_target.len(),
            args.n_fold
        );

        Ok(Self {
            n_fold: args.n_fold,
            args,
            dims,
            source,
            source_pools,
            target,
            true_target,
            folds,
            source_support,
        })
    }

    pub fn dims(&self) -> &EhrDims {
        &self.dims
    }

    pub fn n_classes(&self) -> usize {
        self.args.n_classes
    }

    pub fn source_names(&self) -> Vec<Box<str>> {
        self.source.iter().map(|c| c.name.clone()).collect()
    }

    fn fold(&self, fold: usize) -> anyhow::Result<&FoldSplit> {
        self.folds
            .get(fold)
            .ok_or_else(|| anyhow::anyhow!("fold {} out of [0, {})", fold, self.n_fold))
    }

    /// Meta-training episode `itr` of `fold`.
    ///
    /// Task `t` takes its support set from source task `t mod
    /// #sources` and its query set from the simulated target outside
    /// the fold's validation part. The same `(seed, fold, itr mod
    /// n_total_batches)` always gives the same episode.
    pub fn episode(&self, fold: usize, itr: usize, device: &Device) -> anyhow::Result<Episode> {
        let split = self.fold(fold)?;
        let index = (itr % self.args.n_total_batches.max(1)) as u64;
        let mut rng = StdRng::seed_from_u64(derive_seed(
            derive_seed(self.args.seed, STREAM_EPISODE, fold as u64),
            STREAM_EPISODE,
            index,
        ));

        let ubs = self.args.train_update_batch_size;
        let mut tasks = Vec::with_capacity(self.args.meta_batch_size);

        for t in 0..self.args.meta_batch_size {
            let s = t % self.source.len();
            let support_pos = stratified_sample(&self.source_pools[s], ubs, &mut rng)?;
            let query_pos = stratified_sample(&split.target_train_pools, ubs, &mut rng)?;

            tasks.push(TaskBatch {
                support: Subset::new(&self.source[s], &support_pos).to_batch(
                    &self.dims,
                    self.args.n_classes,
                    device,
                )?,
                query: Subset::new(&self.target, &query_pos).to_batch(
                    &self.dims,
                    self.args.n_classes,
                    device,
                )?,
            });
        }

        Ok(Episode {
            iteration: itr,
            tasks,
        })
    }

    /// Validation task of `fold`: a source support set and the
    /// simulated target's held-out fold
    pub fn episode_val(&self, fold: usize) -> anyhow::Result<EvalTask> {
        let split = self.fold(fold)?;
        let mut rng = StdRng::seed_from_u64(derive_seed(
            self.args.seed,
            STREAM_EPISODE_VAL,
            fold as u64,
        ));
        let parts = sample_sources(
            &self.source,
            &self.source_pools,
            self.args.update_batch_size,
            &mut rng,
        )?;
        Ok(EvalTask {
            support: Subset::concat(&parts),
            query: Subset::new(&self.target, &split.target_val),
        })
    }

    /// Source support set used for test-time adaptation (`data_s`)
    pub fn source_support(&self) -> &Subset {
        &self.source_support
    }

    /// True-target test fold (`data_tt_val`)
    pub fn true_target_test(&self, fold: usize) -> anyhow::Result<Subset> {
        Ok(Subset::new(&self.true_target, &self.fold(fold)?.tt_test))
    }

    /// True-target fine-tuning training set (`tt_sample`)
    pub fn true_target_train(&self, fold: usize) -> anyhow::Result<Subset> {
        Ok(Subset::new(&self.true_target, &self.fold(fold)?.tt_train))
    }

    /// True-target fine-tuning validation set (`tt_sample_val`)
    pub fn true_target_val(&self, fold: usize) -> anyhow::Result<Subset> {
        Ok(Subset::new(&self.true_target, &self.fold(fold)?.tt_val))
    }
}

fn others(folds: &[Vec<usize>], i: usize) -> Vec<usize> {
    let mut ret: Vec<usize> = folds
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != i)
        .flat_map(|(_, f)| f.iter().cloned())
        .collect();
    ret.sort_unstable();
    ret
}

fn class_sizes(pools: &[Vec<usize>]) -> Vec<usize> {
    pools.iter().map(|p| p.len()).collect()
}

/// `size` samples spread over the source tasks; the first tasks take
/// the remainder
fn sample_sources(
    source: &[Arc<Cohort>],
    pools: &[Vec<Vec<usize>>],
    size: usize,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<Subset>> {
    let ns = source.len();
    let mut parts = Vec::with_capacity(ns);
    for (s, (cohort, pool)) in source.iter().zip(pools.iter()).enumerate() {
        let take = size / ns + usize::from(s < size % ns);
        if take == 0 {
            continue;
        }
        let pos = stratified_sample(pool, take, rng)?;
        parts.push(Subset::new(cohort, &pos));
    }
    Ok(parts)
}
