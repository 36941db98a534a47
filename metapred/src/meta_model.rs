use crate::checkpoint::*;
use crate::config::RunConfig;
use crate::maml::Maml;
use crate::metrics::*;

use candle_util::candle_autodiff::surrogate_loss;
use candle_util::candle_classifiers::build_classifier;
use candle_util::candle_core::Tensor;
use candle_util::candle_loss_functions::class_probabilities;
use candle_util::candle_model_traits::ClassifierT;
use candle_util::candle_nn::{AdamW, Optimizer, ParamsAdamW};
use candle_util::candle_param_set::ParamSet;
use ehr_data::cohort::EhrDims;
use ehr_data::ehr_data_loader::EhrDataLoader;
use ehr_data::folds::derive_seed;
use ehr_data::subset::Subset;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};

const STREAM_INIT: u64 = 11;

/// A network with the parameters to score it with; the handle the
/// driver passes from training to fine-tuning and testing
pub struct TrainedModel {
    pub net: Box<dyn ClassifierT>,
    pub params: ParamSet,
    pub dims: EhrDims,
    /// fitted to the true target already, so testing skips
    /// test-time adaptation
    pub finetuned: bool,
}

impl TrainedModel {
    /// Score the true target's test fold. Meta-trained parameters are
    /// first adapted on the source support set.
    pub fn test(&self, config: &RunConfig, data: &EhrDataLoader, fold: usize) -> anyhow::Result<Metrics> {
        let query = data.true_target_test(fold)?;
        let support = if self.finetuned {
            None
        } else {
            Some(data.source_support())
        };
        adapt_and_score(config, self.net.as_ref(), &self.params, &self.dims, support, &query)
    }
}

/// MAML meta-learner over one fold
pub struct MetaPred<'a> {
    config: &'a RunConfig,
    net: Box<dyn ClassifierT>,
    params: ParamSet,
    dims: EhrDims,
    fold: usize,
    dir: PathBuf,
}

impl<'a> MetaPred<'a> {
    /// Build the network for `config.method` with freshly initialized
    /// parameters
    pub fn new(config: &'a RunConfig, dims: &EhrDims, fold: usize, seed: u64) -> anyhow::Result<Self> {
        let net = build_classifier(config.method, &config.classifier_args(dims));
        let params = ParamSet::init(
            &net.param_specs(),
            derive_seed(seed, STREAM_INIT, fold as u64),
            &config.device,
        )?;
        info!(
            "[fold {}] {} with {} parameters in {} tensors",
            fold,
            net.name(),
            params.num_elements(),
            params.len()
        );
        Ok(Self {
            config,
            net,
            params,
            dims: *dims,
            fold,
            dir: fold_dir(config, fold),
        })
    }

    /// Load the `test_iter` (or latest) checkpoint of `fold`; `None`
    /// if the fold has none
    pub fn restore(
        config: &'a RunConfig,
        dims: &EhrDims,
        fold: usize,
    ) -> anyhow::Result<Option<Self>> {
        let mut model = Self::new(config, dims, fold, config.seed)?;
        match find_checkpoint(&model.dir, config.test_iter)? {
            Some(itr) => {
                model.load(itr)?;
                Ok(Some(model))
            }
            None => Ok(None),
        }
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.dir
    }

    pub fn into_trained(self) -> TrainedModel {
        TrainedModel {
            net: self.net,
            params: self.params,
            dims: self.dims,
            finetuned: false,
        }
    }

    fn meta(&self) -> CheckpointMeta {
        CheckpointMeta::new(self.config, &self.dims)
    }

    fn save(&self, iteration: usize) -> anyhow::Result<()> {
        save_checkpoint(&self.dir, iteration, &self.params, &self.meta())?;
        Ok(())
    }

    fn load(&mut self, iteration: usize) -> anyhow::Result<()> {
        let meta = self.meta();
        load_checkpoint(&self.dir, iteration, &mut self.params, &meta)
    }

    fn inner_loop(&self, inner_lr: f64) -> Maml<'_> {
        Maml {
            net: self.net.as_ref(),
            num_updates: self.config.num_updates,
            inner_lr,
            reg_weight: self.config.reg_weight(),
            stop_grad: self.config.stop_grad,
            fd_epsilon: self.config.fd_epsilon,
        }
    }

    /// Where to start: right after the resumed checkpoint, or zero.
    /// A fresh start drops the fold's older checkpoints.
    fn start_iteration(&mut self) -> anyhow::Result<usize> {
        if !self.config.resume {
            clear_checkpoints(&self.dir)?;
            return Ok(0);
        }
        match find_checkpoint(&self.dir, self.config.test_iter)? {
            Some(itr) => {
                self.load(itr)?;
                info!("[fold {}] resuming after iteration {}", self.fold, itr);
                Ok(itr + 1)
            }
            None => {
                warn!("[fold {}] nothing to resume from in {}", self.fold, self.dir.display());
                Ok(0)
            }
        }
    }

    /// Outer loop: `pretrain_iterations` supervised steps on the
    /// support sets, then `metatrain_iterations` meta updates
    pub fn fit(&mut self, data: &EhrDataLoader) -> anyhow::Result<&ParamSet> {
        let config = self.config;
        let total = config.total_iterations();
        let start = self.start_iteration()?;

        let mut adam = AdamW::new(
            self.params.all_vars(),
            ParamsAdamW {
                lr: config.meta_lr,
                weight_decay: 0.,
                ..Default::default()
            },
        )?;

        let mut trace = if config.log {
            Some(TraceLog::new(&self.dir, start > 0)?)
        } else {
            None
        };

        let pb = ProgressBar::new(total as u64);
        if !config.show_progress || config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb.set_position(start.min(total) as u64);

        let (mut pre_sum, mut post_sum, mut n_sum) = (0f32, 0f32, 0usize);

        for itr in start..total {
            let episode = data.episode(self.fold, itr, &config.device)?;

            let (pre_loss, post_loss) = if itr < config.pretrain_iterations {
                let maml = self.inner_loop(config.train_update_lr());
                let loss = maml.pretrain_loss(&self.params.weights(), &episode.tasks)?;
                let value = loss.to_scalar::<f32>()?;
                adam.backward_step(&loss)?;
                (value, value)
            } else {
                let w0 = self.params.snapshot()?;
                let maml = self.inner_loop(config.train_update_lr());
                let mg = maml.meta_gradient(&w0, &episode.tasks)?;
                let surrogate = surrogate_loss(&self.params.weights(), &mg.grads)?;
                adam.backward_step(&surrogate)?;
                (mg.pre_loss, mg.post_loss)
            };

            if !pre_loss.is_finite() || !post_loss.is_finite() {
                anyhow::bail!(
                    "[fold {}] iteration {}: loss diverged ({}, {})",
                    self.fold,
                    itr,
                    pre_loss,
                    post_loss
                );
            }

            pre_sum += pre_loss;
            post_sum += post_loss;
            n_sum += 1;

            let done = itr + 1;

            if done % config.print_interval.max(1) == 0 {
                let stage = if itr < config.pretrain_iterations {
                    "pretrain"
                } else {
                    "metatrain"
                };
                info!(
                    "[fold {}] {} iteration {}: pre-update loss {:.4}, post-update loss {:.4}",
                    self.fold,
                    stage,
                    done,
                    pre_sum / n_sum as f32,
                    post_sum / n_sum as f32
                );
                (pre_sum, post_sum, n_sum) = (0., 0., 0);
            }

            let val_auroc = if done % config.val_interval.max(1) == 0 {
                let val = self.validate(data)?;
                info!("[fold {}] iteration {} validation: {}", self.fold, done, val);
                Some(val.auroc)
            } else {
                None
            };

            if let Some(trace) = trace.as_mut() {
                trace.push(itr, pre_loss, post_loss, val_auroc);
            }

            if done % config.save_interval.max(1) == 0 || done == total {
                self.save(itr)?;
                if let Some(trace) = trace.as_mut() {
                    trace.flush()?;
                }
            }

            pb.inc(1);
        }

        pb.finish_and_clear();

        if let Some(trace) = trace.as_mut() {
            trace.flush()?;
        }

        Ok(&self.params)
    }

    /// Adapt on the fold's source support and score the simulated
    /// target's held-out fold
    pub fn validate(&self, data: &EhrDataLoader) -> anyhow::Result<Metrics> {
        let task = data.episode_val(self.fold)?;
        self.evaluate(&task.support, &task.query)
    }

    /// Adapt the current parameters on `support` (at `update_lr`, no
    /// dropout) and score `query`
    pub fn evaluate(&self, support: &Subset, query: &Subset) -> anyhow::Result<Metrics> {
        adapt_and_score(
            self.config,
            self.net.as_ref(),
            &self.params,
            &self.dims,
            Some(support),
            query,
        )
    }
}

/// Optionally adapt `params` on `support`, then score `query` in
/// chunks of `eval_batch_size`
pub fn adapt_and_score(
    config: &RunConfig,
    net: &dyn ClassifierT,
    params: &ParamSet,
    dims: &EhrDims,
    support: Option<&Subset>,
    query: &Subset,
) -> anyhow::Result<Metrics> {
    let mut weights = params.snapshot()?;

    if let Some(support) = support.filter(|s| !s.is_empty()) {
        let batch = support.to_batch(dims, config.n_classes, &config.device)?;
        let maml = Maml {
            net,
            num_updates: config.num_updates,
            inner_lr: config.update_lr,
            reg_weight: config.reg_weight(),
            stop_grad: true,
            fd_epsilon: config.fd_epsilon,
        };
        weights = maml.adapted_weights(&weights, &batch, false)?;
    }

    let (probs, labels) = predict(config, net, &weights, dims, query)?;
    Ok(evaluate_predictions(&probs, &labels, config.n_classes))
}

/// Class probabilities of every member of `query`
pub fn predict(
    config: &RunConfig,
    net: &dyn ClassifierT,
    weights: &[Tensor],
    dims: &EhrDims,
    query: &Subset,
) -> anyhow::Result<(Vec<Vec<f32>>, Vec<usize>)> {
    let mut probs = Vec::with_capacity(query.len());
    let mut labels = Vec::with_capacity(query.len());
    for chunk in query.chunks(config.eval_batch_size) {
        let batch = chunk.to_batch(dims, config.n_classes, &config.device)?;
        let logits = net.forward_with(weights, &batch.x, false)?;
        probs.extend(class_probabilities(&logits)?.to_vec2::<f32>()?);
        labels.extend(batch.labels);
    }
    Ok((probs, labels))
}

/// Per-iteration losses appended to `trace.tsv`
struct TraceLog {
    file: PathBuf,
    pending: Vec<String>,
}

impl TraceLog {
    fn new(dir: &Path, resumed: bool) -> anyhow::Result<Self> {
        ehr_data::common_io::mkdir(dir)?;
        let file = dir.join("trace.tsv");
        if !resumed && file.exists() {
            std::fs::remove_file(&file)?;
        }
        Ok(Self {
            file,
            pending: vec![],
        })
    }

    fn push(&mut self, itr: usize, pre_loss: f32, post_loss: f32, val_auroc: Option<f64>) {
        let val = match val_auroc {
            Some(v) => format!("{:.6}", v),
            None => "NA".to_string(),
        };
        self.pending
            .push(format!("{}\t{:.6}\t{:.6}\t{}", itr, pre_loss, post_loss, val));
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let is_new = !self.file.exists();
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)?;
        if is_new {
            writeln!(f, "iteration\tpre_loss\tpost_loss\tval_auroc")?;
        }
        for line in self.pending.drain(..) {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}
