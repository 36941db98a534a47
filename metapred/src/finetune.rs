use crate::config::RunConfig;
use crate::maml::Maml;
use crate::meta_model::{adapt_and_score, TrainedModel};
use crate::metrics::Metrics;

use candle_util::candle_data_loader_util::Minibatches;
use candle_util::candle_nn::{AdamW, Optimizer, ParamsAdamW};
use candle_util::candle_param_set::ParamSet;
use ehr_data::folds::derive_seed;
use ehr_data::subset::Subset;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

const STREAM_FINETUNE: u64 = 21;

/// Supervised training of a meta-trained network on the true target
pub struct FineTuner<'a> {
    config: &'a RunConfig,
    fold: usize,
}

impl<'a> FineTuner<'a> {
    pub fn new(config: &'a RunConfig, fold: usize) -> Self {
        Self { config, fold }
    }

    /// Start from `model`'s parameters, train on `train` for
    /// `finetune_iterations` minibatch steps and keep the snapshot
    /// with the best validation AUROC.
    ///
    /// Layers named by `--freeze` are excluded from the optimizer.
    pub fn fit(
        &self,
        model: TrainedModel,
        train: &Subset,
        val: &Subset,
        seed: u64,
    ) -> anyhow::Result<TrainedModel> {
        let config = self.config;
        if train.is_empty() {
            anyhow::bail!("[fold {}] no true-target samples to fine-tune on", self.fold);
        }

        let params = model.params.duplicate()?;
        let frozen = config.freeze.frozen_groups();
        let trainable = params.trainable_vars(&frozen);
        if trainable.is_empty() {
            anyhow::bail!("--freeze {:?} leaves nothing to train", config.freeze);
        }

        let mut adam = AdamW::new(
            trainable,
            ParamsAdamW {
                lr: config.finetune_lr,
                weight_decay: 0.,
                ..Default::default()
            },
        )?;

        let maml = Maml {
            net: model.net.as_ref(),
            num_updates: 0,
            inner_lr: 0.,
            reg_weight: config.reg_weight(),
            stop_grad: true,
            fd_epsilon: config.fd_epsilon,
        };

        let mut rng = StdRng::seed_from_u64(derive_seed(seed, STREAM_FINETUNE, self.fold as u64));
        let mut minibatches = Minibatches::new(train.len());
        let mut queue: Vec<Vec<usize>> = vec![];

        let mut best: Option<(f64, Vec<_>)> = None;

        let pb = ProgressBar::new(config.finetune_iterations as u64);
        if !config.show_progress || config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for step in 0..config.finetune_iterations {
            if queue.is_empty() {
                minibatches.shuffle_minibatch(config.finetune_batch_size, &mut rng);
                queue = minibatches.chunks.iter().rev().cloned().collect();
            }
            let Some(chunk) = queue.pop() else {
                break;
            };

            let batch = train
                .select(&chunk)
                .to_batch(&model.dims, config.n_classes, &config.device)?;
            let loss = maml.task_loss(&params.weights(), &batch, true)?;
            adam.backward_step(&loss)?;

            let done = step + 1;
            let validate = done % config.val_interval.max(1) == 0 || done == config.finetune_iterations;
            if validate && !val.is_empty() {
                let current = self.score(&model, &params, val)?;
                info!(
                    "[fold {}] fine-tune step {}: loss {:.4}, validation {}",
                    self.fold,
                    done,
                    loss.to_scalar::<f32>()?,
                    current
                );
                if best.as_ref().is_none_or(|(auc, _)| current.auroc > *auc) {
                    best = Some((current.auroc, params.snapshot()?));
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        if let Some((auc, values)) = best {
            info!("[fold {}] keeping fine-tuned weights with validation AUROC {:.4}", self.fold, auc);
            params.assign(&values)?;
        }

        Ok(TrainedModel {
            net: model.net,
            params,
            dims: model.dims,
            finetuned: true,
        })
    }

    /// Score `subset` with the parameters as they are
    pub fn evaluate(&self, model: &TrainedModel, subset: &Subset) -> anyhow::Result<Metrics> {
        self.score(model, &model.params, subset)
    }

    fn score(&self, model: &TrainedModel, params: &ParamSet, subset: &Subset) -> anyhow::Result<Metrics> {
        if subset.is_empty() {
            return Ok(Metrics::default());
        }
        adapt_and_score(
            self.config,
            model.net.as_ref(),
            params,
            &model.dims,
            None,
            subset,
        )
    }
}
