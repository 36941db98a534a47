use crate::config::RunConfig;
use crate::finetune::FineTuner;
use crate::meta_model::{MetaPred, TrainedModel};
use crate::metrics::Metrics;
use crate::results::*;

use ehr_data::ehr_data_loader::EhrDataLoader;
use log::info;
use std::path::PathBuf;

/// Metrics collected over every repetition and fold
#[derive(Debug)]
pub struct RunOutcome {
    pub table: MetricTable,
    pub folds: Vec<Metrics>,
    pub results_file: Option<PathBuf>,
}

/// `<results_dir>/res_<exp>`
pub fn results_file(config: &RunConfig) -> PathBuf {
    config
        .results_dir
        .join(format!("res_{}", config.exp_string()))
}

/// Read the cohorts of `config` and run every repetition
pub fn run(config: &RunConfig) -> anyhow::Result<RunOutcome> {
    config.validate()?;

    info!("source tasks: {}", config.source.join(" "));
    info!("simulated target task: {}", config.target);
    info!("true target task: {}", config.true_target);

    let mut table = MetricTable::default();
    let mut folds = vec![];

    for run in 0..config.run_time {
        let data = EhrDataLoader::load(
            &config.data_dir,
            &config.source,
            &config.target,
            &config.true_target,
            config.loader_args(run),
        )?;
        folds.extend(run_folds(config, &data, run, &mut table)?);
    }

    finish(config, table, folds)
}

/// Run every fold of one repetition on an already built loader:
/// train, fine-tune, test, accumulate
pub fn run_folds(
    config: &RunConfig,
    data: &EhrDataLoader,
    run: usize,
    table: &mut MetricTable,
) -> anyhow::Result<Vec<Metrics>> {
    let seed = config.run_seed(run);
    let mut ret = vec![];

    for fold in 0..data.n_fold {
        info!("---------- run {} fold {} / {} ----------", run + 1, fold + 1, data.n_fold);

        let mut model: Option<TrainedModel> = if config.train {
            let mut meta = MetaPred::new(config, data.dims(), fold, seed)?;
            meta.fit(data)?;
            Some(meta.into_trained())
        } else {
            MetaPred::restore(config, data.dims(), fold)?.map(|m| m.into_trained())
        };

        if config.finetune {
            let trained = model.take().ok_or_else(|| missing_model(config, fold, "fine-tune"))?;
            let tuner = FineTuner::new(config, fold);
            let tuned = tuner.fit(
                trained,
                &data.true_target_train(fold)?,
                &data.true_target_val(fold)?,
                seed,
            )?;
            let val = tuner.evaluate(&tuned, &data.true_target_val(fold)?)?;
            info!("[fold {}] fine-tuned validation: {}", fold, val);
            model = Some(tuned);
        }

        if config.test {
            let trained = model.as_ref().ok_or_else(|| missing_model(config, fold, "test"))?;
            let m = trained.test(config, data, fold)?;
            info!("[fold {}] test: {}", fold, m);
            table.push_metrics(&m);
            ret.push(m);
        }
    }
    Ok(ret)
}

fn missing_model(config: &RunConfig, fold: usize, stage: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "cannot {} fold {}: no trained model; run with --train or put a checkpoint under {}",
        stage,
        fold,
        crate::checkpoint::fold_dir(config, fold).display()
    )
}

/// Log the summary and write the results file.
///
/// Without `test` the table is empty, so nothing is written and
/// `results_file` is `None`; a results file always holds test
/// metrics of every fold.
pub fn finish(config: &RunConfig, table: MetricTable, folds: Vec<Metrics>) -> anyhow::Result<RunOutcome> {
    info!("--------------- model setting ---------------");
    info!(
        "source: {}, simulated target: {}, true target: {}",
        config.source.join(" "),
        config.target,
        config.true_target
    );
    info!(
        "method: meta-{}, meta-bz: {}, update-bz: {}, num update: {}, meta-lr: {}, update-lr: {}",
        config.method,
        config.meta_batch_size,
        config.update_batch_size,
        config.num_updates,
        config.meta_lr,
        config.update_lr
    );

    if !config.test {
        return Ok(RunOutcome {
            table,
            folds,
            results_file: None,
        });
    }

    info!("--------------- {}-fold results ---------------", config.n_fold);
    for (key, mu, sd) in table.summary() {
        info!("{} mean: {:.4}, std: {:.4}", key, mu, sd);
    }

    let file = results_file(config);
    save_results(&table, &file)?;

    Ok(RunOutcome {
        table,
        folds,
        results_file: Some(file),
    })
}
