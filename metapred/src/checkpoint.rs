use crate::config::RunConfig;

use candle_util::candle_param_set::ParamSet;
use ehr_data::cohort::EhrDims;
use ehr_data::common_io::mkdir;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const META_FILE: &str = "meta.json";
const MODEL_PREFIX: &str = "model";
const MODEL_SUFFIX: &str = ".safetensors";
/// holds the iteration of the most recent save
const LATEST_FILE: &str = "checkpoint";

/// What a checkpoint directory holds weights for
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointMeta {
    pub exp: String,
    pub method: String,
    pub n_visits: usize,
    pub n_codes: usize,
    pub n_classes: usize,
    pub n_hidden: usize,
    pub filter_widths: Vec<usize>,
    pub norm: String,
}

impl CheckpointMeta {
    pub fn new(config: &RunConfig, dims: &EhrDims) -> Self {
        Self {
            exp: config.exp_string(),
            method: config.method.to_string(),
            n_visits: dims.n_visits,
            n_codes: dims.n_codes,
            n_classes: config.n_classes,
            n_hidden: config.n_hidden,
            filter_widths: config.filter_widths.clone(),
            norm: config.norm.to_string(),
        }
    }
}

/// `<logdir>/<exp>/fold<i>`
pub fn fold_dir(config: &RunConfig, fold: usize) -> PathBuf {
    config
        .logdir
        .join(config.exp_string())
        .join(format!("fold{}", fold))
}

pub fn model_file(dir: &Path, iteration: usize) -> PathBuf {
    dir.join(format!("{}{}{}", MODEL_PREFIX, iteration, MODEL_SUFFIX))
}

/// Iteration of the most recent save under `dir`.
///
/// Reads the pointer written by `save_checkpoint`; a directory
/// without one falls back to the highest-numbered model file.
pub fn latest_checkpoint(dir: &Path) -> anyhow::Result<Option<usize>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let pointer = dir.join(LATEST_FILE);
    if pointer.exists() {
        let text = std::fs::read_to_string(&pointer)?;
        let itr = text.trim().parse::<usize>().map_err(|e| {
            anyhow::anyhow!("{}: bad checkpoint pointer: {}", pointer.display(), e)
        })?;
        if !model_file(dir, itr).exists() {
            anyhow::bail!(
                "{} points at iteration {}, but {} is missing",
                pointer.display(),
                itr,
                model_file(dir, itr).display()
            );
        }
        return Ok(Some(itr));
    }
    Ok(saved_iterations(dir)?.into_iter().max())
}

/// Iterations of every `model<itr>.safetensors` under `dir`
pub fn saved_iterations(dir: &Path) -> anyhow::Result<Vec<usize>> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut ret = vec![];
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let itr = name
            .to_str()
            .and_then(|s| s.strip_prefix(MODEL_PREFIX))
            .and_then(|s| s.strip_suffix(MODEL_SUFFIX))
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(itr) = itr {
            ret.push(itr);
        }
    }
    ret.sort_unstable();
    Ok(ret)
}

/// Remove the model files and the pointer of an earlier run
pub fn clear_checkpoints(dir: &Path) -> anyhow::Result<()> {
    let stale = saved_iterations(dir)?;
    for &itr in stale.iter() {
        std::fs::remove_file(model_file(dir, itr))?;
    }
    let pointer = dir.join(LATEST_FILE);
    if pointer.exists() {
        std::fs::remove_file(pointer)?;
    }
    if !stale.is_empty() {
        info!("removed {} old checkpoints in {}", stale.len(), dir.display());
    }
    Ok(())
}

/// Pick the iteration to restore: `requested` if given, else the
/// latest one
pub fn find_checkpoint(dir: &Path, requested: Option<usize>) -> anyhow::Result<Option<usize>> {
    match requested {
        Some(itr) if model_file(dir, itr).exists() => Ok(Some(itr)),
        Some(itr) => Err(anyhow::anyhow!(
            "no checkpoint for iteration {} in {}",
            itr,
            dir.display()
        )),
        None => latest_checkpoint(dir),
    }
}

pub fn save_checkpoint(
    dir: &Path,
    iteration: usize,
    params: &ParamSet,
    meta: &CheckpointMeta,
) -> anyhow::Result<PathBuf> {
    mkdir(dir)?;
    let meta_file = dir.join(META_FILE);
    std::fs::write(&meta_file, serde_json::to_string_pretty(meta)?)?;
    let file = model_file(dir, iteration);
    params.save(&file)?;
    std::fs::write(dir.join(LATEST_FILE), format!("{}\n", iteration))?;
    info!("saved {}", file.display());
    Ok(file)
}

/// Load weights of `iteration` into `params` after checking that the
/// directory was written for the same network
pub fn load_checkpoint(
    dir: &Path,
    iteration: usize,
    params: &mut ParamSet,
    meta: &CheckpointMeta,
) -> anyhow::Result<()> {
    let meta_file = dir.join(META_FILE);
    let saved: CheckpointMeta = serde_json::from_str(&std::fs::read_to_string(&meta_file).map_err(
        |e| anyhow::anyhow!("failed to read {}: {}", meta_file.display(), e),
    )?)?;

    if &saved != meta {
        anyhow::bail!(
            "checkpoint {} was written for {:?}, current network is {:?}",
            dir.display(),
            saved,
            meta
        );
    }

    let file = model_file(dir, iteration);
    params
        .load(&file)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {}", file.display(), e))?;
    info!("restored {}", file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_checkpoint_scans_model_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(latest_checkpoint(dir.path())?, None);
        for itr in [9, 120, 33] {
            std::fs::write(model_file(dir.path(), itr), b"")?;
        }
        std::fs::write(dir.path().join("trace.tsv"), b"")?;
        assert_eq!(latest_checkpoint(dir.path())?, Some(120));
        assert_eq!(find_checkpoint(dir.path(), Some(33))?, Some(33));
        assert!(find_checkpoint(dir.path(), Some(34)).is_err());
        assert_eq!(latest_checkpoint(&dir.path().join("nowhere"))?, None);
        Ok(())
    }

    #[test]
    fn latest_follows_the_most_recent_save() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for itr in [3, 21, 7] {
            std::fs::write(model_file(dir.path(), itr), b"")?;
        }
        std::fs::write(dir.path().join(LATEST_FILE), "7\n")?;
        assert_eq!(latest_checkpoint(dir.path())?, Some(7));
        assert_eq!(saved_iterations(dir.path())?, vec![3, 7, 21]);

        std::fs::write(dir.path().join(LATEST_FILE), "8\n")?;
        assert!(latest_checkpoint(dir.path()).is_err());

        clear_checkpoints(dir.path())?;
        assert!(saved_iterations(dir.path())?.is_empty());
        assert_eq!(latest_checkpoint(dir.path())?, None);
        Ok(())
    }

    #[test]
    fn fold_dirs_nest_under_the_experiment() {
        let config = RunConfig::default();
        assert_eq!(
            fold_dir(&config, 2),
            PathBuf::from("model/stsk_ADttsk_MCI.mbs_8.ubs_16.numstep4.updatelr0.001/fold2")
        );
    }
}
