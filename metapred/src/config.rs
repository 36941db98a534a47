use candle_util::candle_aux_layers::Norm;
use candle_util::candle_classifiers::{ClassifierArgs, Method};
use candle_util::candle_core::Device;
use candle_util::candle_model_traits::ParamGroup;
use clap::ValueEnum;
use ehr_data::cohort::EhrDims;
use ehr_data::ehr_data_loader::DataLoaderArgs;
use std::path::PathBuf;

/// Layers kept fixed while fine-tuning
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[clap(rename_all = "lowercase")]
pub enum Freeze {
    #[default]
    None,
    /// everything but the classification head
    Encoder,
}

impl Freeze {
    pub fn frozen_groups(&self) -> Vec<ParamGroup> {
        match self {
            Freeze::None => vec![],
            Freeze::Encoder => vec![ParamGroup::Encoder],
        }
    }
}

/// Everything a run needs, fixed once the command line is parsed
#[derive(Clone, Debug)]
pub struct RunConfig {
    // tasks
    pub source: Vec<Box<str>>,
    pub target: Box<str>,
    pub true_target: Box<str>,
    pub data_dir: PathBuf,
    pub n_classes: usize,
    pub n_fold: usize,
    pub n_visits: Option<usize>,
    pub n_codes: Option<usize>,

    // network
    pub method: Method,
    pub n_hidden: usize,
    pub filter_widths: Vec<usize>,
    pub norm: Norm,
    /// dropout keep probability
    pub keep_prob: f32,

    // meta-training
    pub pretrain_iterations: usize,
    pub metatrain_iterations: usize,
    pub meta_batch_size: usize,
    pub update_batch_size: usize,
    pub meta_lr: f64,
    pub update_lr: f64,
    pub num_updates: usize,
    pub n_total_batches: usize,
    pub stop_grad: bool,
    pub is_reg: bool,
    pub reg_rate: f64,
    pub train_update_batch_size: Option<usize>,
    pub train_update_lr: Option<f64>,
    pub fd_epsilon: f64,

    // fine-tuning
    pub freeze: Freeze,
    pub finetune_iterations: usize,
    pub finetune_lr: f64,
    pub finetune_batch_size: usize,
    pub finetune_val_ratio: f32,

    // stages
    pub train: bool,
    pub test: bool,
    pub finetune: bool,
    pub resume: bool,
    pub test_iter: Option<usize>,
    pub run_time: usize,

    // output
    pub log: bool,
    pub logdir: PathBuf,
    pub results_dir: PathBuf,
    pub eval_batch_size: usize,
    pub print_interval: usize,
    pub val_interval: usize,
    pub save_interval: usize,

    pub seed: u64,
    pub device: Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source: vec!["AD".into()],
            target: "MCI".into(),
            true_target: "PD".into(),
            data_dir: PathBuf::from("data"),
            n_classes: 2,
            n_fold: 5,
            n_visits: None,
            n_codes: None,
            method: Method::Rnn,
            n_hidden: 128,
            filter_widths: vec![2, 3, 4],
            norm: Norm::None,
            keep_prob: 0.5,
            pretrain_iterations: 20000,
            metatrain_iterations: 10000,
            meta_batch_size: 8,
            update_batch_size: 16,
            meta_lr: 1e-4,
            update_lr: 1e-3,
            num_updates: 4,
            n_total_batches: 100000,
            stop_grad: false,
            is_reg: true,
            reg_rate: 1e-4,
            train_update_batch_size: None,
            train_update_lr: None,
            fd_epsilon: 1e-3,
            freeze: Freeze::None,
            finetune_iterations: 1000,
            finetune_lr: 1e-4,
            finetune_batch_size: 32,
            finetune_val_ratio: 0.2,
            train: true,
            test: true,
            finetune: false,
            resume: false,
            test_iter: None,
            run_time: 1,
            log: true,
            logdir: PathBuf::from("model"),
            results_dir: PathBuf::from("results"),
            eval_batch_size: 256,
            print_interval: 100,
            val_interval: 500,
            save_interval: 1000,
            seed: 42,
            device: Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}

impl RunConfig {
    /// Reject settings no run could succeed with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.is_empty() {
            anyhow::bail!("need at least one source task");
        }
        if self.n_classes < 2 {
            anyhow::bail!("n_classes must be at least 2, got {}", self.n_classes);
        }
        if self.n_fold < 2 {
            anyhow::bail!("n_fold must be at least 2, got {}", self.n_fold);
        }
        if self.meta_batch_size == 0 || self.update_batch_size == 0 {
            anyhow::bail!(
                "meta_batch_size ({}) and update_batch_size ({}) must be positive",
                self.meta_batch_size,
                self.update_batch_size
            );
        }
        if self.train_update_batch_size == Some(0) {
            anyhow::bail!("train_update_batch_size must be positive");
        }
        if !(self.keep_prob > 0. && self.keep_prob <= 1.) {
            anyhow::bail!("dropout keep probability {} outside (0, 1]", self.keep_prob);
        }
        if self.n_hidden == 0 {
            anyhow::bail!("n_hidden must be positive");
        }
        if self.method == Method::Cnn && self.filter_widths.iter().any(|&w| w == 0) {
            anyhow::bail!("filter widths must be positive: {:?}", self.filter_widths);
        }
        if self.train && self.total_iterations() == 0 {
            anyhow::bail!("training needs at least one pretrain or metatrain iteration");
        }
        if self.finetune && self.finetune_batch_size == 0 {
            anyhow::bail!("finetune_batch_size must be positive");
        }
        if !(0. ..1.).contains(&self.finetune_val_ratio) {
            anyhow::bail!(
                "finetune_val_ratio {} outside [0, 1)",
                self.finetune_val_ratio
            );
        }
        if self.run_time == 0 {
            anyhow::bail!("run_time must be positive");
        }
        if self.fd_epsilon <= 0. {
            anyhow::bail!("fd_epsilon must be positive");
        }
        Ok(())
    }

    /// Namespace of checkpoints and results, e.g.
    /// `stsk_ADttsk_MCI.mbs_8.ubs_16.numstep4.updatelr0.001`
    pub fn exp_string(&self) -> String {
        let source: Vec<&str> = self.source.iter().map(|s| s.as_ref()).collect();
        format!(
            "stsk_{}ttsk_{}.mbs_{}.ubs_{}.numstep{}.updatelr{}",
            source.join("&"),
            self.target,
            self.meta_batch_size,
            self.update_batch_size,
            self.num_updates,
            py_float(self.update_lr)
        )
    }

    pub fn total_iterations(&self) -> usize {
        self.pretrain_iterations + self.metatrain_iterations
    }

    /// Support/query size of meta-training episodes
    pub fn train_update_batch_size(&self) -> usize {
        self.train_update_batch_size.unwrap_or(self.update_batch_size)
    }

    /// Inner-loop step size during meta-training
    pub fn train_update_lr(&self) -> f64 {
        self.train_update_lr.unwrap_or(self.update_lr)
    }

    /// L2 weight of the task loss (zero when regularization is off)
    pub fn reg_weight(&self) -> f64 {
        if self.is_reg {
            self.reg_rate
        } else {
            0.
        }
    }

    pub fn classifier_args(&self, dims: &EhrDims) -> ClassifierArgs {
        ClassifierArgs {
            n_visits: dims.n_visits,
            n_codes: dims.n_codes,
            n_classes: self.n_classes,
            n_hidden: self.n_hidden,
            filter_widths: self.filter_widths.clone(),
            norm: self.norm,
            keep_prob: self.keep_prob,
        }
    }

    /// Data loader settings of repetition `run`
    pub fn loader_args(&self, run: usize) -> DataLoaderArgs {
        DataLoaderArgs {
            n_classes: self.n_classes,
            n_fold: self.n_fold,
            n_visits: self.n_visits,
            n_codes: self.n_codes,
            meta_batch_size: self.meta_batch_size,
            update_batch_size: self.update_batch_size,
            train_update_batch_size: self.train_update_batch_size(),
            n_total_batches: self.n_total_batches,
            finetune_val_ratio: self.finetune_val_ratio,
            seed: self.run_seed(run),
        }
    }

    pub fn run_seed(&self, run: usize) -> u64 {
        self.seed.wrapping_add(run as u64)
    }
}

/// Shortest round-trip decimal the way Python prints a float:
/// scientific with a two-digit signed exponent outside `[1e-4, 1e16)`,
/// and at least one fractional digit otherwise (`1e-05`, `0.001`, `1.0`)
pub fn py_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x > 0. { "inf".into() } else { "-inf".into() };
    }
    if x == 0. {
        return if x.is_sign_negative() { "-0.0".into() } else { "0.0".into() };
    }

    let sci = format!("{:e}", x);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", mantissa, sign, exponent.abs());
    }

    let fixed = format!("{}", x);
    if fixed.contains('.') {
        fixed
    } else {
        fixed + ".0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_string_matches_the_checkpoint_layout() {
        let config = RunConfig::default();
        assert_eq!(
            config.exp_string(),
            "stsk_ADttsk_MCI.mbs_8.ubs_16.numstep4.updatelr0.001"
        );

        let config = RunConfig {
            source: vec!["AD".into(), "HF".into()],
            update_lr: 0.01,
            num_updates: 1,
            ..RunConfig::default()
        };
        assert_eq!(
            config.exp_string(),
            "stsk_AD&HFttsk_MCI.mbs_8.ubs_16.numstep1.updatelr0.01"
        );
    }

    #[test]
    fn learning_rates_print_like_python_floats() {
        for (x, s) in [
            (1e-3, "0.001"),
            (1e-4, "0.0001"),
            (1e-5, "1e-05"),
            (2.5e-7, "2.5e-07"),
            (1.0, "1.0"),
            (0.5, "0.5"),
            (12.0, "12.0"),
            (1e16, "1e+16"),
            (0., "0.0"),
        ] {
            assert_eq!(py_float(x), s);
        }

        let config = RunConfig {
            update_lr: 1e-5,
            ..RunConfig::default()
        };
        assert!(config.exp_string().ends_with(".updatelr1e-05"));
        let config = RunConfig {
            update_lr: 1.0,
            ..RunConfig::default()
        };
        assert!(config.exp_string().ends_with(".updatelr1.0"));
    }

    #[test]
    fn training_overrides_fall_back() {
        let config = RunConfig::default();
        assert_eq!(config.train_update_batch_size(), 16);
        approx::assert_abs_diff_eq!(config.train_update_lr(), 1e-3);

        let config = RunConfig {
            train_update_batch_size: Some(4),
            train_update_lr: Some(0.1),
            is_reg: false,
            ..RunConfig::default()
        };
        assert_eq!(config.train_update_batch_size(), 4);
        approx::assert_abs_diff_eq!(config.train_update_lr(), 0.1);
        approx::assert_abs_diff_eq!(config.reg_weight(), 0.);
    }

    #[test]
    fn bad_settings_fail_validation() {
        assert!(RunConfig::default().validate().is_ok());
        let bad = [
            RunConfig {
                keep_prob: 0.,
                ..RunConfig::default()
            },
            RunConfig {
                meta_batch_size: 0,
                ..RunConfig::default()
            },
            RunConfig {
                n_fold: 1,
                ..RunConfig::default()
            },
            RunConfig {
                pretrain_iterations: 0,
                metatrain_iterations: 0,
                ..RunConfig::default()
            },
        ];
        for config in bad.iter() {
            assert!(config.validate().is_err());
        }
    }
}
