use crate::config::{Freeze, RunConfig};

use candle_util::candle_aux_layers::Norm;
use candle_util::candle_classifiers::Method;
use clap::{ArgAction, Args, ValueEnum};
use ehr_data::simulate::SimArgs;
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(
        long,
        short,
        value_delimiter(','),
        default_value = "AD",
        help = "Source tasks",
        long_help = "Source tasks (comma-separated).\n\
		     Support sets of meta-training episodes are drawn\n\
		     from these cohorts, round-robin over tasks."
    )]
    source: Vec<Box<str>>,

    #[arg(
        long,
        short,
        default_value = "MCI",
        help = "Simulated target task",
        long_help = "Simulated target task.\n\
		     Query sets of meta-training episodes and\n\
		     validation folds come from this cohort."
    )]
    target: Box<str>,

    #[arg(
        long,
        default_value = "PD",
        help = "True target task",
        long_help = "True target task.\n\
		     Fine-tuned and tested fold by fold."
    )]
    true_target: Box<str>,

    #[arg(
        long,
        short,
        default_value = "data",
        help = "Directory of cohort files",
        long_help = "Directory with {task}.labels.tsv[.gz] (sample, label)\n\
		     and {task}.visits.tsv[.gz] (sample, visit, code[, value])\n\
		     for every task."
    )]
    data_dir: PathBuf,

    #[arg(
        long,
        short,
        value_enum,
        default_value = "rnn",
        help = "Network",
        long_help = "Network family of the classifier.\n\
		     Options: mlp, cnn, rnn."
    )]
    method: Method,

    #[arg(long, default_value_t = 2, help = "Number of classes")]
    n_classes: usize,

    #[arg(long, default_value_t = 5, help = "Number of cross-validation folds")]
    n_fold: usize,

    #[arg(
        long,
        help = "Visits per patient",
        long_help = "Number of visits (time steps) per patient.\n\
		     If not specified, the largest visit index + 1."
    )]
    n_visits: Option<usize>,

    #[arg(
        long,
        help = "Number of medical codes",
        long_help = "Number of medical codes (features) per visit.\n\
		     If not specified, the largest code index + 1."
    )]
    n_codes: Option<usize>,

    #[arg(long, default_value_t = 128, help = "Hidden units (or filters)")]
    n_hidden: usize,

    #[arg(
        long,
        value_delimiter(','),
        default_values_t = vec![2, 3, 4],
        help = "CNN filter widths",
        long_help = "Convolution widths over visits (comma-separated).\n\
		     Used by `cnn` only. Example: 2,3,4"
    )]
    filter_widths: Vec<usize>,

    #[arg(long, default_value_t = 20000, help = "Pre-training iterations")]
    pretrain_iterations: usize,

    #[arg(long, default_value_t = 10000, help = "Meta-training iterations")]
    metatrain_iterations: usize,

    #[arg(long, default_value_t = 8, help = "Tasks per meta-update")]
    meta_batch_size: usize,

    #[arg(
        long,
        default_value_t = 16,
        help = "Samples per support/query set",
        long_help = "Samples per support and query set (K for K-shot learning).\n\
		     Also the size of the source support set at test time."
    )]
    update_batch_size: usize,

    #[arg(long, default_value_t = 1e-4, help = "Outer-loop (Adam) learning rate")]
    meta_lr: f64,

    #[arg(long, default_value_t = 1e-3, help = "Inner-loop step size")]
    update_lr: f64,

    #[arg(long, default_value_t = 4, help = "Inner-loop gradient steps")]
    num_updates: usize,

    #[arg(
        long,
        default_value_t = 100000,
        help = "Distinct episodes",
        long_help = "Number of distinct episodes; iteration i uses\n\
		     episode i mod n_total_batches."
    )]
    n_total_batches: usize,

    #[arg(
        long,
        value_enum,
        default_value = "none",
        help = "Hidden layer normalization",
        long_help = "Normalization of hidden activations.\n\
		     Options: none, batch_norm, layer_norm."
    )]
    norm: Norm,

    #[arg(
        long,
        default_value_t = false,
        help = "First-order meta-gradients",
        long_help = "Do not differentiate through the inner loop.\n\
		     Faster; ignores second-order terms."
    )]
    stop_grad: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set, help = "L2 regularization of weights and biases")]
    is_reg: bool,

    #[arg(long, default_value_t = 1e-4, help = "L2 regularization weight")]
    reg_rate: f64,

    #[arg(
        long,
        default_value_t = 0.5,
        help = "Dropout keep probability",
        long_help = "Probability of keeping a hidden unit in training.\n\
		     Set to 1 for bitwise reproducible runs."
    )]
    dropout: f32,

    #[arg(long, default_value_t = true, action = ArgAction::Set, help = "Meta-train the model")]
    train: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set, help = "Test on the true target")]
    test: bool,

    #[arg(
        long,
        default_value_t = false,
        action = ArgAction::Set,
        help = "Fine-tune on the true target",
        long_help = "Fine-tune the meta-trained model on the true target's\n\
		     training part of each fold before testing."
    )]
    finetune: bool,

    #[arg(
        long,
        value_enum,
        default_value = "none",
        help = "Layers kept fixed in fine-tuning",
        long_help = "Layers kept fixed in fine-tuning.\n\
		     none: train everything; encoder: train the head only."
    )]
    freeze: Freeze,

    #[arg(long, default_value_t = 1000, help = "Fine-tuning steps")]
    finetune_iterations: usize,

    #[arg(long, default_value_t = 1e-4, help = "Fine-tuning learning rate")]
    finetune_lr: f64,

    #[arg(long, default_value_t = 32, help = "Fine-tuning minibatch size")]
    finetune_batch_size: usize,

    #[arg(
        long,
        default_value_t = 0.2,
        help = "Fine-tuning validation ratio",
        long_help = "Fraction of the true target's training folds held out\n\
		     to select the best fine-tuned weights."
    )]
    finetune_val_ratio: f32,

    #[arg(long, default_value_t = true, action = ArgAction::Set, help = "Write training traces")]
    log: bool,

    #[arg(
        long,
        default_value = "model",
        help = "Checkpoint directory",
        long_help = "Checkpoints go to {logdir}/{exp}/fold{i}/model{iter}.safetensors"
    )]
    logdir: PathBuf,

    #[arg(long, default_value = "results", help = "Directory of result files")]
    results_dir: PathBuf,

    #[arg(long, default_value_t = false, help = "Resume from the latest checkpoint")]
    resume: bool,

    #[arg(
        long,
        default_value_t = -1,
        allow_negative_numbers = true,
        help = "Checkpoint iteration to load (-1: latest)"
    )]
    test_iter: i64,

    #[arg(
        long,
        default_value_t = -1,
        allow_negative_numbers = true,
        help = "Support/query size in meta-training (-1: update_batch_size)"
    )]
    train_update_batch_size: i64,

    #[arg(
        long,
        default_value_t = -1.0,
        allow_negative_numbers = true,
        help = "Inner step size in meta-training (-1: update_lr)"
    )]
    train_update_lr: f64,

    #[arg(long, default_value_t = 1, help = "Repetitions of the whole run")]
    run_time: usize,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(long, default_value_t = 256, help = "Minibatch size of prediction")]
    eval_batch_size: usize,

    #[arg(long, default_value_t = 100, help = "Iterations between loss reports")]
    print_interval: usize,

    #[arg(long, default_value_t = 500, help = "Iterations between validations")]
    val_interval: usize,

    #[arg(long, default_value_t = 1000, help = "Iterations between checkpoints")]
    save_interval: usize,

    #[arg(
        long,
        default_value_t = 1e-3,
        help = "Finite-difference step",
        long_help = "Step size of finite-difference Hessian-vector products\n\
		     in second-order meta-gradients."
    )]
    fd_epsilon: f64,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or meta, we may want to choose a different device."
    )]
    device_no: usize,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints additional information during execution."
    )]
    pub verbose: bool,
}

impl RunArgs {
    pub fn to_config(&self) -> anyhow::Result<RunConfig> {
        let device = match self.device {
            ComputeDevice::Metal => candle_util::candle_core::Device::new_metal(self.device_no)?,
            ComputeDevice::Cuda => candle_util::candle_core::Device::new_cuda(self.device_no)?,
            _ => candle_util::candle_core::Device::Cpu,
        };

        let config = RunConfig {
            source: self.source.clone(),
            target: self.target.clone(),
            true_target: self.true_target.clone(),
            data_dir: self.data_dir.clone(),
            n_classes: self.n_classes,
            n_fold: self.n_fold,
            n_visits: self.n_visits,
            n_codes: self.n_codes,
            method: self.method,
            n_hidden: self.n_hidden,
            filter_widths: self.filter_widths.clone(),
            norm: self.norm,
            keep_prob: self.dropout,
            pretrain_iterations: self.pretrain_iterations,
            metatrain_iterations: self.metatrain_iterations,
            meta_batch_size: self.meta_batch_size,
            update_batch_size: self.update_batch_size,
            meta_lr: self.meta_lr,
            update_lr: self.update_lr,
            num_updates: self.num_updates,
            n_total_batches: self.n_total_batches,
            stop_grad: self.stop_grad,
            is_reg: self.is_reg,
            reg_rate: self.reg_rate,
            train_update_batch_size: unless_negative(self.train_update_batch_size),
            train_update_lr: (self.train_update_lr >= 0.).then_some(self.train_update_lr),
            fd_epsilon: self.fd_epsilon,
            freeze: self.freeze,
            finetune_iterations: self.finetune_iterations,
            finetune_lr: self.finetune_lr,
            finetune_batch_size: self.finetune_batch_size,
            finetune_val_ratio: self.finetune_val_ratio,
            train: self.train,
            test: self.test,
            finetune: self.finetune,
            resume: self.resume,
            test_iter: unless_negative(self.test_iter),
            run_time: self.run_time,
            log: self.log,
            logdir: self.logdir.clone(),
            results_dir: self.results_dir.clone(),
            eval_batch_size: self.eval_batch_size,
            print_interval: self.print_interval,
            val_interval: self.val_interval,
            save_interval: self.save_interval,
            seed: self.seed,
            device,
            verbose: self.verbose,
            show_progress: true,
        };
        config.validate()?;
        Ok(config)
    }
}

/// `-1` (any negative) leaves the setting unset
fn unless_negative(x: i64) -> Option<usize> {
    (x >= 0).then_some(x as usize)
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(
        long,
        short,
        value_delimiter(','),
        default_value = "AD,MCI,PD",
        help = "Task names",
        long_help = "Task names (comma-separated).\n\
		     One cohort is written per task."
    )]
    tasks: Vec<Box<str>>,

    #[arg(long, short, required = true, help = "Output directory")]
    out: PathBuf,

    #[arg(long, short = 'n', default_value_t = 200, help = "Patients per task")]
    n_samples: usize,

    #[arg(long, default_value_t = 8, help = "Visits per patient")]
    n_visits: usize,

    #[arg(long, default_value_t = 30, help = "Number of medical codes")]
    n_codes: usize,

    #[arg(long, default_value_t = 2, help = "Number of classes")]
    n_classes: usize,

    #[arg(long, default_value_t = 0.05, help = "Background code probability")]
    density: f64,

    #[arg(long, default_value_t = 0.3, help = "Extra probability of marker codes")]
    signal: f64,

    #[arg(long, default_value_t = 5, help = "Marker codes per class")]
    n_marker_codes: usize,

    #[arg(
        long,
        default_value_t = 0.5,
        help = "Shared marker fraction",
        long_help = "Fraction of each class's marker codes common to all tasks.\n\
		     1 makes every task the same problem; 0 makes them unrelated."
    )]
    shared: f64,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    rseed: u64,

    #[arg(long, short, help = "Verbosity")]
    pub verbose: bool,
}

impl SimulateArgs {
    pub fn tasks(&self) -> &[Box<str>] {
        &self.tasks
    }

    pub fn out(&self) -> &PathBuf {
        &self.out
    }

    pub fn sim_args(&self) -> SimArgs {
        SimArgs {
            n_samples: self.n_samples,
            n_visits: self.n_visits,
            n_codes: self.n_codes,
            n_classes: self.n_classes,
            density: self.density,
            signal: self.signal,
            n_marker_codes: self.n_marker_codes,
            shared: self.shared,
            rseed: self.rseed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    #[test]
    fn defaults_give_the_reference_experiment() -> anyhow::Result<()> {
        let config = TestCli::try_parse_from(["metapred"])?.run.to_config()?;
        assert_eq!(
            config.exp_string(),
            "stsk_ADttsk_MCI.mbs_8.ubs_16.numstep4.updatelr0.001"
        );
        assert_eq!(config.method, Method::Rnn);
        assert_eq!(config.test_iter, None);
        assert_eq!(config.train_update_batch_size, None);
        assert_eq!(config.train_update_lr, None);
        assert!(config.is_reg && config.train && config.test && !config.finetune);
        approx::assert_abs_diff_eq!(config.keep_prob, 0.5);
        Ok(())
    }

    #[test]
    fn flags_map_onto_the_config() -> anyhow::Result<()> {
        let cli = TestCli::try_parse_from([
            "metapred",
            "--source",
            "AD,HF",
            "--method",
            "cnn",
            "--norm",
            "layer_norm",
            "--train",
            "false",
            "--is-reg",
            "false",
            "--test-iter",
            "300",
            "--train-update-batch-size",
            "4",
            "--train-update-lr",
            "0.01",
            "--freeze",
            "encoder",
        ])?;
        let config = cli.run.to_config()?;
        assert_eq!(config.source.len(), 2);
        assert_eq!(config.method, Method::Cnn);
        assert_eq!(config.norm, Norm::LayerNorm);
        assert!(!config.train && !config.is_reg);
        assert_eq!(config.test_iter, Some(300));
        assert_eq!(config.train_update_batch_size(), 4);
        approx::assert_abs_diff_eq!(config.train_update_lr(), 0.01);
        assert_eq!(config.freeze, Freeze::Encoder);
        Ok(())
    }

    #[test]
    fn zero_training_batch_size_is_rejected() -> anyhow::Result<()> {
        let cli = TestCli::try_parse_from(["metapred", "--train-update-batch-size", "0"])?;
        assert!(cli.run.to_config().is_err());

        let cli = TestCli::try_parse_from(["metapred", "--train-update-batch-size", "-1"])?;
        assert_eq!(cli.run.to_config()?.train_update_batch_size, None);
        Ok(())
    }

    #[test]
    fn unknown_method_is_rejected_at_parsing() {
        assert!(TestCli::try_parse_from(["metapred", "--method", "svm"]).is_err());
        assert!(TestCli::try_parse_from(["metapred", "--dropout", "0"])
            .map_err(anyhow::Error::from)
            .and_then(|c| c.run.to_config())
            .is_err());
    }
}
