pub mod checkpoint; // safetensors checkpoints with metadata
pub mod cli;
pub mod config; // immutable run configuration
pub mod driver; // train, fine-tune, test over folds
pub mod finetune;
pub mod maml; // inner loop and meta-gradients
pub mod meta_model;
pub mod metrics;
pub mod results;
