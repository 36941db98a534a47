pub mod candle_autodiff;
pub mod candle_aux_layers;
pub mod candle_classifiers;
pub mod candle_data_loader_util;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_param_set;

pub use candle_core;
pub use candle_nn;
