use candle_core::{Result, Tensor};

/// Which part of a network a parameter belongs to. Fine-tuning can
/// freeze the `Encoder` group and train the `Head` only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamGroup {
    Encoder,
    Head,
}

/// How to fill a parameter when a network is first built
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamInit {
    /// Glorot/Xavier uniform: U(-a, a), a = sqrt(6 / (fan_in + fan_out))
    Glorot { fan_in: usize, fan_out: usize },
    Zeros,
    /// LSTM gate bias laid out as (input, forget, cell, output); the
    /// forget gate starts at one
    ForgetGateBias { hidden: usize },
}

#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: Box<str>,
    pub shape: Vec<usize>,
    pub group: ParamGroup,
    pub init: ParamInit,
}

impl ParamSpec {
    pub fn weight(name: &str, shape: &[usize], fan: (usize, usize), group: ParamGroup) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            group,
            init: ParamInit::Glorot {
                fan_in: fan.0,
                fan_out: fan.1,
            },
        }
    }

    pub fn bias(name: &str, dim: usize, group: ParamGroup) -> Self {
        Self {
            name: name.into(),
            shape: vec![dim],
            group,
            init: ParamInit::Zeros,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A classifier whose weights live outside the module.
///
/// Inner-loop adaptation produces new weight lists without touching
/// the shared parameters, so every forward pass takes the weights
/// explicitly, in the order of `param_specs`.
pub trait ClassifierT: Send + Sync {
    /// Names, shapes and initializers of the weights `forward_with`
    /// expects, in order
    fn param_specs(&self) -> Vec<ParamSpec>;

    /// Class logits
    ///
    /// * `weights` - one tensor per `param_specs` entry
    /// * `x_ntd` - visits of `n` samples (n x visits x codes)
    /// * `train` - whether to apply dropout
    ///
    /// # Returns `logits_nc` (n x classes)
    fn forward_with(&self, weights: &[Tensor], x_ntd: &Tensor, train: bool) -> Result<Tensor>;

    fn n_classes(&self) -> usize;

    fn name(&self) -> &'static str;
}
