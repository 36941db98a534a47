use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;

use candle_core::{Result, Tensor};
use clap::ValueEnum;

/// Network family used for the EHR sequence classifier
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum Method {
    Mlp,
    Cnn,
    Rnn,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Mlp => write!(f, "mlp"),
            Method::Cnn => write!(f, "cnn"),
            Method::Rnn => write!(f, "rnn"),
        }
    }
}

impl std::str::FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        <Method as ValueEnum>::from_str(s, true).map_err(|e| anyhow::anyhow!(e))
    }
}

#[derive(Clone, Debug)]
pub struct ClassifierArgs {
    pub n_visits: usize,
    pub n_codes: usize,
    pub n_classes: usize,
    pub n_hidden: usize,
    pub filter_widths: Vec<usize>,
    pub norm: Norm,
    pub keep_prob: f32,
}

/// Build the classifier for `method`
pub fn build_classifier(method: Method, args: &ClassifierArgs) -> Box<dyn ClassifierT> {
    match method {
        Method::Mlp => Box::new(MlpClassifier::new(args.clone())),
        Method::Cnn => Box::new(CnnClassifier::new(args.clone())),
        Method::Rnn => Box::new(RnnClassifier::new(args.clone())),
    }
}

fn check_weights(name: &str, weights: &[Tensor], expected: usize) -> Result<()> {
    if weights.len() != expected {
        candle_core::bail!(
            "{} expects {} weight tensors, got {}",
            name,
            expected,
            weights.len()
        );
    }
    Ok(())
}

fn head_specs(in_dim: usize, n_classes: usize) -> [ParamSpec; 2] {
    [
        ParamSpec::weight(
            "head.weight",
            &[in_dim, n_classes],
            (in_dim, n_classes),
            ParamGroup::Head,
        ),
        ParamSpec::bias("head.bias", n_classes, ParamGroup::Head),
    ]
}

/////////////////////////////////
// flattened visits -> 2 layers //
/////////////////////////////////

pub struct MlpClassifier {
    args: ClassifierArgs,
}

impl MlpClassifier {
    pub fn new(args: ClassifierArgs) -> Self {
        Self { args }
    }

    fn dim_input(&self) -> usize {
        self.args.n_visits * self.args.n_codes
    }
}

impl ClassifierT for MlpClassifier {
    fn param_specs(&self) -> Vec<ParamSpec> {
        let (d, h) = (self.dim_input(), self.args.n_hidden);
        let mut ret = vec![
            ParamSpec::weight("fc1.weight", &[d, h], (d, h), ParamGroup::Encoder),
            ParamSpec::bias("fc1.bias", h, ParamGroup::Encoder),
            ParamSpec::weight("fc2.weight", &[h, h], (h, h), ParamGroup::Encoder),
            ParamSpec::bias("fc2.bias", h, ParamGroup::Encoder),
        ];
        ret.extend(head_specs(h, self.args.n_classes));
        ret
    }

    fn forward_with(&self, weights: &[Tensor], x_ntd: &Tensor, train: bool) -> Result<Tensor> {
        check_weights(self.name(), weights, 6)?;
        let n = x_ntd.dim(0)?;
        let mut h = x_ntd.contiguous()?.reshape((n, self.dim_input()))?;

        for layer in [&weights[0..2], &weights[2..4]] {
            h = linear(&h, &layer[0], &layer[1])?.relu()?;
            h = normalize(&h, self.args.norm)?;
            h = dropout(&h, self.args.keep_prob, train)?;
        }

        linear(&h, &weights[4], &weights[5])
    }

    fn n_classes(&self) -> usize {
        self.args.n_classes
    }

    fn name(&self) -> &'static str {
        "mlp"
    }
}

//////////////////////////////////////////////
// convolution over visits, multiple widths //
//////////////////////////////////////////////

pub struct CnnClassifier {
    args: ClassifierArgs,
}

impl CnnClassifier {
    pub fn new(args: ClassifierArgs) -> Self {
        Self { args }
    }

    fn widths(&self) -> Vec<usize> {
        if self.args.filter_widths.is_empty() {
            vec![3]
        } else {
            self.args.filter_widths.clone()
        }
    }
}

impl ClassifierT for CnnClassifier {
    fn param_specs(&self) -> Vec<ParamSpec> {
        let (d, f) = (self.args.n_codes, self.args.n_hidden);
        let widths = self.widths();
        let mut ret = Vec::with_capacity(2 * widths.len() + 2);
        for &w in widths.iter() {
            ret.push(ParamSpec::weight(
                &format!("conv{}.weight", w),
                &[f, d, w],
                (d * w, f * w),
                ParamGroup::Encoder,
            ));
            ret.push(ParamSpec::bias(
                &format!("conv{}.bias", w),
                f,
                ParamGroup::Encoder,
            ));
        }
        ret.extend(head_specs(f * widths.len(), self.args.n_classes));
        ret
    }

    fn forward_with(&self, weights: &[Tensor], x_ntd: &Tensor, train: bool) -> Result<Tensor> {
        let nconv = self.widths().len();
        check_weights(self.name(), weights, 2 * nconv + 2)?;

        let x_ndt = x_ntd.transpose(1, 2)?.contiguous()?;

        let pooled = weights[..2 * nconv]
            .chunks(2)
            .map(|kb| conv_max_pool(&x_ndt, &kb[0], &kb[1]))
            .collect::<Result<Vec<_>>>()?;

        let h = Tensor::cat(&pooled, 1)?;
        let h = normalize(&h, self.args.norm)?;
        let h = dropout(&h, self.args.keep_prob, train)?;

        linear(&h, &weights[2 * nconv], &weights[2 * nconv + 1])
    }

    fn n_classes(&self) -> usize {
        self.args.n_classes
    }

    fn name(&self) -> &'static str {
        "cnn"
    }
}

////////////////////////////////
// LSTM over the visit history //
////////////////////////////////

pub struct RnnClassifier {
    args: ClassifierArgs,
}

impl RnnClassifier {
    pub fn new(args: ClassifierArgs) -> Self {
        Self { args }
    }
}

impl ClassifierT for RnnClassifier {
    fn param_specs(&self) -> Vec<ParamSpec> {
        let (d, h) = (self.args.n_codes, self.args.n_hidden);
        let mut ret = vec![
            ParamSpec::weight("lstm.weight_x", &[d, 4 * h], (d, h), ParamGroup::Encoder),
            ParamSpec::weight("lstm.weight_h", &[h, 4 * h], (h, h), ParamGroup::Encoder),
            ParamSpec {
                name: "lstm.bias".into(),
                shape: vec![4 * h],
                group: ParamGroup::Encoder,
                init: ParamInit::ForgetGateBias { hidden: h },
            },
        ];
        ret.extend(head_specs(h, self.args.n_classes));
        ret
    }

    fn forward_with(&self, weights: &[Tensor], x_ntd: &Tensor, train: bool) -> Result<Tensor> {
        check_weights(self.name(), weights, 5)?;
        let h = lstm_last_hidden(x_ntd, &weights[0], &weights[1], &weights[2])?;
        let h = normalize(&h, self.args.norm)?;
        let h = dropout(&h, self.args.keep_prob, train)?;
        linear(&h, &weights[3], &weights[4])
    }

    fn n_classes(&self) -> usize {
        self.args.n_classes
    }

    fn name(&self) -> &'static str {
        "rnn"
    }
}
