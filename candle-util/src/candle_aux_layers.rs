use candle_core::{Result, Tensor, D};
use clap::ValueEnum;

const NORM_EPS: f64 = 1e-5;

/// Normalization applied to hidden activations
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[clap(rename_all = "snake_case")]
pub enum Norm {
    #[default]
    None,
    /// standardize each unit across the minibatch
    BatchNorm,
    /// standardize each sample across its units
    LayerNorm,
}

impl std::fmt::Display for Norm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Norm::None => write!(f, "None"),
            Norm::BatchNorm => write!(f, "batch_norm"),
            Norm::LayerNorm => write!(f, "layer_norm"),
        }
    }
}

/// `x_nk * w_kd + b_d`
pub fn linear(x_nk: &Tensor, w_kd: &Tensor, b_d: &Tensor) -> Result<Tensor> {
    x_nk.matmul(w_kd)?.broadcast_add(b_d)
}

/// logistic function written through `tanh` so that both tails
/// stay finite under backprop
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    (((x * 0.5)?.tanh()? + 1.0)? * 0.5)
}

/// Normalize a (n x k) activation matrix without learned affine terms
pub fn normalize(h_nk: &Tensor, norm: Norm) -> Result<Tensor> {
    let dim = match norm {
        Norm::None => return Ok(h_nk.clone()),
        Norm::BatchNorm => 0,
        Norm::LayerNorm => h_nk.rank() - 1,
    };
    let mu = h_nk.mean_keepdim(dim)?;
    let centred = h_nk.broadcast_sub(&mu)?;
    let var = centred.sqr()?.mean_keepdim(dim)?;
    centred.broadcast_div(&(var + NORM_EPS)?.sqrt()?)
}

/// Dropout with the keep probability convention; identity at
/// evaluation time
pub fn dropout(h: &Tensor, keep_prob: f32, train: bool) -> Result<Tensor> {
    if !train || keep_prob >= 1.0 {
        return Ok(h.clone());
    }
    candle_nn::ops::dropout(h, 1.0 - keep_prob)
}

/// Run a single-layer LSTM over the time axis and return the last
/// hidden state.
///
/// * `x_ntd` - input sequence (n x time x d)
/// * `w_x` - input weights (d x 4h)
/// * `w_h` - recurrent weights (h x 4h)
/// * `b` - gate bias (4h), gates ordered (input, forget, cell, output)
///
/// # Returns `h_nh` (n x h)
pub fn lstm_last_hidden(x_ntd: &Tensor, w_x: &Tensor, w_h: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (n, ntime, d) = x_ntd.dims3()?;
    let h4 = b.dim(0)?;
    let hdim = h4 / 4;

    // input projections for every step at once
    let xw_nth = x_ntd
        .contiguous()?
        .reshape((n * ntime, d))?
        .matmul(w_x)?
        .reshape((n, ntime, h4))?;

    let mut h_nh = Tensor::zeros((n, hdim), x_ntd.dtype(), x_ntd.device())?;
    let mut c_nh = h_nh.clone();

    for t in 0..ntime {
        let gates = xw_nth
            .narrow(1, t, 1)?
            .squeeze(1)?
            .add(&h_nh.matmul(w_h)?)?
            .broadcast_add(b)?;

        let input_gate = sigmoid(&gates.narrow(1, 0, hdim)?)?;
        let forget_gate = sigmoid(&gates.narrow(1, hdim, hdim)?)?;
        let cell = gates.narrow(1, 2 * hdim, hdim)?.tanh()?;
        let output_gate = sigmoid(&gates.narrow(1, 3 * hdim, hdim)?)?;

        c_nh = (forget_gate.mul(&c_nh)? + input_gate.mul(&cell)?)?;
        h_nh = output_gate.mul(&c_nh.tanh()?)?;
    }
    Ok(h_nh)
}

/// 1-D convolution over the time axis followed by ReLU and max
/// pooling over time.
///
/// * `x_ndt` - channels-first input (n x d x time)
/// * `kernel_fdw` - filters (f x d x width)
/// * `bias_f` - filter bias (f)
///
/// # Returns `h_nf` (n x f)
pub fn conv_max_pool(x_ndt: &Tensor, kernel_fdw: &Tensor, bias_f: &Tensor) -> Result<Tensor> {
    let (nfilter, _, width) = kernel_fdw.dims3()?;
    let padding = width.saturating_sub(1);
    x_ndt
        .conv1d(kernel_fdw, padding, 1, 1, 1)?
        .broadcast_add(&bias_f.reshape((1, nfilter, 1))?)?
        .relu()?
        .max(D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn sigmoid_matches_logistic() -> Result<()> {
        let x = Tensor::from_vec(vec![-30f32, -1., 0., 2., 30.], 5, &Device::Cpu)?;
        let y = sigmoid(&x)?.to_vec1::<f32>()?;
        for (xi, yi) in [-30f32, -1., 0., 2., 30.].iter().zip(y.iter()) {
            approx::assert_abs_diff_eq!(*yi, 1.0 / (1.0 + (-xi).exp()), epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn batch_norm_centres_columns() -> Result<()> {
        let h = Tensor::from_vec(vec![1f32, 10., 3., 20., 5., 30.], (3, 2), &Device::Cpu)?;
        let z = normalize(&h, Norm::BatchNorm)?;
        let col_mean = z.mean(0)?.to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(col_mean[0], 0.0, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(col_mean[1], 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn batch_norm_single_sample_is_finite() -> Result<()> {
        let h = Tensor::ones((1, 4), DType::F32, &Device::Cpu)?;
        let z = normalize(&h, Norm::BatchNorm)?.to_vec2::<f32>()?;
        assert!(z[0].iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn conv_pools_to_filters() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (3, 5, 7), &dev)?;
        let k = Tensor::randn(0f32, 1f32, (4, 5, 3), &dev)?;
        let b = Tensor::zeros(4, DType::F32, &dev)?;
        assert_eq!(conv_max_pool(&x, &k, &b)?.dims(), &[3, 4]);
        Ok(())
    }
}
