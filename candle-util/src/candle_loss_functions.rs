use candle_core::{Result, Tensor};
use candle_nn::ops;

/// Softmax cross entropy averaged over samples
///
/// loss = -1/n sum_i sum_c y(i,c) * log softmax(logits)(i,c)
///
/// * `logits_nc` - unnormalized class scores
/// * `onehot_nc` - one-hot (or soft) class targets
///
pub fn softmax_cross_entropy(logits_nc: &Tensor, onehot_nc: &Tensor) -> Result<Tensor> {
    let log_p_nc = ops::log_softmax(logits_nc, logits_nc.rank() - 1)?;
    onehot_nc
        .mul(&log_p_nc)?
        .sum(onehot_nc.rank() - 1)?
        .mean_all()?
        .neg()
}

/// L2 penalty over every tensor in `weights`
///
/// penalty = 0.5 * sum_k ||w_k||^2
///
pub fn l2_penalty(weights: &[Tensor]) -> Result<Tensor> {
    let terms = weights
        .iter()
        .map(|w| w.sqr()?.sum_all())
        .collect::<Result<Vec<_>>>()?;

    if terms.is_empty() {
        candle_core::bail!("no weights to penalize");
    }

    Tensor::stack(&terms, 0)?.sum_all()? * 0.5
}

/// Class probabilities from logits
pub fn class_probabilities(logits_nc: &Tensor) -> Result<Tensor> {
    ops::softmax(logits_nc, logits_nc.rank() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_logits_give_log_c() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::zeros((4, 2), candle_core::DType::F32, &dev)?;
        let onehot = Tensor::from_vec(vec![1f32, 0., 0., 1., 1., 0., 0., 1.], (4, 2), &dev)?;
        let loss = softmax_cross_entropy(&logits, &onehot)?.to_scalar::<f32>()?;
        approx::assert_abs_diff_eq!(loss, 2f32.ln(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn l2_penalty_sums_halves() -> Result<()> {
        let dev = Device::Cpu;
        let a = Tensor::from_vec(vec![1f32, 2.], 2, &dev)?;
        let b = Tensor::from_vec(vec![3f32], 1, &dev)?;
        let pen = l2_penalty(&[a, b])?.to_scalar::<f32>()?;
        approx::assert_abs_diff_eq!(pen, 7.0, epsilon = 1e-6);
        Ok(())
    }
}
