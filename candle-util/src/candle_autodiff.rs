use candle_core::{Result, Tensor, Var};

/// Evaluate `loss_fn` at `weights` and take its gradient with respect
/// to every weight.
///
/// The weights are copied into fresh variables first, so the result
/// does not depend on (or leak into) any graph the inputs came from.
///
/// # Returns `(loss, grads)` with one gradient per weight
pub fn value_and_grad<F>(weights: &[Tensor], loss_fn: &F) -> Result<(f32, Vec<Tensor>)>
where
    F: Fn(&[Tensor]) -> Result<Tensor>,
{
    let vars = weights
        .iter()
        .map(|w| Var::from_tensor(&w.detach()))
        .collect::<Result<Vec<_>>>()?;

    let leaves: Vec<Tensor> = vars.iter().map(|v| v.as_tensor().clone()).collect();

    let loss = loss_fn(&leaves)?;
    let grads = loss.backward()?;

    let grads = leaves
        .iter()
        .map(|w| match grads.get(w) {
            Some(g) => Ok(g.clone()),
            None => w.zeros_like(),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((loss.to_scalar::<f32>()?, grads))
}

/// `w - lr * g` for every pair
pub fn sgd_step(weights: &[Tensor], grads: &[Tensor], lr: f64) -> Result<Vec<Tensor>> {
    axpy(-lr, grads, weights)
}

/// `y + alpha * x` for every pair
pub fn axpy(alpha: f64, x: &[Tensor], y: &[Tensor]) -> Result<Vec<Tensor>> {
    if x.len() != y.len() {
        candle_core::bail!("axpy: {} vs. {} tensors", x.len(), y.len());
    }
    x.iter()
        .zip(y.iter())
        .map(|(xi, yi)| yi.add(&xi.affine(alpha, 0.)?))
        .collect()
}

/// Scale every tensor by `alpha`
pub fn scale(alpha: f64, x: &[Tensor]) -> Result<Vec<Tensor>> {
    x.iter().map(|xi| xi.affine(alpha, 0.)).collect()
}

/// sqrt( sum_k ||x_k||^2 )
pub fn global_norm(x: &[Tensor]) -> Result<f64> {
    let mut tot = 0f64;
    for xi in x {
        tot += xi.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
    }
    Ok(tot.sqrt())
}

/// Hessian-vector product `H(w) v` of `loss_fn` by central finite
/// differences of gradients:
///
/// Hv ≈ [ g(w + r v) - g(w - r v) ] / 2r,  r = epsilon / ||v||
///
/// `loss_fn` must be deterministic (no dropout) for the difference to
/// be meaningful.
pub fn hessian_vector_product<F>(
    weights: &[Tensor],
    v: &[Tensor],
    loss_fn: &F,
    epsilon: f64,
) -> Result<Vec<Tensor>>
where
    F: Fn(&[Tensor]) -> Result<Tensor>,
{
    let norm = global_norm(v)?;
    if norm <= f64::EPSILON {
        return v.iter().map(|vi| vi.zeros_like()).collect();
    }
    let r = epsilon / norm;

    let (_, g_plus) = value_and_grad(&axpy(r, v, weights)?, loss_fn)?;
    let (_, g_minus) = value_and_grad(&axpy(-r, v, weights)?, loss_fn)?;

    g_plus
        .iter()
        .zip(g_minus.iter())
        .map(|(gp, gm)| gp.sub(gm)?.affine(0.5 / r, 0.))
        .collect()
}

/// A scalar whose gradient with respect to `weights` is `grads`:
/// `sum_k <w_k, stop_grad(g_k)>`.
///
/// Lets a precomputed gradient go through an ordinary
/// `Optimizer::backward_step`.
pub fn surrogate_loss(weights: &[Tensor], grads: &[Tensor]) -> Result<Tensor> {
    if weights.is_empty() || weights.len() != grads.len() {
        candle_core::bail!(
            "surrogate loss: {} weights vs. {} gradients",
            weights.len(),
            grads.len()
        );
    }
    let terms = weights
        .iter()
        .zip(grads.iter())
        .map(|(w, g)| w.mul(&g.detach())?.sum_all())
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&terms, 0)?.sum_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// f(w) = 0.5 * w' A w with A = [[2, 1], [1, 3]]
    fn quadratic(w: &[Tensor]) -> Result<Tensor> {
        let a = Tensor::from_vec(vec![2f32, 1., 1., 3.], (2, 2), w[0].device())?;
        let w_col = w[0].reshape((2, 1))?;
        (w_col.t()?.matmul(&a.matmul(&w_col)?)?.sum_all()? * 0.5)
    }

    #[test]
    fn gradient_of_quadratic() -> Result<()> {
        let w = Tensor::from_vec(vec![1f32, -1.], 2, &Device::Cpu)?;
        let (f, g) = value_and_grad(&[w], &quadratic)?;
        approx::assert_abs_diff_eq!(f, 1.5, epsilon = 1e-5);
        let g = g[0].to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(g[0], 1.0, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(g[1], -2.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn finite_difference_hvp_matches_hessian() -> Result<()> {
        let w = Tensor::from_vec(vec![0.3f32, 0.7], 2, &Device::Cpu)?;
        let v = Tensor::from_vec(vec![1f32, 2.], 2, &Device::Cpu)?;
        let hv = hessian_vector_product(&[w], &[v], &quadratic, 1e-2)?;
        let hv = hv[0].to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(hv[0], 4.0, epsilon = 1e-2);
        approx::assert_abs_diff_eq!(hv[1], 7.0, epsilon = 1e-2);
        Ok(())
    }

    #[test]
    fn surrogate_gradient_is_the_given_gradient() -> Result<()> {
        let w = Var::from_tensor(&Tensor::from_vec(vec![5f32, 6.], 2, &Device::Cpu)?)?;
        let g = Tensor::from_vec(vec![0.25f32, -4.], 2, &Device::Cpu)?;
        let loss = surrogate_loss(&[w.as_tensor().clone()], &[g])?;
        let grads = loss.backward()?;
        let gw = grads.get(w.as_tensor()).expect("grad").to_vec1::<f32>()?;
        assert_eq!(gw, vec![0.25, -4.]);
        Ok(())
    }
}
