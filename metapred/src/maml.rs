use candle_util::candle_autodiff::*;
use candle_util::candle_core::{Result, Tensor};
use candle_util::candle_loss_functions::*;
use candle_util::candle_model_traits::ClassifierT;
use ehr_data::episode::TaskBatch;
use ehr_data::subset::LabeledBatch;
use rayon::prelude::*;

/// Inner-loop settings shared by every task of a run
pub struct Maml<'a> {
    pub net: &'a dyn ClassifierT,
    pub num_updates: usize,
    /// inner-loop step size
    pub inner_lr: f64,
    /// weight of the L2 penalty; 0 turns it off
    pub reg_weight: f64,
    /// first-order meta-gradients
    pub stop_grad: bool,
    /// finite-difference step of Hessian-vector products
    pub fd_epsilon: f64,
}

/// Outcome of one task: support loss before adaptation, query loss
/// after adaptation, and the query loss gradient with respect to the
/// shared initialization
pub struct TaskGradient {
    pub pre_loss: f32,
    pub post_loss: f32,
    pub grads: Vec<Tensor>,
}

/// Task gradients averaged over a meta-batch
pub struct MetaGradient {
    pub pre_loss: f32,
    pub post_loss: f32,
    pub grads: Vec<Tensor>,
}

impl Maml<'_> {
    /// Cross entropy plus the optional L2 penalty
    pub fn task_loss(&self, weights: &[Tensor], batch: &LabeledBatch, train: bool) -> Result<Tensor> {
        let logits = self.net.forward_with(weights, &batch.x, train)?;
        let ce = softmax_cross_entropy(&logits, &batch.y)?;
        if self.reg_weight > 0. {
            ce.add(&(l2_penalty(weights)? * self.reg_weight)?)
        } else {
            Ok(ce)
        }
    }

    /// Run `num_updates` SGD steps on `support` from `w0`.
    ///
    /// # Returns `(support loss at w0, [w0, w1, .., wK])`
    pub fn adapt(
        &self,
        w0: &[Tensor],
        support: &LabeledBatch,
        train: bool,
    ) -> Result<(f32, Vec<Vec<Tensor>>)> {
        let loss_fn = |w: &[Tensor]| self.task_loss(w, support, train);
        let mut path = Vec::with_capacity(self.num_updates + 1);
        path.push(w0.to_vec());

        let mut pre_loss = None;
        for _ in 0..self.num_updates {
            let w = &path[path.len() - 1];
            let (loss, g) = value_and_grad(w, &loss_fn)?;
            pre_loss.get_or_insert(loss);
            let next = sgd_step(w, &g, self.inner_lr)?;
            path.push(next);
        }

        let pre_loss = match pre_loss {
            Some(l) => l,
            None => loss_fn(w0)?.to_scalar::<f32>()?,
        };
        Ok((pre_loss, path))
    }

    /// Adapted weights only
    pub fn adapted_weights(&self, w0: &[Tensor], support: &LabeledBatch, train: bool) -> Result<Vec<Tensor>> {
        let (_, mut path) = self.adapt(w0, support, train)?;
        match path.pop() {
            Some(w) => Ok(w),
            None => Ok(w0.to_vec()),
        }
    }

    /// Gradient of the post-adaptation query loss with respect to `w0`.
    ///
    /// First order: the query gradient at the adapted weights.
    /// Second order: that gradient pulled back through every inner
    /// step, `v <- v - lr * H(w_k) v` for `k = K-1 .. 0`, with `H` the
    /// Hessian of the (dropout-free) support loss.
    pub fn task_gradient(&self, w0: &[Tensor], task: &TaskBatch) -> Result<TaskGradient> {
        let (pre_loss, path) = self.adapt(w0, &task.support, true)?;
        let adapted = &path[path.len() - 1];

        let query_fn = |w: &[Tensor]| self.task_loss(w, &task.query, true);
        let (post_loss, mut v) = value_and_grad(adapted, &query_fn)?;

        if !self.stop_grad {
            let support_fn = |w: &[Tensor]| self.task_loss(w, &task.support, false);
            for w_k in path[..path.len() - 1].iter().rev() {
                let hv = hessian_vector_product(w_k, &v, &support_fn, self.fd_epsilon)?;
                v = axpy(-self.inner_lr, &hv, &v)?;
            }
        }

        Ok(TaskGradient {
            pre_loss,
            post_loss,
            grads: v,
        })
    }

    /// Task gradients of a meta-batch computed in parallel, then
    /// averaged in task order
    pub fn meta_gradient(&self, w0: &[Tensor], tasks: &[TaskBatch]) -> Result<MetaGradient> {
        let per_task = tasks
            .par_iter()
            .map(|t| self.task_gradient(w0, t))
            .collect::<Result<Vec<_>>>()?;

        let denom = per_task.len().max(1) as f64;

        let mut grads: Vec<Tensor> = w0.iter().map(|w| w.zeros_like()).collect::<Result<_>>()?;
        let mut pre_loss = 0f32;
        let mut post_loss = 0f32;
        for t in per_task.iter() {
            grads = axpy(1.0, &t.grads, &grads)?;
            pre_loss += t.pre_loss;
            post_loss += t.post_loss;
        }

        Ok(MetaGradient {
            pre_loss: pre_loss / denom as f32,
            post_loss: post_loss / denom as f32,
            grads: scale(1.0 / denom, &grads)?,
        })
    }

    /// Mean support loss of a meta-batch at `weights`, kept on the
    /// graph for an ordinary optimizer step
    pub fn pretrain_loss(&self, weights: &[Tensor], tasks: &[TaskBatch]) -> Result<Tensor> {
        let losses = tasks
            .iter()
            .map(|t| self.task_loss(weights, &t.support, true))
            .collect::<Result<Vec<_>>>()?;
        if losses.is_empty() {
            candle_util::candle_core::bail!("empty meta-batch");
        }
        Tensor::stack(&losses, 0)?.mean_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_util::candle_aux_layers::Norm;
    use candle_util::candle_classifiers::*;
    use candle_util::candle_core::Device;
    use candle_util::candle_param_set::ParamSet;

    fn batch(n: usize, shift: f32, dev: &Device) -> Result<LabeledBatch> {
        let x: Vec<f32> = (0..n * 12)
            .map(|i| ((i * 31 % 17) as f32 - 8.) / 8. + shift)
            .collect();
        let labels: Vec<usize> = (0..n).map(|i| i % 2).collect();
        let mut y = vec![0f32; n * 2];
        for (i, &k) in labels.iter().enumerate() {
            y[2 * i + k] = 1.;
        }
        Ok(LabeledBatch {
            x: Tensor::from_vec(x, (n, 3, 4), dev)?,
            y: Tensor::from_vec(y, (n, 2), dev)?,
            labels,
        })
    }

    fn net(method: Method) -> Box<dyn ClassifierT> {
        build_classifier(
            method,
            &ClassifierArgs {
                n_visits: 3,
                n_codes: 4,
                n_classes: 2,
                n_hidden: 5,
                filter_widths: vec![],
                norm: Norm::None,
                keep_prob: 1.0,
            },
        )
    }

    fn flat(ts: &[Tensor]) -> Result<Vec<f32>> {
        let mut ret = vec![];
        for t in ts {
            ret.extend(t.flatten_all()?.to_vec1::<f32>()?);
        }
        Ok(ret)
    }

    #[test]
    fn no_inner_steps_means_first_order() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let net = net(Method::Mlp);
        let w0 = ParamSet::init(&net.param_specs(), 0, &dev)?.snapshot()?;
        let task = TaskBatch {
            support: batch(4, 0., &dev)?,
            query: batch(4, 0.3, &dev)?,
        };
        let maml = |stop_grad| Maml {
            net: net.as_ref(),
            num_updates: 0,
            inner_lr: 0.1,
            reg_weight: 1e-3,
            stop_grad,
            fd_epsilon: 1e-3,
        };
        let a = flat(&maml(true).task_gradient(&w0, &task)?.grads)?;
        let b = flat(&maml(false).task_gradient(&w0, &task)?.grads)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn second_order_differs_but_stays_close() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let net = net(Method::Rnn);
        let w0 = ParamSet::init(&net.param_specs(), 1, &dev)?.snapshot()?;
        let task = TaskBatch {
            support: batch(6, 0., &dev)?,
            query: batch(6, 0.2, &dev)?,
        };
        let maml = |stop_grad| Maml {
            net: net.as_ref(),
            num_updates: 2,
            inner_lr: 0.05,
            reg_weight: 0.,
            stop_grad,
            fd_epsilon: 1e-3,
        };
        let first = maml(true).task_gradient(&w0, &task)?;
        let second = maml(false).task_gradient(&w0, &task)?;
        approx::assert_abs_diff_eq!(first.post_loss, second.post_loss, epsilon = 1e-6);

        let (a, b) = (flat(&first.grads)?, flat(&second.grads)?);
        let diff: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum();
        let size: f32 = a.iter().map(|x| x.abs()).sum();
        assert!(diff > 0.);
        assert!(diff < size);
        Ok(())
    }

    #[test]
    fn inner_steps_lower_the_support_loss() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let net = net(Method::Mlp);
        let w0 = ParamSet::init(&net.param_specs(), 2, &dev)?.snapshot()?;
        let support = batch(8, 0., &dev)?;
        let maml = Maml {
            net: net.as_ref(),
            num_updates: 5,
            inner_lr: 0.1,
            reg_weight: 0.,
            stop_grad: true,
            fd_epsilon: 1e-3,
        };
        let (pre, path) = maml.adapt(&w0, &support, false)?;
        assert_eq!(path.len(), 6);
        let post = maml.task_loss(&path[5], &support, false)?.to_scalar::<f32>()?;
        assert!(post < pre);
        Ok(())
    }

    #[test]
    fn single_task_single_sample_meta_batch() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let net = net(Method::Mlp);
        let w0 = ParamSet::init(&net.param_specs(), 3, &dev)?.snapshot()?;
        let tasks = vec![TaskBatch {
            support: batch(1, 0., &dev)?,
            query: batch(1, 0.1, &dev)?,
        }];
        let maml = Maml {
            net: net.as_ref(),
            num_updates: 1,
            inner_lr: 0.01,
            reg_weight: 1e-4,
            stop_grad: false,
            fd_epsilon: 1e-3,
        };
        let mg = maml.meta_gradient(&w0, &tasks)?;
        assert!(mg.post_loss.is_finite());
        assert!(flat(&mg.grads)?.iter().all(|g| g.is_finite()));
        assert!(maml.meta_gradient(&w0, &[])?.grads.len() == w0.len());
        Ok(())
    }
}
