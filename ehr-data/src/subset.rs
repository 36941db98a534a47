use crate::cohort::{Cohort, EhrDims};

use candle_util::candle_core::{Device, Tensor};
use std::sync::Arc;

/// Dense minibatch ready for a forward pass
pub struct LabeledBatch {
    /// visits (n x visits x codes)
    pub x: Tensor,
    /// one-hot targets (n x classes)
    pub y: Tensor,
    pub labels: Vec<usize>,
}

impl LabeledBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A list of samples, possibly drawn from several cohorts, kept as
/// references until `to_batch` densifies them
#[derive(Clone, Default)]
pub struct Subset {
    members: Vec<(Arc<Cohort>, usize)>,
}

impl Subset {
    pub fn new(cohort: &Arc<Cohort>, positions: &[usize]) -> Self {
        Self {
            members: positions.iter().map(|&i| (cohort.clone(), i)).collect(),
        }
    }

    /// Concatenate subsets in order
    pub fn concat(parts: &[Subset]) -> Self {
        Self {
            members: parts.iter().flat_map(|p| p.members.iter().cloned()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn labels(&self) -> Vec<usize> {
        self.members.iter().map(|(c, i)| c.labels[*i]).collect()
    }

    /// `cohort:sample` for every member
    pub fn sample_ids(&self) -> Vec<Box<str>> {
        self.members
            .iter()
            .map(|(c, i)| format!("{}:{}", c.name, c.sample_names[*i]).into_boxed_str())
            .collect()
    }

    /// Split into consecutive pieces of at most `size` members
    pub fn chunks(&self, size: usize) -> Vec<Subset> {
        self.members
            .chunks(size.max(1))
            .map(|c| Subset {
                members: c.to_vec(),
            })
            .collect()
    }

    /// Members at the given positions of this subset
    pub fn select(&self, positions: &[usize]) -> Subset {
        Subset {
            members: positions
                .iter()
                .filter_map(|&j| self.members.get(j).cloned())
                .collect(),
        }
    }

    /// Densify on `device`
    pub fn to_batch(
        &self,
        dims: &EhrDims,
        n_classes: usize,
        device: &Device,
    ) -> anyhow::Result<LabeledBatch> {
        let n = self.len();
        let stride = dims.sample_len();

        let mut x = vec![0f32; n * stride];
        let mut y = vec![0f32; n * n_classes];
        let mut labels = Vec::with_capacity(n);

        for (j, (cohort, i)) in self.members.iter().enumerate() {
            cohort.fill_dense(*i, dims, &mut x[j * stride..(j + 1) * stride]);
            let label = cohort.labels[*i];
            if label >= n_classes {
                return Err(anyhow::anyhow!(
                    "{}: label {} outside [0, {})",
                    cohort.name,
                    label,
                    n_classes
                ));
            }
            y[j * n_classes + label] = 1.;
            labels.push(label);
        }

        Ok(LabeledBatch {
            x: Tensor::from_vec(x, (n, dims.n_visits, dims.n_codes), device)?,
            y: Tensor::from_vec(y, (n, n_classes), device)?,
            labels,
        })
    }
}
