use crate::candle_model_traits::{ParamGroup, ParamInit, ParamSpec};

use anyhow::anyhow;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use std::path::Path;

/// Named weights shared across tasks.
///
/// The variables live in a `VarMap` so optimizers and checkpoints
/// work the usual candle way; `weights()` hands out the variable
/// tensors in `ParamSpec` order for functional forward passes.
pub struct ParamSet {
    specs: Vec<ParamSpec>,
    vars: Vec<Var>,
    varmap: VarMap,
    device: Device,
}

impl ParamSet {
    /// Allocate and fill every parameter with a seeded initializer
    pub fn init(specs: &[ParamSpec], seed: u64, device: &Device) -> anyhow::Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let values = specs
            .iter()
            .map(|s| sample_init(s, &mut rng, device))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let ret = Self::from_values(specs, &values, device)?;
        debug!(
            "initialized {} tensors, {} values (seed {})",
            ret.len(),
            ret.num_elements(),
            seed
        );
        Ok(ret)
    }

    /// Build a new set holding copies of `values`
    pub fn from_values(
        specs: &[ParamSpec],
        values: &[Tensor],
        device: &Device,
    ) -> anyhow::Result<Self> {
        if specs.len() != values.len() {
            return Err(anyhow!(
                "{} parameter specs vs. {} values",
                specs.len(),
                values.len()
            ));
        }

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        for (spec, value) in specs.iter().zip(values) {
            if value.dims() != spec.shape.as_slice() {
                return Err(anyhow!(
                    "{}: expected shape {:?}, got {:?}",
                    spec.name,
                    spec.shape,
                    value.dims()
                ));
            }
            vb.get_with_hints(spec.shape.clone(), &spec.name, candle_nn::init::ZERO)?;
            varmap.set_one(&*spec.name, &value.to_device(device)?)?;
        }

        let vars = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| anyhow!("variable map lock poisoned"))?;
            specs
                .iter()
                .map(|s| {
                    data.get(&*s.name)
                        .cloned()
                        .ok_or_else(|| anyhow!("missing variable {}", s.name))
                })
                .collect::<anyhow::Result<Vec<_>>>()?
        };

        Ok(Self {
            specs: specs.to_vec(),
            vars,
            varmap,
            device: device.clone(),
        })
    }

    /// Independent copy with its own variables
    pub fn duplicate(&self) -> anyhow::Result<Self> {
        Self::from_values(&self.specs, &self.snapshot()?, &self.device)
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn num_elements(&self) -> usize {
        self.specs.iter().map(|s| s.numel()).sum()
    }

    /// Live variable tensors; gradients taken against these update
    /// the shared parameters
    pub fn weights(&self) -> Vec<Tensor> {
        self.vars.iter().map(|v| v.as_tensor().clone()).collect()
    }

    /// Deep copies of the current values, unaffected by later updates
    pub fn snapshot(&self) -> anyhow::Result<Vec<Tensor>> {
        Ok(self
            .vars
            .iter()
            .map(|v| v.as_tensor().detach().copy())
            .collect::<candle_core::Result<Vec<_>>>()?)
    }

    /// Overwrite the current values in place
    pub fn assign(&self, values: &[Tensor]) -> anyhow::Result<()> {
        if values.len() != self.vars.len() {
            return Err(anyhow!(
                "cannot assign {} tensors to {} variables",
                values.len(),
                self.vars.len()
            ));
        }
        for (var, value) in self.vars.iter().zip(values) {
            var.set(value)?;
        }
        Ok(())
    }

    /// Variables an optimizer may update; `frozen` groups are left out
    pub fn trainable_vars(&self, frozen: &[ParamGroup]) -> Vec<Var> {
        self.specs
            .iter()
            .zip(self.vars.iter())
            .filter(|(s, _)| !frozen.contains(&s.group))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.vars.clone()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        self.varmap.save(path.as_ref())?;
        debug!("wrote {} tensors to {}", self.len(), path.as_ref().display());
        Ok(())
    }

    /// Load values of the same names from a safetensors file
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }
}

fn sample_init(spec: &ParamSpec, rng: &mut StdRng, device: &Device) -> anyhow::Result<Tensor> {
    let n = spec.numel();
    let values: Vec<f32> = match spec.init {
        ParamInit::Zeros => vec![0f32; n],
        ParamInit::Glorot { fan_in, fan_out } => {
            let a = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
            let unif = Uniform::new(-a, a).map_err(|e| anyhow!("{}: {}", spec.name, e))?;
            (0..n).map(|_| unif.sample(rng)).collect()
        }
        ParamInit::ForgetGateBias { hidden } => (0..n)
            .map(|i| if i >= hidden && i < 2 * hidden { 1. } else { 0. })
            .collect(),
    };
    Ok(Tensor::from_vec(values, spec.shape.clone(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ParamSpec> {
        vec![
            ParamSpec::weight("w", &[3, 2], (3, 2), ParamGroup::Encoder),
            ParamSpec::bias("b", 2, ParamGroup::Head),
        ]
    }

    #[test]
    fn same_seed_same_values() -> anyhow::Result<()> {
        let a = ParamSet::init(&specs(), 7, &Device::Cpu)?;
        let b = ParamSet::init(&specs(), 7, &Device::Cpu)?;
        assert_eq!(
            a.weights()[0].to_vec2::<f32>()?,
            b.weights()[0].to_vec2::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn snapshot_is_detached_from_updates() -> anyhow::Result<()> {
        let p = ParamSet::init(&specs(), 1, &Device::Cpu)?;
        let before = p.snapshot()?;
        let ones = vec![
            Tensor::ones((3, 2), DType::F32, &Device::Cpu)?,
            Tensor::ones(2, DType::F32, &Device::Cpu)?,
        ];
        p.assign(&ones)?;
        assert_ne!(before[0].to_vec2::<f32>()?, p.weights()[0].to_vec2::<f32>()?);
        assert_eq!(p.weights()[1].to_vec1::<f32>()?, vec![1., 1.]);
        Ok(())
    }

    #[test]
    fn frozen_groups_are_skipped() -> anyhow::Result<()> {
        let p = ParamSet::init(&specs(), 1, &Device::Cpu)?;
        assert_eq!(p.trainable_vars(&[ParamGroup::Encoder]).len(), 1);
        assert_eq!(p.trainable_vars(&[]).len(), 2);
        Ok(())
    }
}
