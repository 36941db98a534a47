use candle_core::{DType, Device, Result, Tensor};
use candle_util::candle_autodiff::value_and_grad;
use candle_util::candle_aux_layers::Norm;
use candle_util::candle_classifiers::*;
use candle_util::candle_loss_functions::softmax_cross_entropy;
use candle_util::candle_model_traits::ParamGroup;
use candle_util::candle_param_set::ParamSet;

fn args(norm: Norm) -> ClassifierArgs {
    ClassifierArgs {
        n_visits: 5,
        n_codes: 7,
        n_classes: 3,
        n_hidden: 4,
        filter_widths: vec![2, 3],
        norm,
        keep_prob: 1.0,
    }
}

fn toy_batch(n: usize, dev: &Device) -> Result<(Tensor, Tensor)> {
    let x: Vec<f32> = (0..n * 35).map(|i| ((i * 7919 % 13) as f32 - 6.) / 6.).collect();
    let x = Tensor::from_vec(x, (n, 5, 7), dev)?;
    let labels: Vec<u32> = (0..n as u32).map(|i| i % 3).collect();
    let y = candle_nn::encoding::one_hot(Tensor::new(labels.as_slice(), dev)?, 3, 1f32, 0f32)?;
    Ok((x, y))
}

#[test]
fn every_method_maps_visits_to_logits() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let (x, _) = toy_batch(6, &dev)?;

    for method in [Method::Mlp, Method::Cnn, Method::Rnn] {
        for norm in [Norm::None, Norm::BatchNorm, Norm::LayerNorm] {
            let net = build_classifier(method, &args(norm));
            let params = ParamSet::init(&net.param_specs(), 0, &dev)?;
            let logits = net.forward_with(&params.weights(), &x, false)?;
            assert_eq!(logits.dims(), &[6, 3], "{} {}", method, norm);
            assert_eq!(net.name(), method.to_string());
        }
    }
    Ok(())
}

#[test]
fn heads_are_tagged_for_freezing() -> anyhow::Result<()> {
    for method in [Method::Mlp, Method::Cnn, Method::Rnn] {
        let net = build_classifier(method, &args(Norm::None));
        let specs = net.param_specs();
        let heads: Vec<_> = specs
            .iter()
            .filter(|s| s.group == ParamGroup::Head)
            .map(|s| s.name.to_string())
            .collect();
        assert_eq!(heads, vec!["head.weight", "head.bias"]);
    }
    Ok(())
}

#[test]
fn gradients_reach_every_weight() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let (x, y) = toy_batch(6, &dev)?;

    for method in [Method::Mlp, Method::Cnn, Method::Rnn] {
        let net = build_classifier(method, &args(Norm::LayerNorm));
        let params = ParamSet::init(&net.param_specs(), 3, &dev)?;
        let loss_fn = |w: &[Tensor]| softmax_cross_entropy(&net.forward_with(w, &x, false)?, &y);
        let (loss, grads) = value_and_grad(&params.weights(), &loss_fn)?;

        assert!(loss.is_finite() && loss > 0.);
        assert_eq!(grads.len(), params.len());
        for (g, spec) in grads.iter().zip(params.specs()) {
            assert_eq!(g.dims(), spec.shape.as_slice());
            let mass = g.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert!(mass > 0., "{}: no gradient for {}", method, spec.name);
        }
    }
    Ok(())
}

#[test]
fn wrong_weight_lists_are_rejected() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let (x, _) = toy_batch(2, &dev)?;
    let net = build_classifier(Method::Rnn, &args(Norm::None));
    let w = vec![Tensor::zeros(3, DType::F32, &dev)?];
    assert!(net.forward_with(&w, &x, false).is_err());
    Ok(())
}

#[test]
fn checkpoint_round_trip() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("model.safetensors");

    let net = build_classifier(Method::Cnn, &args(Norm::None));
    let a = ParamSet::init(&net.param_specs(), 1, &dev)?;
    a.save(&file)?;

    let mut b = ParamSet::init(&net.param_specs(), 2, &dev)?;
    b.load(&file)?;

    for (wa, wb) in a.weights().iter().zip(b.weights().iter()) {
        let da = wa.flatten_all()?.to_vec1::<f32>()?;
        let db = wb.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(da, db);
    }
    assert_eq!(a.num_elements(), b.num_elements());
    Ok(())
}

#[test]
fn method_names_parse() -> anyhow::Result<()> {
    assert_eq!("rnn".parse::<Method>()?, Method::Rnn);
    assert_eq!("CNN".parse::<Method>()?, Method::Cnn);
    assert!("svm".parse::<Method>().is_err());
    Ok(())
}
