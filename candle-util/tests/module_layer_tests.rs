use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_util::candle_aux_layers::*;
use candle_util::candle_decoder_multihead::*;
use candle_util::candle_encoder_gaussian::*;
use candle_util::candle_encoder_multihead::*;
use candle_util::candle_model_traits::*;

fn counts(n: usize, d: usize, dev: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..n * d).map(|i| ((i * 7) % 5) as f32).collect();
    Tensor::from_vec(data, (n, d), dev)
}

#[test]
fn fc_layers_inject_covariate() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let fc = fc_layers(
        FcLayersArgs {
            n_in: 6,
            n_out: 4,
            n_cat: 3,
            n_layers: 2,
            n_hidden: 8,
            dropout_rate: 0.1,
            use_batch_norm: true,
        },
        vb.pp("fc"),
    )?;

    let x = counts(5, 6, &dev)?;
    let batch = Tensor::new(&[0u32, 1, 2, 1, 0], &dev)?;

    assert!(fc.injects_covariate());
    assert_eq!(fc.num_layers(), 2);
    assert_eq!(fc.forward_t(&x, Some(&batch), true)?.dims(), &[5, 4]);
    assert!(fc.forward_t(&x, None, false).is_err());
    Ok(())
}

#[test]
fn empty_fc_layers_pass_through() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let fc = fc_layers(
        FcLayersArgs {
            n_in: 6,
            n_out: 4,
            n_cat: 3,
            n_layers: 0,
            n_hidden: 8,
            dropout_rate: 0.3,
            use_batch_norm: true,
        },
        vb,
    )?;

    let x = counts(5, 6, &dev)?;
    assert_eq!(fc.dim_out(), 6);
    let y = fc.forward_t(&x, None, true)?;
    assert_eq!(y.to_vec2::<f32>()?, x.to_vec2::<f32>()?);
    Ok(())
}

#[test]
fn gaussian_encoder_positive_variance() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let enc = GaussianEncoder::new(
        GaussianEncoderArgs {
            n_features: 6,
            n_latent: 1,
            n_layers: 1,
            n_hidden: 16,
            dropout_rate: 0.1,
        },
        vb,
    )?;

    let x = (counts(7, 6, &dev)? + 1.)?.log()?;
    let GaussianLatent { mean, var, sample } = enc.forward_t(&x, false)?;
    assert_eq!(mean.dims(), &[7, 1]);
    assert_eq!(sample.dims(), &[7, 1]);
    assert!(var.min_all()?.to_scalar::<f32>()? > 0.);
    Ok(())
}

#[test]
fn multihead_encoder_heads_take_own_width() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let enc = MultiHeadEncoder::new(
        MultiHeadEncoderArgs {
            n_features: &[5, 3],
            n_latent: 4,
            n_hidden: 16,
            n_layers_individual: 1,
            n_layers_shared: 1,
            dropout_rate: 0.1,
            latent_dist: LatentDistribution::Gaussian,
        },
        vb,
    )?;

    assert_eq!(enc.num_heads(), 2);
    assert_eq!(enc.dim_obs(1), Some(3));
    assert_eq!(enc.dim_obs(2), None);

    let z0 = enc.forward_t(&counts(4, 5, &dev)?, 0, true)?;
    let z1 = enc.forward_t(&counts(4, 3, &dev)?, 1, true)?;
    assert_eq!(z0.sample.dims(), &[4, 4]);
    assert_eq!(z1.mean.dims(), &[4, 4]);

    assert!(enc.forward_t(&counts(4, 3, &dev)?, 2, true).is_err());
    assert!(enc.forward_t(&counts(4, 3, &dev)?, 0, true).is_err());
    Ok(())
}

#[test]
fn logistic_normal_samples_on_simplex() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let enc = MultiHeadEncoder::new(
        MultiHeadEncoderArgs {
            n_features: &[5],
            n_latent: 3,
            n_hidden: 8,
            n_layers_individual: 1,
            n_layers_shared: 0,
            dropout_rate: 0.,
            latent_dist: LatentDistribution::LogisticNormal,
        },
        vb,
    )?;

    let z = enc.forward_t(&counts(6, 5, &dev)?, 0, false)?;
    for row in z.sample.sum(1)?.to_vec1::<f32>()? {
        approx::assert_abs_diff_eq!(row, 1.0, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn multihead_decoder_outputs_span_vocabulary() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let dec = MultiHeadDecoder::new(
        MultiHeadDecoderArgs {
            n_heads: 2,
            n_latent: 4,
            n_features: 9,
            n_hidden_conditioned: 8,
            n_hidden_shared: 16,
            n_layers_conditioned: 1,
            n_layers_shared: 1,
            n_batch: 2,
            dropout_rate: 0.2,
        },
        vb,
    )?;

    let z = Tensor::randn(0f32, 1f32, (3, 4), &dev)?;
    let library = Tensor::new(&[[1f32], [2.], [0.5]], &dev)?;
    let batch = Tensor::new(&[0u32, 1, 1], &dev)?;

    let input = || DecoderInput {
        z_nk: &z,
        library_n1: &library,
        batch_n: Some(&batch),
        label_n: None,
    };

    let out = dec.forward_t(input(), 1, DispersionMode::GeneCell, false)?;
    assert_eq!(out.px_scale.dims(), &[3, 9]);
    assert_eq!(out.px_rate.dims(), &[3, 9]);
    assert_eq!(out.px_dropout.dims(), &[3, 9]);
    assert!(out.px_r.is_some());

    for row in out.px_scale.sum(1)?.to_vec1::<f32>()? {
        approx::assert_abs_diff_eq!(row, 1.0, epsilon = 1e-5);
    }

    let out = dec.forward_t(input(), 0, DispersionMode::Gene, false)?;
    assert!(out.px_r.is_none());

    assert!(dec
        .forward_t(input(), 2, DispersionMode::Gene, false)
        .is_err());
    Ok(())
}
