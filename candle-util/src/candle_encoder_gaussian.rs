use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// floor added to the variance so that it never collapses
pub const MIN_VARIANCE: f64 = 1e-4;

/// Single-branch Gaussian encoder `x -> N(mean(x), var(x))`
pub struct GaussianEncoder {
    n_features: usize,
    n_latent: usize,
    fc: FcLayers,
    z_mean: Linear,
    z_lnvar: Linear,
}

pub struct GaussianEncoderArgs {
    pub n_features: usize,
    pub n_latent: usize,
    pub n_layers: usize,
    pub n_hidden: usize,
    pub dropout_rate: f32,
}

impl EncoderModuleT for GaussianEncoder {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<GaussianLatent> {
        let h_nl = self.fc.forward_t(x_nd, None, train)?;
        let mean = self.z_mean.forward(&h_nl)?;
        let var = (self.z_lnvar.forward(&h_nl)?.exp()? + MIN_VARIANCE)?;
        let sample = reparameterize_gaussian(&mean, &var)?;
        Ok(GaussianLatent { mean, var, sample })
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl GaussianEncoder {
    /// Will create a new Gaussian encoder with these variables:
    ///
    /// * `enc.fc.{}` and `enc.bn.{}` for the hidden layers
    /// * `z.mean`
    /// * `z.lnvar`
    pub fn new(args: GaussianEncoderArgs, vb: VarBuilder) -> Result<Self> {
        let fc = fc_layers(
            FcLayersArgs {
                n_in: args.n_features,
                n_out: args.n_hidden,
                n_cat: 0,
                n_layers: args.n_layers,
                n_hidden: args.n_hidden,
                dropout_rate: args.dropout_rate,
                use_batch_norm: true,
            },
            vb.pp("enc"),
        )?;

        let z_mean = candle_nn::linear(fc.dim_out(), args.n_latent, vb.pp("z.mean"))?;
        let z_lnvar = candle_nn::linear(fc.dim_out(), args.n_latent, vb.pp("z.lnvar"))?;

        Ok(Self {
            n_features: args.n_features,
            n_latent: args.n_latent,
            fc,
            z_mean,
            z_lnvar,
        })
    }
}
