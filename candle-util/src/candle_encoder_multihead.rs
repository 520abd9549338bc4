use crate::candle_aux_layers::*;
use crate::candle_encoder_gaussian::MIN_VARIANCE;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, Module, VarBuilder};

/// Distribution family of the sampled latent states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LatentDistribution {
    /// `z ~ N(mean, var)`
    #[default]
    Gaussian,
    /// `z = softmax(u)` with `u ~ N(mean, var)`
    LogisticNormal,
}

/// Encoder with one input branch per dataset feeding a shared trunk
///
/// ```text
/// x[head] -> fc_individual[head] -> fc_shared -> (mean, lnvar)
/// ```
pub struct MultiHeadEncoder {
    n_features: Vec<usize>,
    n_latent: usize,
    latent_dist: LatentDistribution,
    fc_individual: Vec<FcLayers>,
    fc_shared: FcLayers,
    z_mean: Linear,
    z_lnvar: Linear,
}

pub struct MultiHeadEncoderArgs<'a> {
    /// input dimension of each head
    pub n_features: &'a [usize],
    pub n_latent: usize,
    pub n_hidden: usize,
    pub n_layers_individual: usize,
    pub n_layers_shared: usize,
    pub dropout_rate: f32,
    pub latent_dist: LatentDistribution,
}

impl MultiHeadEncoderModuleT for MultiHeadEncoder {
    fn forward_t(&self, x_nd: &Tensor, head: usize, train: bool) -> Result<GaussianLatent> {
        let Some(fc_head) = self.fc_individual.get(head) else {
            candle_core::bail!(
                "MultiHeadEncoder: head {} out of {} heads",
                head,
                self.num_heads()
            );
        };

        let h_nl = fc_head.forward_t(x_nd, None, train)?;
        let h_nl = self.fc_shared.forward_t(&h_nl, None, train)?;

        let mean = self.z_mean.forward(&h_nl)?;
        let var = (self.z_lnvar.forward(&h_nl)?.exp()? + MIN_VARIANCE)?;
        let untransformed = reparameterize_gaussian(&mean, &var)?;

        let sample = match self.latent_dist {
            LatentDistribution::Gaussian => untransformed,
            LatentDistribution::LogisticNormal => ops::softmax_last_dim(&untransformed)?,
        };

        Ok(GaussianLatent { mean, var, sample })
    }

    fn num_heads(&self) -> usize {
        self.n_features.len()
    }

    fn dim_obs(&self, head: usize) -> Option<usize> {
        self.n_features.get(head).copied()
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl MultiHeadEncoder {
    /// Will create a new multi-head encoder with these variables:
    ///
    /// * `enc.head_{h}.fc.{}` for the individual layers of each head `h`
    /// * `enc.shared.fc.{}` for the shared layers
    /// * `z.mean`
    /// * `z.lnvar`
    ///
    /// Each individual branch maps `n_features[h] -> n_hidden`; the
    /// shared trunk maps `n_hidden -> n_hidden`.
    pub fn new(args: MultiHeadEncoderArgs, vb: VarBuilder) -> Result<Self> {
        let fc_individual = args
            .n_features
            .iter()
            .enumerate()
            .map(|(h, &d)| {
                fc_layers(
                    FcLayersArgs {
                        n_in: d,
                        n_out: args.n_hidden,
                        n_cat: 0,
                        n_layers: args.n_layers_individual.max(1),
                        n_hidden: args.n_hidden,
                        dropout_rate: args.dropout_rate,
                        use_batch_norm: true,
                    },
                    vb.pp(format!("enc.head_{}", h)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let fc_shared = fc_layers(
            FcLayersArgs {
                n_in: args.n_hidden,
                n_out: args.n_hidden,
                n_cat: 0,
                n_layers: args.n_layers_shared,
                n_hidden: args.n_hidden,
                dropout_rate: args.dropout_rate,
                use_batch_norm: true,
            },
            vb.pp("enc.shared"),
        )?;

        let z_mean = candle_nn::linear(fc_shared.dim_out(), args.n_latent, vb.pp("z.mean"))?;
        let z_lnvar = candle_nn::linear(fc_shared.dim_out(), args.n_latent, vb.pp("z.lnvar"))?;

        Ok(Self {
            n_features: args.n_features.to_vec(),
            n_latent: args.n_latent,
            latent_dist: args.latent_dist,
            fc_individual,
            fc_shared,
            z_mean,
            z_lnvar,
        })
    }
}
