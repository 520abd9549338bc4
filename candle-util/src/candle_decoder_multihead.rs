use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use candle_core::Result;
use candle_nn::{ops, Linear, Module, VarBuilder};

//////////////////////////////////
// Multi-head (tail) NB decoder //
//////////////////////////////////

/// Decoder with one conditioned tail per dataset and a shared trunk
///
/// ```text
/// z -> fc_conditioned[head](z, batch) -> fc_shared -> scale, r, dropout
/// ```
///
/// All outputs span the full shared gene vocabulary.
pub struct MultiHeadDecoder {
    n_features: usize,
    n_latent: usize,
    fc_conditioned: Vec<FcLayers>,
    fc_shared: FcLayers,
    px_scale: Linear,
    px_r: Linear,
    px_dropout: Linear,
}

pub struct MultiHeadDecoderArgs {
    pub n_heads: usize,
    pub n_latent: usize,
    /// size of the shared gene vocabulary
    pub n_features: usize,
    pub n_hidden_conditioned: usize,
    pub n_hidden_shared: usize,
    pub n_layers_conditioned: usize,
    pub n_layers_shared: usize,
    /// number of batches injected into the conditioned layers
    pub n_batch: usize,
    pub dropout_rate: f32,
}

impl MultiHeadDecoderModuleT for MultiHeadDecoder {
    fn forward_t(
        &self,
        input: DecoderInput,
        head: usize,
        dispersion: DispersionMode,
        train: bool,
    ) -> Result<DecoderOutput> {
        let Some(fc_head) = self.fc_conditioned.get(head) else {
            candle_core::bail!(
                "MultiHeadDecoder: head {} out of {} heads",
                head,
                self.num_heads()
            );
        };

        let h_nl = fc_head.forward_t(input.z_nk, input.batch_n, train)?;
        let h_nl = self.fc_shared.forward_t(&h_nl, None, train)?;

        let px_scale = ops::softmax_last_dim(&self.px_scale.forward(&h_nl)?)?;
        let px_dropout = self.px_dropout.forward(&h_nl)?;
        let px_rate = input.library_n1.exp()?.broadcast_mul(&px_scale)?;

        let px_r = match dispersion {
            DispersionMode::GeneCell => Some(self.px_r.forward(&h_nl)?),
            _ => None,
        };

        Ok(DecoderOutput {
            px_scale,
            px_r,
            px_rate,
            px_dropout,
        })
    }

    fn num_heads(&self) -> usize {
        self.fc_conditioned.len()
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl MultiHeadDecoder {
    /// Will create a new decoder with the following parameters:
    /// * `dec.tail_{h}.fc.{}` conditioned layers of each tail `h`
    /// * `dec.shared.fc.{}` shared layers
    /// * `px.scale`, `px.r`, `px.dropout` output projections
    pub fn new(args: MultiHeadDecoderArgs, vb: VarBuilder) -> Result<Self> {
        let dim_conditioned = if args.n_layers_shared > 0 {
            args.n_hidden_conditioned
        } else {
            args.n_hidden_shared
        };

        let fc_conditioned = (0..args.n_heads)
            .map(|h| {
                fc_layers(
                    FcLayersArgs {
                        n_in: args.n_latent,
                        n_out: dim_conditioned,
                        n_cat: args.n_batch,
                        n_layers: args.n_layers_conditioned,
                        n_hidden: args.n_hidden_conditioned,
                        dropout_rate: args.dropout_rate,
                        use_batch_norm: true,
                    },
                    vb.pp(format!("dec.tail_{}", h)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let n_in = fc_conditioned
            .first()
            .map(|fc| fc.dim_out())
            .unwrap_or(args.n_latent);

        let fc_shared = fc_layers(
            FcLayersArgs {
                n_in,
                n_out: args.n_hidden_shared,
                n_cat: 0,
                n_layers: args.n_layers_shared,
                n_hidden: args.n_hidden_shared,
                dropout_rate: args.dropout_rate,
                use_batch_norm: true,
            },
            vb.pp("dec.shared"),
        )?;

        let n_in = fc_shared.dim_out();
        let px_scale = candle_nn::linear(n_in, args.n_features, vb.pp("px.scale"))?;
        let px_r = candle_nn::linear(n_in, args.n_features, vb.pp("px.r"))?;
        let px_dropout = candle_nn::linear(n_in, args.n_features, vb.pp("px.dropout"))?;

        Ok(Self {
            n_features: args.n_features,
            n_latent: args.n_latent,
            fc_conditioned,
            fc_shared,
            px_scale,
            px_r,
            px_dropout,
        })
    }
}
