use crate::candle_encoding::one_hot;
use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Dropout, Linear, Module, ModuleT, VarBuilder};

/// A stack of fully connected layers
///
/// `Linear -> BatchNorm -> ReLU -> Dropout` for each layer. When a
/// categorical covariate with more than one level is registered, its
/// one-hot encoding is concatenated to the input of every layer.
pub struct FcLayers {
    dim_in: usize,
    dim_out: usize,
    n_cat: usize,
    linear: Vec<Linear>,
    batch_norm: Vec<Option<BatchNorm>>,
    dropout: Option<Dropout>,
}

pub struct FcLayersArgs {
    pub n_in: usize,
    pub n_out: usize,
    /// cardinality of the injected covariate (0 or 1 means none)
    pub n_cat: usize,
    pub n_layers: usize,
    pub n_hidden: usize,
    pub dropout_rate: f32,
    pub use_batch_norm: bool,
}

impl FcLayers {
    /// Run through all the layers
    ///
    /// * `x_nd` - input (n x d)
    /// * `cat_n` - covariate level of each row, needed iff `n_cat > 1`
    /// * `train` - whether to use dropout/batchnorm or not
    pub fn forward_t(&self, x_nd: &Tensor, cat_n: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let covar_nc = if self.injects_covariate() {
            match cat_n {
                Some(cat_n) => Some(one_hot(cat_n, self.n_cat, x_nd.dtype())?),
                None => candle_core::bail!(
                    "FcLayers: covariate with {} levels expected but missing",
                    self.n_cat
                ),
            }
        } else {
            None
        };

        let mut h = x_nd.clone();
        for (linear, bn) in self.linear.iter().zip(self.batch_norm.iter()) {
            if let Some(covar_nc) = covar_nc.as_ref() {
                h = Tensor::cat(&[&h, covar_nc], h.rank() - 1)?;
            }
            h = linear.forward(&h)?;
            if let Some(bn) = bn {
                h = bn.forward_t(&h, train)?;
            }
            h = h.relu()?;
            if let Some(dropout) = self.dropout.as_ref() {
                h = dropout.forward_t(&h, train)?;
            }
        }
        Ok(h)
    }

    /// an empty stack passes its input through and needs no covariate
    pub fn injects_covariate(&self) -> bool {
        self.n_cat > 1 && !self.linear.is_empty()
    }

    pub fn num_layers(&self) -> usize {
        self.linear.len()
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    /// output dimension; equals `dim_in` for an empty stack
    pub fn dim_out(&self) -> usize {
        self.dim_out
    }
}

/// Will create variables `fc.{j}` and `bn.{j}` for each layer `j`
pub fn fc_layers(args: FcLayersArgs, vb: VarBuilder) -> Result<FcLayers> {
    let bn_config = candle_nn::BatchNormConfig {
        eps: 1e-3,
        remove_mean: true,
        affine: true,
        momentum: 0.01,
    };

    let covar_dim = if args.n_cat > 1 { args.n_cat } else { 0 };

    let mut dims = vec![args.n_in];
    if args.n_layers > 0 {
        dims.extend(std::iter::repeat_n(args.n_hidden, args.n_layers - 1));
        dims.push(args.n_out);
    }

    let mut linear = Vec::with_capacity(args.n_layers);
    let mut batch_norm = Vec::with_capacity(args.n_layers);

    for (j, w) in dims.windows(2).enumerate() {
        let (d_in, d_out) = (w[0], w[1]);
        linear.push(candle_nn::linear(
            d_in + covar_dim,
            d_out,
            vb.pp(format!("fc.{}", j)),
        )?);
        batch_norm.push(if args.use_batch_norm {
            Some(candle_nn::batch_norm(
                d_out,
                bn_config,
                vb.pp(format!("bn.{}", j)),
            )?)
        } else {
            None
        });
    }

    let dropout = if args.dropout_rate > 0. {
        Some(Dropout::new(args.dropout_rate))
    } else {
        None
    };

    Ok(FcLayers {
        dim_in: args.n_in,
        dim_out: *dims.last().unwrap_or(&args.n_in),
        n_cat: args.n_cat,
        linear,
        batch_norm,
        dropout,
    })
}

///
/// z = mu + sigma * eps
/// where eps ~ N(0, 1)
///
/// # Arguments
/// * `z_mean` - mean of Gaussian distribution
/// * `z_var` - variance of Gaussian distribution
pub fn reparameterize_gaussian(z_mean: &Tensor, z_var: &Tensor) -> Result<Tensor> {
    let eps = Tensor::randn_like(z_mean, 0., 1.)?;
    z_mean + (z_var.sqrt()? * eps)?
}
