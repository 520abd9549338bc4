//! Joint variational autoencoder over datasets with different gene panels.
//!
//! Every dataset owns an encoder branch (head) and a decoder tail; all of
//! them share one latent space and one generative backbone whose output
//! spans the union of the gene panels. Reconstruction of a dataset only
//! looks at the genes it measured, via its [`IndexMapping`].

use crate::config::JointVaeConfig;
use crate::dataset::*;
use crate::dispersion::DispersionParam;
use crate::error::{JvaeError, Result};

use candle_core::Tensor;
use candle_nn::VarBuilder;
use candle_util::candle_decoder_multihead::*;
use candle_util::candle_encoder_gaussian::*;
use candle_util::candle_encoder_multihead::*;
use candle_util::candle_loss_functions::*;
use candle_util::candle_model_traits::*;
use log::debug;

/// Posterior of the log library size
pub enum LibraryPosterior {
    /// inferred by the dataset's library encoder
    Modeled(GaussianLatent),
    /// fixed to `log(sum_g x[g])`, no posterior parameters
    Observed { log_total_n1: Tensor },
}

impl LibraryPosterior {
    /// sampled (or observed) log library size (n x 1)
    pub fn library(&self) -> &Tensor {
        match self {
            Self::Modeled(q) => &q.sample,
            Self::Observed { log_total_n1 } => log_total_n1,
        }
    }

    /// posterior mean when modeled, observed value otherwise
    pub fn point_estimate(&self) -> &Tensor {
        match self {
            Self::Modeled(q) => &q.mean,
            Self::Observed { log_total_n1 } => log_total_n1,
        }
    }

    pub fn mean(&self) -> Option<&Tensor> {
        match self {
            Self::Modeled(q) => Some(&q.mean),
            Self::Observed { .. } => None,
        }
    }

    pub fn var(&self) -> Option<&Tensor> {
        match self {
            Self::Modeled(q) => Some(&q.var),
            Self::Observed { .. } => None,
        }
    }

    pub fn is_modeled(&self) -> bool {
        matches!(self, Self::Modeled(_))
    }
}

/// Output of [`JointVae::encode`]
pub struct JointLatent {
    /// posterior mean of z (n x k)
    pub qz_m: Tensor,
    /// posterior variance of z (n x k)
    pub qz_v: Tensor,
    /// sampled z (n x k)
    pub z: Tensor,
    pub library: LibraryPosterior,
}

impl JointLatent {
    pub fn ql_m(&self) -> Option<&Tensor> {
        self.library.mean()
    }

    pub fn ql_v(&self) -> Option<&Tensor> {
        self.library.var()
    }
}

/// Output of [`JointVae::decode`]; all (n x total_genes)
pub struct JointDecoded {
    /// frequencies renormalized over the decoding dataset's genes
    pub px_scale: Tensor,
    /// positive dispersion
    pub px_r: Tensor,
    /// `px_scale * exp(library)`
    pub px_rate: Tensor,
    /// dropout logits
    pub px_dropout: Tensor,
}

pub struct InferenceOutput {
    pub latent: JointLatent,
    pub decoded: JointDecoded,
}

/// Observed data and library prior of a minibatch from one dataset
pub struct ForwardInput<'a> {
    /// raw counts (n x d[mode])
    pub x_nd: &'a Tensor,
    /// prior mean of the log library size (n x 1)
    pub local_l_mean_n1: &'a Tensor,
    /// prior variance of the log library size (n x 1)
    pub local_l_var_n1: &'a Tensor,
    /// batch membership (n)
    pub batch_n: Option<&'a Tensor>,
    /// cell-type labels (n)
    pub label_n: Option<&'a Tensor>,
}

pub struct JointVae {
    datasets: Vec<DatasetSpec>,
    mapping_tensors: Vec<Tensor>,
    total_genes: usize,
    n_latent: usize,
    n_batch: usize,
    n_labels: usize,
    decoder_needs_batch: bool,
    log_variational: bool,
    z_encoder: MultiHeadEncoder,
    l_encoders: Vec<Option<GaussianEncoder>>,
    decoder: MultiHeadDecoder,
    dispersion: DispersionParam,
}

impl JointVae {
    /// Will create a joint model with these variables:
    ///
    /// * `z_encoder.*` one input branch per dataset and a shared trunk
    /// * `l_encoder_{i}.*` for each dataset `i` that models library size
    /// * `decoder.*` one tail per dataset and a shared backbone
    /// * `px.ln_r` log-dispersion, unless the dispersion is per cell
    pub fn new(config: JointVaeConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let n_input_list = config.dim_input_list();

        let z_encoder = MultiHeadEncoder::new(
            MultiHeadEncoderArgs {
                n_features: &n_input_list,
                n_latent: config.n_latent,
                n_hidden: config.dim_hidden_encoder,
                n_layers_individual: config.n_layers_encoder_individual,
                n_layers_shared: config.n_layers_encoder_shared,
                dropout_rate: config.dropout_rate_encoder,
                latent_dist: config.latent_dist,
            },
            vb.pp("z_encoder"),
        )?;

        let l_encoders = config
            .datasets
            .iter()
            .enumerate()
            .map(|(i, d)| -> Result<Option<GaussianEncoder>> {
                if !d.model_library {
                    return Ok(None);
                }
                let enc = GaussianEncoder::new(
                    GaussianEncoderArgs {
                        n_features: d.dim_input,
                        n_latent: 1,
                        n_layers: 1,
                        n_hidden: config.dim_hidden_encoder,
                        dropout_rate: config.dropout_rate_encoder,
                    },
                    vb.pp(format!("l_encoder_{}", i)),
                )?;
                Ok(Some(enc))
            })
            .collect::<Result<Vec<_>>>()?;

        let decoder = MultiHeadDecoder::new(
            MultiHeadDecoderArgs {
                n_heads: config.num_datasets(),
                n_latent: config.n_latent,
                n_features: config.total_genes,
                n_hidden_conditioned: config.dim_hidden_decoder_individual,
                n_hidden_shared: config.dim_hidden_decoder_shared,
                n_layers_conditioned: config.n_layers_decoder_individual,
                n_layers_shared: config.n_layers_decoder_shared,
                n_batch: config.n_batch,
                dropout_rate: config.dropout_rate_decoder,
            },
            vb.pp("decoder"),
        )?;

        let dispersion = DispersionParam::new(
            config.dispersion,
            config.total_genes,
            config.n_batch,
            config.n_labels,
            vb.clone(),
        )?;

        let mapping_tensors = config
            .datasets
            .iter()
            .map(|d| d.index_mapping.to_tensor(vb.device()))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "joint VAE: {} datasets {:?} -> {} genes, {} latent, {:?} dispersion",
            config.num_datasets(),
            n_input_list,
            config.total_genes,
            config.n_latent,
            config.dispersion
        );

        Ok(Self {
            datasets: config.datasets,
            mapping_tensors,
            total_genes: config.total_genes,
            n_latent: config.n_latent,
            n_batch: config.n_batch,
            n_labels: config.n_labels,
            decoder_needs_batch: config.n_batch > 1 && config.n_layers_decoder_individual > 0,
            log_variational: config.log_variational,
            z_encoder,
            l_encoders,
            decoder,
            dispersion,
        })
    }

    ///////////////////////
    // dataset registry  //
    ///////////////////////

    pub fn num_datasets(&self) -> usize {
        self.datasets.len()
    }

    pub fn dataset_ids(&self) -> impl Iterator<Item = DatasetId> {
        (0..self.datasets.len()).map(DatasetId::new)
    }

    /// Validated identifier of the `index`-th registered dataset
    pub fn dataset_id(&self, index: usize) -> Result<DatasetId> {
        if index < self.datasets.len() {
            Ok(DatasetId::new(index))
        } else {
            Err(JvaeError::config(format!(
                "dataset #{} requested but only {} registered",
                index,
                self.datasets.len()
            )))
        }
    }

    /// An omitted mode means dataset #0, only when it is the sole dataset
    pub fn resolve_mode(&self, mode: Option<DatasetId>) -> Result<DatasetId> {
        match mode {
            Some(id) => {
                self.dataset(id)?;
                Ok(id)
            }
            None if self.datasets.len() == 1 => Ok(DatasetId::new(0)),
            None => Err(JvaeError::config(format!(
                "must provide a mode with {} datasets",
                self.datasets.len()
            ))),
        }
    }

    pub fn dataset(&self, mode: DatasetId) -> Result<&DatasetSpec> {
        self.datasets
            .get(mode.index())
            .ok_or_else(|| JvaeError::config(format!("{} is not registered", mode)))
    }

    pub fn total_genes(&self) -> usize {
        self.total_genes
    }

    pub fn n_latent(&self) -> usize {
        self.n_latent
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn n_labels(&self) -> usize {
        self.n_labels
    }

    pub fn dispersion(&self) -> &DispersionParam {
        &self.dispersion
    }

    fn mapping_tensor(&self, mode: DatasetId) -> Result<&Tensor> {
        self.mapping_tensors
            .get(mode.index())
            .ok_or_else(|| JvaeError::config(format!("{} is not registered", mode)))
    }

    /// Take the columns of a (n x total_genes) tensor that `mode` observes
    pub fn gather_observed(&self, x_nd: &Tensor, mode: DatasetId) -> Result<Tensor> {
        Ok(x_nd.index_select(self.mapping_tensor(mode)?, 1)?)
    }

    //////////////////////////
    // encoder and decoder  //
    //////////////////////////

    /// Infer the latent states and the log library size of `x_nd`
    ///
    /// * `x_nd` - raw counts (n x d[mode])
    /// * `mode` - which dataset `x_nd` comes from
    /// * `train` - whether to use dropout/batchnorm or not
    pub fn encode(&self, x_nd: &Tensor, mode: DatasetId, train: bool) -> Result<JointLatent> {
        let spec = self.dataset(mode)?;
        let (_, d) = x_nd.dims2()?;
        if d != spec.dim_input {
            return Err(JvaeError::config(format!(
                "{} expects {} genes but the input has {}",
                mode, spec.dim_input, d
            )));
        }

        let x_enc = if self.log_variational {
            (x_nd + 1.)?.log()?
        } else {
            x_nd.clone()
        };

        let GaussianLatent {
            mean: qz_m,
            var: qz_v,
            sample: z,
        } = self.z_encoder.forward_t(&x_enc, mode.index(), train)?;

        let library = match self.l_encoders.get(mode.index()).and_then(|l| l.as_ref()) {
            Some(l_encoder) => LibraryPosterior::Modeled(l_encoder.forward_t(&x_enc, train)?),
            None => LibraryPosterior::Observed {
                log_total_n1: x_nd.sum_keepdim(1)?.log()?.detach(),
            },
        };

        Ok(JointLatent {
            qz_m,
            qz_v,
            z,
            library,
        })
    }

    /// Generate the count distribution parameters over all genes
    ///
    /// `px_scale` is renormalized so that it sums to one over the genes
    /// `mode` observes; `px_rate` follows from the renormalized scale.
    ///
    /// * `z_nk` - latent states
    /// * `mode` - which decoder tail (and gene panel) to use
    /// * `library_n1` - log library size
    /// * `batch_n` - batch membership, if the model uses batches
    /// * `label_n` - labels, if the dispersion depends on them
    /// * `train` - whether to use dropout/batchnorm or not
    pub fn decode(
        &self,
        z_nk: &Tensor,
        mode: DatasetId,
        library_n1: &Tensor,
        batch_n: Option<&Tensor>,
        label_n: Option<&Tensor>,
        train: bool,
    ) -> Result<JointDecoded> {
        if self.decoder_needs_batch && batch_n.is_none() {
            return Err(JvaeError::config(format!(
                "decoder tails are conditioned on {} batches but no batch index was given",
                self.n_batch
            )));
        }

        let raw = self.decoder.forward_t(
            DecoderInput {
                z_nk,
                library_n1,
                batch_n,
                label_n,
            },
            mode.index(),
            self.dispersion.mode(),
            train,
        )?;

        let n_cells = z_nk.dim(0)?;
        let px_r = self.dispersion.resolve(raw.px_r, batch_n, label_n, n_cells)?;

        let observed_total_n1 = self.gather_observed(&raw.px_scale, mode)?.sum_keepdim(1)?;
        let px_scale = raw.px_scale.broadcast_div(&observed_total_n1)?;
        let px_rate = px_scale.broadcast_mul(&library_n1.exp()?)?;

        Ok(JointDecoded {
            px_scale,
            px_r,
            px_rate,
            px_dropout: raw.px_dropout,
        })
    }

    /// Encode with `mode` and decode with `decode_mode`
    ///
    /// With `deterministic`, the posterior means replace the sampled z
    /// and (when modeled) the sampled library size.
    pub fn inference(
        &self,
        x_nd: &Tensor,
        mode: DatasetId,
        decode_mode: DatasetId,
        covariates: (Option<&Tensor>, Option<&Tensor>),
        deterministic: bool,
        train: bool,
    ) -> Result<InferenceOutput> {
        let (batch_n, label_n) = covariates;
        let latent = self.encode(x_nd, mode, train)?;

        let (z_nk, library_n1) = if deterministic {
            (&latent.qz_m, latent.library.point_estimate())
        } else {
            (&latent.z, latent.library.library())
        };

        let decoded = self.decode(z_nk, decode_mode, library_n1, batch_n, label_n, train)?;
        Ok(InferenceOutput { latent, decoded })
    }

    //////////////////////
    // loss computation //
    //////////////////////

    /// Negative log-likelihood of each cell under `mode`'s count model
    ///
    /// All inputs are already restricted to `mode`'s observed genes.
    pub fn reconstruction_loss(
        &self,
        x_nd: &Tensor,
        px_rate_nd: &Tensor,
        px_r_nd: &Tensor,
        px_dropout_nd: &Tensor,
        mode: DatasetId,
    ) -> Result<Tensor> {
        let llik = match self.dataset(mode)?.reconstruction_loss {
            ReconstructionLoss::Zinb => {
                log_zinb_positive(x_nd, px_rate_nd, px_r_nd, px_dropout_nd)?
            }
            ReconstructionLoss::Nb => log_nb_positive(x_nd, px_rate_nd, px_r_nd)?,
            ReconstructionLoss::Poisson => poisson_log_prob(x_nd, px_rate_nd)?,
        };
        Ok(llik.neg()?)
    }

    /// Per-cell reconstruction loss and KL divergence
    ///
    /// # Returns `(recon_n, kl_n)`
    /// * `recon_n` - negative log-likelihood over the observed genes
    /// * `kl_n` - KL of z against N(0, I) plus KL of the library size
    ///   against `N(local_l_mean, local_l_var)` (zero when not modeled)
    ///
    /// Aggregation and weighting of the two terms is up to the caller.
    pub fn forward_t(
        &self,
        input: ForwardInput,
        mode: Option<DatasetId>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let mode = self.resolve_mode(mode)?;

        let out = self.inference(
            input.x_nd,
            mode,
            mode,
            (input.batch_n, input.label_n),
            false,
            train,
        )?;

        self.loss_terms(&input, mode, &out)
    }

    /// Reconstruction loss and KL divergence of an inference pass that
    /// encoded and decoded `input.x_nd` with `mode`
    ///
    /// The likelihood is evaluated on the raw counts, never on the
    /// log-transformed encoder input.
    pub fn loss_terms(
        &self,
        input: &ForwardInput,
        mode: DatasetId,
        out: &InferenceOutput,
    ) -> Result<(Tensor, Tensor)> {
        let InferenceOutput { latent, decoded } = out;

        // mask loss to observed genes
        let recon_n = self.reconstruction_loss(
            input.x_nd,
            &self.gather_observed(&decoded.px_rate, mode)?,
            &self.gather_observed(&decoded.px_r, mode)?,
            &self.gather_observed(&decoded.px_dropout, mode)?,
            mode,
        )?;

        let kl_z_n = gaussian_kl_loss(&latent.qz_m, &latent.qz_v.log()?)?;

        let kl_l_n = match &latent.library {
            LibraryPosterior::Modeled(ql) => normal_kl_divergence(
                &ql.mean,
                &ql.var,
                input.local_l_mean_n1,
                input.local_l_var_n1,
            )?,
            LibraryPosterior::Observed { .. } => kl_z_n.zeros_like()?,
        };

        Ok((recon_n, (kl_z_n + kl_l_n)?))
    }

    ////////////////////////
    // posterior sampling //
    ////////////////////////

    /// Latent states of `x_nd`, the posterior mean if `deterministic`
    pub fn sample_from_posterior_z(
        &self,
        x_nd: &Tensor,
        mode: Option<DatasetId>,
        deterministic: bool,
    ) -> Result<Tensor> {
        let mode = self.resolve_mode(mode)?;
        let latent = self.encode(x_nd, mode, false)?;
        Ok(if deterministic { latent.qz_m } else { latent.z })
    }

    /// Log library size of `x_nd`
    ///
    /// `deterministic` takes the posterior mean; it has no effect on a
    /// dataset whose library size is observed.
    pub fn sample_from_posterior_l(
        &self,
        x_nd: &Tensor,
        mode: Option<DatasetId>,
        deterministic: bool,
    ) -> Result<Tensor> {
        let mode = self.resolve_mode(mode)?;
        let latent = self.encode(x_nd, mode, false)?;
        Ok(if deterministic {
            latent.library.point_estimate().clone()
        } else {
            latent.library.library().clone()
        })
    }

    /// Predicted expression frequencies over all genes
    ///
    /// * `x_nd` - counts of the dataset `mode`
    /// * `mode` - encoder branch
    /// * `batch_n`, `label_n` - covariates
    /// * `deterministic` - use posterior means
    /// * `decode_mode` - decoder tail, `mode` if omitted; another
    ///   dataset's tail predicts what that dataset would measure
    pub fn sample_scale(
        &self,
        x_nd: &Tensor,
        mode: DatasetId,
        batch_n: Option<&Tensor>,
        label_n: Option<&Tensor>,
        deterministic: bool,
        decode_mode: Option<DatasetId>,
    ) -> Result<Tensor> {
        let decode_mode = decode_mode.unwrap_or(mode);
        let out = self.inference(
            x_nd,
            mode,
            decode_mode,
            (batch_n, label_n),
            deterministic,
            false,
        )?;
        Ok(out.decoded.px_scale)
    }

    /// Predicted expression rates (scale times library size) over all
    /// genes; arguments as in [`Self::sample_scale`]
    pub fn sample_rate(
        &self,
        x_nd: &Tensor,
        mode: DatasetId,
        batch_n: Option<&Tensor>,
        label_n: Option<&Tensor>,
        deterministic: bool,
        decode_mode: Option<DatasetId>,
    ) -> Result<Tensor> {
        let decode_mode = decode_mode.unwrap_or(mode);
        let out = self.inference(
            x_nd,
            mode,
            decode_mode,
            (batch_n, label_n),
            deterministic,
            false,
        )?;
        Ok(out.decoded.px_rate)
    }

    /// Rates of the first dataset, as a single-dataset model would report
    pub fn get_sample_rate(&self, x_nd: &Tensor, batch_n: Option<&Tensor>) -> Result<Tensor> {
        self.sample_rate(x_nd, DatasetId::new(0), batch_n, None, false, None)
    }
}
