use candle_core::{Result, Tensor};

/// Diagonal Gaussian posterior produced by an encoder
pub struct GaussianLatent {
    /// posterior mean (n x k)
    pub mean: Tensor,
    /// posterior variance (n x k), strictly positive
    pub var: Tensor,
    /// reparameterized sample (n x k)
    pub sample: Tensor,
}

/// How the negative binomial dispersion is parameterized
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispersionMode {
    /// one value per gene
    Gene,
    /// one value per gene and batch
    GeneBatch,
    /// one value per gene and label
    GeneLabel,
    /// one value per gene and cell, produced by the decoder
    GeneCell,
}

/// Raw decoder output over the full shared gene vocabulary
pub struct DecoderOutput {
    /// expression frequencies (n x D), softmax over all D genes
    pub px_scale: Tensor,
    /// per-cell log-dispersion (n x D), only for `DispersionMode::GeneCell`
    pub px_r: Option<Tensor>,
    /// `exp(library) * px_scale` (n x D)
    pub px_rate: Tensor,
    /// dropout logits (n x D)
    pub px_dropout: Tensor,
}

pub trait EncoderModuleT {
    /// An encoder that spits out a Gaussian posterior
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `train` - whether to use dropout/batchnorm or not
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<GaussianLatent>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait MultiHeadEncoderModuleT {
    /// Encode with the input branch `head`
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d[head])
    /// * `head` - which input branch to use
    /// * `train` - whether to use dropout/batchnorm or not
    fn forward_t(&self, x_nd: &Tensor, head: usize, train: bool) -> Result<GaussianLatent>;

    fn num_heads(&self) -> usize;

    fn dim_obs(&self, head: usize) -> Option<usize>;

    fn dim_latent(&self) -> usize;
}

/// Inputs shared by all decoder tails
pub struct DecoderInput<'a> {
    /// latent states (n x k)
    pub z_nk: &'a Tensor,
    /// log library size (n x 1)
    pub library_n1: &'a Tensor,
    /// batch membership (n), integer valued
    pub batch_n: Option<&'a Tensor>,
    /// cell-type labels (n), integer valued
    pub label_n: Option<&'a Tensor>,
}

pub trait MultiHeadDecoderModuleT {
    /// Decode through the tail `head`
    ///
    /// # Arguments
    /// * `input` - latent states, library and covariates
    /// * `head` - which decoder tail to use
    /// * `dispersion` - whether a per-cell dispersion is needed
    /// * `train` - whether to use dropout/batchnorm or not
    fn forward_t(
        &self,
        input: DecoderInput,
        head: usize,
        dispersion: DispersionMode,
        train: bool,
    ) -> Result<DecoderOutput>;

    fn num_heads(&self) -> usize;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}
