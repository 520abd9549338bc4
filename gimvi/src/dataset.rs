use crate::error::{JvaeError, Result};
use candle_core::{Device, Tensor};
use std::ops::Range;
use std::str::FromStr;

/// Identifier of a registered dataset (a head/tail of the joint model)
///
/// Only handed out by the model that registered the dataset, so it is
/// always within range for that model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(usize);

impl DatasetId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dataset #{}", self.0)
    }
}

/// Count likelihood used to reconstruct one dataset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconstructionLoss {
    /// zero-inflated negative binomial
    Zinb,
    /// negative binomial
    Nb,
    Poisson,
}

impl FromStr for ReconstructionLoss {
    type Err = JvaeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "zinb" => Ok(Self::Zinb),
            "nb" => Ok(Self::Nb),
            "poisson" => Ok(Self::Poisson),
            _ => Err(JvaeError::config(format!(
                "unknown reconstruction loss `{}` (zinb, nb, poisson)",
                s
            ))),
        }
    }
}

/// Positions of a dataset's genes in the shared gene vocabulary
///
/// `indices[j]` is where the `j`-th local gene is reconstructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexMapping {
    indices: Vec<u32>,
}

impl IndexMapping {
    pub fn new(indices: &[usize]) -> Self {
        Self {
            indices: indices.iter().map(|&g| g as u32).collect(),
        }
    }

    /// contiguous block `range.start .. range.end`
    pub fn from_range(range: Range<usize>) -> Self {
        Self {
            indices: range.map(|g| g as u32).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.indices, self.indices.len(), device)?)
    }

    /// length must match the input width; values must fall in
    /// `[0, total_genes)`
    pub fn validate(&self, dim_input: usize, total_genes: usize) -> Result<()> {
        if self.indices.len() != dim_input {
            return Err(JvaeError::config(format!(
                "index mapping has {} entries for an input of {} genes",
                self.indices.len(),
                dim_input
            )));
        }
        if let Some(&g) = self.indices.iter().find(|&&g| g as usize >= total_genes) {
            return Err(JvaeError::config(format!(
                "index mapping points to gene {} outside of {} total genes",
                g, total_genes
            )));
        }
        Ok(())
    }
}

impl From<Range<usize>> for IndexMapping {
    fn from(range: Range<usize>) -> Self {
        Self::from_range(range)
    }
}

impl From<Vec<usize>> for IndexMapping {
    fn from(indices: Vec<usize>) -> Self {
        Self::new(&indices)
    }
}

/// Immutable per-dataset configuration
#[derive(Clone, Debug)]
pub struct DatasetSpec {
    /// number of genes measured in this dataset
    pub dim_input: usize,
    pub index_mapping: IndexMapping,
    pub reconstruction_loss: ReconstructionLoss,
    /// model the library size with a latent variable, or take the
    /// observed total count
    pub model_library: bool,
}
