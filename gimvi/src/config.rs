use crate::dataset::*;
use crate::error::{JvaeError, Result};
use candle_core::Device;
use candle_util::candle_encoder_multihead::LatentDistribution;
use candle_util::candle_model_traits::DispersionMode;

/// Parse `gene`, `gene-batch`, `gene-label` or `gene-cell`
pub fn parse_dispersion_mode(s: &str) -> Result<DispersionMode> {
    match s.to_lowercase().as_str() {
        "gene" => Ok(DispersionMode::Gene),
        "gene-batch" => Ok(DispersionMode::GeneBatch),
        "gene-label" => Ok(DispersionMode::GeneLabel),
        "gene-cell" => Ok(DispersionMode::GeneCell),
        _ => Err(JvaeError::config(format!(
            "unknown dispersion `{}` (gene, gene-batch, gene-label, gene-cell)",
            s
        ))),
    }
}

/// Full configuration of a joint VAE
///
/// Everything here is fixed at construction time.
#[derive(Clone, Debug)]
pub struct JointVaeConfig {
    pub datasets: Vec<DatasetSpec>,
    /// size of the shared gene vocabulary
    pub total_genes: usize,
    pub n_latent: usize,
    pub n_layers_encoder_individual: usize,
    pub n_layers_encoder_shared: usize,
    pub dim_hidden_encoder: usize,
    pub n_layers_decoder_individual: usize,
    pub n_layers_decoder_shared: usize,
    pub dim_hidden_decoder_individual: usize,
    pub dim_hidden_decoder_shared: usize,
    pub dropout_rate_encoder: f32,
    pub dropout_rate_decoder: f32,
    pub n_batch: usize,
    pub n_labels: usize,
    pub dispersion: DispersionMode,
    /// encode `log(1 + x)` instead of `x`
    pub log_variational: bool,
    pub latent_dist: LatentDistribution,
}

impl JointVaeConfig {
    /// Architecture defaults with the given datasets
    pub fn new(datasets: Vec<DatasetSpec>, total_genes: usize) -> Self {
        Self {
            datasets,
            total_genes,
            n_latent: 10,
            n_layers_encoder_individual: 1,
            n_layers_encoder_shared: 1,
            dim_hidden_encoder: 128,
            n_layers_decoder_individual: 0,
            n_layers_decoder_shared: 0,
            dim_hidden_decoder_individual: 32,
            dim_hidden_decoder_shared: 128,
            dropout_rate_encoder: 0.1,
            dropout_rate_decoder: 0.3,
            n_batch: 1,
            n_labels: 0,
            dispersion: DispersionMode::GeneBatch,
            log_variational: true,
            latent_dist: LatentDistribution::Gaussian,
        }
    }

    /// Build from the parallel per-dataset lists
    ///
    /// * `dim_input_list` - number of genes of each dataset
    /// * `total_genes` - size of the shared gene vocabulary
    /// * `indices_mappings` - where each dataset's genes sit in the vocabulary
    /// * `reconstruction_losses` - count likelihood of each dataset
    /// * `model_library_bools` - latent library size or observed totals
    pub fn from_lists(
        dim_input_list: &[usize],
        total_genes: usize,
        indices_mappings: Vec<IndexMapping>,
        reconstruction_losses: &[ReconstructionLoss],
        model_library_bools: &[bool],
    ) -> Result<Self> {
        let n = dim_input_list.len();
        let lengths = [
            ("indices_mappings", indices_mappings.len()),
            ("reconstruction_losses", reconstruction_losses.len()),
            ("model_library_bools", model_library_bools.len()),
        ];
        for (name, len) in lengths {
            if len != n {
                return Err(JvaeError::config(format!(
                    "{} has {} entries but dim_input_list has {}",
                    name, len, n
                )));
            }
        }

        let datasets = dim_input_list
            .iter()
            .zip(indices_mappings)
            .zip(reconstruction_losses.iter().zip(model_library_bools))
            .map(
                |((&dim_input, index_mapping), (&reconstruction_loss, &model_library))| {
                    DatasetSpec {
                        dim_input,
                        index_mapping,
                        reconstruction_loss,
                        model_library,
                    }
                },
            )
            .collect();

        Ok(Self::new(datasets, total_genes))
    }

    pub fn num_datasets(&self) -> usize {
        self.datasets.len()
    }

    pub fn dim_input_list(&self) -> Vec<usize> {
        self.datasets.iter().map(|d| d.dim_input).collect()
    }

    /// Check everything that would otherwise fail deep inside a forward pass
    pub fn validate(&self) -> Result<()> {
        if self.datasets.is_empty() {
            return Err(JvaeError::config("no dataset registered"));
        }
        if self.total_genes == 0 {
            return Err(JvaeError::config("total_genes must be positive"));
        }
        if self.n_latent == 0 {
            return Err(JvaeError::config("n_latent must be positive"));
        }
        for (i, d) in self.datasets.iter().enumerate() {
            d.index_mapping
                .validate(d.dim_input, self.total_genes)
                .map_err(|e| JvaeError::config(format!("dataset #{}: {}", i, e)))?;
        }
        match self.dispersion {
            DispersionMode::GeneBatch if self.n_batch == 0 => Err(JvaeError::config(
                "gene-batch dispersion needs n_batch > 0",
            )),
            DispersionMode::GeneLabel if self.n_labels == 0 => Err(JvaeError::config(
                "gene-label dispersion needs n_labels > 0",
            )),
            _ => Ok(()),
        }
    }
}

/// Where the tensors live; resolved once at program start
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ComputeDevice {
    #[default]
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(self) -> Result<Device> {
        Ok(match self {
            ComputeDevice::Cpu => Device::Cpu,
            ComputeDevice::Cuda => Device::new_cuda(0)?,
            ComputeDevice::Metal => Device::new_metal(0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_lists_are_rejected() {
        let res = JointVaeConfig::from_lists(
            &[3, 4],
            7,
            vec![IndexMapping::from(0..3), IndexMapping::from(3..7)],
            &[ReconstructionLoss::Nb],
            &[false, true],
        );
        assert!(matches!(res, Err(JvaeError::Config(_))));
    }

    #[test]
    fn defaults_validate() -> Result<()> {
        let config = JointVaeConfig::from_lists(
            &[3, 4],
            7,
            vec![IndexMapping::from(0..3), IndexMapping::from(3..7)],
            &[ReconstructionLoss::Zinb, ReconstructionLoss::Nb],
            &[true, false],
        )?;
        config.validate()?;
        assert_eq!(config.dim_input_list(), vec![3, 4]);
        assert_eq!(config.dispersion, DispersionMode::GeneBatch);
        Ok(())
    }

    #[test]
    fn dispersion_needs_cardinality() {
        let mut config = JointVaeConfig::new(
            vec![DatasetSpec {
                dim_input: 2,
                index_mapping: IndexMapping::from(0..2),
                reconstruction_loss: ReconstructionLoss::Nb,
                model_library: false,
            }],
            2,
        );
        config.dispersion = DispersionMode::GeneLabel;
        assert!(config.validate().is_err());
        config.n_labels = 3;
        assert!(config.validate().is_ok());
        assert!(parse_dispersion_mode("gene-cell").is_ok());
        assert!(parse_dispersion_mode("cell").is_err());
    }

    #[test]
    fn mapping_out_of_vocabulary() {
        let config = JointVaeConfig::new(
            vec![DatasetSpec {
                dim_input: 2,
                index_mapping: IndexMapping::new(&[0, 5]),
                reconstruction_loss: ReconstructionLoss::Poisson,
                model_library: false,
            }],
            3,
        );
        assert!(matches!(config.validate(), Err(JvaeError::Config(_))));
    }
}
