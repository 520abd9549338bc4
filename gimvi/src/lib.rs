pub mod config;
pub mod data;
pub mod dataset;
pub mod dispersion;
pub mod error;
pub mod model;
pub mod simulate;
pub mod train;

pub use config::{ComputeDevice, JointVaeConfig};
pub use dataset::{DatasetId, DatasetSpec, IndexMapping, ReconstructionLoss};
pub use error::{JvaeError, Result};
pub use model::JointVae;

pub use candle_util::candle_encoder_multihead::LatentDistribution;
pub use candle_util::candle_model_traits::DispersionMode;
