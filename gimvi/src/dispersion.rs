use crate::error::{JvaeError, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use candle_util::candle_encoding::one_hot;
use candle_util::candle_model_traits::DispersionMode;

/// Log-dispersion parameters owned by the joint model
///
/// Each variant carries exactly the tensor its mode needs. Values are
/// stored in log space and exponentiated on use.
pub enum DispersionParam {
    /// (1 x D)
    PerGene { ln_r_1d: Tensor },
    /// (B x D), one row per batch
    PerGeneBatch { ln_r_bd: Tensor },
    /// (L x D), one row per label
    PerGeneLabel { ln_r_ld: Tensor },
    /// nothing owned; the decoder predicts it per cell
    PerGeneCell,
}

impl DispersionParam {
    /// Will create the variable `px.ln_r` shaped for `mode`
    pub fn new(
        mode: DispersionMode,
        total_genes: usize,
        n_batch: usize,
        n_labels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init = candle_nn::Init::Randn {
            mean: 0.,
            stdev: 1.,
        };
        Ok(match mode {
            DispersionMode::Gene => Self::PerGene {
                ln_r_1d: vb.get_with_hints((1, total_genes), "px.ln_r", init)?,
            },
            DispersionMode::GeneBatch => Self::PerGeneBatch {
                ln_r_bd: vb.get_with_hints((n_batch, total_genes), "px.ln_r", init)?,
            },
            DispersionMode::GeneLabel => Self::PerGeneLabel {
                ln_r_ld: vb.get_with_hints((n_labels, total_genes), "px.ln_r", init)?,
            },
            DispersionMode::GeneCell => Self::PerGeneCell,
        })
    }

    pub fn mode(&self) -> DispersionMode {
        match self {
            Self::PerGene { .. } => DispersionMode::Gene,
            Self::PerGeneBatch { .. } => DispersionMode::GeneBatch,
            Self::PerGeneLabel { .. } => DispersionMode::GeneLabel,
            Self::PerGeneCell => DispersionMode::GeneCell,
        }
    }

    /// the owned tensor, if any
    pub fn ln_r(&self) -> Option<&Tensor> {
        match self {
            Self::PerGene { ln_r_1d } => Some(ln_r_1d),
            Self::PerGeneBatch { ln_r_bd } => Some(ln_r_bd),
            Self::PerGeneLabel { ln_r_ld } => Some(ln_r_ld),
            Self::PerGeneCell => None,
        }
    }

    /// Resolve the per-cell dispersion `r` (n x D), positive
    ///
    /// * `decoder_ln_r_nd` - per-cell log-dispersion from the decoder
    /// * `batch_n` - batch of each cell
    /// * `label_n` - label of each cell
    /// * `n_cells` - number of cells
    pub fn resolve(
        &self,
        decoder_ln_r_nd: Option<Tensor>,
        batch_n: Option<&Tensor>,
        label_n: Option<&Tensor>,
        n_cells: usize,
    ) -> Result<Tensor> {
        let ln_r_nd = match self {
            Self::PerGeneLabel { ln_r_ld } => {
                let label_n = label_n
                    .ok_or_else(|| JvaeError::config("gene-label dispersion needs labels"))?;
                let n_labels = ln_r_ld.dim(0)?;
                one_hot(label_n, n_labels, ln_r_ld.dtype())?.matmul(ln_r_ld)?
            }
            Self::PerGeneBatch { ln_r_bd } => {
                let batch_n = batch_n
                    .ok_or_else(|| JvaeError::config("gene-batch dispersion needs batch indices"))?;
                let n_batch = ln_r_bd.dim(0)?;
                one_hot(batch_n, n_batch, ln_r_bd.dtype())?.matmul(ln_r_bd)?
            }
            Self::PerGene { ln_r_1d } => {
                let d = ln_r_1d.dim(1)?;
                ln_r_1d.broadcast_as((n_cells, d))?.contiguous()?
            }
            Self::PerGeneCell => decoder_ln_r_nd.ok_or_else(|| {
                JvaeError::config("gene-cell dispersion but the decoder gave none")
            })?,
        };
        Ok(ln_r_nd.exp()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn shapes_follow_mode() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let gene = DispersionParam::new(DispersionMode::Gene, 5, 2, 3, vb.pp("a"))?;
        let batch = DispersionParam::new(DispersionMode::GeneBatch, 5, 2, 3, vb.pp("b"))?;
        let label = DispersionParam::new(DispersionMode::GeneLabel, 5, 2, 3, vb.pp("c"))?;
        let cell = DispersionParam::new(DispersionMode::GeneCell, 5, 2, 3, vb.pp("d"))?;

        assert_eq!(gene.ln_r().map(|t| t.dims().to_vec()), Some(vec![1, 5]));
        assert_eq!(batch.ln_r().map(|t| t.dims().to_vec()), Some(vec![2, 5]));
        assert_eq!(label.ln_r().map(|t| t.dims().to_vec()), Some(vec![3, 5]));
        assert!(cell.ln_r().is_none());
        assert_eq!(cell.mode(), DispersionMode::GeneCell);
        Ok(())
    }

    #[test]
    fn batch_rows_follow_batch() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let param = DispersionParam::new(DispersionMode::GeneBatch, 4, 2, 0, vb)?;

        let batch = Tensor::new(&[1u32, 0, 1], &dev)?;
        let r = param.resolve(None, Some(&batch), None, 3)?.to_vec2::<f32>()?;
        assert_eq!(r[0], r[2]);
        assert!(r[0].iter().all(|&x| x > 0.));

        let expected = param
            .ln_r()
            .map(|t| t.exp()?.to_vec2::<f32>())
            .transpose()?
            .unwrap_or_default();
        assert_eq!(r[1], expected[0]);

        assert!(param.resolve(None, None, None, 3).is_err());
        Ok(())
    }
}
