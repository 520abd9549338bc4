use crate::error::{JvaeError, Result};
use candle_core::{DType, Device, Tensor};
use candle_util::candle_encoder_gaussian::MIN_VARIANCE;
use log::warn;
use rand::prelude::SliceRandom;
use rand::Rng;

/// Per-batch mean and variance of the log total count
///
/// Cells with zero total count are left out of the statistics. The
/// variance is floored at [`MIN_VARIANCE`], so a batch of one cell (or
/// of equal totals) still gives a proper prior.
///
/// * `x_nd` - raw counts
/// * `batch_n` - batch membership (u32); all cells in one batch if `None`
///
/// # Returns `(local_l_mean_n1, local_l_var_n1)`
pub fn library_size_prior(x_nd: &Tensor, batch_n: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
    let total_n = x_nd
        .sum_keepdim(1)?
        .flatten_all()?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()?;
    let n = total_n.len();

    let batch = match batch_n {
        Some(b) => b.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?,
        None => vec![0; n],
    };
    if batch.len() != n {
        return Err(JvaeError::config(format!(
            "{} batch indices for {} cells",
            batch.len(),
            n
        )));
    }

    let n_batch = batch.iter().max().map(|&b| b as usize + 1).unwrap_or(0);
    let mut occurs = vec![false; n_batch];
    let mut stat = vec![(0f64, 0f64, 0usize); n_batch];
    for (&tot, &b) in total_n.iter().zip(batch.iter()) {
        occurs[b as usize] = true;
        if tot > 0. {
            let l = tot.ln();
            let s = &mut stat[b as usize];
            s.0 += l;
            s.1 += l * l;
            s.2 += 1;
        }
    }

    let moments: Vec<(f32, f32)> = stat
        .into_iter()
        .zip(occurs)
        .enumerate()
        .map(|(b, ((s1, s2, m), occurs))| {
            if m == 0 {
                if occurs {
                    warn!("batch {} has no positive total count; using N(0, 1) prior", b);
                }
                (0., 1.)
            } else {
                let mu = s1 / m as f64;
                let var = s2 / m as f64 - mu * mu;
                if var < MIN_VARIANCE {
                    warn!(
                        "batch {}: library size variance {:.2e} over {} cells, floored to {:.0e}",
                        b, var, m, MIN_VARIANCE
                    );
                }
                (mu as f32, var.max(MIN_VARIANCE) as f32)
            }
        })
        .collect();

    let mean_n: Vec<f32> = batch.iter().map(|&b| moments[b as usize].0).collect();
    let var_n: Vec<f32> = batch.iter().map(|&b| moments[b as usize].1).collect();

    let dev = x_nd.device();
    let dtype = x_nd.dtype();
    Ok((
        Tensor::from_vec(mean_n, (n, 1), dev)?.to_dtype(dtype)?,
        Tensor::from_vec(var_n, (n, 1), dev)?.to_dtype(dtype)?,
    ))
}

/// Cells of one registered dataset
pub struct JointDataset {
    /// raw counts (n x d)
    pub x_nd: Tensor,
    /// batch membership (n), u32
    pub batch_n: Option<Tensor>,
    /// cell-type labels (n), u32
    pub label_n: Option<Tensor>,
    pub local_l_mean_n1: Tensor,
    pub local_l_var_n1: Tensor,
}

/// A minibatch taken from a [`JointDataset`]
pub struct JointMinibatch {
    pub x_nd: Tensor,
    pub batch_n: Option<Tensor>,
    pub label_n: Option<Tensor>,
    pub local_l_mean_n1: Tensor,
    pub local_l_var_n1: Tensor,
}

impl JointDataset {
    /// Wrap counts with the per-batch library size prior
    pub fn new(x_nd: Tensor, batch_n: Option<Tensor>, label_n: Option<Tensor>) -> Result<Self> {
        let (local_l_mean_n1, local_l_var_n1) = library_size_prior(&x_nd, batch_n.as_ref())?;
        Ok(Self {
            x_nd,
            batch_n,
            label_n,
            local_l_mean_n1,
            local_l_var_n1,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.x_nd.dims().first().copied().unwrap_or(0)
    }

    pub fn num_genes(&self) -> usize {
        self.x_nd.dims().get(1).copied().unwrap_or(0)
    }

    /// Rows `samples` moved to `device`
    pub fn minibatch(&self, samples: &[usize], device: &Device) -> Result<JointMinibatch> {
        let idx: Vec<u32> = samples.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, samples.len(), self.x_nd.device())?;
        let take = |t: &Tensor| -> Result<Tensor> {
            Ok(t.index_select(&idx, 0)?.to_device(device)?)
        };
        Ok(JointMinibatch {
            x_nd: take(&self.x_nd)?,
            batch_n: self.batch_n.as_ref().map(take).transpose()?,
            label_n: self.label_n.as_ref().map(take).transpose()?,
            local_l_mean_n1: take(&self.local_l_mean_n1)?,
            local_l_var_n1: take(&self.local_l_var_n1)?,
        })
    }
}

///
/// Minibatch indexes over several unpaired datasets
///
/// Each dataset is shuffled on its own. The largest dataset sets the
/// number of minibatches per epoch; smaller ones cycle through their
/// shuffled order until it is exhausted.
///
pub struct JointMinibatches {
    samples: Vec<Vec<usize>>,
    batch_size: usize,
}

impl JointMinibatches {
    pub fn new(sizes: &[usize], batch_size: usize) -> Self {
        Self {
            samples: sizes.iter().map(|&n| (0..n).collect()).collect(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn shuffle_minibatch(&mut self, rng: &mut impl Rng) {
        for s in self.samples.iter_mut() {
            s.shuffle(rng);
        }
    }

    pub fn num_datasets(&self) -> usize {
        self.samples.len()
    }

    fn num_chunks(&self, n: usize) -> usize {
        n.div_ceil(self.batch_size)
    }

    pub fn num_minibatch(&self) -> usize {
        self.samples
            .iter()
            .map(|s| self.num_chunks(s.len()))
            .max()
            .unwrap_or(0)
    }

    /// Sample indexes of dataset `d` in minibatch `b`
    pub fn chunk(&self, d: usize, b: usize) -> &[usize] {
        let s = match self.samples.get(d) {
            Some(s) if !s.is_empty() => s,
            _ => return &[],
        };
        let lb = (b % self.num_chunks(s.len())) * self.batch_size;
        let ub = (lb + self.batch_size).min(s.len());
        &s[lb..ub]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn smaller_dataset_cycles() {
        let mut mb = JointMinibatches::new(&[10, 3], 4);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        mb.shuffle_minibatch(&mut rng);

        assert_eq!(mb.num_minibatch(), 3);

        let large: HashSet<usize> = (0..3).flat_map(|b| mb.chunk(0, b).to_vec()).collect();
        assert_eq!(large.len(), 10);

        for b in 0..3 {
            let small = mb.chunk(1, b);
            assert_eq!(small.len(), 3);
            assert_eq!(small.iter().collect::<HashSet<_>>().len(), 3);
        }
        assert_eq!(mb.chunk(1, 0), mb.chunk(1, 1));
    }

    #[test]
    fn library_prior_per_batch() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(
            &[[1f32, 0.], [2., 1.], [5., 5.], [0., 0.], [10., 10.]],
            &dev,
        )?;
        let batch = Tensor::new(&[0u32, 0, 1, 1, 1], &dev)?;
        let (mean, var) = library_size_prior(&x, Some(&batch))?;
        let mean = mean.flatten_all()?.to_vec1::<f32>()?;
        let var = var.flatten_all()?.to_vec1::<f32>()?;

        let l0 = (1f32.ln() + 3f32.ln()) / 2.;
        assert_abs_diff_eq!(mean[0], l0, epsilon = 1e-5);
        assert_abs_diff_eq!(mean[1], l0, epsilon = 1e-5);

        // the empty cell does not count
        let l1 = (10f32.ln() + 20f32.ln()) / 2.;
        assert_abs_diff_eq!(mean[3], l1, epsilon = 1e-5);
        let v1 = ((10f32.ln() - l1).powi(2) + (20f32.ln() - l1).powi(2)) / 2.;
        assert_abs_diff_eq!(var[2], v1, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn single_cell_batch_keeps_positive_variance() -> Result<()> {
        use candle_util::candle_loss_functions::normal_kl_divergence;

        let dev = Device::Cpu;
        let x = Tensor::new(
            &[[1f32, 2., 3.], [4., 1., 2.], [3., 3., 3.], [5., 0., 1.]],
            &dev,
        )?;
        // ids need not start at zero or be contiguous
        let batch = Tensor::new(&[2u32, 2, 2, 5], &dev)?;
        let (mean, var) = library_size_prior(&x, Some(&batch))?;

        let var_n = var.flatten_all()?.to_vec1::<f32>()?;
        assert!(var_n.iter().all(|&v| v > 0.));
        assert_abs_diff_eq!(var_n[3], MIN_VARIANCE as f32, epsilon = 1e-9);
        assert_abs_diff_eq!(
            mean.flatten_all()?.to_vec1::<f32>()?[3],
            6f32.ln(),
            epsilon = 1e-5
        );

        let ql_m = Tensor::full(2f32, (4, 1), &dev)?;
        let ql_v = Tensor::ones((4, 1), DType::F32, &dev)?;
        let kl = normal_kl_divergence(&ql_m, &ql_v, &mean, &var)?.to_vec1::<f32>()?;
        assert!(kl.iter().all(|k| k.is_finite()));

        // equal totals within a batch
        let x = Tensor::new(&[[2f32, 2.], [1., 3.]], &dev)?;
        let (_, var) = library_size_prior(&x, None)?;
        assert!(var.flatten_all()?.to_vec1::<f32>()?.iter().all(|&v| v > 0.));
        Ok(())
    }

    #[test]
    fn minibatch_takes_rows() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2.], [3., 4.], [5., 6.]], &dev)?;
        let data = JointDataset::new(x, None, None)?;
        let mb = data.minibatch(&[2, 0], &dev)?;
        assert_eq!(mb.x_nd.to_vec2::<f32>()?, vec![vec![5., 6.], vec![1., 2.]]);
        assert!(mb.batch_n.is_none());
        assert_eq!(mb.local_l_mean_n1.dims(), &[2, 1]);
        Ok(())
    }
}
