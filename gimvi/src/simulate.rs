use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Poisson};

pub struct JointSimArgs {
    /// cells of the full-panel dataset
    pub n_rna_cells: usize,
    /// cells of the gene-subset dataset
    pub n_spatial_cells: usize,
    /// genes in the shared vocabulary
    pub n_genes: usize,
    /// genes measured by the gene-subset dataset
    pub n_spatial_genes: usize,
    pub n_factors: usize,
    /// expected total count per cell
    pub depth: f32,
    pub rseed: u64,
}

pub struct JointSimOut {
    /// counts over all genes (n_rna x G)
    pub rna_nd: Tensor,
    /// counts over the measured panel (n_spatial x S)
    pub spatial_nd: Tensor,
    /// positions of the panel genes, sorted
    pub spatial_genes: Vec<usize>,
    /// true rates of the spatial cells over all genes (n_spatial x G)
    pub spatial_rate_nd: Tensor,
}

impl JointSimOut {
    /// genes not measured by the gene-subset dataset
    pub fn held_out_genes(&self, n_genes: usize) -> Vec<usize> {
        (0..n_genes)
            .filter(|g| self.spatial_genes.binary_search(g).is_err())
            .collect()
    }
}

/// Two unpaired count datasets sharing one latent space
///
/// `rate[i,g] = depth * softmax_g(sum_k z[i,k] * beta[k,g])` with
/// `z ~ N(0, 1)` and `beta ~ N(0, 1)`; counts are Poisson.
pub fn generate_joint_data(args: &JointSimArgs, device: &Device) -> anyhow::Result<JointSimOut> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(args.rseed);
    let normal = Normal::new(0f32, 1f32)?;

    let (kk, gg) = (args.n_factors.max(1), args.n_genes);

    let beta_kg: Vec<f32> = (0..kk * gg).map(|_| normal.sample(&mut rng)).collect();

    let mut sample_rates = |n: usize| -> Vec<f32> {
        let mut rates = Vec::with_capacity(n * gg);
        for _ in 0..n {
            let z_k: Vec<f32> = (0..kk).map(|_| normal.sample(&mut rng)).collect();
            let eta_g: Vec<f32> = (0..gg)
                .map(|g| (0..kk).map(|k| z_k[k] * beta_kg[k * gg + g]).sum())
                .collect();
            let max = eta_g.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let exp_g: Vec<f32> = eta_g.iter().map(|&e| (e - max).exp()).collect();
            let tot: f32 = exp_g.iter().sum();
            rates.extend(exp_g.into_iter().map(|e| args.depth * e / tot));
        }
        rates
    };

    let rna_rates = sample_rates(args.n_rna_cells);
    let spatial_rates = sample_rates(args.n_spatial_cells);

    let mut spatial_genes =
        rand::seq::index::sample(&mut rng, gg, args.n_spatial_genes.min(gg)).into_vec();
    spatial_genes.sort_unstable();

    let mut sample_counts = |rates: &[f32]| -> anyhow::Result<Vec<f32>> {
        rates
            .iter()
            .map(|&r| Ok(Poisson::new(r.max(1e-8))?.sample(&mut rng)))
            .collect()
    };

    let rna_counts = sample_counts(&rna_rates)?;
    let spatial_full = sample_counts(&spatial_rates)?;
    let spatial_counts: Vec<f32> = spatial_full
        .chunks(gg)
        .flat_map(|row| spatial_genes.iter().map(move |&g| row[g]))
        .collect();

    let ns = spatial_genes.len();
    Ok(JointSimOut {
        rna_nd: Tensor::from_vec(rna_counts, (args.n_rna_cells, gg), device)?,
        spatial_nd: Tensor::from_vec(spatial_counts, (args.n_spatial_cells, ns), device)?,
        spatial_genes,
        spatial_rate_nd: Tensor::from_vec(spatial_rates, (args.n_spatial_cells, gg), device)?,
    })
}

/// Pearson correlation of two columns
pub fn pearson_correlation(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.;
    }
    let mean = |v: &[f32]| v[..n].iter().sum::<f32>() / n as f32;
    let (ma, mb) = (mean(a), mean(b));
    let (mut sab, mut saa, mut sbb) = (0f32, 0f32, 0f32);
    for i in 0..n {
        let (da, db) = (a[i] - ma, b[i] - mb);
        sab += da * db;
        saa += da * da;
        sbb += db * db;
    }
    let denom = (saa * sbb).sqrt();
    if denom > 0. {
        sab / denom
    } else {
        0.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn panels_and_shapes() -> anyhow::Result<()> {
        let args = JointSimArgs {
            n_rna_cells: 6,
            n_spatial_cells: 4,
            n_genes: 10,
            n_spatial_genes: 3,
            n_factors: 2,
            depth: 50.,
            rseed: 1,
        };
        let sim = generate_joint_data(&args, &Device::Cpu)?;
        assert_eq!(sim.rna_nd.dims(), &[6, 10]);
        assert_eq!(sim.spatial_nd.dims(), &[4, 3]);
        assert_eq!(sim.spatial_rate_nd.dims(), &[4, 10]);
        assert_eq!(sim.held_out_genes(10).len(), 7);

        let tot = sim.spatial_rate_nd.sum(1)?.to_vec1::<f32>()?;
        for t in tot {
            assert_abs_diff_eq!(t, 50., epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn correlation_extremes() {
        let a = [1f32, 2., 3., 4.];
        let b = [2f32, 4., 6., 8.];
        let c = [4f32, 3., 2., 1.];
        assert_abs_diff_eq!(pearson_correlation(&a, &b), 1., epsilon = 1e-6);
        assert_abs_diff_eq!(pearson_correlation(&a, &c), -1., epsilon = 1e-6);
        assert_eq!(pearson_correlation(&a, &[1., 1., 1., 1.]), 0.);
    }
}
