use gimvi::config::*;
use gimvi::data::*;
use gimvi::dataset::*;
use gimvi::model::*;
use gimvi::simulate::*;
use gimvi::train::*;
use gimvi::LatentDistribution;

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, ValueEnum};
use log::info;
use std::io::Write;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDeviceArg {
    Cpu,
    Cuda,
    Metal,
}

impl From<ComputeDeviceArg> for ComputeDevice {
    fn from(arg: ComputeDeviceArg) -> Self {
        match arg {
            ComputeDeviceArg::Cpu => ComputeDevice::Cpu,
            ComputeDeviceArg::Cuda => ComputeDevice::Cuda,
            ComputeDeviceArg::Metal => ComputeDevice::Metal,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatentDistArg {
    Gaussian,
    LogisticNormal,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// number of cells with the full gene panel
    #[arg(long, default_value_t = 1000)]
    n_rna_cells: usize,

    /// number of cells with the gene subset
    #[arg(long, default_value_t = 500)]
    n_spatial_cells: usize,

    /// number of genes in the full panel
    #[arg(long, default_value_t = 200)]
    n_genes: usize,

    /// number of genes measured in the subset
    #[arg(long, default_value_t = 100)]
    n_spatial_genes: usize,

    /// number of generating factors
    #[arg(long, default_value_t = 5)]
    n_factors: usize,

    /// depth per cell
    #[arg(short, long, default_value_t = 1000.)]
    depth: f32,

    /// latent dimension of the model
    #[arg(short = 'k', long, default_value_t = 10)]
    n_latent: usize,

    /// reconstruction loss of the full-panel data (zinb, nb, poisson)
    #[arg(long, default_value = "zinb")]
    rna_loss: String,

    /// reconstruction loss of the subset data (zinb, nb, poisson)
    #[arg(long, default_value = "nb")]
    spatial_loss: String,

    /// dispersion (gene, gene-batch, gene-label, gene-cell)
    #[arg(long, default_value = "gene-batch")]
    dispersion: String,

    /// latent distribution
    #[arg(long, value_enum, default_value = "gaussian")]
    latent_dist: LatentDistArg,

    /// number of training epochs
    #[arg(short = 'i', long, default_value_t = 200)]
    epochs: usize,

    /// epochs to warm up the KL weight
    #[arg(long, default_value_t = 50)]
    kl_warmup: usize,

    /// minibatch size
    #[arg(long, default_value_t = 128)]
    minibatch_size: usize,

    /// learning rate
    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f32,

    /// candle device
    #[arg(long, value_enum, default_value = "cpu")]
    device: ComputeDeviceArg,

    /// random seed
    #[arg(long, default_value_t = 42)]
    rseed: u64,

    /// output header
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let dev = ComputeDevice::from(args.device).to_device()?;

    info!("simulating two unpaired datasets ...");
    let sim = generate_joint_data(
        &JointSimArgs {
            n_rna_cells: args.n_rna_cells,
            n_spatial_cells: args.n_spatial_cells,
            n_genes: args.n_genes,
            n_spatial_genes: args.n_spatial_genes,
            n_factors: args.n_factors,
            depth: args.depth,
            rseed: args.rseed,
        },
        &dev,
    )?;

    let n_spatial_genes = sim.spatial_genes.len();

    let mut config = JointVaeConfig::from_lists(
        &[args.n_genes, n_spatial_genes],
        args.n_genes,
        vec![
            IndexMapping::from(0..args.n_genes),
            IndexMapping::new(&sim.spatial_genes),
        ],
        &[args.rna_loss.parse()?, args.spatial_loss.parse()?],
        &[true, false],
    )?;
    config.n_latent = args.n_latent;
    config.n_batch = 2;
    config.dispersion = parse_dispersion_mode(&args.dispersion)?;
    config.latent_dist = match args.latent_dist {
        LatentDistArg::Gaussian => LatentDistribution::Gaussian,
        LatentDistArg::LogisticNormal => LatentDistribution::LogisticNormal,
    };

    // one batch per dataset
    let batch_of = |n: usize, b: u32| Tensor::from_vec(vec![b; n], n, &dev);
    let data = vec![
        JointDataset::new(
            sim.rna_nd.clone(),
            Some(batch_of(args.n_rna_cells, 0)?),
            None,
        )?,
        JointDataset::new(
            sim.spatial_nd.clone(),
            Some(batch_of(args.n_spatial_cells, 1)?),
            None,
        )?,
    ];

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let model = JointVae::new(config, vb)?;

    info!("training the joint model ...");
    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.minibatch_size,
        num_epochs: args.epochs,
        kl_warmup_epochs: args.kl_warmup,
        device: dev.clone(),
        verbose: args.verbose,
        show_progress: true,
        rseed: args.rseed,
    };
    let loss_trace = train_joint_vae(&model, &varmap, &data, &train_config)?;

    let rna = model.dataset_id(0)?;
    let spatial = model.dataset_id(1)?;

    let z_rna = model.sample_from_posterior_z(&data[0].x_nd, Some(rna), true)?;
    let z_spatial = model.sample_from_posterior_z(&data[1].x_nd, Some(spatial), true)?;

    let imputed_nd = model.sample_rate(
        &data[1].x_nd,
        spatial,
        data[1].batch_n.as_ref(),
        None,
        true,
        Some(rna),
    )?;

    let held_out = sim.held_out_genes(args.n_genes);
    let imputed_gn = imputed_nd.t()?.contiguous()?.to_vec2::<f32>()?;
    let truth_gn = sim.spatial_rate_nd.t()?.contiguous()?.to_vec2::<f32>()?;
    let corr = held_out
        .iter()
        .map(|&g| pearson_correlation(&imputed_gn[g], &truth_gn[g]))
        .collect::<Vec<_>>();
    if !corr.is_empty() {
        info!(
            "imputation correlation over {} held-out genes: {:.4}",
            corr.len(),
            corr.iter().sum::<f32>() / corr.len() as f32
        );
    }

    let out = args.out.to_string();
    write_tsv(&z_rna.to_vec2::<f32>()?, &(out.clone() + ".latent_rna.tsv"))?;
    write_tsv(
        &z_spatial.to_vec2::<f32>()?,
        &(out.clone() + ".latent_spatial.tsv"),
    )?;
    write_tsv(
        &imputed_nd.to_vec2::<f32>()?,
        &(out.clone() + ".imputed_spatial.tsv"),
    )?;
    write_tsv(
        &loss_trace.iter().map(|&l| vec![l]).collect::<Vec<_>>(),
        &(out.clone() + ".loss.tsv"),
    )?;
    write_tsv(
        &held_out
            .iter()
            .zip(corr.iter())
            .map(|(&g, &r)| vec![g as f32, r])
            .collect::<Vec<_>>(),
        &(out + ".imputation_corr.tsv"),
    )?;

    info!("done");
    Ok(())
}

fn write_tsv(rows: &[Vec<f32>], file: &str) -> anyhow::Result<()> {
    let mut buf = std::io::BufWriter::new(std::fs::File::create(file)?);
    for row in rows {
        let line = row
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    info!("wrote {}", file);
    Ok(())
}
