use crate::data::*;
use crate::model::*;

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::SeedableRng;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// KL weight grows linearly from 0 to 1 over these epochs
    pub kl_warmup_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
    pub rseed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 128,
            num_epochs: 100,
            kl_warmup_epochs: 0,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
            rseed: 42,
        }
    }
}

impl TrainConfig {
    pub fn kl_weight(&self, epoch: usize) -> f64 {
        if self.kl_warmup_epochs == 0 {
            1.
        } else {
            (epoch as f64 / self.kl_warmup_epochs as f64).min(1.)
        }
    }
}

/// Fit all the variables of `model` on unpaired datasets
///
/// * `model` - joint model whose variables live in `variable_map`
/// * `data` - one entry per registered dataset, in registration order
/// * `train_config` - training configuration
///
/// Each step sums `mean(recon + kl_weight * kl)` over the datasets.
///
/// # Returns the average loss per minibatch of each epoch
pub fn train_joint_vae(
    model: &JointVae,
    variable_map: &VarMap,
    data: &[JointDataset],
    train_config: &TrainConfig,
) -> anyhow::Result<Vec<f32>> {
    if data.len() != model.num_datasets() {
        return Err(anyhow::anyhow!(
            "{} datasets given for a model of {}",
            data.len(),
            model.num_datasets()
        ));
    }

    let device = &train_config.device;
    let mut adam = AdamW::new_lr(
        variable_map.all_vars(),
        train_config.learning_rate.into(),
    )?;

    let pb = ProgressBar::new(train_config.num_epochs as u64);

    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(train_config.rseed);
    let sizes = data.iter().map(|d| d.num_cells()).collect::<Vec<_>>();
    let mut minibatches = JointMinibatches::new(&sizes, train_config.batch_size);

    let mut loss_trace = vec![];

    for epoch in 0..train_config.num_epochs {
        let kl_weight = train_config.kl_weight(epoch);
        minibatches.shuffle_minibatch(&mut rng);

        let num_minibatch = minibatches.num_minibatch();
        let mut loss_tot = 0f32;

        for b in 0..num_minibatch {
            let mut loss: Option<Tensor> = None;

            for (mode, dataset) in model.dataset_ids().zip(data.iter()) {
                let samples = minibatches.chunk(mode.index(), b);
                if samples.is_empty() {
                    continue;
                }
                let mb = dataset.minibatch(samples, device)?;

                let (recon_n, kl_n) = model.forward_t(
                    ForwardInput {
                        x_nd: &mb.x_nd,
                        local_l_mean_n1: &mb.local_l_mean_n1,
                        local_l_var_n1: &mb.local_l_var_n1,
                        batch_n: mb.batch_n.as_ref(),
                        label_n: mb.label_n.as_ref(),
                    },
                    Some(mode),
                    true,
                )?;

                let loss_d = (recon_n + (kl_n * kl_weight)?)?.mean_all()?;
                loss = Some(match loss {
                    Some(acc) => (acc + loss_d)?,
                    None => loss_d,
                });
            }

            if let Some(loss) = loss {
                adam.backward_step(&loss)?;
                loss_tot += loss.to_scalar::<f32>()?;
            }
        }

        loss_trace.push(loss_tot / num_minibatch.max(1) as f32);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] loss: {} (kl weight {:.3})",
                epoch + 1,
                loss_trace.last().ok_or(anyhow::anyhow!("loss"))?,
                kl_weight
            );
        }
    }
    pb.finish_and_clear();
    Ok(loss_trace)
}
