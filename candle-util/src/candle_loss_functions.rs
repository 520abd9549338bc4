use candle_core::{Result, Tensor};

/// numerical floor inside the count likelihoods
pub const LLIK_EPS: f64 = 1e-8;

const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;

/// KL divergence loss between N(mu, sigma^2) and N(0, 1)
///
/// -0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// KL divergence between two diagonal Gaussians, summed over the last axis
///
/// KL(q || p) = 0.5 * [ log(var_p / var_q) + (var_q + (mu_q - mu_p)^2) / var_p - 1 ]
///
/// * `mean_q`, `var_q` - posterior mean and variance
/// * `mean_p`, `var_p` - prior mean and variance (broadcast against q)
///
pub fn normal_kl_divergence(
    mean_q: &Tensor,
    var_q: &Tensor,
    mean_p: &Tensor,
    var_p: &Tensor,
) -> Result<Tensor> {
    let log_ratio = var_p.log()?.broadcast_sub(&var_q.log()?)?;
    let sq_diff = mean_q.broadcast_sub(mean_p)?.sqr()?;
    let scaled = var_q.broadcast_add(&sq_diff)?.broadcast_div(var_p)?;
    ((log_ratio.broadcast_add(&scaled)? - 1.)? * 0.5)?.sum(mean_q.rank() - 1)
}

/// Numerically stable softplus: log(1 + exp(x))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()?.add(&tail)
}

/// Log-gamma of positive inputs by the shifted Stirling series
///
/// lgamma(x) = lgamma(x + 6) - sum_{j<6} log(x + j)
///
/// where lgamma(z), z >= 6, takes three correction terms. Absolute
/// error is well below single precision.
pub fn lgamma(x: &Tensor) -> Result<Tensor> {
    let mut shift = x.log()?;
    for j in 1..6 {
        shift = shift.add(&(x + j as f64)?.log()?)?;
    }

    let z = (x + 6.)?;
    let z_inv = z.recip()?;
    let z_inv2 = z_inv.sqr()?;

    // 1/(12z) - 1/(360z^3) + 1/(1260z^5)
    let series = z_inv.mul(&((z_inv2.affine(1. / 1260., -1. / 360.)? * &z_inv2)? + 1. / 12.)?)?;

    let stirling = ((&z - 0.5)?.mul(&z.log()?)? - &z)?;
    ((stirling + HALF_LN_2PI)? + series)? - shift
}

/// Log-likelihood of a negative binomial with mean `mu` and inverse
/// dispersion `theta`, summed over the last axis
///
/// llik(i) = sum_g lgamma(x + theta) - lgamma(theta) - lgamma(x + 1)
///           + theta * log(theta / (theta + mu)) + x * log(mu / (theta + mu))
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean (rate) tensor, positive
/// * `theta_nd` - inverse dispersion, positive
///
pub fn log_nb_positive(x_nd: &Tensor, mu_nd: &Tensor, theta_nd: &Tensor) -> Result<Tensor> {
    let log_theta_mu_eps = ((theta_nd + mu_nd)? + LLIK_EPS)?.log()?;

    let term_theta = theta_nd.mul(&(((theta_nd + LLIK_EPS)?.log()? - &log_theta_mu_eps)?))?;
    let term_x = x_nd.mul(&(((mu_nd + LLIK_EPS)?.log()? - &log_theta_mu_eps)?))?;
    let term_gamma = ((lgamma(&(x_nd + theta_nd)?)? - lgamma(theta_nd)?)?
        - lgamma(&(x_nd + 1.)?)?)?;

    ((term_theta + term_x)? + term_gamma)?.sum(x_nd.rank() - 1)
}

/// Log-likelihood of a zero-inflated negative binomial, summed over
/// the last axis
///
/// With `pi = dropout logits`:
///
/// ```text
/// x == 0: softplus(-pi + theta * log(theta / (theta + mu))) - softplus(-pi)
/// x  > 0: -softplus(-pi) - pi + NB log-likelihood of x
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean (rate) tensor, positive
/// * `theta_nd` - inverse dispersion, positive
/// * `pi_nd` - logits of the dropout probability
///
pub fn log_zinb_positive(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    theta_nd: &Tensor,
    pi_nd: &Tensor,
) -> Result<Tensor> {
    let softplus_pi = softplus(&pi_nd.neg()?)?;
    let log_theta_eps = (theta_nd + LLIK_EPS)?.log()?;
    let log_theta_mu_eps = ((theta_nd + mu_nd)? + LLIK_EPS)?.log()?;
    let pi_theta_log = (pi_nd.neg()? + theta_nd.mul(&(&log_theta_eps - &log_theta_mu_eps)?)?)?;

    let case_zero = (softplus(&pi_theta_log)? - &softplus_pi)?;

    let term_x = x_nd.mul(&(((mu_nd + LLIK_EPS)?.log()? - &log_theta_mu_eps)?))?;
    let term_gamma = ((lgamma(&(x_nd + theta_nd)?)? - lgamma(theta_nd)?)?
        - lgamma(&(x_nd + 1.)?)?)?;
    let case_non_zero = (((pi_theta_log - &softplus_pi)? + term_x)? + term_gamma)?;

    let is_zero = x_nd.lt(LLIK_EPS)?;
    is_zero
        .where_cond(&case_zero, &case_non_zero)?
        .sum(x_nd.rank() - 1)
}

/// Poisson log-probability with the log(x!) term, summed over the
/// last axis
///
/// llik(i) = sum_g x * log(rate) - rate - lgamma(x + 1)
///
/// * `x_nd` - observed counts
/// * `rate_nd` - rate tensor, positive
///
pub fn poisson_log_prob(x_nd: &Tensor, rate_nd: &Tensor) -> Result<Tensor> {
    // 0 * log(0) is taken as zero
    let x_log_rate = x_nd
        .gt(0.0)?
        .where_cond(&x_nd.mul(&rate_nd.log()?)?, &Tensor::zeros_like(x_nd)?)?;

    ((x_log_rate - rate_nd)? - lgamma(&(x_nd + 1.)?)?)?.sum(x_nd.rank() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use special::Gamma;

    #[test]
    fn lgamma_matches_reference() -> Result<()> {
        let dev = Device::Cpu;
        let xs = vec![0.1f32, 0.5, 1.0, 2.0, 3.7, 10.0, 55.5, 1000.0];
        let lg = lgamma(&Tensor::new(xs.as_slice(), &dev)?)?.to_vec1::<f32>()?;
        for (x, v) in xs.iter().zip(lg.iter()) {
            let expected = (*x as f64).ln_gamma().0;
            assert_abs_diff_eq!(*v as f64, expected, epsilon = 1e-3 * expected.abs().max(1.0));
        }
        Ok(())
    }

    #[test]
    fn softplus_is_stable() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-100f32, 0.0, 100.0], &dev)?;
        let sp = softplus(&x)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(sp[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sp[1], 2f32.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(sp[2], 100.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn normal_kl_vanishes_at_prior() -> Result<()> {
        let dev = Device::Cpu;
        let m = Tensor::new(&[[0.3f32, -1.0], [2.0, 0.0]], &dev)?;
        let v = Tensor::new(&[[0.5f32, 1.5], [1.0, 2.0]], &dev)?;
        let kl = normal_kl_divergence(&m, &v, &m, &v)?.to_vec1::<f32>()?;
        for k in kl {
            assert_abs_diff_eq!(k, 0.0, epsilon = 1e-6);
        }

        let kl = normal_kl_divergence(&m, &v, &m.zeros_like()?, &v.ones_like()?)?;
        for k in kl.to_vec1::<f32>()? {
            assert!(k > 0.0);
        }
        Ok(())
    }

    #[test]
    fn standard_normal_kl_agrees_with_lnvar_form() -> Result<()> {
        let dev = Device::Cpu;
        let m = Tensor::new(&[[0.3f32, -1.0, 0.0]], &dev)?;
        let v = Tensor::new(&[[0.5f32, 1.5, 1.0]], &dev)?;
        let a = normal_kl_divergence(&m, &v, &m.zeros_like()?, &v.ones_like()?)?;
        let b = gaussian_kl_loss(&m, &v.log()?)?;
        assert_abs_diff_eq!(
            a.to_vec1::<f32>()?[0],
            b.to_vec1::<f32>()?[0],
            epsilon = 1e-5
        );
        Ok(())
    }

    #[test]
    fn nb_matches_closed_form() -> Result<()> {
        let dev = Device::Cpu;
        let (x, mu, theta) = (3.0f64, 2.5f64, 1.7f64);
        let expected = (x + theta).ln_gamma().0 - theta.ln_gamma().0 - (x + 1.).ln_gamma().0
            + theta * (theta / (theta + mu)).ln()
            + x * (mu / (theta + mu)).ln();

        let t = |v: f64| Tensor::new(&[[v as f32]], &dev);
        let llik = log_nb_positive(&t(x)?, &t(mu)?, &t(theta)?)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(llik[0] as f64, expected, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn zinb_reduces_to_nb_without_dropout() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0f32, 1.0, 4.0, 9.0]], &dev)?;
        let mu = Tensor::new(&[[0.7f32, 1.2, 3.0, 8.0]], &dev)?;
        let theta = Tensor::new(&[[2.0f32, 0.5, 5.0, 1.0]], &dev)?;
        let pi = (Tensor::ones_like(&x)? * -30.)?;

        let nb = log_nb_positive(&x, &mu, &theta)?.to_vec1::<f32>()?;
        let zinb = log_zinb_positive(&x, &mu, &theta, &pi)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(nb[0], zinb[0], epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn poisson_log_prob_matches_closed_form() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0f32, 2.0, 5.0]], &dev)?;
        let rate = Tensor::new(&[[0.5f32, 2.0, 4.0]], &dev)?;
        let expected: f64 = [(0.0f64, 0.5f64), (2.0, 2.0), (5.0, 4.0)]
            .iter()
            .map(|&(k, l)| k * l.ln() - l - (k + 1.).ln_gamma().0)
            .sum();
        let llik = poisson_log_prob(&x, &rate)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(llik[0] as f64, expected, epsilon = 1e-4);
        Ok(())
    }
}
