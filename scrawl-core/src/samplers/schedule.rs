//! The SD 1.5 training noise schedule shared by every sampling strategy:
//! 1000 train timesteps, scaled-linear betas, leading spacing with an offset
//! of one.

pub(crate) const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;
const STEPS_OFFSET: usize = 1;

/// Cumulative product of `1 - beta_t` with betas linear in sqrt space.
pub(crate) fn alphas_cumprod() -> Vec<f64> {
    let start = BETA_START.sqrt();
    let end = BETA_END.sqrt();
    let mut prod = 1.0;
    (0..TRAIN_TIMESTEPS)
        .map(|t| {
            let beta = start + (end - start) * t as f64 / (TRAIN_TIMESTEPS - 1) as f64;
            prod *= 1.0 - beta * beta;
            prod
        })
        .collect()
}

/// Train timesteps visited for `inference_steps` denoising steps, descending.
pub(crate) fn spaced_timesteps(inference_steps: usize) -> Vec<usize> {
    let step_ratio = TRAIN_TIMESTEPS / inference_steps;
    (0..inference_steps)
        .map(|s| (s * step_ratio + STEPS_OFFSET).min(TRAIN_TIMESTEPS - 1))
        .rev()
        .collect()
}

/// Karras-style sigma at a given cumulative alpha.
pub(crate) fn sigma_from_alpha(alpha_cumprod: f64) -> f64 {
    ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphas_decrease_from_one_towards_zero() {
        let acp = alphas_cumprod();
        assert_eq!(acp.len(), TRAIN_TIMESTEPS);
        assert!(acp[0] > 0.99);
        assert!(acp[TRAIN_TIMESTEPS - 1] < 0.01);
        assert!(acp.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn timesteps_are_descending_and_counted() {
        let timesteps = spaced_timesteps(20);
        assert_eq!(timesteps.len(), 20);
        assert!(timesteps.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(*timesteps.last().unwrap(), 1);
        assert!(*timesteps.first().unwrap() < TRAIN_TIMESTEPS);
    }

    #[test]
    fn single_step_stays_in_range() {
        assert_eq!(spaced_timesteps(1), vec![1]);
    }

    #[test]
    fn sigmas_grow_with_noise() {
        let acp = alphas_cumprod();
        assert!(sigma_from_alpha(acp[999]) > sigma_from_alpha(acp[1]));
        assert!(sigma_from_alpha(acp[1]) > 0.0);
    }
}
