use candle_core::{Result, Tensor};

use super::schedule;
use super::Sampler;

/// Euler discrete update over karras-style sigmas, optionally with the
/// ancestral noise injection. Ancestral noise is drawn from the device RNG so
/// a seeded device keeps the whole trajectory reproducible.
pub struct EulerSampler {
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    ancestral: bool,
}

impl EulerSampler {
    pub fn new(inference_steps: usize, ancestral: bool) -> Self {
        let alphas_cumprod = schedule::alphas_cumprod();
        let timesteps = schedule::spaced_timesteps(inference_steps);
        let mut sigmas: Vec<f64> = timesteps
            .iter()
            .map(|&t| schedule::sigma_from_alpha(alphas_cumprod[t]))
            .collect();
        sigmas.push(0.0);
        Self {
            timesteps,
            sigmas,
            ancestral,
        }
    }

    fn index_for(&self, timestep: usize) -> Result<usize> {
        self.timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or_else(|| candle_core::Error::Msg(format!("unknown timestep {timestep}")))
    }
}

impl Sampler for EulerSampler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        // Leading spacing: the first sigma is paired with a unit-variance
        // sample, so the initial noise carries the extra variance.
        (self.sigmas[0].powi(2) + 1.0).sqrt()
    }

    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor> {
        let sigma = self.sigmas[self.index_for(timestep)?];
        sample / (sigma.powi(2) + 1.0).sqrt()
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor> {
        let sigma = self.sigmas[self.index_for(timestep)?];
        original + (noise * sigma)?
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let index = self.index_for(timestep)?;
        let sigma_from = self.sigmas[index];
        let sigma_to = self.sigmas[index + 1];

        let (sigma_down, sigma_up) = if self.ancestral {
            let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2))
                / sigma_from.powi(2))
            .sqrt();
            ((sigma_to.powi(2) - sigma_up.powi(2)).sqrt(), sigma_up)
        } else {
            (sigma_to, 0.0)
        };

        // For an epsilon-predicting model the derivative is the prediction
        // itself: d = (sample - pred_original) / sigma = eps.
        let prev_sample = (sample + (model_output * (sigma_down - sigma_from))?)?;
        if self.ancestral && sigma_up > 0.0 {
            let noise = prev_sample.randn_like(0.0, 1.0)?;
            prev_sample + (noise * sigma_up)?
        } else {
            Ok(prev_sample)
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn sigmas_decay_to_zero() {
        let sampler = EulerSampler::new(20, false);
        assert_eq!(sampler.sigmas.len(), 21);
        assert!(sampler.sigmas.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(*sampler.sigmas.last().unwrap(), 0.0);
        assert!(sampler.init_noise_sigma() > sampler.sigmas[0]);
    }

    #[test]
    fn scale_model_input_matches_sigma() -> Result<()> {
        let sampler = EulerSampler::new(20, false);
        let t = sampler.timesteps()[0];
        let sigma = sampler.sigmas[0];
        let sample = Tensor::full(1.0f32, (1, 4, 2, 2), &Device::Cpu)?;
        let scaled = sampler.scale_model_input(sample, t)?;
        let got = scaled.flatten_all()?.to_vec1::<f32>()?[0];
        let want = 1.0 / ((sigma * sigma + 1.0).sqrt() as f32);
        assert!((got - want).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn final_step_removes_all_noise_under_perfect_prediction() -> Result<()> {
        let device = Device::Cpu;
        let signal = Tensor::full(0.5f32, (1, 4, 2, 2), &device)?;
        let noise = Tensor::full(0.25f32, (1, 4, 2, 2), &device)?;

        let mut sampler = EulerSampler::new(20, false);
        let last_t = *sampler.timesteps().last().unwrap();
        let noisy = sampler.add_noise(&signal, noise.clone(), last_t)?;
        let stepped = sampler.step(&noise, last_t, &noisy)?;
        let err = (stepped - signal)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(err < 1e-5, "residual error {err}");
        Ok(())
    }

    #[test]
    fn ancestral_noise_is_seed_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let sample = Tensor::full(0.5f32, (1, 4, 2, 2), &device)?;
        let eps = Tensor::full(0.1f32, (1, 4, 2, 2), &device)?;

        let mut sampler = EulerSampler::new(20, true);
        let t = sampler.timesteps()[3];

        device.set_seed(42)?;
        let a = sampler.step(&eps, t, &sample)?;
        device.set_seed(42)?;
        let b = sampler.step(&eps, t, &sample)?;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn unknown_timestep_is_rejected() -> Result<()> {
        let sampler = EulerSampler::new(20, false);
        let sample = Tensor::zeros((1,), candle_core::DType::F32, &Device::Cpu)?;
        assert!(sampler.scale_model_input(sample, 12345).is_err());
        Ok(())
    }
}
