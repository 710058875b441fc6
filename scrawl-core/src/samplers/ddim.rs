use candle_core::{Result, Tensor};

use super::schedule::{self, TRAIN_TIMESTEPS};
use super::Sampler;

/// Deterministic DDIM update rule (eta fixed to zero).
pub struct DdimSampler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    step_ratio: usize,
    final_alpha_cumprod: f64,
}

impl DdimSampler {
    pub fn new(inference_steps: usize) -> Self {
        let alphas_cumprod = schedule::alphas_cumprod();
        let final_alpha_cumprod = alphas_cumprod[0];
        Self {
            timesteps: schedule::spaced_timesteps(inference_steps),
            alphas_cumprod,
            step_ratio: TRAIN_TIMESTEPS / inference_steps,
            final_alpha_cumprod,
        }
    }
}

impl Sampler for DdimSampler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor> {
        let alpha_prod = self.alphas_cumprod[timestep];
        (original * alpha_prod.sqrt())? + (noise * (1.0 - alpha_prod).sqrt())?
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = if timestep >= self.step_ratio {
            self.alphas_cumprod[timestep - self.step_ratio]
        } else {
            self.final_alpha_cumprod
        };

        let pred_original =
            ((sample - (model_output * (1.0 - alpha_prod_t).sqrt())?)? / alpha_prod_t.sqrt())?;
        let pred_direction = (model_output * (1.0 - alpha_prod_t_prev).sqrt())?;
        (pred_original * alpha_prod_t_prev.sqrt())? + pred_direction
    }
}
