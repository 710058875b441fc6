//! Sampling-schedule strategies.
//!
//! Each request builds its own boxed [`Sampler`] from the requested
//! [`SchedulerKind`], so the schedule in effect is per-request configuration
//! rather than state on the shared pipeline.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

mod ddim;
mod dpmpp;
mod euler;
mod schedule;

pub use ddim::DdimSampler;
pub use dpmpp::DpmSolverMultistepSampler;
pub use euler::EulerSampler;

/// One denoising strategy over the SD 1.5 noise schedule.
///
/// `step` takes `&mut self` so multistep solvers can keep their history
/// request-local.
pub trait Sampler: Send {
    /// Train timesteps visited, in execution (descending) order.
    fn timesteps(&self) -> &[usize];

    /// Standard deviation a unit-variance initial sample must be scaled by.
    fn init_noise_sigma(&self) -> f64;

    /// Scales the denoising network input for one timestep.
    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor>;

    /// Diffuses `original` forward to `timestep`.
    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor>;

    /// One reverse-diffusion update.
    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor>;
}

/// The fixed set of schedule strategies exposed on the request surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    #[default]
    #[serde(rename = "DDIM")]
    Ddim,
    #[serde(rename = "DPMSolverMultistep")]
    DpmSolverMultistep,
    #[serde(rename = "K_EULER_ANCESTRAL")]
    KEulerAncestral,
    #[serde(rename = "K_EULER")]
    KEuler,
}

serde_plain::derive_display_from_serialize!(SchedulerKind);
serde_plain::derive_fromstr_from_deserialize!(SchedulerKind);

impl SchedulerKind {
    /// Builds a fresh sampler for one request. `inference_steps` must already
    /// be validated to be at least one.
    pub fn build(self, inference_steps: usize) -> Box<dyn Sampler> {
        match self {
            Self::Ddim => Box::new(DdimSampler::new(inference_steps)),
            Self::DpmSolverMultistep => Box::new(DpmSolverMultistepSampler::new(inference_steps)),
            Self::KEulerAncestral => Box::new(EulerSampler::new(inference_steps, true)),
            Self::KEuler => Box::new(EulerSampler::new(inference_steps, false)),
        }
    }
}
