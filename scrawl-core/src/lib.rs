#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device;
pub mod loader;
pub mod samplers;

mod error;
mod image_prep;
mod output;
mod sd;
mod weights;

use std::path::PathBuf;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

pub use device::{seed_device, select_best_device, DeviceMap};
pub use error::{Error, Result};
pub use image_prep::{load_control_image, resize_for_condition_image};
pub use loader::Loader;
pub use output::persist_outputs;
pub use samplers::{Sampler, SchedulerKind};
pub use sd::{ControlNet, ControlNetOutput, ControlledUnet, ScribbleLoader, ScribblePipeline};
pub use weights::{load_pipeline, WeightLocations, DEFAULT_CONTROLNET_DIR, DEFAULT_WEIGHTS_DIR};

/// Negative prompt applied when a request does not carry one.
pub const DEFAULT_NEGATIVE_PROMPT: &str = "Longbody, lowres, bad anatomy, bad hands, missing fingers, extra digit, fewer digits, cropped, worst quality, low quality";

/// Target for the shorter side of the control image before quantization to
/// the 64-pixel grid, SD 1.5's native training resolution.
pub const CONDITION_RESOLUTION: u32 = 512;

// Define the request type.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PredictRequest {
    pub prompt: String,
    /// Control image for the scribble conditioning model.
    pub image: PathBuf,
    #[serde(default = "default_conditioning_scale")]
    pub conditioning_scale: f64,
    /// Denoising strength; 1 means total destruction of the original image.
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default)]
    pub scheduler: SchedulerKind,
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Scale for classifier-free guidance.
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    /// Let the conditioning model read the image content without the prompt;
    /// guidance scales between 3.0 and 5.0 work best here.
    #[serde(default)]
    pub guess_mode: bool,
}

fn default_conditioning_scale() -> f64 {
    0.5
}

fn default_strength() -> f64 {
    0.5
}

fn default_steps() -> usize {
    20
}

fn default_guidance_scale() -> f64 {
    7.0
}

fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.to_string()
}

impl PredictRequest {
    pub fn new(prompt: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            image: image.into(),
            conditioning_scale: default_conditioning_scale(),
            strength: default_strength(),
            scheduler: SchedulerKind::default(),
            steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            seed: None,
            negative_prompt: default_negative_prompt(),
            guess_mode: false,
        }
    }

    /// Rejects out-of-range parameters before any engine work happens.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.conditioning_scale) {
            return Err(Error::validation(format!(
                "conditioning_scale must be within [0, 1], got {}",
                self.conditioning_scale
            )));
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(Error::validation(format!(
                "strength must be within [0, 1], got {}",
                self.strength
            )));
        }
        if !(0.1..=30.0).contains(&self.guidance_scale) {
            return Err(Error::validation(format!(
                "guidance_scale must be within [0.1, 30.0], got {}",
                self.guidance_scale
            )));
        }
        if self.steps == 0 || self.steps > 1000 {
            return Err(Error::validation(format!(
                "steps must be within [1, 1000], got {}",
                self.steps
            )));
        }
        Ok(())
    }
}

/// The engine seam: one loaded pipeline serving one prediction at a time.
pub trait PipelineLike: Send + Sync {
    fn run(&self, request: PredictRequest) -> Result<Vec<DynamicImage>>;
}

/// The request entry point: generates and persists the output set, returning
/// the ordered image paths. A request either returns every output or fails
/// entirely.
pub fn predict(pipeline: &dyn PipelineLike, request: PredictRequest) -> Result<Vec<PathBuf>> {
    let images = pipeline.run(request)?;
    persist_outputs(&images)
}
