use std::path::{Path, PathBuf};
use std::sync::Arc;

use hf_hub::api::tokio::Api;
use tracing::info;

use crate::device::DeviceMap;
use crate::loader::Loader;
use crate::sd::ScribbleLoader;
use crate::{Error, PipelineLike, Result};

/// Default location of the main pipeline weights.
pub const DEFAULT_WEIGHTS_DIR: &str = "weights";
/// Default location of the conditioning-model weights.
pub const DEFAULT_CONTROLNET_DIR: &str = "controlnet-cache";

/// The two fixed weight directories, read-only at runtime and populated
/// out-of-band, laid out the way diffusers exports them.
#[derive(Clone, Debug)]
pub struct WeightLocations {
    pipeline_dir: PathBuf,
    controlnet_dir: PathBuf,
    tokenizer_file: Option<PathBuf>,
}

impl Default for WeightLocations {
    fn default() -> Self {
        Self::new(DEFAULT_WEIGHTS_DIR, DEFAULT_CONTROLNET_DIR)
    }
}

impl WeightLocations {
    pub fn new(pipeline_dir: impl Into<PathBuf>, controlnet_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline_dir: pipeline_dir.into(),
            controlnet_dir: controlnet_dir.into(),
            tokenizer_file: None,
        }
    }

    /// Overrides the tokenizer location; without this the loader looks next
    /// to the pipeline weights and then falls back to the hub.
    pub fn with_tokenizer_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.tokenizer_file = Some(path.into());
        self
    }

    pub fn tokenizer_file(&self) -> Option<&Path> {
        self.tokenizer_file.as_deref()
    }

    pub(crate) fn local_tokenizer(&self) -> PathBuf {
        self.pipeline_dir.join("tokenizer").join("tokenizer.json")
    }

    pub(crate) fn clip_weights(&self) -> PathBuf {
        self.pipeline_dir.join("text_encoder").join("model.safetensors")
    }

    pub(crate) fn vae_weights(&self) -> PathBuf {
        self.pipeline_dir.join("vae").join("diffusion_pytorch_model.safetensors")
    }

    pub(crate) fn unet_weights(&self) -> PathBuf {
        self.pipeline_dir.join("unet").join("diffusion_pytorch_model.safetensors")
    }

    pub(crate) fn controlnet_weights(&self) -> PathBuf {
        self.controlnet_dir.join("diffusion_pytorch_model.safetensors")
    }

    /// Fails setup early when any expected weight file is absent, before any
    /// device memory is touched.
    pub fn ensure_present(&self) -> Result<()> {
        for file in [
            self.clip_weights(),
            self.vae_weights(),
            self.unet_weights(),
            self.controlnet_weights(),
        ] {
            if !file.is_file() {
                return Err(Error::setup(format!(
                    "missing weight file {}",
                    file.display()
                )));
            }
        }
        Ok(())
    }
}

/// Loads the one pipeline this service runs and hands it back behind the
/// engine seam.
pub async fn load_pipeline(
    weights: WeightLocations,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn PipelineLike>> {
    info!(
        pipeline = %weights.pipeline_dir.display(),
        controlnet = %weights.controlnet_dir.display(),
        "loading pipeline"
    );
    let pipeline = ScribbleLoader::load(weights, api, device_map).await?;
    Ok(Arc::new(pipeline))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_locations_match_the_fixed_directories() {
        let weights = WeightLocations::default();
        assert_eq!(
            weights.unet_weights(),
            Path::new("weights/unet/diffusion_pytorch_model.safetensors")
        );
        assert_eq!(
            weights.controlnet_weights(),
            Path::new("controlnet-cache/diffusion_pytorch_model.safetensors")
        );
    }

    #[test]
    fn missing_weights_fail_setup() {
        let dir = tempfile::tempdir().unwrap();
        let weights = WeightLocations::new(dir.path(), dir.path().join("controlnet"));
        let err = weights.ensure_present().unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
        assert!(err.to_string().contains("model.safetensors"));
    }

    #[test]
    fn present_weights_pass_setup() {
        let dir = tempfile::tempdir().unwrap();
        let weights = WeightLocations::new(dir.path().join("weights"), dir.path().join("cn"));
        for file in [
            weights.clip_weights(),
            weights.vae_weights(),
            weights.unet_weights(),
            weights.controlnet_weights(),
        ] {
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            std::fs::write(file, b"stub").unwrap();
        }
        assert!(weights.ensure_present().is_ok());
    }
}
