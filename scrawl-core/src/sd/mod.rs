use anyhow::Context;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{self, StableDiffusionConfig};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod controlnet;
mod unet;

pub use controlnet::{ControlNet, ControlNetOutput};
pub use unet::ControlledUnet;

use crate::device::{seed_device, select_best_device, DeviceMap};
use crate::loader::Loader;
use crate::weights::WeightLocations;
use crate::{image_prep, Error, PipelineLike, PredictRequest, Result, CONDITION_RESOLUTION};

/// Scaling between the autoencoder's latent space and the denoiser's.
const VAE_SCALE: f64 = 0.18215;

/// Hub repository carrying the CLIP tokenizer used by SD 1.5 checkpoints.
const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

fn use_flash_attn() -> bool {
    cfg!(feature = "flash-attn")
}

/// The loaded engine: every sub-model GPU-resident at half precision, text
/// encoding at full precision. One instance serves the whole process.
pub struct ScribblePipeline {
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    clip_config: stable_diffusion::clip::Config,
    text_encoder: stable_diffusion::clip::ClipTextTransformer,
    vae: stable_diffusion::vae::AutoEncoderKL,
    unet: ControlledUnet,
    controlnet: ControlNet,
}

pub struct ScribbleLoader;

impl Loader for ScribbleLoader {
    type Pipeline = ScribblePipeline;

    async fn load(
        weights: WeightLocations,
        api: Api,
        device_map: DeviceMap,
    ) -> Result<ScribblePipeline> {
        let start = std::time::Instant::now();
        weights.ensure_present()?;

        let device = select_best_device(device_map)?;
        let dtype = DType::F16;
        let sd_config = StableDiffusionConfig::v1_5(None, None, None);

        let tokenizer_file = match weights.tokenizer_file() {
            Some(path) => path.to_path_buf(),
            None => {
                let local = weights.local_tokenizer();
                if local.is_file() {
                    local
                } else {
                    info!("fetching clip tokenizer from the hub");
                    api.model(CLIP_TOKENIZER_REPO.to_string())
                        .get("tokenizer.json")
                        .await
                        .context("failed to fetch clip tokenizer")?
                }
            }
        };
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load clip tokenizer")?;

        info!("loading text encoder");
        let text_encoder = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            weights.clip_weights(),
            &device,
            DType::F32,
        )
        .context("failed to load text encoder")?;

        info!("loading autoencoder");
        let vae = sd_config
            .build_vae(weights.vae_weights(), &device, dtype)
            .context("failed to load autoencoder")?;

        info!("loading denoising network");
        let unet_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[weights.unet_weights()],
                dtype,
                &device,
            )
            .context("failed to build unet var builder")?
        };
        let unet =
            ControlledUnet::new(unet_vb, use_flash_attn()).context("failed to load unet")?;

        info!("loading conditioning model");
        let controlnet_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[weights.controlnet_weights()],
                dtype,
                &device,
            )
            .context("failed to build conditioning var builder")?
        };
        let controlnet = ControlNet::new(controlnet_vb, use_flash_attn())
            .context("failed to load conditioning model")?;

        info!(elapsed = ?start.elapsed(), "pipeline ready");
        Ok(ScribblePipeline {
            device,
            dtype,
            tokenizer,
            clip_config: sd_config.clip,
            text_encoder,
            vae,
            unet,
            controlnet,
        })
    }
}

impl ScribblePipeline {
    fn pad_id(&self) -> Result<u32> {
        let vocab = self.tokenizer.get_vocab(true);
        let token = match &self.clip_config.pad_with {
            Some(padding) => padding.as_str(),
            None => "<|endoftext|>",
        };
        vocab
            .get(token)
            .copied()
            .ok_or_else(|| Error::internal(format!("tokenizer vocabulary is missing {token}")))
    }

    fn encode_prompt(&self, text: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        let max_len = self.clip_config.max_position_embeddings;
        if tokens.len() > max_len {
            return Err(Error::validation(format!(
                "prompt is too long: {} tokens, the text encoder takes at most {max_len}",
                tokens.len()
            )));
        }
        tokens.resize(max_len, self.pad_id()?);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_encoder.forward(&tokens)?)
    }

    /// CLIP-encodes the prompt pair. Under classifier-free guidance the
    /// unconditional embedding comes first, matching the batch layout of the
    /// denoise loop.
    fn encode_prompts(
        &self,
        prompt: &str,
        negative_prompt: &str,
        use_guidance: bool,
    ) -> Result<Tensor> {
        let cond = self.encode_prompt(prompt)?;
        let embeddings = if use_guidance {
            let uncond = self.encode_prompt(negative_prompt)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }
}

impl PipelineLike for ScribblePipeline {
    fn run(&self, request: PredictRequest) -> Result<Vec<DynamicImage>> {
        request.validate()?;
        let seed = seed_device(&self.device, request.seed)?;
        info!(
            seed,
            scheduler = %request.scheduler,
            steps = request.steps,
            guess_mode = request.guess_mode,
            "starting prediction"
        );

        let control = image_prep::load_control_image(&request.image)?;
        let control = image_prep::resize_for_condition_image(&control, CONDITION_RESOLUTION);

        let use_guidance = request.guidance_scale > 1.0;
        let text_embeddings =
            self.encode_prompts(&request.prompt, &request.negative_prompt, use_guidance)?;

        // The resized control image doubles as the img2img init image, so
        // latents and residuals share one grid.
        let init_input =
            image_prep::image_to_latent_input(&control, &self.device)?.to_dtype(self.dtype)?;
        let control_input =
            image_prep::image_to_control_input(&control, &self.device)?.to_dtype(self.dtype)?;

        let mut sampler = request.scheduler.build(request.steps);
        let timesteps = sampler.timesteps().to_vec();
        let t_start = request.steps - (request.steps as f64 * request.strength) as usize;

        let latent_dist = self.vae.encode(&init_input)?;
        let latents = (latent_dist.sample()? * VAE_SCALE)?;
        let mut latents = if t_start < timesteps.len() {
            let noise = latents.randn_like(0.0, 1.0)?;
            sampler.add_noise(&latents, noise, timesteps[t_start])?
        } else {
            latents
        };

        let batched_control = if use_guidance {
            Tensor::cat(&[&control_input, &control_input], 0)?
        } else {
            control_input.clone()
        };

        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            if timestep_index < t_start {
                continue;
            }
            debug!(
                timestep,
                step = timestep_index + 1,
                of = timesteps.len(),
                "denoising"
            );

            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = sampler.scale_model_input(latent_input, timestep)?;

            let residuals = if request.guess_mode && use_guidance {
                // Guess mode: the conditioning model sees only the
                // conditional half and the unconditional half gets zeros.
                let cond_latent = sampler.scale_model_input(latents.clone(), timestep)?;
                let cond_embeddings = text_embeddings.i(1)?.unsqueeze(0)?;
                self.controlnet
                    .forward(
                        &cond_latent,
                        timestep as f64,
                        &cond_embeddings,
                        &control_input,
                        request.conditioning_scale,
                        true,
                    )?
                    .pad_for_guidance()?
            } else {
                self.controlnet.forward(
                    &latent_input,
                    timestep as f64,
                    &text_embeddings,
                    &batched_control,
                    request.conditioning_scale,
                    request.guess_mode,
                )?
            };

            let noise_pred = self.unet.forward(
                &latent_input,
                timestep as f64,
                &text_embeddings,
                &residuals.down_block_residuals,
                &residuals.mid_block_residual,
            )?;

            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                (&chunks[0] + ((&chunks[1] - &chunks[0])? * request.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = sampler.step(&noise_pred, timestep, &latents)?;
        }

        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let pixels = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let images = image_prep::tensors_to_images(&pixels)?;
        info!(outputs = images.len(), "prediction complete");
        Ok(images)
    }
}
