use candle_core::{Result, Tensor};
use candle_nn as nn;
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::embeddings::{TimestepEmbedding, Timesteps};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::UNetMidBlock2DCrossAttn;

use super::unet::{
    build_encoder_blocks, build_mid_block, time_embedding_for, EncoderBlock, BLOCK_OUT_CHANNELS,
    LATENT_CHANNELS, LAYERS_PER_BLOCK, TIME_EMBED_DIM,
};

const CONDITIONING_CHANNELS: usize = 3;
const EMBEDDING_BLOCK_CHANNELS: [usize; 4] = [16, 32, 96, 256];

/// Residuals the conditioning model hands the denoising network: one per
/// skip connection plus the mid-block output.
pub struct ControlNetOutput {
    pub down_block_residuals: Vec<Tensor>,
    pub mid_block_residual: Tensor,
}

impl ControlNetOutput {
    /// Doubles guess-mode residuals up to a classifier-free-guidance batch,
    /// giving the unconditional half zeros.
    pub fn pad_for_guidance(self) -> Result<Self> {
        let down_block_residuals = self
            .down_block_residuals
            .iter()
            .map(|t| Tensor::cat(&[&t.zeros_like()?, t], 0))
            .collect::<Result<Vec<_>>>()?;
        let mid = &self.mid_block_residual;
        let mid_block_residual = Tensor::cat(&[&mid.zeros_like()?, mid], 0)?;
        Ok(Self {
            down_block_residuals,
            mid_block_residual,
        })
    }
}

/// Downsamples the full-resolution control image into the latent grid. The
/// final projection is zero-initialized in training so an untrained copy
/// contributes nothing.
struct ConditioningEmbedding {
    conv_in: nn::Conv2d,
    blocks: Vec<nn::Conv2d>,
    conv_out: nn::Conv2d,
}

impl ConditioningEmbedding {
    fn new(vs: nn::VarBuilder) -> Result<Self> {
        let pad = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let pad_stride = nn::Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv_in = nn::conv2d(
            CONDITIONING_CHANNELS,
            EMBEDDING_BLOCK_CHANNELS[0],
            3,
            pad,
            vs.pp("conv_in"),
        )?;
        let vs_blocks = vs.pp("blocks");
        let mut blocks = Vec::new();
        for i in 0..EMBEDDING_BLOCK_CHANNELS.len() - 1 {
            let channel_in = EMBEDDING_BLOCK_CHANNELS[i];
            let channel_out = EMBEDDING_BLOCK_CHANNELS[i + 1];
            blocks.push(nn::conv2d(channel_in, channel_in, 3, pad, vs_blocks.pp(2 * i))?);
            blocks.push(nn::conv2d(
                channel_in,
                channel_out,
                3,
                pad_stride,
                vs_blocks.pp(2 * i + 1),
            )?);
        }
        let conv_out = nn::conv2d(
            EMBEDDING_BLOCK_CHANNELS[EMBEDDING_BLOCK_CHANNELS.len() - 1],
            BLOCK_OUT_CHANNELS[0],
            3,
            pad,
            vs.pp("conv_out"),
        )?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = nn::ops::silu(&self.conv_in.forward(xs)?)?;
        for block in &self.blocks {
            xs = nn::ops::silu(&block.forward(&xs)?)?;
        }
        self.conv_out.forward(&xs)
    }
}

/// SD 1.5 ControlNet: a copy of the denoiser's encoder column that reads the
/// control image and emits zero-projected residuals for every skip
/// connection.
pub struct ControlNet {
    conv_in: nn::Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<EncoderBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    controlnet_down_blocks: Vec<nn::Conv2d>,
    controlnet_mid_block: nn::Conv2d,
}

/// Channel of each skip connection the encoder column produces, in order:
/// the conv_in state, then every resnet and downsampler state.
fn residual_channels() -> Vec<usize> {
    let mut channels = vec![BLOCK_OUT_CHANNELS[0]];
    for (i, &out) in BLOCK_OUT_CHANNELS.iter().enumerate() {
        for _ in 0..LAYERS_PER_BLOCK {
            channels.push(out);
        }
        if i < BLOCK_OUT_CHANNELS.len() - 1 {
            channels.push(out);
        }
    }
    channels
}

impl ControlNet {
    pub fn new(vs: nn::VarBuilder, use_flash_attn: bool) -> Result<Self> {
        let b_channels = BLOCK_OUT_CHANNELS[0];
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(LATENT_CHANNELS, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, true, 0.0);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, TIME_EMBED_DIM)?;
        let cond_embedding = ConditioningEmbedding::new(vs.pp("controlnet_cond_embedding"))?;
        let down_blocks = build_encoder_blocks(vs.pp("down_blocks"), use_flash_attn)?;
        let mid_block = build_mid_block(vs.pp("mid_block"), use_flash_attn)?;

        let vs_ctrl = vs.pp("controlnet_down_blocks");
        let controlnet_down_blocks = residual_channels()
            .iter()
            .enumerate()
            .map(|(i, &ch)| nn::conv2d(ch, ch, 1, Default::default(), vs_ctrl.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let last = BLOCK_OUT_CHANNELS[BLOCK_OUT_CHANNELS.len() - 1];
        let controlnet_mid_block = nn::conv2d(
            last,
            last,
            1,
            Default::default(),
            vs.pp("controlnet_mid_block"),
        )?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            mid_block,
            controlnet_down_blocks,
            controlnet_mid_block,
        })
    }

    /// Runs the encoder column over `sample` under the control image and
    /// returns the scaled residuals.
    ///
    /// In guess mode the residual ramp rises logarithmically from the
    /// shallowest skip connection to the mid block, so deep features dominate
    /// even without a prompt.
    pub fn forward(
        &self,
        sample: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        controlnet_cond: &Tensor,
        conditioning_scale: f64,
        guess_mode: bool,
    ) -> Result<ControlNetOutput> {
        let emb = time_embedding_for(sample, &self.time_proj, &self.time_embedding, timestep)?;

        let mut xs = self.conv_in.forward(sample)?;
        let cond = self.cond_embedding.forward(controlnet_cond)?;
        xs = (xs + cond)?;

        let mut states = vec![xs.clone()];
        for block in &self.down_blocks {
            let (out, block_states) = block.forward(&xs, &emb, encoder_hidden_states)?;
            xs = out;
            states.extend(block_states);
        }
        let mid = self.mid_block.forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        if states.len() != self.controlnet_down_blocks.len() {
            candle_core::bail!(
                "encoder column produced {} states for {} projections",
                states.len(),
                self.controlnet_down_blocks.len()
            )
        }

        let scales = residual_scales(states.len() + 1, conditioning_scale, guess_mode);
        let down_block_residuals = states
            .iter()
            .zip(self.controlnet_down_blocks.iter())
            .zip(scales.iter())
            .map(|((state, project), scale)| project.forward(state)? * *scale)
            .collect::<Result<Vec<_>>>()?;
        let mid_block_residual =
            (self.controlnet_mid_block.forward(&mid)? * scales[scales.len() - 1])?;

        Ok(ControlNetOutput {
            down_block_residuals,
            mid_block_residual,
        })
    }
}

fn residual_scales(count: usize, conditioning_scale: f64, guess_mode: bool) -> Vec<f64> {
    if guess_mode {
        // logspace(-1, 0): 0.1 at the first skip connection up to 1.0 at the
        // mid block.
        (0..count)
            .map(|i| 10f64.powf(i as f64 / (count - 1) as f64 - 1.0) * conditioning_scale)
            .collect()
    } else {
        vec![conditioning_scale; count]
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, IndexOp};

    use super::*;

    #[test]
    fn residual_channels_match_the_sd15_skip_layout() {
        assert_eq!(
            residual_channels(),
            vec![320, 320, 320, 320, 640, 640, 640, 1280, 1280, 1280, 1280, 1280]
        );
    }

    #[test]
    fn uniform_scales_without_guess_mode() {
        let scales = residual_scales(13, 0.5, false);
        assert_eq!(scales.len(), 13);
        assert!(scales.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn guess_mode_ramps_from_a_tenth_to_full_scale() {
        let scales = residual_scales(13, 1.0, true);
        assert!((scales[0] - 0.1).abs() < 1e-9);
        assert!((scales[12] - 1.0).abs() < 1e-9);
        assert!(scales.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn conditioning_embedding_reaches_the_latent_grid() -> Result<()> {
        let device = Device::Cpu;
        let vs = nn::VarBuilder::zeros(DType::F32, &device);
        let embedding = ConditioningEmbedding::new(vs)?;
        let cond = Tensor::zeros((1, 3, 64, 64), DType::F32, &device)?;
        let out = embedding.forward(&cond)?;
        assert_eq!(out.dims(), &[1, BLOCK_OUT_CHANNELS[0], 8, 8]);
        Ok(())
    }

    #[test]
    fn guidance_padding_doubles_the_batch() -> Result<()> {
        let device = Device::Cpu;
        let output = ControlNetOutput {
            down_block_residuals: vec![Tensor::ones((1, 320, 8, 8), DType::F32, &device)?],
            mid_block_residual: Tensor::ones((1, 1280, 1, 1), DType::F32, &device)?,
        };
        let padded = output.pad_for_guidance()?;
        assert_eq!(padded.down_block_residuals[0].dims()[0], 2);
        assert_eq!(padded.mid_block_residual.dims()[0], 2);
        // The unconditional half must stay silent.
        let uncond = padded.down_block_residuals[0].i(0)?;
        assert_eq!(uncond.abs()?.max_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }
}
