use candle_core::{DType, Result, Tensor};
use candle_nn as nn;
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::embeddings::{TimestepEmbedding, Timesteps};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, CrossAttnUpBlock2D, CrossAttnUpBlock2DConfig,
    DownBlock2D, DownBlock2DConfig, UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
    UpBlock2D, UpBlock2DConfig,
};

// SD 1.5 channel plan, shared with the conditioning model so both load the
// same diffusers checkpoint layout.
pub(crate) const BLOCK_OUT_CHANNELS: [usize; 4] = [320, 640, 1280, 1280];
pub(crate) const LAYERS_PER_BLOCK: usize = 2;
pub(crate) const TIME_EMBED_DIM: usize = 1280;
pub(crate) const CROSS_ATTENTION_DIM: usize = 768;
pub(crate) const ATTENTION_HEAD_DIM: usize = 8;
pub(crate) const NORM_NUM_GROUPS: usize = 32;
pub(crate) const NORM_EPS: f64 = 1e-5;
pub(crate) const LATENT_CHANNELS: usize = 4;

pub(crate) enum EncoderBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

impl EncoderBlock {
    pub(crate) fn forward(
        &self,
        xs: &Tensor,
        temb: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        match self {
            Self::Basic(block) => block.forward(xs, Some(temb)),
            Self::CrossAttn(block) => block.forward(xs, Some(temb), Some(encoder_hidden_states)),
        }
    }
}

/// The SD 1.5 encoder column: three cross-attention blocks and an
/// attention-free deepest block, each downsampling except the last.
pub(crate) fn build_encoder_blocks(
    vs: nn::VarBuilder,
    use_flash_attn: bool,
) -> Result<Vec<EncoderBlock>> {
    let n_blocks = BLOCK_OUT_CHANNELS.len();
    (0..n_blocks)
        .map(|i| {
            let in_channels = BLOCK_OUT_CHANNELS[i.saturating_sub(1)];
            let out_channels = BLOCK_OUT_CHANNELS[i];
            let downblock = DownBlock2DConfig {
                num_layers: LAYERS_PER_BLOCK,
                resnet_eps: NORM_EPS,
                resnet_groups: NORM_NUM_GROUPS,
                add_downsample: i < n_blocks - 1,
                downsample_padding: 1,
                ..Default::default()
            };
            if i == n_blocks - 1 {
                let block = DownBlock2D::new(
                    vs.pp(i),
                    in_channels,
                    out_channels,
                    Some(TIME_EMBED_DIM),
                    downblock,
                )?;
                Ok(EncoderBlock::Basic(block))
            } else {
                let config = CrossAttnDownBlock2DConfig {
                    downblock,
                    attn_num_head_channels: ATTENTION_HEAD_DIM,
                    cross_attention_dim: CROSS_ATTENTION_DIM,
                    ..Default::default()
                };
                let block = CrossAttnDownBlock2D::new(
                    vs.pp(i),
                    in_channels,
                    out_channels,
                    Some(TIME_EMBED_DIM),
                    use_flash_attn,
                    config,
                )?;
                Ok(EncoderBlock::CrossAttn(block))
            }
        })
        .collect()
}

pub(crate) fn build_mid_block(
    vs: nn::VarBuilder,
    use_flash_attn: bool,
) -> Result<UNetMidBlock2DCrossAttn> {
    let config = UNetMidBlock2DCrossAttnConfig {
        resnet_eps: NORM_EPS,
        resnet_groups: Some(NORM_NUM_GROUPS),
        attn_num_head_channels: ATTENTION_HEAD_DIM,
        cross_attn_dim: CROSS_ATTENTION_DIM,
        ..Default::default()
    };
    UNetMidBlock2DCrossAttn::new(
        vs,
        BLOCK_OUT_CHANNELS[BLOCK_OUT_CHANNELS.len() - 1],
        Some(TIME_EMBED_DIM),
        use_flash_attn,
        config,
    )
}

pub(crate) fn time_embedding_for(
    xs: &Tensor,
    time_proj: &Timesteps,
    time_embedding: &TimestepEmbedding,
    timestep: f64,
) -> Result<Tensor> {
    let bsize = xs.dim(0)?;
    let t = (Tensor::ones(bsize, DType::F32, xs.device())? * timestep)?;
    let t = time_proj.forward(&t)?.to_dtype(xs.dtype())?;
    time_embedding.forward(&t)
}

enum DecoderBlock {
    Basic(UpBlock2D),
    CrossAttn(CrossAttnUpBlock2D),
}

/// The denoising network with conditioning residuals spliced in.
///
/// The blocks themselves are the engine's; this assembly only exists because
/// the engine's stock UNet has no inputs for the per-skip residuals the
/// conditioning model produces.
pub struct ControlledUnet {
    conv_in: nn::Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<EncoderBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    up_blocks: Vec<DecoderBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2d,
}

impl ControlledUnet {
    pub fn new(vs: nn::VarBuilder, use_flash_attn: bool) -> Result<Self> {
        let n_blocks = BLOCK_OUT_CHANNELS.len();
        let b_channels = BLOCK_OUT_CHANNELS[0];
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(LATENT_CHANNELS, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, true, 0.0);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, TIME_EMBED_DIM)?;
        let down_blocks = build_encoder_blocks(vs.pp("down_blocks"), use_flash_attn)?;
        let mid_block = build_mid_block(vs.pp("mid_block"), use_flash_attn)?;

        let vs_up = vs.pp("up_blocks");
        let mut up_blocks = Vec::with_capacity(n_blocks);
        for i in 0..n_blocks {
            let out_channels = BLOCK_OUT_CHANNELS[n_blocks - 1 - i];
            let prev_output_channels = if i > 0 {
                BLOCK_OUT_CHANNELS[n_blocks - i]
            } else {
                BLOCK_OUT_CHANNELS[n_blocks - 1]
            };
            let in_channels = {
                let index = if i == n_blocks - 1 { 0 } else { n_blocks - i - 2 };
                BLOCK_OUT_CHANNELS[index]
            };
            let upblock = UpBlock2DConfig {
                num_layers: LAYERS_PER_BLOCK + 1,
                resnet_eps: NORM_EPS,
                resnet_groups: NORM_NUM_GROUPS,
                add_upsample: i < n_blocks - 1,
                ..Default::default()
            };
            let block = if i == 0 {
                DecoderBlock::Basic(UpBlock2D::new(
                    vs_up.pp(i),
                    in_channels,
                    prev_output_channels,
                    out_channels,
                    Some(TIME_EMBED_DIM),
                    upblock,
                )?)
            } else {
                let config = CrossAttnUpBlock2DConfig {
                    upblock,
                    attn_num_head_channels: ATTENTION_HEAD_DIM,
                    cross_attention_dim: CROSS_ATTENTION_DIM,
                    ..Default::default()
                };
                DecoderBlock::CrossAttn(CrossAttnUpBlock2D::new(
                    vs_up.pp(i),
                    in_channels,
                    prev_output_channels,
                    out_channels,
                    Some(TIME_EMBED_DIM),
                    use_flash_attn,
                    config,
                )?)
            };
            up_blocks.push(block);
        }

        let conv_norm_out =
            nn::group_norm(NORM_NUM_GROUPS, b_channels, NORM_EPS, vs.pp("conv_norm_out"))?;
        let conv_out = nn::conv2d(b_channels, LATENT_CHANNELS, 3, conv_cfg, vs.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
        })
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        down_block_residuals: &[Tensor],
        mid_block_residual: &Tensor,
    ) -> Result<Tensor> {
        let emb = time_embedding_for(xs, &self.time_proj, &self.time_embedding, timestep)?;

        let mut xs = self.conv_in.forward(xs)?;
        let mut skip_connections = vec![xs.clone()];
        for block in &self.down_blocks {
            let (out, states) = block.forward(&xs, &emb, encoder_hidden_states)?;
            xs = out;
            skip_connections.extend(states);
        }

        if skip_connections.len() != down_block_residuals.len() {
            candle_core::bail!(
                "expected {} conditioning residuals, got {}",
                skip_connections.len(),
                down_block_residuals.len()
            )
        }
        let mut skip_connections = skip_connections
            .iter()
            .zip(down_block_residuals.iter())
            .map(|(skip, residual)| skip + residual)
            .collect::<Result<Vec<_>>>()?;

        let xs = self.mid_block.forward(&xs, Some(&emb), Some(encoder_hidden_states))?;
        let mut xs = (xs + mid_block_residual)?;

        let n_blocks = self.up_blocks.len();
        let mut upsample_size = None;
        for (i, block) in self.up_blocks.iter().enumerate() {
            let n_resnets = LAYERS_PER_BLOCK + 1;
            let res = skip_connections.split_off(skip_connections.len() - n_resnets);
            if i < n_blocks - 1 {
                match skip_connections.last() {
                    Some(last) => {
                        let (_, _, h, w) = last.dims4()?;
                        upsample_size = Some((h, w));
                    }
                    None => candle_core::bail!("skip connections exhausted in the decoder"),
                }
            }
            xs = match block {
                DecoderBlock::Basic(b) => b.forward(&xs, &res, Some(&emb), upsample_size)?,
                DecoderBlock::CrossAttn(b) => {
                    b.forward(&xs, &res, Some(&emb), upsample_size, Some(encoder_hidden_states))?
                }
            };
        }

        let xs = self.conv_norm_out.forward(&xs)?;
        let xs = nn::ops::silu(&xs)?;
        self.conv_out.forward(&xs)
    }
}
