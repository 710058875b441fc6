use std::path::Path;

use candle_core::{DType, Device, IndexOp, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::{Error, Result};

/// The denoising network works on a latent grid an eighth of the pixel size
/// and its attention blocks expect both axes to be a multiple of 64 pixels.
const PIXEL_GRANULARITY: u32 = 64;

/// Scales `image` so its shorter side matches `resolution`, rounds both axes
/// to the nearest multiple of 64 and resamples with Lanczos. Pure function of
/// its inputs; color mode is normalized to three channels.
pub fn resize_for_condition_image(image: &DynamicImage, resolution: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let k = f64::from(resolution) / f64::from(width.min(height));
    let width = quantize(f64::from(width) * k);
    let height = quantize(f64::from(height) * k);
    let resized = image.resize_exact(width, height, FilterType::Lanczos3);
    DynamicImage::ImageRgb8(resized.to_rgb8())
}

fn quantize(dim: f64) -> u32 {
    let steps = (dim / f64::from(PIXEL_GRANULARITY)).round() as u32;
    steps.max(1) * PIXEL_GRANULARITY
}

/// Decodes the control image in memory and normalizes it to three channels.
/// Decoding in place of the caller's file keeps concurrent requests from ever
/// observing each other's image.
pub fn load_control_image(path: &Path) -> Result<DynamicImage> {
    let image = image::ImageReader::open(path)
        .map_err(|e| Error::ControlImage {
            path: path.to_path_buf(),
            source: image::ImageError::IoError(e),
        })?
        .decode()
        .map_err(|e| Error::ControlImage {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Converts an image to a `(1, 3, height, width)` tensor in `[-1, 1]`, the
/// range the autoencoder was trained on.
pub fn image_to_latent_input(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let scaled = ((to_chw_tensor(image, device)? / 127.5)? - 1.0)?;
    Ok(scaled.unsqueeze(0)?)
}

/// Converts an image to a `(1, 3, height, width)` tensor in `[0, 1]`, the
/// range the conditioning encoder expects.
pub fn image_to_control_input(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let scaled = (to_chw_tensor(image, device)? / 255.0)?;
    Ok(scaled.unsqueeze(0)?)
}

fn to_chw_tensor(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let data = rgb.into_raw();
    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    Ok(tensor)
}

/// Converts a `(3, height, width)` U8 tensor into an image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        return Err(Error::internal(format!(
            "expected an image tensor with 3 channels, got {channels}"
        )));
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::internal("tensor does not fit its image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Splits a `(batch, 3, height, width)` U8 tensor into images, one per
/// sample, preserving generation order.
pub fn tensors_to_images(batch: &Tensor) -> Result<Vec<DynamicImage>> {
    let samples = batch.dim(0)?;
    let mut images = Vec::with_capacity(samples);
    for idx in 0..samples {
        images.push(tensor_to_image(&batch.i(idx)?)?);
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([10, 20, 30]),
        ))
    }

    #[test]
    fn resize_quantizes_both_axes_to_64() {
        let resized = resize_for_condition_image(&blank(513, 777), 512);
        let (w, h) = resized.dimensions();
        assert_eq!(w % 64, 0);
        assert_eq!(h % 64, 0);
    }

    #[test]
    fn resize_keeps_aligned_input_unchanged() {
        // 512x768 at resolution 512: both axes already on the 64 grid.
        let resized = resize_for_condition_image(&blank(512, 768), 512);
        assert_eq!(resized.dimensions(), (512, 768));
    }

    #[test]
    fn resize_anchors_shorter_side() {
        let resized = resize_for_condition_image(&blank(1024, 2048), 512);
        assert_eq!(resized.dimensions(), (512, 1024));
    }

    #[test]
    fn resize_preserves_aspect_ratio_within_quantization() {
        let (w, h) = resize_for_condition_image(&blank(640, 480), 512).dimensions();
        let input_ratio = 640.0 / 480.0;
        let output_ratio = f64::from(w) / f64::from(h);
        // One 64-pixel step on either axis bounds the ratio drift.
        assert!((input_ratio - output_ratio).abs() < 64.0 / 480.0);
    }

    #[test]
    fn resize_never_collapses_below_one_step() {
        let (w, h) = resize_for_condition_image(&blank(2000, 20), 64).dimensions();
        assert!(w >= 64 && h >= 64);
    }

    #[test]
    fn latent_input_is_centered() -> Result<()> {
        let tensor = image_to_latent_input(&blank(64, 64), &Device::Cpu)?;
        assert_eq!(tensor.dims(), &[1, 3, 64, 64]);
        let max = tensor.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max <= 1.0);
        Ok(())
    }

    #[test]
    fn control_input_is_unit_range() -> Result<()> {
        let tensor = image_to_control_input(&blank(64, 32), &Device::Cpu)?;
        assert_eq!(tensor.dims(), &[1, 3, 32, 64]);
        let min = tensor.min_all()?.to_scalar::<f32>()?;
        let max = tensor.max_all()?.to_scalar::<f32>()?;
        assert!(min >= 0.0 && max <= 1.0);
        Ok(())
    }

    #[test]
    fn image_tensor_round_trip() -> Result<()> {
        let image = blank(64, 32);
        let tensor = (image_to_control_input(&image, &Device::Cpu)? * 255.0)?
            .round()?
            .to_dtype(DType::U8)?
            .i(0)?;
        let restored = tensor_to_image(&tensor)?;
        assert_eq!(restored.to_rgb8().as_raw(), image.to_rgb8().as_raw());
        Ok(())
    }

    #[test]
    fn missing_control_image_reports_path() {
        let err = load_control_image(Path::new("/nonexistent/scribble.png")).unwrap_err();
        assert!(matches!(err, Error::ControlImage { .. }));
        assert!(err.to_string().contains("scribble.png"));
    }
}
