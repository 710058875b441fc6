use std::path::PathBuf;

use image::DynamicImage;
use tracing::debug;
use uuid::Uuid;

use crate::Result;

/// Persists generated images under a per-request uniquely named directory in
/// the system temp dir, `out-0.png` through `out-{N-1}.png` in generation
/// order. The unique directory keeps concurrent requests from ever sharing a
/// path.
pub fn persist_outputs(images: &[DynamicImage]) -> Result<Vec<PathBuf>> {
    let dir = std::env::temp_dir().join(format!("scrawl-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    let mut paths = Vec::with_capacity(images.len());
    for (idx, image) in images.iter().enumerate() {
        let path = dir.join(format!("out-{idx}.png"));
        image.save_with_format(&path, image::ImageFormat::Png)?;
        debug!(path = %path.display(), "wrote output image");
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(width: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            8,
            image::Rgb([128, 0, 255]),
        ))
    }

    #[test]
    fn outputs_are_ordered_and_distinct() -> Result<()> {
        let paths = persist_outputs(&[sample(8), sample(16), sample(24)])?;
        assert_eq!(paths.len(), 3);
        for (idx, path) in paths.iter().enumerate() {
            assert!(path.ends_with(format!("out-{idx}.png")));
            assert!(path.is_file());
        }
        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), paths.len());
        std::fs::remove_dir_all(paths[0].parent().unwrap())?;
        Ok(())
    }

    #[test]
    fn concurrent_requests_never_share_a_directory() -> Result<()> {
        let first = persist_outputs(&[sample(8)])?;
        let second = persist_outputs(&[sample(8)])?;
        assert_ne!(first[0], second[0]);
        std::fs::remove_dir_all(first[0].parent().unwrap())?;
        std::fs::remove_dir_all(second[0].parent().unwrap())?;
        Ok(())
    }

    #[test]
    fn round_trips_through_png() -> Result<()> {
        let image = sample(8);
        let paths = persist_outputs(std::slice::from_ref(&image))?;
        let restored = image::open(&paths[0])?;
        assert_eq!(restored.to_rgb8().as_raw(), image.to_rgb8().as_raw());
        std::fs::remove_dir_all(paths[0].parent().unwrap())?;
        Ok(())
    }
}
