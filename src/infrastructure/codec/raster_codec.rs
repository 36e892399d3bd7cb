//! Codec backed by the `image` crate.

use std::io::Cursor;

use bytes::Bytes;
use image::DynamicImage;
use image::imageops::FilterType;
use tracing::{debug, trace};

use crate::domain::entities::{DecodedImage, ImageFormat};
use crate::domain::errors::ImageError;
use crate::domain::ports::{DecompressOptions, ImageCodec};

/// Pixel budget above which `scale_down_large_images` downsamples
/// (60 MB of 4-byte pixels).
pub const MAX_DECODED_PIXELS: u64 = 60 * 1024 * 1024 / 4;

/// Decodes PNG, JPEG, GIF, WebP and TIFF.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterCodec;

impl RasterCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

const fn to_image_format(format: ImageFormat) -> Option<image::ImageFormat> {
    match format {
        ImageFormat::Png => Some(image::ImageFormat::Png),
        ImageFormat::Jpeg => Some(image::ImageFormat::Jpeg),
        ImageFormat::Gif => Some(image::ImageFormat::Gif),
        ImageFormat::Webp => Some(image::ImageFormat::WebP),
        ImageFormat::Tiff => Some(image::ImageFormat::Tiff),
        ImageFormat::Heic | ImageFormat::Undefined => None,
    }
}

/// Dimensions that fit `budget` pixels while keeping the aspect ratio,
/// or `None` if the image already fits.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scaled_dimensions(width: u32, height: u32, budget: u64) -> Option<(u32, u32)> {
    let total = u64::from(width) * u64::from(height);
    if total <= budget {
        return None;
    }
    let ratio = (budget as f64 / total as f64).sqrt();
    let target_w = ((f64::from(width) * ratio) as u32).max(1);
    let target_h = ((f64::from(height) * ratio) as u32).max(1);
    Some((target_w, target_h))
}

impl ImageCodec for RasterCodec {
    fn can_decode(&self, data: &[u8]) -> bool {
        image::guess_format(data).is_ok()
    }

    fn decode(&self, data: &[u8]) -> Result<DecodedImage, ImageError> {
        if data.is_empty() {
            return Err(ImageError::decode("image data is empty"));
        }
        let pixels = image::load_from_memory(data)
            .map_err(|e| ImageError::decode(format!("failed to decode image: {e}")))?;
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(ImageError::decode("decoded image has 0 pixels"));
        }
        Ok(DecodedImage::new(pixels, ImageFormat::sniff(data)))
    }

    fn decompress(&self, image: DecodedImage, options: DecompressOptions) -> DecodedImage {
        let (width, height) = (image.width(), image.height());

        if options.scale_down_large_images
            && let Some((target_w, target_h)) =
                scaled_dimensions(width, height, MAX_DECODED_PIXELS)
        {
            debug!(
                width,
                height, target_w, target_h, "Scaling down large image before decompression"
            );
            let resized = image
                .pixels()
                .resize_exact(target_w, target_h, FilterType::Triangle);
            return DecodedImage::new(resized, image.format()).with_scale(image.scale());
        }

        match image.pixels().as_ref() {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => image,
            other => {
                trace!(color = ?other.color(), "Expanding image to RGBA8");
                DecodedImage::new(DynamicImage::ImageRgba8(other.to_rgba8()), image.format())
                    .with_scale(image.scale())
            }
        }
    }

    fn can_encode(&self, format: ImageFormat) -> bool {
        format == ImageFormat::Undefined || to_image_format(format).is_some()
    }

    fn encode(&self, image: &DecodedImage, format: ImageFormat) -> Result<Bytes, ImageError> {
        let format = match format {
            ImageFormat::Undefined if image.has_alpha() => ImageFormat::Png,
            ImageFormat::Undefined => ImageFormat::Jpeg,
            other => other,
        };
        let target = to_image_format(format)
            .ok_or_else(|| ImageError::decode(format!("cannot encode to {format}")))?;

        let pixels = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.pixels().to_rgb8()),
            _ => DynamicImage::ImageRgba8(image.pixels().to_rgba8()),
        };

        let mut buffer = Cursor::new(Vec::new());
        pixels
            .write_to(&mut buffer, target)
            .map_err(|e| ImageError::decode(format!("failed to encode {format}: {e}")))?;
        Ok(Bytes::from(buffer.into_inner()))
    }

    fn can_incremental_decode(&self, data: &[u8]) -> bool {
        matches!(
            ImageFormat::sniff(data),
            ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Gif | ImageFormat::Webp
        )
    }

    /// Decodes whatever is decodable. Until the payload decodes in full,
    /// yields a blank canvas of the size announced in the header.
    fn incremental_decode(&self, data: &[u8], finished: bool) -> Option<DecodedImage> {
        if let Ok(image) = self.decode(data) {
            return Some(image);
        }
        if finished {
            return None;
        }
        let (width, height) = image::ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(DecodedImage::new(
            DynamicImage::new_rgba8(width, height),
            ImageFormat::sniff(data),
        ))
    }
}
