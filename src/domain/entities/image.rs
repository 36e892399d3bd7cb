//! Domain types for cached and decoded images.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Cache fingerprint derived from an image URL.
///
/// Two URLs producing the same key are treated as the same asset by both
/// the memory and the disk store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a new `CacheKey` from any string-like input.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// File name used by the disk store: lowercase hex SHA-256 of the key.
    #[must_use]
    pub fn disk_file_name(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Display scale encoded in the key (`@2x.` / `@3x.`), 1.0 otherwise.
    #[must_use]
    pub fn scale(&self) -> f32 {
        if self.0.contains("@3x.") {
            3.0
        } else if self.0.contains("@2x.") {
            2.0
        } else {
            1.0
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Container format of encoded image bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Unknown or not yet sniffed.
    #[default]
    Undefined,
    /// JPEG.
    Jpeg,
    /// PNG.
    Png,
    /// GIF.
    Gif,
    /// TIFF.
    Tiff,
    /// WebP.
    Webp,
    /// HEIC.
    Heic,
}

impl ImageFormat {
    /// Detects the format from the leading magic bytes.
    #[must_use]
    pub fn sniff(data: &[u8]) -> Self {
        match data.first() {
            Some(0xFF) => Self::Jpeg,
            Some(0x89) => Self::Png,
            Some(0x47) => Self::Gif,
            Some(0x49 | 0x4D) => Self::Tiff,
            Some(0x52) if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" => {
                Self::Webp
            }
            Some(0x00) if data.len() >= 12 => match &data[4..12] {
                b"ftypheic" | b"ftypheix" | b"ftyphevc" | b"ftyphevx" => Self::Heic,
                _ => Self::Undefined,
            },
            _ => Self::Undefined,
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Jpeg => write!(f, "jpeg"),
            Self::Png => write!(f, "png"),
            Self::Gif => write!(f, "gif"),
            Self::Tiff => write!(f, "tiff"),
            Self::Webp => write!(f, "webp"),
            Self::Heic => write!(f, "heic"),
        }
    }
}

/// A decoded image ready for display.
///
/// Cloning is cheap: pixel data is shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: Arc<image::DynamicImage>,
    scale: f32,
    format: ImageFormat,
}

impl DecodedImage {
    /// Wraps decoded pixels at scale 1.0.
    #[must_use]
    pub fn new(pixels: image::DynamicImage, format: ImageFormat) -> Self {
        Self {
            pixels: Arc::new(pixels),
            scale: 1.0,
            format,
        }
    }

    /// Returns a copy with the given display scale.
    #[must_use]
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = if scale > 0.0 { scale } else { 1.0 };
        self
    }

    /// Decoded pixel buffer.
    #[must_use]
    pub fn pixels(&self) -> &Arc<image::DynamicImage> {
        &self.pixels
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Display scale.
    #[must_use]
    pub const fn scale(&self) -> f32 {
        self.scale
    }

    /// Format the image was decoded from.
    #[must_use]
    pub const fn format(&self) -> ImageFormat {
        self.format
    }

    /// Returns true if the pixel buffer carries an alpha channel.
    #[must_use]
    pub fn has_alpha(&self) -> bool {
        self.pixels.color().has_alpha()
    }

    /// Memory-cache weight: `width * height * scale^2`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn cost(&self) -> u64 {
        let pixels = u64::from(self.width()) * u64::from(self.height());
        let scale = f64::from(self.scale);
        (pixels as f64 * scale * scale) as u64
    }

    /// Returns true if both images share the same dimensions and pixel bytes.
    #[must_use]
    pub fn same_pixels(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
            || (self.width() == other.width()
                && self.height() == other.height()
                && self.pixels.to_rgba8().as_raw() == other.pixels.to_rgba8().as_raw())
    }
}

/// Where a returned image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    /// Not from a cache: downloaded, or nothing was found.
    #[default]
    None,
    /// In-memory store.
    Memory,
    /// On-disk store.
    Disk,
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// An image delivered to a caller together with its provenance.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// The decoded image.
    pub image: DecodedImage,
    /// Original encoded bytes, when they were at hand.
    pub data: Option<Bytes>,
    /// Which cache tier served it.
    pub source: CacheType,
}
