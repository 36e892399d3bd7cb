//! Port definition for image codecs.

use bytes::Bytes;

use crate::domain::entities::{DecodedImage, ImageFormat};
use crate::domain::errors::ImageError;

/// Options for [`ImageCodec::decompress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecompressOptions {
    /// Downsample before expanding when the full image would be too large.
    pub scale_down_large_images: bool,
}

/// Decodes and encodes image bytes.
///
/// Implementations are invoked from I/O and blocking worker threads only,
/// never from the caller's hot path, and must be thread-safe.
pub trait ImageCodec: Send + Sync {
    /// Returns true if this codec understands the data.
    fn can_decode(&self, data: &[u8]) -> bool;

    /// Decodes a complete payload.
    ///
    /// # Errors
    /// Returns `ImageError::Decode` on malformed data.
    fn decode(&self, data: &[u8]) -> Result<DecodedImage, ImageError>;

    /// Expands a decoded image into a display-ready buffer.
    fn decompress(&self, image: DecodedImage, options: DecompressOptions) -> DecodedImage;

    /// Returns true if this codec can produce the given format.
    fn can_encode(&self, format: ImageFormat) -> bool;

    /// Encodes an image.
    ///
    /// # Errors
    /// Returns `ImageError::Decode` if the image cannot be encoded.
    fn encode(&self, image: &DecodedImage, format: ImageFormat) -> Result<Bytes, ImageError>;

    /// Returns true if partial payloads can be previewed.
    fn can_incremental_decode(&self, _data: &[u8]) -> bool {
        false
    }

    /// Best-effort decode of a partial payload.
    fn incremental_decode(&self, _data: &[u8], _finished: bool) -> Option<DecodedImage> {
        None
    }
}
