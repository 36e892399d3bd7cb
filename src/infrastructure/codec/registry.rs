//! Ordered set of codecs consulted by the cache and the downloader.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use crate::domain::entities::{CacheKey, DecodedImage, ImageFormat};
use crate::domain::errors::ImageError;
use crate::domain::ports::{DecompressOptions, ImageCodec};

use super::raster_codec::RasterCodec;

/// Registered codecs, highest priority first.
///
/// The first codec whose `can_decode` accepts the data is used.
pub struct CodecRegistry {
    codecs: RwLock<Vec<Arc<dyn ImageCodec>>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.codecs.read().len())
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CodecRegistry {
    /// Creates a registry with no codecs.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            codecs: RwLock::new(Vec::new()),
        }
    }

    /// Creates a registry holding the built-in [`RasterCodec`].
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.add_codec(Arc::new(RasterCodec::new()));
        registry
    }

    /// Process-wide registry used by the shared cache and downloader.
    pub fn shared() -> &'static Arc<Self> {
        static SHARED: OnceLock<Arc<CodecRegistry>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::with_defaults()))
    }

    /// Registers a codec ahead of every codec already present.
    pub fn add_codec(&self, codec: Arc<dyn ImageCodec>) {
        self.codecs.write().insert(0, codec);
    }

    /// Removes every codec.
    pub fn remove_all(&self) {
        self.codecs.write().clear();
    }

    /// Number of registered codecs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.codecs.read().len()
    }

    /// Returns true if no codec is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn codec_for(&self, data: &[u8]) -> Option<Arc<dyn ImageCodec>> {
        self.codecs
            .read()
            .iter()
            .find(|codec| codec.can_decode(data))
            .cloned()
    }

    /// Decodes a complete payload with the first accepting codec.
    ///
    /// # Errors
    /// Returns `ImageError::Decode` if no codec accepts the data or decoding fails.
    pub fn decode(&self, data: &[u8]) -> Result<DecodedImage, ImageError> {
        let codec = self.codec_for(data).ok_or_else(|| {
            ImageError::decode(format!(
                "no codec accepts {} data",
                ImageFormat::sniff(data)
            ))
        })?;
        codec.decode(data)
    }

    /// Decodes bytes stored under `key`, applying the key's display scale and,
    /// when `decompress` is set, the codec's decompression.
    ///
    /// # Errors
    /// Returns `ImageError::Decode` on malformed data.
    pub fn decode_for_key(
        &self,
        data: &[u8],
        key: &CacheKey,
        decompress: Option<DecompressOptions>,
    ) -> Result<DecodedImage, ImageError> {
        let codec = self.codec_for(data).ok_or_else(|| {
            ImageError::decode(format!(
                "no codec accepts {} data",
                ImageFormat::sniff(data)
            ))
        })?;
        let image = codec.decode(data)?.with_scale(key.scale());
        Ok(match decompress {
            Some(options) => codec.decompress(image, options),
            None => image,
        })
    }

    /// Runs the decompression of the codec that accepts `data`.
    #[must_use]
    pub fn decompress(
        &self,
        image: DecodedImage,
        data: &[u8],
        options: DecompressOptions,
    ) -> DecodedImage {
        match self.codec_for(data) {
            Some(codec) => codec.decompress(image, options),
            None => image,
        }
    }

    /// Encodes with the first codec able to produce `format`.
    ///
    /// # Errors
    /// Returns `ImageError::Decode` if no codec can encode the format.
    pub fn encode(&self, image: &DecodedImage, format: ImageFormat) -> Result<Bytes, ImageError> {
        let codec = self
            .codecs
            .read()
            .iter()
            .find(|codec| codec.can_encode(format))
            .cloned()
            .ok_or_else(|| ImageError::decode(format!("no codec encodes {format}")))?;
        codec.encode(image, format)
    }

    /// Best-effort preview of a partial payload.
    #[must_use]
    pub fn incremental_decode(&self, data: &[u8], finished: bool) -> Option<DecodedImage> {
        let codec = self
            .codecs
            .read()
            .iter()
            .find(|codec| codec.can_incremental_decode(data))
            .cloned()?;
        let image = codec.incremental_decode(data, finished);
        trace!(
            bytes = data.len(),
            produced = image.is_some(),
            "Incremental decode"
        );
        image
    }
}
