//! Image codecs.

pub mod raster_codec;
pub mod registry;

pub use raster_codec::{MAX_DECODED_PIXELS, RasterCodec};
pub use registry::CodecRegistry;
