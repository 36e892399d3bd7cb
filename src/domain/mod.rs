//! Domain layer with core image entities, errors and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CacheKey, CacheType, DecodedImage, ImageFormat, ImageOptions, LoadedImage};
pub use errors::{ImageError, TransportKind};
pub use ports::{Cancellable, HttpSession, ImageCodec};
