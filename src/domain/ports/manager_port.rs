//! Host hooks consulted by the image manager.

use url::Url;

use crate::domain::entities::DecodedImage;

/// Decides whether a cache miss may go to the network.
#[cfg_attr(test, mockall::automock)]
pub trait ShouldDownloadDecider: Send + Sync {
    /// Returns false to skip the download for this URL.
    fn should_download(&self, url: &Url) -> bool;
}

/// Rewrites a freshly downloaded image before it is cached.
#[cfg_attr(test, mockall::automock)]
pub trait PostDownloadTransformer: Send + Sync {
    /// Returns the image to cache and deliver in place of `image`.
    fn transform(&self, image: DecodedImage, url: &Url) -> DecodedImage;
}

/// A handle whose pending work can be abandoned.
pub trait Cancellable: Send + Sync {
    /// Cancels the work. Idempotent.
    fn cancel(&self);
}
