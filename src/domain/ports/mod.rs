mod background_port;
mod codec_port;
mod http_port;
mod manager_port;

pub use background_port::{BackgroundTaskId, BackgroundTaskPort, NoBackgroundTasks};
pub use codec_port::{DecompressOptions, ImageCodec};
pub use http_port::{CachePolicy, Credential, HttpHeaders, HttpRequest, HttpResponse, HttpSession};
pub use manager_port::{Cancellable, PostDownloadTransformer, ShouldDownloadDecider};
