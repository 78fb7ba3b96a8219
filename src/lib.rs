//! Extract the filesystem of container images to local directories.
//!
//! Images are copied to a local cache (an OCI image layout for every
//! image), and then the layers of every platform are extracted to the
//! destination directory.
//!
//! ```no_run
//! # use undock::*;
//! let source = Source::parse("docker://alpine:latest")?;
//! let cache_dir = config::cache_dir(None)?;
//!
//! let extractor = Extractor::from(ImageExtractor::new(source, "rootfs", cache_dir));
//! extractor.extract(&CancelToken::new())?;
//! # Ok::<(), UndockError>(())
//! ```

mod digest;
mod fs;
mod http;

pub mod cache;
pub mod cancel;
pub mod config;
pub mod credentials;
pub mod daemon;
pub mod extract;
pub mod manifests;
pub mod platform;
pub mod reference;
pub mod source;
pub mod unpacker;

pub use cancel::CancelToken;
pub use config::ConfigError;
pub use digest::{Digest, DigestAlgorithm, DigestError, DigestMismatch};
pub use extract::{extract_blob, ExtractError, Includes};
pub use http::HttpError;
pub use platform::Platform;
pub use reference::{MediaType, Reference};
pub use source::{Scheme, Source, SourceError};
pub use unpacker::{Extractor, ImageExtractor};

use std::{io, path::PathBuf};

/// Errors from any stage of an extraction.
#[derive(thiserror::Error, Debug)]
pub enum UndockError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Cannot copy the image to the cache: {0}")]
    Fetch(#[from] cache::FetchError),

    #[error(transparent)]
    Manifest(#[from] manifests::ManifestError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("Cannot prepare destination {1}: {0}")]
    Destination(io::Error, PathBuf),
}

impl UndockError {
    /// Check if the error was caused by a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            UndockError::Fetch(cache::FetchError::Cancelled)
                | UndockError::Extract(ExtractError::Cancelled)
        )
    }
}
