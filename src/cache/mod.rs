//! Local cache of images.
//!
//! Every image is copied once to `<cache_root>/<key>`, as an OCI image
//! layout. Blobs already present in the layout are never copied again.

mod archive;
mod key;
mod layout;
mod registry;

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
};

use crate::{
    cancel::{is_cancellation, CancelToken},
    config::USER_AGENT,
    credentials::{self, Credentials},
    daemon::{DaemonClient, DaemonError},
    digest::{Digest, DigestError, DigestMismatch},
    http::HttpError,
    manifests::{guess_media_type, Descriptor, ImageIndex, ImageManifest, ManifestError},
    platform::Platform,
    source::{Locator, Scheme, Source},
};

pub use key::CacheKey;
pub use layout::{Layout, REF_NAME_ANNOTATION};

use archive::DockerArchiveSource;
use layout::LayoutSource;
use registry::RegistrySource;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("Registry request failed: {0}")]
    Http(#[from] HttpError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("I/O error in {1}: {0}")]
    Io(io::Error, PathBuf),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid digest: {0}")]
    InvalidDigest(#[from] DigestError),

    #[error("No image for platform {0}.")]
    MissingPlatform(Platform),

    #[error("No transport available for {0} sources.")]
    UnsupportedTransport(Scheme),

    #[error("Invalid data for {1}: {0}")]
    DigestMismatch(String, PathBuf),

    #[error("Image {0:?} not found in {1}.")]
    ImageNotFound(String, PathBuf),

    #[error("Invalid image archive: {0}")]
    InvalidArchive(String),

    #[error("Copy cancelled.")]
    Cancelled,
}

impl FetchError {
    /// Attach a path to an I/O error.
    ///
    /// Cancellations and digest mismatches get their own variants.
    pub(crate) fn io(error: io::Error, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_owned();

        if is_cancellation(&error) {
            FetchError::Cancelled
        } else if DigestMismatch::find(&error).is_some() {
            FetchError::DigestMismatch(error.to_string(), path)
        } else {
            FetchError::Io(error, path)
        }
    }
}

/// Settings to access the source of an image.
#[derive(Clone, Debug)]
pub struct AccessContext {
    /// Platform to select when the image is an index.
    pub platform: Platform,

    /// Skip certificate verification, and allow plain HTTP fallback.
    pub insecure: bool,

    pub user_agent: String,

    /// Credentials for the registry.
    ///
    /// If `None`, [`fetch`] looks for them in the auth files.
    pub credentials: Option<Credentials>,
}

impl Default for AccessContext {
    fn default() -> Self {
        AccessContext {
            platform: Platform::host(),
            insecure: false,
            user_agent: USER_AGENT.to_owned(),
            credentials: None,
        }
    }
}

/// An image in the cache.
#[derive(Debug)]
pub struct CachedImage {
    /// Directory of the layout.
    pub dir: PathBuf,

    /// The manifest returned by the copy: the index when all platforms
    /// are copied, or the manifest of a single image.
    pub manifest: Vec<u8>,
}

/// Transport to read an image.
pub(crate) trait ImageSource {
    /// Manifest or index of the image.
    fn top_manifest(&self) -> Result<Vec<u8>, FetchError>;

    /// Manifest referenced by an index.
    fn manifest(&self, digest: &Digest) -> Result<Vec<u8>, FetchError>;

    fn blob(&self, digest: &Digest) -> Result<Box<dyn Read + '_>, FetchError>;
}

/// Copy the image in `source` to the cache.
///
/// If `all` is `false` and the image is an index, only the manifest for
/// the platform in `context` is copied.
pub fn fetch(
    source: &Source,
    context: &AccessContext,
    all: bool,
    cache_root: &Path,
    token: &CancelToken,
) -> Result<CachedImage, FetchError> {
    if let Locator::Opaque(_) = source.locator() {
        return Err(FetchError::UnsupportedTransport(source.scheme()));
    }

    let context = with_registry_credentials(source, context);

    let key = CacheKey::compute(source, &context)?;
    let dir = cache_root.join(key.as_str());

    tracing::info!(%key, transport = %source.transport_name(), "Copying image to cache");

    let layout = Layout::create(&dir)?;
    let copy = |image: &dyn ImageSource| copy_image(image, &layout, &context.platform, all, token);

    let manifest = match source.locator() {
        Locator::Registry(reference) => copy(&RegistrySource::new(reference, &context)?)?,

        Locator::Path { path, reference } => {
            let reference = reference.as_deref();

            match source.scheme() {
                Scheme::Oci => copy(&LayoutSource::open(path, reference)?)?,

                Scheme::OciArchive => {
                    let staged = archive::stage_file(path, cache_root, token)?;
                    copy(&LayoutSource::open(staged.path(), reference)?)?
                }

                Scheme::DockerArchive => {
                    let staged = archive::stage_file(path, cache_root, token)?;
                    copy(&DockerArchiveSource::open(staged.path(), reference)?)?
                }

                scheme => return Err(FetchError::UnsupportedTransport(scheme)),
            }
        }

        Locator::Daemon(image) => {
            let client = DaemonClient::from_env()?;
            tracing::debug!(
                socket = %client.socket().display(),
                "Exporting image from the daemon"
            );

            let export = client.export(&image.api_name())?;
            let staged = archive::stage(export, cache_root, token)?;
            copy(&DockerArchiveSource::open(staged.path(), None)?)?
        }

        Locator::Opaque(_) => return Err(FetchError::UnsupportedTransport(source.scheme())),
    };

    Ok(CachedImage { dir, manifest })
}

/// Add the credentials for the registry of `docker` sources, if they
/// are not already in `context`.
fn with_registry_credentials(source: &Source, context: &AccessContext) -> AccessContext {
    let mut context = context.clone();

    let Some(reference) = source.registry_reference() else {
        return context;
    };

    if context.credentials.is_none() {
        match credentials::lookup(&reference.domain) {
            Ok(found) => {
                if found.is_some() {
                    tracing::debug!(domain = %reference.domain, "Using registry credentials");
                }

                context.credentials = found;
            }

            Err(e) => tracing::warn!(domain = %reference.domain, "Cannot get credentials: {e}"),
        }
    }

    context
}

/// Copy the image from `source` to `layout`.
///
/// Returns the bytes of the manifest recorded in `index.json`.
fn copy_image(
    source: &dyn ImageSource,
    layout: &Layout,
    platform: &Platform,
    all: bool,
    token: &CancelToken,
) -> Result<Vec<u8>, FetchError> {
    let top = source.top_manifest()?;
    let top_type = guess_media_type(&top)?;
    let top_digest = Digest::sha256(&top);

    if top_type.is_manifest() {
        copy_manifest(source, layout, &top_digest, &top, token)?;
        layout.write_index(Descriptor::new(top_type, top_digest, top.len() as u64))?;
        return Ok(top);
    }

    let index: ImageIndex = serde_json::from_slice(&top)?;

    if all {
        for entry in &index.manifests {
            let manifest = source.manifest(&entry.digest)?;
            copy_manifest(source, layout, &entry.digest, &manifest, token)?;
        }

        store_bytes(layout, &top_digest, &top, token)?;
        layout.write_index(Descriptor::new(top_type, top_digest, top.len() as u64))?;
        return Ok(top);
    }

    let Some(entry) = index
        .manifests
        .into_iter()
        .find(|e| e.platform.as_ref().is_some_and(|p| p.satisfies(platform)))
    else {
        return Err(FetchError::MissingPlatform(platform.clone()));
    };

    tracing::debug!(%platform, manifest = %entry.digest, "Platform selected from index");

    let manifest = source.manifest(&entry.digest)?;
    copy_manifest(source, layout, &entry.digest, &manifest, token)?;
    layout.write_index(entry)?;

    Ok(manifest)
}

/// Copy the config and the layers of an image manifest, and then the
/// manifest itself.
fn copy_manifest(
    source: &dyn ImageSource,
    layout: &Layout,
    digest: &Digest,
    manifest: &[u8],
    token: &CancelToken,
) -> Result<(), FetchError> {
    if !guess_media_type(manifest)?.is_manifest() {
        return Err(ManifestError::UnknownMediaType(format!("nested index {digest}")).into());
    }

    let parsed: ImageManifest = serde_json::from_slice(manifest)?;

    for blob in [&parsed.config].into_iter().chain(&parsed.layers) {
        if layout.has_blob(&blob.digest) {
            tracing::debug!(blob = %blob.digest, "Blob already in cache");
            continue;
        }

        token.check().map_err(|e| FetchError::io(e, layout.dir()))?;
        layout.write_blob(&blob.digest, source.blob(&blob.digest)?, token)?;
    }

    store_bytes(layout, digest, manifest, token)
}

fn store_bytes(
    layout: &Layout,
    digest: &Digest,
    data: &[u8],
    token: &CancelToken,
) -> Result<(), FetchError> {
    if !layout.has_blob(digest) {
        layout.write_blob(digest, data, token)?;
    }

    Ok(())
}

/// Check that `manifest` matches `digest`.
pub(crate) fn verify_manifest(digest: &Digest, manifest: &[u8]) -> Result<(), FetchError> {
    io::copy(&mut digest.wrap_reader(manifest), &mut io::sink())
        .map_err(|e| FetchError::io(e, format!("manifest {digest}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MediaType;
    use std::collections::HashMap;

    /// Image source with all data in memory, counting blob requests.
    #[derive(Default)]
    struct MemorySource {
        top: Vec<u8>,
        blobs: HashMap<Digest, Vec<u8>>,
        requests: std::cell::Cell<usize>,
    }

    impl MemorySource {
        fn add(&mut self, data: impl Into<Vec<u8>>) -> Digest {
            let data = data.into();
            let digest = Digest::sha256(&data);
            self.blobs.insert(digest.clone(), data);
            digest
        }

        fn add_manifest(&mut self, layer: &str) -> Descriptor {
            let config = self.add("{}");
            let layer = self.add(layer);

            let manifest = ImageManifest {
                schema_version: 2,
                media_type: None,
                config: Descriptor::new(MediaType::OciConfig, config, 2),
                layers: vec![Descriptor::new(MediaType::OciFsTar, layer, 1)],
            };

            let manifest = serde_json::to_vec(&manifest).unwrap();
            let size = manifest.len() as u64;
            Descriptor::new(MediaType::OciManifestV1, self.add(manifest), size)
        }
    }

    impl ImageSource for MemorySource {
        fn top_manifest(&self) -> Result<Vec<u8>, FetchError> {
            Ok(self.top.clone())
        }

        fn manifest(&self, digest: &Digest) -> Result<Vec<u8>, FetchError> {
            Ok(self.blobs[digest].clone())
        }

        fn blob(&self, digest: &Digest) -> Result<Box<dyn Read + '_>, FetchError> {
            self.requests.set(self.requests.get() + 1);
            Ok(Box::new(&self.blobs[digest][..]))
        }
    }

    fn index_source() -> (MemorySource, [Descriptor; 2]) {
        let mut source = MemorySource::default();

        let mut amd64 = source.add_manifest("amd64 layer");
        amd64.platform = Some(Platform::new("linux", "amd64", None));

        let mut arm64 = source.add_manifest("arm64 layer");
        arm64.platform = Some(Platform::new("linux", "arm64", Some("v8")));

        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(MediaType::OciImageIndex.to_string()),
            manifests: vec![amd64.clone(), arm64.clone()],
        };

        source.top = serde_json::to_vec(&index).unwrap();
        (source, [amd64, arm64])
    }

    fn read_index(dir: &Path) -> ImageIndex {
        serde_json::from_slice(&std::fs::read(dir.join("index.json")).unwrap()).unwrap()
    }

    #[test]
    fn copy_single_platform() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::create(dir.path()).unwrap();
        let (source, [_, arm64]) = index_source();
        let token = CancelToken::new();

        let wanted = Platform::new("linux", "arm64", None);
        let manifest = copy_image(&source, &layout, &wanted, false, &token).unwrap();

        assert_eq!(Digest::sha256(&manifest), arm64.digest);
        assert_eq!(read_index(dir.path()).manifests, [arm64]);

        // Config and layer.
        assert_eq!(source.requests.get(), 2);
        assert!(layout.has_blob(&Digest::sha256("arm64 layer")));
        assert!(!layout.has_blob(&Digest::sha256("amd64 layer")));

        // Everything is skipped in a second copy.
        copy_image(&source, &layout, &wanted, false, &token).unwrap();
        assert_eq!(source.requests.get(), 2);

        assert!(matches!(
            copy_image(&source, &layout, &Platform::new("linux", "s390x", None), false, &token),
            Err(FetchError::MissingPlatform(_))
        ));
    }

    #[test]
    fn copy_all_platforms() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::create(dir.path()).unwrap();
        let (source, entries) = index_source();

        let manifest =
            copy_image(&source, &layout, &Platform::host(), true, &CancelToken::new()).unwrap();

        assert_eq!(manifest, source.top);

        let index = read_index(dir.path());
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.manifests[0].digest, Digest::sha256(&source.top));

        // The same config is downloaded once.
        assert_eq!(source.requests.get(), 3);

        for entry in entries {
            assert!(layout.has_blob(&entry.digest));
        }

        assert!(layout.has_blob(&Digest::sha256(&source.top)));
    }

    #[test]
    fn reject_manifests_with_invalid_digest() {
        let manifest = br#"{"layers":[]}"#;

        assert!(verify_manifest(&Digest::sha256(manifest), manifest).is_ok());

        assert!(matches!(
            verify_manifest(&Digest::sha256("x"), manifest),
            Err(FetchError::DigestMismatch(..))
        ));
    }

    #[test]
    fn unsupported_transports() {
        let root = tempfile::tempdir().unwrap();

        for source in ["containers-storage://localhost/app", "ostree://ref"] {
            let source = Source::parse(source).unwrap();
            let result = fetch(
                &source,
                &AccessContext::default(),
                false,
                root.path(),
                &CancelToken::new(),
            );

            assert!(matches!(result, Err(FetchError::UnsupportedTransport(_))));
        }

        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
