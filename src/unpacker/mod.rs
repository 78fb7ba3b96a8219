//! Extract the platforms of an image to the destination directory.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
};

use rustix::fs::Mode;

use crate::{
    cache::{self, AccessContext},
    cancel::CancelToken,
    config::USER_AGENT,
    credentials::Credentials,
    extract::{ExtractError, Includes, Rootfs},
    manifests::{self, PlatformManifest},
    platform::Platform,
    source::Source,
    UndockError,
};

/// Platform to extract, and where to write it.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractionTask {
    pub platform: Platform,
    pub destination: PathBuf,

    /// Blobs of the layers, from the bottom of the stack.
    pub layers: Vec<PathBuf>,
}

/// Build a task for every platform.
///
/// If there are multiple platforms, and `wrap` is `false`, every
/// platform is written to `<dist>/<os>_<architecture><variant>`.
pub fn plan_tasks(
    cache_dir: &Path,
    dist: &Path,
    manifests: Vec<PlatformManifest>,
    wrap: bool,
) -> Vec<ExtractionTask> {
    let split = !wrap && manifests.len() > 1;

    manifests
        .into_iter()
        .map(|manifest| {
            let destination = if split {
                dist.join(manifest.platform.dir_name())
            } else {
                dist.to_owned()
            };

            let layers = manifest
                .layers
                .iter()
                .map(|layer| cache_dir.join(layer.digest.blob_path()))
                .collect();

            ExtractionTask {
                platform: manifest.platform,
                destination,
                layers,
            }
        })
        .collect()
}

/// Run every task in its own thread.
///
/// The first failure cancels `token`, so the other tasks are stopped,
/// and it is the returned error.
pub fn extract_platforms(
    tasks: &[ExtractionTask],
    includes: &Includes,
    token: &CancelToken,
) -> Result<(), ExtractError> {
    let first_error = Mutex::new(None);

    // Disable umask, so modes from the archives are applied as is.
    let _umask_guard = UmaskGuard(rustix::process::umask(Mode::empty()));

    thread::scope(|scope| {
        for task in tasks {
            let span = tracing::Span::current();
            let first_error = &first_error;

            scope.spawn(move || {
                let _span = span.entered();
                let _cancel_on_panic = CancelOnPanic(token);

                if let Err(err) = extract_task(task, includes, token) {
                    if let Ok(mut slot) = first_error.lock() {
                        slot.get_or_insert(err);
                    }

                    token.cancel();
                }
            });
        }
    });

    match first_error.into_inner() {
        Ok(None) => Ok(()),
        Ok(Some(err)) => Err(err),
        Err(poisoned) => poisoned.into_inner().map_or(Ok(()), Err),
    }
}

fn extract_task(
    task: &ExtractionTask,
    includes: &Includes,
    token: &CancelToken,
) -> Result<(), ExtractError> {
    let _span = tracing::info_span!("platform", platform = %task.platform).entered();

    let mut rootfs = Rootfs::open(&task.destination)?;

    tracing::info!(
        destination = %rootfs.path().display(),
        layers = task.layers.len(),
        "Extracting platform"
    );

    for layer in &task.layers {
        let _span = tracing::debug_span!("layer", blob = %layer.display()).entered();
        tracing::info!(platform = %task.platform, blob = %layer.display(), "Extracting blob");

        rootfs.extract_layer(layer, includes, token)?;
    }

    rootfs.finish()
}

/// Store the previous value for umask, to restore it on drop.
struct UmaskGuard(Mode);

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        rustix::process::umask(self.0);
    }
}

/// Cancel the token if the thread panics.
struct CancelOnPanic<'a>(&'a CancelToken);

impl Drop for CancelOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.cancel();
        }
    }
}

/// Extract an image to a directory.
///
/// # Examples
///
/// ```no_run
/// # use std::path::Path;
/// # use undock::*;
/// let source = Source::parse("alpine:3.20").unwrap();
///
/// let extractor = ImageExtractor::new(source, "rootfs", "/var/cache/undock")
///     .platform("linux/arm64".parse().unwrap())
///     .includes(Includes::new(["etc"]))
///     .rm_dist(true);
///
/// extractor.extract(&CancelToken::new()).unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct ImageExtractor {
    source: Source,
    dist: PathBuf,
    cache_dir: PathBuf,
    platform: Platform,
    all: bool,
    includes: Includes,
    insecure: bool,
    rm_dist: bool,
    wrap: bool,
    sandbox: bool,
    user_agent: String,
    credentials: Option<Credentials>,
}

impl ImageExtractor {
    pub fn new(source: Source, dist: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        ImageExtractor {
            source,
            dist: dist.into(),
            cache_dir: cache_dir.into(),
            platform: Platform::host(),
            all: false,
            includes: Includes::default(),
            insecure: false,
            rm_dist: false,
            wrap: false,
            sandbox: false,
            user_agent: USER_AGENT.to_owned(),
            credentials: None,
        }
    }

    /// Platform to extract. Defaults to the host platform.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Extract every platform of an index.
    pub fn all(mut self, all: bool) -> Self {
        self.all = all;
        self
    }

    pub fn includes(mut self, includes: Includes) -> Self {
        self.includes = includes;
        self
    }

    /// Accept any TLS certificate from the registry, and fall back to
    /// plain HTTP when TLS connections fail.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Remove the destination directory before extracting.
    pub fn rm_dist(mut self, rm_dist: bool) -> Self {
        self.rm_dist = rm_dist;
        self
    }

    /// Write all platforms to the same directory.
    pub fn wrap(mut self, wrap: bool) -> Self {
        self.wrap = wrap;
        self
    }

    /// Restrict filesystem access before extracting the layers.
    ///
    /// Ignored if the `sandbox` feature is not enabled.
    pub fn sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Credentials for the registry.
    ///
    /// If they are not set, they are read from the auth files of Docker
    /// and Podman.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn extract(&self, token: &CancelToken) -> Result<(), UndockError> {
        let _span = tracing::info_span!("extract", src = %self.source).entered();

        let context = AccessContext {
            platform: self.platform.clone(),
            insecure: self.insecure,
            user_agent: self.user_agent.clone(),
            credentials: self.credentials.clone(),
        };

        let cached = cache::fetch(&self.source, &context, self.all, &self.cache_dir, token)?;

        let manifests = manifests::resolve(&cached.dir, &cached.manifest, &self.platform)?;
        let tasks = plan_tasks(&cached.dir, &self.dist, manifests, self.wrap);

        self.prepare_dist()?;

        #[cfg(feature = "sandbox")]
        if self.sandbox {
            match sandbox(&self.dist, &self.cache_dir) {
                Ok(status) => tracing::info!(?status, "Sandbox created"),
                Err(e) => tracing::warn!("Cannot create the sandbox: {e}"),
            }
        }

        #[cfg(not(feature = "sandbox"))]
        if self.sandbox {
            tracing::warn!("Built without sandbox support");
        }

        extract_platforms(&tasks, &self.includes, token)?;

        tracing::info!(dist = %self.dist.display(), "Extraction completed");

        Ok(())
    }

    fn prepare_dist(&self) -> Result<(), UndockError> {
        let failed = |e| UndockError::Destination(e, self.dist.clone());

        if self.rm_dist {
            match std::fs::remove_dir_all(&self.dist) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(failed(e)),
                _ => tracing::debug!(dist = %self.dist.display(), "Destination removed"),
            }
        }

        std::fs::create_dir_all(&self.dist).map_err(failed)
    }
}

/// Restrict write access to the `dist` directory, and read access to
/// the `cache_dir` directory.
///
/// The sandbox is created after the image is in the cache, so the
/// registry client can access files like `/etc/resolv.conf`.
#[cfg(feature = "sandbox")]
fn sandbox(
    dist: &Path,
    cache_dir: &Path,
) -> Result<landlock::RestrictionStatus, landlock::RulesetError> {
    use landlock::*;

    let abi = ABI::V3;

    Ruleset::default()
        .handle_access(AccessFs::from_all(abi))?
        .create()?
        .add_rules(path_beneath_rules([dist], AccessFs::from_all(abi)))?
        .add_rules(path_beneath_rules([cache_dir], AccessFs::from_read(abi)))?
        .restrict_self()
}

/// Kinds of sources to extract.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Extractor {
    Image(ImageExtractor),
}

impl Extractor {
    pub fn kind(&self) -> &'static str {
        match self {
            Extractor::Image(_) => "image",
        }
    }

    pub fn extract(&self, token: &CancelToken) -> Result<(), UndockError> {
        match self {
            Extractor::Image(image) => image.extract(token),
        }
    }
}

impl From<ImageExtractor> for Extractor {
    fn from(image: ImageExtractor) -> Self {
        Extractor::Image(image)
    }
}
