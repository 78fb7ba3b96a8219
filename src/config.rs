use std::{
    fs::DirBuilder,
    io,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

/// Value for the `User-Agent` header in registry requests.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Directory under the user data directory for cached images.
const CACHE_SUBDIR: &str = "undock/cache";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid platform: {0:?}")]
    InvalidPlatform(String),

    #[error("Unable to find the data directory for the cache.")]
    MissingDataDir,

    #[error("Unable to create cache directory {1}: {0}")]
    CacheDir(io::Error, PathBuf),
}

/// Default location of the image cache, `$XDG_DATA_HOME/undock/cache`.
pub fn default_cache_dir() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|dir| dir.join(CACHE_SUBDIR))
        .ok_or(ConfigError::MissingDataDir)
}

/// Resolve the cache directory, and make sure that it exists.
///
/// A missing directory is created with mode `0700`.
pub fn cache_dir(requested: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let dir = match requested {
        Some(dir) => dir.to_owned(),
        None => default_cache_dir()?,
    };

    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&dir)
        .map_err(|e| ConfigError::CacheDir(e, dir.clone()))?;

    Ok(dir)
}

#[test]
fn create_cache_dir() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempfile::tempdir().unwrap();
    let requested = root.path().join("a/b/cache");

    let dir = cache_dir(Some(&requested)).unwrap();
    assert_eq!(dir, requested);

    let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
    assert!(mode & 0o077 == 0, "mode = {mode:o}");

    // An existing directory is accepted.
    assert_eq!(cache_dir(Some(&requested)).unwrap(), requested);
}
