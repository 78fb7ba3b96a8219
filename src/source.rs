//! Sources of container images.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use crate::{
    digest::Digest,
    reference::{ParseError, Reference},
};

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("Unsupported source scheme: {0:?}")]
    UnsupportedScheme(String),

    #[error("Invalid reference {0:?}: {1}")]
    InvalidReference(String, ParseError),

    #[error("Missing location for a {0} source.")]
    EmptyLocator(Scheme),

    #[error("Invalid path {0:?}: {1}")]
    InvalidPath(String, std::io::Error),
}

/// Transports to get an image.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    ContainersStorage,
    Docker,
    DockerArchive,
    DockerDaemon,
    Oci,
    OciArchive,
    Ostree,
}

impl Scheme {
    pub const ALL: &[Scheme] = &[
        Scheme::ContainersStorage,
        Scheme::Docker,
        Scheme::DockerArchive,
        Scheme::DockerDaemon,
        Scheme::Oci,
        Scheme::OciArchive,
        Scheme::Ostree,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scheme::ContainersStorage => "containers-storage",
            Scheme::Docker => "docker",
            Scheme::DockerArchive => "docker-archive",
            Scheme::DockerDaemon => "docker-daemon",
            Scheme::Oci => "oci",
            Scheme::OciArchive => "oci-archive",
            Scheme::Ostree => "ostree",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Image in the local Docker daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DaemonImage {
    Id(Digest),
    Reference(Reference),
}

impl DaemonImage {
    /// Name to use in the engine API.
    pub fn api_name(&self) -> String {
        match self {
            DaemonImage::Id(id) => id.source().to_owned(),
            DaemonImage::Reference(r) => r.to_string(),
        }
    }
}

/// Location of the image, according to its scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Locator {
    Registry(Reference),

    Daemon(DaemonImage),

    /// `path[:reference]` for archives and layouts.
    Path {
        path: PathBuf,
        reference: Option<String>,
    },

    /// Transports where the locator is not interpreted.
    Opaque(String),
}

/// A container image source, like `docker://alpine:latest` or
/// `oci-archive:///tmp/image.tar`.
///
/// # Examples
///
/// ```
/// # use undock::*;
/// let source = Source::parse("alpine").unwrap();
/// assert_eq!(source.scheme(), Scheme::Docker);
/// assert_eq!(source.within_transport(), "//docker.io/library/alpine:latest");
///
/// let source = Source::parse("oci:///var/images/app:v1").unwrap();
/// assert_eq!(source.scheme(), Scheme::Oci);
/// assert_eq!(source.within_transport(), "/var/images/app:v1");
///
/// assert!(Source::parse("ftp://example.com/image").is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Source {
    raw: String,
    scheme: Scheme,
    locator: Locator,
}

impl Source {
    /// Parse a source string.
    ///
    /// A string without any `scheme://` prefix is a reference to an
    /// image in a registry.
    pub fn parse(raw: &str) -> Result<Source, SourceError> {
        let (scheme, rest) = match raw.split_once("://") {
            Some((prefix, rest)) => {
                let scheme = Scheme::ALL
                    .iter()
                    .find(|s| s.name() == prefix)
                    .ok_or_else(|| SourceError::UnsupportedScheme(prefix.to_owned()))?;

                (*scheme, rest)
            }

            None => (Scheme::Docker, raw),
        };

        if rest.is_empty() {
            return Err(SourceError::EmptyLocator(scheme));
        }

        let invalid_ref = |e| SourceError::InvalidReference(rest.to_owned(), e);

        let locator = match scheme {
            Scheme::Docker => Locator::Registry(Reference::try_from(rest).map_err(invalid_ref)?),

            Scheme::DockerDaemon => {
                let image = match Digest::try_from(rest) {
                    Ok(id) => DaemonImage::Id(id),
                    Err(_) => DaemonImage::Reference(Reference::try_from(rest).map_err(invalid_ref)?),
                };

                Locator::Daemon(image)
            }

            Scheme::DockerArchive | Scheme::Oci | Scheme::OciArchive => {
                let (path, reference) = match rest.split_once(':') {
                    Some((path, reference)) => (path, Some(reference.to_owned())),
                    None => (rest, None),
                };

                if path.is_empty() {
                    return Err(SourceError::EmptyLocator(scheme));
                }

                let path = std::path::absolute(path)
                    .map_err(|e| SourceError::InvalidPath(path.to_owned(), e))?;

                Locator::Path {
                    path,
                    reference: reference.filter(|r| !r.is_empty()),
                }
            }

            Scheme::ContainersStorage | Scheme::Ostree => Locator::Opaque(rest.to_owned()),
        };

        Ok(Source {
            raw: raw.to_owned(),
            scheme,
            locator,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Reference to the registry, for `docker` sources.
    pub fn registry_reference(&self) -> Option<&Reference> {
        match &self.locator {
            Locator::Registry(r) => Some(r),
            _ => None,
        }
    }

    /// Path of the archive or layout, for path-based sources.
    pub fn path(&self) -> Option<(&Path, Option<&str>)> {
        match &self.locator {
            Locator::Path { path, reference } => Some((path, reference.as_deref())),
            _ => None,
        }
    }

    /// Canonical string to identify the image inside its transport.
    pub fn within_transport(&self) -> String {
        match &self.locator {
            Locator::Registry(r) => format!("//{r}"),

            Locator::Daemon(image) => image.api_name(),

            Locator::Path {
                path,
                reference: None,
            } => path.display().to_string(),

            Locator::Path {
                path,
                reference: Some(r),
            } => format!("{}:{r}", path.display()),

            Locator::Opaque(s) => s.clone(),
        }
    }

    /// The `scheme:within-transport` form, used in logs.
    pub fn transport_name(&self) -> String {
        format!("{}:{}", self.scheme, self.within_transport())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[test]
fn parse_sources() {
    const ID: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    macro_rules! check {
        ($raw:expr, $scheme:expr, $within:expr) => {
            let source = Source::parse($raw).unwrap();
            assert_eq!(source.raw(), $raw);
            assert_eq!(source.scheme(), $scheme, "{}", $raw);
            assert_eq!(source.within_transport(), $within, "{}", $raw);
        };
    }

    check!("alpine", Scheme::Docker, "//docker.io/library/alpine:latest");
    check!(
        "docker://ghcr.io/foo/bar:1.0",
        Scheme::Docker,
        "//ghcr.io/foo/bar:1.0"
    );
    check!("docker-daemon://nginx:1", Scheme::DockerDaemon, "docker.io/library/nginx:1");
    check!(&format!("docker-daemon://{ID}"), Scheme::DockerDaemon, ID);
    check!("oci:///srv/layout", Scheme::Oci, "/srv/layout");
    check!("oci-archive:///tmp/a.tar:app", Scheme::OciArchive, "/tmp/a.tar:app");
    check!("docker-archive:///tmp/b.tar", Scheme::DockerArchive, "/tmp/b.tar");
    check!("ostree://some/ref", Scheme::Ostree, "some/ref");
    check!(
        "containers-storage://localhost/app",
        Scheme::ContainersStorage,
        "localhost/app"
    );

    // Relative paths are resolved from the current directory.
    let source = Source::parse("oci://layout").unwrap();
    let (path, reference) = source.path().unwrap();
    assert!(path.is_absolute());
    assert!(path.ends_with("layout"));
    assert_eq!(reference, None);
}

#[test]
fn reject_invalid_sources() {
    assert!(matches!(
        Source::parse("ftp://x"),
        Err(SourceError::UnsupportedScheme(s)) if s == "ftp"
    ));

    assert!(matches!(
        Source::parse("oci://"),
        Err(SourceError::EmptyLocator(Scheme::Oci))
    ));

    assert!(matches!(
        Source::parse("oci://:tag"),
        Err(SourceError::EmptyLocator(Scheme::Oci))
    ));

    assert!(matches!(
        Source::parse("docker://UPPER/case"),
        Err(SourceError::InvalidReference(..))
    ));

    assert!(matches!(
        Source::parse(""),
        Err(SourceError::EmptyLocator(Scheme::Docker))
    ));
}
