mod mediatype;
mod parser;

use std::fmt;

use crate::digest::Digest;

pub use mediatype::{InvalidMediaType, MediaType};

/// Errors from [`Reference::try_from`].
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("Missing repository.")]
    MissingRepository,

    #[error("Invalid registry domain: {0:?}")]
    InvalidDomain(String),

    #[error("Invalid repository name: {0:?}")]
    InvalidRepository(String),

    #[error("Invalid tag: {0:?}")]
    InvalidTag(String),

    #[error("{0}")]
    InvalidDigest(#[from] crate::digest::DigestError),
}

/// Reference to an image in an OCI registry.
///
/// The parser tries to be close to what `docker pull` does:
///
/// * If the reference does not include the domain of the registry,
///   it uses Docker Hub (`docker.io`), and the repository namespace
///   defaults to `library` if there is none. For example:
///
///   * `debian` is parsed as `docker.io/library/debian`.
///   * `nixos/nix` is parsed as `docker.io/nixos/nix`.
/// * Repository components must be lowercase.
/// * It accepts a fixed digest (the last part after a `@` character), but
///   only SHA256 and SHA512.
/// * If there is no tag and no digest, the tag is `latest`.
///
/// However, it does not try to be bug-for-bug compatible with Docker.
///
/// # Examples
///
/// ```
/// # use undock::*;
/// const REFERENCE: &str = "registry.example.com/foo/bar:1.23.4@sha256:123456789012345678901234567890123456789012345678901234567890ABCD";
///
/// let reference = Reference::try_from(REFERENCE).unwrap();
/// assert_eq!(reference.domain, "registry.example.com");
/// assert_eq!(reference.repository, "foo/bar");
/// assert_eq!(reference.tag.as_deref(), Some("1.23.4"));
///
/// let digest = reference.digest.as_ref().unwrap();
/// assert_eq!(digest.algorithm(), DigestAlgorithm::SHA256);
/// assert_eq!(digest.hash_value(), "123456789012345678901234567890123456789012345678901234567890ABCD");
/// ```
///
/// ```
/// # use undock::*;
/// let reference = Reference::try_from("debian").unwrap();
///
/// assert_eq!(reference.to_string(), "docker.io/library/debian:latest");
/// assert_eq!(reference.registry_host(), "registry-1.docker.io");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    /// Domain of the registry, with an optional port.
    pub domain: String,

    /// Repository path, like `library/debian`.
    pub repository: String,

    /// Image tag.
    pub tag: Option<String>,

    /// Manifest digest, if present.
    pub digest: Option<Digest>,
}

impl Reference {
    /// Host to send the requests for this reference.
    ///
    /// It is the same as `domain`, except for Docker Hub.
    pub fn registry_host(&self) -> &str {
        match self.domain.as_str() {
            parser::DEFAULT_DOMAIN => parser::DOCKER_HUB_HOST,
            domain => domain,
        }
    }

    /// Value to use in the `/v2/<repo>/manifests/<value>` path.
    ///
    /// It is the digest if present, or the tag otherwise.
    pub fn manifest_ref(&self) -> &str {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.source(),
            (None, Some(tag)) => tag,
            (None, None) => parser::DEFAULT_TAG,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.repository)?;

        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }

        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }

        Ok(())
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;

    fn try_from(reference: &str) -> Result<Self, Self::Error> {
        parser::parse(reference)
    }
}
