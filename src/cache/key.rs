use std::fmt;

use crate::{
    daemon::DaemonClient,
    digest::Digest,
    http,
    source::{Locator, Source},
};

use super::{AccessContext, FetchError};

/// Name of the directory for an image in the cache.
///
/// For `docker` and `docker-daemon` sources the key is derived from the
/// digest of the image, so it changes when the image is updated. Other
/// sources use the hash of the location, not of the content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Compute the key for `source`.
    ///
    /// `docker` sources need a `HEAD` request to the registry, unless the
    /// reference has a digest. `docker-daemon` sources need a request to
    /// the daemon.
    pub fn compute(source: &Source, context: &AccessContext) -> Result<CacheKey, FetchError> {
        let key = match source.locator() {
            Locator::Registry(reference) => {
                let digest = match &reference.digest {
                    Some(digest) => digest.clone(),
                    None => http::Client::new(reference, context)?
                        .resolve_digest(reference.manifest_ref())?,
                };

                format!("{}-{}", source.scheme(), digest.hash_value())
            }

            Locator::Daemon(image) => {
                let inspect = DaemonClient::from_env()?.inspect(&image.api_name())?;

                let id = match inspect.id.split_once(':') {
                    Some((_, hex)) => hex,
                    None => &inspect.id,
                };

                format!("{}-{}", source.scheme(), id)
            }

            _ => {
                let digest = Digest::sha256(source.within_transport());
                format!("{}-{}", source.scheme(), digest.hash_value())
            }
        };

        Ok(CacheKey(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[test]
fn keys_without_network() {
    let context = AccessContext::default();
    let key = |s: &str| CacheKey::compute(&Source::parse(s).unwrap(), &context).unwrap();

    const DIGEST: &str = "sha256:8f5c2e2a0a4fbbdba2d4f3c1e9c1d1b2f5e8a1c7d4b3a2f1e0d9c8b7a6f5e4d3";

    assert_eq!(
        key(&format!("docker://alpine@{DIGEST}")).as_str(),
        format!("docker-{}", &DIGEST[7..])
    );

    // Hash of the location.
    let oci = key("oci:///srv/layout:v1");
    assert_eq!(
        oci.as_str(),
        format!("oci-{}", Digest::sha256("/srv/layout:v1").hash_value())
    );

    assert_eq!(oci, key("oci:///srv/layout:v1"));
    assert_ne!(oci, key("oci:///srv/layout:v2"));
    assert_ne!(oci, key("oci-archive:///srv/layout:v1"));

    assert!(key("ostree://a/b").as_str().starts_with("ostree-"));
}
