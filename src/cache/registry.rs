use std::io::Read;

use crate::{digest::Digest, http, reference::Reference};

use super::{verify_manifest, AccessContext, FetchError, ImageSource};

/// Image in a registry, for the `docker` transport.
pub(crate) struct RegistrySource<'a> {
    client: http::Client,
    reference: &'a Reference,
}

impl<'a> RegistrySource<'a> {
    pub fn new(reference: &'a Reference, context: &AccessContext) -> Result<Self, FetchError> {
        Ok(RegistrySource {
            client: http::Client::new(reference, context)?,
            reference,
        })
    }
}

impl ImageSource for RegistrySource<'_> {
    fn top_manifest(&self) -> Result<Vec<u8>, FetchError> {
        let manifest = self.client.get_manifest(self.reference.manifest_ref())?;

        if let Some(digest) = &self.reference.digest {
            verify_manifest(digest, &manifest)?;
        }

        Ok(manifest)
    }

    fn manifest(&self, digest: &Digest) -> Result<Vec<u8>, FetchError> {
        let manifest = self.client.get_manifest(digest.source())?;
        verify_manifest(digest, &manifest)?;
        Ok(manifest)
    }

    fn blob(&self, digest: &Digest) -> Result<Box<dyn Read + '_>, FetchError> {
        tracing::info!(blob = %digest, "Downloading blob");
        Ok(Box::new(self.client.download_blob(digest)?))
    }
}
