//! Tarballs of images: `oci-archive`, `docker-archive`, and the exports
//! of the Docker daemon.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use tempfile::TempDir;

use crate::{
    cancel::CancelToken,
    digest::Digest,
    manifests::{Descriptor, ImageManifest},
    MediaType,
};

use super::{FetchError, ImageSource};

const DOCKER_MANIFEST: &str = "manifest.json";

/// Prefix for the staging directories in the cache root.
const STAGING_PREFIX: &str = ".staging-";

/// Extract the tarball in `reader` to a temporary directory in `cache_root`.
///
/// The directory is removed when the returned value is dropped.
pub(crate) fn stage(
    reader: impl Read,
    cache_root: &Path,
    token: &CancelToken,
) -> Result<TempDir, FetchError> {
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(cache_root)
        .map_err(|e| FetchError::io(e, cache_root))?;

    tracing::debug!(path = %staging.path().display(), "Staging archive");

    let mut archive = tar::Archive::new(token.reader(reader));
    archive.set_preserve_permissions(false);

    archive
        .unpack(staging.path())
        .map_err(|e| FetchError::io(e, staging.path()))?;

    Ok(staging)
}

/// Extract the archive at `path` to a temporary directory.
pub(crate) fn stage_file(
    path: &Path,
    cache_root: &Path,
    token: &CancelToken,
) -> Result<TempDir, FetchError> {
    let file = File::open(path).map_err(|e| FetchError::io(e, path))?;
    stage(BufReader::new(file), cache_root, token)
}

/// Entry of the `manifest.json` file created by `docker save`.
#[derive(serde::Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct DockerArchiveEntry {
    config: String,

    #[serde(default)]
    repo_tags: Option<Vec<String>>,

    layers: Vec<String>,
}

/// Image from a staged `docker save` tarball.
///
/// The tarball has no OCI manifest, so it is built from `manifest.json`,
/// with the digests of the config and the layer files.
pub(crate) struct DockerArchiveSource {
    manifest: Vec<u8>,
    blobs: HashMap<Digest, PathBuf>,
}

impl DockerArchiveSource {
    /// Read the image in `dir`.
    ///
    /// If `reference` is present, the image is the entry with the same
    /// name in `RepoTags`. Otherwise, the archive must contain a single
    /// image.
    pub fn open(dir: &Path, reference: Option<&str>) -> Result<Self, FetchError> {
        let path = dir.join(DOCKER_MANIFEST);
        let entries = std::fs::read(&path).map_err(|e| FetchError::io(e, &path))?;
        let entries: Vec<DockerArchiveEntry> = serde_json::from_slice(&entries)?;

        let entry = match reference {
            Some(name) => entries.into_iter().find(|e| {
                e.repo_tags
                    .iter()
                    .flatten()
                    .any(|tag| tag == name || tag.strip_suffix(":latest") == Some(name))
            }),

            None if entries.len() == 1 => entries.into_iter().next(),

            None => None,
        };

        let Some(entry) = entry else {
            let name = reference.unwrap_or("(single image)");
            return Err(FetchError::ImageNotFound(name.to_owned(), dir.to_owned()));
        };

        let mut blobs = HashMap::new();

        let mut describe = |file: &str, media_type: MediaType| -> Result<Descriptor, FetchError> {
            let path = dir.join(file);
            if !path.starts_with(dir) || file.split('/').any(|c| c == "..") {
                return Err(FetchError::InvalidArchive(format!("invalid path {file:?}")));
            }

            let reader = File::open(&path).map_err(|e| FetchError::io(e, &path))?;
            let (digest, size) =
                Digest::sha256_reader(BufReader::new(reader)).map_err(|e| FetchError::io(e, &path))?;

            blobs.insert(digest.clone(), path);
            Ok(Descriptor::new(media_type, digest, size))
        };

        let config = describe(&entry.config, MediaType::OciConfig)?;

        // The format of every layer is detected when it is extracted.
        let layers = entry
            .layers
            .iter()
            .map(|layer| describe(layer, MediaType::OciFsTar))
            .collect::<Result<Vec<_>, _>>()?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MediaType::OciManifestV1.to_string()),
            config,
            layers,
        };

        Ok(DockerArchiveSource {
            manifest: serde_json::to_vec(&manifest)?,
            blobs,
        })
    }
}

impl ImageSource for DockerArchiveSource {
    fn top_manifest(&self) -> Result<Vec<u8>, FetchError> {
        Ok(self.manifest.clone())
    }

    fn manifest(&self, digest: &Digest) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::InvalidArchive(format!(
            "no manifest {digest} in a docker archive"
        )))
    }

    fn blob(&self, digest: &Digest) -> Result<Box<dyn Read + '_>, FetchError> {
        let Some(path) = self.blobs.get(digest) else {
            return Err(FetchError::InvalidArchive(format!("missing blob {digest}")));
        };

        let file = File::open(path).map_err(|e| FetchError::io(e, path))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifests::guess_media_type;

    fn docker_save_tarball() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut append = |path: &str, data: &[u8]| {
            let mut header = tar::Header::new_ustar();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, data).unwrap();
        };

        append("abc/layer.tar", b"layer one");
        append("def/layer.tar", b"layer two");
        append("config.json", b"{}");
        append(
            DOCKER_MANIFEST,
            br#"[{
                "Config": "config.json",
                "RepoTags": ["app:1", "app:latest"],
                "Layers": ["abc/layer.tar", "def/layer.tar"]
            }]"#,
        );

        builder.into_inner().unwrap()
    }

    #[test]
    fn docker_archive_manifest() {
        let cache_root = tempfile::tempdir().unwrap();
        let tarball = docker_save_tarball();

        let staged = stage(&tarball[..], cache_root.path(), &CancelToken::new()).unwrap();
        assert!(staged.path().starts_with(cache_root.path()));

        for reference in [None, Some("app:1"), Some("app")] {
            let source = DockerArchiveSource::open(staged.path(), reference).unwrap();
            let manifest = source.top_manifest().unwrap();

            assert_eq!(guess_media_type(&manifest).unwrap(), MediaType::OciManifestV1);

            let manifest: ImageManifest = serde_json::from_slice(&manifest).unwrap();
            assert_eq!(manifest.config.digest, Digest::sha256("{}"));
            assert_eq!(manifest.layers[0].digest, Digest::sha256("layer one"));
            assert_eq!(manifest.layers[1].digest, Digest::sha256("layer two"));
            assert_eq!(manifest.layers[1].size, 9);

            let mut layer = String::new();
            source
                .blob(&manifest.layers[0].digest)
                .unwrap()
                .read_to_string(&mut layer)
                .unwrap();
            assert_eq!(layer, "layer one");
        }

        assert!(matches!(
            DockerArchiveSource::open(staged.path(), Some("other:1")),
            Err(FetchError::ImageNotFound(..))
        ));

        // Staging directories are removed on drop.
        let staged_path = staged.path().to_owned();
        drop(staged);
        assert!(!staged_path.exists());
    }
}
