//! OCI image layouts: the format of the cache, and the `oci` transport.
//!
//! Ref: <https://github.com/opencontainers/image-spec/blob/main/image-layout.md>

use std::{
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use crate::{
    cancel::CancelToken,
    digest::Digest,
    manifests::{Descriptor, ImageIndex},
    MediaType,
};

use super::{FetchError, ImageSource};

const OCI_LAYOUT_FILE: &str = "oci-layout";

const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

const INDEX_FILE: &str = "index.json";

/// Annotation to identify images in an `index.json` file.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Writable image layout in the cache.
pub struct Layout {
    dir: PathBuf,
}

impl Layout {
    /// Create the layout in `dir`, if it does not exist.
    pub fn create(dir: &Path) -> Result<Layout, FetchError> {
        let blobs = dir.join("blobs");
        std::fs::create_dir_all(&blobs).map_err(|e| FetchError::io(e, &blobs))?;

        let marker = dir.join(OCI_LAYOUT_FILE);
        if !marker.exists() {
            write_atomic(&marker, OCI_LAYOUT_CONTENT.as_bytes())?;
        }

        Ok(Layout {
            dir: dir.to_owned(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.blob_path())
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Copy the data from `reader` to the blob for `digest`.
    ///
    /// Data is written to a temporary file, which is renamed to the
    /// final path only when the digest is verified.
    pub fn write_blob(
        &self,
        digest: &Digest,
        reader: impl Read,
        token: &CancelToken,
    ) -> Result<u64, FetchError> {
        let path = self.blob_path(digest);

        let Some(dir) = path.parent() else {
            return Err(FetchError::io(io::ErrorKind::InvalidInput.into(), &path));
        };

        std::fs::create_dir_all(dir).map_err(|e| FetchError::io(e, dir))?;

        let mut output = tempfile::NamedTempFile::new_in(dir).map_err(|e| FetchError::io(e, dir))?;

        let size = io::copy(&mut token.reader(digest.wrap_reader(reader)), &mut output)
            .map_err(|e| FetchError::io(e, &path))?;

        output
            .persist(&path)
            .map_err(|e| FetchError::io(e.error, &path))?;

        tracing::debug!(blob = %digest, size, "Blob stored");

        Ok(size)
    }

    /// Write `index.json`, with `descriptor` as its only entry.
    pub fn write_index(&self, descriptor: Descriptor) -> Result<(), FetchError> {
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(MediaType::OciImageIndex.to_string()),
            manifests: vec![descriptor],
        };

        write_atomic(&self.dir.join(INDEX_FILE), &serde_json::to_vec(&index)?)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), FetchError> {
    let dir = path.parent().unwrap_or(Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| FetchError::io(e, dir))?;
    file.write_all(data).map_err(|e| FetchError::io(e, path))?;
    file.persist(path).map_err(|e| FetchError::io(e.error, path))?;

    Ok(())
}

/// Image from an existing layout directory.
pub(crate) struct LayoutSource {
    dir: PathBuf,
    top: Descriptor,
}

impl LayoutSource {
    /// Open the layout in `dir`.
    ///
    /// If `reference` is present, the image is the entry of `index.json`
    /// with the same `org.opencontainers.image.ref.name` annotation.
    /// Otherwise, `index.json` must have a single entry.
    pub fn open(dir: &Path, reference: Option<&str>) -> Result<Self, FetchError> {
        let path = dir.join(INDEX_FILE);
        let index = std::fs::read(&path).map_err(|e| FetchError::io(e, &path))?;
        let index: ImageIndex = serde_json::from_slice(&index)?;

        let mut entries = index.manifests.into_iter();

        let top = match reference {
            Some(name) => entries
                .find(|e| e.annotations.get(REF_NAME_ANNOTATION).map(String::as_str) == Some(name)),

            None => match (entries.next(), entries.next()) {
                (Some(entry), None) => Some(entry),
                _ => None,
            },
        };

        let Some(top) = top else {
            let name = reference.unwrap_or("(single image)");
            return Err(FetchError::ImageNotFound(name.to_owned(), dir.to_owned()));
        };

        tracing::debug!(layout = %dir.display(), manifest = %top.digest, "Image found in layout");

        Ok(LayoutSource {
            dir: dir.to_owned(),
            top,
        })
    }

    fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, FetchError> {
        let path = self.dir.join(digest.blob_path());
        std::fs::read(&path).map_err(|e| FetchError::io(e, &path))
    }
}

impl ImageSource for LayoutSource {
    fn top_manifest(&self) -> Result<Vec<u8>, FetchError> {
        self.read_blob(&self.top.digest)
    }

    fn manifest(&self, digest: &Digest) -> Result<Vec<u8>, FetchError> {
        self.read_blob(digest)
    }

    fn blob(&self, digest: &Digest) -> Result<Box<dyn Read + '_>, FetchError> {
        let path = self.dir.join(digest.blob_path());
        let file = File::open(&path).map_err(|e| FetchError::io(e, &path))?;
        Ok(Box::new(file))
    }
}
