//! OCI manifests and indexes, and how to get the layers for every platform.
//!
//! Refs:
//!
//! * <https://github.com/opencontainers/image-spec/blob/main/manifest.md>
//! * <https://github.com/opencontainers/image-spec/blob/main/image-index.md>
//! * <https://distribution.github.io/distribution/spec/manifest-v2-2/>

use std::{collections::BTreeMap, io, path::Path, str::FromStr};

use crate::{digest::Digest, platform::Platform, MediaType};

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("Invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown manifest media type: {0}")]
    UnknownMediaType(String),

    #[error("Cannot read manifest {0} for platform {1}: {2}")]
    MissingBlob(Digest, Platform, io::Error),
}

/// Content descriptor, used to reference blobs and manifests.
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: MediaType, digest: Digest, size: u64) -> Self {
        Descriptor {
            media_type: media_type.to_string(),
            digest,
            size,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }
}

/// Manifest of a single image.
#[derive(serde::Deserialize, serde::Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

/// Index with the manifests for multiple platforms.
#[derive(serde::Deserialize, serde::Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub manifests: Vec<Descriptor>,
}

/// A layer, from the bottom of the stack.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerDescriptor {
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
}

impl From<Descriptor> for LayerDescriptor {
    fn from(d: Descriptor) -> Self {
        LayerDescriptor {
            digest: d.digest,
            media_type: d.media_type,
            size: d.size,
        }
    }
}

/// Layers for one platform.
#[derive(Clone, Debug, PartialEq)]
pub struct PlatformManifest {
    pub platform: Platform,
    pub layers: Vec<LayerDescriptor>,
}

/// Get the media type of a manifest.
///
/// If the `mediaType` field is missing, it is guessed from the other fields.
pub fn guess_media_type(manifest: &[u8]) -> Result<MediaType, ManifestError> {
    use serde::de::IgnoredAny;

    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        media_type: Option<String>,
        manifests: Option<IgnoredAny>,
        config: Option<IgnoredAny>,
        layers: Option<IgnoredAny>,
    }

    let probe: Probe = serde_json::from_slice(manifest)?;

    let media_type = match probe {
        Probe {
            media_type: Some(mt),
            ..
        } => MediaType::from_str(&mt).map_err(|_| ManifestError::UnknownMediaType(mt))?,

        Probe {
            manifests: Some(_), ..
        } => MediaType::OciImageIndex,

        Probe { config: Some(_), .. } | Probe { layers: Some(_), .. } => MediaType::OciManifestV1,

        _ => return Err(ManifestError::UnknownMediaType("(none)".into())),
    };

    if media_type.is_index() || media_type.is_manifest() {
        Ok(media_type)
    } else {
        Err(ManifestError::UnknownMediaType(media_type.to_string()))
    }
}

/// Get the layers for every platform in `manifest`.
///
/// If `manifest` is an image manifest, its layers are bound to `platform`.
/// If it is an index, the manifest of every entry is read from the
/// `blobs/` directory of `cache_dir`.
pub fn resolve(
    cache_dir: &Path,
    manifest: &[u8],
    platform: &Platform,
) -> Result<Vec<PlatformManifest>, ManifestError> {
    if guess_media_type(manifest)?.is_manifest() {
        return Ok(vec![PlatformManifest {
            platform: platform.clone(),
            layers: parse_layers(manifest)?,
        }]);
    }

    let index: ImageIndex = serde_json::from_slice(manifest)?;

    index
        .manifests
        .into_iter()
        .map(|entry| -> Result<PlatformManifest, ManifestError> {
            let platform = entry.platform.unwrap_or_else(Platform::unknown);

            let path = cache_dir.join(entry.digest.blob_path());
            let blob = std::fs::read(&path)
                .map_err(|e| ManifestError::MissingBlob(entry.digest, platform.clone(), e))?;

            Ok(PlatformManifest {
                platform,
                layers: parse_layers(&blob)?,
            })
        })
        .collect()
}

fn parse_layers(manifest: &[u8]) -> Result<Vec<LayerDescriptor>, ManifestError> {
    match guess_media_type(manifest)? {
        mt if mt.is_manifest() => {
            let manifest: ImageManifest = serde_json::from_slice(manifest)?;
            Ok(manifest.layers.into_iter().map(Into::into).collect())
        }

        mt => Err(ManifestError::UnknownMediaType(mt.to_string())),
    }
}
