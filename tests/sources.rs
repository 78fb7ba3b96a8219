use std::{fs, path::Path};

use undock::{
    cache::{FetchError, Layout, REF_NAME_ANNOTATION},
    manifests::ImageManifest,
    CancelToken, ImageExtractor, MediaType, Scheme, Source, SourceError, UndockError,
};

mod common;

use common::blobs::{Blob, Codec};

fn image_layer() -> Blob {
    Blob::archive(Codec::Gzip)
        .directory("etc", 0o755)
        .regular("etc/hostname", "from-archive")
        .build()
}

fn config() -> Blob {
    Blob::new(MediaType::OciConfig, r#"{"architecture":"amd64","os":"linux"}"#)
}

/// Write an OCI layout in `dir`, with a single image named `name`.
fn write_layout(dir: &Path, name: &str) {
    let layout = Layout::create(dir).unwrap();
    let token = CancelToken::new();

    let config = config();
    let layer = image_layer();

    let manifest = ImageManifest {
        schema_version: 2,
        media_type: Some(MediaType::OciManifestV1.to_string()),
        config: config.descriptor(),
        layers: vec![layer.descriptor()],
    };

    let manifest = Blob::new(MediaType::OciManifestV1, serde_json::to_vec(&manifest).unwrap());

    for blob in [&config, &layer, &manifest] {
        layout.write_blob(&blob.digest, &blob.data[..], &token).unwrap();
    }

    let mut descriptor = manifest.descriptor();
    descriptor
        .annotations
        .insert(REF_NAME_ANNOTATION.to_owned(), name.to_owned());

    layout.write_index(descriptor).unwrap();
}

/// Create a tarball with the content of `dir`.
fn tarball(dir: &Path, output: &Path) {
    let mut builder = tar::Builder::new(fs::File::create(output).unwrap());
    builder.append_dir_all(".", dir).unwrap();
    builder.finish().unwrap();
}

fn extract(source: &str) -> (tempfile::TempDir, Result<(), UndockError>) {
    let dist = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let result = ImageExtractor::new(Source::parse(source).unwrap(), dist.path(), cache.path())
        .extract(&CancelToken::new());

    (dist, result)
}

#[test]
fn unknown_schemes() {
    assert!(matches!(
        Source::parse("ftp://example.com/image"),
        Err(SourceError::UnsupportedScheme(s)) if s == "ftp"
    ));

    assert!(matches!(Source::parse("oci://"), Err(SourceError::EmptyLocator(Scheme::Oci))));
}

#[test]
fn transports_without_support() {
    let cache = tempfile::tempdir().unwrap();
    let dist = tempfile::tempdir().unwrap();

    let source = Source::parse("containers-storage://alpine:latest").unwrap();
    let extractor = ImageExtractor::new(source, dist.path(), cache.path());
    assert_eq!(extractor.source().scheme(), Scheme::ContainersStorage);

    let result = extractor.extract(&CancelToken::new());

    assert!(matches!(
        result,
        Err(UndockError::Fetch(FetchError::UnsupportedTransport(Scheme::ContainersStorage)))
    ));

    assert!(fs::read_dir(cache.path()).unwrap().next().is_none());
}

#[test]
fn oci_layout() {
    let layout = tempfile::tempdir().unwrap();
    write_layout(layout.path(), "v1");

    let (dist, result) = extract(&format!("oci://{}:v1", layout.path().display()));
    result.unwrap();

    assert_eq!(fs::read(dist.path().join("etc/hostname")).unwrap(), b"from-archive");

    let (_, result) = extract(&format!("oci://{}:v2", layout.path().display()));
    assert!(matches!(
        result,
        Err(UndockError::Fetch(FetchError::ImageNotFound(name, _))) if name == "v2"
    ));
}

#[test]
fn oci_archive() {
    let layout = tempfile::tempdir().unwrap();
    write_layout(layout.path(), "latest");

    let archive_dir = tempfile::tempdir().unwrap();
    let archive = archive_dir.path().join("image.tar");
    tarball(layout.path(), &archive);

    let (dist, result) = extract(&format!("oci-archive://{}", archive.display()));
    result.unwrap();

    assert_eq!(fs::read(dist.path().join("etc/hostname")).unwrap(), b"from-archive");
}

#[test]
fn docker_archive() {
    let content = tempfile::tempdir().unwrap();

    let layer_dir = content.path().join("0123");
    fs::create_dir(&layer_dir).unwrap();
    fs::write(layer_dir.join("layer.tar"), &image_layer().data).unwrap();
    fs::write(content.path().join("config.json"), &config().data).unwrap();

    fs::write(
        content.path().join("manifest.json"),
        r#"[{"Config":"config.json","RepoTags":["foo/bar:1.0","foo/bar:latest"],"Layers":["0123/layer.tar"]}]"#,
    )
    .unwrap();

    let archive_dir = tempfile::tempdir().unwrap();
    let archive = archive_dir.path().join("saved.tar");
    tarball(content.path(), &archive);

    for name in ["foo/bar:1.0", "foo/bar"] {
        let (dist, result) = extract(&format!("docker-archive://{}:{name}", archive.display()));
        result.unwrap();

        assert_eq!(fs::read(dist.path().join("etc/hostname")).unwrap(), b"from-archive");
    }

    let (_, result) = extract(&format!("docker-archive://{}:foo/bar:2.0", archive.display()));
    assert!(matches!(result, Err(UndockError::Fetch(FetchError::ImageNotFound(..)))));
}
