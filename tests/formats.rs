use std::{
    fs,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::Path,
};

use undock::{extract_blob, CancelToken, ExtractError, Includes};

mod common;

use common::blobs::{Blob, Codec};

fn tree(codec: Codec) -> Blob {
    Blob::archive(codec)
        .directory("bin", 0o750)
        .regular_mode("bin/run", "#!/bin/sh\n", 0o755)
        .regular("./etc/motd", "hello")
        .symlink("usr-bin", "bin")
        .build()
}

fn extract(blob: &Blob) -> (tempfile::TempDir, Result<(), ExtractError>) {
    let blobs = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let path = blob.write_to(blobs.path());
    let result = extract_blob(&path, dest.path(), &Includes::default(), &CancelToken::new());

    (dest, result)
}

fn mode(path: &Path) -> u32 {
    fs::symlink_metadata(path).unwrap().permissions().mode() & 0o7777
}

fn check_tree(root: &Path) {
    assert_eq!(fs::read(root.join("bin/run")).unwrap(), b"#!/bin/sh\n");
    assert_eq!(fs::read(root.join("etc/motd")).unwrap(), b"hello");
    assert_eq!(fs::read_link(root.join("usr-bin")).unwrap(), Path::new("bin"));

    assert_eq!(mode(&root.join("bin")), 0o750);
    assert_eq!(mode(&root.join("bin/run")), 0o755);
    assert_eq!(mode(&root.join("etc/motd")), 0o644);

    let mtime = fs::metadata(root.join("bin")).unwrap().mtime();
    assert_eq!(mtime, 1_600_000_000);
}

#[test]
fn plain_tar() {
    let (dest, result) = extract(&tree(Codec::Plain));
    result.unwrap();
    check_tree(dest.path());
}

#[test]
fn tar_gzip() {
    let (dest, result) = extract(&tree(Codec::Gzip));
    result.unwrap();
    check_tree(dest.path());
}

#[test]
fn tar_xz() {
    let (dest, result) = extract(&tree(Codec::Xz));
    result.unwrap();
    check_tree(dest.path());
}

#[cfg(feature = "zstd")]
#[test]
fn tar_zstd() {
    let (dest, result) = extract(&tree(Codec::Zstd));
    result.unwrap();
    check_tree(dest.path());
}

#[test]
fn gzip_without_tar_magic() {
    let (dest, result) = extract(&tree(Codec::BareGzip));
    result.unwrap();
    check_tree(dest.path());
}

#[test]
fn zip_archive() {
    let blob = Blob::zip()
        .directory("bin/", 0o750)
        .regular_mode("bin/run", "#!/bin/sh\n", 0o755)
        .regular_mode("etc/motd", "hello", 0o644)
        .symlink("usr-bin", "bin")
        .build();

    let (dest, result) = extract(&blob);
    result.unwrap();

    let root = dest.path();
    assert_eq!(fs::read(root.join("bin/run")).unwrap(), b"#!/bin/sh\n");
    assert_eq!(fs::read(root.join("etc/motd")).unwrap(), b"hello");
    assert_eq!(fs::read_link(root.join("usr-bin")).unwrap(), Path::new("bin"));

    assert_eq!(mode(&root.join("bin")), 0o750);
    assert_eq!(mode(&root.join("bin/run")), 0o755);
}

#[test]
fn skip_unrecognized_blobs() {
    let blob = Blob::new(undock::MediaType::OciFsTar, "just some text, not an archive");

    let (dest, result) = extract(&blob);
    result.unwrap();

    assert!(fs::read_dir(dest.path()).unwrap().next().is_none());
}

#[test]
fn unsupported_compression() {
    let blob = Blob::new(undock::MediaType::OciFsTar, &b"BZh91AY&SY\x00\x00"[..]);

    let (_dest, result) = extract(&blob);
    assert!(matches!(result, Err(ExtractError::Unimplemented(name)) if name == "bzip2"));
}
