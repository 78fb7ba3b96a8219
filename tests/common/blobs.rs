use std::{
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

use undock::{manifests::Descriptor, Digest, MediaType};

/// Compression for archives built in tests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Codec {
    Plain,
    Gzip,
    Xz,
    Zstd,

    /// Gzip stream of a tar archive with pre-POSIX headers, so the
    /// `ustar` magic is missing.
    BareGzip,
}

impl Codec {
    pub fn media_type(self) -> MediaType {
        match self {
            Codec::Plain => MediaType::OciFsTar,
            Codec::Gzip | Codec::BareGzip => MediaType::OciFsTarGzip,
            Codec::Xz => MediaType::OciFsTar,
            Codec::Zstd => MediaType::OciFsTarZstd,
        }
    }

    fn compress(self, data: Vec<u8>) -> Vec<u8> {
        match self {
            Codec::Plain => data,

            Codec::Gzip | Codec::BareGzip => {
                let mut gz = flate2::write::GzEncoder::new(Vec::new(), Default::default());
                gz.write_all(&data).unwrap();
                gz.finish().unwrap()
            }

            Codec::Xz => {
                let mut xz = xz2::write::XzEncoder::new(Vec::new(), 6);
                xz.write_all(&data).unwrap();
                xz.finish().unwrap()
            }

            #[cfg(feature = "zstd")]
            Codec::Zstd => zstd::encode_all(&data[..], 0).unwrap(),

            #[cfg(not(feature = "zstd"))]
            Codec::Zstd => panic!("zstd support is disabled"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Blob {
    pub media_type: MediaType,
    pub digest: Digest,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(media_type: MediaType, data: impl Into<Vec<u8>>) -> Blob {
        let data = data.into();

        Blob {
            media_type,
            digest: Digest::sha256(&data),
            data,
        }
    }

    /// Return a builder to create a tar archive.
    pub fn archive(codec: Codec) -> BlobArchive {
        BlobArchive {
            codec,
            archive: tar::Builder::new(Vec::with_capacity(4096)),
        }
    }

    /// Return a builder to create a zip archive.
    pub fn zip() -> ZipBlob {
        ZipBlob {
            writer: zip::ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.media_type, self.digest.clone(), self.data.len() as u64)
    }

    /// Write the data to `dir`, using the digest as the file name.
    pub fn write_to(&self, dir: &Path) -> PathBuf {
        let path = dir.join(self.digest.hash_value());
        std::fs::write(&path, &self.data).unwrap();
        path
    }
}

pub struct BlobArchive {
    codec: Codec,
    archive: tar::Builder<Vec<u8>>,
}

impl BlobArchive {
    pub fn build(self) -> Blob {
        let data = self.archive.into_inner().unwrap();
        Blob::new(self.codec.media_type(), self.codec.compress(data))
    }

    fn header(&self, path: impl AsRef<Path>, entry_type: tar::EntryType, mode: u32) -> tar::Header {
        let mut header = match self.codec {
            Codec::BareGzip => tar::Header::new_old(),
            _ => tar::Header::new_gnu(),
        };

        header.set_path(path).unwrap();
        header.set_mode(mode);
        header.set_entry_type(entry_type);
        header.set_mtime(1_600_000_000);
        header.set_size(0);
        header
    }

    fn append(mut self, mut header: tar::Header, data: &[u8]) -> Self {
        header.set_size(data.len() as u64);
        header.set_cksum();
        self.archive.append(&header, data).unwrap();
        self
    }

    pub fn directory(self, path: impl AsRef<Path>, mode: u32) -> Self {
        let header = self.header(path, tar::EntryType::dir(), mode);
        self.append(header, b"")
    }

    pub fn regular(self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Self {
        self.regular_mode(path, data, 0o644)
    }

    pub fn regular_mode(self, path: impl AsRef<Path>, data: impl AsRef<[u8]>, mode: u32) -> Self {
        let header = self.header(path, tar::EntryType::file(), mode);
        self.append(header, data.as_ref())
    }

    /// Add a symlink. An empty `target` leaves the link name unset.
    pub fn symlink(self, path: impl AsRef<Path>, target: &str) -> Self {
        let mut header = self.header(path, tar::EntryType::symlink(), 0o777);
        if !target.is_empty() {
            header.set_link_name(target).unwrap();
        }

        self.append(header, b"")
    }

    pub fn hardlink(self, path: impl AsRef<Path>, target: &str) -> Self {
        let mut header = self.header(path, tar::EntryType::hard_link(), 0o644);
        header.set_link_name(target).unwrap();
        self.append(header, b"")
    }

    pub fn char_device(self, path: impl AsRef<Path>) -> Self {
        let header = self.header(path, tar::EntryType::character_special(), 0o666);
        self.append(header, b"")
    }

    pub fn fifo(self, path: impl AsRef<Path>) -> Self {
        let header = self.header(path, tar::EntryType::fifo(), 0o644);
        self.append(header, b"")
    }
}

pub struct ZipBlob {
    writer: zip::ZipWriter<Cursor<Vec<u8>>>,
}

impl ZipBlob {
    fn options(mode: u32) -> zip::write::SimpleFileOptions {
        zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(mode)
    }

    pub fn build(self) -> Blob {
        let data = self.writer.finish().unwrap().into_inner();
        Blob::new(MediaType::OciFsTar, data)
    }

    pub fn directory(mut self, path: &str, mode: u32) -> Self {
        self.writer.add_directory(path, Self::options(mode)).unwrap();
        self
    }

    pub fn regular_mode(mut self, path: &str, data: impl AsRef<[u8]>, mode: u32) -> Self {
        self.writer.start_file(path, Self::options(mode)).unwrap();
        self.writer.write_all(data.as_ref()).unwrap();
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.writer
            .add_symlink(path, target, Self::options(0o777))
            .unwrap();
        self
    }
}
