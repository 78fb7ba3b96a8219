//! Identify the format of a blob from its first bytes.

use std::{
    fmt,
    fs::File,
    io::{self, Read, Seek},
};

/// Offset of the `ustar` magic in a tar header.
const TAR_MAGIC_OFFSET: usize = 257;

const TAR_MAGIC: &[u8] = b"ustar";

/// Bytes needed to identify any format.
const HEAD_SIZE: usize = TAR_MAGIC_OFFSET + TAR_MAGIC.len();

/// Archive formats for blobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Zip,
    Tar,
    TarGzip,

    /// A gzip stream that does not look like a tar archive. It is
    /// extracted as a tar archive anyway.
    BareGzip,

    TarXz,
    TarZstd,

    /// Known format without support to extract it.
    Unimplemented(&'static str),

    Unrecognized,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Zip => ".zip",
            Format::Tar => ".tar",
            Format::TarGzip => ".tar.gz",
            Format::BareGzip => ".gz",
            Format::TarXz => ".tar.xz",
            Format::TarZstd => ".tar.zst",
            Format::Unimplemented(name) => *name,
            Format::Unrecognized => "unrecognized",
        })
    }
}

/// Compression methods, from their magic numbers.
enum Compression {
    Gzip,
    Xz,
    Zstd,
}

const MAGIC_NUMBERS: &[(&[u8], Result<Compression, &str>)] = &[
    (b"\x1f\x8b", Ok(Compression::Gzip)),
    (b"\xfd7zXZ\x00", Ok(Compression::Xz)),
    (b"\x28\xb5\x2f\xfd", Ok(Compression::Zstd)),
    (b"BZh", Err("bzip2")),
    (b"\x04\x22\x4d\x18", Err("lz4")),
    (b"7z\xbc\xaf\x27\x1c", Err("7z")),
    (b"Rar!\x1a\x07", Err("rar")),
];

const ZIP_MAGIC_NUMBERS: &[&[u8]] = &[b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];

/// Identify the format of the blob in `file`.
///
/// For compressed streams, the beginning of the stream is decompressed to
/// check if it contains a tar archive. The file is rewound before returning.
pub fn identify(file: &mut File) -> io::Result<Format> {
    let head = read_head(&mut *file)?;
    file.rewind()?;

    if ZIP_MAGIC_NUMBERS.iter().any(|m| head.starts_with(m)) {
        return Ok(Format::Zip);
    }

    let compression = MAGIC_NUMBERS
        .iter()
        .find(|(magic, _)| head.starts_with(magic))
        .map(|(_, c)| c);

    let format = match compression {
        None if is_tar(&head) => Format::Tar,

        None => Format::Unrecognized,

        Some(Err(name)) => Format::Unimplemented(*name),

        Some(Ok(Compression::Gzip)) => {
            let decoder = flate2::read::MultiGzDecoder::new(&*file);
            if is_tar(&read_head(decoder)?) {
                Format::TarGzip
            } else {
                Format::BareGzip
            }
        }

        Some(Ok(Compression::Xz)) => {
            let decoder = xz2::read::XzDecoder::new(&*file);
            if is_tar(&read_head(decoder)?) {
                Format::TarXz
            } else {
                Format::Unimplemented("xz")
            }
        }

        #[cfg(feature = "zstd")]
        Some(Ok(Compression::Zstd)) => {
            let decoder = zstd::stream::read::Decoder::new(&*file)?;
            if is_tar(&read_head(decoder)?) {
                Format::TarZstd
            } else {
                Format::Unimplemented("zstd")
            }
        }

        #[cfg(not(feature = "zstd"))]
        Some(Ok(Compression::Zstd)) => Format::Unimplemented("zstd"),
    };

    file.rewind()?;

    Ok(format)
}

/// Read the first bytes from `reader`, up to [`HEAD_SIZE`].
///
/// Errors after some bytes are read are ignored, since a corrupted stream
/// is detected later, when it is extracted.
fn read_head(reader: impl Read) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(HEAD_SIZE);

    match reader.take(HEAD_SIZE as u64).read_to_end(&mut head) {
        Err(_) if !head.is_empty() => Ok(head),
        r => r.map(|_| head),
    }
}

fn is_tar(head: &[u8]) -> bool {
    head.get(TAR_MAGIC_OFFSET..HEAD_SIZE) == Some(TAR_MAGIC)
}

#[cfg(test)]
fn identify_bytes(data: &[u8]) -> Format {
    let mut file = tempfile::tempfile().unwrap();
    io::Write::write_all(&mut file, data).unwrap();
    file.rewind().unwrap();

    let format = identify(&mut file).unwrap();
    assert_eq!(file.stream_position().unwrap(), 0);
    format
}

#[test]
fn identify_formats() {
    use std::io::Write;

    let tar = {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_size(3);
        header.set_cksum();
        builder.append_data(&mut header, "a.txt", &b"abc"[..]).unwrap();
        builder.into_inner().unwrap()
    };

    assert_eq!(identify_bytes(&tar), Format::Tar);

    let mut gz = flate2::write::GzEncoder::new(Vec::new(), Default::default());
    gz.write_all(&tar).unwrap();
    assert_eq!(identify_bytes(&gz.finish().unwrap()), Format::TarGzip);

    let mut gz = flate2::write::GzEncoder::new(Vec::new(), Default::default());
    gz.write_all(b"plain text").unwrap();
    assert_eq!(identify_bytes(&gz.finish().unwrap()), Format::BareGzip);

    let mut xz = xz2::write::XzEncoder::new(Vec::new(), 6);
    xz.write_all(&tar).unwrap();
    assert_eq!(identify_bytes(&xz.finish().unwrap()), Format::TarXz);

    let mut xz = xz2::write::XzEncoder::new(Vec::new(), 6);
    xz.write_all(b"plain text").unwrap();
    assert_eq!(identify_bytes(&xz.finish().unwrap()), Format::Unimplemented("xz"));

    #[cfg(feature = "zstd")]
    assert_eq!(
        identify_bytes(&zstd::encode_all(&tar[..], 0).unwrap()),
        Format::TarZstd
    );

    assert_eq!(identify_bytes(b"PK\x03\x04rest"), Format::Zip);
    assert_eq!(identify_bytes(b"BZh91AY&SY"), Format::Unimplemented("bzip2"));
    assert_eq!(identify_bytes(b"Rar!\x1a\x07\x00"), Format::Unimplemented("rar"));
    assert_eq!(identify_bytes(b"{\"json\": true}"), Format::Unrecognized);
    assert_eq!(identify_bytes(b""), Format::Unrecognized);
}
