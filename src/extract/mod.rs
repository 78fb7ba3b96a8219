//! Extract blobs (tar or zip archives) to a directory.

mod filter;
mod format;
mod writer;

use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use rustix::fs::FileType;

use crate::{cancel::CancelToken, fs::Directory};

pub use filter::Includes;
pub use format::{identify, Format};
pub use writer::{ArchiveEntry, EntryKind};

use writer::{apply_directory_metadata, DirectoryMetadata, Writer};

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("I/O error in {1}: {0}")]
    Io(io::Error, PathBuf),

    #[error("Blob format not supported: {0}")]
    Unimplemented(String),

    #[error("Invalid zip archive {1}: {0}")]
    Zip(zip::result::ZipError, PathBuf),

    #[error("Empty target for symlink {0}")]
    EmptySymlink(PathBuf),

    #[error("Unsupported entry type for {0}: {1}")]
    UnsupportedEntry(PathBuf, String),

    #[error("Extraction cancelled.")]
    Cancelled,
}

impl ExtractError {
    /// Attach a path to an I/O error.
    ///
    /// Errors from a cancelled [`CancelToken`] are converted to
    /// [`ExtractError::Cancelled`].
    pub(crate) fn io(error: io::Error, path: impl AsRef<Path>) -> Self {
        if crate::cancel::is_cancellation(&error) {
            ExtractError::Cancelled
        } else {
            ExtractError::Io(error, path.as_ref().to_owned())
        }
    }

    fn zip(error: zip::result::ZipError, path: &Path) -> Self {
        match error {
            zip::result::ZipError::Io(e) => ExtractError::io(e, path),
            e => ExtractError::Zip(e, path.to_owned()),
        }
    }
}

macro_rules! try_io {
    ($path:expr, $e:expr $(,)?) => {
        $e.map_err(|e| $crate::extract::ExtractError::io(::std::io::Error::from(e), $path))?
    };
}

// Make visible to mods.
use try_io;

/// Default mode for zip entries without Unix permissions.
const ZIP_DIR_MODE: u32 = 0o755;

const ZIP_FILE_MODE: u32 = 0o644;

/// Destination of the blobs of an image.
///
/// Layers are extracted in order with [`Rootfs::extract_layer`]. Modes
/// and modification times of the directories are applied in
/// [`Rootfs::finish`], when all layers are written.
pub struct Rootfs {
    path: PathBuf,
    root: Directory,
    dirs_metadata: DirectoryMetadata,
}

impl Rootfs {
    /// Open the directory at `path`. It is created if it does not exist.
    pub fn open(path: &Path) -> Result<Self, ExtractError> {
        try_io!(path, std::fs::create_dir_all(path));

        Ok(Rootfs {
            path: path.to_owned(),
            root: try_io!(path, Directory::new(path)),
            dirs_metadata: Default::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Extract the blob at `blob` to this root.
    ///
    /// Blobs with an unrecognized format are skipped.
    pub fn extract_layer(
        &mut self,
        blob: &Path,
        includes: &Includes,
        token: &CancelToken,
    ) -> Result<(), ExtractError> {
        let mut file = try_io!(blob, File::open(blob));
        let format = try_io!(blob, format::identify(&mut file));

        tracing::debug!(%format, "Blob format detected");

        let mut writer = Writer::new(&self.root, &mut self.dirs_metadata, includes, token);

        let reader: Box<dyn Read> = match format {
            Format::Zip => return extract_zip(blob, file, &mut writer),

            Format::Tar => Box::new(BufReader::new(file)),

            Format::TarGzip | Format::BareGzip => {
                Box::new(flate2::read::MultiGzDecoder::new(BufReader::new(file)))
            }

            Format::TarXz => Box::new(xz2::read::XzDecoder::new_multi_decoder(BufReader::new(
                file,
            ))),

            #[cfg(feature = "zstd")]
            Format::TarZstd => Box::new(try_io!(blob, zstd::stream::read::Decoder::new(file))),

            #[cfg(not(feature = "zstd"))]
            Format::TarZstd => return Err(ExtractError::Unimplemented("zstd".into())),

            Format::Unimplemented(name) => return Err(ExtractError::Unimplemented(name.into())),

            Format::Unrecognized => {
                tracing::warn!("Unrecognized blob format, skipping");
                return Ok(());
            }
        };

        extract_tar(blob, token.reader(reader), &mut writer)
    }

    /// Apply metadata of the directories.
    pub fn finish(self) -> Result<(), ExtractError> {
        apply_directory_metadata(&self.root, self.dirs_metadata)
    }
}

/// Extract a single blob to `dest`.
///
/// # Examples
///
/// ```no_run
/// # use std::path::Path;
/// # use undock::*;
/// let token = CancelToken::new();
/// let includes = Includes::new(["usr/bin"]);
///
/// extract_blob(Path::new("layer.tar.gz"), Path::new("rootfs"), &includes, &token).unwrap();
/// ```
pub fn extract_blob(
    blob: &Path,
    dest: &Path,
    includes: &Includes,
    token: &CancelToken,
) -> Result<(), ExtractError> {
    let mut rootfs = Rootfs::open(dest)?;
    rootfs.extract_layer(blob, includes, token)?;
    rootfs.finish()
}

fn extract_tar(blob: &Path, reader: impl Read, writer: &mut Writer) -> Result<(), ExtractError> {
    use tar::EntryType;

    let mut archive = tar::Archive::new(reader);

    for entry in try_io!(blob, archive.entries()) {
        let mut entry = try_io!(blob, entry);
        let path = try_io!(blob, entry.path()).into_owned();

        let link_name = || -> io::Result<PathBuf> {
            Ok(entry
                .link_name()?
                .map(|l| l.into_owned())
                .unwrap_or_default())
        };

        let kind = match entry.header().entry_type() {
            EntryType::Directory => EntryKind::Directory,
            EntryType::Regular | EntryType::Continuous => EntryKind::File,
            EntryType::Symlink => EntryKind::Symlink(try_io!(&path, link_name())),
            EntryType::Link => EntryKind::HardLink(try_io!(&path, link_name())),

            // Metadata for other entries.
            EntryType::XGlobalHeader
            | EntryType::XHeader
            | EntryType::GNULongName
            | EntryType::GNULongLink => continue,

            other => EntryKind::Unsupported(format!("{other:?}")),
        };

        let header = entry.header();
        let mode = try_io!(&path, header.mode());
        let mtime = header.mtime().ok();

        writer.write(ArchiveEntry {
            path,
            kind,
            mode,
            mtime,
            content: &mut entry,
        })?;
    }

    Ok(())
}

fn extract_zip(blob: &Path, file: File, writer: &mut Writer) -> Result<(), ExtractError> {
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| ExtractError::zip(e, blob))?;

    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| ExtractError::zip(e, blob))?;

        let path = PathBuf::from(file.name());
        let unix_mode = file.unix_mode();

        let is_symlink = unix_mode.is_some_and(|m| FileType::from_raw_mode(m) == FileType::Symlink);

        let (kind, default_mode) = if file.is_dir() {
            (EntryKind::Directory, ZIP_DIR_MODE)
        } else if is_symlink {
            let mut target = String::new();
            try_io!(&path, file.read_to_string(&mut target));
            (EntryKind::Symlink(target.into()), ZIP_FILE_MODE)
        } else {
            (EntryKind::File, ZIP_FILE_MODE)
        };

        writer.write(ArchiveEntry {
            path,
            kind,
            mode: unix_mode.unwrap_or(default_mode),
            mtime: None,
            content: &mut file,
        })?;
    }

    Ok(())
}
