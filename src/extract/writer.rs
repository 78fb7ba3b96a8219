use std::{
    cmp::Reverse,
    collections::BTreeMap,
    fs::File,
    io::{
        self,
        ErrorKind::{AlreadyExists, NotFound},
        Read,
    },
    path::{Path, PathBuf},
};

use rustix::{
    fd::OwnedFd,
    fs::{self, AtFlags, Mode, OFlags, ResolveFlags},
};

use crate::{
    cancel::CancelToken,
    fs::{is_directory, normalize_path, remove_entry, DirFdCache, Directory, RemovedEntry},
};

use super::{try_io, ExtractError, Includes};

/// Mode and mtime of a directory, applied after all layers are extracted.
#[derive(Debug)]
pub(crate) struct DirectoryMetadataEntry {
    pub mode: Mode,
    pub mtime: Option<u64>,
}

impl DirectoryMetadataEntry {
    /// Key to sort entries, so deeper directories are updated first.
    pub fn key(path: PathBuf) -> (Reverse<usize>, PathBuf) {
        (Reverse(path.components().count()), path)
    }
}

pub(crate) type DirectoryMetadata = BTreeMap<(Reverse<usize>, PathBuf), DirectoryMetadataEntry>;

/// Kind of an archive entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink(PathBuf),

    /// Hard link to a previous entry in the archive.
    HardLink(PathBuf),

    /// Devices, FIFOs, and anything else that can't be extracted.
    Unsupported(String),
}

/// An entry from a tar or zip archive.
pub struct ArchiveEntry<'a> {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
    pub mtime: Option<u64>,
    pub content: &'a mut dyn Read,
}

/// Write archive entries in a destination root.
pub(crate) struct Writer<'a> {
    root: &'a Directory,
    dirs_cache: DirFdCache<'a>,
    dirs_metadata: &'a mut DirectoryMetadata,
    includes: &'a Includes,
    token: &'a CancelToken,
    cached_link_dirfd: Option<(PathBuf, OwnedFd)>,
}

impl<'a> Writer<'a> {
    pub fn new(
        root: &'a Directory,
        dirs_metadata: &'a mut DirectoryMetadata,
        includes: &'a Includes,
        token: &'a CancelToken,
    ) -> Self {
        Writer {
            root,
            dirs_cache: DirFdCache::new(root),
            dirs_metadata,
            includes,
            token,
            cached_link_dirfd: None,
        }
    }

    pub fn write(&mut self, entry: ArchiveEntry) -> Result<(), ExtractError> {
        if self.token.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let ArchiveEntry {
            path,
            kind,
            mode,
            mtime,
            content,
        } = entry;

        if !self.includes.matches(&path) {
            tracing::trace!(path = %path.display(), "Entry not included");
            return Ok(());
        }

        let (parent_path, file_name) = try_io!(&path, normalize_path(&path));

        // Entries for the root itself, like `./`.
        if file_name == Path::new(".") {
            return Ok(());
        }

        let mode = Mode::from_raw_mode(mode & 0o7777);

        match kind {
            EntryKind::Directory => {
                tracing::trace!(path = %path.display(), "Directory");
                try_io!(&path, self.write_dir(parent_path, &file_name, mode, mtime));
            }

            EntryKind::File => {
                tracing::debug!(path = %path.display(), "File");
                try_io!(
                    &path,
                    self.write_file(&parent_path, &file_name, mode, mtime, content)
                );
            }

            EntryKind::Symlink(target) => {
                if target.as_os_str().is_empty() {
                    return Err(ExtractError::EmptySymlink(path));
                }

                tracing::debug!(path = %path.display(), target = %target.display(), "Symlink");
                try_io!(&path, self.write_symlink(parent_path, &file_name, &target, mtime));
            }

            EntryKind::HardLink(target) => {
                if !self.includes.matches(&target) {
                    tracing::warn!(
                        path = %path.display(),
                        target = %target.display(),
                        "Hard link to an entry not included, skipping"
                    );
                    return Ok(());
                }

                tracing::debug!(path = %path.display(), target = %target.display(), "Hard link");
                try_io!(&path, self.write_hardlink(parent_path, &file_name, &target));
            }

            EntryKind::Unsupported(kind) => return Err(ExtractError::UnsupportedEntry(path, kind)),
        }

        Ok(())
    }

    fn write_dir(
        &mut self,
        parent_path: PathBuf,
        file_name: &Path,
        mode: Mode,
        mtime: Option<u64>,
    ) -> io::Result<()> {
        let full_path = parent_path.join(file_name);
        let parent_fd = self.dirs_cache.get(&parent_path, true)?;

        loop {
            // The owner needs write access until all layers are extracted.
            match fs::mkdirat(parent_fd, file_name, mode | Mode::RWXU) {
                Ok(()) => break,

                Err(e) if e.kind() == AlreadyExists => {
                    match is_directory(parent_fd, file_name, false) {
                        Ok(true) => break,
                        Ok(false) => (),

                        // Removed by another writer. Try again.
                        Err(e) if e.kind() == NotFound => continue,
                        Err(e) => return Err(e),
                    }

                    // Keep symlinks to directories inside the root.
                    if self.root.open_directory(&full_path, false).is_ok() {
                        return Ok(());
                    }

                    remove_entry(parent_fd, file_name)?;
                }

                Err(e) => return Err(e.into()),
            }
        }

        self.dirs_metadata.insert(
            DirectoryMetadataEntry::key(full_path),
            DirectoryMetadataEntry { mode, mtime },
        );

        Ok(())
    }

    fn write_file(
        &mut self,
        parent_path: &Path,
        file_name: &Path,
        mode: Mode,
        mtime: Option<u64>,
        content: &mut dyn Read,
    ) -> io::Result<()> {
        let parent_fd = self.dirs_cache.get(parent_path, true)?;

        let mut output = loop {
            let result = fs::openat2(
                parent_fd,
                file_name,
                OFlags::CREATE | OFlags::EXCL | OFlags::WRONLY | OFlags::CLOEXEC,
                mode,
                ResolveFlags::BENEATH,
            );

            match result {
                Ok(f) => break File::from(f),

                Err(e) if e.kind() == AlreadyExists => {
                    if remove_entry(parent_fd, file_name)? == RemovedEntry::Directory {
                        let key = DirectoryMetadataEntry::key(parent_path.join(file_name));
                        self.dirs_metadata.remove(&key);
                    }
                }

                Err(e) => return Err(e.into()),
            }
        };

        io::copy(&mut self.token.reader(content), &mut output)?;

        fs::fchmod(&output, mode)?;

        if let Some(mtime) = mtime {
            fs::futimens(&output, &make_timestamps(mtime))?;
        }

        Ok(())
    }

    fn write_symlink(
        &mut self,
        parent_path: PathBuf,
        file_name: &Path,
        target: &Path,
        mtime: Option<u64>,
    ) -> io::Result<()> {
        let parent_fd = self.dirs_cache.get(&parent_path, true)?;

        loop {
            match fs::symlinkat(target, parent_fd, file_name) {
                Ok(()) => break,

                Err(e) if e.kind() == AlreadyExists => {
                    if remove_entry(parent_fd, file_name)? == RemovedEntry::Directory {
                        let key = DirectoryMetadataEntry::key(parent_path.join(file_name));
                        self.dirs_metadata.remove(&key);
                    }
                }

                Err(e) => return Err(e.into()),
            }
        }

        if let Some(mtime) = mtime {
            let times = make_timestamps(mtime);

            // The link can be replaced by another writer in the same root.
            match fs::utimensat(parent_fd, file_name, &times, AtFlags::SYMLINK_NOFOLLOW) {
                Ok(()) | Err(rustix::io::Errno::NOENT) => (),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn write_hardlink(
        &mut self,
        parent_path: PathBuf,
        file_name: &Path,
        target: &Path,
    ) -> io::Result<()> {
        let (old_parent, old_name) = normalize_path(target)?;

        // The descriptor of the source directory is cached because some
        // archives have multiple consecutive links in the same directory.
        let old_dirfd = match self.cached_link_dirfd.take() {
            Some((cached_path, fd)) if cached_path == old_parent => fd,
            _ => self.root.open_directory(&old_parent, false)?,
        };

        let parent_fd = self.dirs_cache.get(&parent_path, true)?;

        let result = loop {
            match fs::linkat(&old_dirfd, &old_name, parent_fd, file_name, AtFlags::empty()) {
                Err(e) if e.kind() == AlreadyExists => {
                    remove_entry(parent_fd, file_name)?;
                }

                r => break r,
            }
        };

        self.cached_link_dirfd = Some((old_parent, old_dirfd));

        Ok(result?)
    }
}

/// Apply the metadata of the directories, after all entries are written.
///
/// Entries that are not directories anymore are ignored.
pub(crate) fn apply_directory_metadata(
    root: &Directory,
    dirs_metadata: DirectoryMetadata,
) -> Result<(), ExtractError> {
    let mut dirs_cache = DirFdCache::new(root);

    for ((_, path), entry) in dirs_metadata {
        let mut update = || -> io::Result<()> {
            let (parent_path, file_name) = normalize_path(&path)?;
            let parent = dirs_cache.get(&parent_path, false)?;

            if !is_directory(parent, &file_name, false)? {
                return Ok(());
            }

            fs::chmodat(parent, &file_name, entry.mode, AtFlags::empty())?;

            if let Some(mtime) = entry.mtime {
                fs::utimensat(
                    parent,
                    &file_name,
                    &make_timestamps(mtime),
                    AtFlags::SYMLINK_NOFOLLOW,
                )?;
            }

            Ok(())
        };

        match update() {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(ExtractError::io(e, &path));
            }

            _ => (),
        }
    }

    Ok(())
}

fn make_timestamps(mtime: u64) -> fs::Timestamps {
    let mtime = fs::Timespec {
        tv_sec: i64::try_from(mtime).unwrap_or_default(),
        tv_nsec: 0,
    };

    fs::Timestamps {
        last_access: mtime,
        last_modification: mtime,
    }
}
