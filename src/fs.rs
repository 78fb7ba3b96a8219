use std::{
    io,
    num::NonZeroUsize,
    path::{Component, Path, PathBuf},
};

use rustix::{
    fd::{AsFd, BorrowedFd, OwnedFd},
    fs::{mkdirat, openat, openat2, statat, unlinkat, AtFlags, FileType, Mode, OFlags, ResolveFlags},
    io::Errno,
    path::Arg,
};

/// Provides some functions to create files and directories under a specific path.
///
/// It relies on a file descriptor to ensure that new entries are never created
/// outside the root.
pub(crate) struct Directory {
    fd: OwnedFd,
}

impl AsFd for Directory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Directory {
    pub fn new<P: Arg>(target: P) -> Result<Self, Errno> {
        let fd = openat(
            rustix::fs::CWD,
            target,
            OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;

        Ok(Directory { fd })
    }

    /// Return a file descriptor for a directory.
    ///
    /// Symbolic links are resolved as if this directory was the root
    /// of the filesystem.
    ///
    /// If `create` is `true`, the directory is created if it does not exist.
    pub fn open_directory<P>(&self, path: P, create: bool) -> Result<OwnedFd, Errno>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut created = false;

        loop {
            let result = openat2(
                self,
                path,
                OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
                Mode::empty(),
                ResolveFlags::IN_ROOT | ResolveFlags::NO_MAGICLINKS,
            );

            match result {
                Err(e) if create && !created && e.kind() == io::ErrorKind::NotFound => (),
                r => return r,
            }

            let file_name = match path.file_name() {
                Some(f) => f,
                None => return Err(Errno::NOENT),
            };

            // `mkdirat` needs a FD to the parent, so symlinks in the
            // path are resolved with `RESOLVE_IN_ROOT`.
            let owned_slot;
            let parent = match path.parent() {
                Some(p) if p == Path::new("") || p == Path::new("/") => &self.fd,

                None => &self.fd,

                Some(p) => {
                    owned_slot = self.open_directory(p, create)?;
                    &owned_slot
                }
            };

            match mkdirat(parent.as_fd(), file_name, Mode::from_raw_mode(0o755)) {
                // EEXIST if it was created by another writer after `openat2`.
                Ok(()) | Err(Errno::EXIST) => created = true,
                Err(e) => return Err(e),
            }
        }
    }
}

/// LRU cache of file descriptors for directories.
pub(crate) struct DirFdCache<'a> {
    directory: &'a Directory,
    cache: lru::LruCache<PathBuf, OwnedFd>,
}

/// Number of entries in a file descriptor cache.
const FDS_CACHE: NonZeroUsize = match NonZeroUsize::new(16) {
    Some(n) => n,
    None => unreachable!(),
};

impl<'a> DirFdCache<'a> {
    pub fn new(directory: &'a Directory) -> Self {
        let cache = lru::LruCache::new(FDS_CACHE);
        DirFdCache { directory, cache }
    }

    /// Get a file descriptor for a directory.
    pub fn get<P>(&mut self, path: P, create: bool) -> Result<BorrowedFd, Errno>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();

        self.cache
            .try_get_or_insert_ref(path, || self.directory.open_directory(path, create))
            .map(|fd| fd.as_fd())
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Convert a path from an archive entry to a path relative to the
/// destination root.
///
/// The path is returned in a `(parent, file_name)` pair.
///
/// The parent is always prefixed with `/`.
pub fn normalize_path<T: AsRef<Path>>(path: T) -> io::Result<(PathBuf, PathBuf)> {
    let mut parent_path = PathBuf::from("/");
    let mut file_name = None;

    // Similar to `tar::Entry::unpack_in`.
    for component in path.as_ref().components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => continue,

            // Don't trust entries with `..` in the path.
            Component::ParentDir => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Found '..' in the path.",
                ));
            }

            Component::Normal(part) => {
                if let Some(previous) = file_name.take() {
                    parent_path.push(previous);
                }

                file_name = Some(part)
            }
        }
    }

    let file_name = match file_name {
        Some(file_name) => PathBuf::from(file_name),

        None => PathBuf::from("."),
    };

    Ok((parent_path, file_name))
}

/// Kind of entry removed by [`remove_entry`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RemovedEntry {
    Directory,
    Other,

    /// The entry did not exist. Another writer may have removed it.
    Missing,
}

/// Remove an entry in `parent`, without following symlinks.
///
/// Directories are removed only if they are empty.
pub fn remove_entry(parent: BorrowedFd, file_name: &Path) -> io::Result<RemovedEntry> {
    loop {
        let is_dir = match statat(parent, file_name, AtFlags::SYMLINK_NOFOLLOW) {
            Ok(stat) => (FileType::from_raw_mode(stat.st_mode) == FileType::Directory),
            Err(Errno::NOENT) => return Ok(RemovedEntry::Missing),
            Err(e) => return Err(e.into()),
        };

        let (flags, removed) = if is_dir {
            (AtFlags::REMOVEDIR, RemovedEntry::Directory)
        } else {
            (AtFlags::empty(), RemovedEntry::Other)
        };

        match unlinkat(parent, file_name, flags) {
            Ok(()) => return Ok(removed),
            Err(Errno::NOENT) => return Ok(RemovedEntry::Missing),

            // Replaced with a different kind of entry after `statat`.
            Err(Errno::NOTDIR | Errno::ISDIR) => continue,

            Err(e) => return Err(e.into()),
        }
    }
}

/// Check if an entry in `parent` is a directory.
///
/// If `follow` is `false`, a symlink to a directory is not a directory.
pub fn is_directory(parent: BorrowedFd, file_name: &Path, follow: bool) -> io::Result<bool> {
    let flags = if follow {
        AtFlags::empty()
    } else {
        AtFlags::SYMLINK_NOFOLLOW
    };

    let stat = statat(parent, file_name, flags)?;
    Ok((FileType::from_raw_mode(stat.st_mode) == FileType::Directory))
}

#[test]
fn normalize_entry_paths() {
    let check = |path: &str, parent: &str, name: &str| {
        let (p, n) = normalize_path(path).unwrap();
        assert_eq!((p.to_str().unwrap(), n.to_str().unwrap()), (parent, name), "{path}");
    };

    check("a/b/c", "/a/b", "c");
    check("./a/b/", "/a", "b");
    check("/abs", "/", "abs");
    check("./", "/", ".");

    assert!(normalize_path("a/../../etc/passwd").is_err());
}

#[test]
fn directories_stay_in_root() {
    let root = tempfile::tempdir().unwrap();
    let inner = root.path().join("inner");
    std::fs::create_dir(&inner).unwrap();

    std::os::unix::fs::symlink("/", inner.join("absolute")).unwrap();
    std::os::unix::fs::symlink("../../..", inner.join("relative")).unwrap();

    let directory = Directory::new(&inner).unwrap();
    directory.open_directory("absolute/a", true).unwrap();
    directory.open_directory("relative/b/c", true).unwrap();

    // Both symlinks are resolved to the root of `directory`.
    assert!(inner.join("a").is_dir());
    assert!(inner.join("b/c").is_dir());
    assert!(!root.path().join("b").exists());
}

#[test]
fn remove_entries() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("dir")).unwrap();
    std::fs::write(root.path().join("file"), "x").unwrap();
    std::os::unix::fs::symlink("dir", root.path().join("link")).unwrap();

    let directory = Directory::new(root.path()).unwrap();
    let fd = directory.as_fd();

    assert!(is_directory(fd, Path::new("link"), true).unwrap());
    assert!(!is_directory(fd, Path::new("link"), false).unwrap());

    assert_eq!(remove_entry(fd, Path::new("link")).unwrap(), RemovedEntry::Other);
    assert_eq!(remove_entry(fd, Path::new("file")).unwrap(), RemovedEntry::Other);
    assert_eq!(remove_entry(fd, Path::new("dir")).unwrap(), RemovedEntry::Directory);

    assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());

    // Already removed, as when two writers replace the same entry.
    assert_eq!(remove_entry(fd, Path::new("file")).unwrap(), RemovedEntry::Missing);
}
