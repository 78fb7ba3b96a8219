use std::path::{Component, Path, PathBuf};

/// Subset of paths to extract from the archives.
///
/// An entry is included if its path is equal to an item of the list, or
/// if it is a descendant of one. An empty list includes every entry.
///
/// # Examples
///
/// ```
/// # use undock::*;
/// let includes = Includes::new(["/a/b"]);
///
/// assert!(includes.matches("a/b"));
/// assert!(includes.matches("./a/b/c.txt"));
/// assert!(!includes.matches("a/bc.txt"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct Includes {
    paths: Vec<PathBuf>,
}

impl Includes {
    /// Build the list from user-supplied paths.
    ///
    /// Leading `/` is dropped, and empty items are ignored.
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = items
            .into_iter()
            .map(|item| relative_path(Path::new(item.as_ref())))
            .filter(|path| path.components().next().is_some())
            .collect();

        Includes { paths }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Check if `path`, from an archive entry, has to be extracted.
    pub fn matches(&self, path: impl AsRef<Path>) -> bool {
        if self.paths.is_empty() {
            return true;
        }

        let path = relative_path(path.as_ref());
        self.paths.iter().any(|include| path.starts_with(include))
    }
}

/// Remove `/` and `.` components.
fn relative_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
        .collect()
}

#[test]
fn include_filter() {
    let includes = Includes::new(["a/b", "", "/", "/etc/passwd"]);

    assert!(!includes.is_empty());

    for path in ["a/b", "a/b/", "./a/b/c.txt", "/a/b/c/d", "etc/passwd"] {
        assert!(includes.matches(path), "{path}");
    }

    for path in ["a/bc.txt", "a", "b/a/b", "etc/passwd-", "etc"] {
        assert!(!includes.matches(path), "{path}");
    }
}

#[test]
fn empty_filter_includes_everything() {
    let includes = Includes::new(["", "/"]);

    assert!(includes.is_empty());
    assert!(includes.matches("anything/at/all"));
    assert!(Includes::default().matches("x"));
}
