//! Path handling and advisory file locking.
//!
//! Paths crossing the wire are always relative; everything the client or
//! server touches locally goes through [`clean_path`] first so that symlinks
//! and relative components cannot smuggle a file outside its root.

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Resolve symlinks and produce an absolute path.
///
/// A dangling final component is tolerated: the parent is canonicalised and
/// the file name re-attached, so paths for files that are still being
/// written resolve the same way as finished ones.
///
/// # Errors
///
/// Returns an error if the path has no resolvable ancestor.
pub fn clean_path(path: &Path) -> Result<PathBuf> {
    match path.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) => {
            let parent = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;
            let parent = parent
                .canonicalize()
                .map_err(|_| Error::InvalidPath(path.display().to_string()))?;
            Ok(parent.join(file_name))
        }
    }
}

/// Returns true if `subdir` lies strictly beneath `root` (or equals it).
pub fn is_subdir(root: &Path, subdir: &Path) -> bool {
    let (Ok(root), Ok(subdir)) = (clean_path(root), clean_path(subdir)) else {
        return false;
    };
    subdir.starts_with(&root)
}

/// Sanitize a relative path before joining it onto a base directory.
///
/// Rejects absolute paths and any parent-directory traversal.
pub fn sanitize_path(base: &Path, relative: &Path) -> Option<PathBuf> {
    if relative.is_absolute() {
        return None;
    }
    for component in relative.components() {
        if matches!(component, Component::ParentDir) {
            return None;
        }
    }

    let full_path = base.join(relative);
    if full_path.starts_with(base) {
        Some(full_path)
    } else {
        None
    }
}

/// Bump a file's modification time to now.
///
/// Used to re-trigger the watcher for a file whose transfer failed.
///
/// # Errors
///
/// Returns an error if the file cannot be opened for writing.
pub fn touch(path: &Path) -> Result<()> {
    let file = File::options().write(true).open(path)?;
    file.set_modified(std::time::SystemTime::now())?;
    Ok(())
}

/// Exclusive advisory lock on an open file.
///
/// The lock is tied to the file descriptor and released on drop. On
/// non-unix platforms this degrades to a no-op marker.
#[derive(Debug)]
pub struct FileLock<'a> {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: &'a File,
    locked: bool,
}

impl<'a> FileLock<'a> {
    /// Acquire an exclusive lock on `file`, blocking until it is available.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock syscall fails.
    #[cfg(unix)]
    pub fn acquire(file: &'a File) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: flock on a valid owned descriptor.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { file, locked: true })
    }

    /// Acquire an exclusive lock on `file`.
    ///
    /// Advisory locking is unsupported on this platform; the guard is inert.
    #[cfg(not(unix))]
    pub fn acquire(file: &'a File) -> Result<Self> {
        Ok(Self {
            file,
            locked: false,
        })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        if self.locked {
            use std::os::unix::io::AsRawFd;
            // SAFETY: descriptor is still open; errors on unlock are ignored.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        let _ = self.locked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn clean_path_existing_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"x").unwrap();

        let cleaned = clean_path(&file).unwrap();
        assert!(cleaned.is_absolute());
        assert_eq!(cleaned.file_name().unwrap(), "a.bin");
    }

    #[test]
    fn clean_path_missing_leaf() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("not-yet-written.mkv");

        let cleaned = clean_path(&missing).unwrap();
        assert!(cleaned.is_absolute());
        assert_eq!(cleaned.file_name().unwrap(), "not-yet-written.mkv");
    }

    #[test]
    fn subdir_detection() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("tv/show");
        std::fs::create_dir_all(&nested).unwrap();

        assert!(is_subdir(dir.path(), &nested));
        assert!(is_subdir(dir.path(), dir.path()));
        assert!(!is_subdir(&nested, dir.path()));
    }

    #[test]
    fn sanitize_rejects_traversal() {
        let base = Path::new("/srv/media");
        assert!(sanitize_path(base, Path::new("tv/show/ep1.mp4")).is_some());
        assert!(sanitize_path(base, Path::new("../../etc/passwd")).is_none());
        assert!(sanitize_path(base, Path::new("/etc/passwd")).is_none());
    }

    #[test]
    fn lock_same_process_reacquire() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.bin");
        let file = File::create(&path).unwrap();

        let guard = FileLock::acquire(&file).unwrap();
        drop(guard);
        // Released on drop, so a second acquisition succeeds.
        let _guard = FileLock::acquire(&file).unwrap();
    }

    #[test]
    fn touch_updates_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.bin");
        std::fs::write(&path, b"data").unwrap();

        let before = std::fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        touch(&path).unwrap();
        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(after >= before);
    }
}
