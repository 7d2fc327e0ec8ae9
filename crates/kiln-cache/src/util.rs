use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{CacheError, Result};
use crate::retry::{retry_io, RetryPolicy};

/// Result of publishing a file that may already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// Another writer got there first; its file was left untouched.
    AlreadyPresent,
}

/// Writes `dest` through a temp file in the same directory and publishes it
/// with a no-clobber rename. An existing `dest` is never overwritten.
pub fn install_once(
    policy: &RetryPolicy,
    dest: &Path,
    mut write: impl FnMut(&mut fs::File) -> io::Result<()>,
) -> Result<InstallOutcome> {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    retry_io(policy, "create_dir", parent, || fs::create_dir_all(parent))?;

    if dest.exists() {
        return Ok(InstallOutcome::AlreadyPresent);
    }

    let file_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("entry");
    let mut tmp = retry_io(policy, "create_temp", parent, || {
        tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".tmp")
            .tempfile_in(parent)
    })?;
    write_and_sync(&mut tmp, &mut write).map_err(|err| CacheError::io(tmp.path(), err))?;
    persist(policy, tmp, dest)
}

/// Copies `src` into place at `dest` with [`install_once`] semantics.
pub fn install_copy_once(policy: &RetryPolicy, src: &Path, dest: &Path) -> Result<InstallOutcome> {
    install_once(policy, dest, |file| {
        let mut source = fs::File::open(src)?;
        io::copy(&mut source, file)?;
        Ok(())
    })
}

/// Replaces `dest` atomically, for files the cache does not own (restored
/// outputs in the project directory).
pub(crate) fn replace_file(
    policy: &RetryPolicy,
    dest: &Path,
    mut write: impl FnMut(&mut fs::File) -> io::Result<()>,
) -> Result<()> {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    retry_io(policy, "create_dir", parent, || fs::create_dir_all(parent))?;
    let mut tmp = retry_io(policy, "create_temp", parent, || {
        tempfile::Builder::new().suffix(".tmp").tempfile_in(parent)
    })?;
    write_and_sync(&mut tmp, &mut write).map_err(|err| CacheError::io(tmp.path(), err))?;
    let mut pending = Some(tmp);
    retry_io(policy, "rename", dest, || {
        let tmp = pending
            .take()
            .ok_or_else(|| io::Error::other("temp file already consumed"))?;
        match tmp.persist(dest) {
            Ok(_) => Ok(()),
            Err(err) => {
                pending = Some(err.file);
                Err(err.error)
            }
        }
    })
}

/// Reads `path`, mapping `NotFound` to `None`.
pub(crate) fn read_if_exists(policy: &RetryPolicy, path: &Path) -> Result<Option<Vec<u8>>> {
    retry_io(policy, "read", path, || match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    })
}

fn write_and_sync(
    tmp: &mut NamedTempFile,
    write: &mut impl FnMut(&mut fs::File) -> io::Result<()>,
) -> io::Result<()> {
    let file = tmp.as_file_mut();
    write(file)?;
    file.flush()?;
    file.sync_all()
}

fn persist(policy: &RetryPolicy, tmp: NamedTempFile, dest: &Path) -> Result<InstallOutcome> {
    let mut pending = Some(tmp);
    retry_io(policy, "rename", dest, || {
        let tmp = pending
            .take()
            .ok_or_else(|| io::Error::other("temp file already consumed"))?;
        match tmp.persist_noclobber(dest) {
            Ok(_) => Ok(InstallOutcome::Installed),
            Err(err) if dest.exists() => {
                tracing::debug!(
                    target = "kiln.cache",
                    path = %dest.display(),
                    error = %err.error,
                    "destination appeared concurrently; keeping existing file"
                );
                Ok(InstallOutcome::AlreadyPresent)
            }
            Err(err) => {
                pending = Some(err.file);
                Err(err.error)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("value");
        let policy = RetryPolicy::default();

        let first = install_once(&policy, &dest, |f| f.write_all(b"first")).unwrap();
        let second = install_once(&policy, &dest, |f| f.write_all(b"second")).unwrap();

        assert_eq!(first, InstallOutcome::Installed);
        assert_eq!(second, InstallOutcome::AlreadyPresent);
        assert_eq!(fs::read(&dest).unwrap(), b"first");
    }

    #[test]
    fn failed_writes_leave_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("value");
        let err = install_once(&RetryPolicy::default(), &dest, |_| {
            Err(io::Error::from(io::ErrorKind::InvalidData))
        })
        .unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn copies_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetryPolicy::default();
        let src = dir.path().join("src");
        fs::write(&src, b"payload").unwrap();

        let dest = dir.path().join("copy");
        assert_eq!(install_copy_once(&policy, &src, &dest).unwrap(), InstallOutcome::Installed);
        assert_eq!(fs::read(&dest).unwrap(), b"payload");

        replace_file(&policy, &dest, |f| f.write_all(b"new")).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert_eq!(read_if_exists(&policy, &dir.path().join("missing")).unwrap(), None);
    }
}
