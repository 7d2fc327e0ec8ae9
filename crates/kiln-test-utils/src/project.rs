use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tempfile::TempDir;

/// A project directory plus a sibling cache directory, both removed on drop.
#[derive(Debug)]
pub struct ProjectFixture {
    temp: TempDir,
    project_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ProjectFixture {
    pub fn new(project_name: &str) -> Self {
        let temp = tempfile::tempdir().expect("create temp dir");
        let project_dir = temp.path().join(project_name);
        let cache_dir = temp.path().join("cache");
        fs::create_dir_all(&project_dir).expect("create project dir");
        Self {
            temp,
            project_dir,
            cache_dir,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Absolute path of `relative` inside the project directory.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.project_dir.join(relative)
    }

    /// Writes `contents` to `relative`, creating parent directories.
    ///
    /// The modification time is pushed one second past the previous one (if
    /// the file existed) so that rewrites are observable even on filesystems
    /// with coarse timestamps.
    pub fn write(&self, relative: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path(relative);
        let previous = fs::metadata(&path).ok().map(|m| FileTime::from_last_modification_time(&m));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, contents).expect("write fixture file");
        if let Some(previous) = previous {
            let bumped =
                FileTime::from_unix_time(previous.unix_seconds() + 1, previous.nanoseconds());
            filetime::set_file_mtime(&path, bumped).expect("bump mtime");
        }
        path
    }

    pub fn read(&self, relative: &str) -> Vec<u8> {
        fs::read(self.path(relative)).expect("read fixture file")
    }

    pub fn remove(&self, relative: &str) {
        fs::remove_file(self.path(relative)).expect("remove fixture file");
    }
}
