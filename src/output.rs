//! Output file layout for per-device and per-test artifacts.
//!
//! The engine never interprets file contents; it only decides where files
//! go. The layout is deterministic:
//!
//! ```text
//! <root>/<type dir>/<pool>/<serial>.<suffix>              per device
//! <root>/<type dir>/<pool>/<serial>/<test name>.<suffix>  per test
//! ```

use std::path::{Path, PathBuf};

use crate::device::DevicePoolId;
use crate::test::Test;

/// Kind of artifact, which picks the directory and file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    TestResult,
    Log,
    Screenshot,
    Video,
}

impl FileType {
    pub fn dir(&self) -> &'static str {
        match self {
            FileType::TestResult => "tests",
            FileType::Log => "logs",
            FileType::Screenshot => "screenshot",
            FileType::Video => "video",
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            FileType::TestResult => "xml",
            FileType::Log => "log",
            FileType::Screenshot => "gif",
            FileType::Video => "mp4",
        }
    }
}

/// Creates output paths under a fixed root.
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
}

impl FileManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of a per-device file, creating its directory.
    pub fn device_file(
        &self,
        file_type: FileType,
        pool: &DevicePoolId,
        serial: &str,
    ) -> std::io::Result<PathBuf> {
        let dir = self.pool_dir(file_type, pool);
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(format!(
            "{}.{}",
            sanitize(serial),
            file_type.suffix()
        )))
    }

    /// Returns the path of a per-test file, creating its directory.
    pub fn test_file(
        &self,
        file_type: FileType,
        pool: &DevicePoolId,
        serial: &str,
        test: &Test,
    ) -> std::io::Result<PathBuf> {
        let dir = self.pool_dir(file_type, pool).join(sanitize(serial));
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(format!(
            "{}.{}",
            sanitize(&test.name()),
            file_type.suffix()
        )))
    }

    /// Lists the files of one type written for a pool's device.
    pub fn device_files(
        &self,
        file_type: FileType,
        pool: &DevicePoolId,
        serial: &str,
    ) -> std::io::Result<Vec<PathBuf>> {
        let dir = self.pool_dir(file_type, pool).join(sanitize(serial));
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == file_type.suffix()) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn pool_dir(&self, file_type: FileType, pool: &DevicePoolId) -> PathBuf {
        self.root.join(file_type.dir()).join(sanitize(pool.name()))
    }
}

/// Keeps path components from escaping their directory.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}
