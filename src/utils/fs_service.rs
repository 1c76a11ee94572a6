use std::path::Path;

use anyhow::Result;

/// A service for working with the file system.
pub trait FsService: Sync + Send {
    /// Determine whether the given file path points to a file.
    ///
    /// # Arguments
    ///
    /// * `path` - Filesystem path to check.
    ///
    /// # Returns
    ///
    /// true if there is a file at the given path.
    fn file_exists(&self, path: &str) -> bool;

    /// Write the given contents to a file at the given path.
    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;
}

pub struct FsServiceImpl {}

/// Implementation of FsService.
impl FsServiceImpl {
    /// Create a new instance of FsServiceImpl.
    pub fn new() -> Self {
        Self {}
    }
}

impl FsService for FsServiceImpl {
    fn file_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        std::fs::write(path, contents)?;
        Ok(())
    }
}
