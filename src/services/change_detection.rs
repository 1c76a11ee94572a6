//! Discover the files changed by a patch.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use anyhow::Result;
use tracing::{event, Level};

use crate::resmoke::external_cmd::run_command_in_dir;

const TEST_FILE_EXTENSION: &str = ".js";
const TEST_DIR_COMPONENT: &str = "jstests";

/// Interface for querying git about the working tree.
pub trait GitService: Send + Sync {
    /// Get the files that differ between the given revision and the working tree.
    ///
    /// Includes modified, added, renamed and deleted files.
    fn diff_file_list(&self, repo_dir: &Path, base_revision: &str) -> Result<Vec<String>>;

    /// Get files in the working tree that are not tracked by git.
    fn untracked_file_list(&self, repo_dir: &Path) -> Result<Vec<String>>;
}

/// Implementation of `GitService` that shells out to the git CLI.
pub struct GitCliService {}

impl GitCliService {
    pub fn new() -> Self {
        Self {}
    }
}

impl GitService for GitCliService {
    fn diff_file_list(&self, repo_dir: &Path, base_revision: &str) -> Result<Vec<String>> {
        let output = run_command_in_dir(
            &["git", "diff", "--name-only", base_revision],
            Some(repo_dir),
        )?;
        Ok(output.lines().map(|line| line.to_string()).collect())
    }

    fn untracked_file_list(&self, repo_dir: &Path) -> Result<Vec<String>> {
        let output = run_command_in_dir(
            &["git", "ls-files", "--others", "--exclude-standard"],
            Some(repo_dir),
        )?;
        Ok(output.lines().map(|line| line.to_string()).collect())
    }
}

/// A service to determine which files a patch touches.
pub trait ChangeDetectionService: Send + Sync {
    /// Find all files changed in the given repositories.
    ///
    /// # Arguments
    ///
    /// * `repos` - Directories of repositories to check.
    /// * `revision_map` - Map of repository name to the base revision to diff against.
    ///
    /// # Returns
    ///
    /// Set of changed file paths, relative to the process working directory and
    /// normalized to forward slashes.
    fn find_changed_files(
        &self,
        repos: &[PathBuf],
        revision_map: &HashMap<String, String>,
    ) -> Result<HashSet<String>>;

    /// Find the changed files that are test files.
    fn find_changed_tests(
        &self,
        repos: &[PathBuf],
        revision_map: &HashMap<String, String>,
    ) -> Result<HashSet<String>>;
}

pub struct ChangeDetectionServiceImpl {
    /// Service to query git with.
    git_service: std::sync::Arc<dyn GitService>,
}

impl ChangeDetectionServiceImpl {
    /// Create a new instance of the change detection service.
    pub fn new(git_service: std::sync::Arc<dyn GitService>) -> Self {
        Self { git_service }
    }

    fn changed_files_for_repo(&self, repo: &Path, base_revision: &str) -> Result<Vec<String>> {
        let mut files = self.git_service.diff_file_list(repo, base_revision)?;
        files.extend(self.git_service.untracked_file_list(repo)?);
        Ok(files)
    }
}

impl ChangeDetectionService for ChangeDetectionServiceImpl {
    fn find_changed_files(
        &self,
        repos: &[PathBuf],
        revision_map: &HashMap<String, String>,
    ) -> Result<HashSet<String>> {
        let mut changed_files = HashSet::new();
        for repo in repos {
            let repo_name = repo
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| repo.display().to_string());
            let base_revision = match revision_map.get(&repo_name) {
                Some(revision) => revision,
                None => continue,
            };
            for file in self.changed_files_for_repo(repo, base_revision)? {
                changed_files.insert(relative_to_cwd(repo, &file));
            }
        }
        event!(
            Level::INFO,
            count = changed_files.len(),
            "Detected changed files"
        );
        Ok(changed_files)
    }

    fn find_changed_tests(
        &self,
        repos: &[PathBuf],
        revision_map: &HashMap<String, String>,
    ) -> Result<HashSet<String>> {
        Ok(self
            .find_changed_files(repos, revision_map)?
            .into_iter()
            .filter(|file| is_test_file(file))
            .collect())
    }
}

/// Express the given repo-relative file path relative to the process working directory.
fn relative_to_cwd(repo: &Path, file: &str) -> String {
    let normalized = file.replace('\\', "/");
    if repo == Path::new(".") {
        normalized
    } else {
        format!("{}/{}", repo.display(), normalized).replace('\\', "/")
    }
}

/// Determine if the given path points at a test file that still exists.
pub fn is_test_file(path: &str) -> bool {
    path.ends_with(TEST_FILE_EXTENSION)
        && path.split('/').any(|part| part == TEST_DIR_COMPONENT)
        && Path::new(path).exists()
}
