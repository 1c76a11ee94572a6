//! Per-project configuration for how sub-tasks should be generated.

use std::{collections::HashSet, path::Path};
use tracing::error;

use anyhow::Result;
use serde::Deserialize;

/// Configuration passed in with the `--generate-sub-tasks-config` option.
#[derive(Deserialize, Debug, Clone)]
pub struct GenerateSubTasksConfig {
    /// Build variants allowed to run large-distro tasks without a `large_distro_name` expansion.
    pub build_variant_large_distro_exceptions: HashSet<String>,
}

impl GenerateSubTasksConfig {
    /// Read sub-task generation configuration from the given YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(location: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&location)?;

        let config: Result<Self, serde_yaml::Error> = serde_yaml::from_str(&contents);
        if config.is_err() {
            error!(
                file = location.as_ref().display().to_string(),
                contents = &contents,
                "Failed to parse yaml for GenerateSubTasksConfig from file",
            );
        }

        Ok(config?)
    }

    /// Check if the given build variant is excepted from needing a large distro expansion.
    pub fn ignore_missing_large_distro(&self, build_variant_name: &str) -> bool {
        self.build_variant_large_distro_exceptions
            .contains(build_variant_name)
    }
}
