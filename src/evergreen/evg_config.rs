use anyhow::{anyhow, Result};
use maplit::hashmap;
use std::{collections::HashMap, path::Path, process::Command};

use shrub_rs::models::{project::EvgProject, task::EvgTask, variant::BuildVariant};

pub trait EvgConfigService: Sync + Send {
    /// Get a map of build variant names to build variant definitions.
    fn get_build_variant_map(&self) -> HashMap<String, &BuildVariant>;

    /// Get a map of task name to task definitions.
    fn get_task_def_map(&self) -> HashMap<String, EvgTask>;

    /// Get the build variant names in the order they appear in the project configuration.
    ///
    /// The emitted document lists build variants in this order, keeping the output
    /// deterministic across runs.
    fn get_build_variant_order(&self) -> Vec<String>;
}

/// Items needed to implement an evergreen configuration service.
pub struct EvgProjectConfig {
    /// Shrub representation of the evg project.
    evg_project: EvgProject,
}

impl EvgProjectConfig {
    /// Create a new instance of an EvgConfigService.
    ///
    /// # Parameters
    ///
    /// * `evg_project_location` - Path to evergreen project configuration to load.
    pub fn new(evg_project_location: &Path) -> Result<Self> {
        let evg_project = get_project_config(evg_project_location)?;
        Ok(Self { evg_project })
    }
}

impl EvgConfigService for EvgProjectConfig {
    /// Get a map of build variant names to build variant definitions.
    fn get_build_variant_map(&self) -> HashMap<String, &BuildVariant> {
        self.evg_project.build_variant_map()
    }

    /// Get a map of task name to task definitions.
    fn get_task_def_map(&self) -> HashMap<String, EvgTask> {
        let mut task_map = hashmap! {};
        for (k, v) in self.evg_project.task_def_map() {
            task_map.insert(k, v.clone());
        }
        task_map
    }

    /// Get the build variant names in the order they appear in the project configuration.
    fn get_build_variant_order(&self) -> Vec<String> {
        self.evg_project
            .buildvariants
            .iter()
            .map(|bv| bv.name.clone())
            .collect()
    }
}

/// Evaluate the evergreen configuration and load it into a shrub project.
///
/// # Arguments
///
/// * `location` - Path to file containing evergreen configuration to load.
///
/// # Returns
///
/// Shrub representation of evergreen configuration.
fn get_project_config(location: &Path) -> Result<EvgProject> {
    let evg_config_yaml = Command::new("evergreen")
        .arg("evaluate")
        .arg(location)
        .output()?;
    EvgProject::from_yaml_str(std::str::from_utf8(&evg_config_yaml.stdout)?)
        .map_err(|err| anyhow!("Could not parse evergreen project configuration: {}", err))
}
