//! Entry point into the task generation logic.
//!
//! This code will go through the entire evergreen configuration and create task definitions
//! for any tasks that need to be generated. It will then add references to those generated
//! tasks to any build variants that expect to run them.
#![cfg_attr(feature = "strict", deny(missing_docs))]

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    vec,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use evergreen::{
    evg_config::{EvgConfigService, EvgProjectConfig},
    evg_config_utils::{EvgConfigUtils, EvgConfigUtilsImpl},
    task_state::{TaskStateService, TaskStateServiceImpl},
    test_stats::{build_retryable_client, TestStatsServiceImpl},
};
use evergreen_names::{BURN_IN_TESTS, GENERATOR_TASKS};
use generate_sub_tasks_config::GenerateSubTasksConfig;
use maplit::hashmap;
use resmoke::resmoke_proxy::{ResmokeProxy, TestDiscovery};
use services::{
    change_detection::{ChangeDetectionService, ChangeDetectionServiceImpl, GitCliService},
    config_extraction::{ConfigExtractionService, ConfigExtractionServiceImpl},
};
use shrub_rs::models::{
    project::EvgProject,
    task::{EvgTask, TaskRef},
    variant::{BuildVariant, DisplayTask},
};
use task_types::{
    burn_in_tests::{BurnInService, BurnInServiceImpl},
    fuzzer_tasks::{GenFuzzerService, GenFuzzerServiceImpl},
    generated_task::GeneratedTask,
    multiversion::MultiversionServiceImpl,
    resmoke_config_writer::{ResmokeConfigActor, ResmokeConfigActorService},
    resmoke_tasks::{GenResmokeTaskService, GenResmokeTaskServiceImpl},
    split_tasks::SuiteSplitServiceImpl,
    timeouts::{TimeoutOverrides, TimeoutServiceImpl},
};
use tokio::sync::Semaphore;
use tracing::{event, Level};
use utils::fs_service::FsServiceImpl;

mod evergreen;
mod evergreen_names;
mod generate_sub_tasks_config;
mod resmoke;
mod services;
mod task_types;
mod utils;

pub use crate::task_types::split_tasks::SplitConfig;

/// Number of generation workers allowed to run at once.
const MAX_CONCURRENT_GENERATIONS: usize = 16;
/// Limit on the total number of sub-tasks a single run may generate.
const MAX_GENERATED_TASKS: usize = 1000;
/// Number of workers writing generated suite configuration files.
const N_CONFIG_WRITERS: usize = 32;
/// Name of file the generated configuration is written to.
const GENERATED_CONFIG_FILE: &str = "evergreen_config.json";

type GenTaskCollection = HashMap<String, Box<dyn GeneratedTask>>;

/// Information about the Evergreen project being run against.
pub struct ProjectInfo {
    /// Path to the evergreen project configuration yaml.
    pub evg_project_location: PathBuf,

    /// Evergreen project being run.
    pub evg_project: String,

    /// Path to the sub-tasks configuration file.
    pub gen_sub_tasks_config_file: Option<PathBuf>,
}

impl ProjectInfo {
    /// Create a new ProjectInfo struct.
    ///
    /// # Arguments
    ///
    /// * `evg_project_location` - Path to the evergreen project configuration yaml.
    /// * `evg_project` - Evergreen project being run.
    /// * `gen_sub_tasks_config_file` - Path to the sub-tasks configuration file.
    ///
    /// # Returns
    ///
    /// Instance of ProjectInfo with provided info.
    pub fn new<P: AsRef<Path>>(
        evg_project_location: P,
        evg_project: &str,
        gen_sub_tasks_config_file: Option<P>,
    ) -> Self {
        Self {
            evg_project_location: evg_project_location.as_ref().to_path_buf(),
            evg_project: evg_project.to_string(),
            gen_sub_tasks_config_file: gen_sub_tasks_config_file.map(|p| p.as_ref().to_path_buf()),
        }
    }

    /// Get the project configuration for this project.
    pub fn get_project_config(&self) -> Result<EvgProjectConfig> {
        EvgProjectConfig::new(&self.evg_project_location)
    }

    /// Get the generate sub-task configuration for this project.
    pub fn get_generate_sub_tasks_config(&self) -> Result<Option<GenerateSubTasksConfig>> {
        if let Some(gen_sub_tasks_config_file) = &self.gen_sub_tasks_config_file {
            Ok(Some(GenerateSubTasksConfig::from_yaml_file(
                gen_sub_tasks_config_file,
            )?))
        } else {
            Ok(None)
        }
    }
}

/// Configuration required to execute generating tasks.
pub struct ExecutionConfiguration<'a> {
    /// Information about the project being generated under.
    pub project_info: &'a ProjectInfo,
    /// Command to execute resmoke.
    pub resmoke_command: &'a str,
    /// Directory to place generated configuration files.
    pub target_directory: &'a Path,
    /// Task generating the configuration.
    pub generating_task: &'a str,
    /// Location where generated configuration will be uploaded.
    pub config_location: &'a str,
    /// Should burn_in tasks be generated.
    pub gen_burn_in: bool,
    /// Git revision to base change detection on.
    pub base_revision: &'a str,
    /// Endpoint to query historic test stats from.
    pub test_stats_endpoint: &'a str,
    /// Base URL of the evergreen API.
    pub evg_api_server: &'a str,
    /// Path to a file with timeout overrides.
    pub timeout_overrides_file: Option<&'a Path>,
    /// Exec timeout given on the command line, in seconds.
    pub exec_timeout_override_secs: Option<u64>,
    /// Idle timeout given on the command line, in seconds.
    pub test_timeout_override_secs: Option<u64>,
    /// Evergreen alias the patch was created under.
    pub evg_alias: Option<&'a str>,
    /// Whether the run is part of a patch build.
    pub is_patch: bool,
    /// Configuration for how suites should be split.
    pub split_config: SplitConfig,
}

/// Collection of services needed for execution.
#[derive(Clone)]
pub struct Dependencies {
    gen_task_service: Arc<dyn GenerateTasksService>,
    resmoke_config_actor: Arc<tokio::sync::Mutex<dyn ResmokeConfigActor>>,
    burn_in_service: Arc<dyn BurnInService>,
    /// Service to check whether generation already ran.
    pub task_state_service: Arc<dyn TaskStateService>,
}

impl Dependencies {
    /// Create a new set of dependency instances.
    ///
    /// # Arguments
    ///
    /// * `execution_config` - Information about how generation should take place.
    ///
    /// # Returns
    ///
    /// A set of dependencies to run against.
    pub fn new(execution_config: ExecutionConfiguration) -> Result<Self> {
        let fs_service = Arc::new(FsServiceImpl::new());
        let discovery_service: Arc<dyn TestDiscovery> =
            Arc::new(ResmokeProxy::new(execution_config.resmoke_command));
        let multiversion_service =
            Arc::new(MultiversionServiceImpl::new(discovery_service.clone())?);
        let evg_config_service = Arc::new(execution_config.project_info.get_project_config()?);
        let evg_config_utils = Arc::new(EvgConfigUtilsImpl::new());
        let gen_fuzzer_service = Arc::new(GenFuzzerServiceImpl::new(multiversion_service.clone()));
        let gen_sub_tasks_config = execution_config
            .project_info
            .get_generate_sub_tasks_config()?;
        let config_extraction_service = Arc::new(ConfigExtractionServiceImpl::new(
            evg_config_utils.clone(),
            execution_config.generating_task.to_string(),
            execution_config.config_location.to_string(),
            gen_sub_tasks_config,
        ));
        let test_stats_service = Arc::new(TestStatsServiceImpl::new(
            build_retryable_client(),
            execution_config.test_stats_endpoint.to_string(),
            execution_config.project_info.evg_project.clone(),
        ));
        let task_state_service = Arc::new(TaskStateServiceImpl::new(
            build_retryable_client(),
            execution_config.evg_api_server.to_string(),
        ));
        let timeout_overrides = match execution_config.timeout_overrides_file {
            Some(overrides_file) => TimeoutOverrides::from_yaml_file(overrides_file)?,
            None => TimeoutOverrides::default(),
        };
        let timeout_service = Arc::new(TimeoutServiceImpl::new(
            timeout_overrides,
            execution_config.exec_timeout_override_secs,
            execution_config.test_timeout_override_secs,
            execution_config.evg_alias.map(|alias| alias.to_string()),
            execution_config.is_patch,
        ));
        let resmoke_config_actor =
            Arc::new(tokio::sync::Mutex::new(ResmokeConfigActorService::new(
                discovery_service.clone(),
                fs_service,
                &execution_config.target_directory.to_string_lossy(),
                N_CONFIG_WRITERS,
            )));
        let suite_split_service = Arc::new(SuiteSplitServiceImpl::new(
            test_stats_service.clone(),
            discovery_service.clone(),
            execution_config.split_config.clone(),
        ));
        let gen_resmoke_task_service = Arc::new(GenResmokeTaskServiceImpl::new(
            suite_split_service,
            resmoke_config_actor.clone(),
            multiversion_service.clone(),
            timeout_service.clone(),
        ));

        // burn_in runs every changed test in its own sub-task, so it gets a
        // splitter capped at one test per sub-suite.
        let burn_in_split_service = Arc::new(SuiteSplitServiceImpl::new(
            test_stats_service,
            discovery_service.clone(),
            SplitConfig {
                max_tests_per_suite: 1,
                max_sub_suites: usize::MAX,
                ..execution_config.split_config.clone()
            },
        ));
        let burn_in_gen_resmoke_service = Arc::new(GenResmokeTaskServiceImpl::new(
            burn_in_split_service,
            resmoke_config_actor.clone(),
            multiversion_service,
            timeout_service,
        ));
        let burn_in_service = Arc::new(BurnInServiceImpl::new(
            burn_in_gen_resmoke_service,
            config_extraction_service.clone(),
            discovery_service,
            evg_config_utils.clone(),
        ));

        let change_detection_service = Arc::new(ChangeDetectionServiceImpl::new(Arc::new(
            GitCliService::new(),
        )));
        let gen_task_service = Arc::new(GenerateTasksServiceImpl::new(
            evg_config_service,
            evg_config_utils,
            gen_fuzzer_service,
            gen_resmoke_task_service,
            config_extraction_service,
            change_detection_service,
            execution_config.gen_burn_in,
            execution_config.base_revision.to_string(),
        ));

        Ok(Self {
            gen_task_service,
            resmoke_config_actor,
            burn_in_service,
            task_state_service,
        })
    }
}

/// A container for configuration generated for a build variant.
#[derive(Debug, Clone)]
struct GeneratedConfig {
    /// References to generated tasks that should be included.
    pub gen_task_specs: Vec<TaskRef>,
    /// Display tasks that should be created.
    pub display_tasks: Vec<DisplayTask>,
}

impl GeneratedConfig {
    /// Create an empty instance of generated configuration.
    pub fn new() -> Self {
        Self {
            gen_task_specs: vec![],
            display_tasks: vec![],
        }
    }
}

/// Create 'generate.tasks' configuration for all generated tasks in the provided evergreen
/// project configuration.
///
/// # Arguments
///
/// * `deps` - Dependencies needed to perform generation.
/// * `target_directory` - Directory to store generated configuration.
pub async fn generate_configuration(deps: &Dependencies, target_directory: &Path) -> Result<()> {
    let generate_tasks_service = deps.gen_task_service.clone();
    std::fs::create_dir_all(target_directory)?;

    // We are going to do 2 passes through the project build variants. In this first pass, we
    // are actually going to create all the generated tasks that we discover.
    let generated_tasks = generate_tasks_service.build_generated_tasks(deps).await?;

    // Now that we have generated all the tasks we want to make another pass through all the
    // build variants and add references to the generated tasks that each build variant includes.
    let generated_build_variants =
        generate_tasks_service.generate_build_variants(generated_tasks.clone())?;

    let mut task_defs: Vec<EvgTask> = {
        let generated_tasks = generated_tasks.lock().unwrap();
        generated_tasks
            .values()
            .flat_map(|g| g.sub_tasks())
            .collect()
    };
    task_defs.sort_by(|a, b| a.name.cmp(&b.name));

    let gen_evg_project = EvgProject {
        buildvariants: generated_build_variants,
        tasks: task_defs,
        ..Default::default()
    };

    let mut config_file = target_directory.to_path_buf();
    config_file.push(GENERATED_CONFIG_FILE);
    std::fs::write(config_file, serde_json::to_string_pretty(&gen_evg_project)?)?;
    let mut resmoke_config_actor = deps.resmoke_config_actor.lock().await;
    let failures = resmoke_config_actor.flush().await?;
    if !failures.is_empty() {
        bail!(format!(
            "Encountered errors writing resmoke configuration files: {:?}",
            failures
        ));
    }
    Ok(())
}

/// A service for generating tasks.
#[async_trait]
trait GenerateTasksService: Sync + Send {
    /// Build task definitions for all tasks.
    ///
    /// # Arguments
    ///
    /// * `deps` - Service dependencies.
    ///
    /// # Returns
    ///
    /// Map of task names to generated task definitions.
    async fn build_generated_tasks(
        &self,
        deps: &Dependencies,
    ) -> Result<Arc<Mutex<GenTaskCollection>>>;

    /// Create build variant definitions containing all the generated tasks for each build variant.
    ///
    /// # Arguments
    ///
    /// * `generated_tasks` - Map of task names and their generated configuration.
    ///
    /// # Returns
    ///
    /// Vector of shrub build variants with generated task information.
    fn generate_build_variants(
        &self,
        generated_tasks: Arc<Mutex<GenTaskCollection>>,
    ) -> Result<Vec<BuildVariant>>;

    /// Generate a task for the given task definition.
    ///
    /// # Arguments
    ///
    /// * `task_def` - Task definition to base generated task on.
    /// * `build_variant` - Build variant to base generated task on.
    ///
    /// # Returns
    ///
    /// Configuration for a generated task.
    async fn generate_task(
        &self,
        task_def: &EvgTask,
        build_variant: &BuildVariant,
    ) -> Result<Box<dyn GeneratedTask>>;
}

struct GenerateTasksServiceImpl {
    evg_config_service: Arc<dyn EvgConfigService>,
    evg_config_utils: Arc<dyn EvgConfigUtils>,
    gen_fuzzer_service: Arc<dyn GenFuzzerService>,
    gen_resmoke_service: Arc<dyn GenResmokeTaskService>,
    config_extraction_service: Arc<dyn ConfigExtractionService>,
    change_detection_service: Arc<dyn ChangeDetectionService>,
    gen_burn_in: bool,
    base_revision: String,
}

impl GenerateTasksServiceImpl {
    /// Create an instance of GenerateTasksServiceImpl.
    ///
    /// # Arguments
    ///
    /// * `evg_config_service` - Service to work with evergreen project configuration.
    /// * `evg_config_utils` - Utilities to work with evergreen project configuration.
    /// * `gen_fuzzer_service` - Service to generate fuzzer tasks.
    /// * `gen_resmoke_service` - Service for generating resmoke tasks.
    /// * `config_extraction_service` - Service to extract configuration from evergreen config.
    /// * `change_detection_service` - Service to find test files changed by the patch.
    /// * `gen_burn_in` - Whether burn_in tasks should be generated.
    /// * `base_revision` - Git revision to base change detection on.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        evg_config_service: Arc<dyn EvgConfigService>,
        evg_config_utils: Arc<dyn EvgConfigUtils>,
        gen_fuzzer_service: Arc<dyn GenFuzzerService>,
        gen_resmoke_service: Arc<dyn GenResmokeTaskService>,
        config_extraction_service: Arc<dyn ConfigExtractionService>,
        change_detection_service: Arc<dyn ChangeDetectionService>,
        gen_burn_in: bool,
        base_revision: String,
    ) -> Self {
        Self {
            evg_config_service,
            evg_config_utils,
            gen_fuzzer_service,
            gen_resmoke_service,
            config_extraction_service,
            change_detection_service,
            gen_burn_in,
            base_revision,
        }
    }

    /// Find the test files changed relative to the base revision.
    fn find_changed_tests(&self) -> Result<HashSet<String>> {
        let repo = PathBuf::from(".");
        let revision_map = hashmap! {
            repo.display().to_string() => self.base_revision.clone(),
        };
        self.change_detection_service
            .find_changed_tests(&[repo], &revision_map)
    }
}

/// An implementation of GenerateTasksService.
#[async_trait]
impl GenerateTasksService for GenerateTasksServiceImpl {
    /// Build task definitions for all tasks.
    ///
    /// # Arguments
    ///
    /// * `deps` - Service dependencies.
    ///
    /// # Returns
    ///
    /// Map of task names to generated task definitions.
    async fn build_generated_tasks(
        &self,
        deps: &Dependencies,
    ) -> Result<Arc<Mutex<GenTaskCollection>>> {
        let build_variant_order = self.evg_config_service.get_build_variant_order();
        let build_variant_map = self.evg_config_service.get_build_variant_map();
        let task_map = Arc::new(self.evg_config_service.get_task_def_map());
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_GENERATIONS));
        let changed_tests = if self.gen_burn_in {
            Arc::new(self.find_changed_tests()?)
        } else {
            Arc::new(HashSet::new())
        };

        let mut thread_handles = vec![];

        let generated_tasks = Arc::new(Mutex::new(HashMap::new()));
        let mut seen_tasks = HashSet::new();
        for build_variant_name in &build_variant_order {
            let build_variant = match build_variant_map.get(build_variant_name) {
                Some(build_variant) => build_variant,
                None => continue,
            };
            for task in &build_variant.tasks {
                // The burn_in task is based on the changed tests each build variant
                // owns, so it is generated per build variant.
                if task.name == BURN_IN_TESTS {
                    if self.gen_burn_in {
                        thread_handles.push(create_burn_in_worker(
                            deps,
                            task_map.clone(),
                            build_variant,
                            changed_tests.clone(),
                            generated_tasks.clone(),
                            semaphore.clone(),
                        ));
                    }
                    continue;
                }

                // Skip tasks that have already been seen.
                if !seen_tasks.insert(task.name.clone()) {
                    continue;
                }

                if let Some(task_def) = task_map.get(&task.name) {
                    if self.evg_config_utils.is_task_generated(task_def) {
                        // Spawn off a tokio task to do the actual generation work.
                        thread_handles.push(create_task_worker(
                            deps,
                            task_def,
                            build_variant,
                            generated_tasks.clone(),
                            semaphore.clone(),
                        ));
                    }
                }
            }
        }

        for handle in thread_handles {
            handle.await??;
        }

        Ok(generated_tasks)
    }

    /// Generate a task for the given task definition.
    ///
    /// # Arguments
    ///
    /// * `task_def` - Task definition to base generated task on.
    /// * `build_variant` - Build variant to base generated task on.
    ///
    /// # Returns
    ///
    /// Configuration for a generated task.
    async fn generate_task(
        &self,
        task_def: &EvgTask,
        build_variant: &BuildVariant,
    ) -> Result<Box<dyn GeneratedTask>> {
        if self.evg_config_utils.is_task_fuzzer(task_def) {
            event!(Level::INFO, task = task_def.name.as_str(), "Generating fuzzer task");

            let params = self
                .config_extraction_service
                .task_def_to_fuzzer_params(task_def, build_variant)?;

            self.gen_fuzzer_service.generate_fuzzer_task(&params)
        } else {
            event!(
                Level::INFO,
                task = task_def.name.as_str(),
                "Generating resmoke task"
            );
            let params = self
                .config_extraction_service
                .task_def_to_resmoke_params(task_def)?;
            self.gen_resmoke_service
                .generate_resmoke_task(&params, &build_variant.name)
                .await
        }
    }

    /// Create build variant definitions containing all the generated tasks for each build variant.
    ///
    /// Build variants are emitted in the order they appear in the project configuration
    /// and the sub-tasks of each variant are sorted by name, keeping the output stable
    /// across runs.
    ///
    /// # Arguments
    ///
    /// * `generated_tasks` - Map of task names and their generated configuration.
    ///
    /// # Returns
    ///
    /// Vector of shrub build variants with generated task information.
    fn generate_build_variants(
        &self,
        generated_tasks: Arc<Mutex<GenTaskCollection>>,
    ) -> Result<Vec<BuildVariant>> {
        let mut generated_build_variants = vec![];
        let mut total_sub_tasks = 0;

        let build_variant_order = self.evg_config_service.get_build_variant_order();
        let build_variant_map = self.evg_config_service.get_build_variant_map();
        for bv_name in &build_variant_order {
            let build_variant = match build_variant_map.get(bv_name) {
                Some(build_variant) => build_variant,
                None => continue,
            };
            let mut gen_config = GeneratedConfig::new();
            let mut generating_tasks = vec![];
            let generated_tasks = generated_tasks.lock().unwrap();
            for task in &build_variant.tasks {
                let task_name = if task.name == BURN_IN_TESTS {
                    burn_in_task_key(bv_name)
                } else {
                    task.name.clone()
                };

                if let Some(generated_task) = generated_tasks.get(&task_name) {
                    let large_distro = self
                        .config_extraction_service
                        .determine_large_distro(generated_task.as_ref(), build_variant)?;

                    generating_tasks.push(&task.name);
                    gen_config
                        .display_tasks
                        .push(generated_task.build_display_task());
                    gen_config
                        .gen_task_specs
                        .extend(generated_task.build_task_ref(large_distro));
                }
            }

            if !generating_tasks.is_empty() {
                gen_config
                    .gen_task_specs
                    .sort_by(|a, b| a.name.cmp(&b.name));
                total_sub_tasks += gen_config.gen_task_specs.len();

                // Put all the "_gen" tasks into a display task to hide them from view.
                gen_config.display_tasks.push(DisplayTask {
                    name: GENERATOR_TASKS.to_string(),
                    execution_tasks: generating_tasks
                        .into_iter()
                        .map(|s| s.to_string())
                        .collect(),
                });

                let gen_build_variant = BuildVariant {
                    name: bv_name.clone(),
                    tasks: gen_config.gen_task_specs.clone(),
                    display_tasks: Some(gen_config.display_tasks.clone()),
                    activate: Some(false),
                    ..Default::default()
                };
                generated_build_variants.push(gen_build_variant);
            }
        }

        if total_sub_tasks > MAX_GENERATED_TASKS {
            bail!(
                "Generating {} sub-tasks exceeds the limit of {}. Consider splitting the \
                 generated tasks over more build variants.",
                total_sub_tasks,
                MAX_GENERATED_TASKS
            );
        }

        Ok(generated_build_variants)
    }
}

/// Key the burn_in task of the given build variant is stored under.
fn burn_in_task_key(build_variant_name: &str) -> String {
    format!("{}-{}", BURN_IN_TESTS, build_variant_name)
}

/// Spawn a tokio task to perform the task generation work.
///
/// # Arguments
///
/// * `deps` - Service dependencies.
/// * `task_def` - Evergreen task definition to base generated task off.
/// * `build_variant` - Build variant to query timing information from.
/// * `generated_tasks` - Map to store generated tasks in.
/// * `semaphore` - Semaphore limiting the number of concurrent workers.
///
/// # Returns
///
/// Handle to created tokio worker.
fn create_task_worker(
    deps: &Dependencies,
    task_def: &EvgTask,
    build_variant: &BuildVariant,
    generated_tasks: Arc<Mutex<GenTaskCollection>>,
    semaphore: Arc<Semaphore>,
) -> tokio::task::JoinHandle<Result<()>> {
    let generate_task_service = deps.gen_task_service.clone();
    let task_def = task_def.clone();
    let build_variant = build_variant.clone();
    let generated_tasks = generated_tasks.clone();

    tokio::spawn(async move {
        let _permit = semaphore.acquire_owned().await?;
        let generated_task = generate_task_service
            .generate_task(&task_def, &build_variant)
            .await?;

        let mut generated_tasks = generated_tasks.lock().unwrap();
        generated_tasks.insert(task_def.name.clone(), generated_task);
        Ok(())
    })
}

/// Spawn a tokio task to perform the burn_in generation work.
///
/// # Arguments
///
/// * `deps` - Service dependencies.
/// * `task_map` - Map of task definitions in evergreen project configuration.
/// * `build_variant` - Build variant to generate the burn_in task for.
/// * `changed_tests` - Test files changed by the patch.
/// * `generated_tasks` - Map to store generated tasks in.
/// * `semaphore` - Semaphore limiting the number of concurrent workers.
///
/// # Returns
///
/// Handle to created tokio worker.
fn create_burn_in_worker(
    deps: &Dependencies,
    task_map: Arc<HashMap<String, EvgTask>>,
    build_variant: &BuildVariant,
    changed_tests: Arc<HashSet<String>>,
    generated_tasks: Arc<Mutex<GenTaskCollection>>,
    semaphore: Arc<Semaphore>,
) -> tokio::task::JoinHandle<Result<()>> {
    let burn_in_service = deps.burn_in_service.clone();
    let build_variant = build_variant.clone();
    let generated_tasks = generated_tasks.clone();

    tokio::spawn(async move {
        let _permit = semaphore.acquire_owned().await?;
        let generated_task = burn_in_service
            .generate_burn_in_task(&build_variant, task_map, &changed_tests)
            .await?;

        if !generated_task.sub_tasks().is_empty() {
            let mut generated_tasks = generated_tasks.lock().unwrap();
            generated_tasks.insert(burn_in_task_key(&build_variant.name), generated_task);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use shrub_rs::models::commands::fn_call_with_params;

    use crate::{
        evergreen_names::GENERATE_RESMOKE_TASKS,
        task_types::{
            fuzzer_tasks::FuzzerGenTaskParams,
            resmoke_tasks::{GeneratedResmokeSuite, ResmokeGenParams},
        },
    };

    use super::*;

    struct MockConfigService {
        build_variants: Vec<BuildVariant>,
    }
    impl EvgConfigService for MockConfigService {
        fn get_build_variant_map(&self) -> HashMap<String, &BuildVariant> {
            self.build_variants
                .iter()
                .map(|bv| (bv.name.clone(), bv))
                .collect()
        }

        fn get_task_def_map(&self) -> HashMap<String, EvgTask> {
            HashMap::new()
        }

        fn get_build_variant_order(&self) -> Vec<String> {
            self.build_variants.iter().map(|bv| bv.name.clone()).collect()
        }
    }

    struct MockGenFuzzerService {}
    impl GenFuzzerService for MockGenFuzzerService {
        fn generate_fuzzer_task(
            &self,
            params: &FuzzerGenTaskParams,
        ) -> Result<Box<dyn GeneratedTask>> {
            Ok(Box::new(GeneratedResmokeSuite {
                task_name: format!("fuzzer-{}", params.task_name),
                sub_tasks: vec![],
                use_large_distro: false,
            }))
        }
    }

    struct MockGenResmokeTasksService {}
    #[async_trait]
    impl GenResmokeTaskService for MockGenResmokeTasksService {
        async fn generate_resmoke_task(
            &self,
            params: &ResmokeGenParams,
            _build_variant: &str,
        ) -> Result<Box<dyn GeneratedTask>> {
            Ok(Box::new(GeneratedResmokeSuite {
                task_name: format!("resmoke-{}", params.task_name),
                sub_tasks: vec![],
                use_large_distro: false,
            }))
        }
    }

    struct MockConfigExtractionService {}
    impl ConfigExtractionService for MockConfigExtractionService {
        fn task_def_to_fuzzer_params(
            &self,
            task_def: &EvgTask,
            _build_variant: &BuildVariant,
        ) -> Result<FuzzerGenTaskParams> {
            Ok(FuzzerGenTaskParams {
                task_name: task_def.name.clone(),
                ..Default::default()
            })
        }

        fn task_def_to_resmoke_params(&self, task_def: &EvgTask) -> Result<ResmokeGenParams> {
            Ok(ResmokeGenParams {
                task_name: task_def.name.clone(),
                ..Default::default()
            })
        }

        fn determine_large_distro(
            &self,
            _generated_task: &dyn GeneratedTask,
            _build_variant: &BuildVariant,
        ) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct MockChangeDetectionService {}
    impl ChangeDetectionService for MockChangeDetectionService {
        fn find_changed_files(
            &self,
            _repos: &[PathBuf],
            _revision_map: &HashMap<String, String>,
        ) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }

        fn find_changed_tests(
            &self,
            _repos: &[PathBuf],
            _revision_map: &HashMap<String, String>,
        ) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }
    }

    fn build_mock_generate_tasks_service(
        build_variants: Vec<BuildVariant>,
    ) -> GenerateTasksServiceImpl {
        GenerateTasksServiceImpl::new(
            Arc::new(MockConfigService { build_variants }),
            Arc::new(EvgConfigUtilsImpl::new()),
            Arc::new(MockGenFuzzerService {}),
            Arc::new(MockGenResmokeTasksService {}),
            Arc::new(MockConfigExtractionService {}),
            Arc::new(MockChangeDetectionService {}),
            false,
            "abc123".to_string(),
        )
    }

    struct MockResmokeConfigActorService {}
    #[async_trait]
    impl ResmokeConfigActor for MockResmokeConfigActorService {
        async fn write_sub_suite(
            &mut self,
            _gen_suite: &crate::task_types::resmoke_config_writer::ResmokeSuiteGenerationInfo,
        ) {
        }

        async fn flush(&mut self) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    struct MockTaskStateService {}
    #[async_trait]
    impl TaskStateService for MockTaskStateService {
        async fn generation_already_completed(&self, _task_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    struct MockBurnInService {
        sub_tasks: Vec<EvgTask>,
    }
    #[async_trait]
    impl BurnInService for MockBurnInService {
        async fn generate_burn_in_task(
            &self,
            _build_variant: &BuildVariant,
            _task_map: Arc<HashMap<String, EvgTask>>,
            _changed_tests: &HashSet<String>,
        ) -> Result<Box<dyn GeneratedTask>> {
            Ok(Box::new(GeneratedResmokeSuite {
                task_name: "burn_in_tests".to_string(),
                sub_tasks: self.sub_tasks.clone(),
                use_large_distro: false,
            }))
        }
    }

    fn build_mocked_dependencies(burn_in_service: MockBurnInService) -> Dependencies {
        Dependencies {
            gen_task_service: Arc::new(build_mock_generate_tasks_service(vec![])),
            resmoke_config_actor: Arc::new(tokio::sync::Mutex::new(
                MockResmokeConfigActorService {},
            )),
            burn_in_service: Arc::new(burn_in_service),
            task_state_service: Arc::new(MockTaskStateService {}),
        }
    }

    fn sub_task(name: &str) -> EvgTask {
        EvgTask {
            name: name.to_string(),
            ..Default::default()
        }
    }

    // tests for generate_task.
    #[tokio::test]
    async fn test_generate_task_should_route_fuzzer_tasks_to_the_fuzzer_service() {
        let service = build_mock_generate_tasks_service(vec![]);
        let task_def = EvgTask {
            name: "my_fuzzer_gen".to_string(),
            commands: Some(vec![fn_call_with_params(
                GENERATE_RESMOKE_TASKS,
                maplit::hashmap! {
                    "is_jstestfuzz".to_string() => "true".into(),
                },
            )]),
            ..Default::default()
        };

        let generated_task = service
            .generate_task(&task_def, &BuildVariant::default())
            .await
            .unwrap();

        assert_eq!(generated_task.display_name(), "fuzzer-my_fuzzer_gen");
    }

    #[tokio::test]
    async fn test_generate_task_should_route_other_tasks_to_the_resmoke_service() {
        let service = build_mock_generate_tasks_service(vec![]);
        let task_def = EvgTask {
            name: "my_task_gen".to_string(),
            commands: Some(vec![fn_call_with_params(
                GENERATE_RESMOKE_TASKS,
                maplit::hashmap! {
                    "suite".to_string() => "my_suite".into(),
                },
            )]),
            ..Default::default()
        };

        let generated_task = service
            .generate_task(&task_def, &BuildVariant::default())
            .await
            .unwrap();

        assert_eq!(generated_task.display_name(), "resmoke-my_task_gen");
    }

    // tests for generate_build_variants.
    #[test]
    fn test_generate_build_variants_should_sort_sub_tasks_and_add_display_tasks() {
        let task_def = sub_task("my_task_gen");
        let build_variant = BuildVariant {
            name: "bv1".to_string(),
            tasks: vec![task_def.get_reference(None, None)],
            ..Default::default()
        };
        let service = build_mock_generate_tasks_service(vec![build_variant]);
        let mut gen_task_collection: GenTaskCollection = HashMap::new();
        gen_task_collection.insert(
            "my_task_gen".to_string(),
            Box::new(GeneratedResmokeSuite {
                task_name: "my_task".to_string(),
                sub_tasks: vec![sub_task("my_task_1_bv1"), sub_task("my_task_0_bv1")],
                use_large_distro: false,
            }),
        );
        let generated_tasks = Arc::new(Mutex::new(gen_task_collection));

        let build_variants = service.generate_build_variants(generated_tasks).unwrap();

        assert_eq!(build_variants.len(), 1);
        let generated_bv = &build_variants[0];
        assert_eq!(generated_bv.name, "bv1");
        assert_eq!(generated_bv.activate, Some(false));
        let task_names: Vec<String> = generated_bv.tasks.iter().map(|t| t.name.clone()).collect();
        assert_eq!(task_names, vec!["my_task_0_bv1", "my_task_1_bv1"]);
        let display_tasks = generated_bv.display_tasks.as_ref().unwrap();
        assert!(display_tasks.iter().any(|d| d.name == "my_task"));
        let generator_tasks = display_tasks
            .iter()
            .find(|d| d.name == GENERATOR_TASKS)
            .unwrap();
        assert_eq!(generator_tasks.execution_tasks, vec!["my_task_gen"]);
    }

    #[test]
    fn test_generate_build_variants_should_skip_variants_with_no_generated_tasks() {
        let build_variant = BuildVariant {
            name: "bv1".to_string(),
            tasks: vec![sub_task("not_generated").get_reference(None, None)],
            ..Default::default()
        };
        let service = build_mock_generate_tasks_service(vec![build_variant]);
        let generated_tasks = Arc::new(Mutex::new(HashMap::new()));

        let build_variants = service.generate_build_variants(generated_tasks).unwrap();

        assert!(build_variants.is_empty());
    }

    #[test]
    fn test_generate_build_variants_should_fail_when_too_many_tasks_are_generated() {
        let task_def = sub_task("my_task_gen");
        let build_variant = BuildVariant {
            name: "bv1".to_string(),
            tasks: vec![task_def.get_reference(None, None)],
            ..Default::default()
        };
        let service = build_mock_generate_tasks_service(vec![build_variant]);
        let sub_tasks: Vec<EvgTask> = (0..MAX_GENERATED_TASKS + 1)
            .map(|i| sub_task(&format!("my_task_{}_bv1", i)))
            .collect();
        let mut gen_task_collection: GenTaskCollection = HashMap::new();
        gen_task_collection.insert(
            "my_task_gen".to_string(),
            Box::new(GeneratedResmokeSuite {
                task_name: "my_task".to_string(),
                sub_tasks,
                use_large_distro: false,
            }),
        );
        let generated_tasks = Arc::new(Mutex::new(gen_task_collection));

        let result = service.generate_build_variants(generated_tasks);

        assert!(result.is_err());
    }

    // tests for create_burn_in_worker.
    #[tokio::test]
    async fn test_create_burn_in_worker_should_add_task_when_burn_in_suites_are_present() {
        let mock_burn_in_service = MockBurnInService {
            sub_tasks: vec![sub_task("burn_in_tests_0_bv")],
        };
        let mock_deps = build_mocked_dependencies(mock_burn_in_service);
        let task_map = Arc::new(HashMap::new());
        let generated_tasks = Arc::new(Mutex::new(HashMap::new()));

        let thread_handle = create_burn_in_worker(
            &mock_deps,
            task_map,
            &BuildVariant {
                name: "bv_name".to_string(),
                ..Default::default()
            },
            Arc::new(HashSet::new()),
            generated_tasks.clone(),
            Arc::new(Semaphore::new(MAX_CONCURRENT_GENERATIONS)),
        );
        thread_handle.await.unwrap().unwrap();

        assert!(generated_tasks
            .lock()
            .unwrap()
            .contains_key(&burn_in_task_key("bv_name")));
    }

    #[tokio::test]
    async fn test_create_burn_in_worker_should_not_add_task_when_burn_in_suites_are_absent() {
        let mock_burn_in_service = MockBurnInService { sub_tasks: vec![] };
        let mock_deps = build_mocked_dependencies(mock_burn_in_service);
        let task_map = Arc::new(HashMap::new());
        let generated_tasks = Arc::new(Mutex::new(HashMap::new()));

        let thread_handle = create_burn_in_worker(
            &mock_deps,
            task_map,
            &BuildVariant {
                name: "bv_name".to_string(),
                ..Default::default()
            },
            Arc::new(HashSet::new()),
            generated_tasks.clone(),
            Arc::new(Semaphore::new(MAX_CONCURRENT_GENERATIONS)),
        );
        thread_handle.await.unwrap().unwrap();

        assert!(!generated_tasks
            .lock()
            .unwrap()
            .contains_key(&burn_in_task_key("bv_name")));
    }

    // tests for create_task_worker.
    #[tokio::test]
    async fn test_create_task_worker_should_store_the_generated_task() {
        let mock_deps = build_mocked_dependencies(MockBurnInService { sub_tasks: vec![] });
        let task_def = EvgTask {
            name: "my_task_gen".to_string(),
            commands: Some(vec![fn_call_with_params(
                GENERATE_RESMOKE_TASKS,
                maplit::hashmap! {
                    "suite".to_string() => "my_suite".into(),
                },
            )]),
            ..Default::default()
        };
        let generated_tasks = Arc::new(Mutex::new(HashMap::new()));

        let thread_handle = create_task_worker(
            &mock_deps,
            &task_def,
            &BuildVariant::default(),
            generated_tasks.clone(),
            Arc::new(Semaphore::new(MAX_CONCURRENT_GENERATIONS)),
        );
        thread_handle.await.unwrap().unwrap();

        assert!(generated_tasks.lock().unwrap().contains_key("my_task_gen"));
    }
}
