//! Service for generating resmoke tasks.
//!
//! This service splits a resmoke suite into sub-suites with the suite split
//! service and then builds an evergreen sub-task for each sub-suite. For
//! multiversion tasks, the sub-task set is expanded into the cross-product of
//! (old version, version combination) pairs.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use maplit::hashmap;
use regex::Regex;
use shrub_rs::models::{
    commands::{fn_call, fn_call_with_params, EvgCommand},
    params::ParamValue,
    task::{EvgTask, TaskDependency},
};
use tokio::sync::Mutex;

use crate::{
    evergreen_names::{
        ARTIFACT_CREATION_TASK, CONFIGURE_EVG_API_CREDS, DO_MULTIVERSION_SETUP, DO_SETUP,
        GENERATED_CONFIG_DIR, GEN_TASK_CONFIG_LOCATION, IDLE_TIMEOUT, MULTIVERSION_EXCLUDE_TAGS,
        MULTIVERSION_EXCLUDE_TAGS_FILE, REQUIRE_MULTIVERSION_SETUP, RESMOKE_ARGS,
        RESMOKE_JOBS_MAX, RUN_GENERATED_TESTS, SUITE_NAME,
    },
    utils::task_name::{name_generated_task, name_sub_suite_file},
};

use super::{
    generated_task::GeneratedTask,
    multiversion::{MultiversionIteration, MultiversionService},
    resmoke_config_writer::{ResmokeConfigActor, ResmokeSuiteGenerationInfo},
    split_tasks::{GeneratedSuite, SubSuite, SuiteSplitParams, SuiteSplitService},
    timeouts::{TimeoutEstimate, TimeoutService},
};

lazy_static! {
    /// Any existing repeat argument disables the repeat_suites parameter.
    static ref REPEAT_ARG_RE: Regex = Regex::new(r"--repeat(Suites)?\b").unwrap();
}

/// Parameters describing how a specific resmoke suite should be generated.
#[derive(Clone, Debug, Default)]
pub struct ResmokeGenParams {
    /// Name of task being generated.
    pub task_name: String,
    /// Name of suite being generated.
    pub suite_name: String,
    /// Should the generated tasks run on a 'large' distro.
    pub use_large_distro: bool,
    /// Does this task run against a mix of server versions.
    pub require_multiversion: bool,
    /// Specify how many times resmoke should repeat the suite being tested.
    pub repeat_suites: Option<u64>,
    /// Arguments that should be passed to resmoke.
    pub resmoke_args: String,
    /// Number of jobs to limit resmoke to.
    pub resmoke_jobs_max: Option<u64>,
    /// Location where generated task configuration will be stored.
    pub config_location: String,
    /// List of tasks generated sub-tasks should depend on.
    pub dependencies: Vec<String>,
    /// Arguments to pass through to the 'run tests' function.
    pub pass_through_vars: Option<HashMap<String, ParamValue>>,
    /// When provided, only generate sub-tasks running these test files.
    pub test_filter: Option<HashSet<String>>,
}

impl ResmokeGenParams {
    /// Build the vars to send to the tasks in the 'run tests' function.
    ///
    /// # Arguments
    ///
    /// * `suite_file` - Name of suite file the sub-task will run.
    /// * `origin_suite` - Name of suite the sub-suite was split from.
    /// * `exclude_tags` - Tags multiversion runs should exclude.
    /// * `iteration` - Multiversion iteration being generated, if any.
    /// * `idle_timeout_secs` - Idle timeout to apply to test execution.
    ///
    /// # Returns
    ///
    /// Map of arguments to pass to 'run tests' function.
    fn build_run_test_vars(
        &self,
        suite_file: &str,
        origin_suite: &str,
        exclude_tags: &str,
        iteration: Option<&MultiversionIteration>,
        idle_timeout_secs: Option<u64>,
    ) -> HashMap<String, ParamValue> {
        let mut run_test_vars: HashMap<String, ParamValue> = hashmap! {};
        if let Some(pass_through_vars) = &self.pass_through_vars {
            run_test_vars.extend(pass_through_vars.clone());
        }

        let suite = format!("{}/{}", GENERATED_CONFIG_DIR, suite_file);
        let resmoke_args = self.build_resmoke_args(&suite, origin_suite, exclude_tags);

        run_test_vars.extend(hashmap! {
            REQUIRE_MULTIVERSION_SETUP.to_string() => ParamValue::from(self.require_multiversion),
            RESMOKE_ARGS.to_string() => ParamValue::from(resmoke_args.as_str()),
            SUITE_NAME.to_string() => ParamValue::from(suite.as_str()),
            GEN_TASK_CONFIG_LOCATION.to_string() => ParamValue::from(self.config_location.as_str()),
        });

        if let Some(iteration) = iteration {
            run_test_vars.insert(
                MULTIVERSION_EXCLUDE_TAGS.to_string(),
                ParamValue::from(iteration.old_version.as_str()),
            );
        }

        if let Some(resmoke_jobs_max) = self.resmoke_jobs_max {
            run_test_vars.insert(
                RESMOKE_JOBS_MAX.to_string(),
                ParamValue::from(resmoke_jobs_max),
            );
        }

        if let Some(idle_timeout_secs) = idle_timeout_secs {
            run_test_vars.insert(
                IDLE_TIMEOUT.to_string(),
                ParamValue::from(idle_timeout_secs),
            );
        }

        run_test_vars
    }

    /// Build the resmoke arguments to use for a generated sub-task.
    ///
    /// # Arguments
    ///
    /// * `suite` - Path of generated suite file to run.
    /// * `origin_suite` - Suite the generated suite is based on.
    /// * `exclude_tags` - Tags multiversion runs should exclude.
    ///
    /// # Returns
    ///
    /// String of arguments to pass to resmoke.
    fn build_resmoke_args(&self, suite: &str, origin_suite: &str, exclude_tags: &str) -> String {
        let mut args = format!(
            "--suite={} --originSuite={} {}",
            suite, origin_suite, self.resmoke_args
        );

        if self.require_multiversion {
            args.push_str(&format!(
                " --tagFile={}/{} --excludeWithAnyTags={}",
                GENERATED_CONFIG_DIR, MULTIVERSION_EXCLUDE_TAGS_FILE, exclude_tags
            ));
        }

        if let Some(repeat) = self.repeat_suites {
            if repeat > 1 && !REPEAT_ARG_RE.is_match(&self.resmoke_args) {
                args.push_str(&format!(" --repeatSuites={}", repeat));
            }
        }

        args
    }

    /// Build the dependency structure to use for the generated sub-tasks.
    ///
    /// All generated sub-tasks depend on the task that archives the test
    /// binaries, in addition to anything the task definition asked for.
    ///
    /// # Returns
    ///
    /// List of `TaskDependency`s for generated tasks.
    fn get_dependencies(&self) -> Option<Vec<TaskDependency>> {
        let mut dependencies = vec![ARTIFACT_CREATION_TASK.to_string()];
        for dependency in &self.dependencies {
            if dependency != ARTIFACT_CREATION_TASK {
                dependencies.push(dependency.to_string());
            }
        }

        Some(
            dependencies
                .iter()
                .map(|d| TaskDependency {
                    name: d.to_string(),
                    variant: None,
                })
                .collect(),
        )
    }

    /// Number of times each sub-suite will be repeated.
    fn repeat_factor(&self) -> u64 {
        self.repeat_suites.unwrap_or(1).max(1)
    }
}

/// Representation of a generated resmoke task.
#[derive(Clone, Debug, Default)]
pub struct GeneratedResmokeSuite {
    /// Name of display task to create.
    pub task_name: String,

    /// Sub tasks that comprise the generated task.
    pub sub_tasks: Vec<EvgTask>,

    /// Should the sub-tasks run on a large distro.
    pub use_large_distro: bool,
}

impl GeneratedTask for GeneratedResmokeSuite {
    fn display_name(&self) -> String {
        self.task_name.clone()
    }

    fn sub_tasks(&self) -> Vec<EvgTask> {
        self.sub_tasks.clone()
    }

    fn use_large_distro(&self) -> bool {
        self.use_large_distro
    }
}

/// A service for generating resmoke tasks.
#[async_trait]
pub trait GenResmokeTaskService: Sync + Send {
    /// Generate a task for running the given suite in parallel.
    ///
    /// # Arguments
    ///
    /// * `params` - Parameters for how task should be generated.
    /// * `build_variant` - Name of build variant to base task splitting on.
    ///
    /// # Returns
    ///
    /// A generated task representing the split suite.
    async fn generate_resmoke_task(
        &self,
        params: &ResmokeGenParams,
        build_variant: &str,
    ) -> Result<Box<dyn GeneratedTask>>;
}

/// Implementation of service to generate resmoke tasks.
#[derive(Clone)]
pub struct GenResmokeTaskServiceImpl {
    /// Service to split suites into sub-suites.
    suite_split_service: Arc<dyn SuiteSplitService>,

    /// Actor to create resmoke configuration files.
    resmoke_config_actor: Arc<Mutex<dyn ResmokeConfigActor>>,

    /// Service for generating multiversion configurations.
    multiversion_service: Arc<dyn MultiversionService>,

    /// Service for calculating sub-task timeouts.
    timeout_service: Arc<dyn TimeoutService>,
}

impl GenResmokeTaskServiceImpl {
    /// Create a new instance of the service implementation.
    ///
    /// # Arguments
    ///
    /// * `suite_split_service` - An instance of the service to split suites.
    /// * `resmoke_config_actor` - Actor to write generated suite configuration.
    /// * `multiversion_service` - An instance of the multiversion service.
    /// * `timeout_service` - An instance of the timeout service.
    ///
    /// # Returns
    ///
    /// New instance of GenResmokeTaskService.
    pub fn new(
        suite_split_service: Arc<dyn SuiteSplitService>,
        resmoke_config_actor: Arc<Mutex<dyn ResmokeConfigActor>>,
        multiversion_service: Arc<dyn MultiversionService>,
        timeout_service: Arc<dyn TimeoutService>,
    ) -> Self {
        Self {
            suite_split_service,
            resmoke_config_actor,
            multiversion_service,
            timeout_service,
        }
    }

    /// Build the sub-tasks for one (possibly decorated) version of the split.
    ///
    /// # Arguments
    ///
    /// * `params` - Parameters for how task should be generated.
    /// * `generated_suite` - Result of splitting the suite.
    /// * `iteration` - Multiversion iteration to decorate the sub-tasks with.
    ///
    /// # Returns
    ///
    /// List of evergreen tasks to run the sub-suites.
    fn create_sub_tasks(
        &self,
        params: &ResmokeGenParams,
        generated_suite: &GeneratedSuite,
        iteration: Option<&MultiversionIteration>,
    ) -> Result<Vec<EvgTask>> {
        let display_name = match iteration {
            Some(iteration) => iteration.name_for_task(&generated_suite.task_name),
            None => generated_suite.task_name.clone(),
        };
        let origin_suite = match iteration {
            Some(iteration) => iteration.name_for_task(&generated_suite.suite_name),
            None => generated_suite.suite_name.clone(),
        };
        let total_sub_suites = generated_suite.sub_suites.len();

        generated_suite
            .sub_suites
            .iter()
            .map(|sub_suite| {
                self.build_resmoke_sub_task(
                    params,
                    sub_suite,
                    &display_name,
                    &origin_suite,
                    total_sub_suites,
                    &generated_suite.build_variant,
                    iteration,
                )
            })
            .collect()
    }

    /// Build a shrub task to execute a single sub-suite.
    #[allow(clippy::too_many_arguments)]
    fn build_resmoke_sub_task(
        &self,
        params: &ResmokeGenParams,
        sub_suite: &SubSuite,
        display_name: &str,
        origin_suite: &str,
        total_sub_suites: usize,
        build_variant: &str,
        iteration: Option<&MultiversionIteration>,
    ) -> Result<EvgTask> {
        let sub_task_name =
            name_generated_task(display_name, sub_suite.index, total_sub_suites, build_variant);
        let suite_file =
            name_sub_suite_file(display_name, sub_suite.index, total_sub_suites, build_variant);

        let estimate = TimeoutEstimate {
            max_test_runtime: sub_suite.max_test_runtime(),
            expected_task_runtime: sub_suite.expected_runtime(),
        };
        let timeouts = self.timeout_service.calculate_timeouts(
            &estimate,
            build_variant,
            &params.task_name,
            params.repeat_factor(),
        )?;

        let exclude_tags = if params.require_multiversion {
            self.multiversion_service
                .exclude_tags_for_task(&params.task_name)
        } else {
            "".to_string()
        };
        let run_test_vars = params.build_run_test_vars(
            &suite_file,
            origin_suite,
            &exclude_tags,
            iteration,
            timeouts.test_timeout_secs,
        );

        Ok(EvgTask {
            name: sub_task_name,
            commands: Some(resmoke_commands(
                RUN_GENERATED_TESTS,
                run_test_vars,
                params.require_multiversion,
            )),
            depends_on: params.get_dependencies(),
            exec_timeout_secs: timeouts.task_timeout_secs,
            ..Default::default()
        })
    }

    /// Create versions of the generated sub-tasks for all multiversion iterations.
    ///
    /// # Arguments
    ///
    /// * `params` - Parameters for how task should be generated.
    /// * `generated_suite` - Result of splitting the suite.
    ///
    /// # Returns
    ///
    /// All sub-tasks of the multiversion task and the iterations they cover.
    fn create_multiversion_sub_tasks(
        &self,
        params: &ResmokeGenParams,
        generated_suite: &GeneratedSuite,
    ) -> Result<(Vec<EvgTask>, Vec<MultiversionIteration>)> {
        let iterations = self
            .multiversion_service
            .multiversion_iterations(&params.suite_name)?;
        let mut sub_tasks = vec![];
        for iteration in &iterations {
            sub_tasks.extend(self.create_sub_tasks(params, generated_suite, Some(iteration))?);
        }

        Ok((sub_tasks, iterations))
    }
}

#[async_trait]
impl GenResmokeTaskService for GenResmokeTaskServiceImpl {
    async fn generate_resmoke_task(
        &self,
        params: &ResmokeGenParams,
        build_variant: &str,
    ) -> Result<Box<dyn GeneratedTask>> {
        let split_params = SuiteSplitParams {
            task_name: params.task_name.clone(),
            suite_name: params.suite_name.clone(),
            build_variant: build_variant.to_string(),
            generate_misc_suite: params.test_filter.is_none(),
            test_filter: params.test_filter.clone(),
        };
        let generated_suite = self.suite_split_service.split_suite(&split_params).await?;

        let mut suite_infos = vec![];
        let sub_tasks = if params.require_multiversion {
            let (sub_tasks, iterations) =
                self.create_multiversion_sub_tasks(params, &generated_suite)?;
            for iteration in &iterations {
                suite_infos.push(ResmokeSuiteGenerationInfo {
                    task_name: iteration.name_for_task(&generated_suite.task_name),
                    origin_suite: generated_suite.suite_name.clone(),
                    build_variant: generated_suite.build_variant.clone(),
                    sub_suites: generated_suite.sub_suites.clone(),
                    old_version: Some(iteration.old_version.clone()),
                });
            }
            sub_tasks
        } else {
            suite_infos.push(ResmokeSuiteGenerationInfo {
                task_name: generated_suite.task_name.clone(),
                origin_suite: generated_suite.suite_name.clone(),
                build_variant: generated_suite.build_variant.clone(),
                sub_suites: generated_suite.sub_suites.clone(),
                old_version: None,
            });
            self.create_sub_tasks(params, &generated_suite, None)?
        };

        let mut resmoke_config_actor = self.resmoke_config_actor.lock().await;
        for suite_info in suite_infos {
            resmoke_config_actor.write_sub_suite(&suite_info).await;
        }

        Ok(Box::new(GeneratedResmokeSuite {
            task_name: params.task_name.clone(),
            sub_tasks,
            use_large_distro: params.use_large_distro,
        }))
    }
}

/// Create a list of commands to run a resmoke sub-task in evergreen.
///
/// # Arguments
///
/// * `run_test_fn_name` - Name of function to run tests.
/// * `run_test_vars` - Variables to pass to the run tests function.
/// * `requires_multiversion_setup` - Does this task require multiversion setup.
///
/// # Returns
///
/// A list of evergreen commands comprising the task.
fn resmoke_commands(
    run_test_fn_name: &str,
    run_test_vars: HashMap<String, ParamValue>,
    requires_multiversion_setup: bool,
) -> Vec<EvgCommand> {
    let mut commands = vec![];

    commands.push(fn_call(DO_SETUP));
    commands.push(fn_call(CONFIGURE_EVG_API_CREDS));

    if requires_multiversion_setup {
        commands.push(fn_call(DO_MULTIVERSION_SETUP));
    }

    commands.push(fn_call_with_params(run_test_fn_name, run_test_vars));
    commands
}
