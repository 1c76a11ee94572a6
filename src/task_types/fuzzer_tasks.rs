//! Generation of fuzzer tasks.
//!
//! Fuzzer tasks generate their own javascript tests at runtime, so there is no
//! historic runtime to split on. Each fuzzer task is simply fanned out into
//! `num_tasks` identical sub-tasks, each of which generates `num_files` tests
//! and runs them.
use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use maplit::hashmap;
use shrub_rs::models::{
    commands::{fn_call, fn_call_with_params},
    params::ParamValue,
    task::{EvgTask, TaskDependency},
};
use tracing::{event, Level};

use crate::{
    evergreen_names::{
        ARTIFACT_CREATION_TASK, CONFIGURE_EVG_API_CREDS, CONTINUE_ON_FAILURE,
        DO_MULTIVERSION_SETUP, DO_SETUP, FUZZER_PARAMETERS, GEN_TASK_CONFIG_LOCATION,
        IDLE_TIMEOUT, MULTIVERSION_EXCLUDE_TAGS, NPM_COMMAND, REQUIRE_MULTIVERSION_SETUP,
        RESMOKE_ARGS, RESMOKE_JOBS_MAX, RUN_FUZZER, RUN_GENERATED_TESTS, SETUP_JSTESTFUZZ,
        SHOULD_SHUFFLE_TESTS, SUITE_NAME, TASK_NAME,
    },
    utils::task_name::name_generated_task,
};

use super::{
    generated_task::GeneratedTask,
    multiversion::{MultiversionIteration, MultiversionService},
};

/// Parameters for how a fuzzer task should be generated.
#[derive(Default, Debug, Clone)]
pub struct FuzzerGenTaskParams {
    /// Name of task being generated.
    pub task_name: String,
    /// Name of build variant being generated on.
    pub variant: String,
    /// Resmoke suite for generated tests.
    pub suite: String,
    /// Should the generated tasks run on a 'large' distro.
    pub use_large_distro: bool,
    /// Number of javascript files fuzzer should generate.
    pub num_files: String,
    /// Number of sub-tasks fuzzer should generate.
    pub num_tasks: u64,
    /// Arguments to pass to resmoke invocation.
    pub resmoke_args: String,
    /// NPM command to perform fuzzer execution.
    pub npm_command: String,
    /// Arguments to pass to fuzzer invocation.
    pub jstestfuzz_vars: Option<String>,
    /// Should generated tests continue running after hitting error.
    pub continue_on_failure: bool,
    /// Maximum number of jobs resmoke should execute in parallel.
    pub resmoke_jobs_max: u64,
    /// Should tests be executed out of order.
    pub should_shuffle: bool,
    /// Timeout before test execution is considered hung.
    pub timeout_secs: u64,
    /// Requires downloading multiversion binaries.
    pub require_multiversion: bool,
    /// Location of generated task configuration.
    pub config_location: String,
    /// List of tasks generated sub-tasks should depend on.
    pub dependencies: Vec<String>,
}

impl FuzzerGenTaskParams {
    /// Create parameters to send to fuzzer to generate appropriate fuzzer tests.
    fn build_fuzzer_parameters(&self) -> HashMap<String, ParamValue> {
        hashmap! {
            NPM_COMMAND.to_string() => ParamValue::from(self.npm_command.as_str()),
            FUZZER_PARAMETERS.to_string() => ParamValue::String(format!("--numGeneratedFiles {} {}", self.num_files, self.jstestfuzz_vars.clone().unwrap_or_default())),
        }
    }

    /// Build the vars to send to tasks in the 'run tests' function.
    ///
    /// # Arguments
    ///
    /// * `iteration` - Multiversion iteration being generated, if any.
    ///
    /// # Returns
    ///
    /// Map of arguments to pass to 'run tests' function.
    fn build_run_tests_vars(
        &self,
        iteration: Option<&MultiversionIteration>,
    ) -> HashMap<String, ParamValue> {
        let suite_name = match iteration {
            Some(iteration) => iteration.name_for_task(&self.suite),
            None => self.suite.clone(),
        };
        let mut vars = hashmap! {
            CONTINUE_ON_FAILURE.to_string() => ParamValue::from(self.continue_on_failure),
            GEN_TASK_CONFIG_LOCATION.to_string() => ParamValue::from(self.config_location.as_str()),
            REQUIRE_MULTIVERSION_SETUP.to_string() => ParamValue::from(self.require_multiversion),
            RESMOKE_ARGS.to_string() => ParamValue::from(self.resmoke_args.as_str()),
            RESMOKE_JOBS_MAX.to_string() => ParamValue::from(self.resmoke_jobs_max),
            SHOULD_SHUFFLE_TESTS.to_string() => ParamValue::from(self.should_shuffle),
            SUITE_NAME.to_string() => ParamValue::String(suite_name),
            TASK_NAME.to_string() => ParamValue::from(self.task_name.as_str()),
            IDLE_TIMEOUT.to_string() => ParamValue::from(self.timeout_secs),
        };

        if let Some(iteration) = iteration {
            vars.insert(
                MULTIVERSION_EXCLUDE_TAGS.to_string(),
                ParamValue::from(iteration.old_version.as_str()),
            );
        }

        vars
    }

    /// Build the dependency structure to use for the generated sub-tasks.
    ///
    /// # Returns
    ///
    /// List of `TaskDependency`s for generated tasks.
    fn get_dependencies(&self) -> Option<Vec<TaskDependency>> {
        let mut dependencies = vec![TaskDependency {
            name: ARTIFACT_CREATION_TASK.to_string(),
            variant: None,
        }];
        dependencies.extend(
            self.dependencies
                .iter()
                .filter(|d| d.as_str() != ARTIFACT_CREATION_TASK)
                .map(|d| TaskDependency {
                    name: d.to_string(),
                    variant: None,
                }),
        );

        Some(dependencies)
    }
}

/// A generated fuzzer task.
#[derive(Debug, Default)]
pub struct FuzzerTask {
    /// Name for generated task.
    pub task_name: String,
    /// Sub-tasks comprising generated task.
    pub sub_tasks: Vec<EvgTask>,
    /// Should the generated tasks run on a 'large' distro.
    pub use_large_distro: bool,
}

impl GeneratedTask for FuzzerTask {
    fn display_name(&self) -> String {
        self.task_name.to_string()
    }

    fn sub_tasks(&self) -> Vec<EvgTask> {
        self.sub_tasks.clone()
    }

    fn use_large_distro(&self) -> bool {
        self.use_large_distro
    }
}

/// A service for generating fuzzer tasks.
pub trait GenFuzzerService: Sync + Send {
    /// Generate a fuzzer task.
    fn generate_fuzzer_task(&self, params: &FuzzerGenTaskParams)
        -> Result<Box<dyn GeneratedTask>>;
}

/// Implementation of the GenFuzzerService.
pub struct GenFuzzerServiceImpl {
    /// Service to query multiversion configuration.
    multiversion_service: Arc<dyn MultiversionService>,
}

impl GenFuzzerServiceImpl {
    /// Create a new instance of the GenFuzzerService.
    pub fn new(multiversion_service: Arc<dyn MultiversionService>) -> Self {
        Self {
            multiversion_service,
        }
    }
}

impl GenFuzzerService for GenFuzzerServiceImpl {
    /// Generate a fuzzer task based on the given parameters.
    ///
    /// # Arguments
    ///
    /// * `params` - Parameters describing how to generate fuzzer.
    ///
    /// # Returns
    ///
    /// GeneratedTask with details of how shrub task for the fuzzer is built.
    fn generate_fuzzer_task(
        &self,
        params: &FuzzerGenTaskParams,
    ) -> Result<Box<dyn GeneratedTask>> {
        let task_name = &params.task_name;
        let sub_tasks: Vec<EvgTask> = if params.require_multiversion {
            event!(
                Level::INFO,
                task_name = task_name.as_str(),
                "Generating multiversion fuzzer"
            );
            let iterations = self
                .multiversion_service
                .multiversion_iterations(&params.suite)?;
            iterations
                .iter()
                .flat_map(|iteration| {
                    (0..params.num_tasks as usize)
                        .map(|i| {
                            build_fuzzer_sub_task(
                                &iteration.name_for_task(task_name),
                                i,
                                params,
                                Some(iteration),
                            )
                        })
                        .collect::<Vec<EvgTask>>()
                })
                .collect()
        } else {
            (0..params.num_tasks as usize)
                .map(|i| build_fuzzer_sub_task(task_name, i, params, None))
                .collect()
        };

        Ok(Box::new(FuzzerTask {
            task_name: params.task_name.to_string(),
            sub_tasks,
            use_large_distro: params.use_large_distro,
        }))
    }
}

/// Build a sub-task for a fuzzer.
///
/// # Arguments
///
/// * `display_name` - Display name of task being built.
/// * `sub_task_index` - Index of sub-task to build.
/// * `params` - Parameters for how task should be generated.
/// * `iteration` - Multiversion iteration being generated, if any.
///
/// # Returns
///
/// A shrub task for the sub-task.
fn build_fuzzer_sub_task(
    display_name: &str,
    sub_task_index: usize,
    params: &FuzzerGenTaskParams,
    iteration: Option<&MultiversionIteration>,
) -> EvgTask {
    let sub_task_name = name_generated_task(
        display_name,
        Some(sub_task_index),
        params.num_tasks as usize,
        &params.variant,
    );

    let mut commands = vec![fn_call(DO_SETUP), fn_call(CONFIGURE_EVG_API_CREDS)];
    if params.require_multiversion {
        commands.push(fn_call(DO_MULTIVERSION_SETUP));
    }
    commands.extend(vec![
        fn_call(SETUP_JSTESTFUZZ),
        fn_call_with_params(RUN_FUZZER, params.build_fuzzer_parameters()),
        fn_call_with_params(RUN_GENERATED_TESTS, params.build_run_tests_vars(iteration)),
    ]);

    EvgTask {
        name: sub_task_name,
        commands: Some(commands),
        depends_on: params.get_dependencies(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use shrub_rs::models::commands::EvgCommand;

    struct MockMultiversionService {}

    impl MultiversionService for MockMultiversionService {
        fn get_old_versions(&self) -> Vec<String> {
            vec!["last_lts".to_string(), "last_continuous".to_string()]
        }

        fn multiversion_iterations(
            &self,
            _suite_name: &str,
        ) -> Result<Vec<MultiversionIteration>> {
            Ok(vec![
                MultiversionIteration {
                    old_version: "last_lts".to_string(),
                    version_combination: "new_old_new".to_string(),
                },
                MultiversionIteration {
                    old_version: "last_continuous".to_string(),
                    version_combination: "new_old_new".to_string(),
                },
            ])
        }

        fn exclude_tags_for_task(&self, _task_name: &str) -> String {
            "tag_0,tag_1".to_string()
        }
    }

    fn build_gen_fuzzer_service() -> GenFuzzerServiceImpl {
        GenFuzzerServiceImpl::new(Arc::new(MockMultiversionService {}))
    }

    // FuzzerGenTaskParams tests.
    #[rstest]
    #[case("my_command", None, "5")]
    #[case("my_command", Some("node params"), "20")]
    fn test_build_fuzzer_params(
        #[case] npm_command: &str,
        #[case] jstestfuzz_vars: Option<&str>,
        #[case] num_files: &str,
    ) {
        let gen_params = FuzzerGenTaskParams {
            npm_command: npm_command.to_string(),
            jstestfuzz_vars: jstestfuzz_vars.map(|j| j.to_string()),
            num_files: num_files.to_string(),
            ..Default::default()
        };

        let parameters = gen_params.build_fuzzer_parameters();

        assert_eq!(
            parameters.get("npm_command"),
            Some(&ParamValue::String(npm_command.to_string()))
        );
        let expected_vars = format!(
            "--numGeneratedFiles {} {}",
            num_files,
            jstestfuzz_vars.unwrap_or_default()
        );
        assert_eq!(
            parameters.get("jstestfuzz_vars"),
            Some(&ParamValue::String(expected_vars))
        );
    }

    #[test]
    fn test_build_run_tests_vars() {
        let gen_params = FuzzerGenTaskParams {
            task_name: "my_task".to_string(),
            suite: "my_suite".to_string(),
            timeout_secs: 300,
            ..Default::default()
        };

        let run_tests_vars = gen_params.build_run_tests_vars(None);

        assert_eq!(
            run_tests_vars.get("task"),
            Some(&ParamValue::String("my_task".to_string()))
        );
        assert_eq!(
            run_tests_vars.get("suite"),
            Some(&ParamValue::String("my_suite".to_string()))
        );
        assert_eq!(run_tests_vars.get("timeout_secs"), Some(&ParamValue::from(300)));
        assert!(!run_tests_vars.contains_key("multiversion_exclude_tags_version"));
    }

    #[test]
    fn test_build_run_tests_vars_multiversion() {
        let gen_params = FuzzerGenTaskParams {
            task_name: "my_task".to_string(),
            suite: "my_suite".to_string(),
            ..Default::default()
        };
        let iteration = MultiversionIteration {
            old_version: "last_lts".to_string(),
            version_combination: "new_old_new".to_string(),
        };

        let run_tests_vars = gen_params.build_run_tests_vars(Some(&iteration));

        assert_eq!(
            run_tests_vars.get("suite"),
            Some(&ParamValue::String("my_suite_last_lts_new_old_new".to_string()))
        );
        assert_eq!(
            run_tests_vars.get("multiversion_exclude_tags_version"),
            Some(&ParamValue::String("last_lts".to_string()))
        );
    }

    // FuzzerTask tests.
    #[test]
    fn test_display_name() {
        let fuzzer_task = FuzzerTask {
            task_name: "my fuzzer".to_string(),
            sub_tasks: vec![],
            ..Default::default()
        };

        assert_eq!(fuzzer_task.display_name(), "my fuzzer".to_string());
    }

    #[test]
    fn test_sub_tasks() {
        let fuzzer_task = FuzzerTask {
            task_name: "my fuzzer".to_string(),
            sub_tasks: vec![
                EvgTask {
                    ..Default::default()
                },
                EvgTask {
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(fuzzer_task.sub_tasks().len(), 2);
    }

    // `build_fuzzer_sub_task` tests.

    fn get_evg_fn_name(evg_command: &EvgCommand) -> Option<&str> {
        if let EvgCommand::Function(func) = evg_command {
            Some(&func.func)
        } else {
            None
        }
    }

    #[test]
    fn test_build_fuzzer_sub_task() {
        let params = FuzzerGenTaskParams {
            task_name: "my_task".to_string(),
            variant: "my_variant".to_string(),
            num_tasks: 50,
            dependencies: vec!["compile_task".to_string()],
            ..Default::default()
        };

        let sub_task = build_fuzzer_sub_task("my_task", 42, &params, None);

        assert_eq!(sub_task.name, "my_task_42_my_variant");
        assert!(sub_task.commands.is_some());
        let commands = sub_task.commands.unwrap();
        assert_eq!(get_evg_fn_name(&commands[0]), Some("do setup"));
        assert_eq!(get_evg_fn_name(&commands[2]), Some("setup jstestfuzz"));
        assert_eq!(get_evg_fn_name(&commands[3]), Some("run jstestfuzz"));
        assert_eq!(get_evg_fn_name(&commands[4]), Some("run generated tests"));
        let depends_on = sub_task.depends_on.unwrap();
        assert_eq!(depends_on[0].name, "archive_dist_test_debug");
        assert_eq!(depends_on[1].name, "compile_task");
    }

    #[test]
    fn test_generate_fuzzer_task() {
        let num_tasks = 10;
        let params = FuzzerGenTaskParams {
            task_name: "some_task".to_string(),
            variant: "my_variant".to_string(),
            num_tasks,
            ..Default::default()
        };

        let gen_fuzzer_service = build_gen_fuzzer_service();
        let task = gen_fuzzer_service.generate_fuzzer_task(&params).unwrap();

        assert_eq!(task.display_name(), "some_task".to_string());
        assert_eq!(task.sub_tasks().len(), num_tasks as usize);
    }

    #[test]
    fn test_generate_multiversion_fuzzer_task() {
        let num_tasks = 10;
        let params = FuzzerGenTaskParams {
            task_name: "some_task".to_string(),
            variant: "my_variant".to_string(),
            suite: "my_suite".to_string(),
            require_multiversion: true,
            num_tasks,
            ..Default::default()
        };

        let gen_fuzzer_service = build_gen_fuzzer_service();
        let task = gen_fuzzer_service.generate_fuzzer_task(&params).unwrap();

        assert_eq!(task.display_name(), "some_task".to_string());
        // 2 multiversion iterations * 10 sub-tasks each.
        assert_eq!(task.sub_tasks().len(), 20);
        let sub_tasks = task.sub_tasks();
        assert!(sub_tasks[0]
            .name
            .starts_with("some_task_last_lts_new_old_new"));
        for sub_task in sub_tasks {
            let commands = sub_task.commands.unwrap();
            assert_eq!(get_evg_fn_name(&commands[2]), Some("do multiversion setup"));
            assert_eq!(get_evg_fn_name(&commands[4]), Some("run jstestfuzz"));
            assert_eq!(get_evg_fn_name(&commands[5]), Some("run generated tests"));
        }
    }
}
