//! Extract generation parameters out of evergreen project configuration.
use std::sync::Arc;

use anyhow::{bail, Result};
use shrub_rs::models::{task::EvgTask, variant::BuildVariant};

use crate::{
    evergreen::evg_config_utils::EvgConfigUtils,
    evergreen_names::{
        CONTINUE_ON_FAILURE, FUZZER_PARAMETERS, IDLE_TIMEOUT, LARGE_DISTRO_EXPANSION,
        MULTIVERSION, NPM_COMMAND, NUM_FUZZER_FILES, NUM_FUZZER_TASKS, RESMOKE_ARGS,
        RESMOKE_JOBS_MAX, RESMOKE_REPEAT_SUITES, SHOULD_SHUFFLE_TESTS, USE_LARGE_DISTRO,
    },
    generate_sub_tasks_config::GenerateSubTasksConfig,
    task_types::{
        fuzzer_tasks::FuzzerGenTaskParams, generated_task::GeneratedTask,
        resmoke_tasks::ResmokeGenParams,
    },
    utils::task_name::remove_gen_suffix,
};

/// Interface for performing extractions of evergreen project configuration.
pub trait ConfigExtractionService: Sync + Send {
    /// Build the configuration for generating a fuzzer from the evergreen task definition.
    ///
    /// # Arguments
    ///
    /// * `task_def` - Task definition of fuzzer to generate.
    /// * `build_variant` - Build variant task is being generated based off.
    ///
    /// # Returns
    ///
    /// Parameters to configure how fuzzer task should be generated.
    fn task_def_to_fuzzer_params(
        &self,
        task_def: &EvgTask,
        build_variant: &BuildVariant,
    ) -> Result<FuzzerGenTaskParams>;

    /// Build the configuration for generating a resmoke task from the evergreen task definition.
    ///
    /// # Arguments
    ///
    /// * `task_def` - Task definition of task to generate.
    ///
    /// # Returns
    ///
    /// Parameters to configure how resmoke task should be generated.
    fn task_def_to_resmoke_params(&self, task_def: &EvgTask) -> Result<ResmokeGenParams>;

    /// Determine large distro name if the given sub-tasks should run on it.
    ///
    /// By default, we won't specify a distro and they will just use the default for the build
    /// variant. If they specify `use_large_distro` then we should instead use the large distro
    /// configured for the build variant. If that is not defined, then throw an error unless
    /// the build variant is configured to be ignored.
    ///
    /// # Arguments
    ///
    /// * `generated_task` - Generated task.
    /// * `build_variant` - Build Variant to run generated task on.
    ///
    /// # Returns
    ///
    /// Large distro name if needed.
    fn determine_large_distro(
        &self,
        generated_task: &dyn GeneratedTask,
        build_variant: &BuildVariant,
    ) -> Result<Option<String>>;
}

/// Implementation for performing extractions of evergreen project configuration.
pub struct ConfigExtractionServiceImpl {
    /// Utilities for looking up evergreen project configuration.
    evg_config_utils: Arc<dyn EvgConfigUtils>,
    /// Name of task running task generation.
    generating_task: String,
    /// Location where generated configuration will be stored.
    config_location: String,
    /// Configuration for generating sub-tasks.
    gen_sub_tasks_config: Option<GenerateSubTasksConfig>,
}

impl ConfigExtractionServiceImpl {
    /// Create a new instance of the config extraction service.
    ///
    /// # Arguments
    ///
    /// * `evg_config_utils` - Utilities for looking up evergreen project configuration.
    /// * `generating_task` - Name of task running task generation.
    /// * `config_location` - Location where generated configuration will be stored.
    /// * `gen_sub_tasks_config` - Configuration for generating sub-tasks.
    pub fn new(
        evg_config_utils: Arc<dyn EvgConfigUtils>,
        generating_task: String,
        config_location: String,
        gen_sub_tasks_config: Option<GenerateSubTasksConfig>,
    ) -> Self {
        Self {
            evg_config_utils,
            generating_task,
            config_location,
            gen_sub_tasks_config,
        }
    }

    /// Determine the dependencies to add to tasks generated from the given task definition.
    ///
    /// A generated task should depend on all tasks listed in its "_gen" task's depends_on
    /// section except for the task generating the configuration.
    ///
    /// # Arguments
    ///
    /// * `task_def` - Definition of task being generated from.
    ///
    /// # Returns
    ///
    /// List of tasks that should be included as dependencies.
    fn determine_task_dependencies(&self, task_def: &EvgTask) -> Vec<String> {
        let depends_on = self.evg_config_utils.get_task_dependencies(task_def);

        depends_on
            .into_iter()
            .filter(|t| t != &self.generating_task)
            .collect()
    }
}

impl ConfigExtractionService for ConfigExtractionServiceImpl {
    fn task_def_to_fuzzer_params(
        &self,
        task_def: &EvgTask,
        build_variant: &BuildVariant,
    ) -> Result<FuzzerGenTaskParams> {
        let evg_config_utils = self.evg_config_utils.clone();
        let task_name = remove_gen_suffix(&task_def.name).to_string();
        let num_files_var = evg_config_utils.lookup_required_param_str(task_def, NUM_FUZZER_FILES)?;
        let num_files = match evg_config_utils.translate_run_var(&num_files_var, build_variant) {
            Some(num_files) => num_files,
            None => bail!(
                "Could not resolve '{}' for task '{}' on build variant '{}'",
                NUM_FUZZER_FILES,
                task_def.name,
                build_variant.name
            ),
        };

        let suite = evg_config_utils.find_suite_name(task_def).to_string();
        Ok(FuzzerGenTaskParams {
            task_name,
            variant: build_variant.name.to_string(),
            suite,
            use_large_distro: evg_config_utils.lookup_default_param_bool(
                task_def,
                USE_LARGE_DISTRO,
                false,
            )?,
            num_files,
            num_tasks: evg_config_utils.lookup_required_param_u64(task_def, NUM_FUZZER_TASKS)?,
            resmoke_args: evg_config_utils.lookup_required_param_str(task_def, RESMOKE_ARGS)?,
            npm_command: evg_config_utils.lookup_default_param_str(
                task_def,
                NPM_COMMAND,
                "jstestfuzz",
            ),
            jstestfuzz_vars: evg_config_utils
                .get_gen_task_var(task_def, FUZZER_PARAMETERS)
                .map(|j| j.to_string()),
            continue_on_failure: evg_config_utils
                .lookup_required_param_bool(task_def, CONTINUE_ON_FAILURE)?,
            resmoke_jobs_max: evg_config_utils
                .lookup_required_param_u64(task_def, RESMOKE_JOBS_MAX)?,
            should_shuffle: evg_config_utils
                .lookup_required_param_bool(task_def, SHOULD_SHUFFLE_TESTS)?,
            timeout_secs: evg_config_utils.lookup_required_param_u64(task_def, IDLE_TIMEOUT)?,
            require_multiversion: evg_config_utils
                .get_task_tags(task_def)
                .contains(MULTIVERSION),
            config_location: self.config_location.clone(),
            dependencies: self.determine_task_dependencies(task_def),
        })
    }

    fn task_def_to_resmoke_params(&self, task_def: &EvgTask) -> Result<ResmokeGenParams> {
        let task_name = remove_gen_suffix(&task_def.name).to_string();
        let suite = self.evg_config_utils.find_suite_name(task_def).to_string();

        Ok(ResmokeGenParams {
            task_name,
            suite_name: suite,
            use_large_distro: self.evg_config_utils.lookup_default_param_bool(
                task_def,
                USE_LARGE_DISTRO,
                false,
            )?,
            require_multiversion: self
                .evg_config_utils
                .get_task_tags(task_def)
                .contains(MULTIVERSION),
            repeat_suites: self
                .evg_config_utils
                .lookup_optional_param_u64(task_def, RESMOKE_REPEAT_SUITES)?,
            resmoke_args: self.evg_config_utils.lookup_default_param_str(
                task_def,
                RESMOKE_ARGS,
                "",
            ),
            resmoke_jobs_max: self
                .evg_config_utils
                .lookup_optional_param_u64(task_def, RESMOKE_JOBS_MAX)?,
            config_location: self.config_location.clone(),
            dependencies: self.determine_task_dependencies(task_def),
            pass_through_vars: self.evg_config_utils.get_gen_task_vars(task_def),
            test_filter: None,
        })
    }

    fn determine_large_distro(
        &self,
        generated_task: &dyn GeneratedTask,
        build_variant: &BuildVariant,
    ) -> Result<Option<String>> {
        let large_distro_name = self
            .evg_config_utils
            .lookup_build_variant_expansion(LARGE_DISTRO_EXPANSION, build_variant);
        let build_variant_name = build_variant.name.as_str();

        if generated_task.use_large_distro() {
            if large_distro_name.is_some() {
                return Ok(large_distro_name);
            }

            if let Some(gen_task_config) = &self.gen_sub_tasks_config {
                if gen_task_config.ignore_missing_large_distro(build_variant_name) {
                    return Ok(None);
                }
            }

            bail!(
                r#"
***************************************************************************************
It appears we are trying to generate a task marked as requiring a large distro, but the
build variant has not specified a large build variant. In order to resolve this error,
you need to:

(1) add a 'large_distro_name' expansion to this build variant ('{build_variant_name}').

-- or --

(2) add this build variant ('{build_variant_name}') to the large distro exception list
in the file passed with --generate-sub-tasks-config.
***************************************************************************************
"#
            );
        }

        Ok(None)
    }
}
