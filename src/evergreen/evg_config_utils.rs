//! Utilities for interpreting task and build variant definitions.
//!
//! Generator tasks describe how to build their generated tasks through the vars
//! of their 'generate resmoke tasks' function call and through build variant
//! expansions. The lookups here are the single place that interpretation happens.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use lazy_static::lazy_static;
use regex::Regex;
use shrub_rs::models::commands::EvgCommand::Function;
use shrub_rs::models::params::ParamValue;
use shrub_rs::models::{commands::FunctionCall, task::EvgTask, variant::BuildVariant};

use crate::evergreen_names::{GENERATE_RESMOKE_TASKS, IS_FUZZER, MULTIVERSION, SUITE_NAME};
use crate::utils::task_name::remove_gen_suffix;

lazy_static! {
    /// Expansion references look like `${expansion}` or `${expansion|default_value}`.
    static ref EXPANSION_RE: Regex =
        Regex::new(r"\$\{(?P<id>[a-zA-Z0-9_]+)(\|(?P<default>.*))?}").unwrap();
}

pub trait EvgConfigUtils: Sync + Send {
    /// Determine if the given task generates other tasks.
    fn is_task_generated(&self, task: &EvgTask) -> bool;

    /// Determine if the given task is a fuzzer task.
    fn is_task_fuzzer(&self, task: &EvgTask) -> bool;

    /// Determine if the given task is tagged for multiversion testing.
    fn is_task_multiversion(&self, task: &EvgTask) -> bool;

    /// Get the names of tasks the given task depends on.
    fn get_task_dependencies(&self, task: &EvgTask) -> Vec<String>;

    /// Find the name of the resmoke suite the given task executes.
    ///
    /// Uses the `suite` var when present, otherwise falls back to the task name
    /// with the generation suffix removed.
    fn find_suite_name<'a>(&self, task: &'a EvgTask) -> &'a str;

    /// Get the set of tags assigned to the given task.
    fn get_task_tags(&self, task: &EvgTask) -> HashSet<String>;

    /// Lookup the given variable in the vars of the 'generate resmoke tasks' func.
    fn get_gen_task_var<'a>(&self, task: &'a EvgTask, var: &str) -> Option<&'a str>;

    /// Get all vars of the 'generate resmoke tasks' func of the given task.
    fn get_gen_task_vars(&self, task: &EvgTask) -> Option<HashMap<String, ParamValue>>;

    /// Resolve the given run var against the expansions of the given build variant.
    ///
    /// A run var that does not reference an expansion resolves to itself. One that
    /// does resolves to the build variant's value for that expansion, falling back
    /// to the default embedded in the reference, or `None` without one.
    fn translate_run_var(&self, run_var: &str, build_variant: &BuildVariant) -> Option<String>;

    /// Lookup the value of the given expansion in the given build variant.
    fn lookup_build_variant_expansion(
        &self,
        name: &str,
        build_variant: &BuildVariant,
    ) -> Option<String>;

    /// Lookup the given var in the task definition, erroring when it is undefined.
    fn lookup_required_param_str(&self, task_def: &EvgTask, run_var: &str) -> Result<String>;

    /// Lookup the given var in the task definition, erroring when it is undefined.
    fn lookup_required_param_u64(&self, task_def: &EvgTask, run_var: &str) -> Result<u64>;

    /// Lookup the given var in the task definition, erroring when it is undefined.
    fn lookup_required_param_bool(&self, task_def: &EvgTask, run_var: &str) -> Result<bool>;

    /// Lookup the given var in the task definition, using the default when undefined.
    fn lookup_default_param_bool(
        &self,
        task_def: &EvgTask,
        run_var: &str,
        default: bool,
    ) -> Result<bool>;

    /// Lookup the given var in the task definition, using the default when undefined.
    fn lookup_default_param_str(&self, task_def: &EvgTask, run_var: &str, default: &str) -> String;

    /// Lookup the given var in the task definition if it exists.
    fn lookup_optional_param_u64(&self, task_def: &EvgTask, run_var: &str) -> Result<Option<u64>>;
}

/// Service for utilities to help interpret evergreen configuration.
pub struct EvgConfigUtilsImpl {}

impl EvgConfigUtilsImpl {
    /// Create a new instance of the EvgConfigUtilsImpl.
    pub fn new() -> Self {
        Self {}
    }
}

impl EvgConfigUtils for EvgConfigUtilsImpl {
    fn is_task_generated(&self, task: &EvgTask) -> bool {
        get_generate_resmoke_func(task).is_some()
    }

    fn is_task_fuzzer(&self, task: &EvgTask) -> bool {
        self.get_gen_task_var(task, IS_FUZZER) == Some("true")
    }

    fn is_task_multiversion(&self, task: &EvgTask) -> bool {
        self.get_task_tags(task).contains(MULTIVERSION)
    }

    fn get_task_dependencies(&self, task: &EvgTask) -> Vec<String> {
        task.depends_on
            .iter()
            .flatten()
            .map(|d| d.name.clone())
            .collect()
    }

    fn find_suite_name<'a>(&self, task: &'a EvgTask) -> &'a str {
        self.get_gen_task_var(task, SUITE_NAME)
            .unwrap_or_else(|| remove_gen_suffix(&task.name))
    }

    fn get_task_tags(&self, task: &EvgTask) -> HashSet<String> {
        task.tags.iter().flatten().cloned().collect()
    }

    fn get_gen_task_var<'a>(&self, task: &'a EvgTask, var: &str) -> Option<&'a str> {
        match get_generate_resmoke_func(task)?.vars.as_ref()?.get(var) {
            Some(ParamValue::String(value)) => Some(value),
            _ => None,
        }
    }

    fn get_gen_task_vars(&self, task: &EvgTask) -> Option<HashMap<String, ParamValue>> {
        get_generate_resmoke_func(task).and_then(|func| func.vars.clone())
    }

    fn translate_run_var(&self, run_var: &str, build_variant: &BuildVariant) -> Option<String> {
        match EXPANSION_RE.captures(run_var) {
            Some(captures) => {
                let id = captures.name("id")?;
                self.lookup_build_variant_expansion(id.as_str(), build_variant)
                    .or_else(|| captures.name("default").map(|d| d.as_str().to_string()))
            }
            None => Some(run_var.to_string()),
        }
    }

    fn lookup_build_variant_expansion(
        &self,
        name: &str,
        build_variant: &BuildVariant,
    ) -> Option<String> {
        build_variant
            .expansions
            .as_ref()
            .and_then(|expansions| expansions.get(name))
            .map(|value| value.to_string())
    }

    fn lookup_required_param_str(&self, task_def: &EvgTask, run_var: &str) -> Result<String> {
        match self.get_gen_task_var(task_def, run_var) {
            Some(value) => Ok(value.to_string()),
            None => bail!("Missing var '{}' for task '{}'", run_var, task_def.name),
        }
    }

    fn lookup_required_param_u64(&self, task_def: &EvgTask, run_var: &str) -> Result<u64> {
        match self.get_gen_task_var(task_def, run_var) {
            Some(value) => Ok(value.parse()?),
            None => bail!("Missing var '{}' for task '{}'", run_var, task_def.name),
        }
    }

    fn lookup_required_param_bool(&self, task_def: &EvgTask, run_var: &str) -> Result<bool> {
        match self.get_gen_task_var(task_def, run_var) {
            Some(value) => Ok(value.parse()?),
            None => bail!("Missing var '{}' for task '{}'", run_var, task_def.name),
        }
    }

    fn lookup_default_param_bool(
        &self,
        task_def: &EvgTask,
        run_var: &str,
        default: bool,
    ) -> Result<bool> {
        Ok(match self.get_gen_task_var(task_def, run_var) {
            Some(value) => value.parse()?,
            None => default,
        })
    }

    fn lookup_default_param_str(&self, task_def: &EvgTask, run_var: &str, default: &str) -> String {
        self.get_gen_task_var(task_def, run_var)
            .unwrap_or(default)
            .to_string()
    }

    fn lookup_optional_param_u64(&self, task_def: &EvgTask, run_var: &str) -> Result<Option<u64>> {
        self.get_gen_task_var(task_def, run_var)
            .map(|value| value.parse().map_err(|err: std::num::ParseIntError| err.into()))
            .transpose()
    }
}

/// Find the 'generate resmoke tasks' function call of the given task.
fn get_generate_resmoke_func(task: &EvgTask) -> Option<&FunctionCall> {
    task.commands.as_ref()?.iter().find_map(|command| match command {
        Function(func) if func.func == GENERATE_RESMOKE_TASKS => Some(func),
        _ => None,
    })
}
