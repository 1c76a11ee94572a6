//! Calculate test and task timeouts for generated sub-tasks.
//!
//! Timeouts are normally derived from the historic runtimes of the tests in a
//! sub-suite. A per-(build variant, task) override table and a handful of
//! special-cased tasks and build variants take precedence over the derived
//! values.

use std::{collections::HashMap, path::Path};

use anyhow::{bail, Result};
use serde::Deserialize;
use tracing::error;

use crate::evergreen_names::UNIT_TEST_TASK;

/// Floor for any derived timeout.
const MIN_TIMEOUT_SECS: u64 = 5 * 60;
/// Time to allow for task-level setup before tests start running.
const AVG_TASK_SETUP_SECS: u64 = 2 * 60;
/// Exec timeout for the unit test task.
const UNITTESTS_TIMEOUT_SECS: u64 = 12 * 60;
/// Exec timeout for tasks running in the commit-queue.
const COMMIT_QUEUE_TIMEOUT_SECS: u64 = 40 * 60;
/// Exec timeout for tasks on required build variants.
const REQUIRED_BUILD_TIMEOUT_SECS: u64 = 80 * 60;
/// Exec timeout for tasks on non-required build variants.
const NON_REQUIRED_BUILD_TIMEOUT_SECS: u64 = 2 * 60 * 60;
/// Largest timeout a patch build is allowed to request.
const MAX_EXPECTED_TIMEOUT_SECS: u64 = 48 * 60 * 60;
/// Scale historic runtimes by this much to leave headroom for slow runs.
const DEFAULT_SCALING_FACTOR: f64 = 3.0;

/// Suffix that marks a build variant as required.
const REQUIRED_VARIANT_SUFFIX: &str = "-required";
/// Evergreen alias under which commit-queue patches run.
const COMMIT_QUEUE_ALIAS: &str = "__commit_queue";

/// Expected runtimes of a sub-suite, gathered from historic test stats.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeoutEstimate {
    /// Longest expected runtime of a single test in the sub-suite.
    pub max_test_runtime: Option<f64>,
    /// Expected total runtime of the sub-suite.
    pub expected_task_runtime: Option<f64>,
}

impl TimeoutEstimate {
    /// Whether any runtime information is available.
    pub fn is_specified(&self) -> bool {
        self.max_test_runtime.is_some() || self.expected_task_runtime.is_some()
    }
}

/// Timeouts to apply to a generated sub-task.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskTimeout {
    /// Idle timeout for a single test, `None` to use the evergreen default.
    pub test_timeout_secs: Option<u64>,
    /// Exec timeout for the whole sub-task.
    pub task_timeout_secs: Option<u64>,
}

/// A timeout override for a single task on a build variant.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutOverride {
    /// Name of task the override applies to.
    pub task: String,
    /// Exec timeout to use, in minutes.
    pub exec_timeout: Option<u64>,
    /// Idle timeout to use, in minutes.
    pub idle_timeout: Option<u64>,
}

/// Table of timeout overrides, keyed by build variant.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutOverrides {
    /// Map of build variant name to the overrides for its tasks.
    #[serde(default)]
    pub overrides: HashMap<String, Vec<TimeoutOverride>>,
}

impl TimeoutOverrides {
    /// Read timeout overrides from the given YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(location: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&location)?;

        let overrides: Result<Self, serde_yaml::Error> = serde_yaml::from_str(&contents);
        if overrides.is_err() {
            error!(
                file = location.as_ref().display().to_string(),
                contents = &contents,
                "Failed to parse yaml for timeout overrides from file",
            );
        }

        let overrides = overrides?;
        overrides.validate()?;
        Ok(overrides)
    }

    /// Check the override table for invalid or conflicting entries.
    fn validate(&self) -> Result<()> {
        for (build_variant, override_list) in &self.overrides {
            for timeout_override in override_list {
                if timeout_override.exec_timeout == Some(0)
                    || timeout_override.idle_timeout == Some(0)
                {
                    bail!(
                        "Invalid timeout override of 0 minutes for task '{}' on build variant '{}'",
                        timeout_override.task,
                        build_variant
                    );
                }
            }
        }
        Ok(())
    }

    /// Find the override for the given task on the given build variant.
    ///
    /// More than one override for the same task is a configuration error.
    fn lookup(&self, build_variant: &str, task_name: &str) -> Result<Option<&TimeoutOverride>> {
        let matches: Vec<&TimeoutOverride> = self
            .overrides
            .get(build_variant)
            .map(|override_list| {
                override_list
                    .iter()
                    .filter(|timeout_override| timeout_override.task == task_name)
                    .collect()
            })
            .unwrap_or_default();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => bail!(
                "Duplicate timeout overrides for task '{}' on build variant '{}'",
                task_name,
                build_variant
            ),
        }
    }
}

/// A service for calculating sub-task timeouts.
pub trait TimeoutService: Sync + Send {
    /// Calculate the timeouts to use for a sub-task.
    ///
    /// # Arguments
    ///
    /// * `estimate` - Expected runtimes of the sub-suite the sub-task runs.
    /// * `build_variant` - Name of build variant the task runs on.
    /// * `task_name` - Name of task being generated.
    /// * `repeat_factor` - Number of times the sub-suite will be repeated.
    ///
    /// # Returns
    ///
    /// The timeouts to apply to the sub-task.
    fn calculate_timeouts(
        &self,
        estimate: &TimeoutEstimate,
        build_variant: &str,
        task_name: &str,
        repeat_factor: u64,
    ) -> Result<TaskTimeout>;
}

/// Implementation of the timeout service.
pub struct TimeoutServiceImpl {
    /// Per-(build variant, task) timeout overrides.
    timeout_overrides: TimeoutOverrides,
    /// Exec timeout given on the command line, overrides everything.
    exec_timeout_override_secs: Option<u64>,
    /// Idle timeout given on the command line, overrides everything.
    test_timeout_override_secs: Option<u64>,
    /// Evergreen alias the patch was created under.
    evg_alias: Option<String>,
    /// Multiplier applied to historic runtimes.
    scaling_factor: f64,
    /// Whether the run is part of a patch build.
    is_patch: bool,
}

impl TimeoutServiceImpl {
    /// Create a new instance of the timeout service.
    pub fn new(
        timeout_overrides: TimeoutOverrides,
        exec_timeout_override_secs: Option<u64>,
        test_timeout_override_secs: Option<u64>,
        evg_alias: Option<String>,
        is_patch: bool,
    ) -> Self {
        Self {
            timeout_overrides,
            exec_timeout_override_secs,
            test_timeout_override_secs,
            evg_alias,
            scaling_factor: DEFAULT_SCALING_FACTOR,
            is_patch,
        }
    }

    /// Calculate the idle timeout for a single test.
    fn test_timeout(&self, max_test_runtime: f64, repeat_factor: u64) -> u64 {
        MIN_TIMEOUT_SECS.max(ceil_to_minute(max_test_runtime * self.scaling_factor))
            * repeat_factor
    }

    /// Calculate the exec timeout for a whole sub-task.
    fn task_timeout(&self, expected_task_runtime: f64, repeat_factor: u64) -> u64 {
        MIN_TIMEOUT_SECS.max(ceil_to_minute(expected_task_runtime * self.scaling_factor))
            * repeat_factor
            + AVG_TASK_SETUP_SECS
    }

    /// Derive timeouts from a historic runtime estimate.
    fn timeouts_from_estimate(
        &self,
        estimate: &TimeoutEstimate,
        task_name: &str,
        repeat_factor: u64,
    ) -> Result<TaskTimeout> {
        let test_timeout_secs = estimate
            .max_test_runtime
            .map(|runtime| self.test_timeout(runtime, repeat_factor));
        let mut task_timeout_secs = estimate
            .expected_task_runtime
            .map(|runtime| self.task_timeout(runtime, repeat_factor));

        if let Some(test_timeout) = test_timeout_secs {
            // The task can never finish faster than its slowest test.
            task_timeout_secs =
                Some(task_timeout_secs.map_or(test_timeout, |task| task.max(test_timeout)));
        }

        if self.is_patch {
            let largest = test_timeout_secs
                .unwrap_or(0)
                .max(task_timeout_secs.unwrap_or(0));
            if largest > MAX_EXPECTED_TIMEOUT_SECS {
                bail!(
                    "Playing it safe, the timeout of {}s requested for task '{}' exceeds the {}s \
                     limit for patch builds, consider reducing resmoke_repeat_suites",
                    largest,
                    task_name,
                    MAX_EXPECTED_TIMEOUT_SECS
                );
            }
        }

        Ok(TaskTimeout {
            test_timeout_secs,
            task_timeout_secs,
        })
    }

    /// Whether the run is part of a commit-queue patch.
    fn is_commit_queue(&self) -> bool {
        self.evg_alias.as_deref() == Some(COMMIT_QUEUE_ALIAS)
    }
}

impl TimeoutService for TimeoutServiceImpl {
    fn calculate_timeouts(
        &self,
        estimate: &TimeoutEstimate,
        build_variant: &str,
        task_name: &str,
        repeat_factor: u64,
    ) -> Result<TaskTimeout> {
        if self.exec_timeout_override_secs.is_some() || self.test_timeout_override_secs.is_some() {
            return Ok(TaskTimeout {
                test_timeout_secs: self.test_timeout_override_secs,
                task_timeout_secs: self.exec_timeout_override_secs,
            });
        }

        if let Some(timeout_override) = self.timeout_overrides.lookup(build_variant, task_name)? {
            return Ok(TaskTimeout {
                test_timeout_secs: timeout_override.idle_timeout.map(|minutes| minutes * 60),
                task_timeout_secs: timeout_override.exec_timeout.map(|minutes| minutes * 60),
            });
        }

        if task_name == UNIT_TEST_TASK {
            return Ok(TaskTimeout {
                test_timeout_secs: None,
                task_timeout_secs: Some(UNITTESTS_TIMEOUT_SECS),
            });
        }

        if estimate.is_specified() {
            return self.timeouts_from_estimate(estimate, task_name, repeat_factor);
        }

        let task_timeout_secs = if build_variant.ends_with(REQUIRED_VARIANT_SUFFIX) {
            REQUIRED_BUILD_TIMEOUT_SECS
        } else if self.is_commit_queue() {
            COMMIT_QUEUE_TIMEOUT_SECS
        } else {
            NON_REQUIRED_BUILD_TIMEOUT_SECS
        };

        Ok(TaskTimeout {
            test_timeout_secs: None,
            task_timeout_secs: Some(task_timeout_secs),
        })
    }
}

/// Round the given number of seconds up to a whole minute.
fn ceil_to_minute(seconds: f64) -> u64 {
    (seconds / 60.0).ceil() as u64 * 60
}

#[cfg(test)]
mod tests {
    use maplit::hashmap;
    use rstest::rstest;

    use super::*;

    fn build_timeout_service(timeout_overrides: TimeoutOverrides) -> TimeoutServiceImpl {
        TimeoutServiceImpl::new(timeout_overrides, None, None, None, true)
    }

    fn overrides_for(
        build_variant: &str,
        task: &str,
        exec_timeout: Option<u64>,
        idle_timeout: Option<u64>,
    ) -> TimeoutOverrides {
        TimeoutOverrides {
            overrides: hashmap! {
                build_variant.to_string() => vec![TimeoutOverride {
                    task: task.to_string(),
                    exec_timeout,
                    idle_timeout,
                }],
            },
        }
    }

    // calculate_timeouts tests.
    #[test]
    fn test_cli_override_beats_everything() {
        let timeout_service = TimeoutServiceImpl::new(
            overrides_for("linux-64", "auth", Some(60), None),
            Some(1234),
            Some(321),
            None,
            true,
        );
        let estimate = TimeoutEstimate {
            max_test_runtime: Some(100.0),
            expected_task_runtime: Some(1000.0),
        };

        let timeouts = timeout_service
            .calculate_timeouts(&estimate, "linux-64", "auth", 1)
            .unwrap();

        assert_eq!(timeouts.task_timeout_secs, Some(1234));
        assert_eq!(timeouts.test_timeout_secs, Some(321));
    }

    #[test]
    fn test_override_table_is_used_exactly() {
        let timeout_service =
            build_timeout_service(overrides_for("linux-64-debug", "auth", Some(60), None));
        let estimate = TimeoutEstimate {
            max_test_runtime: Some(100.0),
            expected_task_runtime: Some(1000.0),
        };

        let timeouts = timeout_service
            .calculate_timeouts(&estimate, "linux-64-debug", "auth", 1)
            .unwrap();

        assert_eq!(timeouts.task_timeout_secs, Some(3600));
        assert_eq!(timeouts.test_timeout_secs, None);
    }

    #[test]
    fn test_override_for_other_variant_is_ignored() {
        let timeout_service =
            build_timeout_service(overrides_for("linux-64-debug", "auth", Some(60), None));

        let timeouts = timeout_service
            .calculate_timeouts(&TimeoutEstimate::default(), "linux-64", "auth", 1)
            .unwrap();

        assert_eq!(
            timeouts.task_timeout_secs,
            Some(NON_REQUIRED_BUILD_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_duplicate_override_is_an_error() {
        let timeout_override = TimeoutOverride {
            task: "auth".to_string(),
            exec_timeout: Some(60),
            idle_timeout: None,
        };
        let timeout_service = build_timeout_service(TimeoutOverrides {
            overrides: hashmap! {
                "linux-64".to_string() => vec![timeout_override.clone(), timeout_override],
            },
        });

        let result =
            timeout_service.calculate_timeouts(&TimeoutEstimate::default(), "linux-64", "auth", 1);

        assert!(result.is_err());
    }

    #[test]
    fn test_unittest_task_gets_fixed_timeout() {
        let timeout_service = build_timeout_service(TimeoutOverrides::default());

        let timeouts = timeout_service
            .calculate_timeouts(&TimeoutEstimate::default(), "linux-64", UNIT_TEST_TASK, 1)
            .unwrap();

        assert_eq!(timeouts.task_timeout_secs, Some(UNITTESTS_TIMEOUT_SECS));
    }

    #[test]
    fn test_historic_estimate_is_scaled_and_rounded() {
        let timeout_service = build_timeout_service(TimeoutOverrides::default());
        let estimate = TimeoutEstimate {
            max_test_runtime: Some(60.0),
            expected_task_runtime: Some(1000.0),
        };

        let timeouts = timeout_service
            .calculate_timeouts(&estimate, "linux-64", "auth", 1)
            .unwrap();

        // 60 * 3 = 180, under the 300s floor.
        assert_eq!(timeouts.test_timeout_secs, Some(300));
        // 1000 * 3 = 3000, rounded to 3000, plus 120s of setup.
        assert_eq!(timeouts.task_timeout_secs, Some(3120));
    }

    #[test]
    fn test_repeat_factor_multiplies_timeouts() {
        let timeout_service = build_timeout_service(TimeoutOverrides::default());
        let estimate = TimeoutEstimate {
            max_test_runtime: Some(120.0),
            expected_task_runtime: Some(1000.0),
        };

        let timeouts = timeout_service
            .calculate_timeouts(&estimate, "linux-64", "auth", 3)
            .unwrap();

        assert_eq!(timeouts.test_timeout_secs, Some(360 * 3));
        assert_eq!(timeouts.task_timeout_secs, Some(3000 * 3 + 120));
    }

    #[test]
    fn test_task_timeout_is_at_least_the_test_timeout() {
        let timeout_service = build_timeout_service(TimeoutOverrides::default());
        let estimate = TimeoutEstimate {
            max_test_runtime: Some(5000.0),
            expected_task_runtime: Some(100.0),
        };

        let timeouts = timeout_service
            .calculate_timeouts(&estimate, "linux-64", "auth", 1)
            .unwrap();

        assert_eq!(timeouts.test_timeout_secs, timeouts.task_timeout_secs);
    }

    #[test]
    fn test_excessive_patch_timeout_is_an_error() {
        let timeout_service = build_timeout_service(TimeoutOverrides::default());
        let estimate = TimeoutEstimate {
            max_test_runtime: Some(50.0),
            expected_task_runtime: Some(MAX_EXPECTED_TIMEOUT_SECS as f64),
        };

        let result = timeout_service.calculate_timeouts(&estimate, "linux-64", "auth", 1);

        assert!(result.is_err());
    }

    #[test]
    fn test_excessive_timeout_is_allowed_outside_patches() {
        let timeout_service = TimeoutServiceImpl::new(TimeoutOverrides::default(), None, None, None, false);
        let estimate = TimeoutEstimate {
            max_test_runtime: Some(50.0),
            expected_task_runtime: Some(MAX_EXPECTED_TIMEOUT_SECS as f64),
        };

        let result = timeout_service.calculate_timeouts(&estimate, "linux-64", "auth", 1);

        assert!(result.is_ok());
    }

    #[rstest]
    #[case("linux-64-required", None, REQUIRED_BUILD_TIMEOUT_SECS)]
    #[case("linux-64", Some(COMMIT_QUEUE_ALIAS), COMMIT_QUEUE_TIMEOUT_SECS)]
    #[case("linux-64", None, NON_REQUIRED_BUILD_TIMEOUT_SECS)]
    fn test_variant_rules_without_history(
        #[case] build_variant: &str,
        #[case] evg_alias: Option<&str>,
        #[case] expected_timeout: u64,
    ) {
        let timeout_service = TimeoutServiceImpl::new(
            TimeoutOverrides::default(),
            None,
            None,
            evg_alias.map(|alias| alias.to_string()),
            true,
        );

        let timeouts = timeout_service
            .calculate_timeouts(&TimeoutEstimate::default(), build_variant, "auth", 1)
            .unwrap();

        assert_eq!(timeouts.test_timeout_secs, None);
        assert_eq!(timeouts.task_timeout_secs, Some(expected_timeout));
    }

    // TimeoutOverrides tests.
    #[test]
    fn test_zero_minute_override_fails_validation() {
        let overrides = overrides_for("linux-64", "auth", Some(0), None);

        assert!(overrides.validate().is_err());
    }
}
