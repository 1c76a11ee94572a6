//! Split resmoke suites into sub-suites based on historic test runtimes.
//!
//! The primary algorithm is a greedy first-fit-decreasing pass over the tests
//! sorted by historic runtime, packing each sub-suite up to a target runtime.
//! When no usable history exists tests are dealt out round-robin instead.

use std::{
    cmp::min,
    collections::HashSet,
    sync::Arc,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{event, Level};

use crate::{
    evergreen::test_stats::{HistoricTaskData, TestRuntime, TestStatsService},
    evergreen_names::CLEAN_EVERY_N,
    resmoke::resmoke_proxy::TestDiscovery,
};

/// Configuration for how suites should be split.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Runtime (in seconds) to aim for in each sub-suite.
    pub target_runtime_seconds: f64,
    /// Maximum number of non-misc sub-suites to create per task.
    pub max_sub_suites: usize,
    /// Maximum number of tests to put in a single sub-suite.
    pub max_tests_per_suite: usize,
    /// Whether the build variant runs with address sanitizer enabled.
    pub is_asan: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            target_runtime_seconds: 3600.0,
            max_sub_suites: 5,
            max_tests_per_suite: usize::MAX,
            is_asan: false,
        }
    }
}

/// Parameters for splitting a single suite.
#[derive(Debug, Clone, Default)]
pub struct SuiteSplitParams {
    /// Name of task being split, with any generation suffix removed.
    pub task_name: String,
    /// Name of resmoke suite being split.
    pub suite_name: String,
    /// Name of build variant the split is based on.
    pub build_variant: String,
    /// Whether a misc sub-suite catching unplaced tests should be added.
    pub generate_misc_suite: bool,
    /// When provided, only these test files are eligible for the split.
    pub test_filter: Option<HashSet<String>>,
}

/// One of the pieces a resmoke suite is split into, run as a single sub-task.
#[derive(Debug, Clone, Default)]
pub struct SubSuite {
    /// Position of the sub-suite in its task, `None` for the misc sub-suite.
    pub index: Option<usize>,
    /// Name of the resmoke suite the sub-suite is based on.
    pub suite_name: String,
    /// Tests belonging to the sub-suite.
    pub test_list: Vec<String>,
    /// Historic runtimes of the tests, when history was available.
    pub runtime_list: Option<Vec<TestRuntime>>,
    /// Expected runtime of suite-level hooks, distributed across sub-suites.
    pub task_overhead: f64,
}

impl SubSuite {
    /// Expected total runtime of this sub-suite, or `None` without history.
    pub fn expected_runtime(&self) -> Option<f64> {
        self.runtime_list
            .as_ref()
            .map(|list| list.iter().map(|test| test.runtime).sum::<f64>() + self.task_overhead)
    }

    /// Longest expected runtime of a single test, or `None` without history.
    pub fn max_test_runtime(&self) -> Option<f64> {
        self.runtime_list.as_ref().and_then(|list| {
            list.iter()
                .map(|test| test.runtime)
                .fold(None, |acc: Option<f64>, runtime| {
                    Some(acc.map_or(runtime, |max| max.max(runtime)))
                })
        })
    }
}

/// The full set of sub-suites a task was split into.
#[derive(Debug, Clone, Default)]
pub struct GeneratedSuite {
    /// Sub-suites comprising the task.
    pub sub_suites: Vec<SubSuite>,
    /// Build variant the split is based on.
    pub build_variant: String,
    /// Name of task being generated.
    pub task_name: String,
    /// Name of resmoke suite the task runs.
    pub suite_name: String,
    /// Base name for the sub-suite configuration files.
    pub filename: String,
}

impl GeneratedSuite {
    /// Get the tests placed in non-misc sub-suites.
    pub fn placed_tests(&self) -> Vec<String> {
        self.sub_suites
            .iter()
            .filter(|sub_suite| sub_suite.index.is_some())
            .flat_map(|sub_suite| sub_suite.test_list.clone())
            .collect()
    }
}

/// A service for splitting suites into sub-suites.
#[async_trait]
pub trait SuiteSplitService: Send + Sync {
    /// Split the given suite into sub-suites.
    ///
    /// # Arguments
    ///
    /// * `params` - Description of the suite to split.
    ///
    /// # Returns
    ///
    /// A `GeneratedSuite` describing the split.
    async fn split_suite(&self, params: &SuiteSplitParams) -> Result<GeneratedSuite>;
}

/// Implementation of the suite split service.
pub struct SuiteSplitServiceImpl {
    /// Service to query historic test runtimes.
    test_stats_service: Arc<dyn TestStatsService>,
    /// Service to discover the tests belonging to a suite.
    test_discovery: Arc<dyn TestDiscovery>,
    /// Configuration for how suites should be split.
    split_config: SplitConfig,
}

impl SuiteSplitServiceImpl {
    /// Create a new instance of the suite split service.
    ///
    /// # Arguments
    ///
    /// * `test_stats_service` - Service to query historic test runtimes.
    /// * `test_discovery` - Service to discover tests belonging to a suite.
    /// * `split_config` - Configuration for how suites should be split.
    pub fn new(
        test_stats_service: Arc<dyn TestStatsService>,
        test_discovery: Arc<dyn TestDiscovery>,
        split_config: SplitConfig,
    ) -> Self {
        Self {
            test_stats_service,
            test_discovery,
            split_config,
        }
    }

    /// Get the tests of the suite that are eligible for the split.
    fn get_test_list(&self, params: &SuiteSplitParams) -> Result<Vec<String>> {
        let mut test_list = self.test_discovery.discover_tests(&params.suite_name)?;
        if let Some(test_filter) = &params.test_filter {
            test_list.retain(|test| test_filter.contains(test));
        }
        Ok(test_list)
    }

    /// Pack tests into sub-suites up to the target runtime, longest tests first.
    ///
    /// A single test whose runtime exceeds the target gets a sub-suite of its
    /// own. Once `max_sub_suites` sub-suites have been closed, the remaining
    /// tests are dealt out round-robin over the existing sub-suites.
    fn split_by_runtime(&self, runtimes: Vec<TestRuntime>) -> Vec<Vec<TestRuntime>> {
        let target = self.split_config.target_runtime_seconds;
        let mut sub_suites: Vec<Vec<TestRuntime>> = vec![];
        let mut current: Vec<TestRuntime> = vec![];
        let mut current_runtime = 0.0;
        let mut overflow: Vec<TestRuntime> = vec![];

        let mut test_iter = runtimes.into_iter();
        while let Some(test) = test_iter.next() {
            let over_target = current_runtime + test.runtime > target;
            let at_capacity = current.len() >= self.split_config.max_tests_per_suite;
            if !current.is_empty() && (over_target || at_capacity) {
                sub_suites.push(std::mem::take(&mut current));
                current_runtime = 0.0;
                if sub_suites.len() >= self.split_config.max_sub_suites {
                    overflow.push(test);
                    overflow.extend(test_iter.by_ref());
                    break;
                }
            }
            current_runtime += test.runtime;
            current.push(test);
        }
        if !current.is_empty() {
            sub_suites.push(current);
        }

        let n_sub_suites = sub_suites.len();
        for (i, test) in overflow.into_iter().enumerate() {
            sub_suites[i % n_sub_suites].push(test);
        }

        sub_suites
    }

    /// Deal tests out by index modulo the number of sub-suites.
    fn split_by_count(&self, test_list: &[String]) -> Vec<Vec<String>> {
        let n_sub_suites = min(test_list.len(), self.split_config.max_sub_suites);
        let mut sub_suites = vec![vec![]; n_sub_suites];
        for (i, test) in test_list.iter().enumerate() {
            sub_suites[i % n_sub_suites].push(test.clone());
        }
        sub_suites
    }

    /// Calculate the expected hook overhead for each sub-suite of the task.
    ///
    /// The `CleanEveryN` hook runs once per `n` tests, so its historic runtime is
    /// task-level cost rather than per-test cost. With a sanitizer build the data
    /// files are cleaned on every test.
    fn task_overhead_per_sub_suite(
        &self,
        params: &SuiteSplitParams,
        task_stats: &HistoricTaskData,
        n_tests: usize,
        n_sub_suites: usize,
    ) -> Result<f64> {
        if n_tests == 0 || n_sub_suites == 0 {
            return Ok(0.0);
        }
        let cadence = if self.split_config.is_asan {
            1
        } else {
            self.test_discovery
                .get_suite_config(&params.suite_name)?
                .clean_every_n_cadence()
        };
        if cadence == 0 {
            return Ok(0.0);
        }
        let hook_runtime = task_stats.get_avg_hook_runtime(CLEAN_EVERY_N);
        let total_overhead = (n_tests as u64 / cadence) as f64 * hook_runtime;
        Ok(total_overhead / n_sub_suites as f64)
    }
}

#[async_trait]
impl SuiteSplitService for SuiteSplitServiceImpl {
    async fn split_suite(&self, params: &SuiteSplitParams) -> Result<GeneratedSuite> {
        if self.split_config.max_sub_suites == 0 {
            bail!(
                "Invalid configuration: max_sub_suites must be at least 1 to split task '{}'",
                params.task_name
            );
        }

        let test_list = self.get_test_list(params)?;
        let task_stats = self
            .test_stats_service
            .get_stats(&params.task_name, &params.build_variant)
            .await?;

        let test_set: HashSet<&String> = test_list.iter().collect();
        let mut sub_suites: Vec<SubSuite> = vec![];
        let mut placed: HashSet<String> = HashSet::new();

        let runtimes: Vec<TestRuntime> = match &task_stats {
            Some(stats) => stats
                .get_tests_runtimes()
                .into_iter()
                .filter(|test| test_set.contains(&test.test_name) && test.runtime > 0.0)
                .collect(),
            None => vec![],
        };

        match &task_stats {
            Some(stats) if !runtimes.is_empty() => {
                let packed = self.split_by_runtime(runtimes);
                let task_overhead = self.task_overhead_per_sub_suite(
                    params,
                    stats,
                    packed.iter().map(|tests| tests.len()).sum(),
                    packed.len(),
                )?;
                for (index, tests) in packed.into_iter().enumerate() {
                    placed.extend(tests.iter().map(|test| test.test_name.clone()));
                    sub_suites.push(SubSuite {
                        index: Some(index),
                        suite_name: params.suite_name.clone(),
                        test_list: tests.iter().map(|test| test.test_name.clone()).collect(),
                        runtime_list: Some(tests),
                        task_overhead,
                    });
                }
            }
            _ => {
                event!(
                    Level::INFO,
                    task = params.task_name.as_str(),
                    build_variant = params.build_variant.as_str(),
                    "No runtime history available, splitting by test count"
                );
                for (index, tests) in self.split_by_count(&test_list).into_iter().enumerate() {
                    placed.extend(tests.iter().cloned());
                    sub_suites.push(SubSuite {
                        index: Some(index),
                        suite_name: params.suite_name.clone(),
                        test_list: tests,
                        runtime_list: None,
                        task_overhead: 0.0,
                    });
                }
            }
        }

        if params.generate_misc_suite {
            // Catch-all for tests without history and tests added after the split.
            let unplaced: Vec<String> = test_list
                .iter()
                .filter(|test| !placed.contains(*test))
                .cloned()
                .collect();
            sub_suites.push(SubSuite {
                index: None,
                suite_name: params.suite_name.clone(),
                test_list: unplaced,
                runtime_list: None,
                task_overhead: 0.0,
            });
        }

        Ok(GeneratedSuite {
            sub_suites,
            build_variant: params.build_variant.clone(),
            task_name: params.task_name.clone(),
            suite_name: params.suite_name.clone(),
            filename: format!("{}_{}", params.task_name, params.build_variant),
        })
    }
}
