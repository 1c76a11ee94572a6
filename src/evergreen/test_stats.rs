//! Lookup historic test runtimes for evergreen tasks.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use tracing::{event, Level};

const HOOK_DELIMITER: char = ':';
/// Number of days of history to query.
const HISTORY_LOOKBACK_DAYS: i64 = 14;
/// Number of times to retry transient HTTP failures.
const MAX_RETRIES: u32 = 3;

/// A row of test statistics returned by the stats endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct TestStats {
    /// Name of test.
    pub test_name: String,
    /// Number of passing runs in the window.
    pub num_pass: u64,
    /// Number of failing runs in the window.
    pub num_fail: u64,
    /// Average duration of passing runs, in seconds.
    pub avg_duration_pass: f64,
    /// Longest duration of a passing run, in seconds.
    pub max_duration_pass: f64,
}

/// Historic runtime information of a hook that ran alongside a test.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricHookInfo {
    /// Name of hook.
    pub hook_name: String,
    /// Average runtime of hook, in seconds.
    pub avg_duration: f64,
    /// Number of passing runs of the hook.
    pub num_pass: u64,
}

/// Historic runtime information of a single test.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricTestInfo {
    /// Normalized path of the test file.
    pub test_name: String,
    /// Number of passing runs in the window.
    pub num_pass: u64,
    /// Average runtime of the test, in seconds.
    pub avg_duration: f64,
    /// Longest observed runtime of the test, in seconds.
    pub max_duration: f64,
    /// Hooks that ran alongside this test.
    pub hooks: Vec<HistoricHookInfo>,
}

impl HistoricTestInfo {
    /// Total expected runtime of the test, including the hooks that run with it.
    pub fn total_runtime(&self) -> f64 {
        if self.num_pass > 0 {
            self.avg_duration + self.hooks.iter().map(|h| h.avg_duration).sum::<f64>()
        } else {
            0.0
        }
    }
}

/// The expected runtime of a single test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRuntime {
    /// Normalized path of the test file.
    pub test_name: String,
    /// Expected runtime of the test, in seconds.
    pub runtime: f64,
}

/// Historic runtime data for all tests of a single (task, build variant) pair.
#[derive(Debug, Clone, Default)]
pub struct HistoricTaskData {
    /// Map of test base names to the runtime history for that test.
    pub test_map: HashMap<String, HistoricTestInfo>,
}

impl HistoricTaskData {
    /// Build historic task data from the raw rows returned by the stats endpoint.
    ///
    /// Rows describing hooks are attached to the test they ran alongside. Duplicate
    /// rows for the same test are merged with a weighted average on `num_pass`.
    pub fn from_test_stats(stats: &[TestStats]) -> Self {
        let hook_map = gather_hook_stats(stats);
        let test_map = gather_test_stats(stats, &hook_map);
        Self { test_map }
    }

    /// Get the expected runtime of every test with history, longest first.
    pub fn get_tests_runtimes(&self) -> Vec<TestRuntime> {
        let mut runtimes: Vec<TestRuntime> = self
            .test_map
            .values()
            .map(|test_info| TestRuntime {
                test_name: test_info.test_name.clone(),
                runtime: test_info.total_runtime(),
            })
            .collect();
        // Ties are broken by name so the returned order is stable.
        runtimes.sort_by(|a, b| {
            b.runtime
                .partial_cmp(&a.runtime)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.test_name.cmp(&b.test_name))
        });
        runtimes
    }

    /// Get the average runtime of the given hook across all tests it ran with.
    pub fn get_avg_hook_runtime(&self, hook_name: &str) -> f64 {
        let runtimes: Vec<f64> = self
            .test_map
            .values()
            .flat_map(|test_info| &test_info.hooks)
            .filter(|hook| hook.hook_name == hook_name)
            .map(|hook| hook.avg_duration)
            .collect();
        if runtimes.is_empty() {
            return 0.0;
        }
        runtimes.iter().sum::<f64>() / runtimes.len() as f64
    }
}

/// A service for querying historic test stats.
#[async_trait]
pub trait TestStatsService: Send + Sync {
    /// Get the historic test runtime data of the given task.
    ///
    /// # Arguments
    ///
    /// * `task` - Name of task to query.
    /// * `variant` - Name of build variant to query.
    ///
    /// # Returns
    ///
    /// Historic runtime data for the task, or `None` when no usable history exists.
    async fn get_stats(&self, task: &str, variant: &str) -> Result<Option<HistoricTaskData>>;
}

/// An implementation of the test stats service backed by an HTTP endpoint.
pub struct TestStatsServiceImpl {
    /// HTTP client with retries for transient failures.
    client: ClientWithMiddleware,
    /// Base URL of the test stats endpoint.
    stats_endpoint: String,
    /// Evergreen project to query.
    evg_project: String,
}

/// Build an HTTP client that retries transient failures with exponential backoff.
pub fn build_retryable_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(Duration::from_millis(250), Duration::from_secs(10))
        .build_with_max_retries(MAX_RETRIES);
    ClientBuilder::new(reqwest::Client::new())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

impl TestStatsServiceImpl {
    /// Create a new instance of the test stats service.
    ///
    /// # Arguments
    ///
    /// * `client` - HTTP client to query the endpoint with.
    /// * `stats_endpoint` - Base URL of the test stats endpoint.
    /// * `evg_project` - Evergreen project to query.
    pub fn new(client: ClientWithMiddleware, stats_endpoint: String, evg_project: String) -> Self {
        Self {
            client,
            stats_endpoint,
            evg_project,
        }
    }

    fn build_url(&self, task: &str, variant: &str) -> String {
        let today = Utc::now().date_naive();
        let start_date = today - ChronoDuration::days(HISTORY_LOOKBACK_DAYS);
        format!(
            "{}/projects/{}/test_stats?tasks={}&variants={}&after_date={}&before_date={}&group_by=test",
            self.stats_endpoint,
            self.evg_project,
            task,
            variant,
            start_date.format("%Y-%m-%d"),
            today.format("%Y-%m-%d"),
        )
    }
}

#[async_trait]
impl TestStatsService for TestStatsServiceImpl {
    /// Get the historic test runtime data of the given task.
    ///
    /// An endpoint that cannot be reached or returns no rows is treated as "no
    /// history", the caller falls back to defaults. An authentication failure is
    /// fatal since every other lookup in the run would fail the same way.
    async fn get_stats(&self, task: &str, variant: &str) -> Result<Option<HistoricTaskData>> {
        let url = self.build_url(task, variant);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(error) => {
                event!(
                    Level::WARN,
                    task,
                    variant,
                    error = error.to_string(),
                    "Could not query test stats endpoint"
                );
                return Ok(None);
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            bail!(
                "Authentication against the test stats endpoint failed: {}",
                status
            );
        }
        if !status.is_success() {
            event!(
                Level::WARN,
                task,
                variant,
                status = status.as_u16(),
                "Test stats endpoint returned an error"
            );
            return Ok(None);
        }

        let rows: Vec<serde_json::Value> = match response.json().await {
            Ok(rows) => rows,
            Err(error) => {
                event!(
                    Level::WARN,
                    task,
                    variant,
                    error = error.to_string(),
                    "Could not parse test stats response"
                );
                return Ok(None);
            }
        };

        // Malformed rows are skipped rather than failing the whole lookup.
        let stats: Vec<TestStats> = rows
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect();
        if stats.is_empty() {
            return Ok(None);
        }

        Ok(Some(HistoricTaskData::from_test_stats(&stats)))
    }
}

/// Convert the list of stats into a map of test names to test stats.
///
/// Also include hook information for all tests with their stats.
///
/// # Arguments
///
/// * `stat_list` - List of stats.
/// * `hook_map` - Map of test names to hook stats that ran with the test.
///
/// # Returns
///
/// Map of test names to stats belong to that test.
fn gather_test_stats(
    stat_list: &[TestStats],
    hook_map: &HashMap<String, Vec<HistoricHookInfo>>,
) -> HashMap<String, HistoricTestInfo> {
    let mut test_map: HashMap<String, HistoricTestInfo> = HashMap::new();
    for stat in stat_list {
        let normalized_test_file = normalize_test_file(&stat.test_name);
        if !is_hook(&normalized_test_file) {
            let test_name = get_test_name(&normalized_test_file);
            if let Some(existing) = test_map.get_mut(&test_name) {
                let total_pass = existing.num_pass + stat.num_pass;
                if total_pass > 0 {
                    existing.avg_duration = (existing.avg_duration
                        * existing.num_pass as f64
                        + stat.avg_duration_pass * stat.num_pass as f64)
                        / total_pass as f64;
                }
                existing.num_pass = total_pass;
                existing.max_duration = existing.max_duration.max(stat.max_duration_pass);
            } else {
                test_map.insert(
                    test_name.clone(),
                    HistoricTestInfo {
                        test_name: normalized_test_file,
                        num_pass: stat.num_pass,
                        avg_duration: stat.avg_duration_pass,
                        max_duration: stat.max_duration_pass,
                        hooks: hook_map.get(&test_name).unwrap_or(&vec![]).clone(),
                    },
                );
            }
        }
    }

    test_map
}

/// Gather all the hook stats in the given list into a map by the test the hooks ran with.
///
/// # Arguments
///
/// * `stat_list` - List of stats.
///
/// # Returns
///
/// Map of test name and hook stats for hooks that ran with the test.
fn gather_hook_stats(stat_list: &[TestStats]) -> HashMap<String, Vec<HistoricHookInfo>> {
    let mut hook_map: HashMap<String, Vec<HistoricHookInfo>> = HashMap::new();
    for stat in stat_list {
        let normalized_test_file = normalize_test_file(&stat.test_name);
        if is_hook(&normalized_test_file) {
            let test_name = get_test_name(hook_test_name(&normalized_test_file));
            let hook_name = hook_hook_name(&normalized_test_file);
            let entry = hook_map.entry(test_name).or_default();
            if let Some(existing) = entry.iter_mut().find(|h| h.hook_name == hook_name) {
                let total_pass = existing.num_pass + stat.num_pass;
                if total_pass > 0 {
                    existing.avg_duration = (existing.avg_duration
                        * existing.num_pass as f64
                        + stat.avg_duration_pass * stat.num_pass as f64)
                        / total_pass as f64;
                }
                existing.num_pass = total_pass;
            } else {
                entry.push(HistoricHookInfo {
                    hook_name: hook_name.to_string(),
                    avg_duration: stat.avg_duration_pass,
                    num_pass: stat.num_pass,
                });
            }
        }
    }
    hook_map
}

/// Determine if the given identifier is a hook.
///
/// Identifiers for hooks have a ':' in them separating the test name from the hook name.
pub fn is_hook(identifier: &str) -> bool {
    identifier.contains(HOOK_DELIMITER)
}

/// Get the test name part of a given hook identifier.
fn hook_test_name(identifier: &str) -> &str {
    identifier.split(HOOK_DELIMITER).next().unwrap()
}

/// Get the hook name part of a given hook identifier.
fn hook_hook_name(identifier: &str) -> &str {
    identifier.split(HOOK_DELIMITER).last().unwrap()
}

/// Normalize the given test file.
///
/// Converts windows path separators (\) to unix style (/).
fn normalize_test_file(test_file: &str) -> String {
    test_file.replace('\\', "/")
}

/// Get the base name of the given test file, with the extension removed.
pub fn get_test_name(test_file: &str) -> String {
    let s = test_file.split('/');
    s.last().unwrap().trim_end_matches(".js").to_string()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn stat_row(test_name: &str, num_pass: u64, avg: f64, max: f64) -> TestStats {
        TestStats {
            test_name: test_name.to_string(),
            num_pass,
            num_fail: 0,
            avg_duration_pass: avg,
            max_duration_pass: max,
        }
    }

    #[rstest]
    #[case("some/random/test", false)]
    #[case("some/random/test:hook1", true)]
    fn test_is_hook(#[case] hook_name: &str, #[case] expected_is_hook: bool) {
        assert_eq!(is_hook(hook_name), expected_is_hook);
    }

    #[test]
    fn test_hook_test_name() {
        assert_eq!(hook_test_name("my_test:my_hook"), "my_test");
    }

    #[test]
    fn test_hook_hook_name() {
        assert_eq!(hook_hook_name("my_test:my_hook"), "my_hook");
    }

    // normalize test name tests.
    #[rstest]
    #[case("jstests\\core\\add1.js", "jstests/core/add1.js")]
    #[case("jstests\\core\\add1", "jstests/core/add1")]
    #[case("jstests/core/add1.js", "jstests/core/add1.js")]
    #[case("jstests/core/add1", "jstests/core/add1")]
    fn test_normalize_tests(#[case] test_file: &str, #[case] expected_name: &str) {
        let normalized_name = normalize_test_file(test_file);

        assert_eq!(&normalized_name, expected_name);
    }

    // get_test_name tests.
    #[rstest]
    #[case("jstests/core/add1.js", "add1")]
    #[case("jstests/core/add1", "add1")]
    #[case("add1.js", "add1")]
    fn test_get_test_name(#[case] test_file: &str, #[case] expected_name: &str) {
        assert_eq!(get_test_name(test_file), expected_name.to_string());
    }

    // HistoricTaskData tests.
    #[test]
    fn test_duplicate_rows_are_merged_by_weighted_average() {
        let stats = vec![
            stat_row("jstests/core/add1.js", 10, 100.0, 120.0),
            stat_row("jstests\\core\\add1.js", 30, 20.0, 140.0),
        ];

        let task_data = HistoricTaskData::from_test_stats(&stats);

        let test_info = task_data.test_map.get("add1").unwrap();
        assert_eq!(test_info.num_pass, 40);
        assert!((test_info.avg_duration - 40.0).abs() < f64::EPSILON);
        assert!((test_info.max_duration - 140.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hook_rows_are_attached_to_their_test() {
        let stats = vec![
            stat_row("jstests/core/add1.js", 10, 100.0, 120.0),
            stat_row("add1:CleanEveryN", 10, 42.0, 42.0),
            stat_row("add1:ValidateCollections", 10, 8.0, 8.0),
        ];

        let task_data = HistoricTaskData::from_test_stats(&stats);

        let test_info = task_data.test_map.get("add1").unwrap();
        assert_eq!(test_info.hooks.len(), 2);
        assert!((test_info.total_runtime() - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_total_runtime_is_zero_without_passing_runs() {
        let stats = vec![stat_row("jstests/core/add1.js", 0, 100.0, 120.0)];

        let task_data = HistoricTaskData::from_test_stats(&stats);

        let test_info = task_data.test_map.get("add1").unwrap();
        assert_eq!(test_info.total_runtime(), 0.0);
    }

    #[test]
    fn test_get_tests_runtimes_is_sorted_descending() {
        let stats = vec![
            stat_row("jstests/core/add1.js", 1, 10.0, 10.0),
            stat_row("jstests/core/add2.js", 1, 50.0, 50.0),
            stat_row("jstests/core/add3.js", 1, 25.0, 25.0),
        ];

        let task_data = HistoricTaskData::from_test_stats(&stats);
        let runtimes = task_data.get_tests_runtimes();

        let names: Vec<&str> = runtimes.iter().map(|r| r.test_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "jstests/core/add2.js",
                "jstests/core/add3.js",
                "jstests/core/add1.js"
            ]
        );
    }

    #[test]
    fn test_get_avg_hook_runtime_averages_across_tests() {
        let stats = vec![
            stat_row("jstests/core/add1.js", 1, 10.0, 10.0),
            stat_row("add1:CleanEveryN", 1, 30.0, 30.0),
            stat_row("jstests/core/add2.js", 1, 10.0, 10.0),
            stat_row("add2:CleanEveryN", 1, 10.0, 10.0),
        ];

        let task_data = HistoricTaskData::from_test_stats(&stats);

        assert!((task_data.get_avg_hook_runtime("CleanEveryN") - 20.0).abs() < f64::EPSILON);
        assert_eq!(task_data.get_avg_hook_runtime("ValidateCollections"), 0.0);
    }
}
