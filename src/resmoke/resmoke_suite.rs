//! Representation of a resmoke suite file.

use std::{collections::HashSet, str::FromStr};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_yaml::{Error, Value};

use crate::evergreen_names::CLEAN_EVERY_N;

const SHARDED_CLUSTER_FIXTURE_NAME: &str = "ShardedClusterFixture";
const REPLICA_SET_FIXTURE_NAME: &str = "ReplicaSetFixture";

/// Types of fixtures used by resmoke suites.
#[derive(Debug, PartialEq, Clone)]
pub enum SuiteFixtureType {
    /// A suite with no fixtures defined.
    Shell,
    /// A ReplicaSet fixture.
    Repl,
    /// A Sharded fixture.
    Shard,
    /// Some other fixture.
    Other,
}

#[derive(Serialize, Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TestRoot {
    /// The path to a file containing the list of root tests.
    Root { root: String },
    /// A list of root tests.
    Roots { roots: Vec<String> },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResmokeSelector {
    /// A tag matching expression that the tags of selected tests must not match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_tags: Option<String>,
    /// A list of paths or glob patterns the tests must not be included in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_files: Option<Vec<String>>,
    /// A list of tags. No selected tests can have any of them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_with_any_tags: Option<HashSet<String>>,
    /// A list of tags. All selected tests must have at least one them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_with_any_tags: Option<Vec<String>>,
    /// A list of paths or glob patterns the tests must be included in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_files: Option<Vec<String>>,
    /// A tag matching expression that the tags of selected tests must match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_tags: Option<String>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub test_root: Option<TestRoot>,
    /// Filename of a tag file associating tests to tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_file: Option<String>,
}

#[derive(Serialize, Debug, Clone, Deserialize)]
pub struct ResmokeFixture {
    pub class: String,
    #[serde(flatten)]
    pub options: Value,
}

#[derive(Serialize, Debug, Clone, Deserialize)]
pub struct ResmokeExecutor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<Box<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Box<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixture: Option<ResmokeFixture>,
}

/// Configuration of a resmoke test suite.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResmokeSuiteConfig {
    pub test_kind: String,
    pub selector: ResmokeSelector,
    pub executor: ResmokeExecutor,
}

impl FromStr for ResmokeSuiteConfig {
    type Err = Error;

    /// Read Resmoke suite configuration from the given string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl ToString for ResmokeSuiteConfig {
    /// Convert this resmoke suite configuration to a string.
    fn to_string(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }
}

impl ResmokeSuiteConfig {
    /// Get the fixture type of this suite.
    pub fn get_fixture_type(&self) -> SuiteFixtureType {
        let executor = &self.executor;
        if let Some(fixture) = &executor.fixture {
            Self::get_type_from_fixture_class(fixture)
        } else {
            SuiteFixtureType::Shell
        }
    }

    /// Get the type of the given fixture class.
    fn get_type_from_fixture_class(fixture: &ResmokeFixture) -> SuiteFixtureType {
        match fixture.class.as_str() {
            SHARDED_CLUSTER_FIXTURE_NAME => SuiteFixtureType::Shard,
            REPLICA_SET_FIXTURE_NAME => SuiteFixtureType::Repl,
            _ => SuiteFixtureType::Other,
        }
    }

    /// How often the `CleanEveryN` hook runs for this suite.
    ///
    /// # Returns
    ///
    /// The `n` of the hook, 1 if the hook is configured without an `n`, or 0 if
    /// the hook is not part of the suite's executor.
    pub fn clean_every_n_cadence(&self) -> u64 {
        if let Some(hooks) = &self.executor.hooks {
            for hook in hooks {
                if hook.as_str() == Some(CLEAN_EVERY_N) {
                    return 1;
                }
                if hook.get("class").and_then(|c| c.as_str()) == Some(CLEAN_EVERY_N) {
                    return hook.get("n").and_then(|n| n.as_u64()).unwrap_or(1);
                }
            }
        }
        0
    }

    /// Create a new resmoke suite configuration based on this one but running certain tests.
    ///
    /// # Arguments
    ///
    /// * `run_tests` - When provided, the new configuration should only run these tests.
    /// * `exclude_tests` - When provided, the new configuration should exclude these tests.
    ///
    /// # Returns
    ///
    /// New resmoke configuration with a selector based on provided parameters.
    pub fn with_new_tests(
        &self,
        run_tests: Option<&[String]>,
        exclude_tests: Option<&[String]>,
    ) -> Self {
        let mut config = self.clone();
        let mut updated_selector = self.selector.clone();
        if let Some(exclude_tests) = exclude_tests {
            let mut files_to_exclude = vec![];
            if let Some(excluded_files) = &updated_selector.exclude_files {
                files_to_exclude.extend(excluded_files);
            }
            files_to_exclude.extend(exclude_tests.iter());
            updated_selector.exclude_files = Some(
                files_to_exclude
                    .into_iter()
                    .map(|s| s.to_string())
                    .collect(),
            );
        } else if let Some(run_tests) = run_tests {
            updated_selector.exclude_files = None;
            updated_selector.test_root = Some(TestRoot::Roots {
                roots: run_tests.iter().map(|s| s.to_string()).collect(),
            });
        }

        config.selector = updated_selector;
        config
    }
}
