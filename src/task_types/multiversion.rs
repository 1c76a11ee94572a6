//! Multiversion task generation utilities.
//!
//! In multiversion testing, tasks run against a mix of the version of the server
//! being tested ("new") and previously released versions ("old").
//!
//! - `lts` - Long-Term Support. The yearly, major release of the server.
//! - `continuous` - The quarterly releases of the server.
//! - `old versions` - Which previous releases to test against. If the previous
//!   release was an `lts` release, only that needs to be tested against, otherwise
//!   both it and the last `lts` release are tested.
//! - `version combinations` - Which version each node of a fixture should run,
//!   e.g. `new_old_new` for a 3-node replica set with an old secondary.

use std::{collections::HashSet, sync::Arc};

use anyhow::Result;

use crate::{
    evergreen_names::{BACKPORT_REQUIRED_MULTIVERSION, MULTIVERSION_INCOMPATIBLE},
    resmoke::{resmoke_proxy::TestDiscovery, resmoke_suite::SuiteFixtureType},
};

/// Version combinations for suites running against a replica set fixture.
const REPL_MIXED_VERSION_CONFIGS: [&str; 3] = ["new_new_old", "new_old_new", "old_new_new"];
/// Version combinations for suites running against a sharded cluster fixture.
const SHARDED_MIXED_VERSION_CONFIGS: [&str; 1] = ["new_old_old_new"];

/// One (old version, version combination) pair to generate a multiversion task for.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiversionIteration {
    /// Release to test against, `last_lts` or `last_continuous`.
    pub old_version: String,
    /// Mix of versions the fixture nodes should run.
    pub version_combination: String,
}

impl MultiversionIteration {
    /// Build the name for the given task decorated with this iteration.
    pub fn name_for_task(&self, base_name: &str) -> String {
        name_multiversion_task(base_name, &self.old_version, &self.version_combination)
    }
}

/// A service for helping generating multiversion tasks.
pub trait MultiversionService: Sync + Send {
    /// Get the old versions that multiversion tasks should be generated for.
    fn get_old_versions(&self) -> Vec<String>;

    /// Get the (old version, version combination) pairs for the given suite.
    ///
    /// # Arguments
    ///
    /// * `suite_name` - Name of suite multiversion tasks are based on.
    ///
    /// # Returns
    ///
    /// All iterations a multiversion task for the suite should be generated for.
    fn multiversion_iterations(&self, suite_name: &str) -> Result<Vec<MultiversionIteration>>;

    /// Get the exclude tags for the given task.
    ///
    /// # Arguments
    ///
    /// * `task_name` - Name of parent task being generated.
    ///
    /// # Returns
    ///
    /// Exclude tags as a comma-separated string.
    fn exclude_tags_for_task(&self, task_name: &str) -> String;
}

/// Implementation of Multiversion service.
pub struct MultiversionServiceImpl {
    /// Service to query details about test suites.
    test_discovery: Arc<dyn TestDiscovery>,
    /// Old versions available to test against.
    last_versions: Vec<String>,
    /// FCV tags that tests must be excluded on.
    requires_fcv_tag: String,
}

impl MultiversionServiceImpl {
    /// Create a new instance of Multiversion service.
    ///
    /// # Arguments
    ///
    /// * `test_discovery` - Service to query details about test suites.
    pub fn new(test_discovery: Arc<dyn TestDiscovery>) -> Result<Self> {
        let multiversion_config = test_discovery.get_multiversion_config()?;
        Ok(Self {
            test_discovery,
            last_versions: multiversion_config.last_versions,
            requires_fcv_tag: multiversion_config.requires_fcv_tag,
        })
    }

    /// Get the version combinations appropriate for the given suite's fixture.
    fn get_version_combinations(&self, suite_name: &str) -> Result<Vec<String>> {
        let suite_config = self.test_discovery.get_suite_config(suite_name)?;
        let combinations = match suite_config.get_fixture_type() {
            SuiteFixtureType::Repl => REPL_MIXED_VERSION_CONFIGS
                .iter()
                .map(|combination| combination.to_string())
                .collect(),
            SuiteFixtureType::Shard => SHARDED_MIXED_VERSION_CONFIGS
                .iter()
                .map(|combination| combination.to_string())
                .collect(),
            _ => vec!["".to_string()],
        };
        Ok(combinations)
    }
}

impl MultiversionService for MultiversionServiceImpl {
    fn get_old_versions(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.last_versions
            .iter()
            .filter(|version| seen.insert(version.as_str()))
            .cloned()
            .collect()
    }

    fn multiversion_iterations(&self, suite_name: &str) -> Result<Vec<MultiversionIteration>> {
        let version_combinations = self.get_version_combinations(suite_name)?;
        Ok(self
            .get_old_versions()
            .iter()
            .flat_map(|old_version| {
                version_combinations
                    .iter()
                    .map(move |combination| MultiversionIteration {
                        old_version: old_version.clone(),
                        version_combination: combination.clone(),
                    })
            })
            .collect())
    }

    fn exclude_tags_for_task(&self, task_name: &str) -> String {
        let task_tag = format!("{}_{}", task_name, BACKPORT_REQUIRED_MULTIVERSION);
        let tags = vec![
            MULTIVERSION_INCOMPATIBLE.to_string(),
            BACKPORT_REQUIRED_MULTIVERSION.to_string(),
            task_tag,
            self.requires_fcv_tag.clone(),
        ];

        tags.join(",")
    }
}

/// Build a multiversion task name, omitting any empty components.
pub fn name_multiversion_task(base_name: &str, old_version: &str, version_combination: &str) -> String {
    [base_name, old_version, version_combination]
        .iter()
        .filter(|part| !part.is_empty())
        .cloned()
        .collect::<Vec<&str>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;
    use crate::resmoke::resmoke_proxy::MultiversionConfig;
    use crate::resmoke::resmoke_suite::ResmokeSuiteConfig;

    struct MockTestDiscovery {
        fixture_class: String,
        last_versions: Vec<String>,
    }

    impl TestDiscovery for MockTestDiscovery {
        fn discover_tests(&self, _suite_name: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }

        fn get_suite_config(&self, _suite_name: &str) -> Result<ResmokeSuiteConfig> {
            let config = format!(
                "
            test_kind: js_test
            selector:
              roots:
                - jstests/auth/*.js
            executor:
              fixture:
                class: {}
        ",
                self.fixture_class
            );
            Ok(ResmokeSuiteConfig::from_str(&config).unwrap())
        }

        fn get_multiversion_config(&self) -> Result<MultiversionConfig> {
            Ok(MultiversionConfig {
                last_versions: self.last_versions.clone(),
                requires_fcv_tag: "requires_fcv_71".to_string(),
            })
        }

        fn generate_multiversion_exclude_tags(
            &self,
            _old_version: &str,
            _exclude_tags_file: &Path,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn build_multiversion_service(
        fixture_class: &str,
        last_versions: Vec<String>,
    ) -> MultiversionServiceImpl {
        MultiversionServiceImpl::new(Arc::new(MockTestDiscovery {
            fixture_class: fixture_class.to_string(),
            last_versions,
        }))
        .unwrap()
    }

    #[test]
    fn test_old_versions_are_deduplicated() {
        let multiversion_service = build_multiversion_service(
            "ReplicaSetFixture",
            vec!["last_lts".to_string(), "last_lts".to_string()],
        );

        assert_eq!(multiversion_service.get_old_versions(), vec!["last_lts"]);
    }

    #[rstest]
    #[case("ReplicaSetFixture", 3)]
    #[case("ShardedClusterFixture", 1)]
    #[case("MongoDFixture", 1)]
    fn test_iterations_follow_the_fixture_type(
        #[case] fixture_class: &str,
        #[case] expected_combinations: usize,
    ) {
        let multiversion_service = build_multiversion_service(
            fixture_class,
            vec!["last_lts".to_string(), "last_continuous".to_string()],
        );

        let iterations = multiversion_service.multiversion_iterations("my_suite").unwrap();

        assert_eq!(iterations.len(), 2 * expected_combinations);
    }

    #[test]
    fn test_iteration_names_skip_empty_components() {
        let iteration = MultiversionIteration {
            old_version: "last_lts".to_string(),
            version_combination: "".to_string(),
        };

        assert_eq!(iteration.name_for_task("jsCore"), "jsCore_last_lts");
    }

    #[test]
    fn test_iteration_names_include_the_version_combination() {
        let iteration = MultiversionIteration {
            old_version: "last_continuous".to_string(),
            version_combination: "new_old_new".to_string(),
        };

        assert_eq!(
            iteration.name_for_task("replica_sets"),
            "replica_sets_last_continuous_new_old_new"
        );
    }

    #[test]
    fn test_exclude_tags_include_the_task_specific_tag() {
        let multiversion_service =
            build_multiversion_service("ReplicaSetFixture", vec!["last_lts".to_string()]);

        let tags = multiversion_service.exclude_tags_for_task("replica_sets");

        assert!(tags.contains("multiversion_incompatible"));
        assert!(tags.contains("replica_sets_backport_required_multiversion"));
        assert!(tags.contains("requires_fcv_71"));
    }
}
