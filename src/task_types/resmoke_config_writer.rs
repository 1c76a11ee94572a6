//! An actor for building and writing resmoke configuration files to disk.
//!
//! This actor will create several instances of itself and send requests to the instances
//! in a round-robbin pattern. The number of instances to create can be specified with the
//! `n_workers` argument when creating the actor.
//!
//! When using this actor, to ensure that all in-flight requests have been completed, you
//! will want to send a `flush` message. This message will wait for all actor instances to
//! complete any work they have queued up before returning, and reports any write failures
//! that were encountered.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{event, Level};

use crate::{
    evergreen_names::MULTIVERSION_EXCLUDE_TAGS_FILE,
    resmoke::resmoke_proxy::TestDiscovery,
    utils::{fs_service::FsService, task_name::name_sub_suite_file},
};

use super::split_tasks::SubSuite;

/// Information needed to generate resmoke configuration files for a generated task.
#[derive(Clone, Debug)]
pub struct ResmokeSuiteGenerationInfo {
    /// Name the generated suite files should be based on, including any
    /// multiversion decoration.
    pub task_name: String,

    /// Name of resmoke suite the generated task is based on.
    pub origin_suite: String,

    /// Name of build variant the task was generated for.
    pub build_variant: String,

    /// List of generated sub-suites comprising the task.
    pub sub_suites: Vec<SubSuite>,

    /// Old version the task runs against, when generating a multiversion task.
    pub old_version: Option<String>,
}

#[derive(Debug)]
/// Messages that can be sent to the `ResmokeConfigWriter` actor.
enum ResmokeConfigMessage {
    /// Generate and write resmoke configuration files for the given list of sub-suites.
    SuiteFiles(ResmokeSuiteGenerationInfo),

    /// Wait for all in-flight config files to be written to disk.
    Flush(oneshot::Sender<Vec<String>>),
}

/// The actor implementation that performs actions based on received messages.
struct WriteConfigActorImpl {
    /// Test discovery service.
    test_discovery: Arc<dyn TestDiscovery>,

    /// Filesystem service.
    fs_service: Arc<dyn FsService>,

    /// Receiver to wait for messages on.
    receiver: mpsc::Receiver<ResmokeConfigMessage>,

    /// Directory to write generated files to.
    target_dir: String,

    /// Old versions an exclude-tags file has been generated for, shared
    /// between all actor workers.
    exclude_tags_generated: Arc<Mutex<HashSet<String>>>,

    /// Descriptions of writes that failed.
    failures: Vec<String>,
}

impl WriteConfigActorImpl {
    /// Create a new instance of the actor.
    ///
    /// # Arguments
    ///
    /// * `test_discovery` - Instance of the test discovery service.
    /// * `fs_service` - Service to work with the filesystem.
    /// * `receiver` - Mailbox to query for messages.
    /// * `target_dir` - Directory to write generated files to.
    /// * `exclude_tags_generated` - Shared record of generated exclude-tags files.
    ///
    /// # Returns
    ///
    /// An instance of the actor.
    fn new(
        test_discovery: Arc<dyn TestDiscovery>,
        fs_service: Arc<dyn FsService>,
        receiver: mpsc::Receiver<ResmokeConfigMessage>,
        target_dir: String,
        exclude_tags_generated: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        WriteConfigActorImpl {
            test_discovery,
            fs_service,
            receiver,
            target_dir,
            exclude_tags_generated,
            failures: vec![],
        }
    }

    /// Handle received messages as long as the receiver has messages to handle.
    async fn run(&mut self) {
        while let Some(msg) = self.receiver.recv().await {
            self.handle_message(msg);
        }
    }

    /// Perform the action specified by the given message.
    ///
    /// # Arguments
    ///
    /// * `msg` - Message to act on.
    fn handle_message(&mut self, msg: ResmokeConfigMessage) {
        match msg {
            ResmokeConfigMessage::SuiteFiles(suite_info) => {
                if let Err(err) = self.write_suite_files(&suite_info) {
                    event!(
                        Level::ERROR,
                        task_name = suite_info.task_name.as_str(),
                        error = err.to_string().as_str(),
                        "Failed to write suite configuration"
                    );
                    self.failures
                        .push(format!("{}: {}", suite_info.task_name, err));
                }
            }
            ResmokeConfigMessage::Flush(sender) => {
                let failures = std::mem::take(&mut self.failures);
                // The receiver disappearing means the caller gave up on the flush.
                let _ = sender.send(failures);
            }
        }
    }

    /// Write the suite files for the given configuration out to disk.
    ///
    /// # Arguments
    ///
    /// * `suite_info` - Details about the suite that was generated.
    fn write_suite_files(&self, suite_info: &ResmokeSuiteGenerationInfo) -> Result<()> {
        let origin_config = self
            .test_discovery
            .get_suite_config(&suite_info.origin_suite)?;

        let total_sub_suites = suite_info.sub_suites.len();
        let placed_tests: Vec<String> = suite_info
            .sub_suites
            .iter()
            .filter(|sub_suite| sub_suite.index.is_some())
            .flat_map(|sub_suite| sub_suite.test_list.clone())
            .collect();

        for sub_suite in &suite_info.sub_suites {
            let config = match sub_suite.index {
                // The misc suite excludes all placed tests instead of listing its
                // own, so tests added after generation still get run.
                None => origin_config.with_new_tests(None, Some(&placed_tests)),
                Some(_) => origin_config.with_new_tests(Some(&sub_suite.test_list), None),
            };
            let mut path = PathBuf::from(&self.target_dir);
            path.push(name_sub_suite_file(
                &suite_info.task_name,
                sub_suite.index,
                total_sub_suites,
                &suite_info.build_variant,
            ));
            self.fs_service.write_file(&path, &config.to_string())?;
        }

        if let Some(old_version) = &suite_info.old_version {
            self.generate_exclude_tags(old_version)?;
        }

        Ok(())
    }

    /// Generate the multiversion exclude-tags file for the given old version.
    ///
    /// The file only needs to be generated once per old version per run.
    fn generate_exclude_tags(&self, old_version: &str) -> Result<()> {
        {
            let mut generated = self
                .exclude_tags_generated
                .lock()
                .map_err(|_| anyhow!("exclude tags lock was poisoned"))?;
            if !generated.insert(old_version.to_string()) {
                return Ok(());
            }
        }

        let mut path = PathBuf::from(&self.target_dir);
        path.push(MULTIVERSION_EXCLUDE_TAGS_FILE);
        self.test_discovery
            .generate_multiversion_exclude_tags(old_version, &path)
    }
}

#[async_trait]
pub trait ResmokeConfigActor: Sync + Send {
    /// Send a message to write a configuration file to disk.
    async fn write_sub_suite(&mut self, gen_suite: &ResmokeSuiteGenerationInfo);

    /// Wait for all in-progress writes to complete and report any failures.
    async fn flush(&mut self) -> Result<Vec<String>>;
}

#[derive(Clone, Debug)]
/// Actor interface for generating and writing resmoke configuration files.
pub struct ResmokeConfigActorService {
    /// Actor workers to send messages to.
    senders: Vec<mpsc::Sender<ResmokeConfigMessage>>,

    /// Next actor worker to send a message to.
    index: usize,
}

impl ResmokeConfigActorService {
    /// Create a new instance of the actor.
    ///
    /// # Arguments
    ///
    /// * `test_discovery` - Instance of the test discovery service.
    /// * `fs_service` - Service to work with the filesystem.
    /// * `target_dir` - Directory to write generated configuration files to.
    /// * `n_workers` - Number of actor workers to run.
    ///
    /// # Returns
    ///
    /// An instance of the actor.
    pub fn new(
        test_discovery: Arc<dyn TestDiscovery>,
        fs_service: Arc<dyn FsService>,
        target_dir: &str,
        n_workers: usize,
    ) -> Self {
        let exclude_tags_generated = Arc::new(Mutex::new(HashSet::new()));
        let senders_and_receivers = (0..n_workers).map(|_| mpsc::channel(100));
        let mut senders = vec![];
        senders_and_receivers
            .into_iter()
            .for_each(|(sender, receiver)| {
                senders.push(sender);
                let mut actor = WriteConfigActorImpl::new(
                    test_discovery.clone(),
                    fs_service.clone(),
                    receiver,
                    target_dir.to_string(),
                    exclude_tags_generated.clone(),
                );
                tokio::spawn(async move { actor.run().await });
            });

        Self { senders, index: 0 }
    }

    /// Send messages to the actor workers with a round-robbin strategy.
    ///
    /// # Arguments
    ///
    /// * `msg` - Message to send to a worker.
    async fn round_robbin(&mut self, msg: ResmokeConfigMessage) -> Result<()> {
        let next = self.index;
        self.index = (next + 1) % self.senders.len();
        self.senders[next]
            .send(msg)
            .await
            .map_err(|_| anyhow!("resmoke config worker is gone"))
    }
}

#[async_trait]
impl ResmokeConfigActor for ResmokeConfigActorService {
    async fn write_sub_suite(&mut self, gen_suite: &ResmokeSuiteGenerationInfo) {
        let msg = ResmokeConfigMessage::SuiteFiles(gen_suite.clone());
        if let Err(err) = self.round_robbin(msg).await {
            event!(
                Level::ERROR,
                error = err.to_string().as_str(),
                "Could not queue suite file write"
            );
        }
    }

    async fn flush(&mut self) -> Result<Vec<String>> {
        let mut failures = vec![];
        for sender in &self.senders {
            let (send, recv) = oneshot::channel();
            let msg = ResmokeConfigMessage::Flush(send);
            sender
                .send(msg)
                .await
                .map_err(|_| anyhow!("resmoke config worker is gone"))?;
            failures.extend(recv.await?);
        }
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, ops::AddAssign, path::Path, str::FromStr};

    use super::*;
    use crate::resmoke::{
        resmoke_proxy::MultiversionConfig, resmoke_suite::ResmokeSuiteConfig,
    };

    struct MockTestDiscovery {
        exclude_tags_calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockTestDiscovery {
        fn new() -> Self {
            Self {
                exclude_tags_calls: Arc::new(Mutex::new(vec![])),
            }
        }
    }

    impl TestDiscovery for MockTestDiscovery {
        fn discover_tests(&self, _suite_name: &str) -> Result<Vec<String>> {
            todo!()
        }

        fn get_suite_config(&self, _suite_name: &str) -> Result<ResmokeSuiteConfig> {
            let sample_config = "
                test_kind: js_test

                selector:
                  roots:
                    - jstests/auth/*.js
                  exclude_files:
                    - jstests/auth/repl.js

                executor: {}
            ";
            Ok(ResmokeSuiteConfig::from_str(sample_config).unwrap())
        }

        fn get_multiversion_config(&self) -> Result<MultiversionConfig> {
            todo!()
        }

        fn generate_multiversion_exclude_tags(
            &self,
            old_version: &str,
            _exclude_tags_file: &Path,
        ) -> Result<()> {
            self.exclude_tags_calls
                .lock()
                .unwrap()
                .push(old_version.to_string());
            Ok(())
        }
    }

    struct MockFsService {
        pub call_counts: Arc<Mutex<RefCell<HashMap<String, usize>>>>,
    }

    impl MockFsService {
        pub fn new() -> Self {
            Self {
                call_counts: Arc::new(Mutex::new(RefCell::new(HashMap::new()))),
            }
        }

        pub fn get_call_counts(&self, path: &str) -> usize {
            let call_counts = self.call_counts.lock().unwrap();
            let call_counts_table = call_counts.borrow();
            *call_counts_table.get(path).unwrap()
        }
    }

    impl FsService for MockFsService {
        fn file_exists(&self, _path: &str) -> bool {
            todo!()
        }

        fn write_file(&self, path: &Path, _contents: &str) -> Result<()> {
            let call_count_wrapper = self.call_counts.lock().unwrap();
            let mut call_count = call_count_wrapper.borrow_mut();
            if let Some(path_calls) = call_count.get_mut(path.to_str().unwrap()) {
                path_calls.add_assign(1);
            } else {
                call_count.insert(path.to_str().unwrap().to_string(), 1);
            }
            Ok(())
        }
    }

    fn build_actor(
        test_discovery: Arc<MockTestDiscovery>,
        fs_service: Arc<MockFsService>,
    ) -> WriteConfigActorImpl {
        let (_tx, rx) = mpsc::channel(1);
        WriteConfigActorImpl::new(
            test_discovery,
            fs_service,
            rx,
            "target".to_string(),
            Arc::new(Mutex::new(HashSet::new())),
        )
    }

    fn sample_sub_suites() -> Vec<SubSuite> {
        vec![
            SubSuite {
                index: Some(0),
                suite_name: "original_suite".to_string(),
                test_list: vec!["test_0.js".to_string(), "test_1.js".to_string()],
                ..Default::default()
            },
            SubSuite {
                index: Some(1),
                suite_name: "original_suite".to_string(),
                test_list: vec!["test_2.js".to_string(), "test_3.js".to_string()],
                ..Default::default()
            },
            SubSuite {
                index: None,
                suite_name: "original_suite".to_string(),
                test_list: vec![],
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_write_suite_files_includes_misc() {
        let test_discovery = Arc::new(MockTestDiscovery::new());
        let fs_service = Arc::new(MockFsService::new());
        let resmoke_config_actor = build_actor(test_discovery, fs_service.clone());
        let suite_info = ResmokeSuiteGenerationInfo {
            task_name: "my_task".to_string(),
            origin_suite: "original_suite".to_string(),
            build_variant: "my_variant".to_string(),
            sub_suites: sample_sub_suites(),
            old_version: None,
        };

        resmoke_config_actor.write_suite_files(&suite_info).unwrap();

        assert_eq!(
            fs_service.get_call_counts("target/my_task_0_my_variant.yml"),
            1
        );
        assert_eq!(
            fs_service.get_call_counts("target/my_task_1_my_variant.yml"),
            1
        );
        assert_eq!(
            fs_service.get_call_counts("target/my_task_misc_my_variant.yml"),
            1
        );
    }

    #[test]
    fn test_multiversion_suite_generates_exclude_tags_once() {
        let test_discovery = Arc::new(MockTestDiscovery::new());
        let fs_service = Arc::new(MockFsService::new());
        let resmoke_config_actor = build_actor(test_discovery.clone(), fs_service);
        let suite_info = ResmokeSuiteGenerationInfo {
            task_name: "my_task_last_lts_new_old_new".to_string(),
            origin_suite: "original_suite".to_string(),
            build_variant: "my_variant".to_string(),
            sub_suites: sample_sub_suites(),
            old_version: Some("last_lts".to_string()),
        };

        resmoke_config_actor.write_suite_files(&suite_info).unwrap();
        resmoke_config_actor.write_suite_files(&suite_info).unwrap();

        let calls = test_discovery.exclude_tags_calls.lock().unwrap();
        assert_eq!(*calls, vec!["last_lts".to_string()]);
    }
}
