use std::{
    path::{Path, PathBuf},
    process::exit,
    time::Instant,
};

use anyhow::{Context, Result};
use clap::Parser;
use dynamic_task_generator::{
    generate_configuration, Dependencies, ExecutionConfiguration, ProjectInfo, SplitConfig,
};
use serde::Deserialize;
use tracing::{event, Level};
use tracing_subscriber::fmt::format;

/// Default number of minutes of test runtime to aim for in each sub-suite.
const DEFAULT_TARGET_RESMOKE_TIME_MIN: u64 = 60;
/// Default maximum number of sub-suites to split a task into.
const DEFAULT_MAX_SUB_SUITES: usize = 5;

/// Expansions from evergreen to determine settings for how tasks should be generated.
#[derive(Debug, Deserialize)]
struct EvgExpansions {
    /// Evergreen project being run.
    pub project: String,
    /// Git revision being run against.
    pub revision: String,
    /// ID of Evergreen version running.
    pub version_id: String,
    /// Name of task running generation.
    pub task_name: String,
    /// ID of task running generation.
    pub task_id: String,
    /// Whether generation is part of a patch build.
    pub is_patch: Option<String>,
    /// Evergreen alias the patch was created under.
    pub alias: Option<String>,
    /// Runtime (in minutes) to aim for in each sub-suite.
    pub target_resmoke_time: Option<String>,
    /// Maximum number of sub-suites to split a task into.
    pub max_sub_suites: Option<String>,
    /// Maximum number of tests to put in a single sub-suite.
    pub max_tests_per_suite: Option<String>,
    /// Sanitizer options the build variant runs with.
    pub san_options: Option<String>,
}

impl EvgExpansions {
    /// Read evergreen expansions from the given yaml file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to YAML file to read.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// File to store generated configuration under.
    pub fn config_location(&self) -> String {
        format!(
            "{}/{}/generate_tasks/generated-config-{}.tgz",
            self.project, self.revision, self.version_id
        )
    }

    /// Whether generation is running in a patch build.
    pub fn is_patch(&self) -> bool {
        self.is_patch.as_deref() == Some("true")
    }

    /// Build the suite split configuration described by the expansions.
    pub fn split_config(&self) -> Result<SplitConfig> {
        let target_resmoke_time_min = match &self.target_resmoke_time {
            Some(target_resmoke_time) => target_resmoke_time.parse()?,
            None => DEFAULT_TARGET_RESMOKE_TIME_MIN,
        };
        let max_sub_suites = match &self.max_sub_suites {
            Some(max_sub_suites) => max_sub_suites.parse()?,
            None => DEFAULT_MAX_SUB_SUITES,
        };
        let max_tests_per_suite = match &self.max_tests_per_suite {
            Some(max_tests_per_suite) => max_tests_per_suite.parse()?,
            None => usize::MAX,
        };
        Ok(SplitConfig {
            target_runtime_seconds: (target_resmoke_time_min * 60) as f64,
            max_sub_suites,
            max_tests_per_suite,
            is_asan: self
                .san_options
                .as_deref()
                .map(|options| !options.is_empty())
                .unwrap_or(false),
        })
    }
}

#[derive(Parser, Debug)]
#[clap(about, version)]
struct Args {
    /// File containing evergreen project configuration.
    #[clap(long)]
    evg_project_file: PathBuf,

    /// File containing expansions that impact task generation.
    #[clap(long)]
    expansion_file: PathBuf,

    /// Directory to write generated configuration files to.
    #[clap(long, default_value = "generated_resmoke_config")]
    target_directory: PathBuf,

    /// Command to invoke resmoke with.
    #[clap(long, default_value = "python buildscripts/resmoke.py")]
    resmoke_command: String,

    /// Endpoint to query historic test stats from.
    #[clap(long, default_value = "https://mongo-test-stats.s3.amazonaws.com")]
    test_stats_endpoint: String,

    /// Base URL of the evergreen API.
    #[clap(long, default_value = "https://evergreen.mongodb.com/api")]
    evg_api_server: String,

    /// File containing per-task timeout overrides.
    #[clap(long)]
    timeout_overrides_file: Option<String>,

    /// File containing configuration for generating sub-tasks.
    #[clap(long)]
    generate_sub_tasks_config: Option<String>,

    /// Exec timeout to apply to all generated sub-tasks, in seconds.
    #[clap(long)]
    exec_timeout_secs: Option<u64>,

    /// Idle timeout to apply to all generated sub-tasks, in seconds.
    #[clap(long)]
    test_timeout_secs: Option<u64>,

    /// Generate burn_in tasks for changed tests.
    #[clap(long)]
    burn_in: bool,
}

/// Expand any '~' in the given user-supplied path.
fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Configure logging for the command execution.
fn configure_logging() {
    let format = format::json();
    let subscriber = tracing_subscriber::fmt().event_format(format).finish();

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    configure_logging();

    if let Err(err) = run(args).await {
        eprintln!("Error encountered during execution: {:?}", err);
        exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let evg_expansions = EvgExpansions::from_yaml_file(&args.expansion_file)
        .context("Reading expansions file")?;
    let split_config = evg_expansions
        .split_config()
        .context("Invalid suite split expansions")?;
    let gen_sub_tasks_config_file = args
        .generate_sub_tasks_config
        .as_deref()
        .map(expand_path);
    let timeout_overrides_file = args.timeout_overrides_file.as_deref().map(expand_path);
    let project_info = ProjectInfo::new(
        args.evg_project_file.clone(),
        &evg_expansions.project,
        gen_sub_tasks_config_file,
    );
    let config_location = evg_expansions.config_location();
    let execution_config = ExecutionConfiguration {
        project_info: &project_info,
        resmoke_command: &args.resmoke_command,
        target_directory: &args.target_directory,
        generating_task: &evg_expansions.task_name,
        config_location: &config_location,
        gen_burn_in: args.burn_in,
        base_revision: &evg_expansions.revision,
        test_stats_endpoint: &args.test_stats_endpoint,
        evg_api_server: &args.evg_api_server,
        timeout_overrides_file: timeout_overrides_file.as_deref(),
        exec_timeout_override_secs: args.exec_timeout_secs,
        test_timeout_override_secs: args.test_timeout_secs,
        evg_alias: evg_expansions.alias.as_deref(),
        is_patch: evg_expansions.is_patch(),
        split_config,
    };
    let deps = Dependencies::new(execution_config).context("Setting up dependencies")?;

    // A retry of a task that already published its configuration must not publish again.
    let already_completed = deps
        .task_state_service
        .generation_already_completed(&evg_expansions.task_id)
        .await
        .unwrap_or(false);
    if already_completed {
        event!(
            Level::INFO,
            task_id = evg_expansions.task_id.as_str(),
            "Task generation was already completed by a previous execution"
        );
        return Ok(());
    }

    let start = Instant::now();
    let result = generate_configuration(&deps, &args.target_directory).await;
    event!(
        Level::INFO,
        duration_secs = start.elapsed().as_secs(),
        "generation completed"
    );
    result
}
