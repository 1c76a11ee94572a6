pub mod fuzzer_tasks;
pub mod generated_task;
pub mod multiversion;
pub mod resmoke_config_writer;
pub mod resmoke_tasks;
pub mod split_tasks;
pub mod timeouts;
