pub mod evg_config;
pub mod evg_config_utils;
pub mod task_state;
pub mod test_stats;
