pub mod change_detection;
pub mod config_extraction;
