pub mod show_config;
pub mod start;
pub mod status;
