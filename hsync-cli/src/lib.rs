pub mod config;
pub mod connection_management;
pub mod console_host;
pub mod relay_commands;
