pub mod cloud;
pub mod config;
pub mod core;
pub mod env;
pub mod tmux;
pub mod utils;
