pub mod config;
pub mod drainer;
pub mod error;
pub mod notice;
pub mod watcher;
