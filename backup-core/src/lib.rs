pub mod archive;
pub mod backup;
pub mod clock;
pub mod config;
pub mod config_manager;
pub mod constants;
pub mod content;
pub mod cron;
pub mod db;
pub mod error;
pub mod integrity;
pub mod job_slot;
pub mod remote_sync;
pub mod restore;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod tests;

pub use error::{BackupError, ErrorKind, Result};
