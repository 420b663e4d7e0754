mod backup;
mod restore;
mod scheduler;
mod serve;

// Backup commands
pub use backup::{run_create, run_delete, run_list, run_stats, run_validate};

// Restore commands
pub use restore::run_restore;

// Scheduler commands
pub use scheduler::{
    disable_scheduler, enable_scheduler, show_scheduler_status, trigger_scheduler, update_schedule,
};

// Serve command
pub use serve::run_serve;
