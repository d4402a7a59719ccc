pub mod checksum;
pub mod export;
pub mod modules;
pub mod restore;

pub use export::{BackupOptions, BackupType, create_backup};
pub use restore::{RestoreMode, RestoreOptions, RestoreOutcome, restore_backup};
