//! Backup format versions.

/// Reported by `BackupBases::min_backup_version` when no backup is tracked.
pub const NO_BACKUP: i32 = -1;

/// Oldest format whose details carry item modification times. Bases older
/// than this cannot seed an incremental backup.
pub const MIN_INCREMENTAL: i32 = 2;

/// Format written by this build.
pub const BACKUP: i32 = 3;
