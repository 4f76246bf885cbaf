//! Misc constants, copied from PostgreSQL headers.
//!
//! TODO: generate these with bindgen against a real server tree instead of
//! transcribing them; for now it's convenient to have them all in one place.

/// Default block size for a data file page.
pub const BLCKSZ: u16 = 8192;

/// Default WAL segment size. Clusters can be initdb'd with a different size,
/// but 16MiB is by far the common case and is what the engine assumes unless
/// told otherwise via server config.
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Minimum server major version the engine's non-exclusive backup protocol
/// (two-argument `pg_backup_stop` returning the three-tuple) requires.
pub const MIN_SUPPORTED_SERVER_VERSION: u32 = 150000;

// From relpath.h: fork numbers embedded in the three-part "<relfile>_<fork>"
// segment file naming scheme. The engine doesn't need to interpret these
// beyond recognizing that a segment file belongs to *some* fork.
pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

// Directory names, relative to PGDATA, that the path enumerator always
// expects to find (copied from initdb.c's list of subdirectories). Used to
// sanity-check that a PGDATA root looks real before committing to copying
// it.
pub const PGDATA_SENTINEL_FILES: [&str; 2] = ["PG_VERSION", "global/pg_control"];

pub const ARCHIVE_STATUS_SUBDIR: &str = "pg_wal/archive_status";
pub const WAL_SUBDIR: &str = "pg_wal";

/// Default `log_directory` for a cluster using the logging collector,
/// relative to PGDATA.
pub const SERVER_LOG_SUBDIR: &str = "log";
