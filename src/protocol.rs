//! Shared protocol constants for the chunked command-channel transfer

// Envelope bytes reserved for the command wrapper around a chunk: the
// transport's own framing, the script template, and one remote path of up to
// MAX_REMOTE_PATH_LEN bytes.
pub const COMMAND_OVERHEAD_BYTES: usize = 8 * 1024;

// Longest staging path we are willing to embed in a command
pub const MAX_REMOTE_PATH_LEN: usize = 1024;

// Base64 works on 3-byte groups; chunk sizes are kept to whole groups
pub const RAW_QUANTUM: usize = 3;

// Marker inserted between the destination name and the staging suffix
pub const STAGING_MARKER: &str = ".shellcp-";
pub const STAGING_EXTENSION: &str = ".part";

// Hidden-metadata file skipped by direct (non-archived) directory copies
pub const SKIPPED_FILE_NAME: &str = ".DS_Store";

// Prefix/suffix for the local temporary archive of a directory copy
pub const ARCHIVE_PREFIX: &str = "shellcp-";
pub const ARCHIVE_SUFFIX: &str = ".zip";

// Env var that turns on stderr diagnostics from remote commands
pub const DEBUG_ENV: &str = "SHELLCP_DEBUG";

// Expansion factors (numerator, denominator) applied to raw chunk bytes
pub mod expansion {
    // base64
    pub const POSIX: (usize, usize) = (4, 3);
    // base64 payload inside a script that is itself sent as UTF-16LE base64
    pub const POWERSHELL: (usize, usize) = (32, 9);
}

// Envelope budgets used when the host reports none
pub mod envelope {
    // Linux caps a single exec argument (MAX_ARG_STRLEN) at 128 KiB
    pub const POSIX_DEFAULT: usize = 128 * 1024;
    // WinRM client default envelope (153600 bytes)
    pub const POWERSHELL_DEFAULT: usize = 150 * 1024;
}

// Centralized timeout and retry defaults
pub mod timeouts {
    // Connection establishment / shell creation (ms)
    pub const CONNECT_MS: u64 = 30_000;

    // One remote command round-trip (ms)
    pub const OPERATION_MS: u64 = 60_000;

    // Total attempts per chunk before a transient failure becomes fatal
    pub const MAX_ATTEMPTS: u32 = 3;

    // First retry delay, doubled per attempt (ms)
    pub const RETRY_BASE_MS: u64 = 200;

    // Upper bound on a single retry delay (ms)
    pub const RETRY_MAX_MS: u64 = 5_000;
}

// Parallel transfers when the host reports no shell/operation limits
pub const DEFAULT_MAX_PARALLEL: usize = 4;
