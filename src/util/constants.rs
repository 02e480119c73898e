// log-enricher - util/constants.rs
//
// Single source of truth for all named constants, limits, and defaults.

// =============================================================================
// Application metadata
// =============================================================================

/// Application identifier used in logs and default labels.
pub const APP_NAME: &str = "log-enricher";

/// Current application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fallback app label when no app-naming policy matches.
pub const DEFAULT_APP_LABEL: &str = "log-enricher";

// =============================================================================
// Entry / byte-buffer pools (4.A)
// =============================================================================

/// Hard cap on in-flight pooled entries. Acquiring blocks past this bound.
pub const ENTRY_POOL_SIZE: usize = 100;

/// `fields` map size buckets used to choose the pre-sized capacity of a
/// cleared entry's map on reuse.
pub const ENTRY_FIELD_BUCKETS: &[usize] = &[5, 10, 20, 40, 60, 100];

/// Hard cap on pooled byte buffers.
pub const BYTE_POOL_SIZE: usize = 256;

/// Byte buffers larger than this are dropped on release instead of reused.
pub const BYTE_POOL_MAX_BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

// =============================================================================
// File tailer (4.D)
// =============================================================================

/// Initial EOF backoff.
pub const TAIL_BACKOFF_INITIAL_MS: u64 = 250;

/// Maximum EOF backoff (doubles from the initial value up to this bound).
pub const TAIL_BACKOFF_MAX_MS: u64 = 5_000;

/// How many times a tailer retries reopening a rotated file before giving up.
pub const MAX_REOPEN_ATTEMPTS: u32 = 5;

/// Delay between reopen attempts after a detected rotation.
pub const REOPEN_RETRY_INTERVAL_MS: u64 = 500;

/// Maximum size of an accumulated partial (newline-less) line buffer before
/// it is discarded with a warning rather than grown without bound.
pub const MAX_TAIL_PARTIAL_BYTES: usize = 1024 * 1024; // 1 MiB

/// Read chunk size per tailer poll.
pub const TAIL_READ_CHUNK_BYTES: usize = 64 * 1024;

// =============================================================================
// Tailer manager (4.E)
// =============================================================================

/// Default file extensions watched when `LOG_FILE_EXTENSIONS` is unset.
pub const DEFAULT_LOG_FILE_EXTENSIONS: &[&str] = &["log"];

// =============================================================================
// Persisted caches (4.C)
// =============================================================================

/// Soft upper bound on entries in a persisted cache before a housekeeping
/// tick trims the oldest-enumerated entries.
pub const DEFAULT_CACHE_MAX_SIZE: usize = 50_000;

/// Minimum randomised initial delay before a cache's first housekeeping tick.
pub const CACHE_TICK_JITTER_MIN_SECS: u64 = 30;

/// Maximum randomised initial delay before a cache's first housekeeping tick.
pub const CACHE_TICK_JITTER_MAX_SECS: u64 = 530;

/// Steady-state interval between housekeeping ticks once the jittered
/// initial delay has elapsed.
pub const CACHE_TICK_INTERVAL_SECS: u64 = 300;

// =============================================================================
// Hostname enrichment (4.K)
// =============================================================================

/// Total deadline for the parallel rDNS/mDNS/LLMNR/NetBIOS fan-out.
pub const HOSTNAME_LOOKUP_DEADLINE_MS: u64 = 5_000;

/// Interval between background re-checks of cached MAC -> hostname entries.
pub const HOSTNAME_REFRESH_INTERVAL_SECS: u64 = 600;

/// UDP port probed to stimulate IPv6 neighbour discovery.
pub const IPV6_NEIGHBOUR_PROBE_PORT: u16 = 33434;

/// Interval between re-reads of the kernel neighbour table
/// (`/proc/net/arp` on Linux) that populate `LinuxNeighbourWatcher`.
pub const NEIGHBOUR_TABLE_POLL_INTERVAL_SECS: u64 = 30;

// =============================================================================
// GeoIP (4.L)
// =============================================================================

/// Reopen attempts after a reload-watch event fires.
pub const GEOIP_RELOAD_RETRY_ATTEMPTS: u32 = 5;

/// Delay between GeoIP reopen attempts.
pub const GEOIP_RELOAD_RETRY_INTERVAL_MS: u64 = 100;

// =============================================================================
// Push-protocol HTTP receiver (4.M)
// =============================================================================

/// Default bind address when `PROMTAIL_HTTP_ADDR` is unset.
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:3500";

/// Default max body size accepted by the receiver.
pub const DEFAULT_HTTP_MAX_BODY_BYTES: usize = 10 * 1024 * 1024; // 10 MiB

/// Default root under which sanitised push-derived source paths are joined.
pub const DEFAULT_HTTP_SOURCE_ROOT: &str = "/cache/promtail";

/// Fallback source-path basename prefix when a sanitised candidate would
/// escape the configured source root.
pub const HTTP_FALLBACK_SOURCE_PREFIX: &str = "stream";

// =============================================================================
// Sinks (4.N)
// =============================================================================

/// Default file-sink suffix appended to the original source path.
pub const DEFAULT_ENRICHED_FILE_SUFFIX: &str = ".enriched";

/// Fixed `job` label value used by the remote (Loki) sink.
pub const REMOTE_SINK_JOB_LABEL: &str = "log-enricher";

// =============================================================================
// Logging
// =============================================================================

/// Default log level when neither `RUST_LOG` nor `LOG_LEVEL` is set.
pub const DEFAULT_LOG_LEVEL: &str = "info";

// =============================================================================
// State store (4.B)
// =============================================================================

/// Default location of the durable AppState file when `STATE_FILE_PATH` is
/// unset.
pub const DEFAULT_STATE_FILE_PATH: &str = "state.json";
