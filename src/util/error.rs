// log-enricher - util/error.rs
//
// Typed error hierarchy with context-preserving error chains.
// No string-based error propagation: every error preserves its causal
// chain for diagnostic logging via `std::error::Error::source()`.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Top-level error type for all log-enricher operations.
/// Errors are categorised by the subsystem that produced them, matching
/// the taxonomy in the error-handling design.
#[derive(Debug)]
pub enum EnricherError {
    /// Configuration loading or validation failed. Always fatal at startup.
    Config(ConfigError),

    /// The durable state store could not be loaded or saved.
    State(StateError),

    /// A file tailer hit a non-recoverable condition.
    Tailer(TailerError),

    /// Parsing (JSON or structured/regex) failed in a way the caller needs
    /// to see rather than silently swallow.
    Parse(ParseError),

    /// An enrichment stage (hostname, GeoIP, template) failed.
    Enrichment(EnrichmentError),

    /// A sink failed to accept or flush an entry.
    Sink(SinkError),

    /// The push-protocol HTTP receiver rejected or failed a request.
    Receiver(ReceiverError),

    /// I/O error with path context, for errors that don't fit a more
    /// specific subsystem variant.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: io::Error,
    },
}

impl fmt::Display for EnricherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::State(e) => write!(f, "state store error: {e}"),
            Self::Tailer(e) => write!(f, "tailer error: {e}"),
            Self::Parse(e) => write!(f, "parse error: {e}"),
            Self::Enrichment(e) => write!(f, "enrichment error: {e}"),
            Self::Sink(e) => write!(f, "sink error: {e}"),
            Self::Receiver(e) => write!(f, "receiver error: {e}"),
            Self::Io {
                path,
                operation,
                source,
            } => write!(
                f,
                "I/O error during {operation} on '{}': {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for EnricherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::State(e) => Some(e),
            Self::Tailer(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Enrichment(e) => Some(e),
            Self::Sink(e) => Some(e),
            Self::Receiver(e) => Some(e),
            Self::Io { source, .. } => Some(source),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors related to environment-variable configuration loading. All
/// variants are fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    /// `BACKEND` named something other than `file` or `loki`.
    UnknownBackend { value: String },

    /// `BACKEND=loki` but `LOKI_URL` was not set.
    MissingLokiUrl,

    /// A `STAGE_<N>_TYPE` value did not match a known stage type.
    UnknownStageType { index: usize, value: String },

    /// A configured regex (ignore list, app-identification, stage param,
    /// filter rule) failed to compile.
    InvalidRegex {
        field: &'static str,
        pattern: String,
        source: regex::Error,
    },

    /// A regex required to carry a specific named capture group did not.
    MissingCaptureGroup {
        field: &'static str,
        group: &'static str,
    },

    /// A `STAGE_<N>_APPLIES_TO` value was present but empty or otherwise
    /// invalid beyond plain regex compilation.
    InvalidAppliesTo { index: usize, reason: String },

    /// An integer/bool-shaped environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    /// The HTTP receiver failed to bind its configured address.
    HttpBindFailed { addr: String, source: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownBackend { value } => {
                write!(f, "unknown BACKEND '{value}', expected 'file' or 'loki'")
            }
            Self::MissingLokiUrl => {
                write!(f, "BACKEND=loki requires LOKI_URL to be set")
            }
            Self::UnknownStageType { index, value } => {
                write!(f, "STAGE_{index}_TYPE '{value}' is not a known stage type")
            }
            Self::InvalidRegex {
                field,
                pattern,
                source,
            } => write!(f, "invalid regex for '{field}' ('{pattern}'): {source}"),
            Self::MissingCaptureGroup { field, group } => write!(
                f,
                "regex for '{field}' must contain a named capture group '{group}'"
            ),
            Self::InvalidAppliesTo { index, reason } => {
                write!(f, "STAGE_{index}_APPLIES_TO is invalid: {reason}")
            }
            Self::InvalidValue {
                key,
                value,
                expected,
            } => write!(f, "{key}='{value}' is invalid, expected {expected}"),
            Self::HttpBindFailed { addr, source } => {
                write!(f, "failed to bind HTTP receiver at '{addr}': {source}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidRegex { source, .. } => Some(source),
            Self::HttpBindFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for EnricherError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// State store errors
// ---------------------------------------------------------------------------

/// Errors related to loading or saving the durable `AppState`. Unmarshal
/// failure on an existing state file is fatal.
#[derive(Debug)]
pub enum StateError {
    /// The state file exists but could not be parsed as JSON.
    Corrupt { path: PathBuf, source: serde_json::Error },

    /// I/O error reading or writing the state file.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { path, source } => {
                write!(f, "state file '{}' is corrupt: {source}", path.display())
            }
            Self::Io { path, source } => {
                write!(f, "state file I/O error '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Corrupt { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
        }
    }
}

impl From<StateError> for EnricherError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

// ---------------------------------------------------------------------------
// Tailer errors
// ---------------------------------------------------------------------------

/// Errors surfaced on a tailer's `errors` channel.
#[derive(Debug)]
pub enum TailerError {
    /// A read failed in a way that is not EOF and not recoverable.
    Io { path: PathBuf, source: io::Error },

    /// Rotation was detected but the file could not be reopened within
    /// `MAX_REOPEN_ATTEMPTS`.
    ReopenExhausted { path: PathBuf, attempts: u32 },
}

impl fmt::Display for TailerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "tailer I/O error on '{}': {source}", path.display())
            }
            Self::ReopenExhausted { path, attempts } => write!(
                f,
                "failed to reopen '{}' after rotation ({attempts} attempts)",
                path.display()
            ),
        }
    }
}

impl std::error::Error for TailerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::ReopenExhausted { .. } => None,
        }
    }
}

impl From<TailerError> for EnricherError {
    fn from(e: TailerError) -> Self {
        Self::Tailer(e)
    }
}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

/// Non-fatal parse errors: callers clear partial results and cache the
/// negative outcome where applicable, they never drop the line.
#[derive(Debug)]
pub enum ParseError {
    /// A structured-parser pattern was rejected at construction because its
    /// capture-group shape didn't match the contract (named groups, or
    /// exactly two unnamed groups).
    InvalidPatternShape { pattern: String, reason: String },

    /// A configured regex failed to compile.
    InvalidRegex { pattern: String, source: regex::Error },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPatternShape { pattern, reason } => {
                write!(f, "pattern '{pattern}' rejected: {reason}")
            }
            Self::InvalidRegex { pattern, source } => {
                write!(f, "invalid pattern '{pattern}': {source}")
            }
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidRegex { source, .. } => Some(source),
            Self::InvalidPatternShape { .. } => None,
        }
    }
}

impl From<ParseError> for EnricherError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

// ---------------------------------------------------------------------------
// Enrichment errors
// ---------------------------------------------------------------------------

/// Enrichment errors are always logged and never drop the entry: the
/// entry passes through without that particular enrichment.
#[derive(Debug)]
pub enum EnrichmentError {
    /// A DNS-family lookup (rDNS/mDNS/LLMNR/NetBIOS) failed or timed out.
    HostnameLookupFailed { ip: String, reason: String },

    /// The GeoIP database could not be queried (handle missing or lookup
    /// error from the underlying reader).
    GeoIpLookupFailed { ip: String, reason: String },

    /// The GeoIP database failed to (re)open.
    GeoIpOpenFailed { path: PathBuf, source: io::Error },

    /// A template failed to render (missing variable, bad placeholder).
    TemplateRenderFailed { template: String, reason: String },
}

impl fmt::Display for EnrichmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostnameLookupFailed { ip, reason } => {
                write!(f, "hostname lookup for {ip} failed: {reason}")
            }
            Self::GeoIpLookupFailed { ip, reason } => {
                write!(f, "GeoIP lookup for {ip} failed: {reason}")
            }
            Self::GeoIpOpenFailed { path, source } => {
                write!(f, "failed to open GeoIP database '{}': {source}", path.display())
            }
            Self::TemplateRenderFailed { template, reason } => {
                write!(f, "template '{template}' failed to render: {reason}")
            }
        }
    }
}

impl std::error::Error for EnrichmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::GeoIpOpenFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<EnrichmentError> for EnricherError {
    fn from(e: EnrichmentError) -> Self {
        Self::Enrichment(e)
    }
}

// ---------------------------------------------------------------------------
// Sink errors
// ---------------------------------------------------------------------------

/// Sink errors are logged at the processor; on the push-receiver path a
/// sink error fails the whole HTTP request with 500.
#[derive(Debug)]
pub enum SinkError {
    /// I/O error writing to a file sink.
    Io { path: PathBuf, source: io::Error },

    /// The remote (Loki) sink's HTTP request failed or returned non-2xx.
    RemoteRequestFailed { status: Option<u16>, reason: String },

    /// Serialising an entry's `fields` map to JSON failed.
    Serialize { source: serde_json::Error },
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "sink I/O error on '{}': {source}", path.display())
            }
            Self::RemoteRequestFailed { status, reason } => match status {
                Some(code) => write!(f, "remote sink request failed ({code}): {reason}"),
                None => write!(f, "remote sink request failed: {reason}"),
            },
            Self::Serialize { source } => write!(f, "failed to serialise entry fields: {source}"),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialize { source } => Some(source),
            Self::RemoteRequestFailed { .. } => None,
        }
    }
}

impl From<SinkError> for EnricherError {
    fn from(e: SinkError) -> Self {
        Self::Sink(e)
    }
}

// ---------------------------------------------------------------------------
// Receiver errors
// ---------------------------------------------------------------------------

/// Errors raised while handling a push-protocol HTTP request. Each variant
/// maps to an HTTP status code in the receiver handler.
#[derive(Debug)]
pub enum ReceiverError {
    /// Unsupported or missing `Content-Type` → 415.
    UnsupportedMediaType { content_type: String },

    /// Unsupported `Content-Encoding` → 415.
    UnsupportedEncoding { encoding: String },

    /// Body exceeded the configured cap → 413.
    BodyTooLarge { limit: usize },

    /// Snappy decompression of the binary body failed.
    SnappyDecodeFailed { reason: String },

    /// Protobuf decoding of the decompressed body failed.
    ProtobufDecodeFailed { reason: String },

    /// JSON decoding of the body failed.
    JsonDecodeFailed { source: serde_json::Error },

    /// A timestamp in the batch could not be parsed, or a line was missing
    /// → 400 for the whole request (no partial ingest).
    InvalidEntry { reason: String },

    /// Bearer-token check failed → 401.
    Unauthorized,

    /// A downstream sink failed while processing an entry from this batch
    /// → 500 for the whole request.
    SinkFailed { source: SinkError },
}

impl fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedMediaType { content_type } => {
                write!(f, "unsupported content-type '{content_type}'")
            }
            Self::UnsupportedEncoding { encoding } => {
                write!(f, "unsupported content-encoding '{encoding}'")
            }
            Self::BodyTooLarge { limit } => write!(f, "request body exceeds {limit} byte cap"),
            Self::SnappyDecodeFailed { reason } => write!(f, "snappy decode failed: {reason}"),
            Self::ProtobufDecodeFailed { reason } => write!(f, "protobuf decode failed: {reason}"),
            Self::JsonDecodeFailed { source } => write!(f, "JSON decode failed: {source}"),
            Self::InvalidEntry { reason } => write!(f, "invalid entry: {reason}"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::SinkFailed { source } => write!(f, "sink failed while processing batch: {source}"),
        }
    }
}

impl std::error::Error for ReceiverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::JsonDecodeFailed { source } => Some(source),
            Self::SinkFailed { source } => Some(source),
            _ => None,
        }
    }
}

impl From<ReceiverError> for EnricherError {
    fn from(e: ReceiverError) -> Self {
        Self::Receiver(e)
    }
}

/// Convenience type alias for log-enricher results.
pub type Result<T> = std::result::Result<T, EnricherError>;
