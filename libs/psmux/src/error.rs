use thiserror::Error;

/// Fatal or caller-visible failures of a multiplexing session.
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("failed to allocate {bytes} bytes for {what}")]
    Allocation { what: &'static str, bytes: usize },
    #[error("unknown stream handle {0}")]
    UnknownStream(usize),
    #[error("stream limit reached: {0}")]
    StreamLimit(&'static str),
    #[error("streams cannot be registered once output has started")]
    RegistrationClosed,
    #[error("muxer already finalized")]
    AlreadyFinalized,
    #[error("invalid timestamp hint {value} for stream {stream}")]
    InvalidTimestampHint { stream: usize, value: f64 },
}

/// Local failures while scanning an elementary stream. Never fatal: the
/// offending bytes are skipped and scanning resumes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no sync word found in {0} bytes")]
    NoSync(usize),
    #[error("header truncated")]
    Truncated,
    #[error("sample rate mismatch: stream configured for {expected} Hz, frame is {found} Hz")]
    SampleRateMismatch { expected: u32, found: u32 },
    #[error("mpeg audio layer mismatch: expected layer {expected}, found layer {found}")]
    LayerMismatch { expected: u8, found: u8 },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

/// Problems found while resolving a [`crate::config::MuxerConfig`].
///
/// These are warnings: resolution disables or replaces the offending option
/// and the session carries on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown format {0:?}, falling back to mpeg2")]
    UnknownFormat(String),
    #[error("unknown option {0:?}")]
    UnknownOption(String),
    #[error("invalid value {value:?} for option {key}")]
    InvalidValue { key: String, value: String },
    #[error("{key}={value} out of range, clamped to {clamped}")]
    OutOfRange { key: &'static str, value: i64, clamped: i64 },
    #[error("{enabled} and {disabled} are mutually exclusive, {disabled} disabled")]
    Exclusive {
        enabled: &'static str,
        disabled: &'static str,
    },
    #[error("{0} is not supported by the {1} profile, ignored")]
    Unsupported(&'static str, &'static str),
}
