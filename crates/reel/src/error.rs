use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("failed to fetch manifest `{url}`: {source}")]
    ManifestFetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("manifest `{url}` is not valid UTF-8 text")]
    ManifestDecode { url: String },

    #[error("no media segments found in manifest `{url}`")]
    EmptyManifest { url: String },

    #[error("segment {index} failed: {source}")]
    SegmentFetch {
        index: usize,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("reassembly failed during {stage}: {source}")]
    Reassembly {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("frame {index} could not be decoded: {source}")]
    FrameDecode {
        index: usize,
        #[source]
        source: image::ImageError,
    },

    #[error("encoder sink failed: {reason}")]
    Sink { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn manifest_fetch(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::ManifestFetch {
            url: url.into(),
            source,
        }
    }

    pub fn segment_fetch(index: usize, source: DownloadError) -> Self {
        Self::SegmentFetch {
            index,
            source: Box::new(source),
        }
    }

    pub fn reassembly(stage: &'static str, source: std::io::Error) -> Self {
        Self::Reassembly { stage, source }
    }

    pub fn sink(reason: impl Into<String>) -> Self {
        Self::Sink {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>, operation: &'static str) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// User-presentable classification of a fatal error. `None` for
    /// cancellation, which is a distinct terminal outcome rather than a
    /// failure.
    pub fn classify(&self) -> Option<FailureClass> {
        let class = match self {
            Self::Cancelled => return None,
            Self::ManifestFetch { source, .. } => {
                FailureClass::ManifestUnavailable(classify_network(source))
            }
            Self::ManifestDecode { .. } | Self::EmptyManifest { .. } => {
                FailureClass::ManifestInvalid
            }
            Self::SegmentFetch { index, source } => FailureClass::SegmentFailed {
                index: *index,
                kind: match source.as_ref() {
                    Self::Network { source } => classify_network(source),
                    _ => NetworkFailureKind::Generic,
                },
            },
            Self::Reassembly { .. } | Self::FrameDecode { .. } | Self::Sink { .. } => {
                FailureClass::ReassemblyFailed
            }
            Self::Network { source } => {
                FailureClass::ManifestUnavailable(classify_network(source))
            }
            Self::HttpStatus { .. } => {
                FailureClass::ManifestUnavailable(NetworkFailureKind::Generic)
            }
            Self::Io { .. } => FailureClass::StorageFailed,
            Self::InvalidUrl { .. } | Self::Configuration { .. } => FailureClass::Internal,
        };
        Some(class)
    }
}

/// Transport-level cause of a network failure, for user display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailureKind {
    Offline,
    TimedOut,
    HostUnreachable,
    ConnectionLost,
    Generic,
}

impl std::fmt::Display for NetworkFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Offline => "no internet connection",
            Self::TimedOut => "the request timed out",
            Self::HostUnreachable => "the server could not be reached",
            Self::ConnectionLost => "the connection was lost",
            Self::Generic => "a network error occurred",
        };
        f.write_str(text)
    }
}

/// User-presentable failure classification carried by a handle's terminal
/// state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    ManifestUnavailable(NetworkFailureKind),
    ManifestInvalid,
    SegmentFailed { index: usize, kind: NetworkFailureKind },
    ReassemblyFailed,
    StorageFailed,
    Internal,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ManifestUnavailable(kind) => {
                write!(f, "could not load the stream manifest: {kind}")
            }
            Self::ManifestInvalid => f.write_str("the stream manifest could not be read"),
            Self::SegmentFailed { index, kind } => {
                write!(f, "segment {index} failed to download: {kind}")
            }
            Self::ReassemblyFailed => {
                f.write_str("the downloaded segments could not be assembled into a playable file")
            }
            Self::StorageFailed => f.write_str("the output file could not be written"),
            Self::Internal => f.write_str("an internal error occurred"),
        }
    }
}

/// Maps a transport error onto the user-facing failure kinds by walking the
/// error source chain for the underlying `std::io::Error`, falling back to
/// reqwest's own coarse flags when no I/O error is exposed.
pub fn classify_network(err: &reqwest::Error) -> NetworkFailureKind {
    if err.is_timeout() {
        return NetworkFailureKind::TimedOut;
    }

    if let Some(kind) = io_error_kind(err) {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::TimedOut => return NetworkFailureKind::TimedOut,
            ErrorKind::NetworkDown | ErrorKind::NetworkUnreachable => {
                return NetworkFailureKind::Offline;
            }
            ErrorKind::HostUnreachable | ErrorKind::ConnectionRefused => {
                return NetworkFailureKind::HostUnreachable;
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => return NetworkFailureKind::ConnectionLost,
            _ => {}
        }
    }

    if err.is_connect() {
        NetworkFailureKind::HostUnreachable
    } else if err.is_body() || err.is_request() {
        NetworkFailureKind::ConnectionLost
    } else {
        NetworkFailureKind::Generic
    }
}

fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = cause.source();
    }
    None
}
