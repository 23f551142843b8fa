//! Error type for Google Drive operations.

use std::fmt;

use stormware_gcp::GcpError;

/// Error kind for Google Drive operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveErrorKind {
    /// Malformed path or conflicting arguments.
    InvalidArgument,
    /// File, folder or shared drive not found.
    NotFound,
    /// A name resolves to more than one file.
    NotUnique,
    /// Destination file already exists and overwriting is disabled.
    AlreadyExists,
    /// Local file system failure.
    Io,
    /// Error returned by the Drive API (HTTP status, 0 when local).
    Api(u16),
}

impl fmt::Display for DriveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "InvalidArgument"),
            Self::NotFound => write!(f, "NotFound"),
            Self::NotUnique => write!(f, "NotUnique"),
            Self::AlreadyExists => write!(f, "AlreadyExists"),
            Self::Io => write!(f, "Io"),
            Self::Api(code) => write!(f, "HTTP {}", code),
        }
    }
}

/// A Google Drive error.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveError {
    pub kind: DriveErrorKind,
    pub message: String,
}

impl fmt::Display for DriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DriveError {}

impl DriveError {
    pub fn new(kind: DriveErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(DriveErrorKind::InvalidArgument, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(DriveErrorKind::NotFound, msg)
    }

    pub fn not_unique(msg: impl Into<String>) -> Self {
        Self::new(DriveErrorKind::NotUnique, msg)
    }

    pub fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::new(DriveErrorKind::Io, format!("\"{}\": {}", path.display(), err))
    }
}

impl From<GcpError> for DriveError {
    fn from(e: GcpError) -> Self {
        Self::new(DriveErrorKind::Api(e.code), e.to_string())
    }
}

pub type DriveResult<T> = Result<T, DriveError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
