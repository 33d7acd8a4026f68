use std::fmt;

/// Coarse classification of a [`CodecError`], used by callers that only
/// care about the failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resource,
    Configuration,
    Io,
    RuntimeDecode,
    InvalidArgument,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Resource => "resource",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Io => "io",
            ErrorKind::RuntimeDecode => "runtime decode",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The source has no track of the requested media type.
    #[error("no {0} resource")]
    Resource(String),
    /// Session creation or configuration failed.
    #[error("configure error: {0}")]
    Configuration(String),
    /// Demuxer or muxer failure.
    #[error("io error: {0}")]
    Io(String),
    /// Unexpected failure inside a pump iteration.
    #[error("runtime error: {0}")]
    RuntimeDecode(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("cancelled")]
    Cancelled,
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::Resource(_) => ErrorKind::Resource,
            CodecError::Configuration(_) => ErrorKind::Configuration,
            CodecError::Io(_) => ErrorKind::Io,
            CodecError::RuntimeDecode(_) => ErrorKind::RuntimeDecode,
            CodecError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CodecError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn io(err: impl fmt::Display) -> Self {
        CodecError::Io(err.to_string())
    }

    pub fn config(err: impl fmt::Display) -> Self {
        CodecError::Configuration(err.to_string())
    }

    pub fn runtime(err: impl fmt::Display) -> Self {
        CodecError::RuntimeDecode(err.to_string())
    }
}

/// ffmpeg failures surface inside codec calls unless a call site maps them
/// explicitly (container calls use [`CodecError::io`]).
impl From<ffmpeg_next::Error> for CodecError {
    fn from(err: ffmpeg_next::Error) -> Self {
        CodecError::RuntimeDecode(err.to_string())
    }
}

pub type Result<T, E = CodecError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_message() {
        let err = CodecError::Resource("video".to_string());
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(err.to_string(), "no video resource");

        let err = CodecError::io("disk full");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("disk full"));
    }
}
