extern crate ffmpeg_next as ffmpeg;

use std::error;
use std::fmt;

use ffmpeg::Error as FfmpegError;

/// Error type for all media operations. Stage-specific failures wrap the
/// underlying ffmpeg error so the numeric code stays available through
/// [`Error::backend`].
#[derive(Debug, Clone)]
pub enum Error {
    /// Malformed option value or unsupported parameter combination.
    InvalidArgument(String),
    /// Operation invoked on a component in the wrong state.
    InvalidState(&'static str),
    /// Opening the source failed (file, URL, buffer or callback source).
    SourceUnavailable(FfmpegError),
    /// The input format could not be identified.
    FormatNotRecognized,
    /// Probing the input failed before a format could be determined.
    ProbeFailed(FfmpegError),
    /// No decoder or encoder matches the requested codec name or id.
    CodecNotFound,
    /// The codec context could not be opened with the chosen parameters.
    CodecOpenFailed(FfmpegError),
    DecodeFailed(FfmpegError),
    EncodeFailed(FfmpegError),
    FilterFailed(FfmpegError),
    /// The filter graph description failed to parse or configure.
    FilterConfigFailed(FfmpegError),
    BsfFailed(FfmpegError),
    SeekFailed(FfmpegError),
    WriteFailed(FfmpegError),
    ReadFailed(FfmpegError),
    /// Hardware device initialization failed.
    HardwareUnavailable(FfmpegError),
    /// A frame's hardware frames context does not match the one the consuming
    /// stage was configured with.
    HardwareIncompatible,
    /// The operation was terminated by a cancellation signal.
    Canceled,
    /// Uncategorized error from the ffmpeg backend.
    BackendError(FfmpegError),
}

impl Error {
    /// The underlying ffmpeg error, if this error originated in the backend.
    pub fn backend(&self) -> Option<FfmpegError> {
        match *self {
            Error::SourceUnavailable(err)
            | Error::ProbeFailed(err)
            | Error::CodecOpenFailed(err)
            | Error::DecodeFailed(err)
            | Error::EncodeFailed(err)
            | Error::FilterFailed(err)
            | Error::FilterConfigFailed(err)
            | Error::BsfFailed(err)
            | Error::SeekFailed(err)
            | Error::WriteFailed(err)
            | Error::ReadFailed(err)
            | Error::HardwareUnavailable(err)
            | Error::BackendError(err) => Some(err),
            _ => None,
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::SourceUnavailable(err)
            | Error::ProbeFailed(err)
            | Error::CodecOpenFailed(err)
            | Error::DecodeFailed(err)
            | Error::EncodeFailed(err)
            | Error::FilterFailed(err)
            | Error::FilterConfigFailed(err)
            | Error::BsfFailed(err)
            | Error::SeekFailed(err)
            | Error::WriteFailed(err)
            | Error::ReadFailed(err)
            | Error::HardwareUnavailable(err)
            | Error::BackendError(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::InvalidState(what) => write!(f, "invalid state: {what}"),
            Error::SourceUnavailable(err) => write!(f, "source unavailable: {err}"),
            Error::FormatNotRecognized => write!(f, "input format not recognized"),
            Error::ProbeFailed(err) => write!(f, "probing input failed: {err}"),
            Error::CodecNotFound => write!(f, "no matching codec found"),
            Error::CodecOpenFailed(err) => write!(f, "could not open codec: {err}"),
            Error::DecodeFailed(err) => write!(f, "decoding failed: {err}"),
            Error::EncodeFailed(err) => write!(f, "encoding failed: {err}"),
            Error::FilterFailed(err) => write!(f, "filtering failed: {err}"),
            Error::FilterConfigFailed(err) => {
                write!(f, "filter graph configuration failed: {err}")
            }
            Error::BsfFailed(err) => write!(f, "bitstream filtering failed: {err}"),
            Error::SeekFailed(err) => write!(f, "seek failed: {err}"),
            Error::WriteFailed(err) => write!(f, "write failed: {err}"),
            Error::ReadFailed(err) => write!(f, "read failed: {err}"),
            Error::HardwareUnavailable(err) => {
                write!(f, "hardware device unavailable: {err}")
            }
            Error::HardwareIncompatible => {
                write!(f, "frame hardware context does not match the stage")
            }
            Error::Canceled => write!(f, "operation canceled"),
            Error::BackendError(err) => err.fmt(f),
        }
    }
}

impl From<FfmpegError> for Error {
    fn from(internal: FfmpegError) -> Error {
        Error::BackendError(internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_code_is_preserved() {
        let err = Error::DecodeFailed(FfmpegError::InvalidData);
        assert_eq!(err.backend(), Some(FfmpegError::InvalidData));
        assert_eq!(Error::CodecNotFound.backend(), None);
    }

    #[test]
    fn display_mentions_stage() {
        let err = Error::FilterConfigFailed(FfmpegError::InvalidData);
        assert!(err.to_string().contains("filter graph"));
        let err = Error::InvalidState("write_packet before write_header");
        assert!(err.to_string().contains("write_header"));
    }
}
