use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

/// Failures of a chain operation.
///
/// A deferred operation is not an error: it is reported as [core::task::Poll::Pending].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Bad parameter")]
    BadParameter,
    #[error("Unsupported feature")]
    UnsupportedFeature,
    #[error("Invalid command")]
    InvalidCommand,
    #[error("Busy")]
    Busy,
    #[error("Timeout")]
    Timeout,
    /// At least one device did not acknowledge a broadcast.
    #[error("ACK failed")]
    AckFailed,
    #[error("Pack update failed")]
    PackFailure,
    /// The SPI transport or direction select line failed.
    #[error("Transport driver error")]
    Driver,
    #[error("Unexpected command")]
    UnexpectedCommand,
}

/// Response status reported to the transaction layer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    InvalidCommand = 1,
    BadParameter = 2,
    Timeout = 3,
    UnsupportedFeature = 4,
    /// Fewer devices acknowledged than were addressed.
    TooFewResponses = 5,
    DriverError = 6,
    Deferred = 7,
    PackFailure = 8,
    Busy = 9,
    UnknownError = 0xff,
}

impl From<Error> for Status {
    fn from(value: Error) -> Self {
        match value {
            Error::BadParameter => Self::BadParameter,
            Error::UnsupportedFeature => Self::UnsupportedFeature,
            Error::InvalidCommand => Self::InvalidCommand,
            Error::Busy => Self::Busy,
            Error::Timeout => Self::Timeout,
            Error::AckFailed => Self::TooFewResponses,
            Error::PackFailure => Self::PackFailure,
            Error::Driver => Self::DriverError,
            Error::UnexpectedCommand => Self::UnknownError,
        }
    }
}

impl From<Result<(), Error>> for Status {
    fn from(value: Result<(), Error>) -> Self {
        match value {
            Ok(()) => Self::Success,
            Err(e) => e.into(),
        }
    }
}
