use std::io;

use rustix::io::Errno;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to allocate a buffer descriptor")]
    AllocationFailure,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("device is busy")]
    DeviceBusy,
    #[error("device is unavailable")]
    DeviceUnavailable,
    #[error("logical block size of the exported device exceeds the backing device")]
    UnalignedConfiguration,
    #[error("registration refused: {0}")]
    Registration(#[source] Errno),
    #[error("failed to start the background queue")]
    Worker(#[source] io::Error),
}

impl Error {
    /// The errno reported to callers for this error.
    #[must_use]
    pub fn to_errno(&self) -> Errno {
        match self {
            Self::AllocationFailure => Errno::NOMEM,
            Self::InvalidArgument | Self::UnalignedConfiguration => Errno::INVAL,
            Self::DeviceBusy => Errno::BUSY,
            Self::DeviceUnavailable => Errno::NODEV,
            Self::Registration(errno) => *errno,
            Self::Worker(err) => err
                .raw_os_error()
                .map_or(Errno::NOMEM, Errno::from_raw_os_error),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::other(err)
    }
}
