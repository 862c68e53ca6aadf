/* Shared error definitions: the closed status taxonomy returned by every
 * fallible operation in the library. */
use thiserror::Error;

/* Errors that may occur while talking to or decoding a dive computer. */
/*                                                                      */
/* Using explicit variants instead of opaque strings allows hosts to    */
/* take structured recovery actions (e.g., retrying on `Timeout` vs.    */
/* logging and abandoning on `Protocol`).                               */
#[derive(Debug, Error)]
pub enum Error {
    #[error("Capability not supported on this transport or family")]
    Unsupported,

    #[error("Invalid arguments: {0}")]
    InvalidArgs(&'static str),

    #[error("Out of memory")]
    NoMemory,

    #[error("Access to the device was denied")]
    NoAccess,

    #[error("Device absent or disconnected")]
    NoDevice,

    #[error("Operation cancelled by the host")]
    Cancelled,

    #[error("Deadline elapsed")]
    Timeout,

    #[error("Protocol violation: {0}")]
    Protocol(&'static str),

    #[error("Stored memory could not be decoded: {0}")]
    DataFormat(&'static str),

    #[error("I/O failure: {0}")]
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /* Whether a failed packet exchange may be re-attempted.            */
    /*                                                                  */
    /* Stream timeouts and framing/checksum mismatches are transient;   */
    /* OS-level failures and host cancellation never are.               */
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout | Error::Protocol(_))
    }
}

/* Classify an OS error into the taxonomy. `TimedOut`/`WouldBlock` fold  */
/* into `Timeout` so that retry policy treats OS-level and stream-level  */
/* deadlines identically.                                                */
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => Error::NoAccess,
            ErrorKind::NotFound | ErrorKind::NotConnected | ErrorKind::BrokenPipe => {
                Error::NoDevice
            }
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout,
            ErrorKind::OutOfMemory => Error::NoMemory,
            _ => Error::Io(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => Error::NoDevice,
            serialport::ErrorKind::InvalidInput => Error::InvalidArgs("serial parameter"),
            _ => Error::from(std::io::Error::from(err)),
        }
    }
}
