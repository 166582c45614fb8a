use core::fmt::{self, Display};

/// Error kinds returned by every public operation in this crate.
///
/// Every public operation returns exactly one of these kinds; none of
/// them implies a hidden sleep or an unbounded retry inside a single
/// call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied argument failed validation (bad size, bad
    /// alignment, bad opcode, self-dependency, ...).
    InvalidArgument,
    /// A DMA-coherent allocation could not be satisfied.
    OutOfMemory,
    /// The operation could not make progress right now but may
    /// succeed if retried (ring full, device mid-reset).
    Busy,
    /// A blocking operation's budget elapsed before it could complete.
    Timeout,
    /// The device reported an error or halted status.
    HardwareError,
    /// The calling context lacks the privilege the operation requires.
    PermissionDenied,
    /// A waiter was unblocked by cancellation rather than completion.
    Cancelled,
    /// The referenced object (job, queue, fence address) does not exist.
    NotFound,
    /// The requested transition is already underway (e.g. a second
    /// concurrent reset request).
    AlreadyInProgress,
}

impl core::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::OutOfMemory => "out of memory",
            Error::Busy => "device or resource busy",
            Error::Timeout => "operation timed out",
            Error::HardwareError => "hardware reported an error",
            Error::PermissionDenied => "permission denied",
            Error::Cancelled => "operation cancelled",
            Error::NotFound => "object not found",
            Error::AlreadyInProgress => "operation already in progress",
        };
        write!(f, "{msg}")
    }
}

/// Result type for every public operation in this crate.
pub type Result<T> = core::result::Result<T, Error>;
