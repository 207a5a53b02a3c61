use core::fmt;

/// Errors returned by the mesh core.
///
/// Every fallible API in this crate returns `Result<T, Error>`. This is the idiomatic replacement
/// for the original stack's convention of returning a signed integer where negative values encode
/// one of these variants: the sign-encoding was forced by C, not a property of the protocol, so
/// here the taxonomy is just an enum and `Result` carries it end-to-end. `code_str()` is kept
/// around for the one caller that still wants the string form: the operator shell's
/// `execute command failed: <code-string>` message (spec §7).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Argument out of range or malformed.
    Inval,
    /// Unknown or invalid bearer handle.
    InvalBearer,
    /// Unknown AD type.
    InvalAdType,
    /// Operation forbidden in the current state.
    State,
    /// Resource momentarily unavailable, retry.
    Busy,
    /// Non-fatal failure, caller should retry.
    Again,
    /// Duplicate request or resource already present.
    Already,
    /// PDU too short or too long.
    Length,
    /// Static capacity exhausted.
    Resource,
    /// Bearer not bound to a network interface.
    NotConnected,
    /// Dropped by an input/output filter.
    Filter,
    /// Mismatch against a stored value (UUID, NID, ...).
    Diff,
    /// Terminate iteration.
    Stop,
    /// Allocation failed.
    Mem,
    /// Transition rejected because it was requested too soon.
    Timing,
    /// Deadline expired.
    Timeout,
    /// No key decrypted the message, or the referenced key does not exist.
    Key,
    /// Lookup miss.
    NotFound,

    /// Packet specified an invalid length value or was too short (wire codec).
    InvalidLength,
    /// Invalid value supplied for a wire field (wire codec).
    InvalidValue,
    /// Unexpectedly reached EOF while reading or writing data (wire codec).
    Eof,
    /// Parsing didn't consume the entire buffer (wire codec).
    IncompleteParse,
}

impl Error {
    /// The string used in the shell's `execute command failed: <code-string>` message.
    pub fn code_str(&self) -> &'static str {
        match self {
            Error::Inval => "EINVAL",
            Error::InvalBearer => "EINVAL_BEARER",
            Error::InvalAdType => "EINVAL_AD_TYPE",
            Error::State => "ESTATE",
            Error::Busy => "EBUSY",
            Error::Again => "EAGAIN",
            Error::Already => "EALREADY",
            Error::Length => "ELENGTH",
            Error::Resource => "ERESOURCE",
            Error::NotConnected => "ENOTCONN",
            Error::Filter => "EFILTER",
            Error::Diff => "EDIFF",
            Error::Stop => "ESTOP",
            Error::Mem => "ENOMEM",
            Error::Timing => "ETIMING",
            Error::Timeout => "ETIMEOUT",
            Error::Key => "EKEY",
            Error::NotFound => "ENOTFOUND",
            Error::InvalidLength => "EINVALID_LENGTH",
            Error::InvalidValue => "EINVALID_VALUE",
            Error::Eof => "EOF",
            Error::IncompleteParse => "EINCOMPLETE_PARSE",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::Inval => "argument out of range or malformed",
            Error::InvalBearer => "unknown or invalid bearer handle",
            Error::InvalAdType => "unknown AD type",
            Error::State => "operation forbidden in the current state",
            Error::Busy => "resource momentarily unavailable, retry",
            Error::Again => "non-fatal failure, retry",
            Error::Already => "duplicate request or resource already present",
            Error::Length => "PDU too short or too long",
            Error::Resource => "static capacity exhausted",
            Error::NotConnected => "bearer not bound",
            Error::Filter => "dropped by input/output filter",
            Error::Diff => "mismatch against stored value",
            Error::Stop => "terminate iteration",
            Error::Mem => "allocation failed",
            Error::Timing => "transition rejected: too soon",
            Error::Timeout => "deadline expired",
            Error::Key => "no key decrypted the message",
            Error::NotFound => "lookup miss",
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
        })
    }
}
