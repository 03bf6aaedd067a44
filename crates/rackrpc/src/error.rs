//! # Error Definitions
//!
//! Three families live here:
//!
//! - [`Error`]: local codec and framing failures. These never cross the wire as-is.
//! - [`ProtocolFailure`]: failures of the RPC machinery, sent as well-known tags.
//! - [`ErrorKind`]: application failures a command may declare, sent as their tag.

use wirepack::Error as WireError;

/// Local failures while encoding or decoding frames and field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The primitive wire encoding failed.
    Wire(WireError),
    /// A required field was not supplied.
    MissingField(String),
    /// A record carried a key its schema does not declare.
    UnknownField(String),
    /// The value stored under a field does not fit its declared type.
    TypeMismatch { field: String, expected: &'static str },
    /// A non-compressed value encodes to more than the per-value cap.
    ValueTooLong { field: String, len: usize },
    /// A JSON structure failed to serialize or parse.
    Json { field: String, reason: String },
    /// A URL string failed to parse.
    Url { field: String, reason: String },
    /// zlib compression or decompression failed.
    Compression(String),
    /// A compressed list inflates past the decompression bound.
    DecompressedTooLarge(usize),
    /// The frame envelope is malformed (missing header, unknown frame type).
    ProtocolViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Wire(e) => write!(f, "wire encoding: {}", e),
            Error::MissingField(name) => write!(f, "missing required field `{}`", name),
            Error::UnknownField(name) => write!(f, "field `{}` is not declared", name),
            Error::TypeMismatch { field, expected } => {
                write!(f, "field `{}` expects {}", field, expected)
            }
            Error::ValueTooLong { field, len } => {
                write!(f, "field `{}` encodes to {} bytes, over the value cap", field, len)
            }
            Error::Json { field, reason } => write!(f, "field `{}`: bad json: {}", field, reason),
            Error::Url { field, reason } => write!(f, "field `{}`: bad url: {}", field, reason),
            Error::Compression(reason) => write!(f, "compression: {}", reason),
            Error::DecompressedTooLarge(limit) => {
                write!(f, "compressed list inflates past {} bytes", limit)
            }
            Error::ProtocolViolation(reason) => write!(f, "protocol violation: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

/// A specialized Result type for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the RPC machinery rather than of a handler.
///
/// These are distinct from `Error`; they describe the *remote* rejecting a call,
/// whereas `Error` describes *this side* failing to produce or read bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFailure {
    /// The command name is not in the catalog.
    UnknownCommand,
    /// The command is declared but nothing handles it here.
    NoImplementation,
    /// The caller has not yet proven the shared secret.
    Unauthenticated,
    /// The arguments did not decode against the command's schema.
    BadArguments,
    /// The response exceeded the per-value cap.
    TooLong,
    /// The handler failed with something it did not declare.
    Unhandled,
}

impl ProtocolFailure {
    pub fn tag(self) -> &'static str {
        match self {
            ProtocolFailure::UnknownCommand => "UNKNOWN_COMMAND",
            ProtocolFailure::NoImplementation => "NO_IMPLEMENTATION",
            ProtocolFailure::Unauthenticated => "UNAUTHENTICATED",
            ProtocolFailure::BadArguments => "BAD_ARGUMENTS",
            ProtocolFailure::TooLong => "TOO_LONG",
            ProtocolFailure::Unhandled => "UNHANDLED",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "UNKNOWN_COMMAND" => Some(ProtocolFailure::UnknownCommand),
            "NO_IMPLEMENTATION" => Some(ProtocolFailure::NoImplementation),
            "UNAUTHENTICATED" => Some(ProtocolFailure::Unauthenticated),
            "BAD_ARGUMENTS" => Some(ProtocolFailure::BadArguments),
            "TOO_LONG" => Some(ProtocolFailure::TooLong),
            "UNHANDLED" => Some(ProtocolFailure::Unhandled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Application failures a command can declare in its error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoSuchOperatingSystem,
    UnknownPowerType,
    NotImplemented,
    PowerActionFail,
    PowerActionAlreadyInProgress,
    CannotConfigureDhcp,
    CannotRemoveHostMap,
    NoIpFoundForMacAddress,
}

impl ErrorKind {
    /// The short ASCII tag sent on the wire.
    pub fn tag(self) -> &'static str {
        match self {
            ErrorKind::NoSuchOperatingSystem => "NoSuchOperatingSystem",
            ErrorKind::UnknownPowerType => "UnknownPowerType",
            ErrorKind::NotImplemented => "NotImplementedError",
            ErrorKind::PowerActionFail => "PowerActionFail",
            ErrorKind::PowerActionAlreadyInProgress => "PowerActionAlreadyInProgress",
            ErrorKind::CannotConfigureDhcp => "CannotConfigureDHCP",
            ErrorKind::CannotRemoveHostMap => "CannotRemoveHostMap",
            ErrorKind::NoIpFoundForMacAddress => "NoIPFoundForMACAddress",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "NoSuchOperatingSystem" => Some(ErrorKind::NoSuchOperatingSystem),
            "UnknownPowerType" => Some(ErrorKind::UnknownPowerType),
            "NotImplementedError" => Some(ErrorKind::NotImplemented),
            "PowerActionFail" => Some(ErrorKind::PowerActionFail),
            "PowerActionAlreadyInProgress" => Some(ErrorKind::PowerActionAlreadyInProgress),
            "CannotConfigureDHCP" => Some(ErrorKind::CannotConfigureDhcp),
            "CannotRemoveHostMap" => Some(ErrorKind::CannotRemoveHostMap),
            "NoIPFoundForMACAddress" => Some(ErrorKind::NoIpFoundForMacAddress),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}
