//! # Command Schema
//!
//! Commands are `const` data. A [`CommandSpec`] names the operation, lists its
//! arguments and response fields in wire order, and declares which
//! [`ErrorKind`]s a handler may raise. Marker types implementing [`Command`]
//! tie a Rust type to one spec so handler tables can be keyed by type.

use crate::error::{ErrorKind, ProtocolFailure};

/// The closed set of wire types a field can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Unicode,
    Boolean,
    /// Signed 64-bit integer.
    Integer,
    /// Raw byte string.
    Bytes,
    /// A list of nested records sharing one field layout.
    List(&'static [Field]),
    /// A list of scalars of one type.
    ListOf(&'static FieldType),
    /// Same shape as `List`, shipped zlib-compressed as a single blob.
    CompressedList(&'static [Field]),
    /// A URL carried in its string form.
    Url,
    /// An arbitrary JSON structure carried as a string.
    Json,
}

impl FieldType {
    pub fn describe(&self) -> &'static str {
        match self {
            FieldType::Unicode => "unicode",
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Bytes => "bytes",
            FieldType::List(_) => "list of records",
            FieldType::ListOf(_) => "list of scalars",
            FieldType::CompressedList(_) => "compressed list of records",
            FieldType::Url => "url",
            FieldType::Json => "json",
        }
    }
}

/// One named, typed slot in an argument or response list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    /// An optional field may be absent from the record entirely.
    pub optional: bool,
}

impl Field {
    pub const fn required(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty, optional: false }
    }

    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty, optional: true }
    }
}

/// The full declaration of one protocol operation.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub arguments: &'static [Field],
    pub response: &'static [Field],
    pub errors: &'static [ErrorKind],
}

impl CommandSpec {
    pub fn declares(&self, kind: ErrorKind) -> bool {
        self.errors.contains(&kind)
    }

    /// Translates an error code received for this command.
    ///
    /// A declared application tag comes back as its kind. Protocol tags come back
    /// as themselves, and anything else collapses to `Unhandled`.
    pub fn classify_error(&self, code: &str) -> std::result::Result<ErrorKind, ProtocolFailure> {
        match ErrorKind::from_tag(code) {
            Some(kind) if self.declares(kind) => Ok(kind),
            _ => Err(ProtocolFailure::from_tag(code).unwrap_or(ProtocolFailure::Unhandled)),
        }
    }
}

/// A marker type bound to exactly one command spec.
pub trait Command: Send + Sync + 'static {
    const SPEC: &'static CommandSpec;
}
