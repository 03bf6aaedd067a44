//! # RackRPC
//!
//! The typed command protocol spoken between a region controller and its rack
//! controllers, layered over `wirepack`.
//!
//! ## Architecture
//!
//! - [`schema`]: `const` command declarations (arguments, response, declared errors).
//! - [`catalog`]: every command in the protocol, as marker types.
//! - [`value`] and [`codec`]: owned records and their schema-checked wire form.
//! - [`frame`]: the `Call` / `Answer` / `Error` envelope, correlated by `seq`.
//! - [`auth`]: the HMAC challenge/response used by the handshake.
//!
//! Nothing here performs I/O. Connections live in `regiond`.

pub mod auth;
pub mod catalog;
pub mod codec;
pub mod error;
pub mod frame;
pub mod schema;
pub mod value;

#[cfg(test)]
mod tests;

pub use error::{Error, ErrorKind, ProtocolFailure, Result};
pub use frame::{AnswerEncoder, CallEncoder, ErrorEncoder, Frame};
pub use schema::{Command, CommandSpec, Field, FieldType};
pub use value::{Record, Value};
