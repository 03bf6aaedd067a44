//! # Protocol Frames
//!
//! Defines the RPC envelope: `Call`, `Answer` and `Error`.
//!
//! Each frame is a wirepack variant whose payload is a map of header fields.
//! The body of a call or answer is left as a `Decoder` so the receiver can pick
//! the right schema (from the command name or the pending request) before
//! decoding it.
//!
//! ## Invariants
//! - **Panic Safety**: all decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: unknown header fields are safely skipped.

use wirepack::{Decoder, Encoder};

use crate::codec::encode_record;
use crate::error::{Error, Result};
use crate::schema::CommandSpec;
use crate::value::Record;

/// Encodes an outbound Call frame.
pub struct CallEncoder<'a> {
    pub seq: u64,
    pub spec: &'static CommandSpec,
    pub args: &'a Record,
}

impl<'a> CallEncoder<'a> {
    pub fn new(seq: u64, spec: &'static CommandSpec, args: &'a Record) -> Self {
        Self { seq, spec, args }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin("Call")?;
        enc.map_begin()?;

        write_map_u64(enc, "seq", self.seq)?;
        write_map_str(enc, "command", self.spec.name)?;

        enc.variant_begin("args")?;
        encode_record(enc, self.spec.arguments, self.args)?;
        enc.variant_end()?;

        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }
}

/// Encodes an outbound Answer frame.
pub struct AnswerEncoder<'a> {
    pub seq: u64,
    pub spec: &'static CommandSpec,
    pub fields: &'a Record,
}

impl<'a> AnswerEncoder<'a> {
    pub fn new(seq: u64, spec: &'static CommandSpec, fields: &'a Record) -> Self {
        Self { seq, spec, fields }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin("Answer")?;
        enc.map_begin()?;

        write_map_u64(enc, "seq", self.seq)?;

        enc.variant_begin("fields")?;
        encode_record(enc, self.spec.response, self.fields)?;
        enc.variant_end()?;

        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }
}

/// Encodes an outbound Error frame.
pub struct ErrorEncoder<'a> {
    pub seq: u64,
    pub code: &'a str,
    pub description: &'a str,
}

impl<'a> ErrorEncoder<'a> {
    pub fn new(seq: u64, code: &'a str, description: &'a str) -> Self {
        Self { seq, code, description }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin("Error")?;
        enc.map_begin()?;

        write_map_u64(enc, "seq", self.seq)?;
        write_map_str(enc, "code", self.code)?;
        write_map_str(enc, "description", self.description)?;

        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }
}

/// A decoded Call header. `args` points at the argument map.
pub struct CallFrame<'a> {
    pub seq: u64,
    pub command: &'a str,
    pub args: Decoder<'a>,
}

/// A decoded Answer header. `fields` points at the response map.
pub struct AnswerFrame<'a> {
    pub seq: u64,
    pub fields: Decoder<'a>,
}

/// A decoded Error frame.
pub struct ErrorFrame<'a> {
    pub seq: u64,
    pub code: &'a str,
    pub description: &'a str,
}

/// Top-level frame decoder.
pub enum Frame<'a> {
    Call(CallFrame<'a>),
    Answer(AnswerFrame<'a>),
    Error(ErrorFrame<'a>),
}

impl<'a> Frame<'a> {
    /// Decodes one whole frame, refusing trailing bytes.
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let (kind, mut body) = dec.variant()?;
        dec.finish()?;

        let mut map = body.map()?;
        let mut seq = None;
        let mut command = None;
        let mut code = None;
        let mut description = None;
        let mut payload = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "seq" => seq = Some(val.u64()?),
                "command" => command = Some(val.str()?),
                "code" => code = Some(val.str()?),
                "description" => description = Some(val.str()?),
                "args" | "fields" => payload = Some(val),
                _ => val.skip()?,
            }
        }

        let seq = seq.ok_or(missing("seq"))?;
        match kind {
            "Call" => Ok(Frame::Call(CallFrame {
                seq,
                command: command.ok_or(missing("command"))?,
                args: payload.ok_or(missing("args"))?,
            })),
            "Answer" => Ok(Frame::Answer(AnswerFrame {
                seq,
                fields: payload.ok_or(missing("fields"))?,
            })),
            "Error" => Ok(Frame::Error(ErrorFrame {
                seq,
                code: code.ok_or(missing("code"))?,
                description: description.unwrap_or(""),
            })),
            other => Err(Error::ProtocolViolation(format!("unknown frame type: {}", other))),
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            Frame::Call(c) => c.seq,
            Frame::Answer(a) => a.seq,
            Frame::Error(e) => e.seq,
        }
    }
}

/// Decodes just the sequence number from a raw frame.
/// This is useful for routing replies when the full decoding might fail.
pub fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let mut dec = Decoder::new(bytes);
    let (_, mut body) = dec.variant()?;
    let mut map = body.map()?;

    while let Some((key, mut val)) = map.next()? {
        if key == "seq" {
            return Ok(val.u64()?);
        }
    }

    Err(missing("seq"))
}

fn missing(header: &str) -> Error {
    Error::ProtocolViolation(format!("missing {}", header))
}

fn write_map_u64(enc: &mut Encoder, key: &str, val: u64) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u64(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}
