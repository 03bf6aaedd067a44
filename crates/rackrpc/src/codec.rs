//! # Argument Codec
//!
//! Encodes a [`Record`] against a field list, and decodes it back.
//!
//! ## Wire Shape
//!
//! A record is a wirepack map. Each supplied field becomes one variant keyed by
//! the field name. Absent optional fields are simply not written.
//!
//! ## Invariants
//! - **Value Cap**: every non-compressed value encodes to at most [`MAX_VALUE_LEN`] bytes.
//! - **Bounded Inflate**: a compressed list never inflates past [`MAX_DECOMPRESSED_LEN`].
//! - **Forward Compatibility**: unknown keys are skipped on decode, but refused on encode.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use url::Url;
use wirepack::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::schema::{Field, FieldType};
use crate::value::{Record, Value};

/// Largest encoded size of a single non-compressed value.
pub const MAX_VALUE_LEN: usize = 65_535;

/// Largest size a compressed list may inflate to.
pub const MAX_DECOMPRESSED_LEN: usize = 16 * 1024 * 1024;

/// Encodes `record` as a map, validating it against `fields`.
pub fn encode_record(enc: &mut Encoder, fields: &[Field], record: &Record) -> Result<()> {
    if let Some(stray) = record.keys().find(|key| !fields.iter().any(|f| f.name == *key)) {
        return Err(Error::UnknownField(stray.to_owned()));
    }

    enc.map_begin()?;
    for field in fields {
        let Some(value) = record.get(field.name) else {
            if field.optional {
                continue;
            }
            return Err(Error::MissingField(field.name.to_owned()));
        };

        enc.variant_begin(field.name)?;
        let start = enc.len();
        encode_value(enc, field.name, &field.ty, value)?;
        check_len(field, enc.len() - start)?;
        enc.variant_end()?;
    }
    enc.map_end()?;
    Ok(())
}

/// Decodes a map into a record, validating it against `fields`.
pub fn decode_record(dec: &mut Decoder, fields: &[Field]) -> Result<Record> {
    let mut map = dec.map()?;
    let mut record = Record::new();

    while let Some((key, mut val)) = map.next()? {
        let Some(field) = fields.iter().find(|f| f.name == key) else {
            continue;
        };
        check_len(field, val.remaining())?;
        if let Some(value) = decode_value(&mut val, field.name, &field.ty, field.optional)? {
            record.insert(field.name, value);
        }
        val.finish()?;
    }

    for field in fields {
        if !field.optional && !record.contains(field.name) {
            return Err(Error::MissingField(field.name.to_owned()));
        }
    }
    Ok(record)
}

/// Encodes a record into standalone bytes. Handy for tests and size probes.
pub fn record_to_bytes(fields: &[Field], record: &Record) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_record(&mut enc, fields, record)?;
    Ok(enc.into_bytes()?)
}

/// Decodes a record from standalone bytes, refusing trailing data.
pub fn record_from_bytes(bytes: &[u8], fields: &[Field]) -> Result<Record> {
    let mut dec = Decoder::new(bytes);
    let record = decode_record(&mut dec, fields)?;
    dec.finish()?;
    Ok(record)
}

fn check_len(field: &Field, len: usize) -> Result<()> {
    if matches!(field.ty, FieldType::CompressedList(_)) || len <= MAX_VALUE_LEN {
        return Ok(());
    }
    Err(Error::ValueTooLong { field: field.name.to_owned(), len })
}

fn mismatch(name: &str, ty: &FieldType) -> Error {
    Error::TypeMismatch { field: name.to_owned(), expected: ty.describe() }
}

fn encode_value(enc: &mut Encoder, name: &str, ty: &FieldType, value: &Value) -> Result<()> {
    match (ty, value) {
        (FieldType::Unicode, Value::Unicode(s)) => enc.str(s)?,
        (FieldType::Boolean, Value::Boolean(b)) => enc.bool(*b)?,
        (FieldType::Integer, Value::Integer(i)) => enc.s64(*i)?,
        (FieldType::Bytes, Value::Bytes(b)) => enc.bytes(b)?,
        (FieldType::List(fields), Value::List(records)) => encode_list(enc, fields, records)?,
        (FieldType::ListOf(inner), Value::Items(items)) => {
            enc.list_begin()?;
            for item in items {
                encode_value(enc, name, inner, item)?;
            }
            enc.list_end()?;
        }
        (FieldType::CompressedList(fields), Value::List(records)) => {
            let mut inner = Encoder::new();
            encode_list(&mut inner, fields, records)?;
            enc.bytes(&compress(&inner.into_bytes()?)?)?;
        }
        (FieldType::Url, Value::Url(url)) => enc.str(url.as_str())?,
        (FieldType::Json, Value::Json(json)) => {
            let text = serde_json::to_string(json)
                .map_err(|e| Error::Json { field: name.to_owned(), reason: e.to_string() })?;
            enc.str(&text)?;
        }
        _ => return Err(mismatch(name, ty)),
    }
    Ok(())
}

fn encode_list(enc: &mut Encoder, fields: &[Field], records: &[Record]) -> Result<()> {
    enc.list_begin()?;
    for record in records {
        encode_record(enc, fields, record)?;
    }
    enc.list_end()?;
    Ok(())
}

/// Returns `None` only for an optional URL sent as the empty string.
fn decode_value(dec: &mut Decoder, name: &str, ty: &FieldType, optional: bool) -> Result<Option<Value>> {
    let value = match ty {
        FieldType::Unicode => Value::Unicode(dec.str()?.to_owned()),
        FieldType::Boolean => Value::Boolean(dec.bool()?),
        FieldType::Integer => Value::Integer(dec.s64()?),
        FieldType::Bytes => Value::Bytes(dec.bytes()?.to_vec()),
        FieldType::List(fields) => Value::List(decode_list(dec, fields)?),
        FieldType::ListOf(inner) => {
            let mut items = dec.list()?;
            let mut out = Vec::new();
            while let Some(mut item) = items.next()? {
                // Scalars never decode to "absent".
                let value = decode_value(&mut item, name, inner, false)?
                    .ok_or_else(|| mismatch(name, inner))?;
                item.finish()?;
                out.push(value);
            }
            Value::Items(out)
        }
        FieldType::CompressedList(fields) => {
            let raw = decompress(dec.bytes()?)?;
            let mut inner = Decoder::new(&raw);
            let records = decode_list(&mut inner, fields)?;
            inner.finish()?;
            Value::List(records)
        }
        FieldType::Url => {
            let text = dec.str()?;
            if text.is_empty() && optional {
                return Ok(None);
            }
            let url = Url::parse(text)
                .map_err(|e| Error::Url { field: name.to_owned(), reason: e.to_string() })?;
            Value::Url(url)
        }
        FieldType::Json => {
            let text = dec.str()?;
            let json = serde_json::from_str(text)
                .map_err(|e| Error::Json { field: name.to_owned(), reason: e.to_string() })?;
            Value::Json(json)
        }
    };
    Ok(Some(value))
}

fn decode_list(dec: &mut Decoder, fields: &[Field]) -> Result<Vec<Record>> {
    let mut items = dec.list()?;
    let mut records = Vec::new();
    while let Some(mut item) = items.next()? {
        records.push(decode_record(&mut item, fields)?);
        item.finish()?;
    }
    Ok(records)
}

fn compress(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).map_err(|e| Error::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| Error::Compression(e.to_string()))
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    ZlibDecoder::new(compressed)
        .take(MAX_DECOMPRESSED_LEN as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| Error::Compression(e.to_string()))?;
    if raw.len() > MAX_DECOMPRESSED_LEN {
        return Err(Error::DecompressedTooLarge(MAX_DECOMPRESSED_LEN));
    }
    Ok(raw)
}
