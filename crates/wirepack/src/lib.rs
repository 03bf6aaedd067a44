//! # Wirepack
//!
//! The primitive wire encoding underneath every RPC frame.
//!
//! ## Philosophy
//!
//! - **Closed vocabulary**: only the shapes the protocol needs. Booleans, two integer
//!   widths, unicode and byte blobs, lists, keyed maps and named variants.
//! - **TLV Architecture**: `[Tag][Length?][Value]` so a reader can skip what it does
//!   not understand.
//! - **Bounded**: the encoder tracks its open scopes and back-patches lengths; the
//!   decoder is a zero-copy, bounds-checked view that never panics on hostile input.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: 0 or 8b]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//!
//! Integers are Little-Endian. Container lengths cover the body only.

#[cfg(test)]
mod tests;

/// Wirepack encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`.
    InvalidTag(u8),
    /// The next item has a different tag than the one requested.
    UnexpectedTag { expected: Tag, found: Tag },
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Closing a scope that does not match the innermost open scope.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the Root remains.
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    ScopeStillOpen,
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Bytes remained after the last expected item.
    TrailingBytes(usize),
    /// Blob or container length exceeds `u32::MAX`.
    BlobTooLarge(usize),
    /// A variant received more than its single payload item.
    TooManyItems,
    /// A variant was closed without a payload.
    EmptyVariant,
    /// Something other than a variant was written directly into a map.
    InvalidMapEntry,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::UnexpectedTag { expected, found } => {
                write!(f, "expected {:?}, found {:?}", expected, found)
            }
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after last item", n),
            Error::BlobTooLarge(n) => write!(f, "blob of {} bytes exceeds the u32 length field", n),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for wirepack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the type of an encoded item.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    BoolTrue = 0x01,
    BoolFalse = 0x02,
    U64 = 0x03,
    S64 = 0x04,
    Unit = 0x05,

    // Blobs (Tag + u32 Len + Bytes)
    String = 0x10,
    Bytes = 0x11,

    // Containers (Tag + u32 Len + Body)
    List = 0x20,
    Map = 0x21,
    Variant = 0x22,
}

impl Tag {
    /// Returns the Tag for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Tag::BoolTrue),
            0x02 => Some(Tag::BoolFalse),
            0x03 => Some(Tag::U64),
            0x04 => Some(Tag::S64),
            0x05 => Some(Tag::Unit),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Map),
            0x22 => Some(Tag::Variant),
            _ => None,
        }
    }

    /// Whether the tag is followed by a `u32` length header.
    fn is_sized(self) -> bool {
        matches!(self, Tag::String | Tag::Bytes | Tag::List | Tag::Map | Tag::Variant)
    }
}

/// Kinds of open scopes on the `Encoder` stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The virtual root; allows any number of items.
    Root,
    /// Ordered sequence; allows any number of items.
    List,
    /// Keyed container; only variants may be written into it.
    Map,
    /// Named payload; exactly one item after the name.
    Variant,
}

struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A state-machine driven encoder.
///
/// Every write is validated against the innermost open scope:
///
/// 1. **Map**: only `variant_begin` may be written.
/// 2. **Variant**: exactly one payload item.
/// 3. **Root**: the encoder must be back at the root to produce bytes.
pub struct Encoder {
    buf: Vec<u8>,
    /// Bottom is always `Scope::Root`.
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            stack: vec![Frame { start: 0, scope: Scope::Root, count: 0 }],
        }
    }

    /// Number of bytes written so far, including unfinished scopes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the encoder and returns the final bytes.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if a container was left open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn top(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.top();
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Map if tag == Tag::Variant => Ok(()),
            Scope::Map => Err(Error::InvalidMapEntry),
            Scope::Variant if frame.count >= 1 => Err(Error::TooManyItems),
            Scope::Variant => Ok(()),
        }
    }

    fn written(&mut self) {
        self.top().count += 1;
    }

    fn scalar(&mut self, tag: Tag, body: &[u8]) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(body);
        self.written();
        Ok(())
    }

    fn blob(&mut self, tag: Tag, body: &[u8]) -> Result<()> {
        let len = u32::try_from(body.len()).map_err(|_| Error::BlobTooLarge(body.len()))?;
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(body);
        self.written();
        Ok(())
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]); // patched by end_scope
        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }

        let frame = self.top();
        if frame.scope != expected {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if frame.scope == Scope::Variant && frame.count == 0 {
            return Err(Error::EmptyVariant);
        }

        let start = frame.start;
        let body_len = self.buf.len() - start;
        let len = u32::try_from(body_len).map_err(|_| Error::BlobTooLarge(body_len))?;
        self.buf[start - 4..start].copy_from_slice(&len.to_le_bytes());
        self.stack.pop();
        self.written();
        Ok(())
    }

    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.scalar(if v { Tag::BoolTrue } else { Tag::BoolFalse }, &[])
    }

    pub fn u64(&mut self, v: u64) -> Result<()> {
        self.scalar(Tag::U64, &v.to_le_bytes())
    }

    pub fn s64(&mut self, v: i64) -> Result<()> {
        self.scalar(Tag::S64, &v.to_le_bytes())
    }

    pub fn unit(&mut self) -> Result<()> {
        self.scalar(Tag::Unit, &[])
    }

    /// Encodes a UTF-8 string blob.
    pub fn str(&mut self, v: &str) -> Result<()> {
        self.blob(Tag::String, v.as_bytes())
    }

    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.blob(Tag::Bytes, v)
    }

    pub fn list_begin(&mut self) -> Result<()> {
        self.begin_scope(Tag::List, Scope::List)
    }

    pub fn list_end(&mut self) -> Result<()> {
        self.end_scope(Scope::List)
    }

    /// Begins a map. Only `variant_begin` is allowed as a direct child.
    pub fn map_begin(&mut self) -> Result<()> {
        self.begin_scope(Tag::Map, Scope::Map)
    }

    pub fn map_end(&mut self) -> Result<()> {
        self.end_scope(Scope::Map)
    }

    /// Begins a named payload. Exactly one item must follow before `variant_end`.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.begin_scope(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        // The name is metadata, not the payload.
        self.top().count = 0;
        Ok(())
    }

    pub fn variant_end(&mut self) -> Result<()> {
        self.end_scope(Scope::Variant)
    }
}

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// Container reads return new decoders restricted to the container's body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Fails with `Error::TrailingBytes` unless everything has been read.
    pub fn finish(&self) -> Result<()> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(Error::TrailingBytes(n)),
        }
    }

    /// Peeks the next tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let b = *self.buf.first().ok_or(Error::UnexpectedEnd)?;
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.take_array()?) as usize)
    }

    fn expect(&mut self, expected: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(Error::UnexpectedTag { expected, found });
        }
        self.take(1)?;
        Ok(())
    }

    /// Skips the next item, including all nested children.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.take(1)?;
        match tag {
            Tag::BoolTrue | Tag::BoolFalse | Tag::Unit => {}
            Tag::U64 | Tag::S64 => {
                self.take(8)?;
            }
            _ => {
                debug_assert!(tag.is_sized());
                let len = self.take_len()?;
                self.take(len)?;
            }
        }
        Ok(())
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::BoolTrue => {
                self.take(1)?;
                Ok(true)
            }
            Tag::BoolFalse => {
                self.take(1)?;
                Ok(false)
            }
            found => Err(Error::UnexpectedTag { expected: Tag::BoolTrue, found }),
        }
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.expect(Tag::U64)?;
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn s64(&mut self) -> Result<i64> {
        self.expect(Tag::S64)?;
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn unit(&mut self) -> Result<()> {
        self.expect(Tag::Unit)
    }

    /// Decodes a string slice (UTF-8).
    pub fn str(&mut self) -> Result<&'a str> {
        self.expect(Tag::String)?;
        let len = self.take_len()?;
        std::str::from_utf8(self.take(len)?).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.expect(Tag::Bytes)?;
        let len = self.take_len()?;
        self.take(len)
    }

    fn enter(&mut self, tag: Tag) -> Result<Decoder<'a>> {
        self.expect(tag)?;
        let len = self.take_len()?;
        Ok(Decoder::new(self.take(len)?))
    }

    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter(Tag::List)? })
    }

    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter(Tag::Map)? })
    }

    /// Decodes a variant, returning `(name, payload)`.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter(Tag::Variant)?;
        let name = inner.str()?;
        Ok((name, inner))
    }
}

/// Iterator over the items of a list. Each item is handed out as its own decoder.
#[derive(Debug, Clone)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a decoder for the next item, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut probe = self.dec.clone();
        probe.skip()?;
        let len = self.dec.remaining() - probe.remaining();
        Ok(Some(Decoder::new(self.dec.take(len)?)))
    }
}

/// Iterator over the `(key, value)` entries of a map.
#[derive(Debug, Clone)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        match self.dec.peek_tag()? {
            Tag::Variant => self.dec.variant().map(Some),
            found => Err(Error::UnexpectedTag { expected: Tag::Variant, found }),
        }
    }
}
