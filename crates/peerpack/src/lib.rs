//! # Peerpack
//!
//! The bounded tlv byte format underneath the peerlink wire codec.
//!
//! ## Philosophy
//!
//! - **Explicit State**: Encoders track open scopes on an explicit stack and back-patch lengths.
//! - **TLV Architecture**: `[Tag][Length?][Value]` lets a reader skip anything it does not understand.
//! - **Bounded**: Decoders are zero-copy, bounds-checked views. Nothing is read past a container body.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//!
//! Object handles get their own tags: a bare `Handle` is a scalar `u32`, while
//! `HandleSig` and `HandleSnap` are containers carrying the handle id plus
//! whatever descriptor the codec writes after it.
//!
//! All integers are Little-Endian.


/// Peerpack serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`.
    InvalidTag(u8),
    /// String data is not valid UTF-8, or a char is not a valid scalar value.
    InvalidUtf8,
    /// Closing a scope that does not match the active scope stack.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the Root remains.
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    ScopeStillOpen,
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Blob or container length exceeds `u32::MAX`.
    BlobTooLarge(usize),
    /// Attempted to write >1 item into a strict scope (Option/Result/Variant/Record).
    TooManyItems(Scope),
    /// Attempted to close a strict scope without a value.
    EmptyAdt(Scope),
    /// Attempted to write a non-Variant directly into a Map.
    InvalidMapEntry,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::TooManyItems(s) => write!(f, "too many items in scope {:?}; expected exactly 1", s),
            Error::EmptyAdt(s) => write!(f, "empty scope {:?}; expected exactly 1 item", s),
            Error::BlobTooLarge(n) => write!(f, "blob of {} bytes exceeds the u32 length header", n),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for Peerpack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the type of the encoded value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Padding/Alignment (Skip).
    Pad = 0x00,

    // Fixed-width scalars
    BoolTrue = 0x01,
    BoolFalse = 0x02,
    U8 = 0x03,
    U16 = 0x04,
    U32 = 0x05,
    U64 = 0x06,
    S16 = 0x08,
    S32 = 0x09,
    S64 = 0x0A,
    F32 = 0x0B,
    F64 = 0x0C,
    Char = 0x0D,
    Null = 0x0E,
    OptionNone = 0x0F,

    // Blobs (Tag + u32 Len + Bytes)
    String = 0x10,
    Bytes = 0x11,
    TypeName = 0x12,

    // Wide scalars
    /// i128 mantissa + u32 scale.
    Decimal = 0x13,
    /// i64 seconds since the unix epoch + u32 nanoseconds.
    Timestamp = 0x14,
    /// u32 handle id with no descriptor.
    Handle = 0x15,

    // Containers (Tag + u32 Len + Body)
    List = 0x20,
    Map = 0x21,
    Array = 0x22,

    // ADTs (Tag + u32 Len + Body)
    OptionSome = 0x30,
    ResultOk = 0x31,
    ResultErr = 0x32,
    Variant = 0x33,
    Record = 0x34,

    // Handles carrying descriptors (Tag + u32 Len + Body)
    HandleSig = 0x40,
    HandleSnap = 0x41,
}

impl Tag {
    /// Returns the Tag variant for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Tag::Pad),
            0x01 => Some(Tag::BoolTrue),
            0x02 => Some(Tag::BoolFalse),
            0x03 => Some(Tag::U8),
            0x04 => Some(Tag::U16),
            0x05 => Some(Tag::U32),
            0x06 => Some(Tag::U64),
            0x08 => Some(Tag::S16),
            0x09 => Some(Tag::S32),
            0x0A => Some(Tag::S64),
            0x0B => Some(Tag::F32),
            0x0C => Some(Tag::F64),
            0x0D => Some(Tag::Char),
            0x0E => Some(Tag::Null),
            0x0F => Some(Tag::OptionNone),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x12 => Some(Tag::TypeName),
            0x13 => Some(Tag::Decimal),
            0x14 => Some(Tag::Timestamp),
            0x15 => Some(Tag::Handle),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Map),
            0x22 => Some(Tag::Array),
            0x30 => Some(Tag::OptionSome),
            0x31 => Some(Tag::ResultOk),
            0x32 => Some(Tag::ResultErr),
            0x33 => Some(Tag::Variant),
            0x34 => Some(Tag::Record),
            0x40 => Some(Tag::HandleSig),
            0x41 => Some(Tag::HandleSnap),
            _ => None,
        }
    }

    /// Width of the fixed payload following the tag, for scalar tags.
    fn fixed_width(self) -> Option<usize> {
        match self {
            Tag::Pad | Tag::BoolTrue | Tag::BoolFalse | Tag::Null | Tag::OptionNone => Some(0),
            Tag::U8 => Some(1),
            Tag::U16 | Tag::S16 => Some(2),
            Tag::U32 | Tag::S32 | Tag::F32 | Tag::Char | Tag::Handle => Some(4),
            Tag::U64 | Tag::S64 | Tag::F64 => Some(8),
            Tag::Timestamp => Some(12),
            Tag::Decimal => Some(20),
            _ => None,
        }
    }
}

/// Internal state tracking for the `Encoder` stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The virtual root; allows any item.
    Root,
    /// Ordered sequence; allows any number of items.
    List,
    /// Key-Value container; strictly allows only `Tag::Variant` items.
    Map,
    /// Homogeneous sequence; the codec writes the element shape first.
    Array,
    /// Strict container; allows exactly one item.
    Option,
    /// Strict container; allows exactly one item.
    Result,
    /// Strict container; allows exactly one item (the payload) after the name.
    Variant,
    /// Strict container; allows exactly one item (the field map) after the schema name.
    Record,
    /// Handle with descriptor; allows any number of items after the id.
    Handle,
}

/// An active container scope on the `Encoder` stack.
struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A bounded, state-machine driven encoder.
///
/// # Structural Invariants
///
/// 1.  **Map Scopes**: Only `Tag::Variant` items may be written.
/// 2.  **Strict Scopes (Option, Result, Variant, Record)**: Exactly one item must be written.
/// 3.  **Root Scope**: The encoder must end in the Root scope to finalize bytes.
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
    /// Creates a new encoder with default capacity.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            stack: vec![Frame { start: 0, scope: Scope::Root, count: 0 }],
        }
    }

    /// Consumes the encoder and returns the final byte vector.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if the stack depth > 1.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn current_frame(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.current_frame();
        match frame.scope {
            Scope::Root | Scope::List | Scope::Array | Scope::Handle => Ok(()),
            Scope::Map => {
                if tag != Tag::Variant {
                    Err(Error::InvalidMapEntry)
                } else {
                    Ok(())
                }
            }
            Scope::Option | Scope::Result | Scope::Variant | Scope::Record => {
                if frame.count >= 1 {
                    Err(Error::TooManyItems(frame.scope))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn on_item_written(&mut self) {
        self.current_frame().count += 1;
    }

    fn scalar(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(data);
        self.on_item_written();
        Ok(())
    }

    fn blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(len));
        }
        self.scalar(tag, &(len as u32).to_le_bytes())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;

        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]); // Length placeholder

        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }

        {
            let frame = self.current_frame();
            if frame.scope != expected {
                return Err(Error::ScopeMismatch { expected, actual: frame.scope });
            }
            if matches!(frame.scope, Scope::Option | Scope::Result | Scope::Variant | Scope::Record)
                && frame.count == 0
            {
                return Err(Error::EmptyAdt(frame.scope));
            }
        }

        let Some(frame) = self.stack.pop() else {
            return Err(Error::ScopeUnderflow);
        };
        let body_len = self.buf.len() - frame.start;
        if body_len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(body_len));
        }

        let len_pos = frame.start - 4;
        self.buf[len_pos..frame.start].copy_from_slice(&(body_len as u32).to_le_bytes());

        self.on_item_written();
        Ok(())
    }

    /// Begins a scope whose first item is a name that does not count as payload.
    fn begin_named(&mut self, tag: Tag, scope: Scope, name: &str) -> Result<()> {
        self.begin_scope(tag, scope)?;
        self.str(name)?;
        self.current_frame().count = 0;
        Ok(())
    }

    /// Encodes a boolean value.
    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.scalar(if v { Tag::BoolTrue } else { Tag::BoolFalse }, &[])
    }

    /// Encodes an unsigned 8-bit integer.
    pub fn u8(&mut self, v: u8) -> Result<()> { self.scalar(Tag::U8, &[v]) }
    /// Encodes an unsigned 16-bit integer (LE).
    pub fn u16(&mut self, v: u16) -> Result<()> { self.scalar(Tag::U16, &v.to_le_bytes()) }
    /// Encodes a signed 16-bit integer (LE).
    pub fn s16(&mut self, v: i16) -> Result<()> { self.scalar(Tag::S16, &v.to_le_bytes()) }
    /// Encodes an unsigned 32-bit integer (LE).
    pub fn u32(&mut self, v: u32) -> Result<()> { self.scalar(Tag::U32, &v.to_le_bytes()) }
    /// Encodes a signed 32-bit integer (LE).
    pub fn s32(&mut self, v: i32) -> Result<()> { self.scalar(Tag::S32, &v.to_le_bytes()) }
    /// Encodes an unsigned 64-bit integer (LE).
    pub fn u64(&mut self, v: u64) -> Result<()> { self.scalar(Tag::U64, &v.to_le_bytes()) }
    /// Encodes a signed 64-bit integer (LE).
    pub fn s64(&mut self, v: i64) -> Result<()> { self.scalar(Tag::S64, &v.to_le_bytes()) }
    /// Encodes a 32-bit float (LE).
    pub fn f32(&mut self, v: f32) -> Result<()> { self.scalar(Tag::F32, &v.to_le_bytes()) }
    /// Encodes a 64-bit float (LE).
    pub fn f64(&mut self, v: f64) -> Result<()> { self.scalar(Tag::F64, &v.to_le_bytes()) }
    /// Encodes a char as u32 (LE).
    pub fn char(&mut self, v: char) -> Result<()> { self.scalar(Tag::Char, &(v as u32).to_le_bytes()) }
    /// Encodes the null marker.
    pub fn null(&mut self) -> Result<()> { self.scalar(Tag::Null, &[]) }
    /// Encodes `Option::None`.
    pub fn option_none(&mut self) -> Result<()> { self.scalar(Tag::OptionNone, &[]) }

    /// Encodes a fixed-point decimal as `mantissa * 10^-scale`.
    pub fn decimal(&mut self, mantissa: i128, scale: u32) -> Result<()> {
        let mut data = [0u8; 20];
        data[..16].copy_from_slice(&mantissa.to_le_bytes());
        data[16..].copy_from_slice(&scale.to_le_bytes());
        self.scalar(Tag::Decimal, &data)
    }

    /// Encodes a point in time as seconds + nanoseconds relative to the unix epoch.
    pub fn timestamp(&mut self, secs: i64, nanos: u32) -> Result<()> {
        let mut data = [0u8; 12];
        data[..8].copy_from_slice(&secs.to_le_bytes());
        data[8..].copy_from_slice(&nanos.to_le_bytes());
        self.scalar(Tag::Timestamp, &data)
    }

    /// Encodes a bare handle id.
    pub fn handle(&mut self, id: u32) -> Result<()> { self.scalar(Tag::Handle, &id.to_le_bytes()) }

    /// Encodes a UTF-8 string blob.
    pub fn str(&mut self, v: &str) -> Result<()> { self.blob(Tag::String, v.as_bytes()) }

    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> { self.blob(Tag::Bytes, v) }

    /// Encodes a qualified type name.
    pub fn type_name(&mut self, v: &str) -> Result<()> { self.blob(Tag::TypeName, v.as_bytes()) }

    /// Begins a List container. Allows any number of items.
    pub fn list_begin(&mut self) -> Result<()> { self.begin_scope(Tag::List, Scope::List) }
    /// Ends a List container.
    pub fn list_end(&mut self) -> Result<()> { self.end_scope(Scope::List) }

    /// Begins a Map container.
    ///
    /// **Strict:** Only `variant_begin()` (Key/Value pair) is allowed as a direct child.
    pub fn map_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Map, Scope::Map) }
    /// Ends a Map container.
    pub fn map_end(&mut self) -> Result<()> { self.end_scope(Scope::Map) }

    /// Begins an Array container. Allows any number of items.
    pub fn array_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Array, Scope::Array) }
    /// Ends an Array container.
    pub fn array_end(&mut self) -> Result<()> { self.end_scope(Scope::Array) }

    /// Begins an `Option::Some` container. Requires exactly one item.
    pub fn option_some_begin(&mut self) -> Result<()> { self.begin_scope(Tag::OptionSome, Scope::Option) }
    /// Ends an `Option::Some` container.
    pub fn option_some_end(&mut self) -> Result<()> { self.end_scope(Scope::Option) }

    /// Begins a `Result::Ok` container. Requires exactly one item.
    pub fn result_ok_begin(&mut self) -> Result<()> { self.begin_scope(Tag::ResultOk, Scope::Result) }
    /// Ends a `Result::Ok` container.
    pub fn result_ok_end(&mut self) -> Result<()> { self.end_scope(Scope::Result) }

    /// Begins a `Result::Err` container. Requires exactly one item.
    pub fn result_err_begin(&mut self) -> Result<()> { self.begin_scope(Tag::ResultErr, Scope::Result) }
    /// Ends a `Result::Err` container.
    pub fn result_err_end(&mut self) -> Result<()> { self.end_scope(Scope::Result) }

    /// Begins a Variant (Named Payload).
    ///
    /// Encodes the name immediately. Requires exactly one payload item afterwards.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.begin_named(Tag::Variant, Scope::Variant, name)
    }
    /// Ends a Variant.
    pub fn variant_end(&mut self) -> Result<()> { self.end_scope(Scope::Variant) }

    /// Begins a Record whose schema is identified by `schema`.
    ///
    /// Requires exactly one payload item afterwards (the field map).
    pub fn record_begin(&mut self, schema: &str) -> Result<()> {
        self.begin_named(Tag::Record, Scope::Record, schema)
    }
    /// Ends a Record.
    pub fn record_end(&mut self) -> Result<()> { self.end_scope(Scope::Record) }

    /// Begins a handle carrying a callable signature. The id is written immediately.
    pub fn handle_sig_begin(&mut self, id: u32) -> Result<()> {
        self.begin_scope(Tag::HandleSig, Scope::Handle)?;
        self.buf.extend_from_slice(&id.to_le_bytes());
        Ok(())
    }

    /// Begins a handle carrying an object descriptor and snapshot. The id is written immediately.
    pub fn handle_snap_begin(&mut self, id: u32) -> Result<()> {
        self.begin_scope(Tag::HandleSnap, Scope::Handle)?;
        self.buf.extend_from_slice(&id.to_le_bytes());
        Ok(())
    }

    /// Ends either handle container.
    pub fn handle_end(&mut self) -> Result<()> { self.end_scope(Scope::Handle) }
}

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// Container reads return new `Decoder` instances restricted to the container's body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the remaining bytes in the view.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Peeks the next Tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let Some(&b) = self.buf.first() else {
            return Err(Error::UnexpectedEnd);
        };
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.read_array()?) as usize)
    }

    fn check_tag(&mut self, expected: Tag) -> Result<()> {
        let tag = self.peek_tag()?;
        if tag != expected {
            return Err(Error::InvalidTag(tag as u8));
        }
        self.consume(1)
    }

    /// Skips the next item and its nested children.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.consume(1)?;
        match tag.fixed_width() {
            Some(width) => self.consume(width),
            None => {
                let len = self.read_len()?;
                self.consume(len)
            }
        }
    }

    /// Decodes a bool.
    pub fn bool(&mut self) -> Result<bool> {
        let tag = self.peek_tag()?;
        let v = match tag {
            Tag::BoolTrue => true,
            Tag::BoolFalse => false,
            _ => return Err(Error::InvalidTag(tag as u8)),
        };
        self.consume(1)?;
        Ok(v)
    }

    /// Decodes u8.
    pub fn u8(&mut self) -> Result<u8> { self.check_tag(Tag::U8)?; Ok(self.read_array::<1>()?[0]) }
    /// Decodes u16 (LE).
    pub fn u16(&mut self) -> Result<u16> { self.check_tag(Tag::U16)?; Ok(u16::from_le_bytes(self.read_array()?)) }
    /// Decodes s16 (LE).
    pub fn s16(&mut self) -> Result<i16> { self.check_tag(Tag::S16)?; Ok(i16::from_le_bytes(self.read_array()?)) }
    /// Decodes u32 (LE).
    pub fn u32(&mut self) -> Result<u32> { self.check_tag(Tag::U32)?; Ok(u32::from_le_bytes(self.read_array()?)) }
    /// Decodes s32 (LE).
    pub fn s32(&mut self) -> Result<i32> { self.check_tag(Tag::S32)?; Ok(i32::from_le_bytes(self.read_array()?)) }
    /// Decodes u64 (LE).
    pub fn u64(&mut self) -> Result<u64> { self.check_tag(Tag::U64)?; Ok(u64::from_le_bytes(self.read_array()?)) }
    /// Decodes s64 (LE).
    pub fn s64(&mut self) -> Result<i64> { self.check_tag(Tag::S64)?; Ok(i64::from_le_bytes(self.read_array()?)) }
    /// Decodes f32 (LE).
    pub fn f32(&mut self) -> Result<f32> { self.check_tag(Tag::F32)?; Ok(f32::from_le_bytes(self.read_array()?)) }
    /// Decodes f64 (LE).
    pub fn f64(&mut self) -> Result<f64> { self.check_tag(Tag::F64)?; Ok(f64::from_le_bytes(self.read_array()?)) }

    /// Decodes char (u32 LE).
    pub fn char(&mut self) -> Result<char> {
        self.check_tag(Tag::Char)?;
        let val = u32::from_le_bytes(self.read_array()?);
        char::from_u32(val).ok_or(Error::InvalidUtf8)
    }

    /// Decodes the null marker.
    pub fn null(&mut self) -> Result<()> { self.check_tag(Tag::Null) }
    /// Decodes `Option::None`.
    pub fn option_none(&mut self) -> Result<()> { self.check_tag(Tag::OptionNone) }

    /// Decodes a decimal as `(mantissa, scale)`.
    pub fn decimal(&mut self) -> Result<(i128, u32)> {
        self.check_tag(Tag::Decimal)?;
        let mantissa = i128::from_le_bytes(self.read_array()?);
        let scale = u32::from_le_bytes(self.read_array()?);
        Ok((mantissa, scale))
    }

    /// Decodes a timestamp as `(secs, nanos)`.
    pub fn timestamp(&mut self) -> Result<(i64, u32)> {
        self.check_tag(Tag::Timestamp)?;
        let secs = i64::from_le_bytes(self.read_array()?);
        let nanos = u32::from_le_bytes(self.read_array()?);
        Ok((secs, nanos))
    }

    /// Decodes a bare handle id.
    pub fn handle(&mut self) -> Result<u32> { self.check_tag(Tag::Handle)?; Ok(u32::from_le_bytes(self.read_array()?)) }

    fn blob(&mut self, tag: Tag) -> Result<&'a [u8]> {
        self.check_tag(tag)?;
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    /// Decodes a string slice (UTF-8).
    pub fn str(&mut self) -> Result<&'a str> {
        std::str::from_utf8(self.blob(Tag::String)?).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8]> { self.blob(Tag::Bytes) }

    /// Decodes a qualified type name.
    pub fn type_name(&mut self) -> Result<&'a str> {
        std::str::from_utf8(self.blob(Tag::TypeName)?).map_err(|_| Error::InvalidUtf8)
    }

    fn enter_container(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.check_tag(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.read_bytes(len)?))
    }

    /// Decodes a List into an iterator.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter_container(Tag::List)? })
    }

    /// Decodes an Array into an iterator. The first item is the element shape.
    pub fn array(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter_container(Tag::Array)? })
    }

    /// Decodes a Map into an iterator.
    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter_container(Tag::Map)? })
    }

    /// Decodes an Option.
    ///
    /// Returns `Some(Decoder)` for the payload if present, or `None`.
    pub fn option(&mut self) -> Result<Option<Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::OptionNone => {
                self.consume(1)?;
                Ok(None)
            }
            Tag::OptionSome => Ok(Some(self.enter_container(Tag::OptionSome)?)),
            tag => Err(Error::InvalidTag(tag as u8)),
        }
    }

    /// Decodes a Result.
    pub fn result(&mut self) -> Result<std::result::Result<Decoder<'a>, Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::ResultOk => Ok(Ok(self.enter_container(Tag::ResultOk)?)),
            Tag::ResultErr => Ok(Err(self.enter_container(Tag::ResultErr)?)),
            tag => Err(Error::InvalidTag(tag as u8)),
        }
    }

    /// Decodes a Variant as `(Name, PayloadDecoder)`.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter_container(Tag::Variant)?;
        let name = inner.str()?;
        Ok((name, inner))
    }

    /// Decodes a Record as `(SchemaName, FieldMapDecoder)`.
    pub fn record(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter_container(Tag::Record)?;
        let name = inner.str()?;
        Ok((name, inner))
    }

    /// Decodes a handle container as `(Id, DescriptorDecoder)`.
    ///
    /// Accepts both `HandleSig` and `HandleSnap`; callers peek the tag first to tell them apart.
    pub fn handle_with(&mut self) -> Result<(u32, Decoder<'a>)> {
        let tag = self.peek_tag()?;
        if !matches!(tag, Tag::HandleSig | Tag::HandleSnap) {
            return Err(Error::InvalidTag(tag as u8));
        }
        let mut inner = self.enter_container(tag)?;
        let id = u32::from_le_bytes(inner.read_array()?);
        Ok((id, inner))
    }
}

/// Iterator for items within a List or Array.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a Decoder for the next item, or `None` once the body is exhausted.
    ///
    /// A truncated trailing item is reported as `Error::UnexpectedEnd`.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut ahead = self.dec.clone();
        ahead.skip()?;
        let len = self.dec.remaining() - ahead.remaining();
        Ok(Some(Decoder::new(self.dec.read_bytes(len)?)))
    }
}

/// Iterator for Key-Value pairs (Variants) within a Map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    /// Returns `(Key, ValueDecoder)` for the next item, or `None`.
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let tag = self.dec.peek_tag()?;
        if tag != Tag::Variant {
            return Err(Error::InvalidTag(tag as u8));
        }
        let (name, val) = self.dec.variant()?;
        Ok(Some((name, val)))
    }
}
