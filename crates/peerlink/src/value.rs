//! # Values
//!
//! The dynamic value model shared by both peers.
//!
//! ## Invariants
//!
//! - **Closed Set**: Every value that crosses the wire is one of the `Value` variants.
//!   Anything else is rejected with `Fault::Unmarshalable` before a byte is written.
//! - **Identity, Not Equality**: Two `Value::Object`s compare equal only when they
//!   denote the same object (same `Arc`, or same proxy).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::error::Fault;
use crate::error::Result;
use crate::object::Callable;
use crate::object::Exposed;
use crate::proxy::Proxy;
use crate::shape::Shape;

/// A value that can cross the connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Byte(u8),
    Char(char),
    Decimal(Decimal),
    Double(f64),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Single(f32),
    String(String),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Timestamp(Timestamp),
    Record(RecordValue),
    /// Homogeneous sequence; every item matches the declared element shape.
    Array(Array),
    /// Heterogeneous sequence.
    List(Vec<Value>),
    /// A reference to a type by its qualified name.
    Type(String),
    Object(ObjectRef),
}

impl Value {
    /// Human-readable name of the variant, used in mismatch reports.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Byte(_) => "byte",
            Value::Char(_) => "char",
            Value::Decimal(_) => "decimal",
            Value::Double(_) => "double",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Single(_) => "single",
            Value::String(_) => "string",
            Value::UInt16(_) => "uint16",
            Value::UInt32(_) => "uint32",
            Value::UInt64(_) => "uint64",
            Value::Timestamp(_) => "timestamp",
            Value::Record(_) => "record",
            Value::Array(_) => "array",
            Value::List(_) => "list",
            Value::Type(_) => "type",
            Value::Object(ObjectRef::Callable(_)) => "callable",
            Value::Object(_) => "object",
        }
    }

    /// Wraps a local object so it can be sent by reference.
    pub fn object(object: impl Exposed) -> Self {
        Value::Object(ObjectRef::Local(Arc::new(object)))
    }

    /// Wraps an already shared local object.
    pub fn shared(object: Arc<dyn Exposed>) -> Self {
        Value::Object(ObjectRef::Local(object))
    }

    pub fn callable(callable: Callable) -> Self {
        Value::Object(ObjectRef::Callable(callable))
    }

    pub fn proxy(proxy: Proxy) -> Self {
        Value::Object(ObjectRef::Remote(proxy))
    }

    /// Any integral value that fits in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(v) => Some(v as i64),
            Value::Int16(v) => Some(v as i64),
            Value::Int32(v) => Some(v as i64),
            Value::Int64(v) => Some(v),
            Value::UInt16(v) => Some(v as i64),
            Value::UInt32(v) => Some(v as i64),
            Value::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordValue> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Value::Object(ObjectRef::Remote(p)) => Some(p),
            _ => None,
        }
    }

    /// Items of an `Array` or `List`.
    pub fn items(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(&a.items),
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Converts a schema-described Rust type into a record value.
    pub fn record_of<T: crate::schema::Schema>(value: &T) -> Self {
        Value::Record(value.to_record())
    }

    /// Converts a record value back into its schema-described Rust type.
    pub fn into_schema<T: crate::schema::Schema>(self) -> Result<T> {
        match self {
            Value::Record(r) => T::from_record(r),
            other => Err(Fault::mismatch(T::schema().name, other.kind_name())),
        }
    }
}

// ============================================================================
//  Scalars
// ============================================================================

/// A fixed-point decimal: `mantissa * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    pub mantissa: i128,
    pub scale: u32,
}

impl Decimal {
    /// Digits an `i128` mantissa can carry; larger scales are refused on the wire.
    pub const MAX_SCALE: u32 = 38;

    pub fn new(mantissa: i128, scale: u32) -> Self {
        Self { mantissa, scale }
    }
}

impl From<i64> for Decimal {
    fn from(v: i64) -> Self {
        Self::new(v as i128, 0)
    }
}

impl From<u64> for Decimal {
    fn from(v: u64) -> Self {
        Self::new(v as i128, 0)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let padded = format!("{:0>width$}", digits, width = scale + 1);
        let (whole, frac) = padded.split_at(padded.len() - scale);
        let sign = if self.mantissa < 0 { "-" } else { "" };
        write!(f, "{}{}.{}", sign, whole, frac)
    }
}

/// A point in time relative to the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// `None` when the platform clock cannot represent this instant.
    pub fn to_system_time(self) -> Option<SystemTime> {
        let whole = Duration::from_secs(self.secs.unsigned_abs());
        let secs = if self.secs >= 0 { UNIX_EPOCH.checked_add(whole)? } else { UNIX_EPOCH.checked_sub(whole)? };
        secs.checked_add(Duration::from_nanos(self.nanos as u64))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                let d = e.duration();
                let mut secs = -(d.as_secs() as i64);
                let mut nanos = 0;
                if d.subsec_nanos() > 0 {
                    secs -= 1;
                    nanos = 1_000_000_000 - d.subsec_nanos();
                }
                Self::new(secs, nanos)
            }
        }
    }
}

// ============================================================================
//  Composites
// ============================================================================

/// A homogeneous sequence with a declared element shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub elem: Shape,
    pub items: Vec<Value>,
}

impl Array {
    pub fn new(elem: Shape, items: Vec<Value>) -> Self {
        Self { elem, items }
    }
}

/// A structured value. `schema` names a registered record schema; `None` is a
/// generic name-to-value mapping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordValue {
    pub schema: Option<String>,
    pub fields: Vec<(String, Value)>,
}

impl RecordValue {
    pub fn new(schema: impl Into<String>) -> Self {
        Self { schema: Some(schema.into()), fields: Vec::new() }
    }

    pub fn generic() -> Self {
        Self::default()
    }

    /// Appends a field, replacing any existing field with the same name.
    pub fn with(mut self, name: impl Into<String>, value: impl IntoValue) -> Self {
        self.set(name, value.into_value());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn take(&mut self, name: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(pos).1)
    }
}

// ============================================================================
//  Object references
// ============================================================================

/// Something passed by reference rather than by value.
#[derive(Clone)]
pub enum ObjectRef {
    /// An object living in this process.
    Local(Arc<dyn Exposed>),
    /// A function living in this process.
    Callable(Callable),
    /// A stand-in for an object living in the peer.
    Remote(Proxy),
}

impl ObjectRef {
    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            ObjectRef::Remote(p) => Some(p),
            _ => None,
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ObjectRef::Local(a), ObjectRef::Local(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (ObjectRef::Callable(a), ObjectRef::Callable(b)) => a == b,
            (ObjectRef::Remote(a), ObjectRef::Remote(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Local(o) => write!(f, "Local({})", o.type_info().name),
            ObjectRef::Callable(c) => write!(f, "Callable({:?})", c.signature()),
            ObjectRef::Remote(p) => write!(f, "{:?}", p),
        }
    }
}

// ============================================================================
//  Conversions
// ============================================================================

/// Converts a Rust value into a `Value`.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Converts a `Value` back into a Rust value, failing with `Fault::TypeMismatch`.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

macro_rules! scalar_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    Value::$variant(self)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(Fault::mismatch(stringify!($ty), other.kind_name())),
                    }
                }
            }
        )*
    };
}

scalar_conversions! {
    bool => Bool,
    u8 => Byte,
    char => Char,
    f64 => Double,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Single,
    String => String,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    Decimal => Decimal,
    Timestamp => Timestamp,
    RecordValue => Record,
    Array => Array,
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Null
    }
}

impl FromValue for () {
    fn from_value(_: Value) -> Result<Self> {
        Ok(())
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_string())
    }
}

impl IntoValue for Proxy {
    fn into_value(self) -> Value {
        Value::proxy(self)
    }
}

impl FromValue for Proxy {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(ObjectRef::Remote(p)) => Ok(p),
            other => Err(Fault::mismatch("proxy", other.kind_name())),
        }
    }
}

impl IntoValue for Callable {
    fn into_value(self) -> Value {
        Value::callable(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        let items = match value {
            Value::Array(a) => a.items,
            Value::List(l) => l,
            other => return Err(Fault::mismatch("sequence", other.kind_name())),
        };
        items.into_iter().map(T::from_value).collect()
    }
}
