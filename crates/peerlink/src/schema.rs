//! Record schemas known to one side of the connection.

use dashmap::DashMap;

use crate::error::Result;
use crate::shape::Shape;
use crate::value::RecordValue;

/// Field layout of a named record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<(String, Shape)>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fields: Vec::new() }
    }

    pub fn field(mut self, name: impl Into<String>, shape: Shape) -> Self {
        self.fields.push((name.into(), shape));
        self
    }
}

/// A Rust type that travels as a record.
///
/// ```ignore
/// struct Point { x: f64, y: f64 }
///
/// impl Schema for Point {
///     fn schema() -> RecordSchema {
///         RecordSchema::new("demo.Point").field("x", Shape::Double).field("y", Shape::Double)
///     }
///     fn to_record(&self) -> RecordValue {
///         RecordValue::new("demo.Point").with("x", self.x).with("y", self.y)
///     }
///     fn from_record(mut r: RecordValue) -> Result<Self> {
///         Ok(Point { x: field(&mut r, "x")?, y: field(&mut r, "y")? })
///     }
/// }
/// ```
pub trait Schema: Sized {
    fn schema() -> RecordSchema;
    fn to_record(&self) -> RecordValue;
    fn from_record(record: RecordValue) -> Result<Self>;
}

/// Takes a typed field out of a record.
pub fn field<T: crate::value::FromValue>(record: &mut RecordValue, name: &str) -> Result<T> {
    match record.take(name) {
        Some(v) => T::from_value(v),
        None => Err(crate::error::Fault::mismatch(name, "missing field")),
    }
}

/// The set of record schemas this side can validate.
///
/// Records whose schema is not registered still decode, as generic records.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: DashMap<String, RecordSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema: RecordSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    pub fn get(&self, name: &str) -> Option<RecordSchema> {
        self.schemas.get(name).map(|s| s.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }
}
