//! In-process message representation handed to and returned from the repository.
//!
//! An [`Exchange`] is the live, mutable form of a message. Before it leaves the
//! process it is captured into an [`ExchangeSnapshot`](crate::snapshot::ExchangeSnapshot);
//! values that cannot be captured faithfully are modelled explicitly by
//! [`Value::Complex`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A value that is not a primitive and has to be serialized opaquely.
///
/// Implementations decide whether they can be captured at all: returning an
/// error from [`ComplexValue::to_bytes`] marks the value as fundamentally
/// non-serializable.
pub trait ComplexValue: fmt::Debug + Send + Sync {
    /// Logical type name recorded next to the serialized bytes.
    fn type_name(&self) -> &str;

    /// Serialize the value.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the value cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, String>;
}

/// An opaquely serialized value restored from a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueValue {
    /// Logical type name reported by the original [`ComplexValue`].
    pub type_name: String,
    /// The serialized form.
    pub bytes: Vec<u8>,
}

/// Header, property, or body value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Absent body or explicit null.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Point in time.
    Timestamp(DateTime<Utc>),
    /// A value previously serialized opaquely.
    Opaque(OpaqueValue),
    /// A live object that can only be stored by serializing it.
    Complex(Arc<dyn ComplexValue>),
}

impl Value {
    /// Whether this value is always preserved in a snapshot.
    #[must_use]
    pub const fn is_primitive(&self) -> bool {
        !matches!(self, Self::Opaque(_) | Self::Complex(_))
    }

    /// Whether this value is [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text content, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer value.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean value.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            // Live objects have no value semantics; only the same instance is equal.
            (Self::Complex(a), Self::Complex(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Arc<dyn ComplexValue>> for Value {
    fn from(value: Arc<dyn ComplexValue>) -> Self {
        Self::Complex(value)
    }
}

/// A message travelling through an aggregation.
///
/// # Example
///
/// ```
/// use recoverable_aggregation_core::exchange::{Exchange, Value};
///
/// let exchange = Exchange::new("ex-1")
///     .with_header("orderId", "o-42")
///     .with_property("attempt", 1_i64)
///     .with_body("line item");
///
/// assert_eq!(exchange.header("orderId"), Some(&Value::from("o-42")));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exchange {
    /// Unique exchange identifier
    pub id: String,

    /// Message headers, ordered by name
    pub headers: BTreeMap<String, Value>,

    /// Exchange-scoped properties
    pub properties: HashMap<String, Value>,

    /// Message payload
    pub body: Value,

    /// Message of the exception captured on the exchange, if any
    pub exception: Option<String>,
}

impl Exchange {
    /// Create an empty exchange with the given id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Set a header (builder style).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a property (builder style).
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Set the body (builder style).
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    /// Record an exception message (builder style).
    #[must_use]
    pub fn with_exception(mut self, message: impl Into<String>) -> Self {
        self.exception = Some(message.into());
        self
    }

    /// Look up a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Look up a property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Insert or replace a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Insert or replace a property.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }
}
