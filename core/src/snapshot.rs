//! Storable capture of an [`Exchange`].
//!
//! Marshalling follows one rule for headers and properties:
//!
//! - primitive values are always preserved
//! - complex values are dropped, unless serialized headers are allowed, in which
//!   case they are stored opaquely (and a value that cannot serialize itself is
//!   an error)
//!
//! The body is the payload of the aggregate and is never dropped: a complex body
//! is always stored opaquely.

use crate::exchange::{Exchange, OpaqueValue, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while capturing or encoding a snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// A value could not be serialized.
    #[error("Cannot serialize {section} '{name}' of type {type_name}: {reason}")]
    NotSerializable {
        /// Which part of the exchange held the value (`header`, `property`, `body`)
        section: &'static str,
        /// Header or property name (`body` for the body)
        name: String,
        /// Type name reported by the value
        type_name: String,
        /// Reason given by the value
        reason: String,
    },

    /// The binary codec failed.
    #[error("Snapshot codec error: {0}")]
    Codec(String),
}

/// Serializable form of a [`Value`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SnapshotValue {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Point in time
    Timestamp(DateTime<Utc>),
    /// Opaquely serialized complex value
    Opaque {
        /// Logical type name
        type_name: String,
        /// Serialized form
        bytes: Vec<u8>,
    },
}

impl From<SnapshotValue> for Value {
    fn from(value: SnapshotValue) -> Self {
        match value {
            SnapshotValue::Null => Self::Null,
            SnapshotValue::Bool(b) => Self::Bool(b),
            SnapshotValue::Int(n) => Self::Int(n),
            SnapshotValue::Float(f) => Self::Float(f),
            SnapshotValue::Text(s) => Self::Text(s),
            SnapshotValue::Bytes(b) => Self::Bytes(b),
            SnapshotValue::Timestamp(t) => Self::Timestamp(t),
            SnapshotValue::Opaque { type_name, bytes } => {
                Self::Opaque(OpaqueValue { type_name, bytes })
            }
        }
    }
}

/// Immutable, serializable capture of an exchange.
///
/// Once handed to the repository a snapshot is owned by it; callers get fresh
/// [`Exchange`] values back through [`ExchangeSnapshot::into_exchange`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    /// Id of the captured exchange
    pub id: String,
    /// Captured headers
    pub headers: BTreeMap<String, SnapshotValue>,
    /// Captured properties
    pub properties: BTreeMap<String, SnapshotValue>,
    /// Captured body
    pub body: SnapshotValue,
    /// Captured exception message
    pub exception: Option<String>,
}

impl ExchangeSnapshot {
    /// Capture an exchange.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::NotSerializable`] when `allow_serialized_headers`
    /// is true and a complex header or property cannot serialize itself, or
    /// when a complex body cannot serialize itself.
    pub fn marshal(
        exchange: &Exchange,
        allow_serialized_headers: bool,
    ) -> Result<Self, SnapshotError> {
        let headers = capture_entries(
            "header",
            &exchange.id,
            exchange.headers.iter(),
            allow_serialized_headers,
        )?;
        let properties = capture_entries(
            "property",
            &exchange.id,
            exchange.properties.iter(),
            allow_serialized_headers,
        )?;
        let body = match capture_value(&exchange.body) {
            Capture::Primitive(value) => value,
            Capture::Complex { type_name, bytes } => match bytes {
                Ok(bytes) => SnapshotValue::Opaque { type_name, bytes },
                Err(reason) => {
                    return Err(SnapshotError::NotSerializable {
                        section: "body",
                        name: "body".to_string(),
                        type_name,
                        reason,
                    });
                }
            },
        };

        Ok(Self {
            id: exchange.id.clone(),
            headers,
            properties,
            body,
            exception: exchange.exception.clone(),
        })
    }

    /// Restore a live exchange from this snapshot.
    #[must_use]
    pub fn into_exchange(self) -> Exchange {
        Exchange {
            id: self.id,
            headers: self
                .headers
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect(),
            properties: self
                .properties
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect(),
            body: self.body.into(),
            exception: self.exception,
        }
    }

    /// Encode to bytes for byte-oriented backends.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Codec`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serialize(self).map_err(|e| SnapshotError::Codec(e.to_string()))
    }

    /// Decode bytes produced by [`ExchangeSnapshot::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Codec`] if the bytes are not a valid snapshot.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        bincode::deserialize(bytes).map_err(|e| SnapshotError::Codec(e.to_string()))
    }
}

enum Capture {
    Primitive(SnapshotValue),
    Complex {
        type_name: String,
        bytes: Result<Vec<u8>, String>,
    },
}

fn capture_value(value: &Value) -> Capture {
    let primitive = match value {
        Value::Null => SnapshotValue::Null,
        Value::Bool(b) => SnapshotValue::Bool(*b),
        Value::Int(n) => SnapshotValue::Int(*n),
        Value::Float(f) => SnapshotValue::Float(*f),
        Value::Text(s) => SnapshotValue::Text(s.clone()),
        Value::Bytes(b) => SnapshotValue::Bytes(b.clone()),
        Value::Timestamp(t) => SnapshotValue::Timestamp(*t),
        Value::Opaque(opaque) => {
            return Capture::Complex {
                type_name: opaque.type_name.clone(),
                bytes: Ok(opaque.bytes.clone()),
            };
        }
        Value::Complex(object) => {
            return Capture::Complex {
                type_name: object.type_name().to_string(),
                bytes: object.to_bytes(),
            };
        }
    };
    Capture::Primitive(primitive)
}

fn capture_entries<'a>(
    section: &'static str,
    exchange_id: &str,
    entries: impl Iterator<Item = (&'a String, &'a Value)>,
    allow_serialized: bool,
) -> Result<BTreeMap<String, SnapshotValue>, SnapshotError> {
    let mut captured = BTreeMap::new();

    for (name, value) in entries {
        match capture_value(value) {
            Capture::Primitive(v) => {
                captured.insert(name.clone(), v);
            }
            Capture::Complex { type_name, .. } if !allow_serialized => {
                tracing::debug!(
                    exchange_id,
                    section,
                    name = %name,
                    type_name = %type_name,
                    "Dropping non-primitive value from snapshot"
                );
            }
            Capture::Complex {
                type_name,
                bytes: Ok(bytes),
            } => {
                captured.insert(name.clone(), SnapshotValue::Opaque { type_name, bytes });
            }
            Capture::Complex {
                type_name,
                bytes: Err(reason),
            } => {
                return Err(SnapshotError::NotSerializable {
                    section,
                    name: name.clone(),
                    type_name,
                    reason,
                });
            }
        }
    }

    Ok(captured)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::exchange::ComplexValue;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Money(i64);

    impl ComplexValue for Money {
        fn type_name(&self) -> &str {
            "Money"
        }

        fn to_bytes(&self) -> Result<Vec<u8>, String> {
            Ok(self.0.to_be_bytes().to_vec())
        }
    }

    #[derive(Debug)]
    struct Socket;

    impl ComplexValue for Socket {
        fn type_name(&self) -> &str {
            "Socket"
        }

        fn to_bytes(&self) -> Result<Vec<u8>, String> {
            Err("sockets cannot be serialized".to_string())
        }
    }

    fn money() -> Value {
        Value::Complex(Arc::new(Money(250)))
    }

    fn socket() -> Value {
        Value::Complex(Arc::new(Socket))
    }

    #[test]
    fn primitive_exchange_survives_capture() {
        let exchange = Exchange::new("ex-1")
            .with_header("a", "text")
            .with_header("b", 7_i64)
            .with_property("c", 1.5)
            .with_body(vec![9_u8, 8])
            .with_exception("failed once");

        let restored = ExchangeSnapshot::marshal(&exchange, false)
            .unwrap()
            .into_exchange();

        assert_eq!(restored, exchange);
    }

    #[test]
    fn complex_headers_dropped_when_not_allowed() {
        let exchange = Exchange::new("ex-1")
            .with_header("amount", money())
            .with_header("conn", socket())
            .with_header("kept", true);

        let snapshot = ExchangeSnapshot::marshal(&exchange, false).unwrap();

        assert_eq!(snapshot.headers.len(), 1);
        assert!(snapshot.headers.contains_key("kept"));
    }

    #[test]
    fn complex_headers_serialized_when_allowed() {
        let exchange = Exchange::new("ex-1").with_property("amount", money());

        let snapshot = ExchangeSnapshot::marshal(&exchange, true).unwrap();

        assert_eq!(
            snapshot.properties.get("amount"),
            Some(&SnapshotValue::Opaque {
                type_name: "Money".to_string(),
                bytes: 250_i64.to_be_bytes().to_vec(),
            })
        );
    }

    #[test]
    fn non_serializable_header_fails_when_allowed() {
        let exchange = Exchange::new("ex-1").with_header("conn", socket());

        let err = ExchangeSnapshot::marshal(&exchange, true).unwrap_err();

        assert!(matches!(
            err,
            SnapshotError::NotSerializable { section: "header", ref name, .. } if name == "conn"
        ));
    }

    #[test]
    fn complex_body_is_never_dropped() {
        let exchange = Exchange::new("ex-1").with_body(money());
        let snapshot = ExchangeSnapshot::marshal(&exchange, false).unwrap();
        assert!(matches!(snapshot.body, SnapshotValue::Opaque { .. }));

        let broken = Exchange::new("ex-2").with_body(socket());
        assert!(ExchangeSnapshot::marshal(&broken, false).is_err());
    }

    #[test]
    fn codec_roundtrip_and_garbage() {
        let exchange = Exchange::new("ex-1")
            .with_header("at", Utc::now())
            .with_body("payload");
        let snapshot = ExchangeSnapshot::marshal(&exchange, false).unwrap();

        let bytes = snapshot.encode().unwrap();
        assert_eq!(ExchangeSnapshot::decode(&bytes).unwrap(), snapshot);

        assert!(matches!(
            ExchangeSnapshot::decode(&[0xff, 0x01]),
            Err(SnapshotError::Codec(_))
        ));
    }
    proptest::proptest! {
        #[test]
        fn complex_headers_never_survive_without_permission(
            names in proptest::collection::btree_set("[a-z]{1,6}", 1..6),
            amount in proptest::prelude::any::<i64>(),
        ) {
            let mut exchange = Exchange::new("ex");
            for (i, name) in names.iter().enumerate() {
                if i % 2 == 0 {
                    exchange.set_header(name.clone(), Arc::new(Money(amount)) as Arc<dyn ComplexValue>);
                } else {
                    exchange.set_header(name.clone(), amount);
                }
            }

            let snapshot = ExchangeSnapshot::marshal(&exchange, false).unwrap();

            proptest::prop_assert_eq!(snapshot.headers.len(), names.len() / 2);
            proptest::prop_assert!(snapshot
                .headers
                .values()
                .all(|value| matches!(value, SnapshotValue::Int(n) if *n == amount)));
        }
    }
}
