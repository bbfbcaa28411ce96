//! SQL values crossing the virtual-table boundary.
//!
//! The host hands coordinate values, rowids and MATCH blobs to the engine
//! as dynamically typed SQL values. Coercion rules follow the host's: a
//! numeric context truncates reals and reads non-numeric values as zero.

/// A dynamically typed host value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Reads the value in an integer context.
    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Integer(i) => *i,
            Value::Real(f) => *f as i64,
            _ => 0,
        }
    }

    /// Reads the value in a real-number context.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Integer(i) => *i as f64,
            Value::Real(f) => *f,
            _ => 0.0,
        }
    }

    /// Returns the blob payload, if the value is a blob.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}
