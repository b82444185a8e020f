//! The abstract value universe the codec operates on.
//!
//! A value is nil, a boolean, a signed 64-bit integer, a binary64 float, a
//! byte string, or a table. Tables carry an array part (values indexed from
//! 1) and a record part (key/value pairs); they are reference values, so the
//! same table instance may appear in several places — including inside
//! itself — and that identity survives an encode/decode round-trip.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

/// Shared handle to a table. Identity (not structure) is what the codec's
/// back-references preserve; compare with [`Rc::ptr_eq`].
pub type TableRef = Rc<RefCell<Table>>;

/// A table: contiguous array part plus an association-list record part.
///
/// The record part preserves insertion order and does not deduplicate keys;
/// it is the caller's job to keep keys unique if that matters to them.
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Values at keys 1..=N.
    pub array: Vec<Value>,
    /// All other entries.
    pub record: Vec<(Value, Value)>,
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Table::default()
    }

    /// Wrap a table in a shared handle.
    pub fn into_ref(self) -> TableRef {
        Rc::new(RefCell::new(self))
    }

    /// Total number of entries across both parts.
    pub fn len(&self) -> usize {
        self.array.len() + self.record.len()
    }

    /// True if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.record.is_empty()
    }
}

/// A codec value.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absent value. Not encodable: table entries with a nil key or
    /// value are dropped, and a top-level nil is an unsupported type.
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Bytes),
    Table(TableRef),
}

impl Value {
    /// Shorthand for a string value from anything byte-like.
    pub fn str(s: impl Into<Bytes>) -> Self {
        Value::Str(s.into())
    }

    /// Shorthand for a fresh empty table value.
    pub fn table() -> Self {
        Value::Table(Table::new().into_ref())
    }

    /// True for the values the codec can serialize.
    pub(crate) fn supported(&self) -> bool {
        !matches!(self, Value::Nil)
    }

    /// True if this is `Nil`.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Structural equality: bitwise on floats (NaN equals NaN), element-wise
    /// on tables. Cycles are not detected; use only on acyclic values or
    /// values whose cycles line up (as the round-trip tests do via identity
    /// checks before descending).
    pub fn deep_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.array.len() == b.array.len()
                    && a.record.len() == b.record.len()
                    && a.array.iter().zip(&b.array).all(|(x, y)| x.deep_eq(y))
                    && a.record
                        .iter()
                        .zip(&b.record)
                        .all(|((xk, xv), (yk, yv))| xk.deep_eq(yk) && xv.deep_eq(yv))
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<Table> for Value {
    fn from(v: Table) -> Self {
        Value::Table(v.into_ref())
    }
}

impl From<TableRef> for Value {
    fn from(v: TableRef) -> Self {
        Value::Table(v)
    }
}
