//! Self-describing binary value codec for memcache storage.
//!
//! This crate serializes structured values — scalars plus table aggregates,
//! shared or cyclic — into a compact, versioned byte form and reconstructs
//! them faithfully, preserving aggregate identity through back-references.
//!
//! # Example
//!
//! ```
//! use memcache_codec::{decode, encode, Table, Value};
//!
//! let table = Table {
//!     array: vec![Value::Int(1), Value::from("two")],
//!     record: vec![(Value::from("pi"), Value::Float(3.14))],
//! };
//! let value = Value::from(table);
//! let buffer = encode(&value).unwrap();
//! let back = decode(buffer.as_slice()).unwrap();
//! assert!(back.deep_eq(&value));
//! ```

mod buffer;
mod codec;
mod error;
mod value;

pub use buffer::{Buffer, DEFAULT_MAX, INITIAL_CAPACITY};
pub use codec::{decode, decode_buffer, encode, MAX_DEPTH, VERSION_TAG};
pub use error::Error;
pub use value::{Table, TableRef, Value};
