//! Blocking memcache binary-protocol client with a pluggable value codec.
//!
//! The client speaks the binary protocol over a single TCP connection in a
//! strict request/response manner. Values are serialized with the
//! self-describing codec from [`memcache_codec`] by default; the `encode`
//! and `decode` hooks in [`Config`] swap in any other representation.
//!
//! # Example
//!
//! ```no_run
//! use memcache_client::{open, Config, Value};
//!
//! let mut client = open(Config::default()).unwrap();
//! let cas = client.set("greeting", &Value::from("hello")).unwrap();
//! assert!(cas.is_some());
//! let (value, _cas) = client.get("greeting").unwrap().unwrap();
//! assert!(value.deep_eq(&Value::from("hello")));
//! client.close();
//! ```

mod client;
mod conn;
mod error;

pub use client::{Client, Config, DecodeFn, EncodeFn};
pub use error::Error;

pub use memcache_codec::{decode, encode, Buffer, Table, TableRef, Value};
pub use memcache_proto::Status;

/// Create a client from a configuration. Connection is lazy: nothing is
/// resolved or dialed until the first command.
pub fn open(config: Config) -> Result<Client, Error> {
    Client::open(config)
}
