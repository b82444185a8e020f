//! Client lifecycle and per-command request/response handling.
//!
//! A [`Client`] is a synchronous, single-threaded resource over one
//! connection. It starts disconnected, connects lazily on the first command,
//! and moves between three states: `disconnected`, `connected`, and the
//! terminal `closed`. A recoverable I/O failure drops the socket and returns
//! to `disconnected` when `reconnect` is configured; otherwise the client
//! latches `closed`.
//!
//! Commands share one skeleton: validate arguments, build the request
//! header and extras, scatter-send header + key + value, then receive and
//! interpret one response frame. The `KEY_ENOENT`, `KEY_EEXISTS`, and
//! `DELTA_BADVAL` statuses are first-class outcomes, not errors.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use memcache_codec::{Buffer, Value};
use memcache_proto::{
    counter_extras, flush_extras, store_extras, Opcode, RequestHeader, ResponseHeader, Status,
    HEADER_SIZE,
};

use crate::conn::Conn;
use crate::error::Error;

/// Value encoder hook: value in, encoded buffer out. The buffer's contents
/// become the stored payload verbatim.
pub type EncodeFn = Rc<dyn Fn(&Value) -> Result<Buffer, memcache_codec::Error>>;

/// Value decoder hook: stored payload in, value out.
pub type DecodeFn = Rc<dyn Fn(&[u8]) -> Result<Value, memcache_codec::Error>>;

/// Client configuration. All fields have defaults.
#[derive(Clone)]
pub struct Config {
    /// DNS name or literal IP.
    pub host: String,
    /// Port number or service name.
    pub port: String,
    /// Connect timeout. Must be non-zero.
    pub timeout: Duration,
    /// If true, an I/O error leaves the client disconnected (a later
    /// command reconnects); if false, the client closes.
    pub reconnect: bool,
    /// Value encoder used by the store commands.
    pub encode: EncodeFn,
    /// Value decoder used by `get`.
    pub decode: DecodeFn,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: "11211".to_string(),
            timeout: Duration::from_millis(1000),
            reconnect: true,
            encode: Rc::new(memcache_codec::encode),
            decode: Rc::new(memcache_codec::decode),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        if self.timeout.is_zero() {
            return Err(Error::BadTimeout);
        }
        Ok(())
    }
}

/// One received response frame, segments split out.
struct Frame {
    status: Status,
    cas: u64,
    key: Bytes,
    value: Buffer,
}

/// A blocking memcache client over a single lazily-established connection.
pub struct Client {
    config: Config,
    conn: Option<Conn>,
    closed: bool,
}

impl Client {
    /// Create a client. No connection is made until the first command.
    pub fn open(config: Config) -> Result<Client, Error> {
        config.validate()?;
        Ok(Client {
            config,
            conn: None,
            closed: false,
        })
    }

    // -- Commands ------------------------------------------------------------

    /// Fetch and decode a value. Returns the value and its CAS token, or
    /// `None` on a cache miss.
    pub fn get(&mut self, key: impl AsRef<[u8]>) -> Result<Option<(Value, u64)>, Error> {
        let key = key.as_ref();
        check_key(key)?;
        let header = RequestHeader::with_body(Opcode::Get, 0, key.len() as u16, 0);
        let frame = self.round_trip(&[&header.to_bytes(), key])?;
        match frame.status {
            Status::NoError => {
                let decode = self.config.decode.clone();
                let value = decode(frame.value.as_slice())?;
                Ok(Some((value, frame.cas)))
            }
            Status::KeyNotFound => Ok(None),
            status => Err(Error::Server(status)),
        }
    }

    /// Store a value unconditionally. Returns the new CAS token, or `None`
    /// when a CAS precondition failed. Storing [`Value::Nil`] deletes the
    /// key instead (still honoring `cas`).
    pub fn set(&mut self, key: impl AsRef<[u8]>, value: &Value) -> Result<Option<u64>, Error> {
        self.store(Opcode::Set, key.as_ref(), value, 0, 0)
    }

    /// [`set`](Client::set) with explicit expiration (seconds) and CAS token
    /// (`0` means no CAS check).
    pub fn set_with(
        &mut self,
        key: impl AsRef<[u8]>,
        value: &Value,
        expiration: u32,
        cas: u64,
    ) -> Result<Option<u64>, Error> {
        self.store(Opcode::Set, key.as_ref(), value, expiration, cas)
    }

    /// Store only if the key does not exist. `None` means it already did.
    pub fn add(&mut self, key: impl AsRef<[u8]>, value: &Value) -> Result<Option<u64>, Error> {
        self.store(Opcode::Add, key.as_ref(), value, 0, 0)
    }

    /// [`add`](Client::add) with explicit expiration and CAS token.
    pub fn add_with(
        &mut self,
        key: impl AsRef<[u8]>,
        value: &Value,
        expiration: u32,
        cas: u64,
    ) -> Result<Option<u64>, Error> {
        self.store(Opcode::Add, key.as_ref(), value, expiration, cas)
    }

    /// Store only if the key exists. `None` means it did not.
    pub fn replace(&mut self, key: impl AsRef<[u8]>, value: &Value) -> Result<Option<u64>, Error> {
        self.store(Opcode::Replace, key.as_ref(), value, 0, 0)
    }

    /// [`replace`](Client::replace) with explicit expiration and CAS token.
    pub fn replace_with(
        &mut self,
        key: impl AsRef<[u8]>,
        value: &Value,
        expiration: u32,
        cas: u64,
    ) -> Result<Option<u64>, Error> {
        self.store(Opcode::Replace, key.as_ref(), value, expiration, cas)
    }

    /// Increment a counter by 1, seeding it with 1 if absent. Returns the
    /// new value, or `None` if the stored value is not numeric.
    pub fn inc(&mut self, key: impl AsRef<[u8]>) -> Result<Option<u64>, Error> {
        self.counter(Opcode::Increment, key.as_ref(), 1, 1, 0)
    }

    /// Increment with explicit delta, initial value, and expiration.
    pub fn inc_with(
        &mut self,
        key: impl AsRef<[u8]>,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<Option<u64>, Error> {
        self.counter(Opcode::Increment, key.as_ref(), delta, initial, expiration)
    }

    /// Decrement a counter by 1, seeding it with 1 if absent.
    pub fn dec(&mut self, key: impl AsRef<[u8]>) -> Result<Option<u64>, Error> {
        self.counter(Opcode::Decrement, key.as_ref(), 1, 1, 0)
    }

    /// Decrement with explicit delta, initial value, and expiration.
    pub fn dec_with(
        &mut self,
        key: impl AsRef<[u8]>,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<Option<u64>, Error> {
        self.counter(Opcode::Decrement, key.as_ref(), delta, initial, expiration)
    }

    /// Invalidate all items now.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.flush_with(0)
    }

    /// Invalidate all items `expiration` seconds from now.
    pub fn flush_with(&mut self, expiration: u32) -> Result<(), Error> {
        let extras = flush_extras(expiration);
        let header = RequestHeader::with_body(Opcode::Flush, extras.len() as u8, 0, 0);
        let frame = self.round_trip(&[&header.to_bytes(), &extras])?;
        match frame.status {
            Status::NoError => Ok(()),
            status => Err(Error::Server(status)),
        }
    }

    /// Collect server statistics, optionally for one subsystem (e.g.
    /// `items`). The server streams key/value frames; the frame with an
    /// empty key terminates the stream.
    pub fn stats(&mut self, key: Option<&[u8]>) -> Result<BTreeMap<String, String>, Error> {
        if let Some(key) = key {
            check_key(key)?;
        }
        let key = key.unwrap_or(&[]);
        let header = RequestHeader::with_body(Opcode::Stat, 0, key.len() as u16, 0);
        self.send(&[&header.to_bytes(), key])?;

        let mut entries = BTreeMap::new();
        loop {
            let frame = self.recv_frame()?;
            if !frame.status.is_success() {
                return Err(Error::Server(frame.status));
            }
            if frame.key.is_empty() {
                if !frame.value.is_empty() {
                    return Err(Error::Protocol);
                }
                return Ok(entries);
            }
            entries.insert(
                String::from_utf8_lossy(&frame.key).into_owned(),
                String::from_utf8_lossy(frame.value.as_slice()).into_owned(),
            );
        }
    }

    /// Close the client. Idempotent: sends a best-effort quiet quit, closes
    /// the socket, and latches the terminal state.
    pub fn close(&mut self) {
        if self.closed && self.conn.is_none() {
            return;
        }
        self.closed = true;
        if let Some(conn) = self.conn.take() {
            // quiet quit gets no response; any send error is irrelevant here
            let quit = RequestHeader::new(Opcode::QuitQ).to_bytes();
            if let Err(e) = conn.send_vectored(&[&quit]) {
                tracing::debug!(error = %e, "quit on close failed");
            }
            tracing::debug!("connection closed");
        }
    }

    // -- Shared command plumbing ---------------------------------------------

    fn store(
        &mut self,
        opcode: Opcode,
        key: &[u8],
        value: &Value,
        expiration: u32,
        cas: u64,
    ) -> Result<Option<u64>, Error> {
        check_key(key)?;
        let frame = if value.is_nil() {
            if opcode != Opcode::Set {
                return Err(Error::ValueRequired);
            }
            // storing nil removes the key, with the same CAS semantics
            let mut header = RequestHeader::with_body(Opcode::Delete, 0, key.len() as u16, 0);
            header.cas = cas;
            self.round_trip(&[&header.to_bytes(), key])?
        } else {
            let encode = self.config.encode.clone();
            let payload = encode(value)?;
            if payload.len() > u32::MAX as usize - (8 + key.len()) {
                return Err(Error::EncodedValueTooLong);
            }
            let mut header =
                RequestHeader::with_body(opcode, 8, key.len() as u16, payload.len() as u32);
            header.cas = cas;
            let extras = store_extras(expiration);
            self.round_trip(&[&header.to_bytes(), &extras, key, payload.as_slice()])?
        };
        match frame.status {
            Status::NoError => Ok(Some(frame.cas)),
            Status::KeyNotFound | Status::KeyExists => Ok(None),
            status => Err(Error::Server(status)),
        }
    }

    fn counter(
        &mut self,
        opcode: Opcode,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<Option<u64>, Error> {
        check_key(key)?;
        if delta > i64::MAX as u64 {
            return Err(Error::BadDelta);
        }
        if initial > i64::MAX as u64 {
            return Err(Error::BadInitial);
        }
        let extras = counter_extras(delta, initial, expiration);
        let header = RequestHeader::with_body(opcode, extras.len() as u8, key.len() as u16, 0);
        let frame = self.round_trip(&[&header.to_bytes(), &extras, key])?;
        match frame.status {
            Status::NoError => {
                let value = frame.value.as_slice();
                let raw: [u8; 8] = value.try_into().map_err(|_| Error::Protocol)?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            Status::DeltaBadval => Ok(None),
            status => Err(Error::Server(status)),
        }
    }

    fn round_trip(&mut self, parts: &[&[u8]]) -> Result<Frame, Error> {
        self.send(parts)?;
        self.recv_frame()
    }

    fn send(&mut self, parts: &[&[u8]]) -> Result<(), Error> {
        self.ensure_connected()?;
        let Some(conn) = self.conn.as_ref() else {
            return Err(Error::Closed);
        };
        if let Err(e) = conn.send_vectored(parts) {
            self.downgrade();
            return Err(e);
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let Some(conn) = self.conn.as_ref() else {
            return Err(Error::Closed);
        };
        if let Err(e) = conn.recv_exact(buf) {
            self.downgrade();
            return Err(e);
        }
        Ok(())
    }

    /// Receive one response frame: header, then extras, key, and value
    /// segments. Extras are drained and dropped; no command here consumes
    /// response extras.
    fn recv_frame(&mut self) -> Result<Frame, Error> {
        let mut raw = [0u8; HEADER_SIZE];
        self.recv(&mut raw)?;
        let header = match ResponseHeader::parse(&raw) {
            Ok(header) => header,
            Err(e) => {
                // a desynchronized stream cannot be resumed
                self.downgrade();
                return Err(Error::BadResponse(e));
            }
        };

        let mut extras = vec![0u8; header.extras_length as usize];
        self.recv(&mut extras)?;
        let mut key = vec![0u8; header.key_length as usize];
        self.recv(&mut key)?;
        let mut value = vec![0u8; header.value_length()];
        self.recv(&mut value)?;

        Ok(Frame {
            status: header.status,
            cas: header.cas,
            key: Bytes::from(key),
            value: Buffer::from_vec(value),
        })
    }

    fn ensure_connected(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.conn.is_none() {
            self.conn = Some(Conn::connect(
                &self.config.host,
                &self.config.port,
                self.config.timeout,
            )?);
        }
        Ok(())
    }

    /// Drop the socket after a failure. With `reconnect` the client returns
    /// to `disconnected`; otherwise it latches `closed`.
    fn downgrade(&mut self) {
        self.conn = None;
        if !self.config.reconnect {
            self.closed = true;
        }
        tracing::warn!(
            reconnect = self.config.reconnect,
            "connection dropped after I/O failure"
        );
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.closed {
            "closed"
        } else if self.conn.is_some() {
            "connected"
        } else {
            "disconnected"
        };
        write!(f, "memcached [{state}]: {self:p}")
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_key(key: &[u8]) -> Result<(), Error> {
    if key.is_empty() || key.len() > u16::MAX as usize {
        return Err(Error::BadKeyLength);
    }
    Ok(())
}
