//! Versioned, self-describing binary encoding of [`Value`] trees.
//!
//! Every encoded buffer starts with the 4-byte version tag `"LM" F6 02`
//! (format version 2) followed by exactly one value. Multi-byte integers are
//! big-endian; floats are the big-endian binary64 layout. A one-byte tag
//! prefixes each value.
//!
//! Tables are encoded as a tag, an array count and a record count, then that
//! many key/value pairs. The counts start out as single bytes; if either
//! overflows its width once the pairs are written, the header is widened in
//! place to 16/32/64-bit counts and the pair payload shifted right. Table
//! *identity* is preserved through back-references: the first visit assigns
//! the table an ordinal, and later visits emit the ordinal instead of
//! re-encoding, which is also what makes cyclic tables round-trip.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::value::{Table, TableRef, Value};

/// Version tag prefixed to every encoded buffer: "LM" plus format version 2.
pub const VERSION_TAG: [u8; 4] = [0x4c, 0x4d, 0xf6, 0x02];

/// Maximum table nesting depth on either side of the codec.
pub const MAX_DEPTH: usize = 1000;

const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 65;
const TAG_FLOAT: u8 = 3;
const TAG_INT: u8 = 67;
const TAG_STR_LONG: u8 = 4;
const TAG_STR_SHORT: u8 = 68;
const TAG_TABLE8: u8 = 5;
const TAG_TABLE16: u8 = 21;
const TAG_TABLE32: u8 = 37;
const TAG_TABLE64: u8 = 53;
const TAG_TABLE_REF: u8 = 69;

/// Encode a value into a fresh buffer, version tag included.
pub fn encode(value: &Value) -> Result<Buffer, Error> {
    let mut enc = Encoder {
        buf: Buffer::new(),
        refs: HashMap::new(),
        count: 0,
    };
    enc.buf.put_slice(&VERSION_TAG)?;
    enc.encode_value(value, 0)?;
    Ok(enc.buf)
}

/// Decode one value from raw bytes. The entire input must be consumed.
pub fn decode(bytes: &[u8]) -> Result<Value, Error> {
    let mut dec = Decoder {
        reader: Reader {
            data: bytes,
            pos: 0,
        },
        tables: Vec::new(),
    };
    let tag = dec.reader.take(VERSION_TAG.len())?;
    if tag != VERSION_TAG {
        return Err(Error::BadCodecVersion);
    }
    let value = dec.decode_value(0)?;
    if dec.reader.pos < dec.reader.data.len() {
        return Err(Error::ExtraDataInBuffer);
    }
    Ok(value)
}

/// Decode one value from an encoded buffer.
pub fn decode_buffer(buffer: &Buffer) -> Result<Value, Error> {
    decode(buffer.as_slice())
}

// -- Encoder -----------------------------------------------------------------

struct Encoder {
    buf: Buffer,
    /// Table identity -> 1-based ordinal, keyed on the shared allocation.
    refs: HashMap<*const RefCell<Table>, i64>,
    count: i64,
}

impl Encoder {
    fn encode_value(&mut self, value: &Value, depth: usize) -> Result<(), Error> {
        match value {
            Value::Nil => Err(Error::UnsupportedType),
            Value::Bool(v) => self.buf.put_u8(if *v { TAG_TRUE } else { TAG_FALSE }),
            Value::Int(v) => {
                self.buf.put_u8(TAG_INT)?;
                self.buf.put_i64_be(*v)
            }
            Value::Float(v) => {
                self.buf.put_u8(TAG_FLOAT)?;
                self.buf.put_slice(&v.to_be_bytes())
            }
            Value::Str(s) => {
                if s.len() as u64 > u64::MAX - (1 + 8) {
                    return Err(Error::StringTooLong);
                }
                if s.len() <= u8::MAX as usize {
                    self.buf.put_u8(TAG_STR_SHORT)?;
                    self.buf.put_u8(s.len() as u8)?;
                } else {
                    self.buf.put_u8(TAG_STR_LONG)?;
                    self.buf.put_u64_be(s.len() as u64)?;
                }
                self.buf.put_slice(s)
            }
            Value::Table(t) => self.encode_table(t, depth),
        }
    }

    fn encode_table(&mut self, table: &TableRef, depth: usize) -> Result<(), Error> {
        if depth >= MAX_DEPTH {
            return Err(Error::DepthLimitExceeded);
        }

        // already encoded? emit a back-reference instead
        if let Some(&ordinal) = self.refs.get(&Rc::as_ptr(table)) {
            self.buf.put_u8(TAG_TABLE_REF)?;
            return self.buf.put_i64_be(ordinal);
        }

        // record the ordinal before recursing so cycles resolve
        if self.count == i64::MAX {
            return Err(Error::TooManyTables);
        }
        self.count += 1;
        self.refs.insert(Rc::as_ptr(table), self.count);

        // tag plus two placeholder bytes for the 8-bit size class
        self.buf.put_u8(TAG_TABLE8)?;
        let size_pos = self.buf.pos();
        self.buf.put_slice(&[0, 0])?;

        let mut narr: i64 = 0;
        let mut nrec: i64 = 0;
        let t = table.borrow();
        for (i, v) in t.array.iter().enumerate() {
            if !v.supported() {
                continue;
            }
            let key = Value::Int(i as i64 + 1);
            self.encode_pair(&key, v, &mut narr, &mut nrec, depth)?;
        }
        for (k, v) in &t.record {
            if !k.supported() || !v.supported() {
                continue;
            }
            self.encode_pair(k, v, &mut narr, &mut nrec, depth)?;
        }
        drop(t);

        self.patch_sizes(size_pos, narr, nrec)
    }

    /// Classify one surviving entry into the array or record count, then
    /// emit its key and value.
    fn encode_pair(
        &mut self,
        key: &Value,
        value: &Value,
        narr: &mut i64,
        nrec: &mut i64,
        depth: usize,
    ) -> Result<(), Error> {
        let consecutive = *nrec == 0 && matches!(key, Value::Int(k) if Some(*k) == narr.checked_add(1));
        if consecutive {
            if *narr == i64::MAX {
                return Err(Error::TooManyArrayElements);
            }
            *narr += 1;
        } else {
            if *nrec == i64::MAX {
                return Err(Error::TooManyRecordElements);
            }
            *nrec += 1;
        }
        self.encode_value(key, depth + 1)?;
        self.encode_value(value, depth + 1)
    }

    /// Write the final counts, widening the reserved 2-byte header in place
    /// when either count needs a larger size class.
    fn patch_sizes(&mut self, size_pos: usize, narr: i64, nrec: i64) -> Result<(), Error> {
        if narr <= u8::MAX as i64 && nrec <= u8::MAX as i64 {
            self.buf.patch(size_pos, &[narr as u8, nrec as u8]);
        } else if narr <= u16::MAX as i64 && nrec <= u16::MAX as i64 {
            self.buf.widen(size_pos + 2, 2)?;
            self.buf.patch(size_pos - 1, &[TAG_TABLE16]);
            self.buf.patch(size_pos, &(narr as u16).to_be_bytes());
            self.buf.patch(size_pos + 2, &(nrec as u16).to_be_bytes());
        } else if narr <= u32::MAX as i64 && nrec <= u32::MAX as i64 {
            self.buf.widen(size_pos + 2, 6)?;
            self.buf.patch(size_pos - 1, &[TAG_TABLE32]);
            self.buf.patch(size_pos, &(narr as u32).to_be_bytes());
            self.buf.patch(size_pos + 4, &(nrec as u32).to_be_bytes());
        } else {
            self.buf.widen(size_pos + 2, 14)?;
            self.buf.patch(size_pos - 1, &[TAG_TABLE64]);
            self.buf.patch(size_pos, &narr.to_be_bytes());
            self.buf.patch(size_pos + 8, &nrec.to_be_bytes());
        }
        Ok(())
    }
}

// -- Decoder -----------------------------------------------------------------

/// Read cursor over borrowed input; no copies are made until values are
/// materialized.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, cnt: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(cnt)
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::BufferUnderflow)?;
        let v = &self.data[self.pos..end];
        self.pos = end;
        Ok(v)
    }

    fn take_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn take_u16_be(&mut self) -> Result<u16, Error> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(raw))
    }

    fn take_u32_be(&mut self) -> Result<u32, Error> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    fn take_i64_be(&mut self) -> Result<i64, Error> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }
}

struct Decoder<'a> {
    reader: Reader<'a>,
    /// i-th entry is the i-th table created during this decode.
    tables: Vec<TableRef>,
}

impl Decoder<'_> {
    fn decode_value(&mut self, depth: usize) -> Result<Value, Error> {
        match self.reader.take_u8()? {
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_FLOAT => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(self.reader.take(8)?);
                Ok(Value::Float(f64::from_be_bytes(raw)))
            }
            TAG_INT => Ok(Value::Int(self.reader.take_i64_be()?)),
            TAG_STR_LONG => {
                let len = self.reader.take_i64_be()? as u64;
                let len = usize::try_from(len).map_err(|_| Error::BufferUnderflow)?;
                Ok(Value::Str(bytes::Bytes::copy_from_slice(
                    self.reader.take(len)?,
                )))
            }
            TAG_STR_SHORT => {
                let len = self.reader.take_u8()? as usize;
                Ok(Value::Str(bytes::Bytes::copy_from_slice(
                    self.reader.take(len)?,
                )))
            }
            TAG_TABLE8 => {
                let narr = self.reader.take_u8()? as i64;
                let nrec = self.reader.take_u8()? as i64;
                self.decode_table(narr, nrec, depth)
            }
            TAG_TABLE16 => {
                let narr = self.reader.take_u16_be()? as i64;
                let nrec = self.reader.take_u16_be()? as i64;
                self.decode_table(narr, nrec, depth)
            }
            TAG_TABLE32 => {
                let narr = self.reader.take_u32_be()? as i64;
                let nrec = self.reader.take_u32_be()? as i64;
                self.decode_table(narr, nrec, depth)
            }
            TAG_TABLE64 => {
                let narr = self.reader.take_i64_be()?;
                let nrec = self.reader.take_i64_be()?;
                if narr < 0 || nrec < 0 {
                    return Err(Error::BadTableSize);
                }
                self.decode_table(narr, nrec, depth)
            }
            TAG_TABLE_REF => {
                let ordinal = self.reader.take_i64_be()?;
                if ordinal < 1 || ordinal as u64 > self.tables.len() as u64 {
                    return Err(Error::BadBackref);
                }
                Ok(Value::Table(self.tables[ordinal as usize - 1].clone()))
            }
            _ => Err(Error::UnsupportedType),
        }
    }

    fn decode_table(&mut self, narr: i64, nrec: i64, depth: usize) -> Result<Value, Error> {
        if depth >= MAX_DEPTH {
            return Err(Error::DepthLimitExceeded);
        }

        // register before decoding children so back-references into this
        // table (cycles included) resolve
        let table = Table {
            // counts are attacker-controlled; cap the pre-reservation
            array: Vec::with_capacity(narr.min(65536) as usize),
            record: Vec::with_capacity(nrec.min(65536) as usize),
        }
        .into_ref();
        self.tables.push(table.clone());

        for _ in 0..narr {
            let key = self.decode_value(depth + 1)?;
            let value = self.decode_value(depth + 1)?;
            let mut t = table.borrow_mut();
            // keys written by the encoder's array pass are consecutive from
            // 1; anything else lands in the record part
            match key {
                Value::Int(k) if k == t.array.len() as i64 + 1 => t.array.push(value),
                key => t.record.push((key, value)),
            }
        }
        for _ in 0..nrec {
            let key = self.decode_value(depth + 1)?;
            let value = self.decode_value(depth + 1)?;
            table.borrow_mut().record.push((key, value));
        }
        Ok(Value::Table(table))
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    fn roundtrip(v: &Value) -> Value {
        decode(encode(v).unwrap().as_slice()).unwrap()
    }

    #[test]
    fn encode_true_wire_bytes() {
        let b = encode(&Value::Bool(true)).unwrap();
        assert_eq!(b.as_slice(), &[0x4c, 0x4d, 0xf6, 0x02, 0x41]);
        assert!(roundtrip(&Value::Bool(true)).deep_eq(&Value::Bool(true)));
    }

    #[test]
    fn encode_false_wire_bytes() {
        let b = encode(&Value::Bool(false)).unwrap();
        assert_eq!(b.as_slice(), &[0x4c, 0x4d, 0xf6, 0x02, 0x01]);
    }

    #[test]
    fn encode_int_wire_bytes() {
        let b = encode(&Value::Int(1)).unwrap();
        assert_eq!(
            b.as_slice(),
            &[0x4c, 0x4d, 0xf6, 0x02, 0x43, 0, 0, 0, 0, 0, 0, 0, 1]
        );
        assert!(roundtrip(&Value::Int(1)).deep_eq(&Value::Int(1)));
    }

    #[test]
    fn encode_short_string_wire_bytes() {
        let b = encode(&Value::from("test")).unwrap();
        assert_eq!(
            b.as_slice(),
            &[0x4c, 0x4d, 0xf6, 0x02, 0x44, 0x04, 0x74, 0x65, 0x73, 0x74]
        );
        assert!(roundtrip(&Value::from("test")).deep_eq(&Value::from("test")));
    }

    #[test]
    fn long_string_uses_8_byte_length() {
        let s = Value::Str(bytes::Bytes::from(vec![0x61u8; 256]));
        let b = encode(&s).unwrap();
        assert_eq!(b.as_slice()[4], TAG_STR_LONG);
        assert_eq!(&b.as_slice()[5..13], &256u64.to_be_bytes());
        assert!(roundtrip(&s).deep_eq(&s));
    }

    #[test]
    fn scalar_roundtrips() {
        for v in [
            Value::Int(i64::MIN),
            Value::Int(i64::MAX),
            Value::Int(-1),
            Value::Float(0.5),
            Value::Float(f64::NAN),
            Value::Float(f64::NEG_INFINITY),
            Value::str(""),
        ] {
            assert!(roundtrip(&v).deep_eq(&v), "{v:?}");
        }
    }

    #[test]
    fn simple_table_roundtrips() {
        let t = Table {
            array: vec![Value::Int(10), Value::str("x")],
            record: vec![
                (Value::str("k"), Value::Bool(true)),
                (Value::Float(2.5), Value::Int(7)),
            ],
        };
        let v = Value::from(t);
        assert!(roundtrip(&v).deep_eq(&v));
    }

    #[test]
    fn small_table_header_is_three_bytes() {
        let t = Table {
            array: vec![Value::Bool(true)],
            record: vec![],
        };
        let b = encode(&Value::from(t)).unwrap();
        // version, TABLE8, narr=1, nrec=0, key Int(1), value true
        assert_eq!(b.as_slice()[4..7], [TAG_TABLE8, 1, 0]);
    }

    #[test]
    fn size_class_boundaries_on_array_side() {
        let entries = |n: usize| Table {
            array: vec![Value::Bool(true); n],
            record: vec![],
        };

        let b = encode(&Value::from(entries(255))).unwrap();
        assert_eq!(b.as_slice()[4], TAG_TABLE8);

        let b = encode(&Value::from(entries(256))).unwrap();
        assert_eq!(b.as_slice()[4], TAG_TABLE16);
        assert_eq!(&b.as_slice()[5..9], &[0x01, 0x00, 0x00, 0x00]);

        let b = encode(&Value::from(entries(65536))).unwrap();
        assert_eq!(b.as_slice()[4], TAG_TABLE32);
        assert_eq!(
            &b.as_slice()[5..13],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn size_class_boundaries_on_record_side() {
        let entries = |n: i64| Table {
            array: vec![],
            record: (0..n)
                .map(|i| (Value::str(format!("k{i}")), Value::Int(i)))
                .collect(),
        };

        let b = encode(&Value::from(entries(255))).unwrap();
        assert_eq!(b.as_slice()[4], TAG_TABLE8);
        assert_eq!(&b.as_slice()[5..7], &[0, 255]);

        let b = encode(&Value::from(entries(256))).unwrap();
        assert_eq!(b.as_slice()[4], TAG_TABLE16);
        assert_eq!(&b.as_slice()[5..9], &[0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn widened_table_still_roundtrips() {
        let t = Table {
            array: (0..300).map(Value::Int).collect(),
            record: vec![(Value::str("k"), Value::str("v"))],
        };
        let v = Value::from(t);
        assert!(roundtrip(&v).deep_eq(&v));
    }

    #[test]
    fn nil_entries_are_dropped() {
        let t = Table {
            array: vec![Value::Int(1), Value::Nil, Value::Int(3)],
            record: vec![
                (Value::str("keep"), Value::Int(1)),
                (Value::str("drop"), Value::Nil),
                (Value::Nil, Value::Int(2)),
            ],
        };
        let out = roundtrip(&Value::from(t));
        let Value::Table(out) = out else {
            panic!("expected table")
        };
        let out = out.borrow();
        // the nil at index 2 breaks the consecutive run: Int(3) keeps its
        // original key 3 and moves to the record part
        assert_eq!(out.array.len(), 1);
        assert!(out.array[0].deep_eq(&Value::Int(1)));
        assert_eq!(out.record.len(), 2);
        assert!(out.record[0].0.deep_eq(&Value::Int(3)));
        assert!(out.record[0].1.deep_eq(&Value::Int(3)));
        assert!(out.record[1].0.deep_eq(&Value::str("keep")));
    }

    #[test]
    fn top_level_nil_is_unsupported() {
        assert!(matches!(encode(&Value::Nil), Err(Error::UnsupportedType)));
    }

    #[test]
    fn shared_table_identity_survives() {
        let shared = Table {
            array: vec![Value::Int(42)],
            record: vec![],
        }
        .into_ref();
        let outer = Table {
            array: vec![Value::Table(shared.clone()), Value::Table(shared)],
            record: vec![],
        };

        let out = roundtrip(&Value::from(outer));
        let Value::Table(out) = out else {
            panic!("expected table")
        };
        let out = out.borrow();
        let (Value::Table(a), Value::Table(b)) = (&out.array[0], &out.array[1]) else {
            panic!("expected two tables")
        };
        assert!(Rc::ptr_eq(a, b));
        assert!(a.borrow().array[0].deep_eq(&Value::Int(42)));
    }

    #[test]
    fn mutual_cycle_resolves() {
        // a = {x=1}, b = {y=2}, a.other = b, b.other = a
        let a = Table {
            array: vec![],
            record: vec![(Value::str("x"), Value::Int(1))],
        }
        .into_ref();
        let b = Table {
            array: vec![],
            record: vec![(Value::str("y"), Value::Int(2))],
        }
        .into_ref();
        a.borrow_mut()
            .record
            .push((Value::str("other"), Value::Table(b.clone())));
        b.borrow_mut()
            .record
            .push((Value::str("other"), Value::Table(a.clone())));

        let out = roundtrip(&Value::Table(a.clone()));
        let Value::Table(a2) = out else {
            panic!("expected table")
        };
        {
            let a2b = a2.borrow();
            assert!(a2b.record[0].1.deep_eq(&Value::Int(1)));
            let Value::Table(b2) = &a2b.record[1].1 else {
                panic!("expected table")
            };
            let b2b = b2.borrow();
            assert!(b2b.record[0].1.deep_eq(&Value::Int(2)));
            let Value::Table(back) = &b2b.record[1].1 else {
                panic!("expected table")
            };
            assert!(Rc::ptr_eq(back, &a2));
        }

        // break the cycles so the Rc graphs can drop
        a.borrow_mut().record.clear();
        b.borrow_mut().record.clear();
        a2.borrow_mut().record.clear();
    }

    #[test]
    fn self_cycle_resolves() {
        let t = Table::new().into_ref();
        t.borrow_mut()
            .record
            .push((Value::str("me"), Value::Table(t.clone())));

        let out = roundtrip(&Value::Table(t.clone()));
        let Value::Table(t2) = out else {
            panic!("expected table")
        };
        {
            let inner = t2.borrow();
            let Value::Table(me) = &inner.record[0].1 else {
                panic!("expected table")
            };
            assert!(Rc::ptr_eq(me, &t2));
        }

        t.borrow_mut().record.clear();
        t2.borrow_mut().record.clear();
    }

    #[test]
    fn bad_version_rejected() {
        assert!(matches!(decode(b"XX\xf6\x02\x41"), Err(Error::BadCodecVersion)));
        assert!(matches!(decode(b"LM\xf6\x03\x41"), Err(Error::BadCodecVersion)));
        assert!(matches!(decode(b"LM"), Err(Error::BufferUnderflow)));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode(&Value::Bool(true)).unwrap().into_vec();
        bytes.push(0x00);
        assert!(matches!(decode(&bytes), Err(Error::ExtraDataInBuffer)));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(decode(b"LM\xf6\x02\xff"), Err(Error::UnsupportedType)));
    }

    #[test]
    fn out_of_range_backref_rejected() {
        let mut bytes = VERSION_TAG.to_vec();
        bytes.push(TAG_TABLE_REF);
        bytes.extend_from_slice(&1i64.to_be_bytes());
        assert!(matches!(decode(&bytes), Err(Error::BadBackref)));
    }

    #[test]
    fn negative_64_bit_size_rejected() {
        let mut bytes = VERSION_TAG.to_vec();
        bytes.push(TAG_TABLE64);
        bytes.extend_from_slice(&(-1i64).to_be_bytes());
        bytes.extend_from_slice(&0i64.to_be_bytes());
        assert!(matches!(decode(&bytes), Err(Error::BadTableSize)));
    }

    #[test]
    fn truncated_table_rejected() {
        let mut bytes = VERSION_TAG.to_vec();
        bytes.extend_from_slice(&[TAG_TABLE8, 3, 0]);
        assert!(matches!(decode(&bytes), Err(Error::BufferUnderflow)));
    }

    #[test]
    fn nesting_limit_enforced() {
        let mut v = Value::table();
        for _ in 0..MAX_DEPTH {
            v = Value::from(Table {
                array: vec![v],
                record: vec![],
            });
        }
        assert!(matches!(encode(&v), Err(Error::DepthLimitExceeded)));
    }

    #[test]
    fn reencode_is_bit_exact() {
        let t = Table {
            array: vec![Value::Int(1), Value::str("two")],
            record: vec![(Value::str("k"), Value::Float(3.5))],
        };
        let v = Value::from(t);
        let first = encode(&v).unwrap();
        let second = encode(&roundtrip(&v)).unwrap();
        assert_eq!(first.as_slice(), second.as_slice());
    }
}
