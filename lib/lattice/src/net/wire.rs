//! Primitive wire encodings: unsigned LEB128 for lengths, zig-zag LEB128 for
//! signed ids, and length-prefixed strings, blobs and serialized values.

use crate::error::{Error, Result};
use crate::net::serializer::Serializer;
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder};

/// Appends an unsigned LEB128 varint.
pub fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint from the head of `data`, returning the
/// value and the number of bytes consumed, or `None` if `data` is truncated.
pub fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 10 {
            break;
        }
        value |= ((byte & 0x7f) as u64) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

#[inline]
fn zigzag64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
fn unzigzag64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Cursor writing message bodies into a byte vector. Plain writes are
/// infallible; only serializer-backed writes can fail.
pub struct WireWriter<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> WireWriter<'a> {
    #[inline]
    pub fn new(out: &'a mut Vec<u8>) -> WireWriter<'a> {
        WireWriter { out }
    }

    #[inline]
    pub fn write_uvarint(&mut self, value: u64) {
        write_uvarint(self.out, value);
    }

    #[inline]
    pub fn write_varint32(&mut self, value: i32) {
        write_uvarint(self.out, zigzag64(value as i64));
    }

    #[inline]
    pub fn write_varint64(&mut self, value: i64) {
        write_uvarint(self.out, zigzag64(value));
    }

    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.out.push(value as u8);
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    #[inline]
    pub fn write_f64(&mut self, value: f64) {
        let mut scratch = [0u8; 8];
        BigEndian::write_f64(&mut scratch, value);
        self.out.extend_from_slice(&scratch);
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_uvarint(bytes.len() as u64);
        self.out.extend_from_slice(bytes);
    }

    #[inline]
    pub fn write_string(&mut self, text: &str) {
        self.write_bytes(text.as_bytes());
    }

    #[inline]
    pub fn write_opt_bytes(&mut self, bytes: &Option<Vec<u8>>) {
        match bytes {
            Some(bytes) => {
                self.write_bool(true);
                self.write_bytes(bytes);
            }
            None => self.write_bool(false),
        }
    }

    /// Writes a user value as a serializer-encoded, length-prefixed blob.
    pub fn write_value(&mut self, serializer: &dyn Serializer, value: &Value) -> Result<()> {
        let mut blob = Vec::new();
        serializer.encode(value, &mut blob)?;
        self.write_bytes(&blob);
        Ok(())
    }
}

/// Cursor reading message bodies. Every read fails with a protocol error on
/// truncated input rather than panicking.
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> WireReader<'a> {
        WireReader { data, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_uvarint(&mut self) -> Result<u64> {
        match read_uvarint(&self.data[self.pos..]) {
            Some((value, used)) => {
                self.pos += used;
                Ok(value)
            }
            None => Err(Error::protocol("truncated varint")),
        }
    }

    #[inline]
    pub fn read_varint32(&mut self) -> Result<i32> {
        let wide = unzigzag64(self.read_uvarint()?);
        if wide < i32::min_value() as i64 || wide > i32::max_value() as i64 {
            return Err(Error::protocol("varint32 out of range"));
        }
        Ok(wide as i32)
    }

    #[inline]
    pub fn read_varint64(&mut self) -> Result<i64> {
        Ok(unzigzag64(self.read_uvarint()?))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Protocol(format!("invalid bool byte {}", other))),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(Error::protocol("truncated byte"));
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        if self.remaining() < 8 {
            return Err(Error::protocol("truncated f64"));
        }
        let value = BigEndian::read_f64(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(value)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_uvarint()? as usize;
        if self.remaining() < len {
            return Err(Error::protocol("truncated blob"));
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| Error::protocol("invalid utf-8 string"))
    }

    pub fn read_opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        if self.read_bool()? {
            Ok(Some(self.read_bytes()?))
        } else {
            Ok(None)
        }
    }

    pub fn read_value(&mut self, serializer: &dyn Serializer) -> Result<Value> {
        let blob = self.read_bytes()?;
        serializer.decode(&blob)
    }
}
