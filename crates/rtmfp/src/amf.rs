// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal AMF0 value codec.
//!
//! The protocol engine treats AMF as an opaque value reader/writer: it needs
//! command names, callback handles and a handful of object properties
//! (`tcUrl`, `objectEncoding`), plus the ability to re-emit what it read when
//! rewriting messages in middle mode. Only the AMF0 types that appear in
//! NetConnection/NetStream command messages are implemented.

use crate::codec::Cursor;
use crate::{Error, Result};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_LONG_STRING: u8 = 0x0c;

/// A decoded AMF0 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    String(String),
    /// Anonymous object: ordered name/value pairs.
    Object(Vec<(String, Value)>),
    /// ECMA array; encoded with a count prefix but otherwise like an object.
    EcmaArray(Vec<(String, Value)>),
    Null,
    Undefined,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Property lookup on objects and ECMA arrays.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(props) | Value::EcmaArray(props) => {
                props.iter().find(|(name, _)| name == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Replace or insert a property on objects and ECMA arrays; no-op on
    /// other value kinds.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Value::Object(props) | Value::EcmaArray(props) = self {
            match props.iter_mut().find(|(name, _)| name == key) {
                Some((_, slot)) => *slot = value,
                None => props.push((key.to_string(), value)),
            }
        }
    }
}

/// Streaming AMF0 reader over a byte slice.
pub struct Reader<'a> {
    cur: Cursor<'a>,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(data),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cur.is_empty()
    }

    /// Decode the next value.
    pub fn read(&mut self) -> Result<Value> {
        let marker = self.cur.read_u8("amf marker")?;
        match marker {
            MARKER_NUMBER => {
                let bytes = self.cur.read_bytes(8, "amf number")?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Value::Number(f64::from_be_bytes(raw)))
            }
            MARKER_BOOLEAN => Ok(Value::Boolean(self.cur.read_u8("amf boolean")? != 0)),
            MARKER_STRING => {
                let bytes = self.cur.read_string16("amf string")?;
                Ok(Value::String(utf8(bytes)?))
            }
            MARKER_LONG_STRING => {
                let len = self.cur.read_u32("amf long string")? as usize;
                let bytes = self.cur.read_bytes(len, "amf long string")?;
                Ok(Value::String(utf8(bytes)?))
            }
            MARKER_OBJECT => Ok(Value::Object(self.read_properties()?)),
            MARKER_ECMA_ARRAY => {
                // The count is advisory; the end marker is authoritative.
                self.cur.skip(4, "amf array count")?;
                Ok(Value::EcmaArray(self.read_properties()?))
            }
            MARKER_NULL => Ok(Value::Null),
            MARKER_UNDEFINED => Ok(Value::Undefined),
            _ => Err(Error::Amf("unsupported marker")),
        }
    }

    fn read_properties(&mut self) -> Result<Vec<(String, Value)>> {
        let mut props = Vec::new();
        loop {
            let name = self.cur.read_string16("amf property name")?;
            if name.is_empty() {
                let end = self.cur.read_u8("amf object end")?;
                if end != MARKER_OBJECT_END {
                    return Err(Error::Amf("missing object end"));
                }
                return Ok(props);
            }
            let value = self.read()?;
            props.push((utf8(name)?, value));
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Amf("invalid utf-8 string"))
}

/// Streaming AMF0 writer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, value: &Value) {
        match value {
            Value::Number(n) => {
                self.buf.push(MARKER_NUMBER);
                self.buf.extend_from_slice(&n.to_be_bytes());
            }
            Value::Boolean(b) => {
                self.buf.push(MARKER_BOOLEAN);
                self.buf.push(u8::from(*b));
            }
            Value::String(s) => {
                if s.len() > u16::MAX as usize {
                    self.buf.push(MARKER_LONG_STRING);
                    self.buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                } else {
                    self.buf.push(MARKER_STRING);
                    self.buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
                }
                self.buf.extend_from_slice(s.as_bytes());
            }
            Value::Object(props) => {
                self.buf.push(MARKER_OBJECT);
                self.write_properties(props);
            }
            Value::EcmaArray(props) => {
                self.buf.push(MARKER_ECMA_ARRAY);
                self.buf.extend_from_slice(&(props.len() as u32).to_be_bytes());
                self.write_properties(props);
            }
            Value::Null => self.buf.push(MARKER_NULL),
            Value::Undefined => self.buf.push(MARKER_UNDEFINED),
        }
    }

    fn write_properties(&mut self, props: &[(String, Value)]) {
        for (name, value) in props {
            self.buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
            self.buf.extend_from_slice(name.as_bytes());
            self.write(value);
        }
        self.buf.extend_from_slice(&[0, 0, MARKER_OBJECT_END]);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Build the conventional `{level, code, description}` status object.
pub fn status(level: &str, code: &str, description: &str) -> Value {
    Value::Object(vec![
        ("level".to_string(), Value::String(level.to_string())),
        ("code".to_string(), Value::String(code.to_string())),
        (
            "description".to_string(),
            Value::String(description.to_string()),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Value) -> Value {
        let mut writer = Writer::new();
        writer.write(value);
        let bytes = writer.into_bytes();
        Reader::new(&bytes).read().unwrap()
    }

    #[test]
    fn scalar_round_trips() {
        assert_eq!(round_trip(&Value::Number(1935.0)), Value::Number(1935.0));
        assert_eq!(round_trip(&Value::Boolean(true)), Value::Boolean(true));
        assert_eq!(
            round_trip(&Value::String("connect".into())),
            Value::String("connect".into())
        );
        assert_eq!(round_trip(&Value::Null), Value::Null);
    }

    #[test]
    fn object_preserves_order_and_lookup() {
        let obj = Value::Object(vec![
            ("app".to_string(), Value::String("live".into())),
            ("tcUrl".to_string(), Value::String("rtmfp://host/live".into())),
            ("objectEncoding".to_string(), Value::Number(3.0)),
        ]);
        let read = round_trip(&obj);
        assert_eq!(read, obj);
        assert_eq!(
            read.get("tcUrl").and_then(Value::as_str),
            Some("rtmfp://host/live")
        );
    }

    #[test]
    fn set_replaces_in_place() {
        let mut obj = Value::Object(vec![(
            "tcUrl".to_string(),
            Value::String("rtmfp://orig/".into()),
        )]);
        obj.set("tcUrl", Value::String("rtmfp://middle/".into()));
        assert_eq!(
            obj.get("tcUrl").and_then(Value::as_str),
            Some("rtmfp://middle/")
        );
    }

    #[test]
    fn reader_consumes_value_sequence() {
        let mut writer = Writer::new();
        writer.write(&Value::String("setPeerInfo".into()));
        writer.write(&Value::Number(2.0));
        writer.write(&Value::Null);
        writer.write(&Value::String("192.168.1.2:50000".into()));
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read().unwrap().as_str(), Some("setPeerInfo"));
        assert_eq!(reader.read().unwrap().as_number(), Some(2.0));
        assert_eq!(reader.read().unwrap(), Value::Null);
        assert_eq!(reader.read().unwrap().as_str(), Some("192.168.1.2:50000"));
        assert!(reader.is_empty());
    }

    #[test]
    fn truncated_input_is_an_error() {
        let bytes = [MARKER_STRING, 0x00, 0x10, b'a'];
        assert!(Reader::new(&bytes).read().is_err());
    }
}
