//! JSON text codec, structurally equivalent to the binary form: maps key
//! members by field name, arrays are positional, types encode as objects
//! and `wrap` produces `[id, { ... }]`. Output is RFC 8259 with 4-space
//! indentation. Binary values are base64 text; the binary codec remains
//! the interoperable wire form.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::io::buffer::Buffer;

#[derive(Copy, Clone, Default)]
struct State {
    size: usize,
    index: usize,
    map: bool,
}

pub struct JsonEncoder<'a> {
    buffer: &'a mut Buffer,
    state: State,
    stack: Vec<State>,
    indent: String,
}

impl<'a> JsonEncoder<'a> {
    pub fn new(buffer: &'a mut Buffer) -> JsonEncoder<'a> {
        JsonEncoder {
            buffer,
            state: State::default(),
            stack: Vec::new(),
            indent: String::new(),
        }
    }

    fn newline(&self) -> &'static str {
        debug_assert!(self.state.index <= self.state.size);
        if self.state.index + 1 < self.state.size {
            ",\n"
        } else {
            "\n"
        }
    }

    fn push(&mut self, size: usize, map: bool) {
        self.stack.push(self.state);
        self.state = State { size, index: 0, map };
        self.indent = "    ".repeat(self.stack.len());
    }

    fn open(&mut self, name: Option<&str>, bracket: char, size: usize, map: bool) {
        if self.state.map {
            let name = name.expect("field name required inside a map");
            let line = format!("{}{}: {}\n", self.indent, quoted(name), bracket);
            self.buffer.append(line.as_bytes());
        } else {
            let line = format!("{}{}\n", self.indent, bracket);
            self.buffer.append(line.as_bytes());
        }

        self.push(size, map);
    }

    fn value(&mut self, name: Option<&str>, value: &str) {
        let line = if self.state.map {
            let name = name.expect("field name required inside a map");
            format!("{}{}: {}{}", self.indent, quoted(name), value, self.newline())
        } else {
            format!("{}{}{}", self.indent, value, self.newline())
        };

        self.buffer.append(line.as_bytes());
        self.state.index += 1;
    }
}

impl<'a> Encoder for JsonEncoder<'a> {
    fn is_binary(&self) -> bool {
        false
    }

    fn open_type(&mut self, name: Option<&str>, _id: i32, members: usize) -> Result<()> {
        self.open_map(name, members)
    }

    fn open_array(&mut self, name: Option<&str>, size: usize) -> Result<()> {
        self.open(name, '[', size, false);
        Ok(())
    }

    fn open_map(&mut self, name: Option<&str>, size: usize) -> Result<()> {
        self.open(name, '{', size, true);
        Ok(())
    }

    fn encode_bool(&mut self, name: Option<&str>, value: bool) -> Result<()> {
        self.value(name, if value { "true" } else { "false" });
        Ok(())
    }

    fn encode_i32(&mut self, name: Option<&str>, value: i32) -> Result<()> {
        self.value(name, &value.to_string());
        Ok(())
    }

    fn encode_i64(&mut self, name: Option<&str>, value: i64) -> Result<()> {
        self.value(name, &value.to_string());
        Ok(())
    }

    fn encode_f32(&mut self, name: Option<&str>, value: f32) -> Result<()> {
        self.value(name, &value.to_string());
        Ok(())
    }

    fn encode_f64(&mut self, name: Option<&str>, value: f64) -> Result<()> {
        self.value(name, &value.to_string());
        Ok(())
    }

    fn encode_string(&mut self, name: Option<&str>, value: &str) -> Result<()> {
        self.value(name, &quoted(value));
        Ok(())
    }

    fn encode_binary(&mut self, name: Option<&str>, value: &[u8]) -> Result<()> {
        self.value(name, &quoted(&BASE64.encode(value)));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        debug_assert_eq!(self.state.size, self.state.index);

        let map = self.state.map;
        self.state = self
            .stack
            .pop()
            .expect("close without a matching open");
        self.indent = "    ".repeat(self.stack.len());

        let bracket = if map { '}' } else { ']' };
        let line = format!("{}{}{}", self.indent, bracket, self.newline());
        self.buffer.append(line.as_bytes());
        self.state.index += 1;
        Ok(())
    }
}

fn quoted(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

pub struct JsonDecoder {
    root: Value,
    node: Option<Value>,
    index: usize,
    stack: Vec<(Option<Value>, usize)>,
}

impl JsonDecoder {
    pub fn new(data: &[u8]) -> Result<JsonDecoder> {
        let root =
            serde_json::from_slice(data).map_err(|err| Error::parse(err.to_string()))?;

        Ok(JsonDecoder {
            root,
            node: None,
            index: 0,
            stack: Vec::new(),
        })
    }

    /// The node a container open descends into.
    fn child(&self, name: Option<&str>) -> Result<Value> {
        match &self.node {
            None => Ok(self.root.clone()),
            Some(Value::Object(members)) => {
                let name = name.ok_or_else(|| Error::parse("unnamed member in object"))?;
                members
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::parse(format!("missing member {}", name)))
            }
            Some(Value::Array(items)) => items
                .get(self.index)
                .cloned()
                .ok_or_else(|| Error::parse("array index out of bounds")),
            _ => Err(Error::parse("not a container")),
        }
    }

    fn scalar(&mut self, name: Option<&str>) -> Result<Value> {
        let value = self.child(name)?;
        self.index += 1;
        Ok(value)
    }

    fn descend(&mut self, next: Value) {
        self.stack.push((self.node.take(), self.index));
        self.node = Some(next);
        self.index = 0;
    }
}

impl Decoder for JsonDecoder {
    fn open_type(&mut self, name: Option<&str>, _id: i32, members: usize) -> Result<()> {
        let size = self.open_map(name)?;
        if members != size {
            return Err(Error::parse(format!(
                "type has {} members, expected {}",
                size, members
            )));
        }
        Ok(())
    }

    fn open_array(&mut self, name: Option<&str>) -> Result<usize> {
        let next = self.child(name)?;
        let size = match &next {
            Value::Array(items) => items.len(),
            _ => return Err(Error::parse("expected an array")),
        };

        self.descend(next);
        Ok(size)
    }

    fn open_map(&mut self, name: Option<&str>) -> Result<usize> {
        let next = self.child(name)?;
        let size = match &next {
            Value::Object(members) => members.len(),
            _ => return Err(Error::parse("expected an object")),
        };

        self.descend(next);
        Ok(size)
    }

    fn decode_bool(&mut self, name: Option<&str>) -> Result<bool> {
        self.scalar(name)?
            .as_bool()
            .ok_or_else(|| Error::parse("expected a boolean"))
    }

    fn decode_i32(&mut self, name: Option<&str>) -> Result<i32> {
        Ok(self.decode_i64(name)? as i32)
    }

    fn decode_i64(&mut self, name: Option<&str>) -> Result<i64> {
        self.scalar(name)?
            .as_i64()
            .ok_or_else(|| Error::parse("expected an integer"))
    }

    fn decode_f32(&mut self, name: Option<&str>) -> Result<f32> {
        Ok(self.decode_f64(name)? as f32)
    }

    fn decode_f64(&mut self, name: Option<&str>) -> Result<f64> {
        self.scalar(name)?
            .as_f64()
            .ok_or_else(|| Error::parse("expected a number"))
    }

    fn decode_string(&mut self, name: Option<&str>) -> Result<String> {
        self.scalar(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::parse("expected a string"))
    }

    fn decode_binary(&mut self, name: Option<&str>) -> Result<Vec<u8>> {
        let text = self.decode_string(name)?;
        BASE64
            .decode(text.as_bytes())
            .map_err(|_| Error::parse("invalid base64"))
    }

    fn close(&mut self) -> Result<()> {
        let (node, index) = self
            .stack
            .pop()
            .ok_or_else(|| Error::parse("close without a matching open"))?;

        self.node = node;
        self.index = index + 1;
        Ok(())
    }

    fn more(&self) -> bool {
        // Only the binary form can report trailing bytes.
        false
    }

    fn peek(&self) -> Result<i32> {
        match &self.root {
            Value::Array(items) => items
                .first()
                .and_then(Value::as_i64)
                .map(|id| id as i32)
                .ok_or_else(|| Error::parse("data is not a wrapped type")),
            _ => Err(Error::parse("data is not a wrapped type")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_types::{sample, Sample};
    use crate::codec::{unwrap, wrap};

    #[test]
    fn test_text_shape() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = JsonEncoder::new(&mut buffer);
            encoder.open_map(Some(""), 3).unwrap();
            encoder.encode_string(Some("foo"), "bar").unwrap();
            encoder.open_array(Some("xyz"), 2).unwrap();
            encoder.encode_i32(None, 1).unwrap();
            encoder.encode_i32(None, 9).unwrap();
            encoder.close().unwrap();
            encoder.encode_bool(Some("xxx"), true).unwrap();
            encoder.close().unwrap();
        }

        let text = String::from_utf8(buffer.into_vec()).unwrap();
        let expected = "{\n    \"foo\": \"bar\",\n    \"xyz\": [\n        1,\n        9\n    ],\n    \"xxx\": true\n}\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_round_trip() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = JsonEncoder::new(&mut buffer);
            encoder.open_map(Some(""), 5).unwrap();
            encoder.encode_string(Some("foo"), "bar").unwrap();
            encoder.encode_bool(Some("xxx"), true).unwrap();
            encoder.encode_i32(Some("yyy"), 13).unwrap();
            encoder.encode_f64(Some("zzz"), 11.5).unwrap();
            encoder.open_array(Some("xyz"), 4).unwrap();
            for value in &[1, 9, 7, 1] {
                encoder.encode_i32(None, *value).unwrap();
            }
            encoder.close().unwrap();
            encoder.close().unwrap();
        }

        let mut decoder = JsonDecoder::new(buffer.as_slice()).unwrap();
        assert_eq!(decoder.open_map(Some("")).unwrap(), 5);
        assert_eq!(decoder.decode_string(Some("foo")).unwrap(), "bar");
        assert!(decoder.decode_bool(Some("xxx")).unwrap());
        assert_eq!(decoder.decode_i32(Some("yyy")).unwrap(), 13);
        assert_eq!(decoder.decode_f64(Some("zzz")).unwrap(), 11.5);
        assert_eq!(decoder.open_array(Some("xyz")).unwrap(), 4);
        assert_eq!(decoder.decode_i32(None).unwrap(), 1);
        assert_eq!(decoder.decode_i32(None).unwrap(), 9);
        assert_eq!(decoder.decode_i32(None).unwrap(), 7);
        assert_eq!(decoder.decode_i32(None).unwrap(), 1);
        decoder.close().unwrap();
        decoder.close().unwrap();
    }

    #[test]
    fn test_wrap_produces_id_and_object() {
        let value = sample();

        let mut buffer = Buffer::new();
        {
            let mut encoder = JsonEncoder::new(&mut buffer);
            wrap(&mut encoder, &value).unwrap();
        }

        let parsed: Value = serde_json::from_slice(buffer.as_slice()).unwrap();
        let items = parsed.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_i64(), Some(100));
        assert!(items[1].is_object());

        let mut decoder = JsonDecoder::new(buffer.as_slice()).unwrap();
        assert_eq!(decoder.peek().unwrap(), 100);

        let mut decoded = Sample::default();
        unwrap(&mut decoder, &mut decoded).unwrap();
        assert_eq!(decoded.label, value.label);
        assert_eq!(decoded.blob, value.blob);
        assert_eq!(decoded.count, value.count);
        assert_eq!(decoded.ratio.to_bits(), value.ratio.to_bits());
        assert_eq!(decoded.precise.to_bits(), value.precise.to_bits());
    }

    #[test]
    fn test_binary_values_are_base64() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = JsonEncoder::new(&mut buffer);
            encoder.open_map(Some(""), 1).unwrap();
            encoder.encode_binary(Some("blob"), &[0xde, 0xad]).unwrap();
            encoder.close().unwrap();
        }

        let parsed: Value = serde_json::from_slice(buffer.as_slice()).unwrap();
        assert_eq!(parsed["blob"].as_str(), Some("3q0="));
    }

    #[test]
    fn test_malformed_text() {
        assert!(JsonDecoder::new(b"{ not json").is_err());
    }
}
