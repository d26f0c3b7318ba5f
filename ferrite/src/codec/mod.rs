//! Uniform encode/decode over scalars, strings, binaries, arrays, maps
//! and composite types, with two concrete wire forms: the compact binary
//! format in [`binary`] (the interoperable one) and the structurally
//! equivalent JSON text in [`json`].
//!
//! Field names are advisory: the JSON form keys map members by name, the
//! binary form ignores names entirely and relies on declaration order.

pub mod binary;
pub mod json;

pub use binary::{BinaryDecoder, BinaryEncoder};
pub use json::{JsonDecoder, JsonEncoder};

use crate::error::{Error, Result};

/// A composite record with a 32-bit id and a fixed member count. Encodes
/// its members in declaration order.
pub trait Type {
    fn id(&self) -> i32;
    fn member_count(&self) -> usize;

    fn encode(&self, encoder: &mut dyn Encoder) -> Result<()>;
    fn decode(&mut self, decoder: &mut dyn Decoder) -> Result<()>;
}

pub trait Encoder {
    fn is_binary(&self) -> bool;

    fn open_type(&mut self, name: Option<&str>, id: i32, members: usize) -> Result<()>;
    fn open_array(&mut self, name: Option<&str>, size: usize) -> Result<()>;
    fn open_map(&mut self, name: Option<&str>, size: usize) -> Result<()>;
    fn encode_bool(&mut self, name: Option<&str>, value: bool) -> Result<()>;
    fn encode_i32(&mut self, name: Option<&str>, value: i32) -> Result<()>;
    fn encode_i64(&mut self, name: Option<&str>, value: i64) -> Result<()>;
    fn encode_f32(&mut self, name: Option<&str>, value: f32) -> Result<()>;
    fn encode_f64(&mut self, name: Option<&str>, value: f64) -> Result<()>;
    fn encode_string(&mut self, name: Option<&str>, value: &str) -> Result<()>;
    fn encode_binary(&mut self, name: Option<&str>, value: &[u8]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

pub trait Decoder {
    fn open_type(&mut self, name: Option<&str>, id: i32, members: usize) -> Result<()>;
    fn open_array(&mut self, name: Option<&str>) -> Result<usize>;
    fn open_map(&mut self, name: Option<&str>) -> Result<usize>;
    fn decode_bool(&mut self, name: Option<&str>) -> Result<bool>;
    fn decode_i32(&mut self, name: Option<&str>) -> Result<i32>;
    fn decode_i64(&mut self, name: Option<&str>) -> Result<i64>;
    fn decode_f32(&mut self, name: Option<&str>) -> Result<f32>;
    fn decode_f64(&mut self, name: Option<&str>) -> Result<f64>;
    fn decode_string(&mut self, name: Option<&str>) -> Result<String>;
    fn decode_binary(&mut self, name: Option<&str>) -> Result<Vec<u8>>;
    fn close(&mut self) -> Result<()>;

    /// Whether unread bytes remain. Only meaningful for the binary form.
    fn more(&self) -> bool;

    /// The id of a wrapped type without advancing the cursor. The data
    /// must start with a `wrap` sequence.
    fn peek(&self) -> Result<i32>;
}

/// Encodes `[id, body]` so a reader can dispatch on [`Decoder::peek`].
pub fn wrap(encoder: &mut dyn Encoder, value: &dyn Type) -> Result<()> {
    encoder.open_array(None, 2)?;
    encoder.encode_i32(None, value.id())?;
    value.encode(encoder)?;
    encoder.close()
}

/// Mirror of [`wrap`]; the id on the wire must match `value.id()`.
pub fn unwrap(decoder: &mut dyn Decoder, value: &mut dyn Type) -> Result<()> {
    let size = decoder.open_array(None)?;
    if 2 != size {
        return Err(Error::parse(format!("wrapped type has {} elements", size)));
    }

    let id = decoder.decode_i32(None)?;
    if id != value.id() {
        return Err(Error::parse(format!(
            "wrapped type id {} does not match {}",
            id,
            value.id()
        )));
    }

    value.decode(decoder)?;
    decoder.close()
}

#[cfg(test)]
pub(crate) mod test_types {
    use super::*;

    /// A record shaped the way schema-generated code would be.
    #[derive(Debug, Default, Clone, PartialEq)]
    pub struct Sample {
        pub flag: bool,
        pub count: i32,
        pub ticks: i64,
        pub ratio: f32,
        pub precise: f64,
        pub label: String,
        pub blob: Vec<u8>,
    }

    impl Type for Sample {
        fn id(&self) -> i32 {
            100
        }

        fn member_count(&self) -> usize {
            7
        }

        fn encode(&self, encoder: &mut dyn Encoder) -> Result<()> {
            encoder.open_type(None, self.id(), self.member_count())?;
            encoder.encode_bool(Some("flag"), self.flag)?;
            encoder.encode_i32(Some("count"), self.count)?;
            encoder.encode_i64(Some("ticks"), self.ticks)?;
            encoder.encode_f32(Some("ratio"), self.ratio)?;
            encoder.encode_f64(Some("precise"), self.precise)?;
            encoder.encode_string(Some("label"), &self.label)?;
            encoder.encode_binary(Some("blob"), &self.blob)?;
            encoder.close()
        }

        fn decode(&mut self, decoder: &mut dyn Decoder) -> Result<()> {
            decoder.open_type(None, self.id(), self.member_count())?;
            self.flag = decoder.decode_bool(Some("flag"))?;
            self.count = decoder.decode_i32(Some("count"))?;
            self.ticks = decoder.decode_i64(Some("ticks"))?;
            self.ratio = decoder.decode_f32(Some("ratio"))?;
            self.precise = decoder.decode_f64(Some("precise"))?;
            self.label = decoder.decode_string(Some("label"))?;
            self.blob = decoder.decode_binary(Some("blob"))?;
            decoder.close()
        }
    }

    pub fn sample() -> Sample {
        Sample {
            flag: true,
            count: 12_345_678,
            ticks: 0x0123_4567_89ab_cdef,
            ratio: 3.141_592_6,
            precise: 2.718_281_828_459_045,
            label: "foo bar".to_string(),
            blob: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }
}
