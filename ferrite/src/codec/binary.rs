//! The compact binary wire format. Byte-exact across implementations:
//!
//! - booleans are one byte, `0x00` or `0x01`;
//! - signed integers are variable-length: the first byte carries the sign
//!   in bit 6 and the six low magnitude bits, continuation bytes carry
//!   seven magnitude bits each (LSB first), bit 7 flags continuation;
//! - floats are big-endian IEEE-754;
//! - strings and binaries are a varint length followed by raw bytes;
//! - arrays and maps open with their size as a varint, types are not
//!   framed at all.

use byteorder::{BigEndian, ByteOrder};

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::io::buffer::Buffer;

pub struct BinaryEncoder<'a> {
    buffer: &'a mut Buffer,
}

impl<'a> BinaryEncoder<'a> {
    pub fn new(buffer: &'a mut Buffer) -> BinaryEncoder<'a> {
        BinaryEncoder { buffer }
    }
}

impl<'a> Encoder for BinaryEncoder<'a> {
    fn is_binary(&self) -> bool {
        true
    }

    fn open_type(&mut self, _name: Option<&str>, _id: i32, _members: usize) -> Result<()> {
        // Members follow in declaration order, unframed.
        Ok(())
    }

    fn open_array(&mut self, name: Option<&str>, size: usize) -> Result<()> {
        self.encode_i64(name, size as i64)
    }

    fn open_map(&mut self, name: Option<&str>, size: usize) -> Result<()> {
        self.encode_i64(name, size as i64)
    }

    fn encode_bool(&mut self, _name: Option<&str>, value: bool) -> Result<()> {
        self.buffer.append(&[value as u8]);
        Ok(())
    }

    fn encode_i32(&mut self, _name: Option<&str>, value: i32) -> Result<()> {
        put_varint(self.buffer, i64::from(value));
        Ok(())
    }

    fn encode_i64(&mut self, _name: Option<&str>, value: i64) -> Result<()> {
        put_varint(self.buffer, value);
        Ok(())
    }

    fn encode_f32(&mut self, _name: Option<&str>, value: f32) -> Result<()> {
        let mut data = [0u8; 4];
        BigEndian::write_f32(&mut data, value);
        self.buffer.append(&data);
        Ok(())
    }

    fn encode_f64(&mut self, _name: Option<&str>, value: f64) -> Result<()> {
        let mut data = [0u8; 8];
        BigEndian::write_f64(&mut data, value);
        self.buffer.append(&data);
        Ok(())
    }

    fn encode_string(&mut self, name: Option<&str>, value: &str) -> Result<()> {
        self.encode_i64(name, value.len() as i64)?;
        self.buffer.append(value.as_bytes());
        Ok(())
    }

    fn encode_binary(&mut self, name: Option<&str>, value: &[u8]) -> Result<()> {
        self.encode_i64(name, value.len() as i64)?;
        self.buffer.append(value);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct BinaryDecoder<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BinaryDecoder<'a> {
    pub fn new(data: &'a [u8]) -> BinaryDecoder<'a> {
        BinaryDecoder { data, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.offset + count > self.data.len() {
            return Err(Error::parse("truncated codec data"));
        }

        let data = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(data)
    }

    fn take_varint(&mut self) -> Result<i64> {
        let first = self.take(1)?[0];
        let negative = 0 != first & 0x40;
        let mut magnitude = u64::from(first & 0x3f);
        let mut shift = 6;
        let mut byte = first;

        while 0 != byte & 0x80 {
            if shift > 62 {
                return Err(Error::parse("varint too long"));
            }

            byte = self.take(1)?[0];
            magnitude |= u64::from(byte & 0x7f) << shift;
            shift += 7;
        }

        Ok(match negative {
            true => (magnitude as i64).wrapping_neg(),
            false => magnitude as i64,
        })
    }
}

impl<'a> Decoder for BinaryDecoder<'a> {
    fn open_type(&mut self, _name: Option<&str>, _id: i32, _members: usize) -> Result<()> {
        Ok(())
    }

    fn open_array(&mut self, _name: Option<&str>) -> Result<usize> {
        let size = self.take_varint()?;
        if size < 0 {
            return Err(Error::parse("negative container size"));
        }
        Ok(size as usize)
    }

    fn open_map(&mut self, name: Option<&str>) -> Result<usize> {
        self.open_array(name)
    }

    fn decode_bool(&mut self, _name: Option<&str>) -> Result<bool> {
        Ok(0 != self.take(1)?[0])
    }

    fn decode_i32(&mut self, _name: Option<&str>) -> Result<i32> {
        // Reconstructed through the shared 64-bit path; the target width
        // applies after reconstruction.
        Ok(self.take_varint()? as i32)
    }

    fn decode_i64(&mut self, _name: Option<&str>) -> Result<i64> {
        self.take_varint()
    }

    fn decode_f32(&mut self, _name: Option<&str>) -> Result<f32> {
        Ok(BigEndian::read_f32(self.take(4)?))
    }

    fn decode_f64(&mut self, _name: Option<&str>) -> Result<f64> {
        Ok(BigEndian::read_f64(self.take(8)?))
    }

    fn decode_string(&mut self, name: Option<&str>) -> Result<String> {
        let data = self.decode_binary(name)?;
        String::from_utf8(data).map_err(|_| Error::parse("string is not valid UTF-8"))
    }

    fn decode_binary(&mut self, _name: Option<&str>) -> Result<Vec<u8>> {
        let length = self.take_varint()?;
        if length < 0 {
            return Err(Error::parse("negative length"));
        }
        Ok(self.take(length as usize)?.to_vec())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn more(&self) -> bool {
        self.offset < self.data.len()
    }

    fn peek(&self) -> Result<i32> {
        let mut lookahead = self.clone();

        let size = lookahead.open_array(None)?;
        if 2 != size {
            return Err(Error::parse("data is not a wrapped type"));
        }
        lookahead.decode_i32(None)
    }
}

/// Sign-magnitude varint. The magnitude is the exact absolute value,
/// computed in unsigned arithmetic so the most negative values encode.
fn put_varint(buffer: &mut Buffer, value: i64) {
    let negative: u8 = if value < 0 { 0x40 } else { 0x00 };
    let mut magnitude = (value as i128).unsigned_abs() as u64;

    let bits = 64 - magnitude.leading_zeros() as i32;

    let mut data = [0u8; 10];
    let mut size = 1;

    data[0] = negative | (magnitude as u8 & 0x3f);
    if bits > 6 {
        data[0] |= 0x80;
        magnitude >>= 6;

        let mut encoded = 6;
        while encoded < bits {
            data[size] = 0x80 | (magnitude as u8 & 0x7f);
            size += 1;
            magnitude >>= 7;
            encoded += 7;
        }

        data[size - 1] &= !0x80;
    }

    buffer.append(&data[..size]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_types::{sample, Sample};
    use crate::codec::{unwrap, wrap};

    fn varint_bytes(value: i64) -> Vec<u8> {
        let mut buffer = Buffer::new();
        put_varint(&mut buffer, value);
        buffer.as_slice().to_vec()
    }

    fn varint_round_trip(value: i64) {
        let data = varint_bytes(value);
        let mut decoder = BinaryDecoder::new(&data);
        assert_eq!(decoder.take_varint().unwrap(), value, "value {}", value);
        assert!(!decoder.more());
    }

    #[test]
    fn test_varint_sign_bytes() {
        assert_eq!(varint_bytes(1), vec![0x01]);
        assert_eq!(varint_bytes(-1), vec![0x41]);
        assert_eq!(varint_bytes(0), vec![0x00]);
    }

    #[test]
    fn test_varint_six_bit_boundary() {
        // 63 fits the first byte, 64 needs one continuation byte.
        assert_eq!(varint_bytes(63), vec![0x3f]);
        assert_eq!(varint_bytes(-63), vec![0x7f]);
        assert_eq!(varint_bytes(64), vec![0x80, 0x01]);
        assert_eq!(varint_bytes(-64), vec![0xc0, 0x01]);
    }

    #[test]
    fn test_varint_boundaries_round_trip() {
        let values = [
            0,
            1,
            -1,
            63,
            -63,
            64,
            -64,
            1 << 32,
            -(1 << 32),
            1 << 53,
            -(1 << 53),
            i64::from(i32::MIN),
            i64::from(i32::MAX),
            i64::MIN,
            i64::MAX,
        ];
        for &value in &values {
            varint_round_trip(value);
        }
    }

    #[test]
    fn test_i32_width_applies_after_reconstruction() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = BinaryEncoder::new(&mut buffer);
            encoder.encode_i32(None, i32::MIN).unwrap();
            encoder.encode_i32(None, i32::MAX).unwrap();
        }

        let mut decoder = BinaryDecoder::new(buffer.as_slice());
        assert_eq!(decoder.decode_i32(None).unwrap(), i32::MIN);
        assert_eq!(decoder.decode_i32(None).unwrap(), i32::MAX);
    }

    #[test]
    fn test_bool_bytes() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = BinaryEncoder::new(&mut buffer);
            encoder.encode_bool(None, false).unwrap();
            encoder.encode_bool(None, true).unwrap();
        }
        assert_eq!(buffer.as_slice(), &[0x00, 0x01]);
    }

    #[test]
    fn test_floats_big_endian() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = BinaryEncoder::new(&mut buffer);
            encoder.encode_f32(None, 1.0).unwrap();
            encoder.encode_f64(None, 1.0).unwrap();
        }

        assert_eq!(&buffer.as_slice()[..4], &[0x3f, 0x80, 0x00, 0x00]);
        assert_eq!(
            &buffer.as_slice()[4..],
            &[0x3f, 0xf0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_string_has_no_terminator() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = BinaryEncoder::new(&mut buffer);
            encoder.encode_string(None, "abc").unwrap();
        }
        assert_eq!(buffer.as_slice(), b"\x03abc");
    }

    #[test]
    fn test_primitive_round_trip() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = BinaryEncoder::new(&mut buffer);
            encoder.encode_bool(None, true).unwrap();
            encoder.encode_i32(None, 12_345_678).unwrap();
            encoder.encode_i64(None, 0x0123_4567_89ab_cdef).unwrap();
            encoder.encode_f32(None, 3.141_592_6).unwrap();
            encoder.encode_f64(None, 2.718_281_828_459_045).unwrap();
            encoder.encode_string(None, "foo bar").unwrap();
        }

        let mut decoder = BinaryDecoder::new(buffer.as_slice());
        assert!(decoder.decode_bool(None).unwrap());
        assert_eq!(decoder.decode_i32(None).unwrap(), 12_345_678);
        assert_eq!(decoder.decode_i64(None).unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(decoder.decode_f32(None).unwrap().to_bits(), 3.141_592_6f32.to_bits());
        assert_eq!(
            decoder.decode_f64(None).unwrap().to_bits(),
            2.718_281_828_459_045f64.to_bits()
        );
        assert_eq!(decoder.decode_string(None).unwrap(), "foo bar");
        assert!(!decoder.more());
    }

    #[test]
    fn test_containers_round_trip() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = BinaryEncoder::new(&mut buffer);
            encoder.open_map(Some(""), 3).unwrap();
            encoder.encode_string(Some("foo"), "bar").unwrap();
            encoder.encode_bool(Some("xxx"), true).unwrap();
            encoder.open_array(Some("xyz"), 4).unwrap();
            for value in &[1, 9, 7, 1] {
                encoder.encode_i32(None, *value).unwrap();
            }
            encoder.close().unwrap();
            encoder.close().unwrap();
        }

        let mut decoder = BinaryDecoder::new(buffer.as_slice());
        assert_eq!(decoder.open_map(Some("")).unwrap(), 3);
        assert_eq!(decoder.decode_string(Some("foo")).unwrap(), "bar");
        assert!(decoder.decode_bool(Some("xxx")).unwrap());
        assert_eq!(decoder.open_array(Some("xyz")).unwrap(), 4);
        assert_eq!(decoder.decode_i32(None).unwrap(), 1);
        assert_eq!(decoder.decode_i32(None).unwrap(), 9);
        assert_eq!(decoder.decode_i32(None).unwrap(), 7);
        assert_eq!(decoder.decode_i32(None).unwrap(), 1);
        decoder.close().unwrap();
        decoder.close().unwrap();
        assert!(!decoder.more());
    }

    #[test]
    fn test_wrap_peek_unwrap() {
        let value = sample();

        let mut buffer = Buffer::new();
        {
            let mut encoder = BinaryEncoder::new(&mut buffer);
            wrap(&mut encoder, &value).unwrap();
        }

        let mut decoder = BinaryDecoder::new(buffer.as_slice());
        assert_eq!(decoder.peek().unwrap(), 100);
        // Peeking does not advance the cursor.
        assert_eq!(decoder.peek().unwrap(), 100);

        let mut decoded = Sample::default();
        unwrap(&mut decoder, &mut decoded).unwrap();
        assert_eq!(decoded, value);
        assert!(!decoder.more());
    }

    #[test]
    fn test_truncated_data() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = BinaryEncoder::new(&mut buffer);
            encoder.encode_string(None, "hello").unwrap();
        }

        let data = &buffer.as_slice()[..3];
        let mut decoder = BinaryDecoder::new(data);
        assert!(decoder.decode_string(None).is_err());
    }

    #[test]
    fn test_peek_rejects_non_wrapped() {
        let mut buffer = Buffer::new();
        {
            let mut encoder = BinaryEncoder::new(&mut buffer);
            encoder.open_array(None, 3).unwrap();
        }

        let decoder = BinaryDecoder::new(buffer.as_slice());
        assert!(decoder.peek().is_err());
    }
}
