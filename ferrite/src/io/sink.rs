use std::any::Any;

use crate::error::{Error, Result};

/// A size-bounded byte destination that can grow on demand. Reads pump
/// into a sink until it is [`Sink::full`].
pub trait Sink {
    /// Current number of bytes in the sink.
    fn size(&self) -> usize;

    /// Growth bound; `None` is unbounded.
    fn maximum(&self) -> Option<usize>;

    /// Grows or shrinks to `size` bytes and returns the full byte slice.
    /// Growing past the maximum is a resource error.
    fn resize(&mut self, size: usize) -> Result<&mut [u8]>;

    /// A bounded sink is full when it reached its maximum; an unbounded
    /// sink never is.
    fn full(&self) -> bool {
        match self.maximum() {
            Some(maximum) => self.size() >= maximum,
            None => false,
        }
    }

    /// Room left to grow, limited by `limit`.
    fn headroom(&self, limit: usize) -> usize {
        match self.maximum() {
            Some(maximum) => {
                debug_assert!(self.size() <= maximum);
                (maximum - self.size()).min(limit)
            }
            None => limit,
        }
    }

    /// Extends by `size` bytes and returns the extension slice.
    fn produce(&mut self, size: usize) -> Result<&mut [u8]> {
        if let Some(maximum) = self.maximum() {
            if self.size() + size > maximum {
                return Err(Error::resource("sink maximum exceeded"));
            }
        }

        let before = self.size();
        let data = self.resize(before + size)?;
        Ok(&mut data[before..])
    }

    /// Appends `data` and returns the total number of bytes in the sink.
    fn produce_from(&mut self, data: &[u8]) -> Result<usize> {
        self.produce(data.len())?.copy_from_slice(data);
        Ok(self.size())
    }
}

/// Object-safe bridge that lets a pump hand a type-erased sink back to a
/// typed completion callback.
pub(crate) trait AnySink: Sink + Send {
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> AnySink for T
where
    T: Sink + Send + Any,
{
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::buffer::Buffer;

    #[test]
    fn test_headroom_bounded() {
        let mut buffer = Buffer::with_maximum(8);
        buffer.produce_from(b"abc").unwrap();

        assert_eq!(buffer.headroom(100), 5);
        assert_eq!(buffer.headroom(2), 2);
        assert!(!buffer.full());
    }

    #[test]
    fn test_headroom_unbounded() {
        let buffer = Buffer::new();
        assert_eq!(buffer.headroom(100), 100);
        assert!(!buffer.full());
    }

    #[test]
    fn test_produce_past_maximum() {
        let mut buffer = Buffer::with_maximum(4);
        buffer.produce_from(b"abcd").unwrap();

        assert!(buffer.full());
        assert!(buffer.produce(1).is_err());
    }

    #[test]
    fn test_produce_from_returns_total() {
        let mut buffer = Buffer::new();
        assert_eq!(buffer.produce_from(b"ab").unwrap(), 2);
        assert_eq!(buffer.produce_from(b"cd").unwrap(), 4);
        assert_eq!(buffer.as_slice(), b"abcd");
    }
}
