use std::fmt;

use crate::error::{Error, Result};
use crate::io::sink::Sink;
use crate::io::source::Source;

/// Resizable byte container doubling as a [`Sink`] (append side, bounded
/// by an optional maximum) and a [`Source`] (read cursor). The container
/// operations themselves are unbounded; the maximum is enforced through
/// the `Sink` interface, which is what the I/O pumps use.
#[derive(Default)]
pub struct Buffer {
    data: Vec<u8>,
    maximum: Option<usize>,
    progress: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer::default()
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(capacity),
            maximum: None,
            progress: 0,
        }
    }

    #[inline]
    pub fn with_maximum(maximum: usize) -> Buffer {
        Buffer {
            data: Vec::new(),
            maximum: Some(maximum),
            progress: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn set_maximum(&mut self, maximum: Option<usize>) {
        self.maximum = maximum;
    }

    /// Replaces the contents and rewinds the read cursor.
    #[inline]
    pub fn assign(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
        self.progress = 0;
    }

    #[inline]
    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Inserts `data` at `offset`. Inserting past the end panics.
    #[inline]
    pub fn insert(&mut self, offset: usize, data: &[u8]) {
        assert!(offset <= self.data.len());
        self.data.splice(offset..offset, data.iter().copied());
    }

    #[inline]
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Releases spare capacity; idempotent once size equals capacity.
    #[inline]
    pub fn shrink(&mut self) {
        self.data.shrink_to_fit();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.progress = 0;
    }

    /// Rewinds the read cursor to the first byte.
    #[inline]
    pub fn rewind(&mut self) {
        self.progress = 0;
    }

    /// Drops the consumed prefix, keeping unconsumed bytes. Staging
    /// buffers call this between pump rounds to bound growth.
    #[inline]
    pub fn compact(&mut self) {
        if self.progress > 0 {
            self.data.drain(..self.progress);
            self.progress = 0;
        }
    }

    /// Unconsumed bytes, the whole contents for a fresh buffer.
    #[inline]
    pub fn unread(&self) -> &[u8] {
        &self.data[self.progress..]
    }

    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl Sink for Buffer {
    #[inline]
    fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn maximum(&self) -> Option<usize> {
        self.maximum
    }

    fn resize(&mut self, size: usize) -> Result<&mut [u8]> {
        if let Some(maximum) = self.maximum {
            if size > maximum {
                return Err(Error::resource("buffer maximum exceeded"));
            }
        }

        self.data.resize(size, 0);
        self.progress = self.progress.min(size);
        Ok(&mut self.data)
    }
}

impl Source for Buffer {
    #[inline]
    fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn progress(&self) -> usize {
        self.progress
    }

    #[inline]
    fn advance(&mut self, count: usize) {
        assert!(self.progress + count <= self.data.len());
        self.progress += count;
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Buffer {
        Buffer {
            data,
            maximum: None,
            progress: 0,
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Buffer {
        Buffer::from(data.to_vec())
    }
}

impl From<&str> for Buffer {
    fn from(data: &str) -> Buffer {
        Buffer::from(data.as_bytes().to_vec())
    }
}

impl From<String> for Buffer {
    fn from(data: String) -> Buffer {
        Buffer::from(data.into_bytes())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.data.len())
            .field("maximum", &self.maximum)
            .field("progress", &self.progress)
            .finish()
    }
}

impl PartialEq<[u8]> for Buffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.data == other
    }
}
