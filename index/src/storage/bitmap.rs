//! Block slot bitmap.
//!
//! The bitmap stream tracks which slots of the allocation stream hold a live
//! index block. Each bit represents one slot: 0 = free, 1 = used.
//! The stream always grows in whole 8-byte units, as NTFS expects.

// Slot indices are u64 but bitmap byte offsets are usize. On 64-bit systems these
// are the same size, and an index never approaches 2^32 blocks on 32-bit systems.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::host::{AttributeStream, HostError};

/// Number of bits per byte.
const BITS_PER_BYTE: u64 = 8;

/// The bitmap stream length is kept a multiple of this many bytes.
const STREAM_GRANULARITY: u64 = 8;

/// An occupancy bitmap backed by a stream.
///
/// The whole bitmap is mirrored in memory; every change is written through to
/// the stream immediately.
#[derive(Debug)]
pub struct Bitmap<S> {
    stream: S,
    /// In-memory copy of the stream contents.
    bits: Vec<u8>,
    /// Every slot below this index is known to be in use.
    next_search_hint: u64,
}

impl<S: AttributeStream> Bitmap<S> {
    /// Load a bitmap from its stream.
    pub fn new(mut stream: S) -> Result<Self, HostError> {
        let mut bits = vec![0u8; stream.len()? as usize];
        if !bits.is_empty() {
            stream.read_at(0, &mut bits)?;
        }

        Ok(Self {
            stream,
            bits,
            next_search_hint: 0,
        })
    }

    /// Check if a slot is in use.
    #[must_use]
    pub fn is_present(&self, index: u64) -> bool {
        get_bit(&self.bits, index)
    }

    /// Mark a slot as in use, growing the stream if needed.
    pub fn mark_present(&mut self, index: u64) -> Result<(), HostError> {
        let byte_index = index / BITS_PER_BYTE;
        if byte_index >= self.bits.len() as u64 {
            let new_len = (byte_index + 1).next_multiple_of(STREAM_GRANULARITY);
            self.stream.set_len(new_len)?;
            self.bits.resize(new_len as usize, 0);
        }

        set_bit(&mut self.bits, index);
        self.write_byte(byte_index)
    }

    /// Mark a slot as free.
    pub fn mark_absent(&mut self, index: u64) -> Result<(), HostError> {
        let byte_index = index / BITS_PER_BYTE;
        if byte_index < self.bits.len() as u64 {
            clear_bit(&mut self.bits, index);
            self.write_byte(byte_index)?;
        }

        if index < self.next_search_hint {
            self.next_search_hint = index;
        }
        Ok(())
    }

    /// Claim the lowest free slot.
    pub fn allocate_first_available(&mut self) -> Result<u64, HostError> {
        let mut index = self.next_search_hint;
        while self.is_present(index) {
            index += 1;
        }

        self.mark_present(index)?;
        self.next_search_hint = index + 1;
        Ok(index)
    }

    /// Number of slots in use.
    #[must_use]
    pub fn count_present(&self) -> u64 {
        self.bits.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    /// Indices of all slots in use, in ascending order.
    pub fn present_indices(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.bits.len() as u64 * BITS_PER_BYTE).filter(|&i| self.is_present(i))
    }

    fn write_byte(&mut self, byte_index: u64) -> Result<(), HostError> {
        let byte = self.bits[byte_index as usize];
        self.stream.write_at(byte_index, &[byte])
    }
}

/// Get a bit from the bitmap.
fn get_bit(bitmap: &[u8], index: u64) -> bool {
    let byte_index = (index / BITS_PER_BYTE) as usize;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index >= bitmap.len() {
        return false;
    }

    (bitmap[byte_index] & (1 << bit_index)) != 0
}

/// Set a bit in the bitmap (mark as used).
fn set_bit(bitmap: &mut [u8], index: u64) {
    let byte_index = (index / BITS_PER_BYTE) as usize;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] |= 1 << bit_index;
    }
}

/// Clear a bit in the bitmap (mark as free).
fn clear_bit(bitmap: &mut [u8], index: u64) {
    let byte_index = (index / BITS_PER_BYTE) as usize;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] &= !(1 << bit_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStream;

    #[test]
    fn test_empty_stream() {
        let bitmap = Bitmap::new(MemoryStream::new()).expect("load");
        assert_eq!(bitmap.count_present(), 0);
        assert!(!bitmap.is_present(0));
        assert!(!bitmap.is_present(1000));
    }

    #[test]
    fn test_first_fit_allocation() {
        let mut bitmap = Bitmap::new(MemoryStream::new()).expect("load");

        assert_eq!(bitmap.allocate_first_available().expect("alloc"), 0);
        assert_eq!(bitmap.allocate_first_available().expect("alloc"), 1);
        assert_eq!(bitmap.allocate_first_available().expect("alloc"), 2);

        bitmap.mark_absent(1).expect("free");
        assert!(!bitmap.is_present(1));

        // The hole is reused before anything higher
        assert_eq!(bitmap.allocate_first_available().expect("alloc"), 1);
        assert_eq!(bitmap.allocate_first_available().expect("alloc"), 3);
        assert_eq!(bitmap.count_present(), 4);
    }

    #[test]
    fn test_stream_grows_in_eight_byte_units() {
        let stream = MemoryStream::new();
        let mut bitmap = Bitmap::new(stream.clone()).expect("load");

        bitmap.mark_present(0).expect("mark");
        assert_eq!(stream.len().expect("len"), 8);

        bitmap.mark_present(64).expect("mark");
        assert_eq!(stream.len().expect("len"), 16);
        assert_eq!(stream.to_vec()[8], 0x01);
    }

    #[test]
    fn test_reload_from_stream() {
        let stream = MemoryStream::new();
        {
            let mut bitmap = Bitmap::new(stream.clone()).expect("load");
            bitmap.mark_present(3).expect("mark");
            bitmap.mark_present(9).expect("mark");
        }

        let mut bitmap = Bitmap::new(stream).expect("reload");
        assert!(bitmap.is_present(3));
        assert!(bitmap.is_present(9));
        assert_eq!(bitmap.present_indices().collect::<Vec<_>>(), vec![3, 9]);

        // A fresh bitmap still allocates first-fit from slot 0
        assert_eq!(bitmap.allocate_first_available().expect("alloc"), 0);
    }

    /// A stream whose metadata cannot be read.
    #[derive(Debug)]
    struct UnreadableStream;

    impl AttributeStream for UnreadableStream {
        fn len(&self) -> Result<u64, HostError> {
            Err(std::io::Error::other("metadata unavailable").into())
        }

        fn read_at(&mut self, _pos: u64, _buf: &mut [u8]) -> Result<(), HostError> {
            Err(std::io::Error::other("read failed").into())
        }

        fn write_at(&mut self, _pos: u64, _data: &[u8]) -> Result<(), HostError> {
            Err(std::io::Error::other("write failed").into())
        }

        fn set_len(&mut self, _len: u64) -> Result<(), HostError> {
            Err(std::io::Error::other("resize failed").into())
        }
    }

    #[test]
    fn test_unreadable_length_fails_load() {
        let err = Bitmap::new(UnreadableStream).unwrap_err();
        assert!(matches!(err, HostError::Io(_)));
    }

    #[test]
    fn test_mark_absent_out_of_range_is_noop() {
        let mut bitmap = Bitmap::new(MemoryStream::new()).expect("load");
        bitmap.mark_absent(500).expect("free");
        assert_eq!(bitmap.count_present(), 0);
    }

    #[test]
    fn test_bit_operations() {
        let mut bitmap = vec![0u8; 10];

        assert!(!get_bit(&bitmap, 0));
        assert!(!get_bit(&bitmap, 79));

        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 7);
        set_bit(&mut bitmap, 79);
        assert!(get_bit(&bitmap, 0));
        assert!(get_bit(&bitmap, 7));
        assert!(get_bit(&bitmap, 79));

        clear_bit(&mut bitmap, 7);
        assert!(!get_bit(&bitmap, 7));
        assert!(get_bit(&bitmap, 0));
    }
}
