//! C1: random-access, bounds-checked view over a memory-mapped file.
//!
//! Every read here is single-threaded and non-suspending. Bounds violations
//! never read out of the mapping: they return an absence marker (`None` /
//! `false`) and leave the cursor clamped to `size()`.

use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

pub struct ByteReader {
    mmap: Mmap,
    cursor: usize,
}

impl ByteReader {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap, cursor: 0 })
    }

    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    /// Base address of the mapping, used to recover a struct reference's
    /// file offset via pointer arithmetic (e.g. locating the sections that
    /// trail a `SegmentCommand` borrowed out of `MachOIndex`).
    pub fn base_ptr(&self) -> usize {
        self.mmap.as_ptr() as usize
    }

    pub fn tell(&self) -> usize {
        self.cursor
    }

    pub fn seek(&mut self, location: usize) {
        self.cursor = location.min(self.size());
    }

    pub fn advance(&mut self, delta: usize) {
        self.seek(self.cursor.saturating_add(delta));
    }

    pub fn retreat(&mut self, delta: usize) {
        self.seek(self.cursor.saturating_sub(delta));
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn is_eof(&self) -> bool {
        self.cursor == self.size()
    }

    /// Stateless byte lookup that does not touch the cursor; used by callers
    /// (the export trie walker, the ObjC scanner) that hold borrows derived
    /// from this reader and so cannot take `&mut self`.
    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        self.mmap.get(offset).copied()
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        let b = self.byte_at(self.cursor)?;
        self.cursor += 1;
        Some(b)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_raw(4)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_raw(&mut self, n: usize) -> Option<&[u8]> {
        if self.cursor.checked_add(n)? > self.size() {
            self.cursor = self.size();
            return None;
        }
        let slice = &self.mmap[self.cursor..self.cursor + n];
        self.cursor += n;
        Some(slice)
    }

    /// Bytes up to and including the next NUL; advances the cursor past it.
    pub fn read_c_string(&mut self) -> Option<&[u8]> {
        let start = self.cursor;
        let rel_nul = self.mmap[start..].iter().position(|&b| b == 0)?;
        let end = start + rel_nul + 1;
        self.cursor = end;
        Some(&self.mmap[start..end])
    }

    /// The maximal run of `\t\n\r` or printable ASCII from the cursor; does
    /// not require (or consume) a terminator.
    pub fn read_ascii_string(&mut self) -> &[u8] {
        let start = self.cursor;
        let end = self.mmap[start..]
            .iter()
            .position(|&b| !is_ascii_string_byte(b))
            .map(|rel| start + rel)
            .unwrap_or(self.size());
        self.cursor = end;
        &self.mmap[start..end]
    }

    /// Like `read_ascii_string`, but at an explicit offset and requiring a
    /// NUL terminator strictly within bounds; absence otherwise.
    pub fn peek_ascii_cstring_at(&self, offset: usize) -> Option<&[u8]> {
        if offset >= self.size() {
            return None;
        }
        let mut len = 0usize;
        while offset + len < self.size() && is_ascii_string_byte(self.mmap[offset + len]) {
            len += 1;
        }
        let term = offset + len;
        if term < self.size() && self.mmap[term] == 0 {
            Some(&self.mmap[offset..term])
        } else {
            None
        }
    }

    pub fn peek<T: Copy>(&self) -> Option<&T> {
        self.peek_at(self.cursor)
    }

    /// Strict bound: the whole `T` must lie within the file. `T` must be a
    /// `#[repr(C, packed)]` type (alignment 1) so the cast below is sound
    /// regardless of `offset`'s actual alignment.
    pub fn peek_at<T: Copy>(&self, offset: usize) -> Option<&T> {
        let size = std::mem::size_of::<T>();
        if offset.checked_add(size)? > self.size() {
            return None;
        }
        let ptr = self.mmap.as_ptr().wrapping_add(offset) as *const T;
        Some(unsafe { &*ptr })
    }

    pub fn peek_array<T: Copy>(&self, offset: usize, n: usize) -> Option<&[T]> {
        let size = std::mem::size_of::<T>().checked_mul(n)?;
        if offset.checked_add(size)? > self.size() {
            return None;
        }
        let ptr = self.mmap.as_ptr().wrapping_add(offset) as *const T;
        Some(unsafe { std::slice::from_raw_parts(ptr, n) })
    }

    pub fn read_uleb128(&mut self) -> u64 {
        let mut result: u64 = 0;
        let mut bit = 0u32;
        loop {
            let byte = self.read_byte().unwrap_or(0);
            if bit < 64 {
                result |= ((byte & 0x7f) as u64) << bit;
            }
            bit += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        result
    }

    pub fn read_sleb128(&mut self) -> i64 {
        let mut result: i64 = 0;
        let mut bit = 0u32;
        let mut byte;
        loop {
            byte = self.read_byte().unwrap_or(0);
            if bit < 64 {
                result |= ((byte & 0x7f) as i64) << bit;
            }
            bit += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        if bit < 64 && (byte & 0x40) != 0 {
            result |= -1i64 << bit;
        }
        result
    }

    /// Stateless ULEB128 decode at an explicit position, used by the export
    /// trie walker which cannot hold `&mut self` while other code borrows
    /// from this reader.
    pub fn uleb_at(&self, pos: &mut usize) -> u64 {
        let mut result: u64 = 0;
        let mut bit = 0u32;
        loop {
            let byte = self.byte_at(*pos).unwrap_or(0);
            *pos += 1;
            if bit < 64 {
                result |= ((byte & 0x7f) as u64) << bit;
            }
            bit += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        result
    }

    /// Advances the cursor to the first position at or after it where
    /// `needle` matches. On failure, the cursor is left at `size()`.
    pub fn search_forward(&mut self, needle: &[u8]) -> bool {
        if needle.is_empty() {
            return true;
        }
        if self.cursor + needle.len() > self.size() {
            self.cursor = self.size();
            return false;
        }
        match self.mmap[self.cursor..]
            .windows(needle.len())
            .position(|w| w == needle)
        {
            Some(rel) => {
                self.cursor += rel;
                true
            }
            None => {
                self.cursor = self.size();
                false
            }
        }
    }
}

fn is_ascii_string_byte(b: u8) -> bool {
    matches!(b, b'\t' | b'\n' | b'\r') || (0x20..=0x7E).contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn reader_with(bytes: &[u8]) -> ByteReader {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        ByteReader::open(f.path()).unwrap()
    }

    #[test]
    fn cursor_moves() {
        let mut r = reader_with(&[0u8; 16]);
        assert_eq!(r.tell(), 0);
        r.seek(4);
        assert_eq!(r.tell(), 4);
        r.retreat(4);
        assert_eq!(r.tell(), 0);
        r.advance(4);
        assert_eq!(r.tell(), 4);
        r.rewind();
        assert_eq!(r.tell(), 0);
        assert!(!r.is_eof());
        r.seek(16);
        assert!(r.is_eof());
    }

    #[test]
    fn seek_clamps_to_size() {
        let mut r = reader_with(&[0u8; 4]);
        r.seek(100);
        assert_eq!(r.tell(), 4);
    }

    #[test]
    fn read_u32_little_endian() {
        let mut r = reader_with(&[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(r.read_u32(), Some(0x1234_5678));
        assert_eq!(r.tell(), 4);
    }

    #[test]
    fn read_raw_past_eof_clamps_cursor() {
        let mut r = reader_with(&[1, 2, 3]);
        assert_eq!(r.read_raw(10), None);
        assert_eq!(r.tell(), 3);
        assert!(r.is_eof());
    }

    #[test]
    fn read_c_string_includes_nul_and_advances_past_it() {
        let mut r = reader_with(b"hi\0tail");
        assert_eq!(r.read_c_string(), Some(&b"hi\0"[..]));
        assert_eq!(r.tell(), 3);
    }

    #[test]
    fn read_ascii_string_stops_at_first_non_ascii_without_terminator() {
        let mut r = reader_with(b"abc\xffdef");
        assert_eq!(r.read_ascii_string(), b"abc");
        assert_eq!(r.tell(), 3);
    }

    #[test]
    fn peek_ascii_cstring_requires_nul_in_bounds() {
        let r = reader_with(b"ok\0");
        assert_eq!(r.peek_ascii_cstring_at(0), Some(&b"ok"[..]));
        // Run that reaches EOF before a NUL is absence, not a short string.
        let r2 = reader_with(b"nonul");
        assert_eq!(r2.peek_ascii_cstring_at(0), None);
    }

    #[test]
    fn peek_ascii_cstring_out_of_bounds_offset_is_absent() {
        let r = reader_with(b"x\0");
        assert_eq!(r.peek_ascii_cstring_at(50), None);
    }

    #[repr(C, packed)]
    #[derive(Clone, Copy)]
    struct Pair {
        a: u32,
        b: u16,
    }

    #[test]
    fn peek_array_requires_every_element_in_bounds() {
        let r = reader_with(&[0u8; 12]);
        assert!(r.peek_array::<Pair>(0, 2).is_some());
        assert!(r.peek_array::<Pair>(0, 3).is_none());
    }

    #[test]
    fn uleb128_round_trips_small_and_multibyte() {
        let mut r = reader_with(&[0x00]);
        assert_eq!(r.read_uleb128(), 0);

        let mut r = reader_with(&[0xE5, 0x8E, 0x26]);
        assert_eq!(r.read_uleb128(), 624_485);
    }

    #[test]
    fn sleb128_decodes_negative_values() {
        let mut r = reader_with(&[0x9B, 0xF1, 0x59]);
        assert_eq!(r.read_sleb128(), -624_485);
    }

    #[test]
    fn search_forward_positions_cursor_or_hits_eof() {
        let mut r = reader_with(b"abcdefg");
        assert!(r.search_forward(b"cde"));
        assert_eq!(r.tell(), 2);
        r.advance(1);
        assert!(!r.search_forward(b"cde"));
        assert!(r.is_eof());
    }
}
