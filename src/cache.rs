//! A5: owns the mmap'd dyld shared cache file and exposes the cache
//! header/mapping/image tables plus the four collaborator queries
//! `Decacher` needs (`from_cache_vmaddr`, `peek_byte_at_vmaddr`,
//! `image_containing_address`, `path_of_image`).

use crate::error::{DecacheError, Result};
use crate::macho::MachOIndex;
use crate::reader::ByteReader;
use std::path::Path;

const CACHE_MAGIC_PREFIX: &[u8] = b"dyld_v1";

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct CacheHeader {
    magic: [u8; 16],
    mapping_offset: u32,
    mapping_count: u32,
    images_offset: u32,
    images_count: u32,
    dyld_base_address: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MappingEntry {
    address: u64,
    size: u64,
    file_offset: u64,
    max_prot: i32,
    init_prot: i32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct ImageEntry {
    address: u64,
    mod_time: u64,
    inode: u64,
    path_offset: u32,
    pad: u32,
}

pub struct DyldCache {
    reader: ByteReader,
    mapping_offset: usize,
    mapping_count: usize,
    images_offset: usize,
    images_count: usize,
    dyld_base_address: u64,
}

impl DyldCache {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = ByteReader::open(path)?;
        let header: &CacheHeader = reader
            .peek_at(0)
            .ok_or_else(|| DecacheError::BadCacheMagic { path: path.to_path_buf() })?;
        if &header.magic[..CACHE_MAGIC_PREFIX.len()] != CACHE_MAGIC_PREFIX {
            return Err(DecacheError::BadCacheMagic { path: path.to_path_buf() });
        }

        Ok(DyldCache {
            mapping_offset: header.mapping_offset as usize,
            mapping_count: header.mapping_count as usize,
            images_offset: header.images_offset as usize,
            images_count: header.images_count as usize,
            dyld_base_address: header.dyld_base_address,
            reader,
        })
    }

    fn mappings(&self) -> &[MappingEntry] {
        self.reader
            .peek_array(self.mapping_offset, self.mapping_count)
            .unwrap_or(&[])
    }

    fn images(&self) -> &[ImageEntry] {
        self.reader
            .peek_array(self.images_offset, self.images_count)
            .unwrap_or(&[])
    }

    pub fn reader(&self) -> &ByteReader {
        &self.reader
    }

    pub fn image_count(&self) -> usize {
        self.images_count
    }

    pub fn dyld_base_address(&self) -> u64 {
        self.dyld_base_address
    }

    pub fn image_address(&self, index: usize) -> u64 {
        self.images().get(index).map(|i| i.address).unwrap_or(0)
    }

    /// Inode of the image's original on-disk file. Dedup itself keys off
    /// `image_address` (the shared `mach_header` location), since that's
    /// what's actually merged once per cache regardless of the inode of
    /// whichever path it's served under.
    pub fn image_inode(&self, index: usize) -> u64 {
        self.images().get(index).map(|i| i.inode).unwrap_or(0)
    }

    pub fn image_path(&self, index: usize) -> &str {
        let Some(entry) = self.images().get(index) else {
            return "";
        };
        self.reader
            .peek_ascii_cstring_at(entry.path_offset as usize)
            .and_then(|b| std::str::from_utf8(b).ok())
            .unwrap_or("")
    }

    /// Same as `image_path`; kept as a distinct name since it's the
    /// collaborator query `Decacher` calls when resolving a cross-image
    /// reference's owning library name.
    pub fn path_of_image(&self, index: usize) -> &str {
        self.image_path(index)
    }

    /// Translates a vmaddr into a file offset via a linear scan of the
    /// mapping table.
    pub fn from_cache_vmaddr(&self, vmaddr: u64) -> Option<usize> {
        self.mappings().iter().find_map(|m| {
            if vmaddr >= m.address && vmaddr < m.address + m.size {
                Some((vmaddr - m.address + m.file_offset) as usize)
            } else {
                None
            }
        })
    }

    pub fn peek_byte_at_vmaddr(&self, vmaddr: u64) -> Option<u8> {
        let off = self.from_cache_vmaddr(vmaddr)?;
        self.reader.byte_at(off)
    }

    /// Header offset of image `index`, resolved through the mapping table.
    pub fn header_offset_of_image(&self, index: usize) -> Option<usize> {
        self.from_cache_vmaddr(self.image_address(index))
    }

    /// Finds which image owns `target_vmaddr` and, if so, the exported
    /// symbol name at that address (empty string if the address isn't a
    /// published export).
    ///
    /// Two-phase to avoid walking every candidate image's full export trie:
    /// first build a cheap index (no trie walk) just to test segment
    /// containment, then rebuild the matching image's index with the trie
    /// walk enabled to resolve the symbol name.
    pub fn image_containing_address(&self, target_vmaddr: u32) -> Option<(usize, String)> {
        for idx in 0..self.image_count() {
            let header_off = self.header_offset_of_image(idx)?;
            let cheap = MachOIndex::parse(&self.reader, header_off, None);
            if !cheap.contains_address(target_vmaddr) {
                continue;
            }
            let image_vmaddr = self.image_address(idx) as u32;
            let full = MachOIndex::parse(&self.reader, header_off, Some(image_vmaddr));
            return Some((idx, full.exported_symbol(target_vmaddr).to_string()));
        }
        None
    }

    /// `-p`/`--print` mode: cache header, mapping table, image table.
    pub fn print_info(&self) {
        println!("magic: dyld_v1");
        println!("dyld base address: 0x{:x}", self.dyld_base_address);
        println!();
        println!("mappings:");
        for m in self.mappings() {
            let (address, size, file_offset, init_prot, max_prot) =
                (m.address, m.size, m.file_offset, m.init_prot, m.max_prot);
            println!(
                "  address=0x{:010x} size=0x{:08x} offset=0x{:08x} prot={:o}/{:o}",
                address, size, file_offset, init_prot, max_prot
            );
        }
        println!();
        println!("images ({}):", self.image_count());
        for idx in 0..self.image_count() {
            println!("  0x{:010x}  {}", self.image_address(idx), self.image_path(idx));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn synthetic_cache_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        buf[0..7].copy_from_slice(b"dyld_v1");
        // header: magic(16) mapping_offset(4) mapping_count(4) images_offset(4) images_count(4) dyld_base(8)
        let mapping_offset: u32 = 64;
        let mapping_count: u32 = 1;
        let images_offset: u32 = 96;
        let images_count: u32 = 1;
        buf[16..20].copy_from_slice(&mapping_offset.to_le_bytes());
        buf[20..24].copy_from_slice(&mapping_count.to_le_bytes());
        buf[24..28].copy_from_slice(&images_offset.to_le_bytes());
        buf[28..32].copy_from_slice(&images_count.to_le_bytes());
        buf[32..40].copy_from_slice(&0xdead_beefu64.to_le_bytes());

        // one mapping: address=0x1000 size=0x1000 file_offset=0x100
        buf[64..72].copy_from_slice(&0x1000u64.to_le_bytes());
        buf[72..80].copy_from_slice(&0x1000u64.to_le_bytes());
        buf[80..88].copy_from_slice(&0x100u64.to_le_bytes());

        // one image: address=0x1000 path_offset=200
        buf[96..104].copy_from_slice(&0x1000u64.to_le_bytes());
        buf[120..124].copy_from_slice(&200u32.to_le_bytes());

        let path = b"/usr/lib/libfoo.dylib\0";
        buf[200..200 + path.len()].copy_from_slice(path);

        buf
    }

    fn cache_with(bytes: &[u8]) -> DyldCache {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        DyldCache::open(f.path()).unwrap()
    }

    #[test]
    fn rejects_bad_magic() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 64]).unwrap();
        assert!(DyldCache::open(f.path()).is_err());
    }

    #[test]
    fn parses_mapping_and_image_tables() {
        let cache = cache_with(&synthetic_cache_bytes());
        assert_eq!(cache.image_count(), 1);
        assert_eq!(cache.image_path(0), "/usr/lib/libfoo.dylib");
        assert_eq!(cache.dyld_base_address(), 0xdead_beef);
    }

    #[test]
    fn from_cache_vmaddr_resolves_within_mapping() {
        let cache = cache_with(&synthetic_cache_bytes());
        assert_eq!(cache.from_cache_vmaddr(0x1010), Some(0x110));
        assert_eq!(cache.from_cache_vmaddr(0x5000), None);
    }
}
