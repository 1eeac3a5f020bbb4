//! C2: parses one image's load commands into segments, a library-ordinal
//! table, and an exported-symbol map.
//!
//! Struct layouts mirror `<mach-o/loader.h>` for 32-bit little-endian
//! images, reproduced from `dyld_decache.cpp`. All of them are
//! `#[repr(C, packed)]` (alignment 1) so `ByteReader::peek_at` can hand out
//! references to them at any byte offset.

use crate::reader::ByteReader;

pub const MH_MAGIC: u32 = 0xfeedface;

pub const LC_REQ_DYLD: u32 = 0x8000_0000;
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_TWOLEVEL_HINTS: u32 = 0x16;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1e;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_FUNCTION_STARTS: u32 = 0x26;

pub fn is_library_declaring_cmd(cmd: u32) -> bool {
    matches!(
        cmd,
        LC_ID_DYLIB
            | LC_LOAD_DYLIB
            | LC_LOAD_WEAK_DYLIB
            | LC_REEXPORT_DYLIB
            | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB
    )
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct MachHeader {
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SegmentCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u32,
    pub vmsize: u32,
    pub fileoff: u32,
    pub filesize: u32,
    pub maxprot: i32,
    pub initprot: i32,
    pub nsects: u32,
    pub flags: u32,
}

impl SegmentCommand {
    pub fn name(&self) -> &str {
        segname_str(&self.segname)
    }

    pub fn contains(&self, vmaddr: u32) -> bool {
        let base = self.vmaddr;
        let size = self.vmsize;
        base <= vmaddr && vmaddr < base.wrapping_add(size)
    }
}

pub fn segname_str(raw: &[u8; 16]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(16);
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Section {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u32,
    pub size: u32,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl Section {
    pub fn sectname(&self) -> &str {
        segname_str(&self.sectname)
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DylibCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub name_offset: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DysymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DyldInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct EncryptionInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub cryptoff: u32,
    pub cryptsize: u32,
    pub cryptid: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct TwolevelHintsCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub offset: u32,
    pub nhints: u32,
}

/// 32-bit `nlist`: 12 bytes, no padding.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Nlist {
    pub n_strx: i32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: i16,
    pub n_value: u32,
}

/// Segments, library ordinals, and exported symbols for one image's load
/// commands. An invalid magic leaves every field empty rather than erroring
/// here; the Decacher decides what to do with that.
pub struct MachOIndex<'a> {
    pub segments: Vec<&'a SegmentCommand>,
    ordinals: Vec<String>,
    exports: Vec<(u32, String)>,
}

impl<'a> MachOIndex<'a> {
    pub fn parse(reader: &'a ByteReader, header_offset: usize, image_vmaddr: Option<u32>) -> Self {
        let mut index = MachOIndex {
            segments: Vec::new(),
            ordinals: Vec::new(),
            exports: Vec::new(),
        };

        let header: &MachHeader = match reader.peek_at(header_offset) {
            Some(h) => h,
            None => return index,
        };
        if header.magic != MH_MAGIC {
            return index;
        }

        let ncmds = header.ncmds;
        let mut cmd_off = header_offset + std::mem::size_of::<MachHeader>();

        for _ in 0..ncmds {
            let lc: &LoadCommand = match reader.peek_at(cmd_off) {
                Some(lc) => lc,
                None => break,
            };
            let cmd = lc.cmd;
            let cmdsize = lc.cmdsize as usize;
            if cmdsize == 0 {
                break;
            }

            if cmd == LC_SEGMENT {
                if let Some(seg) = reader.peek_at::<SegmentCommand>(cmd_off) {
                    index.segments.push(seg);
                }
            } else if is_library_declaring_cmd(cmd) {
                if let Some(dc) = reader.peek_at::<DylibCommand>(cmd_off) {
                    let name_off = cmd_off + dc.name_offset as usize;
                    let name = reader
                        .peek_ascii_cstring_at(name_off)
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default();
                    index.ordinals.push(name);
                }
            } else if cmd == LC_DYLD_INFO || cmd == LC_DYLD_INFO_ONLY {
                if let (Some(base), Some(di)) =
                    (image_vmaddr, reader.peek_at::<DyldInfoCommand>(cmd_off))
                {
                    if di.export_size > 0 {
                        walk_export_trie(
                            reader,
                            di.export_off as usize,
                            di.export_size as usize,
                            base,
                            &mut index.exports,
                        );
                    }
                }
            }

            cmd_off += cmdsize;
        }

        index
    }

    pub fn contains_address(&self, vmaddr: u32) -> bool {
        self.segments.iter().any(|seg| seg.contains(vmaddr))
    }

    pub fn from_vmaddr(&self, vmaddr: u32) -> Option<u32> {
        self.segments.iter().find_map(|seg| {
            if seg.contains(vmaddr) {
                Some(vmaddr - seg.vmaddr + seg.fileoff)
            } else {
                None
            }
        })
    }

    /// Index of the segment containing `vmaddr` (i.e. its position in
    /// `segments`, which is also its position in the final load command
    /// list), plus the offset within it.
    pub fn segment_index_and_offset(&self, vmaddr: u32) -> Option<(usize, u32)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, seg)| seg.contains(vmaddr))
            .map(|(i, seg)| (i, vmaddr - seg.vmaddr))
    }

    /// Ordinal of a declared library by name, or `0` (the self/absolute
    /// sentinel) if this image never declared it.
    pub fn libord_with_name(&self, name: &str) -> i32 {
        self.ordinals
            .iter()
            .position(|n| n == name)
            .map(|p| p as i32)
            .unwrap_or(0)
    }

    pub fn exported_symbol(&self, vmaddr: u32) -> &str {
        self.exports
            .iter()
            .find(|(a, _)| *a == vmaddr)
            .map(|(_, s)| s.as_str())
            .unwrap_or("")
    }
}

/// Explicit-stack recursive descent over a dyld export trie (recursion is
/// avoided since the trie is untrusted cache data).
fn walk_export_trie(
    reader: &ByteReader,
    export_off: usize,
    export_size: usize,
    image_vmaddr: u32,
    out: &mut Vec<(u32, String)>,
) {
    let end = export_off + export_size;
    let mut stack: Vec<(usize, String)> = vec![(export_off, String::new())];

    // An export trie is a DAG in well-formed data, but guard against
    // pathological/corrupt input looping forever.
    let mut visited = 0usize;
    let budget = export_size.saturating_mul(4).max(1024);

    while let Some((mut pos, prefix)) = stack.pop() {
        visited += 1;
        if visited > budget || pos >= end {
            continue;
        }

        let terminal_size = reader.uleb_at(&mut pos) as usize;
        if terminal_size != 0 {
            let mut node_pos = pos;
            let _flags = reader.uleb_at(&mut node_pos);
            let addr = reader.uleb_at(&mut node_pos) as u32;
            out.push((addr.wrapping_add(image_vmaddr), prefix.clone()));
        }

        let children_pos = pos + terminal_size;
        if children_pos >= end {
            continue;
        }

        let mut cpos = children_pos;
        let child_count = match reader.byte_at(cpos) {
            Some(b) => b,
            None => continue,
        };
        cpos += 1;

        for _ in 0..child_count {
            let suffix_start = cpos;
            let mut rel = 0usize;
            while reader
                .byte_at(suffix_start + rel)
                .map(|b| b != 0)
                .unwrap_or(false)
            {
                rel += 1;
            }
            let suffix_bytes: Vec<u8> = (0..rel).filter_map(|i| reader.byte_at(suffix_start + i)).collect();
            let suffix = String::from_utf8_lossy(&suffix_bytes).into_owned();
            cpos = suffix_start + rel + 1;
            let child_offset = reader.uleb_at(&mut cpos) as usize;

            let mut child_prefix = prefix.clone();
            child_prefix.push_str(&suffix);
            stack.push((export_off + child_offset, child_prefix));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segname_str_stops_at_nul() {
        let mut name = [0u8; 16];
        name[..6].copy_from_slice(b"__TEXT");
        assert_eq!(segname_str(&name), "__TEXT");
    }

    #[test]
    fn segname_str_handles_full_length_name() {
        let name = *b"__LONG_SEG_NAME_";
        assert_eq!(segname_str(&name), "__LONG_SEG_NAME_");
    }

    #[test]
    fn is_library_declaring_cmd_covers_all_six() {
        for cmd in [
            LC_ID_DYLIB,
            LC_LOAD_DYLIB,
            LC_LOAD_WEAK_DYLIB,
            LC_REEXPORT_DYLIB,
            LC_LAZY_LOAD_DYLIB,
            LC_LOAD_UPWARD_DYLIB,
        ] {
            assert!(is_library_declaring_cmd(cmd));
        }
        assert!(!is_library_declaring_cmd(LC_SEGMENT));
    }
}
