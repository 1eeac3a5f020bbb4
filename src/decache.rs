//! C5: the decacher orchestrator. Given one image's header offset inside a
//! shared cache, reconstructs a standalone Mach-O file: segments keep their
//! relative layout, but two new sections are appended (one per `__TEXT`/
//! `__DATA` segment) holding strings and small structs pulled in from other
//! images, and a synthesized bind opcode stream turns what used to be a
//! same-cache pointer into a normal dyld lazy bind.

use crate::cache::DyldCache;
use crate::error::{DecacheError, Result};
use crate::extrabind::{ExtraBindRepository, ExtraBindSite};
use crate::extrastr::ExtraStringRepository;
use crate::macho::{
    self, DyldInfoCommand, DysymtabCommand, EncryptionInfoCommand, LoadCommand, MachHeader,
    MachOIndex, Nlist, Section, SegmentCommand, SymtabCommand, TwolevelHintsCommand,
    LC_CODE_SIGNATURE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_DYSYMTAB, LC_ENCRYPTION_INFO,
    LC_FUNCTION_STARTS, LC_SEGMENT, LC_SEGMENT_SPLIT_INFO, LC_SYMTAB, LC_TWOLEVEL_HINTS,
};
use crate::objc::{
    CategoryT, ClassRoT, ClassT, MethodT, ObjcListRecord, PropertyT, ProtocolT,
    OBJC_IMAGE_INFO_OPTIMIZED_BY_DYLD,
};
use crate::reader::ByteReader;
use std::mem::{offset_of, size_of};

/// Maps a byte range of the *original* file to the signed shift applied to
/// it in the rewritten file, so any recorded file offset within that range
/// can be translated after the fact.
struct FileoffFixup {
    source_begin: u32,
    source_end: u32,
    delta: i64,
}

fn translate_fileoff(fixups: &[FileoffFixup], old_offset: u32) -> u32 {
    for f in fixups {
        if old_offset >= f.source_begin && old_offset < f.source_end {
            return (old_offset as i64 + f.delta) as u32;
        }
    }
    old_offset
}

/// A site in the output buffer whose little-endian u32 value must be
/// rewritten once the new layout is known, because it still holds a vmaddr
/// pointing into the extra-string repositories built up during the scan (or
/// needs nullifying / masking).
struct PendingPatch {
    /// File offset, in the *original* file's coordinates; translated through
    /// `fixups` at apply time.
    site_offset: u32,
    new_value: u32,
}

/// A patch whose site lives inside a freshly-synthesized extra-string entry
/// rather than anywhere in the original file, so `fixups`/`PendingPatch`
/// (both keyed by original file offset) can't reach it. Resolved once the
/// owning repository's `section_fileoff`/`section_vmaddr` are known, by
/// locating the entry via the vmaddr `insert` returned for it.
struct ExtraPatch {
    in_text_repo: bool,
    entry_vmaddr: u32,
    field_offset: u32,
    new_value: u32,
}

/// New file offsets assigned to each piece of link-edit data during phase 3,
/// consumed when phase 4 rewrites `LC_SYMTAB`/`LC_DYSYMTAB`/`LC_DYLD_INFO*`/
/// the `__LINKEDIT` segment itself.
#[derive(Default, Clone, Copy)]
struct LinkeditLayout {
    linkedit_fileoff: u32,
    linkedit_filesize: u32,

    rebase_off: u32,
    rebase_size: u32,
    bind_off: u32,
    bind_size: u32,
    weak_bind_off: u32,
    weak_bind_size: u32,
    lazy_bind_off: u32,
    lazy_bind_size: u32,
    export_off: u32,
    export_size: u32,

    symoff: u32,
    nsyms: u32,
    stroff: u32,
    strsize: u32,

    tocoff: u32,
    modtaboff: u32,
    extrefsymoff: u32,
    indirectsymoff: u32,
    extreloff: u32,
    locreloff: u32,

    codesig_off: u32,
    ssi_off: u32,
    fs_off: u32,
    hints_off: u32,
}

fn resolve_target(cache: &DyldCache, index: &MachOIndex, target_vmaddr: u32) -> (String, i32) {
    match cache.image_containing_address(target_vmaddr) {
        Some((owner_idx, symbol)) => {
            let owner_path = cache.path_of_image(owner_idx);
            let ordinal = index.libord_with_name(owner_path);
            (symbol, ordinal)
        }
        None => (String::new(), 0),
    }
}

fn set_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn section_bytes(sect: &Section) -> Vec<u8> {
    let mut buf = Vec::with_capacity(size_of::<Section>());
    buf.extend_from_slice(&sect.sectname);
    buf.extend_from_slice(&sect.segname);
    buf.extend_from_slice(&sect.addr.to_le_bytes());
    buf.extend_from_slice(&sect.size.to_le_bytes());
    buf.extend_from_slice(&sect.offset.to_le_bytes());
    buf.extend_from_slice(&sect.align.to_le_bytes());
    buf.extend_from_slice(&sect.reloff.to_le_bytes());
    buf.extend_from_slice(&sect.nreloc.to_le_bytes());
    buf.extend_from_slice(&sect.flags.to_le_bytes());
    buf.extend_from_slice(&sect.reserved1.to_le_bytes());
    buf.extend_from_slice(&sect.reserved2.to_le_bytes());
    debug_assert_eq!(buf.len(), size_of::<Section>());
    buf
}

pub struct Decacher<'a> {
    cache: &'a DyldCache,
    header_offset: usize,
    image_path: String,
    index: MachOIndex<'a>,
    extra_text: ExtraStringRepository<'a>,
    extra_data: ExtraStringRepository<'a>,
    extra_bind: ExtraBindRepository,
    pending_patches: Vec<PendingPatch>,
    extra_patches: Vec<ExtraPatch>,
    fixups: Vec<FileoffFixup>,
}

impl<'a> Decacher<'a> {
    /// Phase 0: opens the image's segment/section index and preallocates the
    /// two Extra-String Repositories, each rooted at the vmaddr immediately
    /// past its target segment's current end.
    pub fn new(cache: &'a DyldCache, image_index: usize) -> Option<Self> {
        let header_offset = cache.header_offset_of_image(image_index)?;
        let image_vmaddr = cache.image_address(image_index) as u32;
        let image_path = cache.path_of_image(image_index).to_string();
        let index = MachOIndex::parse(cache.reader(), header_offset, Some(image_vmaddr));
        if index.segments.is_empty() {
            return None;
        }

        let text_seg = index.segments.iter().find(|s| s.name() == "__TEXT");
        let data_seg = index.segments.iter().find(|s| s.name() == "__DATA");

        let mut extra_text =
            ExtraStringRepository::new(segname("__TEXT"), segname("__objc_extratxt"), 2, 0);
        let mut extra_data =
            ExtraStringRepository::new(segname("__DATA"), segname("__objc_extradat"), 0, 2);
        if let Some(seg) = text_seg {
            extra_text.set_section_vmaddr(seg.vmaddr + seg.vmsize);
        }
        if let Some(seg) = data_seg {
            extra_data.set_section_vmaddr(seg.vmaddr + seg.vmsize);
        }

        Some(Decacher {
            cache,
            header_offset,
            image_path,
            index,
            extra_text,
            extra_data,
            extra_bind: ExtraBindRepository::new(),
            pending_patches: Vec::new(),
            extra_patches: Vec::new(),
            fixups: Vec::new(),
        })
    }

    fn reader(&self) -> &'a ByteReader {
        self.cache.reader()
    }

    /// Registers `override_vmaddr` (a pointer slot at that address in the
    /// current image) as needing a lazy bind to `target_vmaddr`, unless the
    /// target is null or already inside this image (nothing to fix up).
    fn add_extlink_to(&mut self, target_vmaddr: u32, override_vmaddr: u32) {
        if target_vmaddr == 0 || self.index.contains_address(target_vmaddr) {
            return;
        }
        let Some((seg_idx, seg_off)) = self.index.segment_index_and_offset(override_vmaddr) else {
            return;
        };
        let cache = self.cache;
        let index = &self.index;
        self.extra_bind.insert(
            target_vmaddr,
            ExtraBindSite {
                segment_index: seg_idx,
                segment_offset: seg_off,
            },
            // Only runs the first time this target is seen; the symbol
            // lookup re-parses the owning image's export trie, so skipping
            // it on repeat hits is the whole point of the two-phase lookup
            // in `DyldCache::image_containing_address`.
            || resolve_target(cache, index, target_vmaddr),
        );
        if let Some(old_off) = self.index.from_vmaddr(override_vmaddr) {
            self.pending_patches.push(PendingPatch {
                site_offset: old_off,
                new_value: 0,
            });
        }
    }

    /// Copies a method/property list (and the names it references, if they
    /// live outside this image) into the `__TEXT` extra-string repository,
    /// then patches the pointer at `override_vmaddr` to the new location.
    /// No-op if `list_vmaddr` is null.
    fn prepare_patch_objc_list<T: ObjcListRecord + Copy>(
        &mut self,
        list_vmaddr: u32,
        override_vmaddr: u32,
    ) -> Result<()> {
        if list_vmaddr == 0 {
            return Ok(());
        }
        let Some(file_off) = self.to_cache_file_offset(list_vmaddr) else {
            return Ok(());
        };
        let reader = self.reader();
        let entsize_and_flags = reader.peek_at::<u32>(file_off).copied().unwrap_or(0);
        let count = reader.peek_at::<u32>(file_off + 4).copied().unwrap_or(0) as usize;
        let entsize = (entsize_and_flags & !3) as usize;
        let expected = std::mem::size_of::<T>();
        if entsize != expected {
            return Err(DecacheError::MalformedObjcList {
                path: self.image_path.clone(),
                vmaddr: list_vmaddr,
                expected,
                actual: entsize,
            });
        }

        if self.index.contains_address(list_vmaddr) {
            // Already ours; only its out-of-image name fields, if any, need
            // chasing into the extra-string repository (the list record
            // itself doesn't move).
            for j in 0..count {
                let rec_off = file_off + 8 + j * expected;
                self.chase_out_of_image_name(rec_off + T::NAME_OFFSET, rec_off + T::NAME_OFFSET);
            }
            return Ok(());
        }

        let total = 8 + expected * count;
        let reader = self.reader();
        let Some(bytes) = reader.peek_array::<u8>(file_off, total) else {
            return Ok(());
        };
        let new_vmaddr = self.extra_text.insert(bytes);

        // Names within the copied list still reference the *original*
        // file; chase and re-home them too. The copied list now lives
        // inside a synthesized `__TEXT` blob with no original file offset
        // of its own, so its name fields can't go through `pending_patches`
        // (which resolves through `fixups`, keyed by original file offset);
        // they're recorded as `extra_patches` instead, resolved once the
        // repository's final layout is known.
        for j in 0..count {
            let name_field_off = file_off + 8 + j * expected + T::NAME_OFFSET;
            let name_vmaddr = self
                .reader()
                .peek_at::<u32>(name_field_off)
                .copied()
                .unwrap_or(0);
            if name_vmaddr != 0 && !self.index.contains_address(name_vmaddr) {
                if let Some(name_off) = self.to_cache_file_offset(name_vmaddr) {
                    if let Some(cstr) = self.reader().peek_ascii_cstring_at(name_off) {
                        if let Some(with_nul) =
                            self.reader().peek_array::<u8>(name_off, cstr.len() + 1)
                        {
                            let new_str_vmaddr = self.extra_text.insert_cstr(with_nul);
                            self.extra_patches.push(ExtraPatch {
                                in_text_repo: true,
                                entry_vmaddr: new_vmaddr,
                                field_offset: (8 + j * expected + T::NAME_OFFSET) as u32,
                                new_value: new_str_vmaddr,
                            });
                        }
                    }
                }
            }
        }

        self.pending_patches.push(PendingPatch {
            site_offset: match self.index.from_vmaddr(override_vmaddr) {
                Some(o) => o,
                None => return Ok(()),
            },
            new_value: new_vmaddr,
        });
        Ok(())
    }

    /// A name field belonging to a record that stayed in place (the list
    /// itself lives inside this image): the name may still point outside,
    /// in which case it's copied into `__TEXT` and the field is patched.
    fn chase_out_of_image_name(&mut self, name_field_off: usize, override_off: usize) {
        let name_vmaddr = self
            .reader()
            .peek_at::<u32>(name_field_off)
            .copied()
            .unwrap_or(0);
        if name_vmaddr == 0 || self.index.contains_address(name_vmaddr) {
            return;
        }
        let Some(name_off) = self.to_cache_file_offset(name_vmaddr) else {
            return;
        };
        let Some(cstr) = self.reader().peek_ascii_cstring_at(name_off) else {
            return;
        };
        let Some(with_nul) = self.reader().peek_array::<u8>(name_off, cstr.len() + 1) else {
            return;
        };
        let new_vmaddr = self.extra_text.insert_cstr(with_nul);
        self.pending_patches.push(PendingPatch {
            site_offset: override_off as u32,
            new_value: new_vmaddr,
        });
    }

    fn to_file_offset(&self, vmaddr: u32) -> Option<usize> {
        self.index.from_vmaddr(vmaddr).map(|o| o as usize)
    }

    /// Resolves a vmaddr that may belong to *any* image in the cache, via
    /// the cache's global mapping table. `to_file_offset` only searches
    /// this image's own segments and returns `None` for a foreign address;
    /// use this instead wherever the address has already been shown to lie
    /// outside the image (or its ownership isn't known yet).
    fn to_cache_file_offset(&self, vmaddr: u32) -> Option<usize> {
        self.cache.from_cache_vmaddr(vmaddr as u64)
    }

    /// Phase 1: scans the well-known Objective-C sections for pointers that
    /// cross image boundaries, queuing extra-bind sites and extra-string
    /// copies as it goes.
    fn scan_objc(&mut self) -> Result<()> {
        let sections = self.collect_sections();

        for sect in &sections {
            match sect.sectname() {
                "__objc_imageinfo" => self.patch_image_info(sect),
                "__objc_selrefs" => self.scan_selrefs(sect),
                "__objc_classlist" => self.scan_classlist(sect)?,
                "__objc_classrefs" => self.scan_classrefs(sect),
                "__objc_catlist" => self.scan_category_list(sect)?,
                "__objc_protolist" => self.scan_protocol_list(sect)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn collect_sections(&self) -> Vec<Section> {
        let mut out = Vec::new();
        for seg in &self.index.segments {
            if seg.name() != "__DATA" {
                continue;
            }
            let seg_off = {
                let ptr = *seg as *const SegmentCommand as usize;
                ptr - self.reader().base_ptr()
            };
            let first_section_off = seg_off + std::mem::size_of::<SegmentCommand>();
            if let Some(secs) = self
                .reader()
                .peek_array::<Section>(first_section_off, seg.nsects as usize)
            {
                out.extend_from_slice(secs);
            }
        }
        out
    }

    fn patch_image_info(&mut self, sect: &Section) {
        let Some(flags_off) = self.to_file_offset(sect.addr + 4) else {
            return;
        };
        let flags = self
            .reader()
            .peek_at::<u32>(flags_off)
            .copied()
            .unwrap_or(0);
        let cleared = flags & !OBJC_IMAGE_INFO_OPTIMIZED_BY_DYLD;
        if cleared != flags {
            self.pending_patches.push(PendingPatch {
                site_offset: flags_off as u32,
                new_value: cleared,
            });
        }
    }

    fn scan_selrefs(&mut self, sect: &Section) {
        let count = (sect.size / 4) as usize;
        let Some(base_off) = self.to_file_offset(sect.addr) else {
            return;
        };
        for i in 0..count {
            let slot_off = base_off + i * 4;
            let target = self.reader().peek_at::<u32>(slot_off).copied().unwrap_or(0);
            if target == 0 || self.index.contains_address(target) {
                continue;
            }
            if let Some(name_off) = self.to_cache_file_offset(target) {
                if let Some(cstr) = self.reader().peek_ascii_cstring_at(name_off) {
                    if let Some(with_nul) =
                        self.reader().peek_array::<u8>(name_off, cstr.len() + 1)
                    {
                        let new_vmaddr = self.extra_text.insert_cstr(with_nul);
                        self.pending_patches.push(PendingPatch {
                            site_offset: slot_off as u32,
                            new_value: new_vmaddr,
                        });
                    }
                }
            }
        }
    }

    fn scan_classlist(&mut self, sect: &Section) -> Result<()> {
        let count = (sect.size / 4) as usize;
        let Some(base_off) = self.to_file_offset(sect.addr) else {
            return Ok(());
        };
        for i in 0..count {
            let slot_off = base_off + i * 4;
            let class_vmaddr = self.reader().peek_at::<u32>(slot_off).copied().unwrap_or(0);
            if class_vmaddr == 0 {
                continue;
            }
            if !self.index.contains_address(class_vmaddr) {
                self.add_extlink_to(class_vmaddr, sect.addr + (i as u32) * 4);
                continue;
            }
            self.scan_one_class(class_vmaddr)?;
        }
        Ok(())
    }

    /// Every `__objc_classrefs` entry is handled uniformly: `add_extlink_to`
    /// is already a no-op for a class living inside this image (it will have
    /// been, or will be, visited via `__objc_classlist` instead).
    fn scan_classrefs(&mut self, sect: &Section) {
        let count = (sect.size / 4) as usize;
        let Some(base_off) = self.to_file_offset(sect.addr) else {
            return;
        };
        for i in 0..count {
            let slot_off = base_off + i * 4;
            let class_vmaddr = self.reader().peek_at::<u32>(slot_off).copied().unwrap_or(0);
            if class_vmaddr != 0 {
                self.add_extlink_to(class_vmaddr, sect.addr + (i as u32) * 4);
            }
        }
    }

    /// Resolves `superclass`/`isa` (the metaclass pointer) of a class living
    /// in this image via `add_extlink_to`, descends into the metaclass the
    /// same way, then patches both the class's and the metaclass's
    /// `baseMethods`/`baseProperties` lists.
    fn scan_one_class(&mut self, class_vmaddr: u32) -> Result<()> {
        let Some(class_off) = self.to_file_offset(class_vmaddr) else {
            return Ok(());
        };
        let Some(class) = self.reader().peek_at::<ClassT>(class_off).copied() else {
            return Ok(());
        };

        self.add_extlink_to(
            class.superclass,
            class_vmaddr + offset_of!(ClassT, superclass) as u32,
        );
        self.add_extlink_to(class.isa, class_vmaddr + offset_of!(ClassT, isa) as u32);

        let metaclass_vmaddr = class.isa;
        let metaclass = if metaclass_vmaddr != 0 && self.index.contains_address(metaclass_vmaddr) {
            self.to_file_offset(metaclass_vmaddr)
                .and_then(|o| self.reader().peek_at::<ClassT>(o).copied())
        } else {
            None
        };

        if let Some(meta) = metaclass {
            self.add_extlink_to(
                meta.isa,
                metaclass_vmaddr + offset_of!(ClassT, isa) as u32,
            );
            self.add_extlink_to(
                meta.superclass,
                metaclass_vmaddr + offset_of!(ClassT, superclass) as u32,
            );
        }

        self.patch_class_ro_lists(class.data)?;
        if let Some(meta) = metaclass {
            self.patch_class_ro_lists(meta.data)?;
        }
        Ok(())
    }

    fn patch_class_ro_lists(&mut self, data_field: u32) -> Result<()> {
        let data_vmaddr = data_field & !0x3;
        let Some(ro_off) = self.to_file_offset(data_vmaddr) else {
            return Ok(());
        };
        let Some(ro) = self.reader().peek_at::<ClassRoT>(ro_off).copied() else {
            return Ok(());
        };
        self.prepare_patch_objc_list::<MethodT>(
            ro.base_methods,
            data_vmaddr + offset_of!(ClassRoT, base_methods) as u32,
        )?;
        self.prepare_patch_objc_list::<PropertyT>(
            ro.base_properties,
            data_vmaddr + offset_of!(ClassRoT, base_properties) as u32,
        )?;
        Ok(())
    }

    fn scan_category_list(&mut self, sect: &Section) -> Result<()> {
        let count = (sect.size / 4) as usize;
        let Some(base_off) = self.to_file_offset(sect.addr) else {
            return Ok(());
        };
        for i in 0..count {
            let slot_off = base_off + i * 4;
            let cat_vmaddr = self.reader().peek_at::<u32>(slot_off).copied().unwrap_or(0);
            if cat_vmaddr == 0 {
                continue;
            }
            if !self.index.contains_address(cat_vmaddr) {
                self.add_extlink_to(cat_vmaddr, sect.addr + (i as u32) * 4);
                continue;
            }
            let Some(cat_off) = self.to_file_offset(cat_vmaddr) else {
                continue;
            };
            let Some(cat) = self.reader().peek_at::<CategoryT>(cat_off).copied() else {
                continue;
            };
            self.add_extlink_to(cat.cls, cat_vmaddr + offset_of!(CategoryT, cls) as u32);
            self.prepare_patch_objc_list::<MethodT>(
                cat.instance_methods,
                cat_vmaddr + offset_of!(CategoryT, instance_methods) as u32,
            )?;
            self.prepare_patch_objc_list::<MethodT>(
                cat.class_methods,
                cat_vmaddr + offset_of!(CategoryT, class_methods) as u32,
            )?;
        }
        Ok(())
    }

    fn scan_protocol_list(&mut self, sect: &Section) -> Result<()> {
        let count = (sect.size / 4) as usize;
        let Some(base_off) = self.to_file_offset(sect.addr) else {
            return Ok(());
        };
        for i in 0..count {
            let slot_off = base_off + i * 4;
            let proto_vmaddr = self.reader().peek_at::<u32>(slot_off).copied().unwrap_or(0);
            if proto_vmaddr == 0 {
                continue;
            }
            if !self.index.contains_address(proto_vmaddr) {
                self.add_extlink_to(proto_vmaddr, sect.addr + (i as u32) * 4);
                continue;
            }
            let Some(proto_off) = self.to_file_offset(proto_vmaddr) else {
                continue;
            };
            let Some(proto) = self.reader().peek_at::<ProtocolT>(proto_off).copied() else {
                continue;
            };
            self.prepare_patch_objc_list::<MethodT>(
                proto.instance_methods,
                proto_vmaddr + offset_of!(ProtocolT, instance_methods) as u32,
            )?;
            self.prepare_patch_objc_list::<MethodT>(
                proto.class_methods,
                proto_vmaddr + offset_of!(ProtocolT, class_methods) as u32,
            )?;
            self.prepare_patch_objc_list::<MethodT>(
                proto.optional_instance_methods,
                proto_vmaddr + offset_of!(ProtocolT, optional_instance_methods) as u32,
            )?;
            self.prepare_patch_objc_list::<MethodT>(
                proto.optional_class_methods,
                proto_vmaddr + offset_of!(ProtocolT, optional_class_methods) as u32,
            )?;
        }
        Ok(())
    }

    /// Writes the fully rewritten image to an owned buffer.
    pub fn run(mut self) -> Result<Vec<u8>> {
        self.scan_objc()?;

        let header_off = self.header_offset;
        let reader = self.reader();
        let header = match reader.peek_at::<MachHeader>(header_off).copied() {
            Some(h) => h,
            None => {
                return Err(DecacheError::UnsupportedMachOMagic {
                    path: self.image_path.clone(),
                })
            }
        };
        if header.magic != macho::MH_MAGIC {
            return Err(DecacheError::UnsupportedMachOMagic {
                path: self.image_path.clone(),
            });
        }

        let old_sizeofcmds = header.sizeofcmds;
        let cmds_start = header_off + size_of::<MachHeader>();
        let load_commands_end = cmds_start + old_sizeofcmds as usize;

        let extra_sections = self.extra_text.has_content() as u32 + self.extra_data.has_content() as u32;
        let new_sizeofcmds = old_sizeofcmds + extra_sections * size_of::<Section>() as u32;
        let header_region_new_size = size_of::<MachHeader>() + new_sizeofcmds as usize;

        // Reserve the header+commands region; it's filled in for real once
        // every other phase has decided the offsets it references.
        let mut out = vec![0u8; header_region_new_size];

        // Phase 2: segment data, in file-offset order, each immediately
        // followed by its extra-string content if it owns one of the two
        // repositories. `__LINKEDIT` carries no bytes of its own here; its
        // contents are synthesized fresh in phase 3.
        let mut segs: Vec<&SegmentCommand> = self
            .index
            .segments
            .iter()
            .filter(|s| s.name() != "__LINKEDIT")
            .copied()
            .collect();
        segs.sort_by_key(|s| s.fileoff);

        for seg in &segs {
            let seg_end = seg.fileoff + seg.filesize;
            // The segment containing the Mach header (always __TEXT) has its
            // bytes split across the (possibly resized) header+commands
            // region and the segment data that follows it. This assumes the
            // header sits at the very start of that segment's file range, as
            // every dyld shared cache image does.
            let contains_header = seg.fileoff <= header_off as u32 && (header_off as u32) < seg_end;
            if contains_header {
                self.fixups.push(FileoffFixup {
                    source_begin: seg.fileoff,
                    source_end: load_commands_end as u32,
                    delta: -(seg.fileoff as i64),
                });
                let tail_delta = header_region_new_size as i64 - load_commands_end as i64;
                self.fixups.push(FileoffFixup {
                    source_begin: load_commands_end as u32,
                    source_end: seg_end,
                    delta: tail_delta,
                });
                if (load_commands_end as u32) < seg_end {
                    let bytes = self
                        .reader()
                        .peek_array::<u8>(load_commands_end, seg_end as usize - load_commands_end)
                        .unwrap_or(&[]);
                    out.extend_from_slice(bytes);
                }
            } else {
                let delta = out.len() as i64 - seg.fileoff as i64;
                self.fixups.push(FileoffFixup {
                    source_begin: seg.fileoff,
                    source_end: seg_end,
                    delta,
                });
                let bytes = self
                    .reader()
                    .peek_array::<u8>(seg.fileoff as usize, seg.filesize as usize)
                    .unwrap_or(&[]);
                out.extend_from_slice(bytes);
            }

            let wrote_text = seg.name() == "__TEXT" && self.extra_text.has_content();
            let wrote_data = seg.name() == "__DATA" && self.extra_data.has_content();
            if wrote_text {
                self.extra_text.set_section_fileoff(out.len() as u32);
                self.extra_text
                    .for_each_entry(|e| out.extend_from_slice(e.bytes));
            }
            if wrote_data {
                self.extra_data.set_section_fileoff(out.len() as u32);
                self.extra_data
                    .for_each_entry(|e| out.extend_from_slice(e.bytes));
            }
            let before_pad = out.len();
            while out.len() % 8 != 0 {
                out.push(0);
            }
            let pad = (out.len() - before_pad) as u32;
            if pad != 0 {
                if wrote_text {
                    self.extra_text.increase_size_by(pad);
                }
                if wrote_data {
                    self.extra_data.increase_size_by(pad);
                }
            }
        }

        let linkedit = self.rebuild_linkedit(&mut out);
        self.write_header_and_commands(&mut out, header, new_sizeofcmds, &linkedit);
        self.apply_pending_patches(&mut out);

        Ok(out)
    }

    /// Phase 3: emits a fresh link-edit region built solely from this
    /// image's slices of the cache's global tables, recording where each
    /// piece landed so phase 4 can patch the load commands to match.
    fn rebuild_linkedit(&mut self, out: &mut Vec<u8>) -> LinkeditLayout {
        let mut layout = LinkeditLayout {
            linkedit_fileoff: out.len() as u32,
            ..Default::default()
        };

        let mut cmd_off = self.header_offset + size_of::<MachHeader>();
        let header = self
            .reader()
            .peek_at::<MachHeader>(self.header_offset)
            .copied()
            .unwrap();

        for _ in 0..header.ncmds {
            let Some(lc) = self.reader().peek_at::<LoadCommand>(cmd_off).copied() else {
                break;
            };
            if lc.cmdsize == 0 {
                break;
            }
            match lc.cmd {
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    if let Some(di) = self.reader().peek_at::<DyldInfoCommand>(cmd_off).copied() {
                        if di.rebase_off != 0 && di.rebase_size != 0 {
                            layout.rebase_off = out.len() as u32;
                            layout.rebase_size = di.rebase_size;
                            let bytes = self
                                .reader()
                                .peek_array::<u8>(di.rebase_off as usize, di.rebase_size as usize)
                                .unwrap_or(&[]);
                            out.extend_from_slice(bytes);
                        }

                        // Synthesized lazy-bind entries are written first,
                        // then the cache's original bind bytes right after;
                        // downstream tools must tolerate two concatenated
                        // bind programs, each terminated by its own DONE.
                        let mut bind_bytes = Vec::new();
                        self.extra_bind.serialize(&mut bind_bytes);
                        if !bind_bytes.is_empty() || di.bind_off != 0 {
                            layout.bind_off = out.len() as u32;
                            out.extend_from_slice(&bind_bytes);
                            let original_bind = if di.bind_off != 0 {
                                self.reader()
                                    .peek_array::<u8>(di.bind_off as usize, di.bind_size as usize)
                                    .unwrap_or(&[])
                            } else {
                                &[]
                            };
                            out.extend_from_slice(original_bind);
                            layout.bind_size = bind_bytes.len() as u32 + di.bind_size;
                        }

                        if di.weak_bind_off != 0 && di.weak_bind_size != 0 {
                            layout.weak_bind_off = out.len() as u32;
                            layout.weak_bind_size = di.weak_bind_size;
                            let bytes = self
                                .reader()
                                .peek_array::<u8>(di.weak_bind_off as usize, di.weak_bind_size as usize)
                                .unwrap_or(&[]);
                            out.extend_from_slice(bytes);
                        }
                        if di.lazy_bind_off != 0 && di.lazy_bind_size != 0 {
                            layout.lazy_bind_off = out.len() as u32;
                            layout.lazy_bind_size = di.lazy_bind_size;
                            let bytes = self
                                .reader()
                                .peek_array::<u8>(di.lazy_bind_off as usize, di.lazy_bind_size as usize)
                                .unwrap_or(&[]);
                            out.extend_from_slice(bytes);
                        }
                        if di.export_off != 0 && di.export_size != 0 {
                            layout.export_off = out.len() as u32;
                            layout.export_size = di.export_size;
                            let bytes = self
                                .reader()
                                .peek_array::<u8>(di.export_off as usize, di.export_size as usize)
                                .unwrap_or(&[]);
                            out.extend_from_slice(bytes);
                        }
                    }
                }
                LC_SYMTAB => {
                    if let Some(st) = self.reader().peek_at::<SymtabCommand>(cmd_off).copied() {
                        layout.nsyms = st.nsyms;
                        // Offset 0 is conventionally a reserved empty string.
                        let mut strtab: Vec<u8> = vec![0];
                        let mut nlist_bytes: Vec<u8> = Vec::with_capacity(st.nsyms as usize * size_of::<Nlist>());
                        for i in 0..st.nsyms as usize {
                            let nl_off = st.symoff as usize + i * size_of::<Nlist>();
                            let Some(nl) = self.reader().peek_at::<Nlist>(nl_off).copied() else {
                                continue;
                            };
                            let str_off = st.stroff as usize + nl.n_strx as usize;
                            let name = self
                                .reader()
                                .peek_ascii_cstring_at(str_off)
                                .map(|b| b.to_vec())
                                .unwrap_or_default();
                            let new_strx = strtab.len() as i32;
                            strtab.extend_from_slice(&name);
                            strtab.push(0);

                            let n_type = nl.n_type;
                            let n_sect = nl.n_sect;
                            let n_desc = nl.n_desc;
                            let n_value = nl.n_value;
                            nlist_bytes.extend_from_slice(&new_strx.to_le_bytes());
                            nlist_bytes.push(n_type);
                            nlist_bytes.push(n_sect);
                            nlist_bytes.extend_from_slice(&n_desc.to_le_bytes());
                            nlist_bytes.extend_from_slice(&n_value.to_le_bytes());
                        }

                        layout.stroff = out.len() as u32;
                        out.extend_from_slice(&strtab);
                        layout.strsize = strtab.len() as u32;

                        while out.len() % 4 != 0 {
                            out.push(0);
                        }
                        layout.symoff = out.len() as u32;
                        out.extend_from_slice(&nlist_bytes);
                    }
                }
                LC_DYSYMTAB => {
                    if let Some(ds) = self.reader().peek_at::<DysymtabCommand>(cmd_off).copied() {
                        layout.tocoff = self.copy_blob_aligned(out, ds.tocoff, ds.ntoc * 8, 8);
                        layout.modtaboff = self.copy_blob_aligned(out, ds.modtaboff, ds.nmodtab * 52, 52);
                        layout.extrefsymoff =
                            self.copy_blob_aligned(out, ds.extrefsymoff, ds.nextrefsyms * 4, 4);
                        layout.indirectsymoff =
                            self.copy_blob_aligned(out, ds.indirectsymoff, ds.nindirectsyms * 4, 4);
                        layout.extreloff = self.copy_blob_aligned(out, ds.extreloff, ds.nextrel * 8, 8);
                        layout.locreloff = self.copy_blob_aligned(out, ds.locreloff, ds.nlocrel * 8, 8);
                    }
                }
                LC_CODE_SIGNATURE => {
                    if let Some(ld) = self
                        .reader()
                        .peek_at::<macho::LinkeditDataCommand>(cmd_off)
                        .copied()
                    {
                        layout.codesig_off = self.copy_blob_aligned(out, ld.dataoff, ld.datasize, 1);
                    }
                }
                LC_SEGMENT_SPLIT_INFO => {
                    if let Some(ld) = self
                        .reader()
                        .peek_at::<macho::LinkeditDataCommand>(cmd_off)
                        .copied()
                    {
                        layout.ssi_off = self.copy_blob_aligned(out, ld.dataoff, ld.datasize, 1);
                    }
                }
                LC_FUNCTION_STARTS => {
                    if let Some(ld) = self
                        .reader()
                        .peek_at::<macho::LinkeditDataCommand>(cmd_off)
                        .copied()
                    {
                        layout.fs_off = self.copy_blob_aligned(out, ld.dataoff, ld.datasize, 1);
                    }
                }
                LC_TWOLEVEL_HINTS => {
                    if let Some(th) = self.reader().peek_at::<TwolevelHintsCommand>(cmd_off).copied() {
                        layout.hints_off = self.copy_blob_aligned(out, th.offset, th.nhints * 4, 4);
                    }
                }
                _ => {}
            }
            cmd_off += lc.cmdsize as usize;
        }

        layout.linkedit_filesize = out.len() as u32 - layout.linkedit_fileoff;
        layout
    }

    /// Copies `size` bytes from `offset` into `out`, padding `out` to
    /// `align` first; returns the new offset, or 0 (absent) if there was
    /// nothing to copy.
    fn copy_blob_aligned(&self, out: &mut Vec<u8>, offset: u32, size: u32, align: u32) -> u32 {
        if offset == 0 || size == 0 {
            return 0;
        }
        while (out.len() as u32) % align != 0 {
            out.push(0);
        }
        let new_off = out.len() as u32;
        let bytes = self
            .reader()
            .peek_array::<u8>(offset as usize, size as usize)
            .unwrap_or(&[]);
        out.extend_from_slice(bytes);
        new_off
    }

    /// Phase 4: rewrites the header and every load command
    /// into `out[0..header_region_new_size)`. Segment `fileoff`s and every
    /// section's `offset`/`reloff` are translated through `self.fixups`;
    /// `__TEXT`/`__DATA` (whichever owns extra content) gains an appended
    /// section descriptor and grows accordingly; link-edit-bearing commands
    /// get the offsets `rebuild_linkedit` assigned.
    fn write_header_and_commands(
        &self,
        out: &mut [u8],
        header: MachHeader,
        new_sizeofcmds: u32,
        linkedit: &LinkeditLayout,
    ) {
        let mut buf = Vec::with_capacity(size_of::<MachHeader>() + new_sizeofcmds as usize);
        buf.extend_from_slice(&header.magic.to_le_bytes());
        buf.extend_from_slice(&header.cputype.to_le_bytes());
        buf.extend_from_slice(&header.cpusubtype.to_le_bytes());
        buf.extend_from_slice(&header.filetype.to_le_bytes());
        buf.extend_from_slice(&header.ncmds.to_le_bytes());
        buf.extend_from_slice(&new_sizeofcmds.to_le_bytes());
        buf.extend_from_slice(&header.flags.to_le_bytes());
        debug_assert_eq!(buf.len(), size_of::<MachHeader>());

        let mut cmd_off = self.header_offset + size_of::<MachHeader>();
        for _ in 0..header.ncmds {
            let Some(lc) = self.reader().peek_at::<LoadCommand>(cmd_off).copied() else {
                break;
            };
            if lc.cmdsize == 0 {
                break;
            }
            let raw = self
                .reader()
                .peek_array::<u8>(cmd_off, lc.cmdsize as usize)
                .unwrap_or(&[]);
            let mut cmdbuf = raw.to_vec();

            match lc.cmd {
                LC_SEGMENT => {
                    if let Some(seg) = self.reader().peek_at::<SegmentCommand>(cmd_off).copied() {
                        if seg.name() == "__LINKEDIT" {
                            set_u32(
                                &mut cmdbuf,
                                offset_of!(SegmentCommand, vmsize),
                                linkedit.linkedit_filesize,
                            );
                            set_u32(
                                &mut cmdbuf,
                                offset_of!(SegmentCommand, fileoff),
                                linkedit.linkedit_fileoff,
                            );
                            set_u32(
                                &mut cmdbuf,
                                offset_of!(SegmentCommand, filesize),
                                linkedit.linkedit_filesize,
                            );
                        } else {
                            let new_fileoff = translate_fileoff(&self.fixups, seg.fileoff);
                            set_u32(&mut cmdbuf, offset_of!(SegmentCommand, fileoff), new_fileoff);

                            let sect_base = size_of::<SegmentCommand>();
                            for i in 0..seg.nsects as usize {
                                let sect_off = sect_base + i * size_of::<Section>();
                                if sect_off + size_of::<Section>() > cmdbuf.len() {
                                    break;
                                }
                                let off_field = sect_off + offset_of!(Section, offset);
                                let orig_offset = get_u32(&cmdbuf, off_field);
                                if orig_offset != 0 {
                                    set_u32(&mut cmdbuf, off_field, translate_fileoff(&self.fixups, orig_offset));
                                }
                                let reloff_field = sect_off + offset_of!(Section, reloff);
                                let orig_reloff = get_u32(&cmdbuf, reloff_field);
                                if orig_reloff != 0 {
                                    set_u32(
                                        &mut cmdbuf,
                                        reloff_field,
                                        translate_fileoff(&self.fixups, orig_reloff),
                                    );
                                }
                            }

                            let repo = match seg.name() {
                                "__TEXT" => Some(&self.extra_text),
                                "__DATA" => Some(&self.extra_data),
                                _ => None,
                            };
                            if let Some(repo) = repo {
                                if repo.has_content() {
                                    let extra_size = repo.total_size();
                                    set_u32(
                                        &mut cmdbuf,
                                        offset_of!(SegmentCommand, vmsize),
                                        seg.vmsize + extra_size,
                                    );
                                    set_u32(
                                        &mut cmdbuf,
                                        offset_of!(SegmentCommand, filesize),
                                        seg.filesize + extra_size,
                                    );
                                    set_u32(
                                        &mut cmdbuf,
                                        offset_of!(SegmentCommand, nsects),
                                        seg.nsects + 1,
                                    );
                                    set_u32(
                                        &mut cmdbuf,
                                        offset_of!(SegmentCommand, cmdsize),
                                        seg.cmdsize + size_of::<Section>() as u32,
                                    );
                                    cmdbuf.extend_from_slice(&section_bytes(&repo.section_template()));
                                }
                            }
                        }
                    }
                }
                LC_SYMTAB => {
                    set_u32(&mut cmdbuf, offset_of!(SymtabCommand, symoff), linkedit.symoff);
                    set_u32(&mut cmdbuf, offset_of!(SymtabCommand, nsyms), linkedit.nsyms);
                    set_u32(&mut cmdbuf, offset_of!(SymtabCommand, stroff), linkedit.stroff);
                    set_u32(&mut cmdbuf, offset_of!(SymtabCommand, strsize), linkedit.strsize);
                }
                LC_DYSYMTAB => {
                    set_u32(&mut cmdbuf, offset_of!(DysymtabCommand, tocoff), linkedit.tocoff);
                    set_u32(&mut cmdbuf, offset_of!(DysymtabCommand, modtaboff), linkedit.modtaboff);
                    set_u32(
                        &mut cmdbuf,
                        offset_of!(DysymtabCommand, extrefsymoff),
                        linkedit.extrefsymoff,
                    );
                    set_u32(
                        &mut cmdbuf,
                        offset_of!(DysymtabCommand, indirectsymoff),
                        linkedit.indirectsymoff,
                    );
                    set_u32(&mut cmdbuf, offset_of!(DysymtabCommand, extreloff), linkedit.extreloff);
                    set_u32(&mut cmdbuf, offset_of!(DysymtabCommand, locreloff), linkedit.locreloff);
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    set_u32(&mut cmdbuf, offset_of!(DyldInfoCommand, rebase_off), linkedit.rebase_off);
                    set_u32(&mut cmdbuf, offset_of!(DyldInfoCommand, rebase_size), linkedit.rebase_size);
                    set_u32(&mut cmdbuf, offset_of!(DyldInfoCommand, bind_off), linkedit.bind_off);
                    set_u32(&mut cmdbuf, offset_of!(DyldInfoCommand, bind_size), linkedit.bind_size);
                    set_u32(
                        &mut cmdbuf,
                        offset_of!(DyldInfoCommand, weak_bind_off),
                        linkedit.weak_bind_off,
                    );
                    set_u32(
                        &mut cmdbuf,
                        offset_of!(DyldInfoCommand, weak_bind_size),
                        linkedit.weak_bind_size,
                    );
                    set_u32(
                        &mut cmdbuf,
                        offset_of!(DyldInfoCommand, lazy_bind_off),
                        linkedit.lazy_bind_off,
                    );
                    set_u32(
                        &mut cmdbuf,
                        offset_of!(DyldInfoCommand, lazy_bind_size),
                        linkedit.lazy_bind_size,
                    );
                    set_u32(&mut cmdbuf, offset_of!(DyldInfoCommand, export_off), linkedit.export_off);
                    set_u32(&mut cmdbuf, offset_of!(DyldInfoCommand, export_size), linkedit.export_size);
                }
                LC_CODE_SIGNATURE => {
                    set_u32(
                        &mut cmdbuf,
                        offset_of!(macho::LinkeditDataCommand, dataoff),
                        linkedit.codesig_off,
                    );
                }
                LC_SEGMENT_SPLIT_INFO => {
                    set_u32(
                        &mut cmdbuf,
                        offset_of!(macho::LinkeditDataCommand, dataoff),
                        linkedit.ssi_off,
                    );
                }
                LC_FUNCTION_STARTS => {
                    set_u32(
                        &mut cmdbuf,
                        offset_of!(macho::LinkeditDataCommand, dataoff),
                        linkedit.fs_off,
                    );
                }
                LC_TWOLEVEL_HINTS => {
                    set_u32(&mut cmdbuf, offset_of!(TwolevelHintsCommand, offset), linkedit.hints_off);
                }
                LC_ENCRYPTION_INFO => {
                    if let Some(ei) = self.reader().peek_at::<EncryptionInfoCommand>(cmd_off).copied() {
                        let new_off = translate_fileoff(&self.fixups, ei.cryptoff);
                        set_u32(&mut cmdbuf, offset_of!(EncryptionInfoCommand, cryptoff), new_off);
                    }
                }
                _ => {}
            }

            buf.extend_from_slice(&cmdbuf);
            cmd_off += lc.cmdsize as usize;
        }

        debug_assert_eq!(buf.len(), size_of::<MachHeader>() + new_sizeofcmds as usize);
        out[..buf.len()].copy_from_slice(&buf);
    }

    /// Phase 5: overwrites every recorded pointer site with its new value,
    /// once the fixup table spans the whole file so every site (inside a
    /// copied segment, inside a relocated link-edit blob, or inside a
    /// command we've just rewritten) resolves to where its bytes actually
    /// ended up.
    fn apply_pending_patches(&self, out: &mut [u8]) {
        for patch in &self.pending_patches {
            let translated = translate_fileoff(&self.fixups, patch.site_offset) as usize;
            if translated + 4 <= out.len() {
                out[translated..translated + 4].copy_from_slice(&patch.new_value.to_le_bytes());
            }
        }
        for patch in &self.extra_patches {
            let repo = if patch.in_text_repo {
                &self.extra_text
            } else {
                &self.extra_data
            };
            let entry_fileoff =
                repo.section_fileoff() + (patch.entry_vmaddr - repo.section_vmaddr());
            let site = (entry_fileoff + patch.field_offset) as usize;
            if site + 4 <= out.len() {
                out[site..site + 4].copy_from_slice(&patch.new_value.to_le_bytes());
            }
        }
    }
}

fn segname(name: &str) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[..name.len()].copy_from_slice(name.as_bytes());
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_fileoff_applies_matching_fixup_only() {
        let fixups = vec![
            FileoffFixup {
                source_begin: 0,
                source_end: 100,
                delta: 50,
            },
            FileoffFixup {
                source_begin: 100,
                source_end: 200,
                delta: -10,
            },
        ];
        assert_eq!(translate_fileoff(&fixups, 10), 60);
        assert_eq!(translate_fileoff(&fixups, 150), 140);
        assert_eq!(translate_fileoff(&fixups, 500), 500);
    }

    #[test]
    fn class_ro_t_field_offsets_match_layout() {
        assert_eq!(offset_of!(ClassRoT, base_methods), 20);
        assert_eq!(offset_of!(ClassRoT, base_properties), 36);
        assert_eq!(
            std::mem::size_of::<ClassRoT>(),
            offset_of!(ClassRoT, base_properties) + 4
        );
    }

    #[test]
    fn section_bytes_round_trip_fields() {
        let sect = Section {
            sectname: segname("__objc_extratxt"),
            segname: segname("__TEXT"),
            addr: 0x1000,
            size: 0x20,
            offset: 0x400,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 2,
            reserved1: 0,
            reserved2: 0,
        };
        let bytes = section_bytes(&sect);
        assert_eq!(bytes.len(), size_of::<Section>());
        assert_eq!(get_u32(&bytes, offset_of!(Section, addr)), 0x1000);
        assert_eq!(get_u32(&bytes, offset_of!(Section, offset)), 0x400);
    }

    /// Builds a minimal one-segment, no-sections, no-linkedit cache holding a
    /// single image, with the Mach-O bytes starting at a nonzero cache file
    /// offset (so a real fixup actually has to happen). Exercises
    /// scenario 1 ("empty repository"): with nothing cross-image to rewrite,
    /// `ncmds`/`sizeofcmds` in the output must match the input exactly.
    fn synthetic_single_segment_cache() -> Vec<u8> {
        const IMAGE_OFF: usize = 4096;
        let header_size = size_of::<MachHeader>();
        let seg_size = size_of::<SegmentCommand>();
        let sizeofcmds = seg_size as u32;
        let image_filesize: u32 = 256;

        let mut buf = vec![0u8; IMAGE_OFF + image_filesize as usize];

        // Cache header.
        buf[0..7].copy_from_slice(b"dyld_v1");
        let mapping_offset: u32 = 64;
        let images_offset: u32 = 128;
        buf[16..20].copy_from_slice(&mapping_offset.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[24..28].copy_from_slice(&images_offset.to_le_bytes());
        buf[28..32].copy_from_slice(&1u32.to_le_bytes());

        // One mapping: vmaddr 0 maps to file offset IMAGE_OFF.
        buf[mapping_offset as usize..mapping_offset as usize + 8]
            .copy_from_slice(&0u64.to_le_bytes());
        buf[mapping_offset as usize + 8..mapping_offset as usize + 16]
            .copy_from_slice(&0x10000u64.to_le_bytes());
        buf[mapping_offset as usize + 16..mapping_offset as usize + 24]
            .copy_from_slice(&(IMAGE_OFF as u64).to_le_bytes());

        // One image: header vmaddr 0 (-> file offset IMAGE_OFF), path at 300.
        buf[images_offset as usize..images_offset as usize + 8]
            .copy_from_slice(&0u64.to_le_bytes());
        buf[images_offset as usize + 24..images_offset as usize + 28]
            .copy_from_slice(&300u32.to_le_bytes());
        let path = b"/usr/lib/libsynthetic.dylib\0";
        buf[300..300 + path.len()].copy_from_slice(path);

        // Mach-O header at IMAGE_OFF.
        let h = IMAGE_OFF;
        buf[h..h + 4].copy_from_slice(&macho::MH_MAGIC.to_le_bytes());
        buf[h + 4..h + 8].copy_from_slice(&0i32.to_le_bytes()); // cputype
        buf[h + 8..h + 12].copy_from_slice(&0i32.to_le_bytes()); // cpusubtype
        buf[h + 12..h + 16].copy_from_slice(&6u32.to_le_bytes()); // MH_DYLIB
        buf[h + 16..h + 20].copy_from_slice(&1u32.to_le_bytes()); // ncmds
        buf[h + 20..h + 24].copy_from_slice(&sizeofcmds.to_le_bytes());
        buf[h + 24..h + 28].copy_from_slice(&0u32.to_le_bytes()); // flags

        // LC_SEGMENT __TEXT, containing the header+command region and the
        // rest of this synthetic "image" (no LC_LINKEDIT, no sections).
        let s = h + header_size;
        buf[s..s + 4].copy_from_slice(&LC_SEGMENT.to_le_bytes());
        buf[s + 4..s + 8].copy_from_slice(&sizeofcmds.to_le_bytes());
        buf[s + 8..s + 24].copy_from_slice(b"__TEXT\0\0\0\0\0\0\0\0\0\0");
        buf[s + 24..s + 28].copy_from_slice(&0u32.to_le_bytes()); // vmaddr
        buf[s + 28..s + 32].copy_from_slice(&image_filesize.to_le_bytes()); // vmsize
        buf[s + 32..s + 36].copy_from_slice(&(IMAGE_OFF as u32).to_le_bytes()); // fileoff
        buf[s + 36..s + 40].copy_from_slice(&image_filesize.to_le_bytes()); // filesize
        buf[s + 40..s + 44].copy_from_slice(&7i32.to_le_bytes()); // maxprot
        buf[s + 44..s + 48].copy_from_slice(&5i32.to_le_bytes()); // initprot
        buf[s + 48..s + 52].copy_from_slice(&0u32.to_le_bytes()); // nsects
        buf[s + 52..s + 56].copy_from_slice(&0u32.to_le_bytes()); // flags

        buf
    }

    #[test]
    fn decacher_run_on_empty_image_preserves_command_sizes() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        {
            use std::io::Write;
            f.write_all(&synthetic_single_segment_cache()).unwrap();
        }
        let cache = DyldCache::open(f.path()).unwrap();
        let decacher = Decacher::new(&cache, 0).expect("segment should parse");
        let out = decacher.run().expect("run should succeed");

        let header_size = size_of::<MachHeader>();
        let seg_size = size_of::<SegmentCommand>();
        assert_eq!(get_u32(&out, offset_of!(MachHeader, ncmds)), 1);
        assert_eq!(
            get_u32(&out, offset_of!(MachHeader, sizeofcmds)),
            seg_size as u32
        );
        // The segment containing the header now starts at file offset 0.
        let seg_off = header_size;
        assert_eq!(get_u32(&out, seg_off + offset_of!(SegmentCommand, fileoff)), 0);
        assert_eq!(out.len(), 256);
    }
}
