use std::mem::size_of;

use object::macho;
use object::{BigEndian, NativeEndian, U32};

use crate::dyld::Loader;

mod commands;

pub use commands::{Command, LoadCommands, Segment};

#[cfg(target_pointer_width = "64")]
mod layout {
    use object::{macho, NativeEndian};

    pub type MachHeader = macho::MachHeader64<NativeEndian>;
    pub type SegmentCommand = macho::SegmentCommand64<NativeEndian>;
    pub type Section = macho::Section64<NativeEndian>;
    pub type Nlist = macho::Nlist64<NativeEndian>;

    pub const LC_SEGMENT: u32 = macho::LC_SEGMENT_64;
    pub const MH_MAGIC: u32 = macho::MH_MAGIC_64;
}

#[cfg(target_pointer_width = "32")]
mod layout {
    use object::{macho, NativeEndian};

    pub type MachHeader = macho::MachHeader32<NativeEndian>;
    pub type SegmentCommand = macho::SegmentCommand32<NativeEndian>;
    pub type Section = macho::Section32<NativeEndian>;
    pub type Nlist = macho::Nlist32<NativeEndian>;

    pub const LC_SEGMENT: u32 = macho::LC_SEGMENT;
    pub const MH_MAGIC: u32 = macho::MH_MAGIC;
}

pub use layout::*;

pub const SEG_DATA: &[u8] = b"__DATA";
pub const SEG_DATA_CONST: &[u8] = b"__DATA_CONST";
pub const SEG_LINKEDIT: &[u8] = b"__LINKEDIT";

/// Trims a fixed-size, NUL-padded segment or section name.
pub(crate) fn fixed_name(name: &[u8; 16]) -> &[u8] {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    &name[..end]
}

unsafe fn table<'a, T>(address: usize, count: usize) -> &'a [T] {
    if address == 0 || count == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(address as *const T, count)
    }
}

/// A Mach-O image mapped into this process, identified by its header address and slide.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Image {
    header: usize,
    slide: isize,
}

impl Image {
    /// Wraps the image whose header lives at `header`
    ///
    /// Returns `None` for a null header.
    ///
    /// # Safety
    /// `header` must point at a mapped Mach-O header followed by its load commands, and
    /// `slide` must be the image's real load-time slide, for as long as the image is used.
    pub unsafe fn from_raw(header: *const u8, slide: isize) -> Option<Self> {
        if header.is_null() {
            None
        } else {
            Some(Self { header: header as usize, slide })
        }
    }

    pub fn header_address(&self) -> usize {
        self.header
    }

    pub fn slide(&self) -> isize {
        self.slide
    }

    pub fn header(&self) -> &MachHeader {
        unsafe { &*(self.header as *const MachHeader) }
    }

    /// Whether the header carries the magic of this process's own pointer width and byte order
    pub fn is_native(&self) -> bool {
        let stored = self.header().magic.get(BigEndian).to_be_bytes();
        u32::from_ne_bytes(stored) == MH_MAGIC
    }

    pub fn load_commands(&self) -> LoadCommands<'_> {
        LoadCommands::new(self.header())
    }

    /// Finds the tables and symbol-pointer sections rebinding needs.
    ///
    /// # Returns
    /// * `Some(ImageMetadata)` - The image has link-edit, symbol and indirect symbol tables
    /// * `None` - The image could not be identified or lacks dynamic linking metadata, and
    ///   should be skipped
    pub fn locate<L: Loader + ?Sized>(&self, loader: &L) -> Option<ImageMetadata<'_>> {
        if !self.is_native() {
            log::debug!("Skipping image at {:#x}: foreign header magic", self.header);
            return None;
        }

        let path = match loader.identify(self) {
            Some(path) => path,
            None => {
                log::debug!("Skipping image at {:#x}: unresolved", self.header);
                return None;
            }
        };

        let mut linkedit = None;
        let mut symtab = None;
        let mut dysymtab = None;
        for command in self.load_commands() {
            match command {
                Command::Segment(segment) if segment.name() == SEG_LINKEDIT => linkedit = Some(segment),
                Command::Symtab(command) => symtab = Some(command),
                Command::Dysymtab(command) => dysymtab = Some(command),
                _ => {}
            }
        }

        let (linkedit, symtab, dysymtab) = match (linkedit, symtab, dysymtab) {
            (Some(linkedit), Some(symtab), Some(dysymtab)) => (linkedit, symtab, dysymtab),
            _ => {
                log::debug!("Skipping {:?}: no dynamic symbol tables", path);
                return None;
            }
        };

        let e = NativeEndian;
        let indirect_count = dysymtab.nindirectsyms.get(e) as usize;
        if indirect_count == 0 {
            log::debug!("Skipping {:?}: empty indirect symbol table", path);
            return None;
        }

        let linkedit_base = (self.slide as usize)
            .wrapping_add(linkedit.vmaddr())
            .wrapping_sub(linkedit.fileoff());

        let (symbols, strings, indirect_symbols) = unsafe {
            (
                table::<Nlist>(
                    linkedit_base.wrapping_add(symtab.symoff.get(e) as usize),
                    symtab.nsyms.get(e) as usize,
                ),
                table::<u8>(
                    linkedit_base.wrapping_add(symtab.stroff.get(e) as usize),
                    symtab.strsize.get(e) as usize,
                ),
                table::<U32<NativeEndian>>(
                    linkedit_base.wrapping_add(dysymtab.indirectsymoff.get(e) as usize),
                    indirect_count,
                ),
            )
        };

        let sections = self
            .load_commands()
            .segments()
            .filter(|segment| segment.name() == SEG_DATA || segment.name() == SEG_DATA_CONST)
            .flat_map(|segment| segment.sections().iter())
            .filter_map(|section| SymbolPointerSection::new(section, self.slide))
            .collect();

        Some(ImageMetadata {
            symbols,
            strings,
            indirect_symbols,
            sections,
        })
    }
}

/// The linking tables of one image, valid for a single rebinding pass.
pub struct ImageMetadata<'a> {
    symbols: &'a [Nlist],
    strings: &'a [u8],
    indirect_symbols: &'a [U32<NativeEndian>],
    sections: Vec<SymbolPointerSection<'a>>,
}

impl<'a> ImageMetadata<'a> {
    /// The lazy and non-lazy pointer sections of the image's `__DATA` and `__DATA_CONST` segments
    pub fn sections(&self) -> &[SymbolPointerSection<'a>] {
        &self.sections
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Reads an entry of the indirect symbol table
    pub fn indirect_symbol(&self, index: usize) -> Option<u32> {
        self.indirect_symbols.get(index).map(|entry| entry.get(NativeEndian))
    }

    /// The raw name of a symbol table entry, leading underscore included
    pub fn symbol_name(&self, symbol_index: u32) -> Option<&'a [u8]> {
        let symbol = self.symbols.get(symbol_index as usize)?;
        let rest = self.strings.get(symbol.n_strx.get(NativeEndian) as usize..)?;
        let len = rest.iter().position(|&b| b == 0)?;
        Some(&rest[..len])
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PointerKind {
    Lazy,
    NonLazy,
}

/// A section of function-pointer slots, each tied to one indirect symbol table entry.
#[derive(Copy, Clone)]
pub struct SymbolPointerSection<'a> {
    section: &'a Section,
    kind: PointerKind,
    slide: isize,
}

impl<'a> SymbolPointerSection<'a> {
    /// Returns `None` unless `section` is a lazy or non-lazy symbol pointer section
    pub fn new(section: &'a Section, slide: isize) -> Option<Self> {
        let kind = match section.flags.get(NativeEndian) & macho::SECTION_TYPE {
            macho::S_LAZY_SYMBOL_POINTERS => PointerKind::Lazy,
            macho::S_NON_LAZY_SYMBOL_POINTERS => PointerKind::NonLazy,
            _ => return None,
        };

        Some(Self { section, kind, slide })
    }

    pub fn kind(&self) -> PointerKind {
        self.kind
    }

    pub fn name(&self) -> &'a [u8] {
        fixed_name(&self.section.sectname)
    }

    pub fn segment_name(&self) -> &'a [u8] {
        fixed_name(&self.section.segname)
    }

    /// Whether the loader maps this section's segment read-only after binding
    pub fn is_read_only(&self) -> bool {
        self.segment_name() == SEG_DATA_CONST
    }

    /// Runtime address of the first slot
    pub fn address(&self) -> usize {
        (self.slide as usize).wrapping_add(self.section.addr.get(NativeEndian) as usize)
    }

    pub fn size(&self) -> usize {
        self.section.size.get(NativeEndian) as usize
    }

    pub fn slot_count(&self) -> usize {
        self.size() / size_of::<*const ()>()
    }

    /// Index of this section's first slot in the indirect symbol table
    pub fn first_indirect_symbol(&self) -> usize {
        self.section.reserved1.get(NativeEndian) as usize
    }
}
