//! Fakes for the loader and memory collaborators, and an in-memory image builder.

use std::ffi::CStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::dyld::{Listener, Loader};
use crate::image::Image;
use crate::memory::{MemoryProtect, ProtectError, Protection};

#[cfg(target_pointer_width = "64")]
pub use builder::{ImageBuilder, TestImage};

pub struct FakeLoader {
    images: Mutex<Vec<Image>>,
    unresolved: Mutex<Vec<Image>>,
    listener: Mutex<Option<Listener>>,
    installs: AtomicUsize,
    refuse: bool,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(Vec::new()),
            unresolved: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            installs: AtomicUsize::new(0),
            refuse: false,
        }
    }

    /// A loader whose listener slot is already taken by someone else
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new()
        }
    }

    /// Maps an image, notifying the listener if one is installed
    pub fn load(&self, image: Image) {
        self.images.lock().unwrap().push(image);
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(image);
        }
    }

    pub fn unresolve(&self, image: Image) {
        self.unresolved.lock().unwrap().push(image);
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

impl Loader for FakeLoader {
    fn images(&self) -> Vec<Image> {
        self.images.lock().unwrap().clone()
    }

    fn add_image_listener(&self, listener: Listener) -> bool {
        if self.refuse {
            return false;
        }

        self.installs.fetch_add(1, Ordering::SeqCst);
        for image in self.images() {
            listener(image);
        }
        *self.listener.lock().unwrap() = Some(listener);
        true
    }

    fn identify(&self, image: &Image) -> Option<&CStr> {
        if self.unresolved.lock().unwrap().contains(image) {
            None
        } else {
            CStr::from_bytes_with_nul(b"/usr/lib/libfake.dylib\0").ok()
        }
    }
}

/// Tracks one protection value for all of memory and logs every change.
pub struct RecordingMemory {
    current: Mutex<Protection>,
    calls: Mutex<Vec<(usize, usize, Protection)>>,
    fail_query: bool,
    fail_protect: bool,
}

impl RecordingMemory {
    pub fn new(initial: Protection) -> Self {
        Self {
            current: Mutex::new(initial),
            calls: Mutex::new(Vec::new()),
            fail_query: false,
            fail_protect: false,
        }
    }

    pub fn failing_query(mut self) -> Self {
        self.fail_query = true;
        self
    }

    pub fn failing_protect(mut self) -> Self {
        self.fail_protect = true;
        self
    }

    pub fn current(&self) -> Protection {
        *self.current.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<(usize, usize, Protection)> {
        self.calls.lock().unwrap().clone()
    }
}

impl MemoryProtect for RecordingMemory {
    fn protection(&self, address: usize) -> Result<Protection, ProtectError> {
        if self.fail_query {
            return Err(ProtectError::Query { address, code: 1 });
        }
        Ok(self.current())
    }

    fn protect(&self, address: usize, len: usize, protection: Protection) -> Result<(), ProtectError> {
        if self.fail_protect {
            return Err(ProtectError::Protect {
                address,
                len,
                source: std::io::Error::from_raw_os_error(libc::EACCES),
            });
        }

        *self.current.lock().unwrap() = protection;
        self.calls.lock().unwrap().push((address, len, protection));
        Ok(())
    }
}

#[cfg(target_pointer_width = "64")]
mod builder {
    use std::mem::size_of;

    use object::macho::{self, DysymtabCommand, SymtabCommand};
    use object::{BigEndian, NativeEndian, U32, U64};

    use crate::image::{Image, MachHeader, Nlist, Section, SegmentCommand, MH_MAGIC};

    /// Pretend file offset of the link-edit segment, distinct from its address.
    const LINKEDIT_FILEOFF: usize = 0x4000;

    struct SectionSpec {
        segment: &'static str,
        name: &'static str,
        flags: u32,
        slots: Vec<(u32, usize)>,
    }

    /// Lays out a minimal 64-bit Mach-O image in one buffer.
    ///
    /// Addresses in the image are offsets into the buffer, so the buffer's base address is
    /// both the header address and the slide.
    pub struct ImageBuilder {
        symbols: Vec<String>,
        sections: Vec<SectionSpec>,
        magic: u32,
        linkedit: bool,
        symtab: bool,
        dysymtab: bool,
        extra_commands: u32,
        truncate_strings: usize,
    }

    impl ImageBuilder {
        pub fn new() -> Self {
            Self {
                symbols: Vec::new(),
                sections: Vec::new(),
                magic: MH_MAGIC,
                linkedit: true,
                symtab: true,
                dysymtab: true,
                extra_commands: 0,
                truncate_strings: 0,
            }
        }

        /// Adds a symbol table entry, returning its index
        pub fn symbol(&mut self, name: &str) -> u32 {
            self.symbols.push(name.to_owned());
            (self.symbols.len() - 1) as u32
        }

        /// Adds a section of `(indirect entry, initial slot value)` pairs, returning its index
        pub fn section(
            &mut self,
            segment: &'static str,
            name: &'static str,
            flags: u32,
            slots: &[(u32, usize)],
        ) -> usize {
            self.sections.push(SectionSpec {
                segment,
                name,
                flags,
                slots: slots.to_vec(),
            });
            self.sections.len() - 1
        }

        pub fn lazy(&mut self, slots: &[(u32, usize)]) -> usize {
            self.section("__DATA", "__la_symbol_ptr", macho::S_LAZY_SYMBOL_POINTERS, slots)
        }

        pub fn got(&mut self, slots: &[(u32, usize)]) -> usize {
            self.section("__DATA_CONST", "__got", macho::S_NON_LAZY_SYMBOL_POINTERS, slots)
        }

        pub fn magic(&mut self, magic: u32) {
            self.magic = magic;
        }

        pub fn omit_linkedit(&mut self) {
            self.linkedit = false;
        }

        pub fn omit_symtab(&mut self) {
            self.symtab = false;
        }

        pub fn omit_dysymtab(&mut self) {
            self.dysymtab = false;
        }

        /// Claims more load commands in the header than the table holds
        pub fn extra_commands(&mut self, count: u32) {
            self.extra_commands = count;
        }

        /// Shortens the recorded string table size
        pub fn truncate_strings(&mut self, bytes: usize) {
            self.truncate_strings = bytes;
        }

        pub fn build(&self) -> TestImage {
            let e = NativeEndian;

            let mut segments: Vec<&'static str> = Vec::new();
            for spec in &self.sections {
                if !segments.contains(&spec.segment) {
                    segments.push(spec.segment);
                }
            }

            let mut commands_size = 0;
            if self.linkedit {
                commands_size += size_of::<SegmentCommand>();
            }
            if self.symtab {
                commands_size += size_of::<SymtabCommand<NativeEndian>>();
            }
            if self.dysymtab {
                commands_size += size_of::<DysymtabCommand<NativeEndian>>();
            }
            for segment in &segments {
                let count = self.sections.iter().filter(|s| s.segment == *segment).count();
                commands_size += size_of::<SegmentCommand>() + count * size_of::<Section>();
            }

            let mut strings = vec![0u8];
            let mut symtab = Vec::new();
            for name in &self.symbols {
                let mut symbol: Nlist = zeroed();
                symbol.n_strx = U32::new(e, strings.len() as u32);
                symbol.n_type = macho::N_EXT;
                symtab.extend_from_slice(bytes_of(&symbol));
                strings.extend_from_slice(name.as_bytes());
                strings.push(0);
            }

            let mut indirect = Vec::new();
            let mut starts = Vec::new();
            for spec in &self.sections {
                starts.push(indirect.len() / 4);
                for (entry, _) in &spec.slots {
                    indirect.extend_from_slice(&entry.to_ne_bytes());
                }
            }

            let linkedit_off = align(size_of::<MachHeader>() + commands_size, 16);
            let symoff = linkedit_off;
            let stroff = symoff + symtab.len();
            let indirectoff = align(stroff + strings.len(), 4);
            let data_off = align(indirectoff + indirect.len(), 16);

            let mut offsets = Vec::new();
            let mut data_end = data_off;
            for spec in &self.sections {
                offsets.push(data_end);
                data_end += spec.slots.len() * 8;
            }

            let mut bytes = vec![0u8; align(data_end, 8)];

            let mut header: MachHeader = zeroed();
            header.magic = U32::new(BigEndian, u32::from_be_bytes(self.magic.to_ne_bytes()));
            header.filetype = U32::new(e, macho::MH_DYLIB);
            header.ncmds = U32::new(
                e,
                self.linkedit as u32
                    + self.symtab as u32
                    + self.dysymtab as u32
                    + segments.len() as u32
                    + self.extra_commands,
            );
            header.sizeofcmds = U32::new(e, commands_size as u32);
            put(&mut bytes, 0, bytes_of(&header));

            let mut cursor = size_of::<MachHeader>();
            let to_file = |offset: usize| (offset - linkedit_off + LINKEDIT_FILEOFF) as u32;

            if self.linkedit {
                let mut linkedit: SegmentCommand = zeroed();
                linkedit.cmd = U32::new(e, macho::LC_SEGMENT_64);
                linkedit.cmdsize = U32::new(e, size_of::<SegmentCommand>() as u32);
                linkedit.segname = name16("__LINKEDIT");
                linkedit.vmaddr = U64::new(e, linkedit_off as u64);
                linkedit.vmsize = U64::new(e, (data_off - linkedit_off) as u64);
                linkedit.fileoff = U64::new(e, LINKEDIT_FILEOFF as u64);
                linkedit.filesize = U64::new(e, (data_off - linkedit_off) as u64);
                cursor = put(&mut bytes, cursor, bytes_of(&linkedit));
            }

            if self.symtab {
                let mut command: SymtabCommand<NativeEndian> = zeroed();
                command.cmd = U32::new(e, macho::LC_SYMTAB);
                command.cmdsize = U32::new(e, size_of::<SymtabCommand<NativeEndian>>() as u32);
                command.symoff = U32::new(e, to_file(symoff));
                command.nsyms = U32::new(e, self.symbols.len() as u32);
                command.stroff = U32::new(e, to_file(stroff));
                command.strsize = U32::new(e, (strings.len() - self.truncate_strings) as u32);
                cursor = put(&mut bytes, cursor, bytes_of(&command));
            }

            if self.dysymtab {
                let mut command: DysymtabCommand<NativeEndian> = zeroed();
                command.cmd = U32::new(e, macho::LC_DYSYMTAB);
                command.cmdsize = U32::new(e, size_of::<DysymtabCommand<NativeEndian>>() as u32);
                command.indirectsymoff = U32::new(e, to_file(indirectoff));
                command.nindirectsyms = U32::new(e, (indirect.len() / 4) as u32);
                cursor = put(&mut bytes, cursor, bytes_of(&command));
            }

            for segment in &segments {
                let members: Vec<usize> = (0..self.sections.len())
                    .filter(|&i| self.sections[i].segment == *segment)
                    .collect();

                let mut command: SegmentCommand = zeroed();
                command.cmd = U32::new(e, macho::LC_SEGMENT_64);
                command.cmdsize = U32::new(
                    e,
                    (size_of::<SegmentCommand>() + members.len() * size_of::<Section>()) as u32,
                );
                command.segname = name16(segment);
                command.nsects = U32::new(e, members.len() as u32);
                cursor = put(&mut bytes, cursor, bytes_of(&command));

                for i in members {
                    let spec = &self.sections[i];
                    let mut section: Section = zeroed();
                    section.sectname = name16(spec.name);
                    section.segname = name16(spec.segment);
                    section.addr = U64::new(e, offsets[i] as u64);
                    section.size = U64::new(e, (spec.slots.len() * 8) as u64);
                    section.flags = U32::new(e, spec.flags);
                    section.reserved1 = U32::new(e, starts[i] as u32);
                    cursor = put(&mut bytes, cursor, bytes_of(&section));
                }
            }

            put(&mut bytes, symoff, &symtab);
            put(&mut bytes, stroff, &strings);
            put(&mut bytes, indirectoff, &indirect);
            for (spec, offset) in self.sections.iter().zip(&offsets) {
                for (i, (_, value)) in spec.slots.iter().enumerate() {
                    put(&mut bytes, offset + i * 8, &value.to_ne_bytes());
                }
            }

            let mut storage = vec![0u64; bytes.len() / 8];
            for (word, chunk) in storage.iter_mut().zip(bytes.chunks_exact(8)) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                *word = u64::from_ne_bytes(raw);
            }

            let base = storage.as_mut_ptr();
            TestImage {
                _storage: storage,
                base,
                offsets,
            }
        }
    }

    /// A built image. Slots are only touched through `base` once built.
    pub struct TestImage {
        _storage: Vec<u64>,
        base: *mut u64,
        offsets: Vec<usize>,
    }

    impl TestImage {
        pub fn image(&self) -> Image {
            let base = self.base as usize;
            let image = unsafe { Image::from_raw(base as *const u8, base as isize) };
            image.unwrap()
        }

        pub fn section_address(&self, section: usize) -> usize {
            self.base as usize + self.offsets[section]
        }

        pub fn slot(&self, section: usize, index: usize) -> usize {
            unsafe { *((self.section_address(section) + index * 8) as *const usize) }
        }
    }

    fn zeroed<T>() -> T {
        // only used for object's plain byte-array records
        unsafe { std::mem::zeroed() }
    }

    fn bytes_of<T>(value: &T) -> &[u8] {
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
    }

    fn name16(name: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..name.len()].copy_from_slice(name.as_bytes());
        out
    }

    fn align(value: usize, to: usize) -> usize {
        (value + to - 1) & !(to - 1)
    }

    fn put(bytes: &mut [u8], offset: usize, data: &[u8]) -> usize {
        bytes[offset..offset + data.len()].copy_from_slice(data);
        offset + data.len()
    }
}
