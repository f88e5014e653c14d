use std::marker::PhantomData;
use std::mem::size_of;

use object::macho::{self, DysymtabCommand, LoadCommand, SymtabCommand};
use object::NativeEndian;

use super::{fixed_name, MachHeader, Section, SegmentCommand, LC_SEGMENT};

/// One load command of a mapped image, decoded as far as rebinding cares.
#[derive(Copy, Clone)]
pub enum Command<'a> {
    Segment(Segment<'a>),
    Symtab(&'a SymtabCommand<NativeEndian>),
    Dysymtab(&'a DysymtabCommand<NativeEndian>),
    Other(u32),
}

/// A segment load command together with the section headers that trail it.
#[derive(Copy, Clone)]
pub struct Segment<'a> {
    command: &'a SegmentCommand,
    sections: &'a [Section],
}

impl<'a> Segment<'a> {
    pub fn name(&self) -> &'a [u8] {
        fixed_name(&self.command.segname)
    }

    pub fn vmaddr(&self) -> usize {
        self.command.vmaddr.get(NativeEndian) as usize
    }

    pub fn fileoff(&self) -> usize {
        self.command.fileoff.get(NativeEndian) as usize
    }

    pub fn sections(&self) -> &'a [Section] {
        self.sections
    }
}

/// Walks the load-command table that follows an image's header.
///
/// Iteration stops early at the first command whose size is too small or runs past
/// `sizeofcmds`, so a truncated table is treated as if it ended there.
pub struct LoadCommands<'a> {
    cursor: usize,
    end: usize,
    remaining: u32,
    _header: PhantomData<&'a MachHeader>,
}

impl<'a> LoadCommands<'a> {
    pub(super) fn new(header: &'a MachHeader) -> Self {
        let start = header as *const MachHeader as usize + size_of::<MachHeader>();
        Self {
            cursor: start,
            end: start.saturating_add(header.sizeofcmds.get(NativeEndian) as usize),
            remaining: header.ncmds.get(NativeEndian),
            _header: PhantomData,
        }
    }

    /// Only the segment commands, in table order
    pub fn segments(self) -> impl Iterator<Item = Segment<'a>> {
        self.filter_map(|command| match command {
            Command::Segment(segment) => Some(segment),
            _ => None,
        })
    }
}

impl<'a> Iterator for LoadCommands<'a> {
    type Item = Command<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let header_size = size_of::<LoadCommand<NativeEndian>>();
        if self.cursor.saturating_add(header_size) > self.end {
            self.remaining = 0;
            return None;
        }

        let load = unsafe { &*(self.cursor as *const LoadCommand<NativeEndian>) };
        let size = load.cmdsize.get(NativeEndian) as usize;
        if size < header_size || self.cursor.saturating_add(size) > self.end {
            self.remaining = 0;
            return None;
        }

        let at = self.cursor;
        self.cursor += size;
        self.remaining -= 1;

        // every record below has byte-array fields only, so any address is suitably aligned
        let command = match load.cmd.get(NativeEndian) {
            LC_SEGMENT if size >= size_of::<SegmentCommand>() => {
                let command = unsafe { &*(at as *const SegmentCommand) };
                let count = command.nsects.get(NativeEndian) as usize;
                let room = (size - size_of::<SegmentCommand>()) / size_of::<Section>();
                let sections: &[Section] = if count == 0 || count > room {
                    &[]
                } else {
                    unsafe {
                        std::slice::from_raw_parts(
                            (at + size_of::<SegmentCommand>()) as *const Section,
                            count,
                        )
                    }
                };

                Command::Segment(Segment { command, sections })
            }
            macho::LC_SYMTAB if size >= size_of::<SymtabCommand<NativeEndian>>() => {
                Command::Symtab(unsafe { &*(at as *const SymtabCommand<NativeEndian>) })
            }
            macho::LC_DYSYMTAB if size >= size_of::<DysymtabCommand<NativeEndian>>() => {
                Command::Dysymtab(unsafe { &*(at as *const DysymtabCommand<NativeEndian>) })
            }
            other => Command::Other(other),
        };

        Some(command)
    }
}
