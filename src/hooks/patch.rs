use std::sync::atomic::Ordering;

use object::macho::{INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL};

use super::registry::Chain;
use super::Rebinding;
use crate::dyld::Loader;
use crate::image::{Image, ImageMetadata, SymbolPointerSection};
use crate::memory::{MemoryProtect, SlotArray, WritableGuard};

/// Indirect table entries that don't name an external symbol.
fn is_sentinel(entry: u32) -> bool {
    entry == INDIRECT_SYMBOL_ABS
        || entry == INDIRECT_SYMBOL_LOCAL
        || entry == INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS
}

/// Matches a raw symbol name, whose first character is the compiler's decoration.
pub fn find_rebinding<'c>(chain: &'c Chain, symbol: &[u8]) -> Option<&'c Rebinding> {
    if symbol.len() < 2 {
        return None;
    }

    chain.find(&symbol[1..])
}

/// Rebinds every eligible slot of one image
///
/// # Returns
/// The number of slots rewritten; zero for images that were skipped
pub fn rebind_image<L, M>(chain: &Chain, image: &Image, loader: &L, memory: &M) -> usize
where
    L: Loader + ?Sized,
    M: MemoryProtect + ?Sized,
{
    let metadata = match image.locate(loader) {
        Some(metadata) => metadata,
        None => return 0,
    };

    metadata
        .sections()
        .iter()
        .map(|section| rebind_section(chain, &metadata, section, memory))
        .sum()
}

/// Rebinds the slots of a single symbol-pointer section
///
/// Sections in `__DATA_CONST` are made writable for the duration of the pass and put back
/// to their previous protection afterwards.
///
/// # Returns
/// The number of slots rewritten
pub fn rebind_section<M: MemoryProtect + ?Sized>(
    chain: &Chain,
    metadata: &ImageMetadata<'_>,
    section: &SymbolPointerSection<'_>,
    memory: &M,
) -> usize {
    let address = section.address();
    let slots = match unsafe { SlotArray::new(address, section.slot_count()) } {
        Some(slots) if !slots.is_empty() => slots,
        _ => return 0,
    };

    let _writable = if section.is_read_only() {
        match WritableGuard::new(memory, address, section.size()) {
            Ok(guard) => Some(guard),
            Err(err) => {
                log::warn!("Skipping read-only section at {:#x}: {}", address, err);
                return 0;
            }
        }
    } else {
        None
    };

    let first = section.first_indirect_symbol();
    let mut rebound = 0;

    for index in 0..slots.len() {
        let symbol_index = match metadata.indirect_symbol(first + index) {
            Some(entry) if !is_sentinel(entry) => entry,
            _ => continue,
        };

        let rebinding = match metadata
            .symbol_name(symbol_index)
            .and_then(|name| find_rebinding(chain, name))
        {
            Some(rebinding) => rebinding,
            None => continue,
        };

        let current = match slots.get(index) {
            Some(current) => current,
            None => continue,
        };

        if let Some(original) = rebinding.original() {
            if current != rebinding.replacement() {
                original.store(current as *mut (), Ordering::Release);
            }
        }

        slots.set(index, rebinding.replacement());
        rebound += 1;

        log::trace!(
            "Rebound {} at {:#x} from {:p} to {:p}",
            rebinding.name(),
            address + index * std::mem::size_of::<*const ()>(),
            current,
            rebinding.replacement()
        );
    }

    rebound
}
