use std::ops::BitOr;

use thiserror::Error;

/// Access rights of a range of virtual memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Protection(u8);

impl Protection {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXECUTE: Self = Self(1 << 2);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Translates Mach `VM_PROT_*` bits, ignoring anything but read, write and execute.
    #[cfg(target_os = "macos")]
    pub fn from_vm_prot(prot: mach2::vm_prot::vm_prot_t) -> Self {
        use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};

        let mut protection = Self::NONE;
        if prot & VM_PROT_READ != 0 {
            protection = protection | Self::READ;
        }
        if prot & VM_PROT_WRITE != 0 {
            protection = protection | Self::WRITE;
        }
        if prot & VM_PROT_EXECUTE != 0 {
            protection = protection | Self::EXECUTE;
        }
        protection
    }

    /// The `PROT_*` flags accepted by `mprotect`.
    pub fn to_mprotect(self) -> libc::c_int {
        let mut flags = libc::PROT_NONE;
        if self.contains(Self::READ) {
            flags |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            flags |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            flags |= libc::PROT_EXEC;
        }
        flags
    }
}

impl BitOr for Protection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Error, Debug)]
pub enum ProtectError {
    #[error("Querying the protection of {address:#x} failed with kern_return {code}")]
    Query { address: usize, code: i32 },

    #[error("Changing the protection of {len:#x} bytes at {address:#x} failed")]
    Protect {
        address: usize,
        len: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Query and change the protection of the process's own address space.
pub trait MemoryProtect: Sync {
    /// Gets the current protection of the region containing `address`
    fn protection(&self, address: usize) -> Result<Protection, ProtectError>;

    /// Sets the protection of `len` bytes starting at `address`
    fn protect(&self, address: usize, len: usize, protection: Protection) -> Result<(), ProtectError>;
}

/// Makes a range read-write for as long as the guard lives.
///
/// Dropping the guard puts back the protection the range had before it was elevated,
/// whether or not anything was written through it.
pub struct WritableGuard<'m, M: MemoryProtect + ?Sized> {
    memory: &'m M,
    address: usize,
    len: usize,
    original: Protection,
}

impl<'m, M: MemoryProtect + ?Sized> WritableGuard<'m, M> {
    /// Elevates `len` bytes at `address` to read-write
    ///
    /// # Returns
    /// * `Ok(WritableGuard)` - The range is writable until the guard is dropped
    /// * `Err(ProtectError)` - The range could not be made writable and was left untouched
    pub fn new(memory: &'m M, address: usize, len: usize) -> Result<Self, ProtectError> {
        let original = memory.protection(address).unwrap_or_else(|err| {
            log::debug!("{}, assuming read-only", err);
            Protection::READ
        });

        memory.protect(address, len, Protection::READ | Protection::WRITE)?;
        log::debug!("Elevated {:#x}..{:#x} from {:?}", address, address + len, original);

        Ok(Self { memory, address, len, original })
    }

    pub fn original(&self) -> Protection {
        self.original
    }
}

impl<M: MemoryProtect + ?Sized> Drop for WritableGuard<'_, M> {
    fn drop(&mut self) {
        if let Err(err) = self.memory.protect(self.address, self.len, self.original) {
            log::warn!("Failed to restore {:?}: {}", self.original, err);
        }
    }
}

/// An array of function pointers living in another image's memory.
///
/// This is the only place slots are read or written; everything else deals in indices.
pub struct SlotArray {
    base: *mut *const (),
    len: usize,
}

impl SlotArray {
    /// Wraps `len` pointer-sized slots at `address`
    ///
    /// Returns `None` if `address` is null or not pointer aligned.
    ///
    /// # Safety
    /// The range must stay mapped and readable for the lifetime of the array, and must be
    /// writable whenever [`SlotArray::set`] is called.
    pub unsafe fn new(address: usize, len: usize) -> Option<Self> {
        if address == 0 || address % std::mem::align_of::<*const ()>() != 0 {
            return None;
        }

        Some(Self { base: address as *mut *const (), len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the pointer currently installed in a slot
    pub fn get(&self, index: usize) -> Option<*const ()> {
        if index >= self.len {
            return None;
        }

        unsafe { Some(std::ptr::read_volatile(self.base.add(index))) }
    }

    /// Installs `value` into a slot, returning false if the index is out of range
    pub fn set(&self, index: usize, value: *const ()) -> bool {
        if index >= self.len {
            return false;
        }

        unsafe { std::ptr::write_volatile(self.base.add(index), value) };
        true
    }
}

/// Rounds `address..address + len` out to whole pages.
pub fn page_span(address: usize, len: usize, page_size: usize) -> (usize, usize) {
    let start = address & !(page_size - 1);
    let end = address
        .saturating_add(len)
        .saturating_add(page_size - 1)
        & !(page_size - 1);

    (start, (end - start).max(page_size))
}

/// The current task's address space, through Mach VM queries and `mprotect`.
#[cfg(target_os = "macos")]
#[derive(Debug, Default, Copy, Clone)]
pub struct TaskMemory;

#[cfg(target_os = "macos")]
impl MemoryProtect for TaskMemory {
    fn protection(&self, address: usize) -> Result<Protection, ProtectError> {
        use mach2::kern_return::KERN_SUCCESS;
        use mach2::traps::mach_task_self;
        use mach2::vm_region::{vm_region_basic_info_64, vm_region_info_t, VM_REGION_BASIC_INFO_64};
        use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

        unsafe {
            let mut region_addr = address as mach_vm_address_t;
            let mut region_size: mach_vm_size_t = 0;
            let mut info: vm_region_basic_info_64 = std::mem::zeroed();
            let mut info_count = vm_region_basic_info_64::count();
            let mut object_name: u32 = 0;

            let kr = mach2::vm::mach_vm_region(
                mach_task_self(),
                &mut region_addr,
                &mut region_size,
                VM_REGION_BASIC_INFO_64,
                (&mut info as *mut vm_region_basic_info_64) as vm_region_info_t,
                &mut info_count,
                &mut object_name,
            );

            if kr != KERN_SUCCESS {
                return Err(ProtectError::Query { address, code: kr });
            }

            Ok(Protection::from_vm_prot(info.protection))
        }
    }

    fn protect(&self, address: usize, len: usize, protection: Protection) -> Result<(), ProtectError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let (start, size) = page_span(address, len, page_size);

        let ret = unsafe { libc::mprotect(start as *mut libc::c_void, size, protection.to_mprotect()) };
        if ret != 0 {
            return Err(ProtectError::Protect {
                address,
                len,
                source: std::io::Error::last_os_error(),
            });
        }

        Ok(())
    }
}
