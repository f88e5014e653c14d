use std::ffi::{c_void, CStr};

use once_cell::sync::OnceCell;

use super::{Listener, Loader};
use crate::hooks::{RebindError, Rebinder, Rebinding};
use crate::image::Image;
use crate::memory::TaskMemory;

#[doc(hidden)]
pub mod ffi {
    use std::ffi::c_void;

    extern "C" {
        pub fn _dyld_image_count() -> u32;

        pub fn _dyld_get_image_header(index: u32) -> *const c_void;

        pub fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;

        pub fn _dyld_register_func_for_add_image(func: extern "C" fn(*const c_void, isize));
    }
}

static LISTENER: OnceCell<Listener> = OnceCell::new();

static REBINDER: OnceCell<Rebinder<Dyld, TaskMemory>> = OnceCell::new();

/// Entry point dyld calls for each image. Runs on dyld's schedule, so it relies on nothing
/// but the installed listener and does nothing until there is one.
extern "C" fn image_added(header: *const c_void, slide: isize) {
    let listener = match LISTENER.get() {
        Some(listener) => listener,
        None => return,
    };

    if let Some(image) = unsafe { Image::from_raw(header as *const u8, slide) } {
        listener(image);
    }
}

/// The process's own dyld.
///
/// Only [`rebinder()`] holds one, so the single listener slot dyld offers always belongs to
/// the process-wide registry.
#[derive(Debug, Copy, Clone)]
pub struct Dyld(());

impl Loader for Dyld {
    fn images(&self) -> Vec<Image> {
        let count = unsafe { ffi::_dyld_image_count() };

        (0..count)
            .filter_map(|index| unsafe {
                let header = ffi::_dyld_get_image_header(index);
                let slide = ffi::_dyld_get_image_vmaddr_slide(index);
                Image::from_raw(header as *const u8, slide)
            })
            .collect()
    }

    fn add_image_listener(&self, listener: Listener) -> bool {
        // dyld has no way to unregister, so only one listener ever goes in
        if LISTENER.set(listener).is_err() {
            return false;
        }

        unsafe { ffi::_dyld_register_func_for_add_image(image_added) };
        true
    }

    fn identify(&self, image: &Image) -> Option<&CStr> {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        if unsafe { libc::dladdr(image.header_address() as *const c_void, &mut info) } == 0 {
            return None;
        }

        if info.dli_fname.is_null() {
            Some(Default::default())
        } else {
            Some(unsafe { CStr::from_ptr(info.dli_fname) })
        }
    }
}

/// Gets the process-wide rebinder, creating it on first use.
///
/// Its registry lives as long as the process and only ever grows.
pub fn rebinder() -> &'static Rebinder<Dyld, TaskMemory> {
    REBINDER.get_or_init(|| Rebinder::new(Dyld(()), TaskMemory))
}

/// Rebinds symbols in every image loaded now or later
///
/// # Arguments
/// * `rebindings` - The symbols to rebind, copied into the process-wide registry
///
/// # Returns
/// * `Ok(())` - The batch was registered and applied to every loaded image
/// * `Err(RebindError)` - The batch could not be stored; earlier rebindings are untouched
pub fn rebind_symbols(rebindings: &[Rebinding]) -> Result<(), RebindError> {
    rebinder().rebind_symbols(rebindings)
}

/// Rebinds symbols in a single image only, without registering them for later images
///
/// # Safety
/// `header` must be the Mach-O header of an image mapped in this process and `slide` its
/// load-time slide.
pub unsafe fn rebind_symbols_image(
    header: *const c_void,
    slide: isize,
    rebindings: &[Rebinding],
) -> Result<(), RebindError> {
    match Image::from_raw(header as *const u8, slide) {
        Some(image) => rebinder().rebind_symbols_image(image, rebindings),
        None => Ok(()),
    }
}
