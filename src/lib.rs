pub mod dyld;
pub mod hooks;
pub mod image;
pub mod memory;

#[cfg(test)]
mod testing;

pub use hooks::{rebind_single_image, RebindError, Rebinder, Rebinding};

#[cfg(target_os = "macos")]
pub use dyld::{rebind_symbols, rebind_symbols_image, rebinder};
