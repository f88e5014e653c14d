use std::ffi::CStr;

use crate::image::Image;

#[cfg(target_os = "macos")]
mod darwin;

#[cfg(target_os = "macos")]
pub use darwin::*;

/// Called once for every image a [`Loader`] reports, existing or newly mapped.
pub type Listener = Box<dyn Fn(Image) + Send + Sync>;

/// The dynamic loader of the current process, as far as rebinding depends on it.
pub trait Loader: Sync {
    /// Every image currently mapped, with its slide
    fn images(&self) -> Vec<Image>;

    /// Installs `listener` so it runs right away for every image already mapped, and
    /// afterwards for each image as it gets mapped.
    ///
    /// The replay of existing images only happens here; installing is the single moment
    /// the loader offers it. Returns `false` if the loader already holds a listener and
    /// dropped this one without calling it.
    fn add_image_listener(&self, listener: Listener) -> bool;

    /// Resolves the file an image was loaded from, or `None` if the loader doesn't know it
    fn identify(&self, image: &Image) -> Option<&CStr>;
}
