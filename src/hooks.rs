use std::collections::TryReserveError;
use std::sync::atomic::AtomicPtr;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::dyld::Loader;
use crate::image::Image;
use crate::memory::MemoryProtect;

mod patch;
mod registry;

pub use patch::{find_rebinding, rebind_image, rebind_section};
pub use registry::{Batches, Chain, Registration, Registry};

#[derive(Error, Debug)]
pub enum RebindError {
    #[error("Failed to allocate storage for a batch of {count} rebindings")]
    Allocation {
        count: usize,
        #[source]
        source: TryReserveError,
    },
}

/// A request to point every import of one symbol at a replacement.
#[derive(Clone, Debug)]
pub struct Rebinding {
    name: String,
    replacement: usize,
    original: Option<&'static AtomicPtr<()>>,
}

impl Rebinding {
    /// Creates a rebinding for the symbol `name`, without its leading underscore
    pub fn new(name: impl Into<String>, replacement: *const ()) -> Self {
        Self {
            name: name.into(),
            replacement: replacement as usize,
            original: None,
        }
    }

    /// Records the pointer each rewritten slot held into `original`
    ///
    /// The slot is written every time a slot is rewritten from something other than the
    /// replacement itself, so after a second rebinding of the same symbol it holds the
    /// previous replacement rather than the library's own function.
    pub fn with_original(mut self, original: &'static AtomicPtr<()>) -> Self {
        self.original = Some(original);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replacement(&self) -> *const () {
        self.replacement as *const ()
    }

    pub fn original(&self) -> Option<&'static AtomicPtr<()>> {
        self.original
    }
}

/// Applies rebindings to one image only, against a registry holding just `rebindings`
///
/// If the batch can't be stored the image is still walked with nothing to rebind, and the
/// allocation failure is returned.
pub fn rebind_single_image<L, M>(
    image: &Image,
    rebindings: &[Rebinding],
    loader: &L,
    memory: &M,
) -> Result<(), RebindError>
where
    L: Loader + ?Sized,
    M: MemoryProtect + ?Sized,
{
    let registry = Registry::new();
    let registered = registry.register(rebindings).map(drop);

    rebind_registered(&registry, registered, image, loader, memory)
}

/// Walks `image` against whatever `registry` holds, then hands back the outcome of
/// registering into it.
fn rebind_registered<L, M>(
    registry: &Registry,
    registered: Result<(), RebindError>,
    image: &Image,
    loader: &L,
    memory: &M,
) -> Result<(), RebindError>
where
    L: Loader + ?Sized,
    M: MemoryProtect + ?Sized,
{
    let rebound = rebind_image(&registry.head(), image, loader, memory);
    log::debug!("Rebound {} slots in image at {:#x}", rebound, image.header_address());

    registered
}

/// Keeps every image of a process, loaded now or later, rebound against one registry.
pub struct Rebinder<L, M> {
    registry: Registry,
    loader: L,
    memory: M,
    patching: Mutex<()>,
}

impl<L, M> Rebinder<L, M>
where
    L: Loader + 'static,
    M: MemoryProtect + 'static,
{
    pub fn new(loader: L, memory: M) -> Self {
        Self {
            registry: Registry::new(),
            loader,
            memory,
            patching: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Registers a batch and applies it to every image, present and future
    ///
    /// The first batch installs a loader listener, which the loader also runs for the
    /// images already mapped. Later batches find the listener in place for future images
    /// and replay the images already mapped by hand. If the loader refuses the listener,
    /// the images already mapped are still replayed but later ones are not covered.
    ///
    /// # Returns
    /// * `Ok(())` - The batch was registered and applied
    /// * `Err(RebindError)` - The batch could not be stored and nothing was changed
    pub fn rebind_symbols(&'static self, rebindings: &[Rebinding]) -> Result<(), RebindError> {
        match self.registry.register(rebindings)? {
            Registration::First => {
                log::debug!("Installing image listener for {} rebindings", rebindings.len());
                let installed = self.loader.add_image_listener(Box::new(move |image| {
                    self.on_image_added(image);
                }));

                if !installed {
                    log::warn!(
                        "The loader already has an image listener, images loaded later won't be rebound"
                    );
                    self.replay();
                }
            }
            Registration::Subsequent => self.replay(),
        }

        Ok(())
    }

    fn replay(&self) {
        for image in self.loader.images() {
            self.on_image_added(image);
        }
    }

    /// Applies the whole registry, as it stands, to one image
    pub fn on_image_added(&self, image: Image) -> usize {
        let _patching = self.patching.lock().unwrap_or_else(PoisonError::into_inner);
        // snapshot under the lock; one taken earlier could miss newer batches
        let chain = self.registry.head();

        let rebound = rebind_image(&chain, &image, &self.loader, &self.memory);
        if rebound > 0 {
            log::debug!("Rebound {} slots in image at {:#x}", rebound, image.header_address());
        }

        rebound
    }

    /// Applies a batch to one image without adding it to the registry
    pub fn rebind_symbols_image(&self, image: Image, rebindings: &[Rebinding]) -> Result<(), RebindError> {
        let _patching = self.patching.lock().unwrap_or_else(PoisonError::into_inner);
        rebind_single_image(&image, rebindings, &self.loader, &self.memory)
    }
}
