use std::sync::{Arc, Mutex, PoisonError};

use super::{RebindError, Rebinding};

struct Batch {
    rebindings: Vec<Rebinding>,
    next: Option<Arc<Batch>>,
}

/// Whether a registration was the first one a [`Registry`] ever took.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Registration {
    First,
    Subsequent,
}

/// Every batch of rebindings submitted so far, newest first.
///
/// Batches are only ever added: nothing is removed or changed once stored, so the chain
/// grows for as long as the registry lives.
#[derive(Default)]
pub struct Registry {
    head: Mutex<Option<Arc<Batch>>>,
}

impl Registry {
    pub const fn new() -> Self {
        Self { head: Mutex::new(None) }
    }

    /// Copies `rebindings` into a new batch in front of all older ones
    ///
    /// # Returns
    /// * `Ok(Registration)` - The batch was stored, and whether it is the first
    /// * `Err(RebindError)` - Storage for the batch could not be allocated, nothing changed
    pub fn register(&self, rebindings: &[Rebinding]) -> Result<Registration, RebindError> {
        let mut stored = Vec::new();
        stored
            .try_reserve_exact(rebindings.len())
            .map_err(|source| RebindError::Allocation {
                count: rebindings.len(),
                source,
            })?;
        stored.extend_from_slice(rebindings);

        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        let next = head.take();
        let registration = if next.is_none() {
            Registration::First
        } else {
            Registration::Subsequent
        };

        *head = Some(Arc::new(Batch {
            rebindings: stored,
            next,
        }));

        Ok(registration)
    }

    /// A snapshot of the chain as it stands, unaffected by later registrations
    pub fn head(&self) -> Chain {
        Chain {
            head: self.head.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }

    /// Number of batches registered so far
    pub fn len(&self) -> usize {
        self.head().batches().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }
}

/// A read-only view of a registry's batches.
#[derive(Clone, Default)]
pub struct Chain {
    head: Option<Arc<Batch>>,
}

impl Chain {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Iterates batches from the most recently registered to the oldest
    pub fn batches(&self) -> Batches<'_> {
        Batches {
            current: self.head.as_deref(),
        }
    }

    /// Finds the rebinding for `symbol`, searching newer batches first and each batch in
    /// the order it was submitted
    pub fn find(&self, symbol: &[u8]) -> Option<&Rebinding> {
        for batch in self.batches() {
            if let Some(rebinding) = batch.iter().find(|r| r.name().as_bytes() == symbol) {
                return Some(rebinding);
            }
        }

        None
    }
}

pub struct Batches<'a> {
    current: Option<&'a Batch>,
}

impl<'a> Iterator for Batches<'a> {
    type Item = &'a [Rebinding];

    fn next(&mut self) -> Option<Self::Item> {
        let batch = self.current?;
        self.current = batch.next.as_deref();
        Some(&batch.rebindings)
    }
}
