//! The rebinding registry: append-only batches of caller-supplied retargets.
//!
//! Registration copies the caller's records into an owned batch and links it
//! ahead of the previous batches, so the walker always searches newest-first
//! and the caller's slice can be dropped immediately after return. Globally
//! linked batches are never freed: a live indirect slot may point at a
//! replacement whose registration owns it.

use std::ffi::{CString, c_void};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::{RebindError, Result};

/// A single import retarget: calls to the named symbol are redirected to
/// `replacement`, and the previously-bound address is stored through
/// `original` (when non-null) so the replacement can chain to it.
pub struct Rebinding {
    /// Symbol name as the caller knows it, without the leading underscore the
    /// linker prepends in the image's string table. Matched exactly.
    pub name: String,
    /// Address to install into matching indirect slots.
    pub replacement: *const c_void,
    /// Out-location for the previously-bound address; null to discard it.
    pub original: *mut *const c_void,
}

impl Rebinding {
    /// A retarget that discards the previously-bound address.
    pub fn new(name: impl Into<String>, replacement: *const c_void) -> Self {
        Rebinding {
            name: name.into(),
            replacement,
            original: ptr::null_mut(),
        }
    }

    /// A retarget that stores the previously-bound address through `original`.
    pub fn with_original(
        name: impl Into<String>,
        replacement: *const c_void,
        original: *mut *const c_void,
    ) -> Self {
        Rebinding {
            name: name.into(),
            replacement,
            original,
        }
    }
}

/// Owned copy of one [`Rebinding`]. The name is held nul-terminated so the
/// rewriter can compare it byte-wise against string-table entries without
/// allocating per slot.
pub(crate) struct RebindingEntry {
    pub(crate) name: CString,
    pub(crate) replacement: *const c_void,
    pub(crate) original: *mut *const c_void,
}

/// One registration's worth of entries plus the link to the batches that were
/// registered before it.
pub(crate) struct Batch {
    entries: Vec<RebindingEntry>,
    next: *const Batch,
}

impl Batch {
    /// Copies the caller's records. Fails with [`RebindError::Allocation`]
    /// before touching any shared state if the copy cannot be reserved.
    pub(crate) fn copied(rebindings: &[Rebinding], next: *const Batch) -> Result<Batch> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(rebindings.len())
            .map_err(|_| RebindError::Allocation)?;
        for rebinding in rebindings {
            let name =
                CString::new(rebinding.name.as_str()).map_err(|_| RebindError::InvalidName)?;
            entries.push(RebindingEntry {
                name,
                replacement: rebinding.replacement,
                original: rebinding.original,
            });
        }
        Ok(Batch { entries, next })
    }

    /// Entries of this batch followed by every older batch, newest first.
    pub(crate) fn entries(&self) -> Entries<'_> {
        Entries {
            batch: Some(self),
            index: 0,
        }
    }
}

pub(crate) struct Entries<'a> {
    batch: Option<&'a Batch>,
    index: usize,
}

impl<'a> Iterator for Entries<'a> {
    type Item = &'a RebindingEntry;

    fn next(&mut self) -> Option<&'a RebindingEntry> {
        loop {
            let batch = self.batch?;
            if let Some(entry) = batch.entries.get(self.index) {
                self.index += 1;
                return Some(entry);
            }
            // Linked batches are immutable and never freed, so following the
            // raw link is sound for as long as the head reference lives.
            self.batch = unsafe { batch.next.as_ref() };
            self.index = 0;
        }
    }
}

/// Head of the process-wide registry. Prepends are single-writer (dyld
/// serializes registrations by contract) and readers observe a fully built
/// node or the previous head, never a partial one.
static HEAD: AtomicPtr<Batch> = AtomicPtr::new(ptr::null_mut());

/// Copies `rebindings` into a new batch and links it ahead of the global
/// registry. Returns whether the registry was empty beforehand, i.e. whether
/// this was the first registration. On error the registry is unchanged.
pub(crate) fn prepend_global(rebindings: &[Rebinding]) -> Result<bool> {
    let prev = HEAD.load(Ordering::Acquire);
    let batch = Box::new(Batch::copied(rebindings, prev)?);
    HEAD.store(Box::into_raw(batch), Ordering::Release);
    Ok(prev.is_null())
}

/// The current registry head, if any batch has been registered.
pub(crate) fn global_head() -> Option<&'static Batch> {
    unsafe { HEAD.load(Ordering::Acquire).as_ref() }
}
