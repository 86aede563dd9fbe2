//! Pointer-section rewriting.
//!
//! Walks a lazy or non-lazy symbol pointer section in lockstep with the
//! indirect symbol index array, resolves each slot's symbol name, and swaps
//! the bound address for every registered match. `__DATA_CONST` sections are
//! opened for writing for the duration of the walk and restored on every
//! exit path.

use std::ffi::{CStr, c_void};

use libc::{c_char, c_int};
use tracing::trace;

use crate::image::ImageView;
use crate::macho::{
    INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL, Layout, Nlist, SEG_DATA_CONST, Section,
    seg_name_eq,
};
use crate::registry::Batch;
use crate::sys::{Platform, VM_PROT_READ, vm_prot_to_posix};

const WORD: usize = size_of::<*const c_void>();

/// Re-applies a section's resting protection when the rewrite scope ends,
/// whether it ends by running off the slots or by unwinding.
struct ProtectionGuard<'a, P: Platform> {
    platform: &'a P,
    addr: *const c_void,
    len: usize,
    restore: c_int,
}

impl<P: Platform> Drop for ProtectionGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.set_protection(self.addr, self.len, self.restore);
    }
}

/// Rewrites every matching slot of one candidate pointer section.
///
/// # Safety
///
/// `section` and the tables in `view` must describe a live image mapped at
/// `view.slide`, with the indirect indices, symbol records, and string
/// offsets the image declares. Out-of-range indices are the image's own
/// undefined behavior and are not defended against.
pub(crate) unsafe fn rebind_section<L: Layout, P: Platform>(
    platform: &P,
    registry: &Batch,
    section: &L::Section,
    view: &ImageView<L>,
) {
    let indices = unsafe { view.indirect_symtab.add(section.reserved1() as usize) };
    let slots = (view.slide + section.addr() as isize) as *mut *const c_void;
    let size = section.size() as usize;

    // __DATA_CONST pointer tables are read-only at rest. The resting bits are
    // sampled at the registry's own allocation, a known-writable reference
    // address rather than the section itself, and re-applied afterwards.
    let _guard = if seg_name_eq(section.segname(), SEG_DATA_CONST) {
        let resting = platform
            .region_protection(registry as *const Batch as *const c_void)
            .unwrap_or(VM_PROT_READ);
        platform.set_protection(
            slots as *const c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        Some(ProtectionGuard {
            platform,
            addr: slots as *const c_void,
            len: size,
            restore: vm_prot_to_posix(resting),
        })
    } else {
        None
    };

    'slots: for i in 0..size / WORD {
        let symtab_index = unsafe { *indices.add(i) };
        if symtab_index == INDIRECT_SYMBOL_ABS
            || symtab_index == INDIRECT_SYMBOL_LOCAL
            || symtab_index == (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS)
        {
            continue;
        }
        let strx = unsafe { (*view.symtab.add(symtab_index as usize)).strx() };
        let name = unsafe { view.strtab.add(strx as usize) };
        // The first byte is the linker's leading underscore; a name needs at
        // least one byte behind it to mean anything.
        if unsafe { *name } == 0 || unsafe { *name.add(1) } == 0 {
            continue;
        }
        let stripped = unsafe { CStr::from_ptr(name.add(1) as *const c_char) };

        for entry in registry.entries() {
            if stripped.to_bytes() != entry.name.to_bytes() {
                continue;
            }
            let slot = unsafe { slots.add(i) };
            let bound = unsafe { *slot };
            // Capture the original only on the first rewrite of this slot; a
            // repeat pass sees the replacement already installed and must not
            // hand it back as the chain target.
            if bound != entry.replacement && !entry.original.is_null() {
                unsafe { *entry.original = bound };
            }
            unsafe { *slot = entry.replacement };
            trace!(
                "retargeted {} at {:p}: {:p} -> {:p}",
                stripped.to_string_lossy(),
                slot,
                bound,
                entry.replacement
            );
            continue 'slots;
        }
    }
}
