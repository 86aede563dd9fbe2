//! Image walking.
//!
//! Given an image's header and load slide, locates the `__LINKEDIT` metadata
//! (symbol table, string table, indirect symbol table) and dispatches every
//! lazy and non-lazy symbol pointer section in `__DATA` and `__DATA_CONST`
//! to the rewriter.

use std::ffi::c_void;

use tracing::trace;

use crate::macho::{
    DysymtabCommand, HostLayout, LC_DYSYMTAB, LC_SYMTAB, Layout, LoadCommands,
    S_LAZY_SYMBOL_POINTERS, S_NON_LAZY_SYMBOL_POINTERS, SECTION_TYPE, SEG_DATA, SEG_DATA_CONST,
    SEG_LINKEDIT, Section, SegmentCommand, SymtabCommand, seg_name_eq,
};
use crate::registry::Batch;
use crate::rewrite;
use crate::sys::Platform;

/// Transient per-image bundle: the load slide and the three `__LINKEDIT`
/// tables every slot lookup goes through.
pub(crate) struct ImageView<L: Layout> {
    pub(crate) slide: isize,
    pub(crate) symtab: *const L::Nlist,
    pub(crate) strtab: *const u8,
    pub(crate) indirect_symtab: *const u32,
}

/// Walks one image with the layout of the compilation target.
///
/// # Safety
///
/// `header` must point to the Mach-O header of an image mapped at `slide`,
/// as handed out by the dynamic loader.
pub(crate) unsafe fn rebind_image_with<P: Platform>(
    platform: &P,
    registry: &Batch,
    header: *const c_void,
    slide: isize,
) {
    unsafe { rebind_image_in::<HostLayout, P>(platform, registry, header, slide) }
}

/// Walks one image: locates the `__LINKEDIT` segment, symtab command, and
/// dysymtab command, derives the table pointers, then rewrites every
/// candidate pointer section against the registry.
///
/// # Safety
///
/// As [`rebind_image_with`], with `header` laid out per `L`.
pub(crate) unsafe fn rebind_image_in<L: Layout, P: Platform>(
    platform: &P,
    registry: &Batch,
    header: *const c_void,
    slide: isize,
) {
    // Mappings the resolver cannot name are not images to touch.
    if !platform.resolves_image(header) {
        trace!("skipping unresolvable image at {:p}", header);
        return;
    }

    let mut linkedit: Option<&L::SegmentCommand> = None;
    let mut symtab_cmd: Option<&SymtabCommand> = None;
    let mut dysymtab_cmd: Option<&DysymtabCommand> = None;

    for lc in unsafe { LoadCommands::new::<L>(header) } {
        let cmd = unsafe { (*lc).cmd };
        if cmd == L::LC_SEGMENT {
            let segment = unsafe { &*(lc as *const L::SegmentCommand) };
            if seg_name_eq(segment.segname(), SEG_LINKEDIT) {
                linkedit = Some(segment);
            }
        } else if cmd == LC_SYMTAB {
            symtab_cmd = Some(unsafe { &*(lc as *const SymtabCommand) });
        } else if cmd == LC_DYSYMTAB {
            dysymtab_cmd = Some(unsafe { &*(lc as *const DysymtabCommand) });
        }
    }

    let (Some(linkedit), Some(symtab_cmd), Some(dysymtab_cmd)) =
        (linkedit, symtab_cmd, dysymtab_cmd)
    else {
        trace!("image at {:p} is missing linker metadata", header);
        return;
    };
    if dysymtab_cmd.nindirectsyms == 0 {
        return;
    }

    // Every __LINKEDIT file offset is relative to where the segment's file
    // content landed in memory: slide + vmaddr backs out to that base.
    let linkedit_base =
        (slide + linkedit.vmaddr() as isize - linkedit.fileoff() as isize) as usize;
    let view = ImageView::<L> {
        slide,
        symtab: (linkedit_base + symtab_cmd.symoff as usize) as *const L::Nlist,
        strtab: (linkedit_base + symtab_cmd.stroff as usize) as *const u8,
        indirect_symtab: (linkedit_base + dysymtab_cmd.indirectsymoff as usize) as *const u32,
    };

    for lc in unsafe { LoadCommands::new::<L>(header) } {
        if unsafe { (*lc).cmd } != L::LC_SEGMENT {
            continue;
        }
        let segment = unsafe { &*(lc as *const L::SegmentCommand) };
        if !seg_name_eq(segment.segname(), SEG_DATA)
            && !seg_name_eq(segment.segname(), SEG_DATA_CONST)
        {
            continue;
        }
        let sections = unsafe {
            (lc as *const u8).add(size_of::<L::SegmentCommand>()) as *const L::Section
        };
        for j in 0..segment.nsects() {
            let section = unsafe { &*sections.add(j as usize) };
            let kind = section.flags() & SECTION_TYPE;
            if kind == S_LAZY_SYMBOL_POINTERS || kind == S_NON_LAZY_SYMBOL_POINTERS {
                trace!(
                    "rewriting section {}",
                    String::from_utf8_lossy(section.sectname()).trim_end_matches('\0')
                );
                unsafe { rewrite::rebind_section::<L, P>(platform, registry, section, &view) };
            }
        }
    }
}
