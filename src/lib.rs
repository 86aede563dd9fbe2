//! Regraft - in-process retargeting of dynamically-imported symbols.
//!
//! Regraft rewrites the lazy and non-lazy indirect symbol pointer tables of
//! every loaded Mach-O image so that calls to a named import transparently
//! jump to a caller-supplied replacement. The previously-bound address is
//! captured on the first rewrite of each slot, so a replacement can chain to
//! the original. Executable code is never modified: imports already go
//! through a writable indirection table, and only those slots are touched.
//!
//! # Modules
//!
//! - `registry` - caller-visible rebinding records and the append-only batch
//!   registry
//! - `macho` - Mach-O loader structures for both pointer widths
//! - `image` - the per-image walker over `__LINKEDIT` metadata
//! - `rewrite` - the pointer-section rewriter and its protection guard
//! - `sys` - platform-primitive contracts and the Darwin bindings
//!
//! # Example
//!
//! ```ignore
//! use std::ffi::c_void;
//! use std::ptr;
//!
//! static mut ORIG_CLOSE: *const c_void = ptr::null();
//!
//! unsafe extern "C" fn my_close(fd: i32) -> i32 {
//!     let orig: unsafe extern "C" fn(i32) -> i32 =
//!         unsafe { std::mem::transmute(ORIG_CLOSE) };
//!     unsafe { orig(fd) }
//! }
//!
//! unsafe {
//!     regraft::rebind_symbols(&[regraft::Rebinding::with_original(
//!         "close",
//!         my_close as *const c_void,
//!         &raw mut ORIG_CLOSE,
//!     )])?;
//! }
//! ```
//!
//! Registration is `unsafe`: the caller asserts that each replacement has a
//! signature compatible with the import it shadows, and that registrations
//! are serialized with each other.

// The dyld-backed entry points only exist on macOS; other targets compile
// the engine for its test suite.
#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

mod image;
mod macho;
mod registry;
mod rewrite;
mod sys;

pub use registry::Rebinding;

/// Consolidated error type for registration. Per-image conditions (an image
/// the resolver cannot name, missing linker metadata) are absorbed silently
/// by design; only registration-time failures surface.
#[derive(Debug, thiserror::Error)]
pub enum RebindError {
    #[error("failed to allocate rebinding batch")]
    Allocation,

    #[error("rebinding name contains an interior nul byte")]
    InvalidName,
}

pub type Result<T> = core::result::Result<T, RebindError>;

/// Registers `rebindings` process-wide: every currently-loaded image is
/// rewritten, and every image loaded later is rewritten as dyld maps it.
///
/// The slice is copied; the caller may drop it on return. Replacements
/// registered later shadow earlier ones for the same symbol. There is no
/// deregistration: a live indirect slot may point into a registered batch
/// for the remainder of the process lifetime.
///
/// # Safety
///
/// Each replacement must be an address callable with the signature of the
/// import it replaces, and calls to the registration entry points must not
/// race each other.
#[cfg(target_os = "macos")]
pub unsafe fn rebind_symbols(rebindings: &[Rebinding]) -> Result<()> {
    use tracing::debug;

    debug!("registering {} rebindings", rebindings.len());
    let first = registry::prepend_global(rebindings)?;
    if first {
        // dyld runs the callback for every image that is already loaded and
        // for each one mapped from here on.
        sys::darwin::install_add_image_hook();
    } else if let Some(head) = registry::global_head() {
        // The hook only fires for new images; bring the existing ones up to
        // date against the full registry.
        sys::darwin::for_each_image(|header, slide| unsafe {
            image::rebind_image_with(&sys::darwin::DyldPlatform, head, header, slide)
        });
    }
    Ok(())
}

/// Rewrites exactly one image against `rebindings`, without touching the
/// process-wide registry or affecting images loaded later.
///
/// `header` and `slide` are the values dyld reports for the image.
///
/// # Safety
///
/// As [`rebind_symbols`]; additionally `header` must point to the Mach-O
/// header of an image currently mapped at `slide`.
#[cfg(target_os = "macos")]
pub unsafe fn rebind_image(
    header: *const std::ffi::c_void,
    slide: isize,
    rebindings: &[Rebinding],
) -> Result<()> {
    let batch = registry::Batch::copied(rebindings, std::ptr::null())?;
    unsafe { image::rebind_image_with(&sys::darwin::DyldPlatform, &batch, header, slide) };
    Ok(())
}
