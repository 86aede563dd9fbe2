//! Darwin bindings: dyld image enumeration, the add-image hook, and the Mach
//! VM primitives behind [`Platform`].

use std::ffi::c_void;
use std::mem;
use std::sync::Once;

use libc::c_int;
use mach2::kern_return::KERN_SUCCESS;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::traps::mach_task_self;
use mach2::vm::mach_vm_region;
use mach2::vm_region::{VM_REGION_BASIC_INFO_64, vm_region_basic_info_data_64_t, vm_region_info_t};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use tracing::warn;

use super::{Platform, VmProt};
use crate::{image, registry};

unsafe extern "C" {
    fn _dyld_register_func_for_add_image(callback: unsafe extern "C" fn(*const c_void, isize));
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(image_index: u32) -> *const c_void;
    fn _dyld_get_image_vmaddr_slide(image_index: u32) -> isize;
}

/// The live loader and kernel.
pub(crate) struct DyldPlatform;

impl Platform for DyldPlatform {
    fn resolves_image(&self, header: *const c_void) -> bool {
        let mut info: libc::Dl_info = unsafe { mem::zeroed() };
        unsafe { libc::dladdr(header, &mut info) != 0 }
    }

    fn region_protection(&self, addr: *const c_void) -> Option<VmProt> {
        let mut address = addr as mach_vm_address_t;
        let mut size: mach_vm_size_t = 0;
        let mut info: vm_region_basic_info_data_64_t = unsafe { mem::zeroed() };
        let mut count = (size_of::<vm_region_basic_info_data_64_t>() / size_of::<c_int>())
            as mach_msg_type_number_t;
        let mut object_name: mach_port_t = 0;
        let kr = unsafe {
            mach_vm_region(
                mach_task_self(),
                &mut address,
                &mut size,
                VM_REGION_BASIC_INFO_64,
                &mut info as *mut _ as vm_region_info_t,
                &mut count,
                &mut object_name,
            )
        };
        (kr == KERN_SUCCESS).then_some(info.protection)
    }

    fn set_protection(&self, addr: *const c_void, len: usize, prot: c_int) {
        // mprotect requires a page-aligned start; widen the range down to the
        // page holding the first slot.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let start = addr as usize & !(page - 1);
        let len = len + (addr as usize - start);
        if unsafe { libc::mprotect(start as *mut c_void, len, prot) } != 0 {
            warn!(
                "mprotect({:#x}, {}, {:#x}) failed: {}",
                start,
                len,
                prot,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Installs the add-image hook exactly once. dyld invokes the callback for
/// every already-loaded image immediately and for each image loaded later.
pub(crate) fn install_add_image_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe { _dyld_register_func_for_add_image(rebind_image_added) });
}

/// Add-image callback: walks the new image against the registry head current
/// at invocation time.
unsafe extern "C" fn rebind_image_added(header: *const c_void, slide: isize) {
    if let Some(head) = registry::global_head() {
        unsafe { image::rebind_image_with(&DyldPlatform, head, header, slide) };
    }
}

/// Runs `f` over every currently-loaded image.
pub(crate) fn for_each_image(mut f: impl FnMut(*const c_void, isize)) {
    let count = unsafe { _dyld_image_count() };
    for index in 0..count {
        let header = unsafe { _dyld_get_image_header(index) };
        let slide = unsafe { _dyld_get_image_vmaddr_slide(index) };
        f(header, slide);
    }
}
