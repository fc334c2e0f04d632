// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::mem;
use core::ptr::{self, NonNull};

use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, VirtualAlloc, VirtualFree,
    VirtualProtect,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::{AllocationType, DeallocationType, PageAccess};

pub(crate) fn allocation_granularity() -> usize {
    // Safety: GetSystemInfo only writes to the struct it is handed.
    unsafe {
        let mut sysinfo: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut sysinfo);
        // Regions can only be placed at allocation-granularity boundaries,
        // which is coarser than the CPU page size on every supported host.
        sysinfo.dwAllocationGranularity.max(sysinfo.dwPageSize) as usize
    }
}

fn protect_flags(access: PageAccess) -> PAGE_PROTECTION_FLAGS {
    match access {
        PageAccess::NoAccess => PAGE_NOACCESS,
        PageAccess::ReadOnly => PAGE_READONLY,
        PageAccess::ReadWrite => PAGE_READWRITE,
        PageAccess::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
    }
}

/// A value outside the four constants this module hands out means the host
/// reported a protection the portability layer never sets; map it to the
/// safe fallback rather than widening access.
fn access_from_protect_flags(protect: PAGE_PROTECTION_FLAGS) -> Option<PageAccess> {
    match protect {
        PAGE_NOACCESS => Some(PageAccess::NoAccess),
        PAGE_READONLY => Some(PageAccess::ReadOnly),
        PAGE_READWRITE => Some(PageAccess::ReadWrite),
        PAGE_EXECUTE_READWRITE => Some(PageAccess::ExecuteReadWrite),
        _ => {
            debug_assert!(false, "unhandled host protection {protect:#x}");
            None
        }
    }
}

pub(crate) unsafe fn alloc_fixed(
    base_address: Option<NonNull<u8>>,
    length: usize,
    allocation_type: AllocationType,
    access: PageAccess,
) -> Option<NonNull<u8>> {
    let alloc_type = match allocation_type {
        AllocationType::Reserve => MEM_RESERVE,
        AllocationType::Commit => MEM_COMMIT,
        AllocationType::ReserveCommit => MEM_RESERVE | MEM_COMMIT,
    };
    let base = base_address.map_or(ptr::null(), |base| base.as_ptr().cast_const().cast());

    // VirtualAlloc fails rather than relocating when the requested base is
    // unavailable.
    // Safety: ensured by caller
    let ret = unsafe { VirtualAlloc(base, length, alloc_type, protect_flags(access)) };
    NonNull::new(ret.cast::<u8>())
}

pub(crate) unsafe fn dealloc_fixed(
    base_address: NonNull<u8>,
    length: usize,
    deallocation_type: DeallocationType,
) -> bool {
    let base = base_address.as_ptr().cast();
    match deallocation_type {
        // Releasing returns the whole reservation (decommitting it in the
        // process) and requires a zero size; the length only matters for
        // decommits of a sub-range.
        DeallocationType::Release | DeallocationType::DecommitRelease => {
            // Safety: ensured by caller
            unsafe { VirtualFree(base, 0, MEM_RELEASE) != 0 }
        }
        DeallocationType::Decommit => {
            // Safety: ensured by caller
            unsafe { VirtualFree(base, length, MEM_DECOMMIT) != 0 }
        }
    }
}

pub(crate) unsafe fn protect(
    base_address: NonNull<u8>,
    length: usize,
    access: PageAccess,
    out_old_access: Option<&mut PageAccess>,
) -> bool {
    // Pre-clear so the slot holds a defined value even if the call fails.
    let out_old_access = out_old_access.map(|slot| {
        *slot = PageAccess::NoAccess;
        slot
    });

    let mut old_protect: PAGE_PROTECTION_FLAGS = 0;
    // Safety: ensured by caller
    let ret = unsafe {
        VirtualProtect(
            base_address.as_ptr().cast(),
            length,
            protect_flags(access),
            &mut old_protect,
        )
    };
    if ret == 0 {
        return false;
    }

    if let Some(slot) = out_old_access {
        if let Some(old) = access_from_protect_flags(old_protect) {
            *slot = old;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_flags_round_trip() {
        let cases = [
            PageAccess::NoAccess,
            PageAccess::ReadOnly,
            PageAccess::ReadWrite,
            PageAccess::ExecuteReadWrite,
        ];
        for access in cases {
            assert_eq!(access_from_protect_flags(protect_flags(access)), Some(access));
        }
    }
}
