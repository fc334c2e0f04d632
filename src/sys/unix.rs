// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ffi::c_int;
use core::ptr::{self, NonNull};

use crate::{AllocationType, DeallocationType, PageAccess};

pub(crate) fn allocation_granularity() -> usize {
    // Safety: sysconf with a valid name has no preconditions.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

fn prot_flags(access: PageAccess) -> c_int {
    match access {
        PageAccess::NoAccess => libc::PROT_NONE,
        PageAccess::ReadOnly => libc::PROT_READ,
        PageAccess::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        PageAccess::ExecuteReadWrite => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    }
}

pub(crate) unsafe fn alloc_fixed(
    base_address: Option<NonNull<u8>>,
    length: usize,
    allocation_type: AllocationType,
    access: PageAccess,
) -> Option<NonNull<u8>> {
    let (prot, flags) = match allocation_type {
        // A reservation must not carry commit charge, so it is always mapped
        // inaccessible; the protection requested here takes effect when the
        // range is committed.
        AllocationType::Reserve => (
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        ),
        AllocationType::ReserveCommit => {
            (prot_flags(access), libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)
        }
        AllocationType::Commit => {
            // Committing makes a previously reserved range accessible and
            // lets the kernel back it on first touch.
            let Some(base) = base_address else {
                debug_assert!(false, "commit requires the base of a prior reservation");
                return None;
            };
            // Safety: ensured by caller
            let ret =
                unsafe { libc::mprotect(base.as_ptr().cast(), length, prot_flags(access)) };
            return (ret == 0).then_some(base);
        }
    };

    let requested = base_address.map_or(ptr::null_mut(), |base| {
        base.as_ptr().cast::<libc::c_void>()
    });

    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            // Fail instead of clobbering an existing mapping at the
            // requested base.
            let fixed = if base_address.is_some() {
                libc::MAP_FIXED_NOREPLACE
            } else {
                0
            };
        } else {
            let fixed = 0;
        }
    }

    // Safety: anonymous mapping, no file descriptor involved.
    let ret = unsafe { libc::mmap(requested, length, prot, flags | fixed, -1, 0) };
    if ret == libc::MAP_FAILED {
        return None;
    }

    // Hosts without MAP_FIXED_NOREPLACE (and kernels predating it) treat the
    // requested base as a hint; a region placed anywhere else counts as
    // failure, not silent relocation.
    if base_address.is_some() && ret != requested {
        // Safety: undoing the mapping created above, nothing can refer to it
        // yet.
        unsafe { libc::munmap(ret, length) };
        return None;
    }

    NonNull::new(ret.cast::<u8>())
}

pub(crate) unsafe fn dealloc_fixed(
    base_address: NonNull<u8>,
    length: usize,
    deallocation_type: DeallocationType,
) -> bool {
    let base = base_address.as_ptr().cast::<libc::c_void>();
    match deallocation_type {
        // Unmapping discards any backing storage, so the combined form needs
        // no separate decommit step.
        DeallocationType::Release | DeallocationType::DecommitRelease => {
            // Safety: ensured by caller
            unsafe { libc::munmap(base, length) == 0 }
        }
        DeallocationType::Decommit => {
            // Drop the backing pages, then make the range inaccessible again
            // so it behaves like a fresh reservation until re-committed.
            // Safety: ensured by caller
            unsafe {
                libc::madvise(base, length, libc::MADV_DONTNEED) == 0
                    && libc::mprotect(base, length, libc::PROT_NONE) == 0
            }
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

    // mprotect does not report the prior protection, so look it up while the
    // old mapping is still in place.
    let old = if out_old_access.is_some() {
        query_access(base_address.as_ptr() as usize)
    } else {
        None
    };

    // Safety: ensured by caller
    let ret = unsafe { libc::mprotect(base_address.as_ptr().cast(), length, prot_flags(access)) };
    if ret != 0 {
        return false;
    }

    if let Some(slot) = out_old_access {
        if let Some(old) = old {
            *slot = old;
        }
    }
    true
}

/// Looks up the protection of the mapping containing `addr`.
///
/// Linux exposes mapping permissions through `/proc/self/maps`. Other Unixes
/// have no portable query, so callers there observe the pre-cleared
/// `NoAccess` value.
#[cfg(target_os = "linux")]
fn query_access(addr: usize) -> Option<PageAccess> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    for line in maps.lines() {
        let Some((range, rest)) = line.split_once(' ') else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) else {
            continue;
        };
        if (start..end).contains(&addr) {
            return access_from_perms(rest.as_bytes().get(..3)?);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn query_access(_addr: usize) -> Option<PageAccess> {
    None
}

/// Translates a kernel-reported permission column back to a [`PageAccess`].
///
/// A combination outside the four supported levels means the host reported a
/// protection this module never sets; that is a portability bug and maps to
/// the safe fallback rather than widening access.
#[cfg(target_os = "linux")]
fn access_from_perms(perms: &[u8]) -> Option<PageAccess> {
    match perms {
        b"---" => Some(PageAccess::NoAccess),
        b"r--" => Some(PageAccess::ReadOnly),
        b"rw-" => Some(PageAccess::ReadWrite),
        b"rwx" => Some(PageAccess::ExecuteReadWrite),
        _ => {
            debug_assert!(false, "unhandled host protection {perms:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_flags_cover_every_access_level() {
        assert_eq!(prot_flags(PageAccess::NoAccess), libc::PROT_NONE);
        assert_eq!(prot_flags(PageAccess::ReadOnly), libc::PROT_READ);
        assert_eq!(
            prot_flags(PageAccess::ReadWrite),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(
            prot_flags(PageAccess::ExecuteReadWrite),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn perms_translate_back_to_every_access_level() {
        let cases: [(&[u8], PageAccess); 4] = [
            (b"---", PageAccess::NoAccess),
            (b"r--", PageAccess::ReadOnly),
            (b"rw-", PageAccess::ReadWrite),
            (b"rwx", PageAccess::ExecuteReadWrite),
        ];
        for (perms, access) in cases {
            assert_eq!(access_from_perms(perms), Some(access));
        }
    }
}
