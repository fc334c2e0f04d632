// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin, platform-agnostic access to the host's virtual-memory primitives.
//!
//! This crate exists so that higher layers (a guest-memory manager, JIT code
//! buffers) can reserve, commit, re-protect and release address-space regions
//! without coding against `mmap` or `VirtualAlloc` directly. Each operation is
//! a stateless mapping to a single host call, guarded by a translation layer
//! that keeps host constants out of the public surface; the only cached state
//! is the allocation granularity returned by [`page_size`].
//!
//! The crate keeps no registry of outstanding regions: a region is identified
//! solely by the base address returned from [`alloc_fixed`] and its length,
//! and lives until a matching [`dealloc_fixed`] with
//! [`DeallocationType::Release`] or [`DeallocationType::DecommitRelease`].
//! There is no synchronization of its own either — the calling process's
//! address space is a global resource and callers own the coordination of
//! concurrent operations on overlapping ranges.
//!
//! Operational failures (address unavailable, bad base, quota) are reported
//! as `None`/`false` with no attached cause and are never retried; callers
//! that need diagnostics should consult [`std::io::Error::last_os_error`]
//! immediately after the failing call.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

mod sys;

/// Protection level applied to a range of pages.
///
/// This is a closed set rather than a host-flag bitmask so that callers
/// cannot express combinations the supported hosts disagree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageAccess {
    /// Any access faults.
    NoAccess,
    /// Reads allowed; writes and instruction fetches fault.
    ReadOnly,
    /// Reads and writes allowed; instruction fetches fault.
    ReadWrite,
    /// Reads, writes and instruction fetches allowed.
    ExecuteReadWrite,
}

/// Whether [`alloc_fixed`] reserves address space, commits backing storage,
/// or both in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// Claim a range of addresses without backing storage or commit charge.
    Reserve,
    /// Associate backing storage with a previously reserved range.
    Commit,
    /// Reserve and commit in a single call.
    ReserveCommit,
}

/// Whether [`dealloc_fixed`] releases the reservation, decommits backing
/// storage, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeallocationType {
    /// Return the reservation (and any remaining commitment) to the host.
    Release,
    /// Discard backing storage while keeping the reservation intact, so the
    /// range can be re-committed later.
    Decommit,
    /// Decommit and release.
    DecommitRelease,
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the host's address-space allocation granularity in bytes.
///
/// This is not necessarily the CPU page size: on Windows it is the (coarser)
/// `VirtualAlloc` allocation granularity, and regions can only be placed at
/// multiples of it. The value is queried from the host once per process and
/// cached; the query cannot fail on any supported host.
pub fn page_size() -> usize {
    memoize(&PAGE_SIZE, sys::allocation_granularity)
}

/// Relaxed ordering is enough here: concurrent first callers race to store
/// the same value, and every reader observes either the published value or
/// recomputes it identically.
fn memoize(cell: &AtomicUsize, query: impl FnOnce() -> usize) -> usize {
    match cell.load(Ordering::Relaxed) {
        0 => {
            let value = query();
            debug_assert!(value >= 1);
            cell.store(value, Ordering::Relaxed);
            value
        }
        value => value,
    }
}

/// Reserves and/or commits a region of the calling process's address space.
///
/// If `base_address` is given the host is asked to place the region at
/// exactly that address and the call fails if it cannot — a region is never
/// silently relocated. With `None` the host picks an address. `length` is
/// rounded up by the host to its allocation granularity; callers that care
/// about exact extents must align to [`page_size`] themselves.
///
/// `access` sets the initial protection. For [`AllocationType::Reserve`] the
/// argument is accepted on all hosts but a reservation is inaccessible until
/// committed; the protection requested by the eventual
/// [`AllocationType::Commit`] call is what takes effect. `Commit` requires a
/// previously reserved range and therefore a base address.
///
/// Returns the base of the resulting region, or `None` if the host refused
/// the call.
///
/// # Safety
///
/// Committing or reserving at a fixed base can alias memory other code holds
/// references into. The caller must ensure the range is not concurrently
/// handed to conflicting operations.
pub unsafe fn alloc_fixed(
    base_address: Option<NonNull<u8>>,
    length: usize,
    allocation_type: AllocationType,
    access: PageAccess,
) -> Option<NonNull<u8>> {
    // Safety: ensured by caller
    unsafe { sys::alloc_fixed(base_address, length, allocation_type, access) }
}

/// Decommits and/or releases a region previously obtained from
/// [`alloc_fixed`].
///
/// [`DeallocationType::Release`] and [`DeallocationType::DecommitRelease`]
/// must be paired with the exact base returned by the matching allocation;
/// `length` is accepted for portability but ignored by hosts that can only
/// release a whole reservation. [`DeallocationType::Decommit`] discards the
/// backing of the given sub-range while keeping the reservation, so it can be
/// re-committed later.
///
/// Returns `true` on success, `false` if the host rejected the call (invalid
/// base, partial release on a whole-region host, already freed). No recovery
/// is attempted.
///
/// # Safety
///
/// The caller must ensure nothing holds references into the range being
/// decommitted or released.
pub unsafe fn dealloc_fixed(
    base_address: NonNull<u8>,
    length: usize,
    deallocation_type: DeallocationType,
) -> bool {
    // Safety: ensured by caller
    unsafe { sys::dealloc_fixed(base_address, length, deallocation_type) }
}

/// Applies `access` to every page intersecting `[base, base + length)`.
///
/// If `out_old_access` is supplied it is overwritten with
/// [`PageAccess::NoAccess`] before anything else, so that it carries a
/// defined value even when the call fails. On success it is set to the prior
/// protection of the first page in the range — hosts report a single value
/// for the whole range, so callers with mixed ranges must split the call. A
/// prior protection outside the four supported levels is a bug in the
/// portability layer (debug assertion) and leaves the pre-cleared value.
///
/// Returns `true` on success; on failure the protection of the range is
/// unspecified, per host semantics.
///
/// # Safety
///
/// Revoking access to pages that other code holds references into makes any
/// use of those references undefined behavior.
pub unsafe fn protect(
    base_address: NonNull<u8>,
    length: usize,
    access: PageAccess,
    out_old_access: Option<&mut PageAccess>,
) -> bool {
    // Safety: ensured by caller
    unsafe { sys::protect(base_address, length, access, out_old_access) }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;

    #[test]
    fn memoize_queries_the_host_once() {
        let cell = AtomicUsize::new(0);
        let calls = Cell::new(0_u32);

        let first = memoize(&cell, || {
            calls.set(calls.get() + 1);
            0x1000
        });
        let second = memoize(&cell, || {
            calls.set(calls.get() + 1);
            0x1000
        });

        assert_eq!(first, 0x1000);
        assert_eq!(second, 0x1000);
        assert_eq!(calls.get(), 1);
    }
}
