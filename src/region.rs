//! Region provider: anonymous OS mappings and the per-region sizing math.
//!
//! A region is one contiguous mapping. Its header sits at the mapping base
//! and is immediately followed by the two layout-index arrays, sized for
//! the worst possible bucket count; the remainder is user-allocatable
//! space in 256-byte arena pages.

use core::mem;
use core::ptr::{self, NonNull};

use crate::layout::{self, LayoutIndex};
use crate::utils::quantize_up;
use crate::{ArenaError, ARENA_PAGE_SIZE};

/// Regions address their contents with 32-bit byte offsets.
pub(crate) const REGION_SIZE_MAX: usize = u32::MAX as usize;

const NODE_SIZE: usize = mem::size_of::<u32>();
const HEADER_SIZE: usize = mem::size_of::<Region>();

/// Header of one mapped region, at the mapping base.
///
/// An arena is a singly linked chain of regions identified by its first
/// ("head") region; every member points back at the head.
#[repr(C)]
pub(crate) struct Region {
    /// Total mapped bytes.
    pub(crate) size: usize,
    /// Bytes taken by this header and the layout-index arrays.
    pub(crate) internal_size: usize,
    pub(crate) layout: LayoutIndex,
    pub(crate) head: *mut Region,
    pub(crate) next: *mut Region,
}

#[cfg(target_os = "linux")]
fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
#[cfg(target_os = "macos")]
fn last_errno() -> i32 {
    unsafe { *libc::__error() }
}
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn last_errno() -> i32 {
    0
}

fn os_page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(page > 0 && (page as usize).is_power_of_two(), "broken system page size");
    page as usize
}

/// Requests zero-initialized, read/write, anonymous, private pages.
fn os_map(size: usize) -> Result<NonNull<u8>, ArenaError> {
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if mem == libc::MAP_FAILED {
        let errno = last_errno();
        log::trace!("mmap of {} bytes failed (errno {})", size, errno);
        return Err(if errno == libc::EINVAL {
            ArenaError::InvalidArgument
        } else {
            ArenaError::NoMemory
        });
    }

    Ok(unsafe { NonNull::new_unchecked(mem.cast()) })
}

/// Releases a mapping. Failure is unrecoverable and only reported.
pub(crate) unsafe fn os_unmap(region: *mut Region, size: usize) -> bool {
    if libc::munmap(region.cast(), size) != 0 {
        log::trace!("munmap failed at {:p} (errno {})", region, last_errno());
        return false;
    }
    true
}

/// Total mapping size for a region of at least `requested_size` user
/// bytes: header, worst-case layout-index arrays (buckets alternating at
/// the minimum granularity), and the quantized user pages, rounded up to
/// the OS page size.
pub(crate) fn region_allocation_size(requested_size: u32, os_page: usize) -> usize {
    let user_size = quantize_up(requested_size as usize, ARENA_PAGE_SIZE);
    let page_count = user_size / ARENA_PAGE_SIZE;
    let max_bucket_count = page_count / 2 + 1;
    let max_node_count = layout::free_size_node_count(max_bucket_count);
    let max_layout_size = (max_bucket_count + 1) * NODE_SIZE + max_node_count * NODE_SIZE;
    let total_size = HEADER_SIZE + max_layout_size + user_size;
    quantize_up(total_size, os_page)
}

/// Back-solves how many arena pages actually fit in `allocation_size`
/// mapped bytes, bookkeeping included. This is the allocation-size formula
/// above solved for the page count; the scalar keeps the integer division
/// from rounding the bookkeeping share away.
pub(crate) fn region_page_count(allocation_size: usize) -> usize {
    const DIV_ERR_SCALAR: usize = 2 * (layout::NODE_CHILD_COUNT - 1);
    let static_cost = (HEADER_SIZE + 4 * NODE_SIZE) * DIV_ERR_SCALAR + 2 * NODE_SIZE;
    let memory_budget = allocation_size * DIV_ERR_SCALAR - static_cost;
    let per_page_cost = (ARENA_PAGE_SIZE + NODE_SIZE) * DIV_ERR_SCALAR + NODE_SIZE;
    memory_budget / per_page_cost
}

/// Maps and initializes a region of at least `size` user bytes. The head
/// and next links are left null for the caller to set.
pub(crate) fn create_region(size: u32) -> Result<NonNull<Region>, ArenaError> {
    let allocation_size = region_allocation_size(size, os_page_size());
    if allocation_size > REGION_SIZE_MAX {
        log::trace!(
            "allocation size ({}) exceeds the maximum region size ({})",
            allocation_size,
            REGION_SIZE_MAX,
        );
        return Err(ArenaError::InvalidArgument);
    }

    let page_count = region_page_count(allocation_size);
    let user_size = page_count * ARENA_PAGE_SIZE;
    let internal_size = allocation_size - user_size;
    let max_bucket_count = page_count / 2 + 1;
    debug_assert!(
        HEADER_SIZE
            + (max_bucket_count + 1) * NODE_SIZE
            + layout::free_size_node_count(max_bucket_count) * NODE_SIZE
            <= internal_size
    );

    let base = os_map(allocation_size)?;
    let region = base.cast::<Region>();

    unsafe {
        // one extra boundary slot serves as the end marker
        let bucket_offsets = base.as_ptr().add(HEADER_SIZE).cast::<u32>();
        let max_free_sizes = bucket_offsets.add(max_bucket_count + 1);

        region.as_ptr().write(Region {
            size: allocation_size,
            internal_size,
            layout: LayoutIndex::new(bucket_offsets, max_free_sizes),
            head: ptr::null_mut(),
            next: ptr::null_mut(),
        });
        (*region.as_ptr()).layout.reset(allocation_size as u32, internal_size as u32);
    }

    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The back-solved page count must leave room for its own worst-case
    /// bookkeeping arrays inside the mapping the solve assumes, for any
    /// request size.
    #[test]
    fn page_solve_always_fits_bookkeeping() {
        for os_page in [4096usize, 16384] {
            for request in (0..200_000u32).step_by(997).chain([1, 255, 256, 257, 30000]) {
                let allocation = region_allocation_size(request, os_page);
                let pages = region_page_count(allocation);
                let user = pages * ARENA_PAGE_SIZE;
                let max_buckets = pages / 2 + 1;
                let bookkeeping = HEADER_SIZE
                    + (max_buckets + 1) * NODE_SIZE
                    + layout::free_size_node_count(max_buckets) * NODE_SIZE;

                assert!(
                    bookkeeping + user <= allocation,
                    "request {} (os page {}): {} + {} > {}",
                    request,
                    os_page,
                    bookkeeping,
                    user,
                    allocation,
                );

                // the solve reclaims the rounding slack, so it never comes in
                // more than one arena page under the request
                assert!(
                    user + ARENA_PAGE_SIZE >= quantize_up(request as usize, ARENA_PAGE_SIZE),
                    "request {}: only {} user bytes",
                    request,
                    user,
                );
            }
        }
    }

    #[test]
    fn thirty_k_request_sizing() {
        let allocation = region_allocation_size(30000, 4096);
        assert_eq!(allocation, 32768);
        let pages = region_page_count(allocation);
        assert_eq!(pages, 125);
        assert_eq!(pages * ARENA_PAGE_SIZE, 32000);
    }

    #[test]
    fn created_region_is_fully_free() {
        let region = create_region(20000).unwrap();
        unsafe {
            let region_ref = &*region.as_ptr();
            let size = region_ref.size;
            assert!(region_ref.head.is_null() && region_ref.next.is_null());
            assert_eq!(region_ref.layout.bucket_count(), 1);
            assert_eq!(region_ref.layout.bucket_start(0), 0);
            assert_eq!(region_ref.layout.bucket_end(0), size as u32);
            assert_eq!(region_ref.layout.root_free_size() as usize, size - region_ref.internal_size);

            assert!(os_unmap(region.as_ptr(), size));
        }
    }

    #[test]
    fn oversized_request_is_invalid() {
        assert!(matches!(create_region(u32::MAX), Err(ArenaError::InvalidArgument)));
    }
}
