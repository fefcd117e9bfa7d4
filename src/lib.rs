#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]

#[cfg(not(unix))]
compile_error!("the region provider requires Unix anonymous mappings");

mod bump;
mod chunk;
mod introspect;
mod layout;
mod region;
mod utils;

pub use bump::Bump;
pub use introspect::Introspect;

use chunk::{ChunkHeader, ChunkPlace, CHUNK_HEADER_SIZE};
use region::{Region, REGION_SIZE_MAX};
use utils::{quantize_up, scan_for_errors};

use core::ptr::{self, NonNull};

// Chunk (8 byte header overhead):
//   | SIZE: u32, OFFSET: u32 | ...payload... |
// SIZE is the whole quantized chunk, OFFSET walks back to the region header.
//
// Every region keeps its bucket boundaries and free-size tree in arrays
// directly behind its header; that bookkeeping prefix plays the role of a
// permanent first allocation in bucket 0 and is never freed or resized.

/// Quantization granularity: chunk sizes and bucket boundaries are always
/// multiples of this.
pub const ARENA_PAGE_SIZE: usize = 256;

/// Error kind for the operations that create or grow OS-backed regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// The request exceeds the maximum representable region size.
    InvalidArgument,
    /// The operating system refused to provide the mapping.
    NoMemory,
}

impl core::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ArenaError::InvalidArgument => f.write_str("request exceeds the maximum region size"),
            ArenaError::NoMemory => f.write_str("the OS refused to provide memory"),
        }
    }
}

/// A memory arena: one or more OS-mapped regions chained together, with
/// best-fit chunk allocation across and within them.
///
/// All operations are unsynchronized; share an arena across threads only
/// behind an external lock. Dropping the arena unmaps every region.
pub struct Arena {
    head: NonNull<Region>,
}

impl Arena {
    /// Creates a new arena with a capacity of at least `size` bytes.
    pub fn create(size: u32) -> Result<Self, ArenaError> {
        let head = region::create_region(size)?;
        unsafe {
            (*head.as_ptr()).head = head.as_ptr();
        }
        let arena = Self { head };
        scan_for_errors(&arena);
        Ok(arena)
    }

    /// Expands the arena by at least `add_size` bytes of fresh capacity.
    ///
    /// The new region need not be contiguous with existing ones.
    pub fn expand(&mut self, add_size: u32) -> Result<(), ArenaError> {
        let region = region::create_region(add_size)?;
        unsafe {
            let head = self.head.as_ptr();
            (*region.as_ptr()).head = head;
            (*region.as_ptr()).next = (*head).next;
            (*head).next = region.as_ptr();
        }
        scan_for_errors(self);
        Ok(())
    }

    /// Frees every chunk in one go, without returning memory to the OS.
    pub fn reset(&mut self) {
        unsafe {
            let mut region = self.head.as_ptr();
            while !region.is_null() {
                let size = (*region).size;
                let internal_size = (*region).internal_size;
                (*region).layout.reset(size as u32, internal_size as u32);
                region = (*region).next;
            }
        }
        scan_for_errors(self);
    }

    /// Allocates a chunk of at least `size` bytes. Fails for `size == 0`
    /// and when no region has a sufficient contiguous free range.
    pub fn malloc(&mut self, size: u32) -> Result<NonNull<u8>, ()> {
        if size == 0 {
            return Err(());
        }
        let effective = quantize_up(size as usize + CHUNK_HEADER_SIZE, ARENA_PAGE_SIZE);
        if effective > REGION_SIZE_MAX {
            return Err(());
        }

        unsafe {
            let region = self.best_fit_region(effective as u32).ok_or(())?;
            let addr = self.place_chunk(region, effective as u32);
            scan_for_errors(self);
            Ok(addr)
        }
    }

    /// Resizes the chunk at `addr` to at least `new_size` bytes, moving it
    /// if it cannot be resized in place, and returns the (possibly new)
    /// address. On failure the original chunk is left valid and unmoved.
    ///
    /// # Safety
    /// `addr` must have been returned by [`Self::malloc`] or
    /// [`Self::realloc`] on this arena and not freed or moved since.
    pub unsafe fn realloc(&mut self, addr: NonNull<u8>, new_size: u32) -> Result<NonNull<u8>, ()> {
        if new_size == 0 {
            return Err(());
        }
        let effective = quantize_up(new_size as usize + CHUNK_HEADER_SIZE, ARENA_PAGE_SIZE);
        if effective > REGION_SIZE_MAX {
            return Err(());
        }
        let effective = effective as u32;

        let (header, place) = chunk::locate(addr);
        debug_assert!((*place.region).head == self.head.as_ptr());
        let old_size = (*header.as_ptr()).size;

        if effective == old_size {
            return Ok(addr);
        }

        let layout = &mut (*place.region).layout;
        if place.is_last {
            // the chunk's end abuts the free tail: adjust in place if the
            // tail can absorb the growth
            let delta = effective as i64 - old_size as i64;
            if delta <= layout.bucket_free_size(place.bucket) as i64 {
                layout.update_free_size(place.bucket, -delta, true);
                (*header.as_ptr()).size = effective;
                scan_for_errors(self);
                return Ok(addr);
            }
        } else if effective < old_size {
            // interior chunks can only shrink in place: cut the bucket at
            // the chunk's old end so the freed remainder becomes the
            // leading bucket's free tail
            let old_end = (*header.as_ptr()).offset + old_size;
            (*header.as_ptr()).size = effective;
            layout.split_at(place.bucket, old_end);
            layout.update_free_size(place.bucket, (old_size - effective) as i64, true);
            scan_for_errors(self);
            return Ok(addr);
        }

        self.realloc_move(header, place, new_size)
    }

    /// Fallback for rejected in-place resizes: free the chunk first so its
    /// own space can serve the new allocation, then move the overlapping
    /// byte range. Reverts the free if the allocation misses.
    unsafe fn realloc_move(
        &mut self,
        header: NonNull<ChunkHeader>,
        place: ChunkPlace,
        new_size: u32,
    ) -> Result<NonNull<u8>, ()> {
        let old_size = (*header.as_ptr()).size;
        let old_offset = (*header.as_ptr()).offset;
        let region = place.region;

        self.free_located(header, &place);

        match self.malloc(new_size) {
            Ok(new_addr) => {
                let old_addr = ChunkHeader::user_ptr(header);
                let old_payload = old_size as usize - CHUNK_HEADER_SIZE;
                let new_payload = self.chunk_size(new_addr) as usize;
                // the new chunk may overlap the just-freed one
                ptr::copy(old_addr.as_ptr(), new_addr.as_ptr(), old_payload.min(new_payload));
                scan_for_errors(self);
                Ok(new_addr)
            }
            Err(()) => {
                self.revert_free(region, old_offset, old_size);
                scan_for_errors(self);
                Err(())
            }
        }
    }

    /// Frees the chunk at `addr`, allowing its space to be reused.
    ///
    /// # Safety
    /// `addr` must have been returned by [`Self::malloc`] or
    /// [`Self::realloc`] on this arena and not freed or moved since.
    pub unsafe fn free(&mut self, addr: NonNull<u8>) {
        let (header, place) = chunk::locate(addr);
        debug_assert!((*place.region).head == self.head.as_ptr());
        self.free_located(header, &place);
        scan_for_errors(self);
    }

    /// Returns the granted payload size of the chunk at `addr`, which may
    /// exceed what was asked for due to quantization.
    ///
    /// # Safety
    /// `addr` must point at the payload of a live chunk of this arena.
    pub unsafe fn chunk_size(&self, addr: NonNull<u8>) -> u32 {
        let header = ChunkHeader::from_user_ptr(addr);
        (*header.as_ptr()).size - CHUNK_HEADER_SIZE as u32
    }

    /// Returns a [`Display`](core::fmt::Display) report of every region,
    /// bucket, and chunk. Purely diagnostic; no allocation path uses it.
    pub fn introspect(&self) -> Introspect<'_> {
        Introspect::new(self)
    }

    pub(crate) fn head_ptr(&self) -> *mut Region {
        self.head.as_ptr()
    }

    /// The region whose largest free range is the tightest fit for
    /// `effective` bytes.
    unsafe fn best_fit_region(&self, effective: u32) -> Option<*mut Region> {
        let mut best: Option<(*mut Region, u32)> = None;
        let mut region = self.head.as_ptr();
        while !region.is_null() {
            let root_free = (*region).layout.root_free_size();
            if root_free >= effective && best.map_or(true, |(_, free)| root_free < free) {
                best = Some((region, root_free));
            }
            region = (*region).next;
        }
        best.map(|(region, _)| region)
    }

    /// Carves a chunk out of the best-fit bucket of `region`, which must
    /// have a sufficient free range.
    unsafe fn place_chunk(&mut self, region: *mut Region, effective: u32) -> NonNull<u8> {
        let layout = &mut (*region).layout;
        let bucket = match layout.find_suitable_bucket(effective) {
            Some(bucket) => bucket,
            // the region was chosen by its root max
            None => unreachable!(),
        };

        let offset = layout.bucket_free_offset(bucket);
        layout.update_free_size(bucket, -(effective as i64), true);

        let header = region.cast::<u8>().add(offset as usize).cast::<ChunkHeader>();
        header.write(ChunkHeader { size: effective, offset });
        ChunkHeader::user_ptr(NonNull::new_unchecked(header))
    }

    /// The four cases of freeing, each preserving every bucket's
    /// allocated-prefix / free-suffix shape.
    unsafe fn free_located(&mut self, header: NonNull<ChunkHeader>, place: &ChunkPlace) {
        let size = (*header.as_ptr()).size;
        let layout = &mut (*place.region).layout;
        let bucket = place.bucket;

        match (place.is_first, place.is_last) {
            (true, true) => {
                // the bucket is now entirely empty: fold its whole span
                // into the predecessor's free tail
                let span = layout.bucket_size(bucket);
                layout.update_free_size(bucket - 1, span as i64, false);
                layout.merge_with_previous(bucket);
            }
            (true, false) => {
                // allocated chunks still follow, so the freed prefix can
                // only become free tail of the *previous* bucket
                layout.advance_bucket_start(bucket, size);
                layout.update_free_size(bucket - 1, size as i64, true);
            }
            (false, true) => {
                layout.update_free_size(bucket, size as i64, true);
            }
            (false, false) => {
                // isolate the hole: everything past the chunk becomes its
                // own bucket, the chunk itself becomes this one's tail
                let chunk_end = (*header.as_ptr()).offset + size;
                layout.split_at(bucket, chunk_end);
                layout.update_free_size(bucket, size as i64, true);
            }
        }
    }

    /// Re-subtracts a just-freed chunk from whichever free tail now shows
    /// it, restoring the accounting that existed before the free. The
    /// chunk's header bytes are still in place, so the chunk comes back
    /// whole at its old address.
    unsafe fn revert_free(&mut self, region: *mut Region, offset: u32, size: u32) {
        let layout = &mut (*region).layout;
        let bucket = layout.bucket_of_offset(offset);
        let free_offset = layout.bucket_free_offset(bucket);
        debug_assert!(free_offset <= offset);
        debug_assert!(offset + size <= layout.bucket_end(bucket));

        if offset == free_offset {
            // the chunk leads the free tail: the tail just shrinks back
            layout.update_free_size(bucket, -(size as i64), true);
        } else {
            // free space precedes the chunk (the free merged it into an
            // earlier tail): split so the chunk leads the trailing bucket
            layout.split_at(bucket, offset);
            layout.update_free_size(bucket + 1, -(size as i64), true);
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let mut clean = true;
        unsafe {
            let mut region = self.head.as_ptr();
            while !region.is_null() {
                let next = (*region).next;
                clean &= region::os_unmap(region, (*region).size);
                region = next;
            }
        }
        if !clean {
            log::warn!("could not fully release the memory arena back to the OS");
        }
    }
}
