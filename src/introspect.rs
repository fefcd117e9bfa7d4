//! Read-only reporting of an arena's memory layout.

use core::fmt;

use crate::chunk::ChunkHeader;
use crate::Arena;

/// Memory usage and layout report, produced by
/// [`Arena::introspect`](crate::Arena::introspect).
///
/// Walks every region, bucket, and chunk when formatted; no allocation
/// path depends on it.
pub struct Introspect<'a> {
    arena: &'a Arena,
}

impl<'a> Introspect<'a> {
    pub(crate) fn new(arena: &'a Arena) -> Self {
        Self { arena }
    }
}

impl fmt::Display for Introspect<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[MEMORY INTROSPECT]:")?;

        unsafe {
            let mut region_count = 0usize;
            let mut total_size = 0usize;
            let mut user_size = 0usize;
            let mut region = self.arena.head_ptr();
            while !region.is_null() {
                region_count += 1;
                total_size += (*region).size;
                user_size += (*region).size - (*region).internal_size;
                region = (*region).next;
            }

            writeln!(
                f,
                "  |   Memory Arena:   < region count: {} | user size: {:.2} KiB total size: {:.2} KiB >",
                region_count,
                user_size as f32 / 1024.0,
                total_size as f32 / 1024.0,
            )?;
            writeln!(f, "  |   Regions:")?;

            let mut region = self.arena.head_ptr();
            while !region.is_null() {
                fmt_region(f, region)?;
                region = (*region).next;
            }
        }

        Ok(())
    }
}

unsafe fn fmt_region(f: &mut fmt::Formatter<'_>, region: *mut crate::region::Region) -> fmt::Result {
    let layout = &(*region).layout;
    let user_size = (*region).size - (*region).internal_size;

    let mut size_used = 0usize;
    for bucket in 0..layout.bucket_count() {
        size_used += (layout.bucket_size(bucket) - layout.bucket_free_size(bucket)) as usize;
    }
    size_used -= (*region).internal_size;

    writeln!(
        f,
        "  |       - Region at {:p}:   < capacity: {:.2} KiB | size used: {:.2} KiB ({:.1}%) >",
        region,
        user_size as f32 / 1024.0,
        size_used as f32 / 1024.0,
        100.0 * size_used as f32 / user_size as f32,
    )?;

    writeln!(
        f,
        "  |            - Chunk at 0x00000000:   < state: INTERNAL | size: {} bytes >",
        (*region).internal_size,
    )?;

    let mut offset = (*region).internal_size as u32;
    for bucket in 0..layout.bucket_count() {
        while offset < layout.bucket_free_offset(bucket) {
            let header = region.cast::<u8>().add(offset as usize).cast::<ChunkHeader>();
            writeln!(
                f,
                "  |            - Chunk at {:#010x}:   < state: ALLOCATED | size: {} bytes >",
                (*header).offset,
                (*header).size,
            )?;
            offset += (*header).size;
        }

        let free_size = layout.bucket_free_size(bucket);
        if free_size > 0 {
            writeln!(
                f,
                "  |            - Chunk at {:#010x}:   < state: FREE | size: {} bytes >   (bucket end)",
                offset,
                free_size,
            )?;
        }
        offset = layout.bucket_end(bucket);
    }
    writeln!(f, "  |")
}
