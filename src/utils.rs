//! Small helpers and the debug-build invariant scan.

use crate::Arena;

/// Rounds `x` up to the next multiple of `q`. `q` must be a power of two.
#[inline]
pub(crate) const fn quantize_up(x: usize, q: usize) -> usize {
    debug_assert!(q.is_power_of_two());
    (x + q - 1) & !(q - 1)
}

#[cfg(not(debug_assertions))]
pub(crate) fn scan_for_errors(_: &Arena) {}

/// Debugging function checking every region of the arena: boundaries
/// monotone, free tails within their buckets, the tree-max invariant, and
/// a full chunk walk proving each bucket is an allocated prefix followed
/// by exactly its recorded free tail.
#[cfg(debug_assertions)]
pub(crate) fn scan_for_errors(arena: &Arena) {
    use crate::chunk::ChunkHeader;
    use crate::ARENA_PAGE_SIZE;

    unsafe {
        let mut region = arena.head_ptr();
        while !region.is_null() {
            let layout = &(*region).layout;
            let bucket_count = layout.bucket_count();
            let region_size = (*region).size as u32;

            assert!(layout.bucket_start(0) == 0);
            assert!(layout.bucket_end(bucket_count - 1) == region_size);
            layout.check_tree_maxima();

            for bucket in 0..bucket_count {
                assert!(layout.bucket_start(bucket) < layout.bucket_end(bucket));
                assert!(layout.bucket_free_size(bucket) <= layout.bucket_size(bucket));
            }

            let mut offset = (*region).internal_size as u32;
            for bucket in 0..bucket_count {
                let free_offset = layout.bucket_free_offset(bucket);
                while offset < free_offset {
                    let header = region.cast::<u8>().add(offset as usize).cast::<ChunkHeader>();
                    assert!((*header).size > 0);
                    assert!((*header).size % ARENA_PAGE_SIZE as u32 == 0);
                    assert!((*header).offset == offset);
                    offset += (*header).size;
                }
                assert!(offset == free_offset, "chunk walk overran the free tail");
                offset = layout.bucket_end(bucket);
            }

            region = (*region).next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantization() {
        assert_eq!(quantize_up(0, 256), 0);
        assert_eq!(quantize_up(1, 256), 256);
        assert_eq!(quantize_up(256, 256), 256);
        assert_eq!(quantize_up(257, 256), 512);
        assert_eq!(quantize_up(17, 1), 17);
        assert_eq!(quantize_up(17, 16), 32);
    }
}
