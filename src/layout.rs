//! The free-size index of a region: bucket boundaries plus an implicit
//! 8-ary tree of per-bucket free-tail sizes.
//!
//! Both arrays live inside the mapped region they describe, directly after
//! the region header. The tree is stored flat, internal nodes first, one
//! leaf per bucket; each internal node holds the maximum free-tail size
//! among the buckets in its subtree, which makes best-fit bucket search a
//! single root-to-leaf descent.

use core::slice;

/// Fan-out of the implicit free-size tree.
pub(crate) const NODE_CHILD_COUNT: usize = 8;

/// Number of internal nodes needed to cover `bucket_count` leaves.
#[inline]
pub(crate) const fn parent_node_count(bucket_count: usize) -> usize {
    (bucket_count + NODE_CHILD_COUNT - 3) / (NODE_CHILD_COUNT - 1)
}

/// Total tree nodes (internal + leaves) for `bucket_count` buckets.
#[inline]
pub(crate) const fn free_size_node_count(bucket_count: usize) -> usize {
    bucket_count + parent_node_count(bucket_count)
}

#[inline]
const fn node_parent(node: usize) -> usize {
    (node - 1) / NODE_CHILD_COUNT
}

#[inline]
const fn node_children_base(node: usize) -> usize {
    node * NODE_CHILD_COUNT + 1
}

/// Bucket layout of one region.
///
/// `bucket_offsets` holds `bucket_count + 1` monotonically increasing byte
/// offsets into the region (`offsets[0] == 0`, the last equals the region
/// size). `max_free_sizes` holds `parent_count` internal tree nodes
/// followed by one leaf per bucket.
///
/// Invariant: within every bucket, allocated chunks occupy a contiguous
/// prefix and the free bytes form one contiguous tail whose size is the
/// bucket's leaf value; every internal node equals the max of its children.
#[repr(C)]
pub(crate) struct LayoutIndex {
    bucket_count: usize,
    parent_count: usize,
    bucket_offsets: *mut u32,
    max_free_sizes: *mut u32,
}

impl LayoutIndex {
    pub(crate) fn new(bucket_offsets: *mut u32, max_free_sizes: *mut u32) -> Self {
        Self { bucket_count: 0, parent_count: 0, bucket_offsets, max_free_sizes }
    }

    /// Back to the initial one-bucket, fully-free state.
    pub(crate) unsafe fn reset(&mut self, total_size: u32, internal_size: u32) {
        self.bucket_count = 1;
        self.parent_count = parent_node_count(1);
        *self.bucket_offsets = 0;
        *self.bucket_offsets.add(1) = total_size;
        *self.max_free_sizes = total_size - internal_size;
    }

    #[inline]
    pub(crate) fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    #[inline]
    fn node_count(&self) -> usize {
        self.bucket_count + self.parent_count
    }

    #[inline]
    pub(crate) unsafe fn bucket_start(&self, bucket: usize) -> u32 {
        debug_assert!(bucket < self.bucket_count);
        *self.bucket_offsets.add(bucket)
    }

    #[inline]
    pub(crate) unsafe fn bucket_end(&self, bucket: usize) -> u32 {
        debug_assert!(bucket < self.bucket_count);
        *self.bucket_offsets.add(bucket + 1)
    }

    #[inline]
    pub(crate) unsafe fn bucket_size(&self, bucket: usize) -> u32 {
        self.bucket_end(bucket) - self.bucket_start(bucket)
    }

    #[inline]
    pub(crate) unsafe fn bucket_free_size(&self, bucket: usize) -> u32 {
        debug_assert!(bucket < self.bucket_count);
        *self.max_free_sizes.add(self.parent_count + bucket)
    }

    /// Byte offset at which the bucket's free tail begins.
    #[inline]
    pub(crate) unsafe fn bucket_free_offset(&self, bucket: usize) -> u32 {
        self.bucket_end(bucket) - self.bucket_free_size(bucket)
    }

    /// Largest free-tail size anywhere in the region.
    #[inline]
    pub(crate) unsafe fn root_free_size(&self) -> u32 {
        *self.max_free_sizes
    }

    /// The bucket whose range contains the byte at `offset`.
    pub(crate) unsafe fn bucket_of_offset(&self, offset: u32) -> usize {
        let offsets = slice::from_raw_parts(self.bucket_offsets, self.bucket_count + 1);
        debug_assert!(offset < offsets[self.bucket_count]);
        offsets.partition_point(|&boundary| boundary <= offset) - 1
    }

    /// Best-fit search: descends from the root, at every internal node
    /// taking the child with the smallest max-free-size still `>= size`
    /// (ties go to the first such child). `None` if even the root's max
    /// falls short.
    pub(crate) unsafe fn find_suitable_bucket(&self, size: u32) -> Option<usize> {
        if self.root_free_size() < size {
            return None;
        }

        let node_count = self.node_count();
        let mut node = 0;
        while node < self.parent_count {
            let base = node_children_base(node);
            let end = (base + NODE_CHILD_COUNT).min(node_count);

            let mut best: Option<(usize, u32)> = None;
            for child in base..end {
                let free = *self.max_free_sizes.add(child);
                if free >= size && best.map_or(true, |(_, best_free)| free < best_free) {
                    best = Some((child, free));
                }
            }

            match best {
                Some((child, _)) => node = child,
                // a node's stored max always reappears among its children
                None => unreachable!(),
            }
        }

        Some(node - self.parent_count)
    }

    /// Adds `delta` to a bucket's free-tail size. With `propagate`, walks
    /// toward the root recomputing each ancestor from its children,
    /// stopping as soon as a recomputed value is unchanged.
    pub(crate) unsafe fn update_free_size(&mut self, bucket: usize, delta: i64, propagate: bool) {
        let leaf = self.parent_count + bucket;
        let new_free = *self.max_free_sizes.add(leaf) as i64 + delta;
        debug_assert!((0..=u32::MAX as i64).contains(&new_free));
        *self.max_free_sizes.add(leaf) = new_free as u32;

        if !propagate {
            return;
        }

        let node_count = self.node_count();
        let mut node = leaf;
        while node != 0 {
            let parent = node_parent(node);
            let base = node_children_base(parent);
            let end = (base + NODE_CHILD_COUNT).min(node_count);

            let mut max = 0;
            for child in base..end {
                max = max.max(*self.max_free_sizes.add(child));
            }

            if *self.max_free_sizes.add(parent) == max {
                break;
            }
            *self.max_free_sizes.add(parent) = max;
            node = parent;
        }
    }

    /// Inserts a boundary at region-relative `offset` inside `bucket`,
    /// turning it into two. The new trailing bucket takes over whatever
    /// portion of the free tail lies past `offset`; the leading bucket
    /// keeps the rest. Ends with a full rebuild, since the leaf segment
    /// shifts.
    pub(crate) unsafe fn split_at(&mut self, bucket: usize, offset: u32) {
        let count = self.bucket_count;
        let old_parents = self.parent_count;
        let new_parents = parent_node_count(count + 1);

        debug_assert!(bucket < count);
        debug_assert!(self.bucket_start(bucket) < offset && offset < self.bucket_end(bucket));

        let old_free = self.bucket_free_size(bucket);
        let trailing_free = old_free.min(self.bucket_end(bucket) - offset);
        let leading_free = old_free - trailing_free;

        let mut boundary = count;
        while boundary > bucket {
            *self.bucket_offsets.add(boundary + 1) = *self.bucket_offsets.add(boundary);
            boundary -= 1;
        }
        *self.bucket_offsets.add(bucket + 1) = offset;

        // shift the leaf segment, highest destination first, so growing the
        // internal-node prefix cannot clobber unread leaves
        let mut leaf = count;
        while leaf > bucket + 1 {
            *self.max_free_sizes.add(new_parents + leaf) =
                *self.max_free_sizes.add(old_parents + leaf - 1);
            leaf -= 1;
        }
        *self.max_free_sizes.add(new_parents + bucket + 1) = trailing_free;
        *self.max_free_sizes.add(new_parents + bucket) = leading_free;
        if new_parents > old_parents {
            let mut leaf = bucket;
            while leaf > 0 {
                leaf -= 1;
                *self.max_free_sizes.add(new_parents + leaf) =
                    *self.max_free_sizes.add(old_parents + leaf);
            }
        }

        self.bucket_count = count + 1;
        self.parent_count = new_parents;
        self.rebuild();
    }

    /// Removes `bucket`'s start boundary, folding its range into the
    /// predecessor. The caller must have credited the predecessor's leaf
    /// with the bucket's free contribution beforehand.
    pub(crate) unsafe fn merge_with_previous(&mut self, bucket: usize) {
        let count = self.bucket_count;
        let old_parents = self.parent_count;
        let new_parents = parent_node_count(count - 1);

        debug_assert!(0 < bucket && bucket < count);

        for boundary in bucket..count {
            *self.bucket_offsets.add(boundary) = *self.bucket_offsets.add(boundary + 1);
        }

        // lowest destination first; the internal-node prefix only shrinks
        for leaf in 0..bucket {
            *self.max_free_sizes.add(new_parents + leaf) =
                *self.max_free_sizes.add(old_parents + leaf);
        }
        for leaf in bucket..count - 1 {
            *self.max_free_sizes.add(new_parents + leaf) =
                *self.max_free_sizes.add(old_parents + leaf + 1);
        }

        self.bucket_count = count - 1;
        self.parent_count = new_parents;
        self.rebuild();
    }

    /// Advances `bucket`'s start boundary by `delta` bytes, growing the
    /// predecessor's range. Leaf values are untouched; the caller accounts
    /// for the transferred bytes.
    pub(crate) unsafe fn advance_bucket_start(&mut self, bucket: usize, delta: u32) {
        debug_assert!(0 < bucket && bucket < self.bucket_count);
        let advanced = self.bucket_start(bucket) + delta;
        debug_assert!(advanced < self.bucket_end(bucket));
        *self.bucket_offsets.add(bucket) = advanced;
    }

    /// Recomputes every internal node bottom-up. O(n); used after any edit
    /// that changes the shape of the tree.
    pub(crate) unsafe fn rebuild(&mut self) {
        let node_count = self.node_count();
        for parent in (0..self.parent_count).rev() {
            let base = node_children_base(parent);
            let end = (base + NODE_CHILD_COUNT).min(node_count);
            debug_assert!(base < node_count);

            let mut max = 0;
            for child in base..end {
                max = max.max(*self.max_free_sizes.add(child));
            }
            *self.max_free_sizes.add(parent) = max;
        }
    }

    /// Checks the tree-max invariant over every internal node.
    #[cfg(debug_assertions)]
    pub(crate) unsafe fn check_tree_maxima(&self) {
        let node_count = self.node_count();
        for parent in 0..self.parent_count {
            let base = node_children_base(parent);
            let end = (base + NODE_CHILD_COUNT).min(node_count);

            let mut max = 0;
            for child in base..end {
                max = max.max(*self.max_free_sizes.add(child));
            }
            assert!(
                *self.max_free_sizes.add(parent) == max,
                "internal node {} does not hold the max of its children",
                parent,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_BUCKETS: usize = 64;

    struct TestIndex {
        index: LayoutIndex,
        _offsets: Box<[u32]>,
        _frees: Box<[u32]>,
    }

    /// Builds an index over heap-backed arrays from explicit boundaries
    /// and per-bucket free-tail sizes.
    fn make(boundaries: &[u32], free_tails: &[u32]) -> TestIndex {
        assert!(boundaries.len() == free_tails.len() + 1);
        let bucket_count = free_tails.len();
        let parent_count = parent_node_count(bucket_count);

        let mut offsets = vec![0u32; MAX_BUCKETS + 1].into_boxed_slice();
        let mut frees = vec![0u32; free_size_node_count(MAX_BUCKETS)].into_boxed_slice();
        offsets[..boundaries.len()].copy_from_slice(boundaries);
        frees[parent_count..parent_count + bucket_count].copy_from_slice(free_tails);

        let mut index = LayoutIndex::new(offsets.as_mut_ptr(), frees.as_mut_ptr());
        index.bucket_count = bucket_count;
        index.parent_count = parent_count;
        unsafe { index.rebuild() };

        TestIndex { index, _offsets: offsets, _frees: frees }
    }

    unsafe fn leaves(index: &LayoutIndex) -> Vec<u32> {
        (0..index.bucket_count()).map(|b| index.bucket_free_size(b)).collect()
    }

    #[test]
    fn parent_counts() {
        assert_eq!(parent_node_count(1), 0);
        assert_eq!(parent_node_count(2), 1);
        assert_eq!(parent_node_count(8), 1);
        assert_eq!(parent_node_count(9), 2);
        assert_eq!(parent_node_count(15), 2);
        assert_eq!(parent_node_count(16), 3);
    }

    #[test]
    fn best_fit_prefers_tightest_bucket() {
        let t = make(
            &[0, 1000, 2000, 3000, 4000, 5000, 6000, 7000, 8000, 9000, 10000],
            &[100, 700, 300, 0, 900, 250, 300, 50, 600, 450],
        );

        unsafe {
            t.index.check_tree_maxima();
            assert_eq!(t.index.find_suitable_bucket(250), Some(5));
            // ties go to the first candidate encountered
            assert_eq!(t.index.find_suitable_bucket(300), Some(2));
            assert_eq!(t.index.find_suitable_bucket(800), Some(4));
            assert_eq!(t.index.find_suitable_bucket(901), None);
            assert_eq!(t.index.root_free_size(), 900);
        }
    }

    #[test]
    fn update_propagates_to_root() {
        let mut t = make(&[0, 1000, 2000, 3000], &[100, 200, 300]);

        unsafe {
            t.index.update_free_size(1, 500, true);
            t.index.check_tree_maxima();
            assert_eq!(t.index.root_free_size(), 700);

            t.index.update_free_size(1, -600, true);
            t.index.check_tree_maxima();
            assert_eq!(t.index.root_free_size(), 300);
            assert_eq!(leaves(&t.index), vec![100, 100, 300]);
        }
    }

    #[test]
    fn split_moves_tail_past_offset() {
        // bucket 1 covers [1000, 2000) with a 400-byte free tail at [1600, 2000)
        let mut t = make(&[0, 1000, 2000, 3000], &[0, 400, 100]);

        unsafe {
            // splitting before the tail leaves the lead bucket with nothing free
            t.index.split_at(1, 1500);
            assert_eq!(t.index.bucket_count(), 4);
            assert_eq!(t.index.bucket_start(2), 1500);
            assert_eq!(leaves(&t.index), vec![0, 0, 400, 100]);
            t.index.check_tree_maxima();
        }

        // splitting inside the tail divides it at the boundary
        let mut t = make(&[0, 1000, 2000, 3000], &[0, 400, 100]);
        unsafe {
            t.index.split_at(1, 1800);
            assert_eq!(leaves(&t.index), vec![0, 200, 200, 100]);
            t.index.check_tree_maxima();
        }
    }

    #[test]
    fn merge_folds_into_predecessor() {
        let mut t = make(&[0, 1000, 2000, 3000], &[100, 0, 300]);

        unsafe {
            // bucket 1 went entirely free: credit the predecessor, then merge
            t.index.update_free_size(0, 1000, false);
            t.index.merge_with_previous(1);

            assert_eq!(t.index.bucket_count(), 2);
            assert_eq!(t.index.bucket_end(0), 2000);
            assert_eq!(leaves(&t.index), vec![1100, 300]);
            t.index.check_tree_maxima();
        }
    }

    #[test]
    fn split_across_parent_relayout() {
        // 8 buckets needs 1 internal node; 9 needs 2, shifting the leaves
        let boundaries: Vec<u32> = (0..=8).map(|i| i * 1000).collect();
        let free_tails = [10, 20, 30, 40, 500, 60, 70, 80];
        let mut t = make(&boundaries, &free_tails);

        unsafe {
            assert_eq!(t.index.parent_count, 1);
            t.index.split_at(4, 4300);
            assert_eq!(t.index.parent_count, 2);
            assert_eq!(leaves(&t.index), vec![10, 20, 30, 40, 0, 500, 60, 70, 80]);
            assert_eq!(t.index.root_free_size(), 500);
            t.index.check_tree_maxima();

            // and back down: bucket 5 emptied out entirely, so its whole
            // 700-byte span is credited to bucket 4 before the fold
            t.index.update_free_size(4, 700, false);
            t.index.merge_with_previous(5);
            assert_eq!(t.index.parent_count, 1);
            assert_eq!(leaves(&t.index), vec![10, 20, 30, 40, 700, 60, 70, 80]);
            t.index.check_tree_maxima();
        }
    }

    #[test]
    fn bucket_lookup_by_offset() {
        let t = make(&[0, 1000, 2000, 3000], &[100, 200, 300]);

        unsafe {
            assert_eq!(t.index.bucket_of_offset(0), 0);
            assert_eq!(t.index.bucket_of_offset(999), 0);
            assert_eq!(t.index.bucket_of_offset(1000), 1);
            assert_eq!(t.index.bucket_of_offset(2999), 2);
        }
    }
}
