//! A linear allocator layered on arena chunks.
//!
//! Each chain node is one arena chunk whose payload starts with the node
//! header; allocation only ever moves a node's watermark forward. The
//! handle node doubles as the first chain link and carries the cursor,
//! which never rewinds to an earlier node except on reset.

use core::mem;
use core::ptr::{self, NonNull};

use crate::utils::quantize_up;
use crate::{Arena, ArenaError};

const NODE_HEADER_SIZE: usize = mem::size_of::<BumpNode>();

#[repr(C)]
struct BumpNode {
    /// Granted size of the backing chunk.
    capacity: u32,
    /// Watermark, starting past this header.
    size_used: u32,
    /// Cursor over the chain; meaningful in the handle node only.
    current: *mut BumpNode,
    next: *mut BumpNode,
}

impl BumpNode {
    #[inline]
    unsafe fn end_addr(node: *mut BumpNode) -> usize {
        node as usize + (*node).capacity as usize
    }

    #[inline]
    unsafe fn free_ptr(node: *mut BumpNode) -> *mut u8 {
        node.cast::<u8>().add((*node).size_used as usize)
    }
}

/// A bump allocator drawing its storage from a memory arena.
///
/// Individual allocations cannot be freed; the whole allocator is either
/// [`reset`](Bump::reset) or [`destroy`](Bump::destroy)ed. Pointers it
/// returns alias arena-owned memory and die with it.
pub struct Bump {
    head: NonNull<BumpNode>,
}

impl Bump {
    /// Creates a bump allocator with a capacity of at least `size` bytes,
    /// backed by a single chunk of `arena`.
    pub fn create(arena: &mut Arena, size: u32) -> Result<Bump, ArenaError> {
        let node = Self::create_node(arena, size)?;
        unsafe {
            (*node).current = node;
            Ok(Bump { head: NonNull::new_unchecked(node) })
        }
    }

    /// Expands the allocator by at least `add_size` bytes, appended as a
    /// new chain node.
    pub fn expand(&mut self, arena: &mut Arena, add_size: u32) -> Result<(), ArenaError> {
        let node = Self::create_node(arena, add_size)?;
        unsafe {
            let mut tail = self.head.as_ptr();
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            (*tail).next = node;
        }
        Ok(())
    }

    fn create_node(arena: &mut Arena, size: u32) -> Result<*mut BumpNode, ArenaError> {
        let total = (size as usize + NODE_HEADER_SIZE)
            .try_into()
            .map_err(|_| ArenaError::InvalidArgument)?;
        let addr = match arena.malloc(total) {
            Ok(addr) => addr,
            Err(()) => {
                log::trace!("cannot allocate enough arena memory for the bump allocator");
                return Err(ArenaError::NoMemory);
            }
        };

        unsafe {
            let capacity = arena.chunk_size(addr);
            let node = addr.cast::<BumpNode>().as_ptr();
            node.write(BumpNode {
                capacity,
                size_used: NODE_HEADER_SIZE as u32,
                current: ptr::null_mut(),
                next: ptr::null_mut(),
            });
            Ok(node)
        }
    }

    /// Allocates `size` bytes aligned to a multiple of `alignment`, which
    /// must be a power of two.
    ///
    /// Scans the chain forward from the cursor node; earlier nodes are
    /// never revisited, even if they still have room.
    pub fn aligned_malloc(&mut self, size: u32, alignment: usize) -> Result<NonNull<u8>, ()> {
        assert!(alignment.is_power_of_two(), "bump allocation alignment must be a power of two");

        unsafe {
            let mut node = (*self.head.as_ptr()).current;
            while !node.is_null() {
                let free_ptr = BumpNode::free_ptr(node);
                let aligned = quantize_up(free_ptr as usize, alignment);
                if aligned + size as usize <= BumpNode::end_addr(node) {
                    let padding = aligned - free_ptr as usize;
                    (*node).size_used += padding as u32 + size;
                    (*self.head.as_ptr()).current = node;
                    return Ok(NonNull::new_unchecked(free_ptr.add(padding)));
                }
                node = (*node).next;
            }
        }
        Err(())
    }

    /// Allocates `size` bytes aligned to a multiple of the pointer size.
    pub fn malloc(&mut self, size: u32) -> Result<NonNull<u8>, ()> {
        self.aligned_malloc(size, mem::size_of::<*mut u8>())
    }

    /// Contiguous bytes still available on the current node.
    pub fn free_size(&self) -> u32 {
        unsafe {
            let current = (*self.head.as_ptr()).current;
            (*current).capacity - (*current).size_used
        }
    }

    /// Rewinds every node's watermark, as if nothing was ever allocated.
    pub fn reset(&mut self) {
        unsafe {
            let head = self.head.as_ptr();
            let mut node = head;
            while !node.is_null() {
                (*node).size_used = NODE_HEADER_SIZE as u32;
                node = (*node).next;
            }
            (*head).current = head;
        }
    }

    /// Releases every node's chunk back to the arena.
    ///
    /// # Safety
    /// `arena` must be the arena this allocator was created from, with all
    /// node chunks still live (in particular, not wiped by a reset or
    /// destroy of the arena in between).
    pub unsafe fn destroy(self, arena: &mut Arena) {
        let mut node = (*self.head.as_ptr()).next;
        arena.free(self.head.cast());
        while !node.is_null() {
            let next = (*node).next;
            arena.free(NonNull::new_unchecked(node).cast());
            node = next;
        }
    }
}
