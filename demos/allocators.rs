//! Bump allocation ladder: the same allocation sequence under increasing
//! alignments.

use mica::{Arena, Bump};

fn main() {
    let mut arena = Arena::create(30000).expect("could not create memory arena");
    let mut bump = Bump::create(&mut arena, 4000).expect("could not create bump allocator");
    println!("new bump allocator created successfully.");
    println!("{}", arena.introspect());

    for alignment in [1usize, 2, 4, 8, 16] {
        println!("bump allocations with alignment {}", alignment);
        for i in 1..6 {
            match bump.aligned_malloc(17 * i, alignment) {
                Ok(addr) => println!("  addr: {:p}", addr),
                Err(()) => println!("  addr: FAILED"),
            }
        }
    }

    println!("free bytes remaining on the current node: {}", bump.free_size());
    unsafe { bump.destroy(&mut arena) };
}
