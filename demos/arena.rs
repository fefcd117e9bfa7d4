//! Creates an arena, performs a few chunk operations, and prints the
//! resulting memory layout.

use mica::Arena;

fn main() {
    let mut arena = match Arena::create(20000) {
        Ok(arena) => arena,
        Err(err) => {
            eprintln!("could not create memory arena: {}", err);
            std::process::exit(1);
        }
    };
    println!("new memory arena created successfully.");

    let a = arena.malloc(1200).expect("allocation failed");
    let b = arena.malloc(3000).expect("allocation failed");
    let c = arena.malloc(600).expect("allocation failed");

    unsafe {
        arena.free(b);
        let a = arena.realloc(a, 2400).expect("reallocation failed");
        println!("chunk at {:p} holds {} usable bytes", a, arena.chunk_size(a));
        let _ = c;
    }

    println!("{}", arena.introspect());
}
