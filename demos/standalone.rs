use shalloc::Shalloc;

static ALLOCATOR: Shalloc = Shalloc::new();

fn main() {
    let first = ALLOCATOR.allocate(1024);
    let second = ALLOCATOR.allocate(1024);

    println!("First allocation at {first:?}");
    println!("Second allocation at {second:?}");

    unsafe {
        first.write_bytes(0xAA, 1024);
        second.write_bytes(0xBB, 1024);

        assert_eq!(*first, 0xAA);
        assert_eq!(*second.add(1023), 0xBB);

        // Growing moves the contents to a bigger block.
        let grown = ALLOCATOR.reallocate(first, 4096);
        println!("First allocation grown, now at {grown:?}");
        assert_eq!(*grown, 0xAA);

        ALLOCATOR.deallocate(grown);
        ALLOCATOR.deallocate(second);
    }

    let zeroed = ALLOCATOR.allocate_zeroed(256, 4);
    unsafe {
        for offset in 0..1024 {
            assert_eq!(*zeroed.add(offset), 0);
        }
        ALLOCATOR.deallocate(zeroed);
    }

    println!("Done, all blocks returned");
}
