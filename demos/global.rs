use shalloc::Shalloc;

// Every allocation this program makes, including the ones hidden inside
// `println!` and the collections below, goes through our heaps.
#[global_allocator]
static ALLOCATOR: Shalloc = Shalloc::new();

fn main() {
    let num = Box::new(10);
    println!("Boxed num {num} at {:?}", &*num as *const usize);

    let mut vec = Vec::with_capacity(*num);

    for i in 0..*num {
        vec.push(i);
    }

    println!("Vec {vec:?} at {:?}", vec.as_ptr());

    let mut threads = Vec::new();

    for thread in 0..4 {
        threads.push(std::thread::spawn(move || {
            let strings: Vec<String> = (0..100)
                .map(|i| format!("thread {thread} string {i}"))
                .collect();
            strings.len()
        }));
    }

    for thread in threads {
        assert_eq!(thread.join().unwrap(), 100);
    }

    println!("All threads allocated and released their strings");
}
