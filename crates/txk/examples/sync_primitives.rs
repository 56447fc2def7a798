//! Tour of the synchronization objects: priority inheritance on a mutex,
//! event flags and the two memory pools.

use txk::{
    Blocking, EventOption, KernelBuilder, SetOption, ThreadAction, ThreadConfig, Timeout,
};

fn demo_priority_inheritance() {
    println!("1. Mutex with priority inheritance");

    let kernel = KernelBuilder::new().build().expect("valid configuration");
    let mutex = kernel.mutex_create("shared", true).expect("mutex");
    let release = kernel.semaphore_create("release", 0).expect("semaphore");

    let owner = kernel
        .thread_create(ThreadConfig::new("owner", 20, move |ctx| {
            let kernel = ctx.kernel();
            if ctx.take_wake().is_some() {
                let _ = kernel.mutex_put(mutex);
                return ThreadAction::Complete;
            }
            let _ = kernel.mutex_get(mutex, Timeout::NoWait);
            match kernel.semaphore_get(release, Timeout::Forever) {
                Ok(Blocking::Suspended) => ThreadAction::Continue,
                _ => ThreadAction::Complete,
            }
        }))
        .expect("owner");
    kernel.start();
    kernel.run(10);

    kernel
        .thread_create(ThreadConfig::new("urgent", 3, move |ctx| {
            if ctx.take_wake().is_some() {
                println!("   urgent thread acquired the mutex");
                return ThreadAction::Complete;
            }
            match ctx.kernel().mutex_get(mutex, Timeout::Forever) {
                Ok(Blocking::Suspended) => ThreadAction::Continue,
                _ => ThreadAction::Complete,
            }
        }))
        .expect("urgent");
    kernel.run(10);

    let info = kernel.thread_info(owner).expect("owner info");
    println!(
        "   owner runs at {} (user priority {}) while urgent waits",
        info.priority, info.user_priority
    );

    kernel.semaphore_put(release).expect("put");
    kernel.run(10);
    let info = kernel.thread_info(owner).expect("owner info");
    println!("   after release the owner is back at {}\n", info.priority);
}

fn demo_event_flags() {
    println!("2. Event flags");

    let kernel = KernelBuilder::new().build().expect("valid configuration");
    let group = kernel.event_flags_create("events").expect("event flags");

    kernel
        .event_flags_set(group, 0b0101, SetOption::Or)
        .expect("set");
    let got = kernel
        .event_flags_get(group, 0b0001, EventOption::OrClear, Timeout::NoWait)
        .expect("get");
    println!("   OR-clear get returned {got:?}");
    let info = kernel.event_flags_info(group).expect("info");
    println!("   flags left: {:#06b}", info.current);

    let missing = kernel.event_flags_get(group, 0b0011, EventOption::And, Timeout::NoWait);
    println!("   AND get for 0b0011: {missing:?}\n");
}

fn demo_pools() {
    println!("3. Memory pools");

    let kernel = KernelBuilder::new().build().expect("valid configuration");
    let blocks = kernel.block_pool_create("blocks", 32, 4).expect("block pool");
    let block = kernel
        .block_allocate(blocks, Timeout::NoWait)
        .expect("allocate")
        .complete()
        .expect("block");
    kernel
        .with_block(&block, |bytes| bytes.fill(0xAB))
        .expect("block access");
    println!("   block pool: {:?}", kernel.block_pool_stats(blocks).expect("stats"));
    kernel.block_release(block).expect("release");

    let bytes = kernel.byte_pool_create("bytes", 512).expect("byte pool");
    let first = kernel
        .byte_allocate(bytes, 100, Timeout::NoWait)
        .expect("allocate")
        .complete()
        .expect("memory");
    let second = kernel
        .byte_allocate(bytes, 60, Timeout::NoWait)
        .expect("allocate")
        .complete()
        .expect("memory");
    println!("   byte pool in use: {:?}", kernel.byte_pool_stats(bytes).expect("stats"));
    kernel.byte_release(first).expect("release");
    kernel.byte_release(second).expect("release");
    println!("   byte pool released: {:?}\n", kernel.byte_pool_stats(bytes).expect("stats"));
}

fn main() {
    println!("=== txk synchronization primitives ===\n");
    demo_priority_inheritance();
    demo_event_flags();
    demo_pools();
}
