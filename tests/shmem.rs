//! The shared region and slab pool wired together over a real
//! temp-file-backed mapping (spec §3 "Shared region layout", §4.8),
//! complementing `src/shmem/slab.rs`'s in-memory unit tests.

use std::sync::atomic::Ordering;

use reactor_engine::shmem::{SharedRegion, SlabPool};

#[test]
fn engine_data_counters_persist_across_two_mappings_of_the_same_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.shm");

    let region = SharedRegion::create(&path, 1 << 16).unwrap();
    region.engine_data().open_handles.fetch_add(3, Ordering::SeqCst);
    region.engine_data().bytes_in.fetch_add(1500, Ordering::SeqCst);
    drop(region);

    let reopened = SharedRegion::open(&path).unwrap();
    assert_eq!(reopened.engine_data().open_handles.load(Ordering::SeqCst), 3);
    assert_eq!(reopened.engine_data().bytes_in.load(Ordering::SeqCst), 1500);
}

#[test]
fn slab_pool_allocates_from_the_region_backing_a_real_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slab.shm");
    let mut region = SharedRegion::create(&path, 1 << 20).unwrap();

    let (engine, bytes) = region.split_mut();
    let mut pool = SlabPool::initialize(bytes);

    let a = pool.alloc(engine, 64).expect("allocation should succeed");
    let b = pool.alloc(engine, 64).expect("allocation should succeed");
    assert_ne!(a, b);

    let class = (0..pool.num_classes())
        .find(|&c| pool.class_size_of(c) >= 64)
        .unwrap();
    let (_, used_before_free, _, _) = pool.stats(class);
    assert_eq!(used_before_free, 2);

    pool.free(engine, a).unwrap();
    pool.free(engine, b).unwrap();

    let (_, used_after_free, _, _) = pool.stats(class);
    assert_eq!(used_after_free, 0);
}
