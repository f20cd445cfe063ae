//! S3 and invariants 2/3: packet pool round-trip and buffer header
//! invariants. Requires hugepages to be mounted at /mnt/huge.

use ixy_rs::memory::Pool;

#[test]
fn s3_pool_of_64_round_trips_full_and_preserves_pool_id() {
    let pool = Pool::allocate(64, 2048).unwrap();

    let mut taken = Vec::new();
    while let Some(buf) = pool.get() {
        assert_eq!(buf.pool_id(), pool.id());
        assert_eq!(buf.data_addr(), buf.phys_addr() + 64);
        taken.push(buf);
    }
    assert_eq!(taken.len(), 64);
    assert!(pool.get().is_none());

    while let Some(buf) = taken.pop() {
        pool.free(buf);
    }

    let refilled = pool.get_many(64);
    assert_eq!(refilled.len(), 64);
    for buf in &refilled {
        assert_eq!(buf.pool_id(), pool.id());
    }
}

#[test]
fn invariant3_size_field_mutates_independently_of_pool_id() {
    let pool = Pool::allocate(4, 2048).unwrap();
    let mut buf = pool.get().unwrap();
    let pool_id = buf.pool_id();
    let phys = buf.phys_addr();

    buf.set_size(128);
    assert_eq!(buf.size(), 128);
    assert_eq!(buf.pool_id(), pool_id);
    assert_eq!(buf.phys_addr(), phys);
    assert_eq!(buf.data_addr(), phys + 64);
}
