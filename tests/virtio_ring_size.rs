//! S4 and invariant 5: virtqueue byte-size formula.

use ixy_rs::virtio::queue;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

#[test]
fn s4_256_entry_ring_matches_literal_byte_counts() {
    assert_eq!(queue::desc_table_size(256), 4096);
    assert_eq!(queue::avail_size(256), 516);
    assert_eq!(queue::used_size(256), 2052);
    assert_eq!(queue::byte_size(256), 10244);
}

#[test]
fn invariant5_byte_size_matches_formula_for_every_supported_n() {
    for n in [2usize, 4, 8, 16, 32, 64, 128, 256, 1024, 4096] {
        let expected =
            align_up(queue::desc_table_size(n) + queue::avail_size(n), 4096) + queue::used_size(n);
        assert_eq!(queue::byte_size(n), expected, "n={n}");
    }
}
