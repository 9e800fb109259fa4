// Bit-exactness tests for the cross-process header layout.
// Run with: cargo test --test layout

use dmxp_bufferhub::Hub::Buffer::layout::{
    find_lowest_clear_bit, BufferState, MetadataHeader, CONSUMER_STATE_MASK, MAX_CONSUMERS,
    METADATA_HEADER_SIZE, PRODUCER_STATE_BIT,
};
use memoffset::offset_of;

#[test]
fn header_field_offsets_are_contractual() {
    // [queue_index: u64][buffer_state: atomic u64][fence_state: atomic u64]
    assert_eq!(offset_of!(MetadataHeader, queue_index), 0);
    assert_eq!(offset_of!(MetadataHeader, buffer_state), 8);
    assert_eq!(offset_of!(MetadataHeader, fence_state), 16);
    assert_eq!(METADATA_HEADER_SIZE, 24);
}

#[test]
fn producer_bit_is_bit_63() {
    assert_eq!(PRODUCER_STATE_BIT, 1u64 << 63);
    assert_eq!(CONSUMER_STATE_MASK, !(1u64 << 63));
    assert_eq!(MAX_CONSUMERS, 63);
}

#[test]
fn state_classification() {
    assert_eq!(
        BufferState::from_bits(PRODUCER_STATE_BIT, 0),
        BufferState::Gained
    );
    assert_eq!(BufferState::from_bits(0, 0), BufferState::Released);
    assert_eq!(BufferState::from_bits(0b0110, 0), BufferState::Posted);
    assert_eq!(
        BufferState::from_bits(0b0110, 0b0010),
        BufferState::PartiallyAcquired
    );
}

#[test]
fn lowest_clear_bit_allocation() {
    assert_eq!(find_lowest_clear_bit(PRODUCER_STATE_BIT), Some(1));
    assert_eq!(find_lowest_clear_bit(PRODUCER_STATE_BIT | 0b1), Some(0b10));
    assert_eq!(find_lowest_clear_bit(PRODUCER_STATE_BIT | 0b101), Some(0b10));

    // All 63 consumer bits taken
    assert_eq!(find_lowest_clear_bit(u64::MAX), None);
    assert_eq!(find_lowest_clear_bit(CONSUMER_STATE_MASK), None);

    // Orphaned bits count as used
    let used = PRODUCER_STATE_BIT | 0b1 | 0b100;
    assert_eq!(find_lowest_clear_bit(used), Some(0b10));
}
