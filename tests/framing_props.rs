//! Property tests for the framing pipeline.
//!
//! For any message sequence and any segment/window geometry, the bytes
//! drained from the transmit buffer must parse back into exactly the same
//! payload sequence, in order, regardless of how the wire bytes are sliced
//! on the receive side.

use std::sync::Arc;

use proptest::prelude::*;
use wirelink::{
    buffer::{RxBuffer, SegmentPool, TxBuffer},
    frame::MessageKind,
};

fn transmit(segment_size: usize, payloads: &[Vec<u8>]) -> Vec<u8> {
    let pool = Arc::new(SegmentPool::new(segment_size, 16));
    let buffer = TxBuffer::new(Arc::clone(&pool));

    for (index, payload) in payloads.iter().enumerate() {
        let mut writer = buffer.start_message(MessageKind::Message).expect("start");
        if index % 2 == 0 {
            writer.write(payload);
        } else {
            // Exercise the span-allocation path, including the XL branch.
            let span = writer.allocate(payload.len());
            span.copy_from_slice(payload);
            writer.advance(payload.len());
        }
        writer.end_message();
    }
    buffer.close();

    let mut wire = Vec::new();
    while let Some(segment) = futures::executor::block_on(buffer.dequeue()) {
        wire.extend_from_slice(segment.as_slice());
        pool.release(segment);
    }
    wire
}

fn receive(rx_window: usize, wire: &[u8]) -> Vec<Vec<u8>> {
    let mut rx = RxBuffer::new(rx_window);
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < wire.len() {
        let window = rx.rx_window();
        let take = window.len().min(wire.len() - offset);
        window[..take].copy_from_slice(&wire[offset..offset + take]);
        rx.commit_rx(take);
        offset += take;
        while let Some((kind, payload)) = rx.next_message().expect("parse") {
            assert_eq!(kind, MessageKind::Message);
            out.push(payload.to_vec());
        }
    }
    assert_eq!(rx.buffered(), 0, "no trailing bytes after the last frame");
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn drained_segments_concatenate_to_the_message_sequence(
        segment_size in 64usize..1024,
        rx_window in 16usize..512,
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..3000), 0..24),
    ) {
        let wire = transmit(segment_size, &payloads);
        let received = receive(rx_window, &wire);
        prop_assert_eq!(received, payloads);
    }

    #[test]
    fn single_message_survives_any_geometry(
        segment_size in 64usize..256,
        payload in prop::collection::vec(any::<u8>(), 0..10_000),
    ) {
        let wire = transmit(segment_size, std::slice::from_ref(&payload));
        let received = receive(64, &wire);
        prop_assert_eq!(received, vec![payload]);
    }
}
