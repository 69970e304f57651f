//! MQTT framing round-trips under adversarial chunking.

use bytes::Bytes;

use confmesh::broker::packet::{FrameReassembler, Packet, Publish};

fn publish(topic: &str, payload: Vec<u8>) -> Packet {
    Packet::Publish(Publish {
        topic: topic.to_string(),
        payload: Bytes::from(payload),
        qos: 0,
        packet_id: None,
    })
}

#[test]
fn round_trip_across_payload_sizes() {
    // Sizes straddling every remaining-length encoding boundary.
    for size in [0usize, 1, 113, 127, 128, 4_000, 16_383, 16_384, 100_000] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let packet = publish("p2p-conf/framing-room", payload);
        let frame = packet.encode();

        let mut reassembler = FrameReassembler::new();
        reassembler.extend(&frame);
        assert_eq!(
            reassembler.next_packet().unwrap(),
            Some(packet),
            "size {size}"
        );
        assert_eq!(reassembler.next_packet().unwrap(), None);
    }
}

#[test]
fn split_writes_at_every_boundary_small_frame() {
    let packet = publish("t/x", b"signal payload".to_vec());
    let frame = packet.encode();

    for split in 1..frame.len() {
        let mut reassembler = FrameReassembler::new();
        reassembler.extend(&frame[..split]);
        let early = reassembler.next_packet().unwrap();
        assert!(early.is_none(), "complete packet from a prefix at {split}");
        reassembler.extend(&frame[split..]);
        assert_eq!(reassembler.next_packet().unwrap(), Some(packet.clone()));
    }
}

#[test]
fn byte_at_a_time_large_frame() {
    let payload: Vec<u8> = (0..40_000).map(|i| (i % 199) as u8).collect();
    let packet = publish("p2p-conf/slow-link", payload);
    let frame = packet.encode();

    let mut reassembler = FrameReassembler::new();
    for chunk in frame.chunks(7) {
        reassembler.extend(chunk);
    }
    assert_eq!(reassembler.next_packet().unwrap(), Some(packet));
}

#[test]
fn coalesced_frames_parse_in_order() {
    let first = publish("t", b"one".to_vec());
    let second = Packet::PingReq;
    let third = publish("t", b"three".to_vec());

    let mut stream = Vec::new();
    stream.extend_from_slice(&first.encode());
    stream.extend_from_slice(&second.encode());
    stream.extend_from_slice(&third.encode());

    // Delivered as two arbitrary chunks.
    let cut = stream.len() / 3 + 2;
    let mut reassembler = FrameReassembler::new();
    reassembler.extend(&stream[..cut]);
    let mut got = Vec::new();
    while let Some(packet) = reassembler.next_packet().unwrap() {
        got.push(packet);
    }
    reassembler.extend(&stream[cut..]);
    while let Some(packet) = reassembler.next_packet().unwrap() {
        got.push(packet);
    }

    assert_eq!(got, vec![first, second, third]);
}

#[test]
fn overflowing_length_prefix_resets_stream() {
    let mut reassembler = FrameReassembler::new();
    reassembler.extend(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
    assert!(reassembler.next_packet().is_err());
    assert_eq!(reassembler.buffered(), 0);

    // The reassembler keeps working after the reset.
    let packet = publish("t", b"after".to_vec());
    reassembler.extend(&packet.encode());
    assert_eq!(reassembler.next_packet().unwrap(), Some(packet));
}
