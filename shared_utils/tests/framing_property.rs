use proptest::prelude::*;
use shared_utils::proto::framing::{
    ControlDecoder, ControlEncoder, ControlFrame, FrameError, Opcode,
};

fn opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![
        Just(Opcode::NewPeer),
        Just(Opcode::DelPeer),
        Just(Opcode::NewKey),
        Just(Opcode::SwapKeys),
        Just(Opcode::DelKey),
        Just(Opcode::Packet),
        Just(Opcode::PeerDeleted),
        Just(Opcode::KeyExpired),
    ]
}

proptest! {
    #[test]
    fn split_stream_decodes_in_order(
        frames in proptest::collection::vec(
            (opcode(), any::<u32>(), proptest::collection::vec(any::<u8>(), 0..512)),
            1..8,
        ),
        chunk in 1usize..64,
    ) {
        let encoder = ControlEncoder::new();
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for (op, peer_id, payload) in frames {
            let frame = ControlFrame::new(op, peer_id, payload).unwrap();
            stream.extend_from_slice(&encoder.encode(&frame));
            expected.push(frame);
        }

        // Feed in arbitrary chunks, as a non-blocking read would deliver them.
        let mut decoder = ControlDecoder::new();
        let mut got = Vec::new();
        for piece in stream.chunks(chunk) {
            decoder.feed(piece);
            while let Some(frame) = decoder.next_frame().unwrap() {
                got.push(frame);
            }
        }

        prop_assert_eq!(got, expected);
        prop_assert_eq!(decoder.buffered_bytes(), 0);
    }

    #[test]
    fn garbage_never_panics_and_leaves_clean_state(
        garbage in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut decoder = ControlDecoder::new();
        decoder.feed(&garbage);
        loop {
            match decoder.next_frame() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                // Only the corrupt frame is dropped; keep decoding.
                Err(FrameError::ChecksumMismatch { .. }) => continue,
                Err(_) => {
                    prop_assert_eq!(decoder.buffered_bytes(), 0);
                    break;
                }
            }
        }

        // A well-formed frame after an error decodes cleanly.
        decoder.clear();
        let frame = ControlFrame::new(Opcode::Packet, 1, b"after".to_vec()).unwrap();
        decoder.feed(&ControlEncoder::new().encode(&frame));
        prop_assert_eq!(decoder.next_frame().unwrap(), Some(frame));
    }
}
