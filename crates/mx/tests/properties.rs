use bytes::Bytes;
use proptest::prelude::*;

use mx::Message;
use mx::net::fragment::{self, FragmentFrame, SAFE_FRAGMENT_SIZE};
use mx::net::{ReceiveWindow, sequence_distance, sequence_greater_than};

const HALF: i64 = (u32::MAX / 2) as i64;

proptest! {
    #[test]
    fn test_sequence_distance_matches_wide_arithmetic(current: u32, delta in -HALF..=HALF) {
        let new = current.wrapping_add(delta as u32);
        prop_assert_eq!(sequence_distance(new, current), delta);
        prop_assert_eq!(sequence_greater_than(new, current), delta > 0);
    }

    #[test]
    fn test_receive_window_survives_bitfield(history in prop::collection::vec(any::<bool>(), 32)) {
        let mut window = ReceiveWindow::new();
        for received in &history {
            window.push(*received);
        }
        let restored = ReceiveWindow::from_bitfield(window.bitfield());
        prop_assert_eq!(restored.entries().collect::<Vec<_>>(), history);
    }

    #[test]
    fn test_ack_window_covers_last_32(ack: u32, bitfield: u32, back in 0u32..64) {
        let message = Message::new(mx::PROTOCOL_ID, 0, ack, bitfield);
        let sequence = ack.wrapping_sub(back);
        prop_assert_eq!(message.has_ack(sequence), back < 32);
        let expected = back < 32 && bitfield & (1 << back) != 0;
        prop_assert_eq!(message.is_acked(sequence), expected);
    }

    #[test]
    fn test_fragments_fit_and_reassemble(data in prop::collection::vec(any::<u8>(), 0..4096), id: u8) {
        let message = Bytes::from(data);
        let fragments = fragment::split(&message, id, SAFE_FRAGMENT_SIZE);

        let mut reassembled = Vec::new();
        for encoded in &fragments {
            prop_assert!(encoded.len() <= SAFE_FRAGMENT_SIZE);
            match FragmentFrame::parse(encoded).unwrap() {
                FragmentFrame::Header { count, message_id } => {
                    prop_assert_eq!(count as usize, fragments.len() - 1);
                    prop_assert_eq!(message_id, id);
                }
                FragmentFrame::Content { chunk, .. } | FragmentFrame::Single { data: chunk, .. } => {
                    reassembled.extend_from_slice(&chunk);
                }
            }
        }
        prop_assert_eq!(Bytes::from(reassembled), message);
    }

    #[test]
    fn test_message_encoding_is_lossless(
        protocol_id: u32,
        sequence: u32,
        ack: u32,
        ack_bitfield: u32,
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..8),
    ) {
        let message = Message::new(protocol_id, sequence, ack, ack_bitfield)
            .with_payloads(payloads.into_iter().map(Bytes::from));
        let encoded = message.encode();
        prop_assert_eq!(encoded.len(), message.encoded_len());
        prop_assert_eq!(Message::decode(encoded).unwrap(), message);
    }
}
