//! Property tests for the framing codec and the AEAD nonce counter, per the
//! round-trip and monotonicity invariants called out for testing.

use std::panic::catch_unwind;

use proptest::prelude::*;
use yank_core::crypto::{self, NonceCounter};
use yank_core::protocol::{decode_plain_frame, encode_plain_frame, Message};
use yank_core::transfer::FileMetadata;

fn arb_message() -> impl Strategy<Value = Message> {
    let small_string = "[ -~]{0,128}"; // printable ASCII, small

    prop_oneof![
        small_string.prop_map(|content| Message::Text { content }),
        (any::<u32>(), any::<u32>(), small_string).prop_map(|(width, height, format)| Message::Image { width, height, format }),
        small_string.prop_map(|transfer_id| Message::FileRequest { transfer_id }),
        small_string.prop_map(|transfer_id| Message::FileComplete { transfer_id }),
        small_string.prop_map(|transfer_id| Message::TransferCancel { transfer_id }),
        (small_string, small_string, any::<u64>(), small_string).prop_map(|(name, checksum, size, mime_hint)| {
            Message::FileAnnounce {
                transfer_id: "t".into(),
                files: vec![FileMetadata { name, size, checksum, mime_hint: Some(mime_hint) }],
            }
        }),
    ]
}

proptest! {
    #[test]
    fn decode_never_panics_on_arbitrary_bytes(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let _ = catch_unwind(|| {
            let _ = decode_plain_frame(&data);
        }).expect("decode_plain_frame panicked");
    }

    #[test]
    fn message_round_trips_through_the_wire_format(msg in arb_message(), payload in proptest::collection::vec(any::<u8>(), 0..256)) {
        let encoded = encode_plain_frame(&msg, &payload).expect("encode");
        let total_len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        prop_assert_eq!(encoded.len(), 4 + total_len);
        let (decoded, decoded_payload) = decode_plain_frame(&encoded[4..]).expect("decode");
        prop_assert_eq!(decoded, msg);
        prop_assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn aead_nonces_are_distinct_across_any_number_of_sends(n in 1u32..500) {
        let mut counter = NonceCounter::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..n {
            let nonce = counter.next().expect("counter should not exhaust in this range");
            prop_assert!(seen.insert(nonce), "AEAD nonce reused within a session");
        }
    }

    #[test]
    fn seal_then_open_is_the_identity_in_order(messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), 1..20)) {
        let key = crypto::random_bytes::<32>();
        let mut send_counter = NonceCounter::new();
        let mut recv_counter = NonceCounter::new();
        for plaintext in &messages {
            let nonce = send_counter.next().unwrap();
            let sealed = crypto::seal(&key, &nonce, plaintext).unwrap();
            let recv_nonce = recv_counter.next().unwrap();
            prop_assert_eq!(recv_nonce, nonce);
            let opened = crypto::open(&key, &recv_nonce, &sealed).unwrap();
            prop_assert_eq!(&opened, plaintext);
        }
    }
}
