//! Property-based tests for the byte-accounted session queues.

use conclave_proto::{Message, types};
use conclave_server::session::MessageQueue;
use proptest::prelude::*;

fn msg_of(id: u64, payload: usize) -> Message {
    let mut msg = Message::new(types::RES_OK);
    msg.id = id;
    msg.put_bin(&vec![0u8; payload]);
    msg
}

proptest! {
    /// Pushing then draining arbitrary messages preserves order and
    /// returns the byte account to zero with the quench flag clear.
    #[test]
    fn drain_restores_empty_state(sizes in prop::collection::vec(0usize..4096, 1..64)) {
        let queue = MessageQueue::new(8 * 1024);

        for (i, size) in sizes.iter().enumerate() {
            queue.push(msg_of(i as u64, *size));
        }

        for i in 0..sizes.len() as u64 {
            let msg = queue.try_pop().expect("message must be queued");
            prop_assert_eq!(msg.id, i, "FIFO order");
        }

        prop_assert_eq!(queue.bytes(), 0);
        prop_assert!(queue.is_empty());
        prop_assert!(!queue.is_quenched());
    }

    /// The quench flag is exactly "bytes above threshold" on the upward
    /// edge and clears only once the count drops back under it.
    #[test]
    fn quench_tracks_threshold(ops in prop::collection::vec(any::<bool>(), 1..128)) {
        let threshold = 4 * 1024;
        let queue = MessageQueue::new(threshold);
        let mut next_id = 0u64;

        for push in ops {
            if push {
                queue.push(msg_of(next_id, 1024));
                next_id += 1;
            } else {
                let _ = queue.try_pop();
            }

            if queue.bytes() > threshold {
                prop_assert!(queue.is_quenched());
            } else if !queue.is_quenched() {
                prop_assert!(queue.bytes() <= threshold);
            }
        }
    }
}
