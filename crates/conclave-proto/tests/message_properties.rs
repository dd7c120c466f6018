//! Property-based tests for atom and message encoding.
//!
//! Verifies the round-trip properties for all well-formed inputs, not just
//! hand-picked examples, plus the documented size refusals.

use bytes::Bytes;
use conclave_proto::{Atom, Message, MessageHeader, ProtocolError, atom, types};
use proptest::prelude::*;

fn arbitrary_atom() -> impl Strategy<Value = Atom> {
    prop_oneof![
        any::<u32>().prop_map(Atom::U32),
        any::<u64>().prop_map(Atom::U64),
        "[a-zA-Z0-9 _.-]{0,64}".prop_map(Atom::Str),
        prop::collection::vec(any::<u8>(), 0..256).prop_map(|v| Atom::Bin(Bytes::from(v))),
    ]
}

proptest! {
    #[test]
    fn atom_round_trip(atom in arbitrary_atom()) {
        let mut wire = Vec::new();
        atom.encode(&mut wire);
        prop_assert_eq!(wire.len(), atom.wire_len());

        let decoded = Atom::decode(&mut &wire[..]).expect("should decode");
        prop_assert_eq!(decoded, atom);
    }

    #[test]
    fn message_round_trip(
        minor in 0u32..=6,
        id in any::<u64>(),
        atoms in prop::collection::vec(arbitrary_atom(), 0..16),
    ) {
        let mut msg = Message::new(types::RES_OK);
        msg.minor = minor;
        msg.id = id;
        for atom in &atoms {
            match atom {
                Atom::U32(v) => msg.put_u32(*v),
                Atom::U64(v) => msg.put_u64(*v),
                Atom::Str(s) => msg.put_str(s),
                Atom::Bin(b) => msg.put_bin(b),
            };
        }

        let mut wire = Vec::new();
        msg.encode(&mut wire).expect("should encode");
        prop_assert_eq!(wire.len(), MessageHeader::SIZE + msg.payload_len());

        let header = MessageHeader::decode(&wire).expect("header should decode");
        prop_assert_eq!(header.payload_len as usize, msg.payload_len());

        let parsed = Message::parse(header, &wire[MessageHeader::SIZE..])
            .expect("payload should decode");
        prop_assert_eq!(parsed, msg);
    }
}

#[test]
fn oversize_atom_refused_before_allocation() {
    // Declared length far above the ceiling, with no bytes behind it. A
    // decoder that allocated eagerly would try to reserve ~4 GiB here.
    let mut wire = vec![atom::TAG_BIN];
    wire.extend_from_slice(&u32::MAX.to_be_bytes());
    let err = Atom::decode(&mut &wire[..]).expect_err("must refuse");
    assert!(matches!(err, ProtocolError::OversizeBin { .. }));

    let mut wire = vec![atom::TAG_STR];
    wire.extend_from_slice(&(conclave_proto::MAX_ATOM_SIZE + 1).to_be_bytes());
    let err = Atom::decode(&mut &wire[..]).expect_err("must refuse");
    assert!(matches!(err, ProtocolError::OversizeStr { .. }));
}

#[test]
fn mixed_payload_scenario() {
    let mut msg = Message::new(types::RES_OK);
    msg.major = 1;
    msg.minor = 1;
    msg.msg_type = 42;
    msg.id = 666;
    msg.put_u32(42)
        .put_u64(5_000_000_000)
        .put_str("cstr test")
        .put_str("kstr test")
        .put_bin(b"kbuffer test");

    let mut wire = Vec::new();
    msg.encode(&mut wire).expect("should encode");

    let header = MessageHeader::decode(&wire).expect("should decode header");
    assert_eq!(header.major, 1);
    assert_eq!(header.minor, 1);
    assert_eq!(header.id, 666);

    let parsed =
        Message::parse(header, &wire[MessageHeader::SIZE..]).expect("should decode payload");
    assert_eq!(parsed.get_u32(0).unwrap(), 42);
    assert_eq!(parsed.get_u64(1).unwrap(), 5_000_000_000);
    assert_eq!(parsed.get_str(2).unwrap(), "cstr test");
    assert_eq!(parsed.get_str(3).unwrap(), "kstr test");
    assert_eq!(parsed.get_bin(4).unwrap().as_ref(), b"kbuffer test");
}
