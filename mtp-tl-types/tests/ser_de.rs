use mtp_tl_types::deserialize::Error;
use mtp_tl_types::{Blob, Cursor, Deserializable, Identifiable, RawVec, Serializable, enums, functions, types};

// ── Primitives ────────────────────────────────────────────────────────────────

#[test]
fn integers_are_little_endian() {
    assert_eq!(0x01020304i32.to_bytes(), [4, 3, 2, 1]);
    assert_eq!((-2i64).to_bytes(), [0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    assert_eq!(u64::from_bytes(&[1, 0, 0, 0, 0, 0, 0, 0]).unwrap(), 1);
}

#[test]
fn bool_uses_constructor_ids() {
    assert_eq!(true.to_bytes(), 0x997275b5u32.to_le_bytes());
    assert_eq!(bool::from_bytes(&0xbc799737u32.to_le_bytes()).unwrap(), false);
    assert_eq!(
        bool::from_bytes(&[0, 0, 0, 0]),
        Err(Error::UnexpectedConstructor { id: 0 })
    );
}

// ── Bytes ─────────────────────────────────────────────────────────────────────

#[test]
fn short_bytes_are_padded_to_four() {
    let bytes = b"abc".to_vec().to_bytes();
    assert_eq!(bytes, [3, b'a', b'b', b'c']);

    let bytes = b"abcd".to_vec().to_bytes();
    assert_eq!(bytes, [4, b'a', b'b', b'c', b'd', 0, 0, 0]);
}

#[test]
fn long_bytes_use_four_byte_header() {
    let v = vec![0x55u8; 300];
    let bytes = v.to_bytes();
    assert_eq!(&bytes[..4], &[0xfe, 0x2c, 0x01, 0x00]);
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(Vec::<u8>::from_bytes(&bytes).unwrap(), v);
}

#[test]
fn bytes_length_past_end_is_rejected() {
    // Claims 200 bytes but only carries 3.
    let err = Vec::<u8>::from_bytes(&[200, 1, 2, 3]).unwrap_err();
    assert_eq!(err, Error::BadLength { len: 200 });
}

#[test]
fn empty_input_is_eof() {
    assert_eq!(i32::from_bytes(&[1, 2]), Err(Error::UnexpectedEof));
    assert_eq!(Vec::<u8>::from_bytes(&[]), Err(Error::UnexpectedEof));
}

// ── Vectors ───────────────────────────────────────────────────────────────────

#[test]
fn boxed_vector_has_header() {
    let bytes = vec![7i64, 8].to_bytes();
    assert_eq!(&bytes[..4], &0x1cb5c415u32.to_le_bytes());
    assert_eq!(&bytes[4..8], &2i32.to_le_bytes());
    assert_eq!(Vec::<i64>::from_bytes(&bytes).unwrap(), vec![7, 8]);
}

#[test]
fn raw_vector_has_no_header() {
    let bytes = RawVec(vec![1i32, 2, 3]).to_bytes();
    assert_eq!(bytes.len(), 16);
    assert_eq!(RawVec::<i32>::from_bytes(&bytes).unwrap().0, vec![1, 2, 3]);
}

#[test]
fn vector_count_larger_than_buffer_is_rejected() {
    let mut bytes = 0x1cb5c415u32.to_le_bytes().to_vec();
    bytes.extend(1_000_000i32.to_le_bytes());
    assert!(matches!(Vec::<i64>::from_bytes(&bytes), Err(Error::BadLength { .. })));
}

// ── Schema objects ────────────────────────────────────────────────────────────

#[test]
fn req_pq_layout() {
    let nonce: [u8; 16] = core::array::from_fn(|i| i as u8);
    let bytes = functions::ReqPq { nonce }.to_bytes();
    assert_eq!(hex::encode(&bytes), "78974660000102030405060708090a0b0c0d0e0f");
}

#[test]
fn enum_dispatches_on_constructor() {
    let fail = types::DhGenFail { nonce: [1; 16], server_nonce: [2; 16], new_nonce_hash3: [3; 16] };
    let parsed = enums::SetClientDhParamsAnswer::from_bytes(&fail.to_bytes()).unwrap();
    assert_eq!(parsed, enums::SetClientDhParamsAnswer::DhGenFail(fail));

    let err = enums::SetClientDhParamsAnswer::from_bytes(&0xdeadbeefu32.to_le_bytes()).unwrap_err();
    assert_eq!(err, Error::UnexpectedConstructor { id: 0xdeadbeef });
}

#[test]
fn bad_server_salt_is_a_bad_msg_notification() {
    let salt = types::BadServerSalt {
        bad_msg_id: 0x5f00_0000_0000_0004,
        bad_msg_seqno: 3,
        error_code: 48,
        new_server_salt: -77,
    };
    match enums::BadMsgNotification::from_bytes(&salt.to_bytes()).unwrap() {
        enums::BadMsgNotification::BadServerSalt(s) => assert_eq!(s.new_server_salt, -77),
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn rpc_result_keeps_result_opaque() {
    let inner = types::RpcError { error_code: 420, error_message: "FLOOD_WAIT_31".into() }.to_bytes();
    let res = types::RpcResult { req_msg_id: 44, result: Blob(inner.clone()) };
    let parsed = types::RpcResult::from_bytes(&res.to_bytes()).unwrap();
    assert_eq!(parsed.req_msg_id, 44);
    assert_eq!(parsed.result.0, inner);
}

#[test]
fn container_roundtrip_preserves_order() {
    let messages = vec![
        types::Message { msg_id: 4, seqno: 1, body: vec![1, 2, 3, 4] },
        types::Message { msg_id: 8, seqno: 3, body: functions::Ping { ping_id: 9 }.to_bytes() },
    ];
    let container = types::MsgContainer { messages: RawVec(messages.clone()) };
    let bytes = container.to_bytes();
    assert_eq!(
        bytes.len(),
        types::MsgContainer::HEADER_LEN + messages.iter().map(types::Message::wire_len).sum::<usize>()
    );
    let parsed = types::MsgContainer::from_bytes(&bytes).unwrap();
    assert_eq!(parsed.messages.0, messages);
}

#[test]
fn container_entry_with_unaligned_length_is_rejected() {
    let mut bytes = types::MsgContainer::CONSTRUCTOR_ID.to_le_bytes().to_vec();
    bytes.extend(1i32.to_le_bytes());
    bytes.extend(4i64.to_le_bytes());
    bytes.extend(1i32.to_le_bytes());
    bytes.extend(3i32.to_le_bytes());
    bytes.extend([0u8; 4]);
    assert_eq!(types::MsgContainer::from_bytes(&bytes), Err(Error::BadLength { len: 3 }));
}

#[test]
fn cursor_peek_does_not_advance() {
    let bytes = types::Pong { msg_id: 1, ping_id: 2 }.to_bytes();
    let mut cur = Cursor::from_slice(&bytes);
    assert_eq!(cur.peek_u32().unwrap(), types::Pong::CONSTRUCTOR_ID);
    assert_eq!(cur.pos(), 0);
    let pong = types::Pong::deserialize(&mut cur).unwrap();
    assert_eq!(pong.ping_id, 2);
    assert_eq!(cur.remaining(), 0);
}
