//! Integration tests for the spawn message codec

use appspawn_msg::codec::{self, DecodeError, set_msg_len};
use appspawn_msg::tlv::ext;
use appspawn_msg::{
    AppFlag, DacInfo, DomainInfo, FlagBitmap, MsgType, SpawnMessage, TlvRecord, decode, encode,
};

fn full_message() -> SpawnMessage {
    let mut msg = SpawnMessage::new(MsgType::Spawn, "com.example.app");
    msg.msg_id = 17;
    msg.uid = 20010001;
    msg.gid = 20010001;
    msg.token = 0xdead_beef_0000_0001;
    msg.push(TlvRecord::BundleInfo {
        bundle_index: 1,
        bundle_name: "com.example.app".into(),
    });
    msg.set_flag(AppFlag::Debuggable);
    msg.set_flag(AppFlag::IsolatedSandbox);
    msg.push(TlvRecord::DacInfo(DacInfo {
        gids: vec![1000, 3003, 3009],
        user_name: "u10_a1".into(),
    }));
    msg.push(TlvRecord::DomainInfo(DomainInfo {
        hap_flags: 0x4,
        apl: "system_basic".into(),
    }));
    msg.push(TlvRecord::OwnerInfo("owner-1".into()));
    msg.set_permission_code(FlagBitmap::from_u64(0b10));
    msg.push(TlvRecord::InternetInfo {
        set_allow: true,
        allow: true,
    });
    msg.push(TlvRecord::FdList(vec![3, 7]));
    msg.push(TlvRecord::Extension {
        name: ext::APP_ENV.into(),
        value: br#"{"LANG":"C"}"#.to_vec(),
    });
    msg.push(TlvRecord::Extension {
        name: ext::EXEC_ARGS.into(),
        value: b"/bin/true\0".to_vec(),
    });
    msg
}

/// Test that every field survives encode then decode
#[test]
fn test_round_trip_preserves_all_fields() {
    let msg = full_message();
    let buf = encode(&msg);
    let (decoded, consumed) = decode(&buf).unwrap();

    assert_eq!(consumed, buf.len());
    assert_eq!(decoded, msg);
    assert!(decoded.is_flag_set(AppFlag::Debuggable));
    assert_eq!(decoded.fds(), &[3, 7]);
}

/// Test that record order is preserved, including repeated extensions
#[test]
fn test_round_trip_preserves_record_order() {
    let msg = full_message();
    let (decoded, _) = decode(&encode(&msg)).unwrap();
    let tags: Vec<u32> = decoded.records.iter().map(|r| r.tag()).collect();
    let expected: Vec<u32> = msg.records.iter().map(|r| r.tag()).collect();
    assert_eq!(tags, expected);
}

/// Test that a message without records round trips
#[test]
fn test_round_trip_minimal_messages() {
    for msg in [
        SpawnMessage::new(MsgType::Dump, ""),
        SpawnMessage::termination(99),
        SpawnMessage::new(MsgType::SpawnNative, "native"),
    ] {
        let (decoded, _) = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }
}

/// Test that cutting the buffer anywhere before its end reports truncation
#[test]
fn test_truncation_at_every_offset() {
    let buf = encode(&full_message());
    for cut in 0..buf.len() {
        match decode(&buf[..cut]) {
            Err(DecodeError::Truncated { .. }) => {}
            other => panic!("cut at {} gave {:?}", cut, other),
        }
    }
}

/// Test that a record whose declared length runs past msg_len is truncated
#[test]
fn test_record_length_past_end_is_truncated() {
    let mut buf = encode(&SpawnMessage::new(MsgType::Spawn, "app"));
    buf.extend_from_slice(&appspawn_msg::tlv::tag::OWNER_INFO.to_le_bytes());
    buf.extend_from_slice(&100u32.to_le_bytes());
    buf.extend_from_slice(&[0u8; 10]);
    set_msg_len(&mut buf);
    assert!(matches!(decode(&buf), Err(DecodeError::Truncated { .. })));
}

/// Test that an unknown record does not change the known fields
#[test]
fn test_unknown_record_is_skipped() {
    let msg = full_message();
    let mut buf = encode(&msg);
    codec::push_raw_record(&mut buf, 0x7777, b"from a newer sender");
    set_msg_len(&mut buf);

    let (decoded, consumed) = decode(&buf).unwrap();
    assert_eq!(consumed, buf.len());
    assert_eq!(decoded, msg);
}

/// Test that an unknown record in the middle is skipped too
#[test]
fn test_unknown_record_in_the_middle() {
    let msg = full_message();
    let mut buf = encode(&SpawnMessage {
        records: Vec::new(),
        ..msg.clone()
    });
    let (first, rest) = msg.records.split_at(3);
    for record in first {
        codec::push_raw_record(&mut buf, record.tag(), &codec::encode_record(record));
    }
    codec::push_raw_record(&mut buf, 500, &[1, 2, 3, 4]);
    for record in rest {
        codec::push_raw_record(&mut buf, record.tag(), &codec::encode_record(record));
    }
    set_msg_len(&mut buf);

    let (decoded, _) = decode(&buf).unwrap();
    assert_eq!(decoded, msg);
}

/// Test that a process name over the limit is rejected
#[test]
fn test_long_process_name_is_oversized() {
    let name = "x".repeat(codec::MAX_NAME_LEN + 1);
    let buf = encode(&SpawnMessage::new(MsgType::Spawn, name));
    assert!(matches!(
        decode(&buf),
        Err(DecodeError::Oversized {
            what: "process name",
            ..
        })
    ));
}

/// Test that a declared length shorter than the header is rejected
#[test]
fn test_declared_length_below_header() {
    let mut buf = encode(&SpawnMessage::new(MsgType::Spawn, "app"));
    buf[codec::MSG_LEN_OFFSET..codec::MSG_LEN_OFFSET + 4].copy_from_slice(&8u32.to_le_bytes());
    assert!(matches!(
        decode(&buf),
        Err(DecodeError::LengthMismatch { declared: 8, .. })
    ));
}
