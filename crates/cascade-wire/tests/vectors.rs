// Wire-form stability: the JSON grammar is a compatibility surface, so
// these vectors pin the exact tag names and field spellings a server
// implementation matches against.
use cascade_wire::{
    ClientRequest, CommandVerb, FieldChange, Frame, FrameHeader, MpnDeviceStatus, OutcomeKind,
    ProtocolEvent, SubscriptionMode,
};

#[test]
fn session_created_vector() {
    let text = r#"{
        "type": "session_created",
        "session_id": "S7e2a",
        "keepalive_ms": 5000,
        "client_ip": "10.0.0.9"
    }"#;
    let event = ProtocolEvent::from_json(text).expect("decode");
    assert_eq!(
        event,
        ProtocolEvent::SessionCreated {
            session_id: "S7e2a".to_string(),
            keepalive_ms: Some(5000),
            control_link: None,
            server_socket_name: None,
            client_ip: Some("10.0.0.9".to_string()),
        }
    );
}

#[test]
fn command_update_vector() {
    let text = r#"{
        "type": "update",
        "subscription": 2,
        "item": 1,
        "key": "row-1",
        "command": "ADD",
        "snapshot": true,
        "changes": [
            {"field": 1, "value": "row-1"},
            {"field": 3, "value": "98.4"}
        ]
    }"#;
    let event = ProtocolEvent::from_json(text).expect("decode");
    match event {
        ProtocolEvent::Update {
            subscription,
            item,
            key,
            command,
            snapshot,
            changes,
        } => {
            assert_eq!(subscription, 2);
            assert_eq!(item, 1);
            assert_eq!(key.as_deref(), Some("row-1"));
            assert_eq!(command, Some(CommandVerb::Add));
            assert!(snapshot);
            assert_eq!(
                changes,
                vec![
                    FieldChange {
                        field: 1,
                        value: Some("row-1".to_string()),
                        json_patch: None
                    },
                    FieldChange {
                        field: 3,
                        value: Some("98.4".to_string()),
                        json_patch: None
                    },
                ]
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn message_outcome_vectors() {
    let deny = r#"{
        "type": "message_outcome",
        "sequence": "orders",
        "prog": 4,
        "outcome": {"kind": "deny", "code": -7, "message": "limit"}
    }"#;
    let event = ProtocolEvent::from_json(deny).expect("decode");
    assert_eq!(
        event,
        ProtocolEvent::MessageOutcome {
            sequence: "orders".to_string(),
            prog: 4,
            outcome: OutcomeKind::Deny {
                code: -7,
                message: "limit".to_string()
            },
        }
    );

    let discarded = r#"{
        "type": "message_outcome",
        "sequence": "orders",
        "prog": 3,
        "outcome": {"kind": "discarded"}
    }"#;
    let event = ProtocolEvent::from_json(discarded).expect("decode");
    assert!(matches!(
        event,
        ProtocolEvent::MessageOutcome {
            outcome: OutcomeKind::Discarded,
            ..
        }
    ));
}

#[test]
fn mpn_status_vector() {
    let text = r#"{
        "type": "mpn_device_status_change",
        "status": "SUSPENDED",
        "timestamp": 171234
    }"#;
    let event = ProtocolEvent::from_json(text).expect("decode");
    assert_eq!(
        event,
        ProtocolEvent::MpnDeviceStatusChange {
            status: MpnDeviceStatus::Suspended,
            timestamp: 171234,
        }
    );
}

#[test]
fn subscribe_request_emits_mode_token() {
    let request = ClientRequest::Subscribe {
        subscription: 9,
        mode: SubscriptionMode::Command,
        group: "portfolio".to_string(),
        schema: "key command qty".to_string(),
        data_adapter: None,
        selector: None,
        snapshot: Some("yes".to_string()),
        buffer_size: None,
        max_frequency: Some("unlimited".to_string()),
    };
    let json = request.to_json().expect("encode");
    assert!(json.contains("\"type\":\"subscribe\""));
    assert!(json.contains("\"mode\":\"COMMAND\""));
    assert!(!json.contains("data_adapter"));
    assert_eq!(ClientRequest::from_json(&json).expect("decode"), request);
}

#[test]
fn framed_event_survives_header_round_trip() {
    let event = ProtocolEvent::Sync { age_ms: 12 };
    let frame = event.encode().expect("encode");
    let bytes = frame.encode();
    assert_eq!(&bytes[..4], &cascade_wire::MAGIC.to_be_bytes());
    assert_eq!(bytes.len(), FrameHeader::LEN + frame.header.length as usize);
    let reparsed = Frame::decode(bytes).expect("frame decode");
    assert_eq!(ProtocolEvent::decode(reparsed).expect("decode"), event);
}
