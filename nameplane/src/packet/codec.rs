//! Flat JSON codec.
//!
//! A packet is one JSON object: the payload's fields plus an integer `type`
//! discriminator. Node sets are colon-joined strings.

use serde_json::{Map, Value};

use super::{PacketType, ReconfigPacket};
use crate::error::PacketError;

const TYPE_FIELD: &str = "type";

/// Serialize a packet to JSON bytes.
pub fn encode(packet: &ReconfigPacket) -> Result<Vec<u8>, PacketError> {
    let payload = match packet {
        ReconfigPacket::RemoveRecord(p)
        | ReconfigPacket::ActiveRemove(p)
        | ReconfigPacket::ActiveRemoveConfirm(p)
        | ReconfigPacket::ControllerRemove(p) => serde_json::to_value(p)?,
        ReconfigPacket::NewActivePropose(p) => serde_json::to_value(p)?,
        ReconfigPacket::OldActiveStop(p)
        | ReconfigPacket::OldActiveStopConfirm(p)
        | ReconfigPacket::DeleteOldActiveState(p) => serde_json::to_value(p)?,
        ReconfigPacket::NewActiveStart(p)
        | ReconfigPacket::NewActiveStartForward(p)
        | ReconfigPacket::NewActiveStartResponse(p)
        | ReconfigPacket::NewActiveStartConfirm(p)
        | ReconfigPacket::PrevValueRequest(p)
        | ReconfigPacket::PrevValueResponse(p) => serde_json::to_value(p)?,
        ReconfigPacket::GroupChangeComplete(p) => serde_json::to_value(p)?,
        ReconfigPacket::KeepAlive(p) => serde_json::to_value(p)?,
    };
    let mut object = match payload {
        Value::Object(object) => object,
        _ => return Err(PacketError::NotAnObject),
    };
    object.insert(TYPE_FIELD.to_string(), packet.packet_type().code().into());
    Ok(serde_json::to_vec(&Value::Object(object))?)
}

/// Parse a packet from JSON bytes.
pub fn decode(bytes: &[u8]) -> Result<ReconfigPacket, PacketError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let mut object: Map<String, Value> = match value {
        Value::Object(object) => object,
        _ => return Err(PacketError::NotAnObject),
    };
    let code = object
        .remove(TYPE_FIELD)
        .and_then(|t| t.as_i64())
        .ok_or(PacketError::MissingType)?;
    let packet_type = PacketType::from_code(code).ok_or(PacketError::UnknownType(code))?;
    let payload = Value::Object(object);

    Ok(match packet_type {
        PacketType::RemoveRecord => ReconfigPacket::RemoveRecord(serde_json::from_value(payload)?),
        PacketType::ActiveRemove => ReconfigPacket::ActiveRemove(serde_json::from_value(payload)?),
        PacketType::ActiveRemoveConfirm => {
            ReconfigPacket::ActiveRemoveConfirm(serde_json::from_value(payload)?)
        }
        PacketType::ControllerRemove => {
            ReconfigPacket::ControllerRemove(serde_json::from_value(payload)?)
        }
        PacketType::NewActivePropose => {
            ReconfigPacket::NewActivePropose(serde_json::from_value(payload)?)
        }
        PacketType::OldActiveStop => ReconfigPacket::OldActiveStop(serde_json::from_value(payload)?),
        PacketType::OldActiveStopConfirm => {
            ReconfigPacket::OldActiveStopConfirm(serde_json::from_value(payload)?)
        }
        PacketType::DeleteOldActiveState => {
            ReconfigPacket::DeleteOldActiveState(serde_json::from_value(payload)?)
        }
        PacketType::NewActiveStart => {
            ReconfigPacket::NewActiveStart(serde_json::from_value(payload)?)
        }
        PacketType::NewActiveStartForward => {
            ReconfigPacket::NewActiveStartForward(serde_json::from_value(payload)?)
        }
        PacketType::NewActiveStartResponse => {
            ReconfigPacket::NewActiveStartResponse(serde_json::from_value(payload)?)
        }
        PacketType::NewActiveStartConfirm => {
            ReconfigPacket::NewActiveStartConfirm(serde_json::from_value(payload)?)
        }
        PacketType::PrevValueRequest => {
            ReconfigPacket::PrevValueRequest(serde_json::from_value(payload)?)
        }
        PacketType::PrevValueResponse => {
            ReconfigPacket::PrevValueResponse(serde_json::from_value(payload)?)
        }
        PacketType::GroupChangeComplete => {
            ReconfigPacket::GroupChangeComplete(serde_json::from_value(payload)?)
        }
        PacketType::KeepAlive => ReconfigPacket::KeepAlive(serde_json::from_value(payload)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{KeepAlive, NewActiveProposal, Role, StopRequest};
    use crate::types::{node_set, GroupId, NodeId, RequestId, Version};

    #[test]
    fn test_flat_layout_with_colon_sets() {
        let packet = ReconfigPacket::NewActivePropose(NewActiveProposal {
            name: "n1".into(),
            request_id: RequestId(5),
            proposer: NodeId(1),
            new_actives: node_set([3, 7, 12]),
            version: Version::new(2),
        });
        let bytes = encode(&packet).expect("encode");
        let json: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(json["type"], 100);
        assert_eq!(json["name"], "n1");
        assert_eq!(json["newActives"], "3:7:12");
        assert_eq!(json["version"], 2);
        assert_eq!(json["requestId"], 5);

        assert_eq!(decode(&bytes).expect("decode"), packet);
    }

    #[test]
    fn test_decode_legacy_stop_packet() {
        let raw = br#"{"type":101,"name":"n1","requestId":9,"primarySender":1,"activeReceiver":2,"version":1}"#;
        let packet = decode(raw).expect("decode");
        assert_eq!(
            packet,
            ReconfigPacket::OldActiveStop(StopRequest {
                name: "n1".into(),
                request_id: RequestId(9),
                primary_sender: NodeId(1),
                active_receiver: NodeId(2),
                version: Version::new(1),
            })
        );
    }

    #[test]
    fn test_keep_alive_layout() {
        let packet = ReconfigPacket::KeepAlive(KeepAlive {
            name: "n1".into(),
            group_id: GroupId::for_actives("n1", Version::new(2)),
            sender: NodeId(4),
            role: Role::Active,
        });
        let bytes = encode(&packet).expect("encode");
        let json: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(json["groupId"], "n1-2");
        assert_eq!(json["role"], "active");
        assert_eq!(decode(&bytes).expect("decode"), packet);
    }

    #[test]
    fn test_malformed_packets_rejected() {
        assert!(matches!(decode(b"not json"), Err(PacketError::Json(_))));
        assert!(matches!(decode(b"[1,2]"), Err(PacketError::NotAnObject)));
        assert!(matches!(
            decode(br#"{"name":"n1"}"#),
            Err(PacketError::MissingType)
        ));
        assert!(matches!(
            decode(br#"{"type":"101","name":"n1"}"#),
            Err(PacketError::MissingType)
        ));
        assert!(matches!(
            decode(br#"{"type":2,"name":"n1"}"#),
            Err(PacketError::UnknownType(2))
        ));
        assert!(matches!(
            decode(br#"{"type":101,"name":"n1"}"#),
            Err(PacketError::Json(_))
        ));
        assert!(matches!(
            decode(br#"{"type":100,"name":"n1","requestId":1,"proposer":1,"newActives":"1:x","version":2}"#),
            Err(PacketError::Json(_))
        ));
    }
}
