use serde::{Deserialize, Serialize};

/// CONTROL channel message payload.
///
/// Ids are always named from the point of view of the side that sends the
/// message: `sender_id` is the sender's local channel id, `receiver_id` is the
/// id the receiving side allocated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Ask the peer to open a channel bound to `sender_id`.
    ChannelCreated {
        sender_id: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Vec<u8>>,
    },
    /// Answer to `ChannelCreated`: the peer's channel `sender_id` is bound to
    /// our channel `receiver_id`.
    ChannelAssociated { sender_id: i32, receiver_id: i32 },
    /// The peer closed the channel we know as `receiver_id`.
    ChannelRemoved { receiver_id: i32 },
}

impl ControlMessage {
    /// Encode to the JSON payload carried on CONTROL.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a CONTROL payload.
    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ControlMessage::ChannelCreated { .. } => "channel_created",
            ControlMessage::ChannelAssociated { .. } => "channel_associated",
            ControlMessage::ChannelRemoved { .. } => "channel_removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape_uses_type_tag() {
        let msg = ControlMessage::ChannelAssociated {
            sender_id: 4,
            receiver_id: 9,
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.to_payload().unwrap()).unwrap();
        assert_eq!(json["type"], "channel_associated");
        assert_eq!(json["sender_id"], 4);
        assert_eq!(json["receiver_id"], 9);
    }

    #[test]
    fn created_without_data_omits_field() {
        let msg = ControlMessage::ChannelCreated {
            sender_id: 1,
            data: None,
        };
        let text = String::from_utf8(msg.to_payload().unwrap()).unwrap();
        assert!(!text.contains("data"));
        assert_eq!(ControlMessage::from_payload(text.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn created_with_data_decodes() {
        let decoded = ControlMessage::from_payload(
            br#"{"type":"channel_created","sender_id":7,"data":[114,112,99]}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            ControlMessage::ChannelCreated {
                sender_id: 7,
                data: Some(b"rpc".to_vec()),
            }
        );
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(ControlMessage::from_payload(br#"{"type":"ping"}"#).is_err());
    }
}
