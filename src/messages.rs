use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured control records exchanged alongside plain chat lines.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum Packet {
    #[serde(rename = "file_start")]
    FileStart(FileStart),
    #[serde(rename = "file_chunk")]
    FileChunk(FileChunk),
    #[serde(rename = "file_end")]
    FileEnd(FileEnd),
    /// Server to origin only: the id assigned to a transfer it just started.
    #[serde(rename = "file_ack")]
    FileAck(FileAck),
    #[serde(rename = "msg")]
    PrivateMessage(PrivateMessage),
    #[serde(rename = "invite")]
    Invite(Invite),
    #[serde(rename = "friendreq")]
    FriendRequest(FriendRequest),
}

/// The `type` values a client may send.
pub const INBOUND_KINDS: [&str; 4] = ["file_start", "file_chunk", "file_end", "msg"];

/// Every `type` value the protocol knows about, in either direction.
pub const KNOWN_KINDS: [&str; 7] = [
    "file_start",
    "file_chunk",
    "file_end",
    "file_ack",
    "msg",
    "invite",
    "friendreq",
];

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::FileStart(_) => "file_start",
            Packet::FileChunk(_) => "file_chunk",
            Packet::FileEnd(_) => "file_end",
            Packet::FileAck(_) => "file_ack",
            Packet::PrivateMessage(_) => "msg",
            Packet::Invite(_) => "invite",
            Packet::FriendRequest(_) => "friendreq",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileStart {
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub from: String,
    /// Recipient identities; absent or empty means the whole room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileChunk {
    pub filename: String,
    /// Base64 payload, relayed verbatim.
    pub data: String,
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileEnd {
    pub filename: String,
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileAck {
    pub filename: String,
    pub transfer_id: Uuid,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PrivateMessage {
    #[serde(default)]
    pub to: Vec<String>,
    pub text: String,
    #[serde(default)]
    pub from: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Invite {
    pub from: String,
    pub room: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FriendRequest {
    pub from: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_file_start_without_transfer_id() {
        let line = r#"{"type":"file_start","filename":"a.bin","size":10,"to":["bob"],"from":"alice"}"#;
        let packet: Packet = serde_json::from_str(line).unwrap();
        match packet {
            Packet::FileStart(start) => {
                assert_eq!(start.filename, "a.bin");
                assert_eq!(start.size, 10);
                assert_eq!(start.to, Some(vec!["bob".to_string()]));
                assert_eq!(start.transfer_id, None);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn serializes_with_type_tag() {
        let packet = Packet::Invite(Invite { from: "alice".into(), room: "r1".into() });
        let value: serde_json::Value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["type"], "invite");
        assert_eq!(value["room"], "r1");
    }

    #[test]
    fn every_kind_is_known() {
        let packet = Packet::FriendRequest(FriendRequest { from: "a".into() });
        assert!(KNOWN_KINDS.contains(&packet.kind()));
        assert!(INBOUND_KINDS.iter().all(|kind| KNOWN_KINDS.contains(kind)));
    }
}
