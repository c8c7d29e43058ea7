use serde::{Deserialize, Serialize};

/// Datagrams exchanged on the discovery port.
///
/// Only `announce` is acted on. Any other `type` decodes to `Unknown` and is
/// ignored, which leaves room for new message kinds without breaking older
/// players.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryMessage {
    Announce(Announcement),
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Announcement {
    /// Sender's display name, doubles as its identity on the wire.
    pub id: String,
    pub name: String,
    /// Sender's HTTP API port.
    pub port: u16,
}

impl Announcement {
    pub fn new(display_name: &str, port: u16) -> Self {
        Self {
            id: display_name.to_string(),
            name: display_name.to_string(),
            port,
        }
    }
}

impl DiscoveryMessage {
    /// Decode a datagram. Returns `None` for anything that is not valid JSON
    /// with a `type` field.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        serde_json::from_slice(buf).ok()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_wire_format() {
        let msg = DiscoveryMessage::Announce(Announcement::new("Lobby", 3006));
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "announce", "id": "Lobby", "name": "Lobby", "port": 3006})
        );
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let msg = DiscoveryMessage::decode(br#"{"type":"goodbye","id":"x"}"#);
        assert_eq!(msg, Some(DiscoveryMessage::Unknown));
    }

    #[test]
    fn test_malformed_datagrams_rejected() {
        assert_eq!(DiscoveryMessage::decode(b"not json"), None);
        assert_eq!(DiscoveryMessage::decode(br#"{"id":"x","port":1}"#), None);
        assert_eq!(
            DiscoveryMessage::decode(br#"{"type":"announce","id":"x"}"#),
            None
        );
    }
}
