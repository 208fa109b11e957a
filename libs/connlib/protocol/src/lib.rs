//! The signaling wire protocol: JSON messages tagged with a `type` discriminator.
//!
//! Encoding marshals the payload and merges a `"type": <wire-name>` field into the
//! resulting object; decoding reads `type`, dispatches to the matching variant, then
//! decodes the rest of the object into it. This is exactly what serde's internally
//! tagged enum representation (`#[serde(tag = "type")]`) does, so the codec itself is
//! a thin pair of functions around `serde_json`.

use connlib_model::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "join")]
    Join(Join),
    #[serde(rename = "peers")]
    Peers(Peers),
    #[serde(rename = "offer")]
    Offer(Offer),
    #[serde(rename = "answer")]
    Answer(Answer),
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidate),
    #[serde(rename = "peer-left")]
    PeerLeft(PeerLeft),
}

/// First message sent by a client after dialing the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    pub peer_id: PeerId,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,
    /// Well-known keys: `routes`, `dns`, `dns_search`; otherwise opaque to the relay.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Sent by the relay on join and again whenever another peer arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peers {
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub from: PeerId,
    pub to: PeerId,
    pub sdp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// The offering side's in-tunnel address, so the answering side can install a
    /// WireGuard peer for it the moment the data channel opens (spec §4.1) without
    /// waiting on a `peers` message it may never initiate one from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub from: PeerId,
    pub to: PeerId,
    pub sdp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub from: PeerId,
    pub to: PeerId,
    pub candidate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    pub peer_id: PeerId,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed or unrecognized signaling message: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode(message: &Message) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode(text: &str) -> Result<Message, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_round_trips_with_type_tag() {
        let msg = Message::Join(Join {
            peer_id: PeerId::new("alpha"),
            public_key: "key".to_owned(),
            address: Some("10.0.0.1/24".to_owned()),
            routes: vec!["10.0.0.0/24".to_owned()],
            metadata: HashMap::new(),
        });

        let json = encode(&msg).unwrap();
        assert!(json.contains("\"type\":\"join\""));
        assert!(json.contains("\"peerId\":\"alpha\""));

        assert_eq!(decode(&json).unwrap(), msg);
    }

    #[test]
    fn ice_candidate_uses_kebab_case_wire_name() {
        let msg = Message::IceCandidate(IceCandidate {
            from: PeerId::new("alpha"),
            to: PeerId::new("bravo"),
            candidate: "candidate:1 1 udp ...".to_owned(),
        });

        let json = encode(&msg).unwrap();
        assert!(json.contains("\"type\":\"ice-candidate\""));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = decode(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn missing_type_is_an_error() {
        let err = decode(r#"{"peerId":"alpha"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn peers_message_carries_list_of_peer_info() {
        let msg = Message::Peers(Peers {
            peers: vec![PeerInfo {
                peer_id: PeerId::new("bravo"),
                public_key: "key".to_owned(),
                address: None,
                routes: vec![],
                metadata: HashMap::new(),
            }],
        });

        let json = encode(&msg).unwrap();
        let decoded = decode(&json).unwrap();

        assert_eq!(decoded, msg);
    }
}
