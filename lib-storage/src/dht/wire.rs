//! Wire envelope and framing
//!
//! Every message exchanged between peers over the opaque transport is a
//! tagged JSON record: a fixed header (`requestId`, `from`, `to`, `ttl`)
//! plus a kind-specific body. `requestId` is unique per sender and echoed
//! in the matching reply; `DHT_NOTIFY` carries a fresh id and expects no
//! reply. Records embed in frames exactly as defined by the record types,
//! so private values stay sealed on the wire.

use lib_peer::PeerId;
use serde::{Deserialize, Serialize};

use crate::types::{KeyId, Record};

/// Kind-specific frame payloads, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum FrameBody {
    #[serde(rename = "DHT_STORE")]
    Store {
        #[serde(rename = "keyId")]
        key_id: KeyId,
        record: Record,
        #[serde(rename = "ttlMs", default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },

    #[serde(rename = "DHT_GET")]
    Get {
        #[serde(rename = "keyId")]
        key_id: KeyId,
        #[serde(rename = "forceRefresh", default)]
        force_refresh: bool,
    },

    #[serde(rename = "DHT_SUBSCRIBE")]
    Subscribe {
        #[serde(rename = "keyId")]
        key_id: KeyId,
    },

    #[serde(rename = "DHT_UNSUBSCRIBE")]
    Unsubscribe {
        #[serde(rename = "keyId")]
        key_id: KeyId,
    },

    #[serde(rename = "DHT_NOTIFY")]
    Notify {
        #[serde(rename = "keyId")]
        key_id: KeyId,
        record: Record,
    },

    #[serde(rename = "STORE_ACK")]
    StoreAck {
        #[serde(rename = "keyId")]
        key_id: KeyId,
    },

    #[serde(rename = "STORE_REJECT")]
    StoreReject {
        #[serde(rename = "keyId")]
        key_id: KeyId,
        reason: String,
    },

    #[serde(rename = "GET_REPLY")]
    GetReply {
        #[serde(rename = "keyId")]
        key_id: KeyId,
        record: Option<Record>,
        #[serde(default)]
        stale: bool,
    },

    #[serde(rename = "SUBSCRIBE_ACK")]
    SubscribeAck {
        #[serde(rename = "keyId")]
        key_id: KeyId,
        #[serde(rename = "currentRecord")]
        current_record: Option<Record>,
    },
}

impl FrameBody {
    /// The key digest this frame concerns.
    pub fn key_id(&self) -> KeyId {
        match self {
            FrameBody::Store { key_id, .. }
            | FrameBody::Get { key_id, .. }
            | FrameBody::Subscribe { key_id }
            | FrameBody::Unsubscribe { key_id }
            | FrameBody::Notify { key_id, .. }
            | FrameBody::StoreAck { key_id }
            | FrameBody::StoreReject { key_id, .. }
            | FrameBody::GetReply { key_id, .. }
            | FrameBody::SubscribeAck { key_id, .. } => *key_id,
        }
    }

    /// Is this a reply that should resolve a pending request?
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            FrameBody::StoreAck { .. }
                | FrameBody::StoreReject { .. }
                | FrameBody::GetReply { .. }
                | FrameBody::SubscribeAck { .. }
        )
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub body: FrameBody,
    #[serde(rename = "requestId")]
    pub request_id: u64,
    pub from: PeerId,
    pub to: PeerId,
    /// Remaining hop budget; decremented on every forward.
    pub ttl: u8,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordMetadata, StorageSpace};

    fn sample_record() -> Record {
        let meta = RecordMetadata::new(
            "greeting".into(),
            StorageSpace::Public,
            PeerId::from_seed(b"owner"),
            1_000,
        );
        Record::new(serde_json::json!("hi"), meta)
    }

    fn frame(body: FrameBody) -> Frame {
        Frame {
            body,
            request_id: 7,
            from: PeerId::from_seed(b"from"),
            to: PeerId::from_seed(b"to"),
            ttl: 4,
        }
    }

    #[test]
    fn test_frame_is_kind_tagged_json() {
        let f = frame(FrameBody::Get {
            key_id: KeyId::for_key("greeting"),
            force_refresh: true,
        });
        let json: serde_json::Value = serde_json::from_slice(&f.encode()).unwrap();
        assert_eq!(json["kind"], "DHT_GET");
        assert_eq!(json["requestId"], 7);
        assert_eq!(json["ttl"], 4);
        assert_eq!(json["body"]["forceRefresh"], true);
    }

    #[test]
    fn test_store_frame_round_trip() {
        let f = frame(FrameBody::Store {
            key_id: KeyId::for_key("greeting"),
            record: sample_record(),
            ttl_ms: Some(60_000),
        });
        let decoded = Frame::decode(&f.encode()).unwrap();
        assert_eq!(decoded, f);
    }

    #[test]
    fn test_reply_classification() {
        assert!(frame(FrameBody::StoreAck {
            key_id: KeyId::for_key("k")
        })
        .body
        .is_reply());
        assert!(!frame(FrameBody::Notify {
            key_id: KeyId::for_key("k"),
            record: sample_record(),
        })
        .body
        .is_reply());
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(Frame::decode(b"{\"kind\":\"DHT_WARP\"}").is_err());
        assert!(Frame::decode(b"not json at all").is_err());
    }

    #[test]
    fn test_get_reply_carries_optional_record() {
        let f = frame(FrameBody::GetReply {
            key_id: KeyId::for_key("missing"),
            record: None,
            stale: false,
        });
        let decoded = Frame::decode(&f.encode()).unwrap();
        assert!(matches!(
            decoded.body,
            FrameBody::GetReply { record: None, .. }
        ));
    }
}
