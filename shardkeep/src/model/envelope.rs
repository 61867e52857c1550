use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::entity_address::EntityAddress;
use super::primary_key::PrimaryKey;

/// Wire envelope: wraps a request, an acknowledgement of a streamed chunk,
/// or an interrupt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "_tag")]
pub enum Envelope {
    Request {
        #[serde(rename = "requestId")]
        request_id: i64,
        address: EntityAddress,
        tag: String,
        payload: serde_json::Value,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(rename = "traceId", default)]
        trace_id: Option<String>,
        #[serde(rename = "spanId", default)]
        span_id: Option<String>,
        #[serde(default)]
        sampled: bool,
        /// Wall-clock ms at which this request becomes visible to
        /// `unprocessedMessages`. `None` means deliver immediately.
        #[serde(rename = "deliverAt", default)]
        deliver_at: Option<i64>,
    },
    AckChunk {
        id: i64,
        address: EntityAddress,
        #[serde(rename = "requestId")]
        request_id: i64,
        #[serde(rename = "replyId")]
        reply_id: i64,
    },
    Interrupt {
        id: i64,
        address: EntityAddress,
        #[serde(rename = "requestId")]
        request_id: i64,
    },
}

impl Envelope {
    pub fn request_id(&self) -> i64 {
        match self {
            Envelope::Request { request_id, .. } => *request_id,
            Envelope::AckChunk { request_id, .. } => *request_id,
            Envelope::Interrupt { request_id, .. } => *request_id,
        }
    }

    pub fn address(&self) -> &EntityAddress {
        match self {
            Envelope::Request { address, .. } => address,
            Envelope::AckChunk { address, .. } => address,
            Envelope::Interrupt { address, .. } => address,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Envelope::Request { .. })
    }

    /// Derives `(entityType, entityId, tag, payload.key)` for a `Request`.
    /// `None` for non-request variants or a payload with no string `key`.
    pub fn primary_key(&self) -> Option<PrimaryKey> {
        match self {
            Envelope::Request {
                address,
                tag,
                payload,
                ..
            } => {
                let key = payload.get("key")?.as_str()?;
                Some(PrimaryKey::new(address, tag.clone(), key))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::shard_id::ShardId;

    fn address() -> EntityAddress {
        EntityAddress {
            shard_id: ShardId::new("default", 3),
            entity_type: "Counter".into(),
            entity_id: "abc".into(),
        }
    }

    #[test]
    fn test_roundtrip_request() {
        let envelope = Envelope::Request {
            request_id: 42,
            address: address(),
            tag: "Increment".into(),
            payload: serde_json::json!({"amount": 1, "key": "k1"}),
            headers: HashMap::new(),
            trace_id: None,
            span_id: None,
            sampled: false,
            deliver_at: None,
        };
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_primary_key_derived_from_payload() {
        let envelope = Envelope::Request {
            request_id: 1,
            address: address(),
            tag: "Increment".into(),
            payload: serde_json::json!({"key": "k1"}),
            headers: HashMap::new(),
            trace_id: None,
            span_id: None,
            sampled: false,
            deliver_at: None,
        };
        let pk = envelope.primary_key().unwrap();
        assert_eq!(pk, PrimaryKey::new(&address(), "Increment", "k1"));
    }

    #[test]
    fn test_primary_key_none_without_payload_key() {
        let envelope = Envelope::Request {
            request_id: 1,
            address: address(),
            tag: "Increment".into(),
            payload: serde_json::json!({"amount": 1}),
            headers: HashMap::new(),
            trace_id: None,
            span_id: None,
            sampled: false,
            deliver_at: None,
        };
        assert!(envelope.primary_key().is_none());
    }

    #[test]
    fn test_primary_key_none_for_non_request() {
        let envelope = Envelope::AckChunk {
            id: 1,
            address: address(),
            request_id: 1,
            reply_id: 1,
        };
        assert!(envelope.primary_key().is_none());
    }

    #[test]
    fn test_request_id_accessor() {
        let envelope = Envelope::AckChunk {
            id: 1,
            address: address(),
            request_id: 42,
            reply_id: 7,
        };
        assert_eq!(envelope.request_id(), 42);
        assert!(!envelope.is_request());
    }
}
