use serde::{Deserialize, Serialize};

use super::exit::Exit;

/// Either a streaming partial result or the terminal outcome of a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "_tag")]
pub enum Reply {
    Chunk {
        id: i64,
        #[serde(rename = "requestId")]
        request_id: i64,
        sequence: u64,
        values: Vec<serde_json::Value>,
    },
    WithExit {
        id: i64,
        #[serde(rename = "requestId")]
        request_id: i64,
        exit: Exit,
    },
}

impl Reply {
    pub fn request_id(&self) -> i64 {
        match self {
            Reply::Chunk { request_id, .. } => *request_id,
            Reply::WithExit { request_id, .. } => *request_id,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Reply::WithExit { .. })
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            Reply::Chunk { sequence, .. } => Some(*sequence),
            Reply::WithExit { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_exit() {
        let chunk = Reply::Chunk {
            id: 1,
            request_id: 1,
            sequence: 1,
            values: vec![],
        };
        let exit = Reply::WithExit {
            id: 2,
            request_id: 1,
            exit: Exit::Success(serde_json::json!(null)),
        };
        assert!(!chunk.is_exit());
        assert!(exit.is_exit());
        assert_eq!(chunk.sequence(), Some(1));
        assert_eq!(exit.sequence(), None);
    }

    #[test]
    fn test_roundtrip() {
        let reply = Reply::Chunk {
            id: 5,
            request_id: 9,
            sequence: 3,
            values: vec![serde_json::json!(1), serde_json::json!(2)],
        };
        let encoded = serde_json::to_string(&reply).unwrap();
        let decoded: Reply = serde_json::from_str(&encoded).unwrap();
        assert_eq!(reply, decoded);
    }
}
