use serde::{Deserialize, Serialize};

/// Terminal outcome of a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "_tag")]
pub enum Exit {
    Success(serde_json::Value),
    Failure(serde_json::Value),
    Interrupted,
    /// A defect: an uncaught handler panic or a malformed-message coercion.
    Die { message: String },
}

impl Exit {
    pub fn die(message: impl Into<String>) -> Self {
        Exit::Die {
            message: message.into(),
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Exit::Failure(_) | Exit::Die { .. } | Exit::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_die_constructor() {
        let exit = Exit::die("boom");
        assert!(exit.is_terminal_failure());
        match exit {
            Exit::Die { message } => assert_eq!(message, "boom"),
            _ => panic!("expected Die"),
        }
    }

    #[test]
    fn test_success_is_not_terminal_failure() {
        assert!(!Exit::Success(serde_json::json!(1)).is_terminal_failure());
    }

    #[test]
    fn test_serde_roundtrip() {
        let exit = Exit::Failure(serde_json::json!({"code": "bad"}));
        let encoded = serde_json::to_string(&exit).unwrap();
        let decoded: Exit = serde_json::from_str(&encoded).unwrap();
        assert_eq!(exit, decoded);
    }
}
