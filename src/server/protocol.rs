//! Wire types
//!
//! Every message is a single JSON object on its own line.

use serde::{Deserialize, Serialize};

use crate::providers::Message;
use crate::usage::RiskLevel;

/// A prompt to assess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessRequest {
    /// Model the prompt is meant for
    pub model: String,
    pub messages: Vec<Message>,
}

/// Risk of sending a prompt, given current usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessResponse {
    pub risk_level: RiskLevel,
    /// Organization usage across all tracked models
    pub total_tokens_used: u64,
    /// Input tokens of the assessed prompt
    pub prompt_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MessageRole;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let request: AssessRequest = serde_json::from_str(
            r#"{"model":"claude-sonnet-4-20250514","messages":[{"role":"user","content":"Summarize this"}]}"#,
        )
        .unwrap();

        assert_eq!(request.model, "claude-sonnet-4-20250514");
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, MessageRole::User);
        assert_eq!(request.messages[0].content, "Summarize this");
    }

    #[test]
    fn test_response_uses_camel_case() {
        let response = AssessResponse {
            risk_level: RiskLevel::Medium,
            total_tokens_used: 1200,
            prompt_tokens: 34,
        };

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"riskLevel": "medium", "totalTokensUsed": 1200, "promptTokens": 34})
        );
    }

    #[test]
    fn test_error_response() {
        assert_eq!(
            serde_json::to_value(ErrorResponse::new("bad request")).unwrap(),
            json!({"error": "bad request"})
        );
    }
}
