//! Per-connection request handling

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::protocol::{AssessRequest, AssessResponse, ErrorResponse};
use super::ServerError;
use crate::providers::{ProviderError, ProviderSet};
use crate::usage::{RiskThresholds, UsageStore};

/// Longest request line accepted
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Errors for a single request; reported on the connection, never fatal
#[derive(Debug, Error)]
pub enum AssessError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported model '{0}'")]
    UnsupportedModel(String),

    #[error("Token count failed: {0}")]
    TokenCount(#[from] ProviderError),
}

/// Answers risk requests from the current usage
pub struct RequestHandler {
    providers: ProviderSet,
    store: Arc<UsageStore>,
    thresholds: RiskThresholds,
}

impl RequestHandler {
    pub fn new(providers: ProviderSet, store: Arc<UsageStore>, thresholds: RiskThresholds) -> Self {
        Self {
            providers,
            store,
            thresholds,
        }
    }

    /// Counts the prompt and classifies the usage it would bring the organization to
    pub async fn assess(&self, request: &AssessRequest) -> Result<AssessResponse, AssessError> {
        if request.model.trim().is_empty() {
            return Err(AssessError::InvalidRequest("model is required".into()));
        }
        if request.messages.is_empty() {
            return Err(AssessError::InvalidRequest("messages must not be empty".into()));
        }

        let client = self
            .providers
            .client_for_model(&request.model)
            .ok_or_else(|| AssessError::UnsupportedModel(request.model.clone()))?;

        let prompt_tokens = client.count_tokens(&request.model, &request.messages).await?;
        let total_tokens_used = self.store.total_tokens();
        let risk_level = self
            .thresholds
            .classify(total_tokens_used.saturating_add(prompt_tokens));

        tracing::debug!(
            model = %request.model,
            prompt_tokens,
            total_tokens_used,
            risk = %risk_level,
            "Assessed prompt"
        );

        Ok(AssessResponse {
            risk_level,
            total_tokens_used,
            prompt_tokens,
        })
    }

    /// Handles one request line, returning the response line without its newline
    pub async fn handle_line(&self, line: &str) -> String {
        let result = match serde_json::from_str::<AssessRequest>(line) {
            Ok(request) => self.assess(&request).await,
            Err(e) => Err(AssessError::InvalidRequest(e.to_string())),
        };

        let encoded = match result {
            Ok(response) => serde_json::to_string(&response),
            Err(e) => {
                tracing::warn!(error = %e, "Request failed");
                serde_json::to_string(&ErrorResponse::new(e.to_string()))
            }
        };

        encoded.unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string())
    }

    /// Serves requests on a connection until the client hangs up or `cancel` fires
    ///
    /// A line longer than `MAX_REQUEST_BYTES` gets an error reply and the
    /// connection is closed; the rest of the line is never read.
    pub async fn serve(&self, stream: UnixStream, cancel: CancellationToken) -> Result<(), ServerError> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_BYTES));

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next() => line,
            };

            let (mut reply, close) = match line {
                None => break,
                Some(Ok(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    (self.handle_line(line).await, false)
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(limit = MAX_REQUEST_BYTES, "Request too large, closing connection");
                    let error = AssessError::InvalidRequest(format!(
                        "request exceeds {} bytes",
                        MAX_REQUEST_BYTES
                    ));
                    let reply = serde_json::to_string(&ErrorResponse::new(error.to_string()))
                        .unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string());
                    (reply, true)
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(ServerError::Io(e)),
            };
            reply.push('\n');

            writer.write_all(reply.as_bytes()).await?;
            writer.flush().await?;

            if close {
                break;
            }
        }

        tracing::debug!("Connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Message, MockProviderClient, ProviderFamily};
    use crate::usage::RiskLevel;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    const MODEL: &str = "claude-sonnet-4-20250514";

    fn handler_with(client: MockProviderClient, used: u64) -> RequestHandler {
        let providers = ProviderSet::new()
            .with_client(Arc::new(client))
            .with_model(MODEL)
            .unwrap();
        let store = Arc::new(UsageStore::new());
        store.update(MODEL, used);
        RequestHandler::new(providers, store, RiskThresholds::new(100.0, 200.0, 300.0))
    }

    fn counting_client(tokens: u64) -> MockProviderClient {
        let mut client = MockProviderClient::new();
        client.expect_family().return_const(ProviderFamily::Anthropic);
        client.expect_count_tokens().returning(move |_, _| Ok(tokens));
        client
    }

    fn request(model: &str) -> AssessRequest {
        AssessRequest {
            model: model.to_string(),
            messages: vec![Message::user("How many tokens is this?")],
        }
    }

    #[tokio::test]
    async fn test_assess_classifies_projected_usage() {
        let handler = handler_with(counting_client(60), 150);

        let response = handler.assess(&request(MODEL)).await.unwrap();

        // 150 used + 60 prompt lands above the medium boundary
        assert_eq!(response.risk_level, RiskLevel::Medium);
        assert_eq!(response.total_tokens_used, 150);
        assert_eq!(response.prompt_tokens, 60);
    }

    #[tokio::test]
    async fn test_assess_runaway_usage_is_unknown() {
        let handler = handler_with(counting_client(1), 5_000);
        let response = handler.assess(&request(MODEL)).await.unwrap();
        assert_eq!(response.risk_level, RiskLevel::Unknown);
    }

    #[tokio::test]
    async fn test_assess_unsupported_model() {
        let handler = handler_with(counting_client(1), 0);

        let err = handler.assess(&request("gpt-4o")).await.unwrap_err();
        assert!(matches!(err, AssessError::UnsupportedModel(m) if m == "gpt-4o"));
    }

    #[tokio::test]
    async fn test_assess_rejects_empty_messages() {
        let handler = handler_with(counting_client(1), 0);
        let mut req = request(MODEL);
        req.messages.clear();

        assert!(matches!(
            handler.assess(&req).await,
            Err(AssessError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_assess_provider_error() {
        let mut client = MockProviderClient::new();
        client.expect_family().return_const(ProviderFamily::Anthropic);
        client.expect_count_tokens().returning(|_, _| {
            Err(ProviderError::Http {
                status: 529,
                body: "overloaded".into(),
            })
        });
        let handler = handler_with(client, 0);

        let err = handler.assess(&request(MODEL)).await.unwrap_err();
        assert!(matches!(err, AssessError::TokenCount(_)));
    }

    #[tokio::test]
    async fn test_handle_line_invalid_json() {
        let handler = handler_with(counting_client(1), 0);

        let reply: Value = serde_json::from_str(&handler.handle_line("{ nope").await).unwrap();
        assert!(reply["error"].as_str().unwrap().starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn test_serve_handles_several_requests_per_connection() {
        let handler = Arc::new(handler_with(counting_client(10), 50));
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let cancel = CancellationToken::new();

        let serving = tokio::spawn({
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move { handler.serve(server_side, cancel).await }
        });

        let (reader, mut writer) = client_side.into_split();
        let mut replies = BufReader::new(reader).lines();

        let valid = json!({"model": MODEL, "messages": [{"role": "user", "content": "hi"}]});
        writer
            .write_all(format!("{valid}\n\nnot json\n{valid}\n").as_bytes())
            .await
            .unwrap();

        let first: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first, json!({"riskLevel": "low", "totalTokensUsed": 50, "promptTokens": 10}));

        let second: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert!(second.get("error").is_some());

        let third: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(third["riskLevel"], "low");

        drop(writer);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_exits_on_cancel() {
        let handler = Arc::new(handler_with(counting_client(1), 0));
        let (server_side, _client_side) = UnixStream::pair().unwrap();
        let cancel = CancellationToken::new();

        let serving = tokio::spawn({
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move { handler.serve(server_side, cancel).await }
        });

        cancel.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_rejects_oversized_request() {
        let handler = Arc::new(handler_with(counting_client(10), 50));
        let (server_side, client_side) = UnixStream::pair().unwrap();

        let serving = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.serve(server_side, CancellationToken::new()).await }
        });

        let (reader, mut writer) = client_side.into_split();
        // No newline; the server must give up before the line ends
        let sending = tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            for _ in 0..(MAX_REQUEST_BYTES / chunk.len() + 2) {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            writer
        });

        let mut replies = BufReader::new(reader).lines();
        let reply: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert!(reply["error"].as_str().unwrap().contains("request exceeds"));

        serving.await.unwrap().unwrap();
        drop(sending.await.unwrap());

        // The handler keeps serving new connections
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let serving = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.serve(server_side, CancellationToken::new()).await }
        });

        let (reader, mut writer) = client_side.into_split();
        let valid = json!({"model": MODEL, "messages": [{"role": "user", "content": "hi"}]});
        writer.write_all(format!("{valid}\n").as_bytes()).await.unwrap();

        let mut replies = BufReader::new(reader).lines();
        let reply: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["riskLevel"], "low");

        drop(writer);
        serving.await.unwrap().unwrap();
    }
}
