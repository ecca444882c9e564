//! Agent transport — the seam to the remote worker processes.
//!
//! The orchestration core only sees `invoke`/`invoke_stream`/`cancel`; the
//! wire protocol behind them is not its concern.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use secrecy::ExposeSecret;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::events::hub::ToolInvocation;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Execution identity, used to correlate cancellation.
    pub execution_id: Uuid,
    /// Target agent.
    pub agent_id: String,
    /// Prompt to execute.
    pub prompt: String,
    /// Timeout hint forwarded to the remote side. The coordinator enforces
    /// its own race locally regardless.
    pub timeout: Option<Duration>,
}

/// Final result of an invocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvokeOutcome {
    /// Agent output.
    #[serde(default)]
    pub output: Option<String>,
    /// Tokens consumed.
    #[serde(default)]
    pub tokens_used: u64,
    /// Agent process exit code.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Failure detail. A set `error` means the run failed even though the
    /// transport round trip succeeded.
    #[serde(default)]
    pub error: Option<String>,
    /// Tool calls the agent made while producing the output.
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
}

/// Incremental item of a streaming invocation.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A token/text delta.
    Delta(String),
    /// A tool call record.
    ToolCall(ToolInvocation),
    /// Terminal item carrying the run's accounting.
    Done {
        tokens_used: u64,
        exit_code: Option<i32>,
    },
}

/// Stream of incremental agent events.
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<AgentEvent, TransportError>> + Send>>;

/// Remote agent invocation, cancellable mid-flight.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Run a prompt to completion and return the buffered outcome.
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome, TransportError>;

    /// Run a prompt and stream incremental events. The default adapter
    /// buffers `invoke` into a single delta for transports that cannot
    /// stream.
    async fn invoke_stream(&self, request: InvokeRequest) -> Result<AgentStream, TransportError> {
        let outcome = self.invoke(request).await?;
        if let Some(error) = outcome.error {
            return Err(TransportError::Request { reason: error });
        }
        let mut items: Vec<Result<AgentEvent, TransportError>> = Vec::new();
        if let Some(output) = outcome.output {
            if !output.is_empty() {
                items.push(Ok(AgentEvent::Delta(output)));
            }
        }
        for call in outcome.tool_calls {
            items.push(Ok(AgentEvent::ToolCall(call)));
        }
        items.push(Ok(AgentEvent::Done {
            tokens_used: outcome.tokens_used,
            exit_code: outcome.exit_code,
        }));
        Ok(Box::pin(futures::stream::iter(items)))
    }

    /// Cooperatively signal cancellation of an in-flight invocation. Local
    /// state is updated by the coordinator regardless of whether the remote
    /// side acknowledges.
    async fn cancel(&self, execution_id: Uuid) -> Result<(), TransportError>;
}

/// HTTP transport talking to an agent gateway.
///
/// `POST {base}/agents/{agent_id}/invoke` with `{execution_id, prompt,
/// timeout_ms}`; the reply body deserializes straight into
/// [`InvokeOutcome`]. Cancellation is `POST {base}/executions/{id}/cancel`.
pub struct HttpAgentTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpAgentTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome, TransportError> {
        let url = format!(
            "{}/agents/{}/invoke",
            self.config.base_url.trim_end_matches('/'),
            request.agent_id
        );
        let body = serde_json::json!({
            "execution_id": request.execution_id,
            "prompt": request.prompt,
            "timeout_ms": request.timeout.map(|t| t.as_millis() as u64),
        });

        let response = self
            .authorized(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| TransportError::Request {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Request {
                reason: format!("agent gateway returned {}", response.status()),
            });
        }

        response
            .json::<InvokeOutcome>()
            .await
            .map_err(|e| TransportError::InvalidResponse {
                reason: e.to_string(),
            })
    }

    async fn cancel(&self, execution_id: Uuid) -> Result<(), TransportError> {
        let url = format!(
            "{}/executions/{}/cancel",
            self.config.base_url.trim_end_matches('/'),
            execution_id
        );
        self.authorized(self.client.post(&url))
            .send()
            .await
            .map_err(|e| TransportError::Request {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    /// Buffered-only transport used to exercise the default stream adapter.
    struct Buffered(InvokeOutcome);

    #[async_trait]
    impl AgentTransport for Buffered {
        async fn invoke(&self, _request: InvokeRequest) -> Result<InvokeOutcome, TransportError> {
            Ok(self.0.clone())
        }

        async fn cancel(&self, _execution_id: Uuid) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn request() -> InvokeRequest {
        InvokeRequest {
            execution_id: Uuid::new_v4(),
            agent_id: "agent1".into(),
            prompt: "do the thing".into(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn default_stream_adapter_buffers_invoke() {
        let transport = Buffered(InvokeOutcome {
            output: Some("hello".into()),
            tokens_used: 7,
            exit_code: Some(0),
            error: None,
            tool_calls: vec![],
        });

        let mut stream = transport.invoke_stream(request()).await.unwrap();
        match stream.next().await.unwrap().unwrap() {
            AgentEvent::Delta(delta) => assert_eq!(delta, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.next().await.unwrap().unwrap() {
            AgentEvent::Done { tokens_used, .. } => assert_eq!(tokens_used, 7),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn default_stream_adapter_surfaces_agent_error() {
        let transport = Buffered(InvokeOutcome {
            error: Some("agent crashed".into()),
            ..InvokeOutcome::default()
        });
        let result = transport.invoke_stream(request()).await;
        assert!(matches!(result, Err(TransportError::Request { .. })));
    }

    #[test]
    fn invoke_outcome_deserializes_sparse_body() {
        let outcome: InvokeOutcome = serde_json::from_str(r#"{"output": "done"}"#).unwrap();
        assert_eq!(outcome.output.as_deref(), Some("done"));
        assert_eq!(outcome.tokens_used, 0);
        assert!(outcome.error.is_none());
        assert!(outcome.tool_calls.is_empty());
    }
}
