//! Chat streaming over the hub — `start`, `chunk`, `end` in strict order.

use std::sync::Arc;

use futures::StreamExt;
use uuid::Uuid;

use crate::error::TransportError;
use crate::events::hub::{EventHub, HubEvent, ToolInvocation, Topic};
use crate::exec::transport::{AgentEvent, AgentStream};

/// Result of a fully streamed chat message.
#[derive(Debug, Clone)]
pub struct StreamedMessage {
    /// Final message content.
    pub content: String,
    /// Tokens consumed by the agent.
    pub tokens_used: u64,
    /// Agent process exit code, when reported.
    pub exit_code: Option<i32>,
    /// Tool calls made while producing the message.
    pub tool_calls: Vec<ToolInvocation>,
}

/// Publishes a chat message's token stream to `chat:<session>` observers.
pub struct ChatStreamer {
    hub: Arc<EventHub>,
}

impl ChatStreamer {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }

    /// Drain `deltas`, publishing exactly one `chat_start`, one `chat_chunk`
    /// per delta (each carrying the accumulated content so far), and one
    /// `chat_end`. A mid-stream transport error aborts without `chat_end`;
    /// the caller reports the failure through the execution events.
    pub async fn stream(
        &self,
        session_id: &str,
        message_id: Uuid,
        mut deltas: AgentStream,
    ) -> Result<StreamedMessage, TransportError> {
        let topic = Topic::Chat(session_id.to_string());

        self.hub.publish(
            &topic,
            HubEvent::ChatStart {
                session_id: session_id.to_string(),
                message_id,
            },
        );

        let mut accumulated = String::new();
        let mut tool_calls = Vec::new();
        let mut tokens_used = 0;
        let mut exit_code = None;

        while let Some(item) = deltas.next().await {
            match item? {
                AgentEvent::Delta(delta) => {
                    accumulated.push_str(&delta);
                    self.hub.publish(
                        &topic,
                        HubEvent::ChatChunk {
                            session_id: session_id.to_string(),
                            message_id,
                            delta,
                            accumulated: accumulated.clone(),
                        },
                    );
                }
                AgentEvent::ToolCall(call) => tool_calls.push(call),
                AgentEvent::Done {
                    tokens_used: tokens,
                    exit_code: code,
                } => {
                    tokens_used = tokens;
                    exit_code = code;
                }
            }
        }

        self.hub.publish(
            &topic,
            HubEvent::ChatEnd {
                session_id: session_id.to_string(),
                message_id,
                content: accumulated.clone(),
                tool_calls: tool_calls.clone(),
            },
        );

        Ok(StreamedMessage {
            content: accumulated,
            tokens_used,
            exit_code,
            tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(events: Vec<AgentEvent>) -> AgentStream {
        Box::pin(futures::stream::iter(events.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn publishes_start_chunks_end_in_order() {
        let hub = Arc::new(EventHub::new());
        let mut sub = hub.subscribe(Topic::Chat("s1".into()));
        let streamer = ChatStreamer::new(Arc::clone(&hub));
        let message_id = Uuid::new_v4();

        let deltas = stream_of(vec![
            AgentEvent::Delta("hel".into()),
            AgentEvent::Delta("lo".into()),
            AgentEvent::Done {
                tokens_used: 3,
                exit_code: Some(0),
            },
        ]);

        let message = streamer.stream("s1", message_id, deltas).await.unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(message.tokens_used, 3);

        assert!(matches!(
            sub.recv().await.unwrap(),
            HubEvent::ChatStart { .. }
        ));

        // Each accumulated value is a prefix-extension of the previous.
        let mut previous = String::new();
        for expected_delta in ["hel", "lo"] {
            match sub.recv().await.unwrap() {
                HubEvent::ChatChunk {
                    delta, accumulated, ..
                } => {
                    assert_eq!(delta, expected_delta);
                    assert!(accumulated.starts_with(&previous));
                    assert_eq!(accumulated, format!("{previous}{delta}"));
                    previous = accumulated;
                }
                other => panic!("expected chunk, got {other:?}"),
            }
        }

        match sub.recv().await.unwrap() {
            HubEvent::ChatEnd { content, .. } => assert_eq!(content, "hello"),
            other => panic!("expected end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_carries_tool_invocations() {
        let hub = Arc::new(EventHub::new());
        let mut sub = hub.subscribe(Topic::Chat("s2".into()));
        let streamer = ChatStreamer::new(Arc::clone(&hub));

        let call = ToolInvocation {
            name: "search".into(),
            input: serde_json::json!({"query": "weather"}),
            output: Some("sunny".into()),
        };
        let deltas = stream_of(vec![
            AgentEvent::Delta("ok".into()),
            AgentEvent::ToolCall(call.clone()),
            AgentEvent::Done {
                tokens_used: 1,
                exit_code: None,
            },
        ]);

        let message = streamer.stream("s2", Uuid::new_v4(), deltas).await.unwrap();
        assert_eq!(message.tool_calls, vec![call.clone()]);

        // start, chunk, then end with the tool record.
        sub.recv().await.unwrap();
        sub.recv().await.unwrap();
        match sub.recv().await.unwrap() {
            HubEvent::ChatEnd { tool_calls, .. } => assert_eq!(tool_calls, vec![call]),
            other => panic!("expected end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn midstream_error_aborts_without_end() {
        let hub = Arc::new(EventHub::new());
        let mut sub = hub.subscribe(Topic::Chat("s3".into()));
        let streamer = ChatStreamer::new(Arc::clone(&hub));

        let deltas: AgentStream = Box::pin(futures::stream::iter(vec![
            Ok(AgentEvent::Delta("par".into())),
            Err(TransportError::Request {
                reason: "connection reset".into(),
            }),
        ]));

        let result = streamer.stream("s3", Uuid::new_v4(), deltas).await;
        assert!(result.is_err());

        assert!(matches!(
            sub.recv().await.unwrap(),
            HubEvent::ChatStart { .. }
        ));
        assert!(matches!(
            sub.recv().await.unwrap(),
            HubEvent::ChatChunk { .. }
        ));
        assert!(sub.try_recv().is_none());
    }
}
