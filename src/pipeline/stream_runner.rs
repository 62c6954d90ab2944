//! Runs one stage's unit of work over a [`StreamSession`]
//!
//! The command is (re)sent on every `Opened`, so a reconnect restarts the work
//! on the new connection. Chunks from an older epoch are dropped and the text
//! buffer is reset per connection.

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PipelineEvent, Stage};
use crate::protocol::{Command, StreamEvent};
use crate::stream::{SessionEvent, StreamSession};
use crate::types::{ClassifiedError, ErrorClassifier, codes};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunFailure {
    Cancelled,
    Failed(ClassifiedError),
}

pub(crate) async fn run(
    session: &mut StreamSession,
    command: &Command,
    stage: Stage,
    events: &broadcast::Sender<PipelineEvent>,
    cancel: &CancellationToken,
) -> Result<Value, RunFailure> {
    session.connect();
    let mut buffer = String::new();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            event = session.next_event() => Some(event),
        };

        let event = match next {
            None => {
                info!(%stage, "Streamed stage cancelled");
                session.close().await;
                return Err(RunFailure::Cancelled);
            }
            Some(None) => {
                return Err(RunFailure::Failed(ErrorClassifier::classify_no_response(Some(
                    "stream ended before completion",
                ))));
            }
            Some(Some(event)) => event,
        };

        match event {
            SessionEvent::Opened { epoch } => {
                buffer.clear();
                if !session.send(command).await {
                    warn!(%stage, epoch, "Command not sent; waiting for reconnect");
                }
            }
            SessionEvent::Event { epoch, .. } if epoch != session.current_epoch() => {
                debug!(%stage, epoch, current = session.current_epoch(), "Dropping stale event");
            }
            SessionEvent::Event { event, .. } => match event {
                StreamEvent::Chunk { content, .. } => {
                    buffer.push_str(&content);
                    let _ = events.send(PipelineEvent::Chunk { stage, content });
                }
                StreamEvent::Progress { percent, metadata } => {
                    let _ = events.send(PipelineEvent::Progress {
                        stage,
                        percent,
                        step: metadata.and_then(|m| m.step),
                    });
                }
                StreamEvent::Done { payload, .. } => {
                    session.close().await;
                    return match payload {
                        Some(payload) => Ok(payload),
                        None => parse_buffer(&buffer).map_err(RunFailure::Failed),
                    };
                }
                StreamEvent::Error { code, message, .. } => {
                    session.close().await;
                    return Err(RunFailure::Failed(
                        ErrorClassifier::classify(&code, None).with_detail(message),
                    ));
                }
            },
            SessionEvent::Reconnecting { attempt, .. } => {
                let _ = events.send(PipelineEvent::Reconnecting { stage, attempt });
            }
            SessionEvent::Closed { reason } => {
                return Err(RunFailure::Failed(reason.unwrap_or_else(|| {
                    ErrorClassifier::classify_no_response(Some("stream closed before completion"))
                })));
            }
        }
    }
}

/// A `done` without payload means the chunks themselves were the JSON result
fn parse_buffer(buffer: &str) -> Result<Value, ClassifiedError> {
    serde_json::from_str(buffer.trim()).map_err(|e| {
        ErrorClassifier::classify(codes::INVALID_PAYLOAD, None)
            .with_detail(format!("streamed output is not JSON: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::protocol::StreamAction;
    use crate::stream::{Script, ScriptedConnector};
    use crate::types::{SessionId, Severity};
    use serde_json::json;

    fn command() -> Command {
        Command::new(StreamAction::Case, SessionId::from("s-1"), json!({"scenarios": []}))
    }

    fn session(connector: std::sync::Arc<ScriptedConnector>, max: u32) -> StreamSession {
        StreamSession::new(
            connector,
            &StreamConfig {
                max_reconnect_attempts: max,
                ..StreamConfig::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_payload_wins() {
        let connector = ScriptedConnector::new(vec![Some(Script::open(&[
            r#"{"type":"progress","metadata":{"step":"start","progress":10}}"#,
            r#"{"type":"chunk","content":"partial"}"#,
            r#"{"type":"done","content":{"test_cases":[]}}"#,
        ]))]);
        let (tx, mut rx) = broadcast::channel(16);
        let mut session = session(connector.clone(), 5);

        let value = run(&mut session, &command(), Stage::Cases, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(value, json!({"test_cases": []}));
        assert_eq!(connector.sent().len(), 1);
        assert!(matches!(rx.try_recv().unwrap(), PipelineEvent::Progress { percent: 10, .. }));
        assert!(matches!(rx.try_recv().unwrap(), PipelineEvent::Chunk { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_assemble_result_after_reconnect() {
        // First connection drops mid-output; its chunk must not leak into the result
        let connector = ScriptedConnector::new(vec![
            Some(Script::dropping(&[r#"{"type":"chunk","content":"{\"files\":"}"#])),
            Some(Script::open(&[
                r#"{"type":"chunk","content":"{\"files\":"}"#,
                r#"{"type":"chunk","content":"{\"a.py\":\"x\"}}"}"#,
                r#"{"type":"done"}"#,
            ])),
        ]);
        let (tx, mut rx) = broadcast::channel(16);
        let mut session = session(connector.clone(), 5);

        let value = run(&mut session, &command(), Stage::Code, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(value, json!({"files": {"a.py": "x"}}));
        // Command resent on the new connection
        assert_eq!(connector.sent().len(), 2);
        let reconnects = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, PipelineEvent::Reconnecting { attempt: 1, .. }))
            .count();
        assert_eq!(reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_frame_fails_with_code() {
        let connector = ScriptedConnector::new(vec![Some(Script::open(&[
            r#"{"type":"error","error":"model overloaded","error_code":"LLM_API_ERROR"}"#,
        ]))]);
        let (tx, _rx) = broadcast::channel(16);
        let mut session = session(connector, 5);

        let failure = run(&mut session, &command(), Stage::Cases, &tx, &CancellationToken::new())
            .await
            .unwrap_err();

        let RunFailure::Failed(error) = failure else {
            panic!("expected failure");
        };
        assert_eq!(error.code(), codes::LLM_API_ERROR);
        assert!(error.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnects_are_fatal() {
        let connector = ScriptedConnector::new(vec![None, None, None]);
        let (tx, _rx) = broadcast::channel(16);
        let mut session = session(connector, 2);

        let failure = run(&mut session, &command(), Stage::Cases, &tx, &CancellationToken::new())
            .await
            .unwrap_err();

        let RunFailure::Failed(error) = failure else {
            panic!("expected failure");
        };
        assert_eq!(error.code(), codes::STREAM_RECONNECT_EXHAUSTED);
        assert_eq!(error.severity(), Severity::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_closes_session() {
        let connector = ScriptedConnector::new(vec![Some(Script::open(&[]))]);
        let (tx, _rx) = broadcast::channel(16);
        let mut session = session(connector, 5);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let failure = run(&mut session, &command(), Stage::Cases, &tx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(failure, RunFailure::Cancelled);
        assert_eq!(session.state(), crate::stream::SessionState::Closed);
    }

    #[test]
    fn test_unparseable_buffer_is_transient() {
        let error = parse_buffer("{\"files\":").unwrap_err();
        assert_eq!(error.code(), codes::INVALID_PAYLOAD);
        assert!(error.is_retryable());
    }
}
