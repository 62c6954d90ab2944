//! Stream Command
//!
//! Send one command over the WebSocket channel and print what comes back.
//! Useful for checking a backend's streaming handler in isolation.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use serde_json::Value;
use tracing::debug;

use crate::cli::ui::Output;
use crate::config::Config;
use crate::constants::network;
use crate::protocol::{Command, StreamAction, StreamEvent};
use crate::stream::{SessionEvent, StreamSession, WsConnector};
use crate::types::{ErrorClassifier, FlowError, Result, SessionId};

pub async fn run(config: &Config, action: StreamAction, session_id: SessionId, data: Value) -> Result<()> {
    let output = Output::new();
    let connector = WsConnector::new(
        config.stream.url.clone(),
        config.api.bearer_token(),
        Duration::from_secs(network::CONNECTION_TIMEOUT_SECS),
    );
    let mut session = StreamSession::new(Arc::new(connector), &config.stream);
    let command = Command::new(action, session_id, data);

    session.connect();
    let cancel = session.cancel_handle();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let result = loop {
        let Some(event) = session.next_event().await else {
            break Err(ErrorClassifier::classify_no_response(Some("stream ended before completion")));
        };

        match event {
            SessionEvent::Opened { epoch } => {
                debug!(epoch, "Stream opened");
                if !session.send(&command).await {
                    output.warning("Command not sent; waiting for reconnect");
                }
            }
            SessionEvent::Reconnecting { attempt, delay } => {
                output.warning(&format!("Connection lost, retrying in {:?} (attempt {})", delay, attempt));
            }
            SessionEvent::Event { epoch, .. } if epoch != session.current_epoch() => {}
            SessionEvent::Event { event, .. } => match event {
                StreamEvent::Chunk { content, .. } => print!("{}", content),
                StreamEvent::Progress { percent, metadata } => {
                    let step = metadata.and_then(|m| m.step).unwrap_or_default();
                    println!("{} {:>3}% {}", style("…").dim(), percent, style(step).dim());
                }
                StreamEvent::Done { payload, .. } => {
                    session.close().await;
                    println!();
                    if let Some(payload) = payload {
                        println!("{}", serde_json::to_string_pretty(&payload)?);
                    }
                    break Ok(());
                }
                StreamEvent::Error { code, message, .. } => {
                    session.close().await;
                    break Err(ErrorClassifier::classify(&code, None).with_detail(message));
                }
            },
            SessionEvent::Closed { reason: Some(error) } => break Err(error),
            SessionEvent::Closed { reason: None } if cancel.is_cancelled() => {
                break Err(ErrorClassifier::classify_no_response(Some("interrupted")));
            }
            SessionEvent::Closed { reason: None } => {
                break Err(ErrorClassifier::classify_no_response(None));
            }
        }
    };

    interrupt.abort();
    match result {
        Ok(()) => {
            output.success(&format!("{} finished", command.action));
            Ok(())
        }
        Err(error) => {
            output.failure(&error);
            Err(FlowError::Classified(error))
        }
    }
}
