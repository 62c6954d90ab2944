//! Streaming session lifecycle
//!
//! One persistent connection with bounded, fixed-interval reconnects. Events
//! are pulled with [`StreamSession::next_event`] and stamped with the epoch of
//! the connection they arrived on; the epoch increments on every successful
//! (re)connect so consumers can drop anything from an older connection.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──ok──▶ Open ──drop/error──▶ Reconnecting ──wait──▶ Connecting
//!                        │                 │                       │
//!                        └──fail──▶ Reconnecting                   └──exhausted──▶ Closed
//!                                          └──close / fatal error──▶ Closing ──▶ Closed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBackoff, ConstantBuilder};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{Connection, Connector, Frame};
use crate::config::StreamConfig;
use crate::protocol::{Command, MessageCodec, StreamEvent};
use crate::types::{ClassifiedError, ErrorClassifier, codes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What a consumer observes from the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A connection is open; later events carry this epoch
    Opened { epoch: u64 },
    Event { epoch: u64, event: StreamEvent },
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal. `reason` is set when the session gave up or hit a fatal error.
    Closed { reason: Option<ClassifiedError> },
}

pub struct StreamSession {
    connector: Arc<dyn Connector>,
    max_reconnect_attempts: u32,
    reconnect_interval: Duration,
    state: SessionState,
    conn: Option<Box<dyn Connection>>,
    epoch: u64,
    reconnect_attempts: u32,
    backoff: Option<ConstantBackoff>,
    pending_delay: Duration,
    cancel: CancellationToken,
    pending: VecDeque<SessionEvent>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish()
    }
}

impl StreamSession {
    pub fn new(connector: Arc<dyn Connector>, config: &StreamConfig) -> Self {
        Self {
            connector,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_interval: config.reconnect_interval(),
            state: SessionState::Idle,
            conn: None,
            epoch: 0,
            reconnect_attempts: 0,
            backoff: None,
            pending_delay: Duration::ZERO,
            cancel: CancellationToken::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Epoch of the current connection; 0 before the first open
    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Token that closes the session from another task.
    ///
    /// A new token is issued when a closed session is connected again.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Begin connecting. No-op unless the session is idle or closed.
    pub fn connect(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Closed => {
                if self.cancel.is_cancelled() {
                    self.cancel = CancellationToken::new();
                }
                self.pending.clear();
                self.reconnect_attempts = 0;
                self.backoff = None;
                self.state = SessionState::Connecting;
            }
            state => debug!(%state, "connect() ignored"),
        }
    }

    /// Send a command on the open connection.
    ///
    /// Returns `false` without queueing when the session is not open.
    pub async fn send(&mut self, command: &Command) -> bool {
        let conn = match self.conn.as_mut() {
            Some(conn) if self.state == SessionState::Open => conn,
            _ => {
                warn!(state = %self.state, action = %command.action, "Dropping send on a session that is not open");
                return false;
            }
        };

        let text = match MessageCodec::encode(command) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode command: {}", e);
                return false;
            }
        };

        match conn.send_text(text).await {
            Ok(()) => {
                debug!(action = %command.action, epoch = self.epoch, "Command sent");
                true
            }
            Err(e) => {
                warn!(action = %command.action, "Send failed: {}", e);
                false
            }
        }
    }

    /// Close the session and cancel any pending reconnect. Idempotent.
    pub async fn close(&mut self) {
        if matches!(self.state, SessionState::Closed | SessionState::Closing) {
            return;
        }
        self.shutdown(None).await;
    }

    /// Pull the next event, driving the connection as needed.
    ///
    /// Returns `None` after `Closed` has been delivered or before `connect()`.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            match self.state {
                SessionState::Idle | SessionState::Closed => return None,
                SessionState::Closing => self.shutdown(None).await,
                SessionState::Connecting => self.establish().await,
                SessionState::Reconnecting => self.wait_for_retry().await,
                SessionState::Open => self.read_frame().await,
            }
        }
    }

    /// Adapt the session into a stream that ends after `Closed`
    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> + Send {
        futures::stream::unfold(self, |mut session| async move {
            session.next_event().await.map(|event| (event, session))
        })
    }

    async fn establish(&mut self) {
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.connector.connect() => Some(result),
        };

        match outcome {
            None => self.shutdown(None).await,
            Some(Ok(conn)) => {
                self.conn = Some(conn);
                self.epoch += 1;
                self.reconnect_attempts = 0;
                self.backoff = None;
                self.state = SessionState::Open;
                info!(epoch = self.epoch, "Stream connected");
                self.pending.push_back(SessionEvent::Opened { epoch: self.epoch });
            }
            Some(Err(e)) => {
                warn!("Stream connect failed: {}", e);
                self.schedule_reconnect(e.classify()).await;
            }
        }
    }

    async fn wait_for_retry(&mut self) {
        let cancel = self.cancel.clone();
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.pending_delay) => false,
        };

        if cancelled {
            self.shutdown(None).await;
        } else {
            self.state = SessionState::Connecting;
        }
    }

    async fn read_frame(&mut self) {
        let cancel = self.cancel.clone();
        let Some(conn) = self.conn.as_mut() else {
            self.state = SessionState::Connecting;
            return;
        };

        let received = tokio::select! {
            _ = cancel.cancelled() => None,
            frame = conn.recv() => Some(frame),
        };

        let frame = match received {
            None => return self.shutdown(None).await,
            Some(None) => {
                info!(epoch = self.epoch, "Stream closed by peer");
                return self
                    .schedule_reconnect(ErrorClassifier::classify_no_response(Some("closed by peer")))
                    .await;
            }
            Some(Some(Err(e))) => {
                warn!(epoch = self.epoch, "Stream transport error: {}", e);
                return self.schedule_reconnect(e.classify()).await;
            }
            Some(Some(Ok(frame))) => frame,
        };

        let decoded = match &frame {
            Frame::Text(text) => MessageCodec::decode(text),
            Frame::Binary(bytes) => MessageCodec::decode_bytes(bytes),
        };

        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                warn!(epoch = self.epoch, "Dropping undecodable frame: {}", e);
                return;
            }
        };
        debug!(epoch = self.epoch, kind = event.kind(), "Frame received");

        let fatal = match &event {
            StreamEvent::Error { code, message, .. } => {
                let classified = ErrorClassifier::classify(code, None).with_detail(message.clone());
                (!classified.is_retryable()).then_some(classified)
            }
            _ => None,
        };

        self.pending.push_back(SessionEvent::Event {
            epoch: self.epoch,
            event,
        });

        if let Some(reason) = fatal {
            warn!(code = reason.code(), "Non-retryable stream error, closing");
            self.shutdown(Some(reason)).await;
        }
    }

    /// Move to Reconnecting, or close once attempts are used up
    async fn schedule_reconnect(&mut self, cause: ClassifiedError) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }

        let interval = self.reconnect_interval;
        let max = self.max_reconnect_attempts;
        let backoff = self.backoff.get_or_insert_with(|| {
            ConstantBuilder::default()
                .with_delay(interval)
                .with_max_times(max as usize)
                .build()
        });

        let delay = if self.reconnect_attempts < max {
            backoff.next()
        } else {
            None
        };

        match delay {
            Some(delay) => {
                self.reconnect_attempts += 1;
                self.pending_delay = delay;
                self.state = SessionState::Reconnecting;
                warn!(
                    attempt = self.reconnect_attempts,
                    max,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting stream"
                );
                self.pending.push_back(SessionEvent::Reconnecting {
                    attempt: self.reconnect_attempts,
                    delay,
                });
            }
            None => {
                let reason = ErrorClassifier::classify(codes::STREAM_RECONNECT_EXHAUSTED, None)
                    .with_detail(format!(
                        "gave up after {} reconnect attempts; last failure: {}",
                        self.reconnect_attempts,
                        cause.detail().unwrap_or(cause.message())
                    ));
                self.shutdown(Some(reason)).await;
            }
        }
    }

    async fn shutdown(&mut self, reason: Option<ClassifiedError>) {
        self.state = SessionState::Closing;
        self.cancel.cancel();
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.state = SessionState::Closed;
        self.backoff = None;

        match &reason {
            Some(reason) => warn!(epoch = self.epoch, "Stream closed: {}", reason),
            None => info!(epoch = self.epoch, "Stream closed"),
        }
        self.pending.push_back(SessionEvent::Closed { reason });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::StreamAction;
    use crate::types::{FlowError, Result, SessionId, Severity};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One scripted connection: frames to deliver, then how it ends
    #[derive(Clone, Default)]
    pub(crate) struct Script {
        pub frames: Vec<String>,
        /// Peer closes after the frames instead of staying open
        pub drop_after: bool,
    }

    impl Script {
        pub fn open(frames: &[&str]) -> Self {
            Self {
                frames: frames.iter().map(|f| f.to_string()).collect(),
                drop_after: false,
            }
        }

        pub fn dropping(frames: &[&str]) -> Self {
            Self {
                drop_after: true,
                ..Self::open(frames)
            }
        }
    }

    /// Connector that replays scripts in order; `None` entries fail to connect
    #[derive(Default)]
    pub(crate) struct ScriptedConnector {
        scripts: Mutex<VecDeque<Option<Script>>>,
        pub attempts: AtomicUsize,
        pub sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedConnector {
        pub fn new(scripts: Vec<Option<Script>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    struct ScriptedConnection {
        frames: VecDeque<String>,
        drop_after: bool,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.scripts.lock().unwrap().pop_front().flatten() {
                Some(script) => Ok(Box::new(ScriptedConnection {
                    frames: script.frames.into(),
                    drop_after: script.drop_after,
                    sent: self.sent.clone(),
                })),
                None => Err(FlowError::WebSocket("connection refused".to_string())),
            }
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn send_text(&mut self, text: String) -> Result<()> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<Frame>> {
            match self.frames.pop_front() {
                Some(text) => Some(Ok(Frame::Text(text))),
                None if self.drop_after => None,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    fn config(max: u32) -> StreamConfig {
        StreamConfig {
            max_reconnect_attempts: max,
            ..StreamConfig::default()
        }
    }

    const CHUNK: &str = r#"{"type":"chunk","content":"ab"}"#;

    #[tokio::test(start_paused = true)]
    async fn test_open_and_receive_with_epoch() {
        let connector = ScriptedConnector::new(vec![Some(Script::open(&[
            CHUNK,
            "not json",
            r#"{"type":"done"}"#,
        ]))]);
        let mut session = StreamSession::new(connector.clone(), &config(5));
        assert_eq!(session.next_event().await, None);

        session.connect();
        assert_eq!(session.next_event().await, Some(SessionEvent::Opened { epoch: 1 }));
        assert_eq!(session.state(), SessionState::Open);

        // Undecodable frame is skipped
        let first = session.next_event().await.unwrap();
        assert!(matches!(first, SessionEvent::Event { epoch: 1, event: StreamEvent::Chunk { .. } }));
        let second = session.next_event().await.unwrap();
        assert!(matches!(second, SessionEvent::Event { epoch: 1, event: StreamEvent::Done { .. } }));
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_increments_epoch() {
        let connector = ScriptedConnector::new(vec![
            Some(Script::dropping(&[CHUNK])),
            Some(Script::open(&[CHUNK])),
        ]);
        let mut session = StreamSession::new(connector.clone(), &config(5));
        session.connect();

        let events: Vec<_> = {
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(session.next_event().await.unwrap());
            }
            out
        };

        assert_eq!(events[0], SessionEvent::Opened { epoch: 1 });
        assert!(matches!(events[1], SessionEvent::Event { epoch: 1, .. }));
        assert_eq!(
            events[2],
            SessionEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(3000)
            }
        );
        assert_eq!(events[3], SessionEvent::Opened { epoch: 2 });
        assert!(matches!(events[4], SessionEvent::Event { epoch: 2, .. }));
        assert_eq!(session.reconnect_attempts(), 0);
        assert_eq!(session.current_epoch(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_closes_fatally() {
        let connector = ScriptedConnector::new(vec![Some(Script::dropping(&[]))]);
        let mut session = StreamSession::new(connector.clone(), &config(5));
        session.connect();
        assert_eq!(session.next_event().await, Some(SessionEvent::Opened { epoch: 1 }));

        let started = tokio::time::Instant::now();
        let mut attempts = Vec::new();
        let reason = loop {
            match session.next_event().await.unwrap() {
                SessionEvent::Reconnecting { attempt, delay } => {
                    assert_eq!(delay, Duration::from_millis(3000));
                    attempts.push(attempt);
                }
                SessionEvent::Closed { reason } => break reason.unwrap(),
                other => panic!("unexpected event: {other:?}"),
            }
        };

        assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
        assert_eq!(reason.code(), codes::STREAM_RECONNECT_EXHAUSTED);
        assert_eq!(reason.severity(), Severity::Fatal);
        assert!(started.elapsed() >= Duration::from_millis(15_000));
        assert!(started.elapsed() < Duration::from_millis(16_000));
        // Initial connect plus five retries
        assert_eq!(connector.attempts(), 6);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_frame_closes() {
        let connector = ScriptedConnector::new(vec![Some(Script::dropping(&[
            r#"{"type":"error","error":"missing scenarios","error_code":"VALIDATION_ERROR"}"#,
        ]))]);
        let mut session = StreamSession::new(connector.clone(), &config(5));
        session.connect();
        session.next_event().await;

        assert!(matches!(
            session.next_event().await,
            Some(SessionEvent::Event { event: StreamEvent::Error { .. }, .. })
        ));
        match session.next_event().await {
            Some(SessionEvent::Closed { reason: Some(reason) }) => {
                assert_eq!(reason.code(), codes::VALIDATION_ERROR);
                assert_eq!(reason.detail(), Some("missing scenarios"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_frame_keeps_connection() {
        let connector = ScriptedConnector::new(vec![Some(Script::open(&[
            r#"{"type":"error","error":"upstream","error_code":"LLM_API_ERROR"}"#,
            CHUNK,
        ]))]);
        let mut session = StreamSession::new(connector, &config(5));
        session.connect();
        session.next_event().await;
        session.next_event().await;

        assert!(matches!(
            session.next_event().await,
            Some(SessionEvent::Event { event: StreamEvent::Chunk { .. }, .. })
        ));
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_only_when_open() {
        let connector = ScriptedConnector::new(vec![Some(Script::open(&[]))]);
        let mut session = StreamSession::new(connector.clone(), &config(5));
        let command = Command::new(
            StreamAction::Scenario,
            SessionId::from("s-1"),
            serde_json::json!({}),
        );

        assert!(!session.send(&command).await);
        session.connect();
        assert!(!session.send(&command).await);

        session.next_event().await;
        assert!(session.send(&command).await);
        assert_eq!(connector.sent().len(), 1);
        assert!(connector.sent()[0].contains("\"action\":\"scenario\""));

        // Already open
        session.connect();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_reconnect() {
        let connector = ScriptedConnector::new(vec![Some(Script::dropping(&[]))]);
        let mut session = StreamSession::new(connector.clone(), &config(5));
        session.connect();
        session.next_event().await;
        assert!(matches!(
            session.next_event().await,
            Some(SessionEvent::Reconnecting { attempt: 1, .. })
        ));

        session.close().await;
        session.close().await;
        assert_eq!(session.next_event().await, Some(SessionEvent::Closed { reason: None }));
        assert_eq!(session.next_event().await, None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_handle_from_another_task() {
        let connector = ScriptedConnector::new(vec![Some(Script::open(&[]))]);
        let mut session = StreamSession::new(connector, &config(5));
        session.connect();
        session.next_event().await;

        let handle = session.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        assert_eq!(session.next_event().await, Some(SessionEvent::Closed { reason: None }));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_into_stream_ends_after_closed() {
        let connector = ScriptedConnector::new(vec![Some(Script::dropping(&[CHUNK]))]);
        let mut session = StreamSession::new(connector, &config(0));
        session.connect();

        let events: Vec<SessionEvent> = session.into_stream().collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], SessionEvent::Event { epoch: 1, .. }));
        assert!(matches!(
            &events[2],
            SessionEvent::Closed { reason: Some(r) } if r.code() == codes::STREAM_RECONNECT_EXHAUSTED
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_close() {
        let connector = ScriptedConnector::new(vec![Some(Script::open(&[])), Some(Script::open(&[]))]);
        let mut session = StreamSession::new(connector.clone(), &config(5));
        session.connect();
        session.next_event().await;
        session.close().await;
        assert!(matches!(session.next_event().await, Some(SessionEvent::Closed { .. })));

        session.connect();
        assert!(!session.cancel_handle().is_cancelled());
        assert_eq!(session.next_event().await, Some(SessionEvent::Opened { epoch: 2 }));
    }
}
