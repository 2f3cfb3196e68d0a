use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{info, warn};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::models::websocket::ServerEvent;

/// Delay schedule and retry bound for reconnect attempts.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): the base doubled
    /// per attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// One frame delivered by a push connection.
#[derive(Debug)]
pub enum PushFrame {
    Event(ServerEvent),
    Closed {
        code: u16,
    },
}

#[async_trait]
pub trait PushConnection: Send {
    /// Next frame, or None once the peer is gone without any close frame.
    async fn next_frame(&mut self) -> Option<PushFrame>;
    async fn close(&mut self);
}

/// How the client reaches the server. Swapped for a scripted fake in tests,
/// so the reconnect loop is exercised without any network.
#[async_trait]
pub trait PushTransport: Send {
    type Conn: PushConnection;
    async fn connect(&mut self, url: &str) -> Result<Self::Conn, Box<dyn Error + Send + Sync>>;
}

pub struct WebSocketTransport;

pub struct WebSocketConnection {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    type Conn = WebSocketConnection;

    async fn connect(&mut self, url: &str) -> Result<Self::Conn, Box<dyn Error + Send + Sync>> {
        let (ws, _) = connect_async(url).await?;
        Ok(WebSocketConnection { inner: ws })
    }
}

#[async_trait]
impl PushConnection for WebSocketConnection {
    async fn next_frame(&mut self) -> Option<PushFrame> {
        while let Some(message) = self.inner.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            return Some(PushFrame::Event(event));
                        }
                        Err(e) => warn!("Discarding malformed push event: {}", e),
                    }
                }
                Ok(Message::Close(frame)) => {
                    // 1005 marks a close frame that carried no status code
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                    return Some(PushFrame::Closed { code });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Push channel read error: {}", e);
                    return Some(PushFrame::Closed { code: 1006 });
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// Lets another task ask a running client to shut down cleanly. The next
/// reconnect wait is also cut short.
#[derive(Clone)]
pub struct DisconnectHandle {
    shutdown: watch::Sender<bool>,
}

impl DisconnectHandle {
    pub fn disconnect(&self) {
        self.shutdown.send_replace(true);
    }
}

type EventHandler = Box<dyn Fn(&ServerEvent) + Send + Sync>;

/// Client half of the push channel. Connects, dispatches events to the
/// registered handlers, and reconnects with doubling delays after abnormal
/// closes. The delay schedule restarts once a connect succeeds, but the
/// client only keeps retrying while connections actually deliver: after
/// `max_attempts` failures in a row without a single received event it
/// gives up for good. A close with code 1000 or 1001 ends the client
/// without any reconnect.
pub struct ClientSync<T: PushTransport> {
    transport: T,
    url: String,
    backoff: BackoffPolicy,
    handlers: Vec<EventHandler>,
    state_tx: watch::Sender<SyncState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ClientSync<WebSocketTransport> {
    pub fn over_websocket(
        url: &str,
        backoff: BackoffPolicy
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Self::new(WebSocketTransport, url, backoff)
    }
}

impl<T: PushTransport> ClientSync<T> {
    pub fn new(
        transport: T,
        url: &str,
        backoff: BackoffPolicy
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let parsed = Url::parse(url)?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(format!("unsupported push channel scheme: '{}'", other).into());
            }
        }
        let (state_tx, _) = watch::channel(SyncState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            transport,
            url: url.to_string(),
            backoff,
            handlers: Vec::new(),
            state_tx,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Handlers run in registration order for every received event.
    pub fn on_event(&mut self, handler: impl Fn(&ServerEvent) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn disconnect_handle(&self) -> DisconnectHandle {
        DisconnectHandle {
            shutdown: self.shutdown_tx.clone(),
        }
    }

    fn set_state(&self, state: SyncState) {
        self.state_tx.send_replace(state);
    }

    fn dispatch(&self, event: &ServerEvent) {
        for handler in &self.handlers {
            handler(event);
        }
    }

    /// Drives the connection until a normal close, a disconnect request, or
    /// too many failures in a row. Always leaves the state at Disconnected.
    pub async fn run(mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut shutdown = self.shutdown_rx.clone();
        // `attempt` sizes the next delay and restarts whenever a connect
        // succeeds. `failures` decides when to give up and is only cleared
        // once a connection has delivered an event, so a server that accepts
        // the handshake and immediately drops us still burns the budget.
        let mut attempt: u32 = 0;
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                self.set_state(SyncState::Disconnected);
                return Ok(());
            }

            self.set_state(SyncState::Connecting);
            match self.transport.connect(&self.url).await {
                Ok(mut conn) => {
                    info!("Push channel connected: {}", self.url);
                    attempt = 0;
                    self.set_state(SyncState::Connected);

                    let code = loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                conn.close().await;
                                self.set_state(SyncState::Disconnected);
                                return Ok(());
                            }
                            frame = conn.next_frame() => match frame {
                                Some(PushFrame::Event(event)) => {
                                    failures = 0;
                                    self.dispatch(&event);
                                }
                                Some(PushFrame::Closed { code }) => break code,
                                None => break 1006,
                            }
                        }
                    };

                    if code == 1000 || code == 1001 {
                        info!("Push channel closed normally (code {})", code);
                        self.set_state(SyncState::Disconnected);
                        return Ok(());
                    }
                    warn!("Push channel closed abnormally (code {})", code);
                }
                Err(e) => {
                    warn!("Push channel connect failed: {}", e);
                }
            }

            attempt += 1;
            failures += 1;
            if failures >= self.backoff.max_attempts {
                warn!(
                    "Push channel gave up after {} failures in a row. Live updates are off until a new client is started.",
                    failures
                );
                self.set_state(SyncState::Disconnected);
                return Ok(());
            }

            let delay = self.backoff.delay_for(attempt);
            info!("Reconnecting push channel in {:?} (attempt {})", delay, attempt);
            self.set_state(SyncState::Reconnecting);
            tokio::select! {
                _ = shutdown.changed() => {
                    self.set_state(SyncState::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use chrono::Utc;
    use tokio::time::Instant;
    use crate::models::chat::Message as ChatMessage;

    struct FakeConn {
        frames: VecDeque<PushFrame>,
    }

    #[async_trait]
    impl PushConnection for FakeConn {
        async fn next_frame(&mut self) -> Option<PushFrame> {
            match self.frames.pop_front() {
                Some(frame) => Some(frame),
                // an exhausted script stands for a connection that stays open
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    struct FakeTransport {
        outcomes: VecDeque<Result<FakeConn, String>>,
        connect_times: Arc<StdMutex<Vec<Instant>>>,
    }

    impl FakeTransport {
        fn scripted(
            outcomes: Vec<Result<FakeConn, String>>
        ) -> (Self, Arc<StdMutex<Vec<Instant>>>) {
            let connect_times = Arc::new(StdMutex::new(Vec::new()));
            let transport = Self {
                outcomes: VecDeque::from(outcomes),
                connect_times: Arc::clone(&connect_times),
            };
            (transport, connect_times)
        }
    }

    #[async_trait]
    impl PushTransport for FakeTransport {
        type Conn = FakeConn;

        async fn connect(&mut self, _url: &str) -> Result<FakeConn, Box<dyn Error + Send + Sync>> {
            self.connect_times.lock().unwrap().push(Instant::now());
            match self.outcomes.pop_front() {
                Some(Ok(conn)) => Ok(conn),
                Some(Err(e)) => Err(e.into()),
                None => Err("connection refused".into()),
            }
        }
    }

    fn closing(code: u16) -> Result<FakeConn, String> {
        Ok(FakeConn {
            frames: VecDeque::from([PushFrame::Closed { code }]),
        })
    }

    fn sample_event() -> PushFrame {
        PushFrame::Event(ServerEvent::NewMessage {
            data: ChatMessage {
                id: 1,
                content: "新しい回答です。".to_string(),
                role: "assistant".to_string(),
                user_id: 1,
                chat_id: Some(1),
                timestamp: Utc::now(),
            },
        })
    }

    fn client(transport: FakeTransport) -> ClientSync<FakeTransport> {
        ClientSync::new(transport, "ws://localhost:5000/api/ws", BackoffPolicy::default()).unwrap()
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[test]
    fn only_websocket_urls_are_accepted() {
        let (transport, _) = FakeTransport::scripted(vec![]);
        let err = ClientSync::new(transport, "http://localhost:5000/api/ws", BackoffPolicy::default());
        assert!(err.is_err());

        let (transport, _) = FakeTransport::scripted(vec![]);
        assert!(ClientSync::new(transport, "wss://clinic.example/api/ws", BackoffPolicy::default()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_triggers_one_delayed_reconnect() {
        let (transport, times) = FakeTransport::scripted(vec![closing(1006), closing(1000)]);
        client(transport).run().await.unwrap();

        let times = times.lock().unwrap();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn normal_close_never_reconnects() {
        let (transport, times) = FakeTransport::scripted(vec![closing(1000)]);
        let sync = client(transport);
        let mut state = sync.watch_state();

        sync.run().await.unwrap();

        assert_eq!(times.lock().unwrap().len(), 1);
        assert_eq!(*state.borrow_and_update(), SyncState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn going_away_close_also_ends_the_client() {
        let (transport, times) = FakeTransport::scripted(vec![closing(1001)]);
        client(transport).run().await.unwrap();
        assert_eq!(times.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_consecutive_failures() {
        // an empty script refuses every connect
        let (transport, times) = FakeTransport::scripted(vec![]);
        let sync = client(transport);
        let mut state = sync.watch_state();

        sync.run().await.unwrap();

        let times = times.lock().unwrap();
        // attempts 1 through 5; the fifth failure exhausts the budget
        assert_eq!(times.len(), 5);
        assert!(times[1] - times[0] >= Duration::from_secs(1));
        assert!(times[2] - times[1] >= Duration::from_secs(2));
        assert!(times[3] - times[2] >= Duration::from_secs(4));
        assert!(times[4] - times[3] >= Duration::from_secs(8));
        assert_eq!(*state.borrow_and_update(), SyncState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn five_straight_abnormal_closes_exhaust_the_retries() {
        // every handshake succeeds, yet nothing is ever delivered; the
        // give-up bound must hold even though each connect resets the delay
        let (transport, times) = FakeTransport::scripted(
            vec![closing(1006), closing(1006), closing(1006), closing(1006), closing(1006)]
        );
        let sync = client(transport);
        let mut state = sync.watch_state();

        sync.run().await.unwrap();

        let times = times.lock().unwrap();
        assert_eq!(times.len(), 5);
        assert!(times[1] - times[0] >= Duration::from_secs(1));
        assert_eq!(*state.borrow_and_update(), SyncState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn a_delivering_connection_clears_the_give_up_count() {
        let delivering = || {
            Ok(FakeConn {
                frames: VecDeque::from([sample_event(), PushFrame::Closed { code: 1006 }]),
            })
        };
        // six drops in a row would exceed the bound, but each connection
        // got an event through first, so the client keeps coming back
        let scripted = vec![
            delivering(), delivering(), delivering(),
            delivering(), delivering(), delivering(),
            closing(1000),
        ];
        let (transport, times) = FakeTransport::scripted(scripted);
        client(transport).run().await.unwrap();

        assert_eq!(times.lock().unwrap().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn a_successful_connection_resets_the_backoff() {
        let scripted = vec![
            closing(1006),
            // reconnect succeeds, then drops again: the next delay is back to base
            closing(1006),
            closing(1000)
        ];
        let (transport, times) = FakeTransport::scripted(scripted);
        client(transport).run().await.unwrap();

        let times = times.lock().unwrap();
        assert_eq!(times.len(), 3);
        let second_delay = times[2] - times[1];
        assert!(second_delay >= Duration::from_secs(1));
        assert!(second_delay < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_every_handler_before_a_close() {
        let conn = FakeConn {
            frames: VecDeque::from([sample_event(), sample_event(), PushFrame::Closed {
                code: 1000,
            }]),
        };
        let (transport, _) = FakeTransport::scripted(vec![Ok(conn)]);
        let mut sync = client(transport);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sync.on_event(move |event| {
            let ServerEvent::NewMessage { data } = event;
            sink.lock().unwrap().push(data.content.clone());
        });

        sync.run().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], "新しい回答です。");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_request_closes_and_suppresses_reconnect() {
        let open_conn = FakeConn { frames: VecDeque::new() };
        let (transport, times) = FakeTransport::scripted(vec![Ok(open_conn)]);
        let sync = client(transport);
        let handle = sync.disconnect_handle();
        let mut state = sync.watch_state();

        let task = tokio::spawn(sync.run());
        state.wait_for(|s| *s == SyncState::Connected).await.unwrap();

        handle.disconnect();
        task.await.unwrap().unwrap();

        assert_eq!(times.lock().unwrap().len(), 1);
        assert_eq!(*state.borrow_and_update(), SyncState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_the_backoff_wait_ends_immediately() {
        let (transport, times) = FakeTransport::scripted(vec![closing(1006)]);
        let sync = client(transport);
        let handle = sync.disconnect_handle();
        let mut state = sync.watch_state();

        let task = tokio::spawn(sync.run());
        state.wait_for(|s| *s == SyncState::Reconnecting).await.unwrap();

        handle.disconnect();
        task.await.unwrap().unwrap();

        // no second connect happened
        assert_eq!(times.lock().unwrap().len(), 1);
    }
}
