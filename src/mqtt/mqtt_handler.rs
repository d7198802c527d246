use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConfigProblem, SessionConfig};
use super::message_manager::{AlarmCommand, AlarmPayload, InboundMessage};
use super::reconnect::ReconnectPolicy;

/// How long a closing session may take to flush its DISCONNECT packet.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of the broker session.
///
/// ```text
/// Closed ──► Connecting ──► Connected ──► Error | Disconnected ──► Closed
/// ```
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Closed,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

/// Event produced by a session's background task, tagged with the generation
/// of the session that produced it.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub generation: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone)]
pub enum SessionEventKind {
    Connected,
    Message(InboundMessage),
    Error(String),
    Disconnected,
    /// The reconnect policy stopped retrying.
    GaveUp { failures: u32 },
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

/// What the manager hands to the controller after accepting an event.
#[derive(Debug, Clone)]
pub enum Delivery {
    Connected,
    Disconnected,
    Error(String),
    GaveUp(u32),
    Alarm(AlarmPayload, InboundMessage),
    Unrecognized(InboundMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Unchanged,
    Opened,
    Reopened,
    OpenFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("No broker configuration has been applied")]
    NotConfigured,

    #[error("Invalid session config: {0}")]
    InvalidConfig(#[from] ConfigProblem),

    #[error("Failed to open session: {0}")]
    Open(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Close failed: {0}")]
    Close(String),
}

/// An open connection to the broker.
pub trait BrokerLink: Send + Debug {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), SessionError>;

    fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens broker connections. The returned link reports everything it receives
/// on `events`, tagged with `generation`.
pub trait Connector: Send + Sync + Debug {
    fn connect(
        &self,
        config: &SessionConfig,
        generation: u64,
        events: SessionEventSender,
    ) -> Result<Box<dyn BrokerLink>, SessionError>;
}

/// Owns at most one broker session at a time.
///
/// Must be driven from a single task: inbound events reach it through
/// [`accept`](Self::accept) in arrival order.
#[derive(Debug)]
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    events: SessionEventSender,
    generation: u64,
    /// A session was already opened under the current generation.
    generation_used: bool,
    state: SessionState,
    config: Option<SessionConfig>,
    link: Option<Box<dyn BrokerLink>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, events: SessionEventSender) -> Self {
        Self {
            connector,
            events,
            generation: 0,
            generation_used: false,
            state: SessionState::Closed,
            config: None,
            link: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Opens a session for `config`, replacing the current one only when the
    /// config differs. Invalid configs are rejected before anything is torn down.
    pub fn initialize(&mut self, config: SessionConfig) -> Result<InitOutcome, SessionError> {
        if let Err(problem) = config.validate() {
            warn!("Rejecting broker config {}: {}", config, problem);
            return Err(problem.into());
        }

        if self.link.is_some() {
            if self.config.as_ref() == Some(&config) {
                debug!("Broker config unchanged, keeping session {}", self.generation);
                return Ok(InitOutcome::Unchanged);
            }
            info!("Broker config changed, reconnecting to {}", config);
            self.close();
            return Ok(match self.open(config) {
                InitOutcome::Opened => InitOutcome::Reopened,
                other => other,
            });
        }

        Ok(self.open(config))
    }

    /// Reopens the last applied config after an error or disconnect.
    pub fn reconnect(&mut self) -> Result<InitOutcome, SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Connected if self.link.is_some() => {
                debug!("Session {} is {:?}, no reconnect needed", self.generation, self.state);
                Ok(InitOutcome::Unchanged)
            }
            _ => {
                let config = self.config.clone().ok_or(SessionError::NotConfigured)?;
                let had_session = self.close();
                Ok(match self.open(config) {
                    InitOutcome::Opened if had_session => InitOutcome::Reopened,
                    other => other,
                })
            }
        }
    }

    fn open(&mut self, config: SessionConfig) -> InitOutcome {
        // A failed open leaves no link to close, so the bump happens here.
        if self.generation_used {
            self.generation += 1;
        }
        self.generation_used = true;
        info!("Opening session {} to {}", self.generation, config);
        self.state = SessionState::Connecting;

        let outcome = match self
            .connector
            .connect(&config, self.generation, self.events.clone())
        {
            Ok(link) => {
                self.link = Some(link);
                InitOutcome::Opened
            }
            Err(e) => {
                error!("Could not open session to {}: {}", config, e);
                self.state = SessionState::Error;
                let _ = self.events.send(SessionEvent {
                    generation: self.generation,
                    kind: SessionEventKind::Error(e.to_string()),
                });
                InitOutcome::OpenFailed
            }
        };
        self.config = Some(config);
        outcome
    }

    /// Tears the session down. Safe to call repeatedly; returns whether a
    /// session was actually closed.
    pub fn close(&mut self) -> bool {
        let Some(mut link) = self.link.take() else {
            self.state = SessionState::Closed;
            return false;
        };

        // Bump first so anything the old session still delivers is stale.
        self.generation += 1;
        self.generation_used = false;
        if let Err(e) = link.close() {
            warn!("Error while closing broker session: {}", e);
        }
        self.state = SessionState::Closed;
        info!("Session closed, generation now {}", self.generation);
        true
    }

    pub fn publish(&self, command: AlarmCommand) -> Result<(), SessionError> {
        let (Some(link), Some(config)) = (&self.link, &self.config) else {
            return Err(SessionError::NotConnected);
        };
        if self.state != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }

        info!("Publishing {} to {}", command, config.command_topic);
        link.publish(&config.command_topic, command.as_str())
    }

    /// Applies a session event. Events from superseded sessions are dropped.
    pub fn accept(&mut self, event: SessionEvent) -> Option<Delivery> {
        if event.generation != self.generation {
            debug!(
                "Dropping event from stale session {} (current {})",
                event.generation, self.generation
            );
            return None;
        }

        match event.kind {
            SessionEventKind::Connected => {
                info!("Session {} connected", self.generation);
                self.state = SessionState::Connected;
                Some(Delivery::Connected)
            }
            SessionEventKind::Disconnected => {
                warn!("Session {} disconnected", self.generation);
                self.state = SessionState::Disconnected;
                Some(Delivery::Disconnected)
            }
            SessionEventKind::Error(message) => {
                self.state = SessionState::Error;
                Some(Delivery::Error(message))
            }
            SessionEventKind::GaveUp { failures } => {
                warn!("Session {} gave up after {} failures", self.generation, failures);
                self.state = SessionState::Error;
                Some(Delivery::GaveUp(failures))
            }
            SessionEventKind::Message(message) => Some(self.classify(message)),
        }
    }

    fn classify(&self, message: InboundMessage) -> Delivery {
        let on_state_topic = self
            .config
            .as_ref()
            .is_some_and(|config| config.state_topic == message.topic);

        match AlarmPayload::parse(&message.payload) {
            Some(payload) if on_state_topic => Delivery::Alarm(payload, message),
            _ => {
                debug!("Ignoring unrecognized message {}", message);
                Delivery::Unrecognized(message)
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Production connector backed by `rumqttc`.
#[derive(Debug, Clone)]
pub struct RumqttConnector {
    policy: Arc<dyn ReconnectPolicy>,
    keep_alive: Duration,
}

impl RumqttConnector {
    pub fn new(policy: Arc<dyn ReconnectPolicy>) -> Self {
        Self {
            policy,
            keep_alive: Duration::from_secs(30),
        }
    }

    fn options(&self, config: &SessionConfig) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);
        if let Some(user) = &config.username {
            mqtt_options.set_credentials(user, config.password.as_deref().unwrap_or_default());
        }
        if config.tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }
        mqtt_options
    }
}

impl Connector for RumqttConnector {
    fn connect(
        &self,
        config: &SessionConfig,
        generation: u64,
        events: SessionEventSender,
    ) -> Result<Box<dyn BrokerLink>, SessionError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::Open(format!("no async runtime: {}", e)))?;

        let (client, eventloop) = AsyncClient::new(self.options(config), 64);
        let token = CancellationToken::new();

        handle.spawn(run_event_loop(
            eventloop,
            client.clone(),
            config.state_topic.clone(),
            generation,
            events,
            Arc::clone(&self.policy),
            token.clone(),
        ));

        Ok(Box::new(RumqttLink { client, token }))
    }
}

#[derive(Debug)]
struct RumqttLink {
    client: AsyncClient,
    token: CancellationToken,
}

impl BrokerLink for RumqttLink {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), SessionError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| SessionError::Publish(e.to_string()))
    }

    /// Queues a DISCONNECT, then stops the event loop. The loop flushes the
    /// queued packet before it exits.
    fn close(&mut self) -> Result<(), SessionError> {
        let disconnect = self
            .client
            .try_disconnect()
            .map_err(|e| SessionError::Close(e.to_string()));
        self.token.cancel();
        disconnect
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state_topic: String,
    generation: u64,
    events: SessionEventSender,
    policy: Arc<dyn ReconnectPolicy>,
    token: CancellationToken,
) {
    let emit = |kind: SessionEventKind| events.send(SessionEvent { generation, kind }).is_ok();
    let mut failures: u32 = 0;
    let mut connected = false;

    loop {
        let polled = tokio::select! {
            _ = token.cancelled() => {
                if connected {
                    flush_disconnect(&mut eventloop, generation).await;
                }
                break;
            }
            polled = eventloop.poll() => polled,
        };

        let delivered = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                failures = 0;
                connected = true;
                // rumqttc does not resubscribe on its own after a reconnect.
                info!("MQTT connected, subscribing to {}", state_topic);
                if let Err(e) = client.try_subscribe(&state_topic, QoS::AtLeastOnce) {
                    error!("Failed to subscribe to {}: {}", state_topic, e);
                    emit(SessionEventKind::Error(e.to_string()));
                }
                emit(SessionEventKind::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message =
                    InboundMessage::from_bytes(&publish.topic, &publish.payload, publish.pkid);
                debug!("MQTT message on {}: {}", message.topic, message.payload);
                emit(SessionEventKind::Message(message))
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected = false;
                emit(SessionEventKind::Disconnected)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Session {} sent DISCONNECT", generation);
                break;
            }
            Ok(_) => true,
            Err(e) => {
                failures += 1;
                warn!("MQTT connection error (failure {}): {}", failures, e);
                let reported = if connected {
                    connected = false;
                    emit(SessionEventKind::Disconnected)
                } else {
                    emit(SessionEventKind::Error(e.to_string()))
                };
                if !reported {
                    break;
                }

                match policy.next_delay(failures) {
                    Some(delay) => {
                        debug!("Retrying broker connection in {:?}", delay);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        true
                    }
                    None => {
                        emit(SessionEventKind::GaveUp { failures });
                        break;
                    }
                }
            }
        };

        if !delivered {
            debug!("Session {} receiver gone, stopping event loop", generation);
            break;
        }
    }

    debug!("Event loop for session {} finished", generation);
}

/// Polls until the queued DISCONNECT has been written to the socket.
async fn flush_disconnect(eventloop: &mut EventLoop, generation: u64) {
    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
                Ok(_) => {}
                Err(e) => {
                    debug!("Session {} closed before DISCONNECT: {}", generation, e);
                    return;
                }
            }
        }
    })
    .await;

    if flushed.is_err() {
        warn!("Session {} did not flush DISCONNECT within {:?}", generation, DISCONNECT_GRACE);
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Connector that records what the manager does with it.
    #[derive(Debug, Default)]
    pub struct MockConnector {
        pub opens: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
        pub fail: AtomicBool,
        pub auto_connect: AtomicBool,
        pub published: Arc<Mutex<Vec<(String, String)>>>,
        pub sessions: Mutex<Vec<(u64, SessionEventSender)>>,
    }

    impl MockConnector {
        pub fn connecting() -> Arc<Self> {
            let connector = Self::default();
            connector.auto_connect.store(true, Ordering::SeqCst);
            Arc::new(connector)
        }

        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub fn published(&self) -> Vec<(String, String)> {
            self.published.lock().map(|p| p.clone()).unwrap_or_default()
        }

        /// Plays the broker side of the most recently opened session.
        pub fn emit(&self, kind: SessionEventKind) {
            let sessions = self.sessions.lock().unwrap();
            let (generation, events) = sessions.last().expect("no session opened");
            events
                .send(SessionEvent {
                    generation: *generation,
                    kind,
                })
                .unwrap();
        }
    }

    #[derive(Debug)]
    struct MockLink {
        closes: Arc<AtomicUsize>,
        published: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl BrokerLink for MockLink {
        fn publish(&self, topic: &str, payload: &str) -> Result<(), SessionError> {
            if let Ok(mut published) = self.published.lock() {
                published.push((topic.to_string(), payload.to_string()));
            }
            Ok(())
        }

        fn close(&mut self) -> Result<(), SessionError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::Close("mock close error".to_string()))
        }
    }

    impl Connector for MockConnector {
        fn connect(
            &self,
            _config: &SessionConfig,
            generation: u64,
            events: SessionEventSender,
        ) -> Result<Box<dyn BrokerLink>, SessionError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SessionError::Open("connection refused".to_string()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut sessions) = self.sessions.lock() {
                sessions.push((generation, events.clone()));
            }
            if self.auto_connect.load(Ordering::SeqCst) {
                let _ = events.send(SessionEvent {
                    generation,
                    kind: SessionEventKind::Connected,
                });
            }
            Ok(Box::new(MockLink {
                closes: Arc::clone(&self.closes),
                published: Arc::clone(&self.published),
            }))
        }
    }
}


#[cfg(test)]
mod broker_tests {
    use super::*;
    use crate::mqtt::reconnect::{ExponentialBackoff, NoRetry};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    fn local_config(port: u16) -> SessionConfig {
        SessionConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..SessionConfig::default()
        }
    }

    /// Reads one MQTT packet: fixed header byte and body.
    async fn read_packet(socket: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = socket.read_u8().await.unwrap();
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = socket.read_u8().await.unwrap();
            length |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        socket.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut socket).await;
        assert_eq!(header >> 4, 1, "expected CONNECT");
        socket.write_all(&CONNACK).await.unwrap();
        socket
    }

    async fn next_kind(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        generation: u64,
    ) -> SessionEventKind {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no session event in time")
            .expect("event loop stopped");
        assert_eq!(event.generation, generation);
        event.kind
    }

    #[tokio::test]
    async fn session_subscribes_delivers_and_disconnects_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let connector = RumqttConnector::new(Arc::new(NoRetry));
        let mut link = connector.connect(&local_config(port), 7, tx).unwrap();
        let mut socket = accept_session(&listener).await;
        assert!(matches!(next_kind(&mut rx, 7).await, SessionEventKind::Connected));

        let (header, body) = read_packet(&mut socket).await;
        assert_eq!(header, 0x82, "expected SUBSCRIBE");
        let topic_len = usize::from(u16::from_be_bytes([body[2], body[3]]));
        assert_eq!(&body[4..4 + topic_len], b"home/alarm");
        socket
            .write_all(&[0x90, 0x03, body[0], body[1], 0x01])
            .await
            .unwrap();

        let mut publish = vec![0x30, 21, 0x00, 10];
        publish.extend_from_slice(b"home/alarm");
        publish.extend_from_slice(b"triggered");
        socket.write_all(&publish).await.unwrap();
        match next_kind(&mut rx, 7).await {
            SessionEventKind::Message(message) => {
                assert_eq!(message.topic, "home/alarm");
                assert_eq!(message.payload, "triggered");
            }
            other => panic!("expected a message, got {:?}", other),
        }

        link.close().unwrap();
        let (header, _) = tokio::time::timeout(Duration::from_secs(5), read_packet(&mut socket))
            .await
            .expect("broker never saw DISCONNECT");
        assert_eq!(header, 0xE0);
    }

    #[tokio::test]
    async fn dropped_connection_reports_disconnect_then_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let connector = RumqttConnector::new(Arc::new(NoRetry));
        let _link = connector.connect(&local_config(port), 3, tx).unwrap();
        let socket = accept_session(&listener).await;
        assert!(matches!(next_kind(&mut rx, 3).await, SessionEventKind::Connected));

        drop(socket);
        assert!(matches!(next_kind(&mut rx, 3).await, SessionEventKind::Disconnected));
        assert!(matches!(
            next_kind(&mut rx, 3).await,
            SessionEventKind::GaveUp { failures: 1 }
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn refused_broker_is_retried_until_policy_gives_up() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();

        let policy = ExponentialBackoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            max_attempts: 3,
        };
        let connector = RumqttConnector::new(Arc::new(policy));
        let _link = connector.connect(&local_config(port), 1, tx).unwrap();

        for _ in 0..4 {
            assert!(matches!(next_kind(&mut rx, 1).await, SessionEventKind::Error(_)));
        }
        assert!(matches!(
            next_kind(&mut rx, 1).await,
            SessionEventKind::GaveUp { failures: 4 }
        ));
        assert!(rx.recv().await.is_none());
    }
}
