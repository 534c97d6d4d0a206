//! One client connection: lifecycle state, outbound queue, and the task pair
//! that moves frames between the socket and the rest of the server.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use parley_core::SessionId;
use parley_telemetry::ServerMetrics;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use crate::dispatch::Dispatcher;
use crate::error::SessionError;
use crate::registry::SessionRegistry;

/// How long the writer waits for the close frame to go out.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiving end of a session's outbound queue, drained by the writer task.
pub type Outbox = mpsc::UnboundedReceiver<String>;

/// Lifecycle of a session. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Active = 1,
    /// I/O failed or the peer left; waiting for cleanup.
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

pub struct Session {
    id: SessionId,
    addr: SocketAddr,
    client_id: String,
    state: AtomicU8,
    last_activity: Mutex<Instant>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    registry: Weak<SessionRegistry>,
    metrics: Arc<ServerMetrics>,
}

impl Session {
    /// Create a session in `Handshaking` for a freshly upgraded socket.
    pub fn new(
        addr: SocketAddr,
        registry: &Arc<SessionRegistry>,
        metrics: Arc<ServerMetrics>,
    ) -> (Arc<Self>, Outbox) {
        let (outbound, outbox) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: SessionId::new(),
            addr,
            client_id: addr.to_string(),
            state: AtomicU8::new(SessionState::Handshaking as u8),
            last_activity: Mutex::new(Instant::now()),
            outbound,
            shutdown: CancellationToken::new(),
            registry: Arc::downgrade(registry),
            metrics,
        });
        (session, outbox)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ip:port` of the remote end.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn ip(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Mark the handshake complete and join the registry.
    ///
    /// Returns the number of registered sessions. On refusal the session is
    /// closed and must be dropped by the caller.
    pub fn start(self: &Arc<Self>, max_clients: usize) -> Result<usize, SessionError> {
        self.transition(SessionState::Handshaking, SessionState::Active)
            .map_err(SessionError::InvalidState)?;
        self.touch();

        let Some(registry) = self.registry.upgrade() else {
            self.close_unregistered();
            return Err(SessionError::ShuttingDown);
        };
        let total = match registry.insert_bounded(Arc::clone(self), max_clients) {
            Ok(total) => total,
            Err(e) => {
                self.close_unregistered();
                return Err(e);
            }
        };

        // A disconnect that raced the insert found nothing to remove.
        if !self.is_connected() {
            registry.remove(&self.id);
            return Err(SessionError::InvalidState(self.state()));
        }
        Ok(total)
    }

    /// Queue a text frame. Returns false, without queueing, unless the
    /// session is active.
    pub fn send(&self, message: String) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outbound.send(message).is_ok()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity()) > timeout
    }

    /// Flag a failed or finished connection so the reaper collects it.
    /// Returns false if the session was not active.
    pub fn mark_closing(&self) -> bool {
        let closing = self
            .transition(SessionState::Active, SessionState::Closing)
            .is_ok();
        if closing {
            debug!(session_id = %self.id, client_id = %self.client_id, "session closing");
        }
        closing
    }

    /// Close the session: leave the registry and stop both I/O tasks.
    ///
    /// Runs its cleanup exactly once no matter how many callers race;
    /// returns true for the caller that did it.
    pub fn disconnect(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == SessionState::Closed as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        self.shutdown.cancel();
        info!(session_id = %self.id, client_id = %self.client_id, "client disconnected");
        true
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SessionState::from_u8)
    }

    fn close_unregistered(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Drive a started session until either direction ends, then disconnect it.
///
/// `sink` and `stream` are the two halves of the socket. The writer drains
/// `outbox` in order and pings every `heartbeat`; the reader hands text
/// frames to `dispatcher`.
pub async fn run_connection<W, R, E>(
    session: Arc<Session>,
    sink: W,
    stream: R,
    outbox: Outbox,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Duration,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let span = tracing::info_span!(
        "session",
        session_id = %session.id(),
        client_id = %session.client_id(),
    );

    let mut writer = tokio::spawn(
        write_loop(Arc::clone(&session), sink, outbox, heartbeat).instrument(span.clone()),
    );
    let mut reader =
        tokio::spawn(read_loop(Arc::clone(&session), stream, dispatcher).instrument(span.clone()));

    let writer_finished = tokio::select! {
        _ = &mut writer => true,
        _ = &mut reader => false,
    };

    session.disconnect();

    // Both loops watch the shutdown token; let the writer flush its close frame.
    if writer_finished {
        let _ = reader.await;
    } else {
        let _ = writer.await;
    }
    span.in_scope(|| trace!("connection tasks finished"));
}

async fn write_loop<W>(session: Arc<Session>, mut sink: W, mut outbox: Outbox, heartbeat: Duration)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = session.shutdown.cancelled() => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static(""),
                };
                match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
                    Ok(Ok(())) => trace!("close frame sent"),
                    Ok(Err(e)) => debug!(error = %e, "close frame not delivered"),
                    Err(_) => debug!("close frame timed out"),
                }
                break;
            }

            next = outbox.recv() => {
                let Some(text) = next else { break };
                let bytes = text.len();
                match sink.send(Message::Text(text.into())).await {
                    Ok(()) => session.metrics.record_sent(bytes),
                    Err(e) => {
                        warn!(error = %e, "write failed");
                        session.mark_closing();
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    warn!(error = %e, "heartbeat ping failed");
                    session.mark_closing();
                    break;
                }
            }
        }
    }
}

async fn read_loop<R, E>(session: Arc<Session>, mut stream: R, dispatcher: Arc<Dispatcher>)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            _ = session.shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                session.touch();
                let text = text.as_str();
                session.metrics.record_received(text.len());
                debug!(bytes = text.len(), "received message");
                dispatcher.handle_inbound(&session, text);
            }
            Some(Ok(Message::Binary(data))) => {
                session.touch();
                debug!(bytes = data.len(), "ignoring binary frame");
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(code = ?frame.map(|f| f.code), "client closed connection");
                break;
            }
            Some(Ok(_)) => session.touch(),
            Some(Err(e)) => {
                warn!(error = %e, "read failed");
                break;
            }
            None => {
                debug!("connection stream ended");
                break;
            }
        }
    }
    session.mark_closing();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use parley_core::MessageLog;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn fixture(port: u16) -> (Arc<SessionRegistry>, Arc<Session>, Outbox) {
        let registry = Arc::new(SessionRegistry::new());
        let (session, outbox) = Session::new(addr(port), &registry, Arc::new(ServerMetrics::new()));
        (registry, session, outbox)
    }

    #[test]
    fn new_session_is_handshaking_and_unregistered() {
        let (registry, session, _outbox) = fixture(5000);
        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(!session.is_connected());
        assert!(!session.send("early".into()));
        assert!(registry.is_empty());
        assert_eq!(session.client_id(), "127.0.0.1:5000");
        assert_eq!(session.ip(), "127.0.0.1");
    }

    #[test]
    fn start_activates_and_registers() {
        let (registry, session, _outbox) = fixture(5001);
        assert_eq!(session.start(10), Ok(1));
        assert!(session.is_connected());
        assert!(registry.contains(session.id()));
        assert_eq!(
            session.start(10),
            Err(SessionError::InvalidState(SessionState::Active))
        );
    }

    #[test]
    fn start_refused_when_full_closes_session() {
        let registry = Arc::new(SessionRegistry::new());
        let metrics = Arc::new(ServerMetrics::new());
        let (first, _a) = Session::new(addr(5002), &registry, Arc::clone(&metrics));
        let (second, _b) = Session::new(addr(5003), &registry, metrics);

        first.start(1).unwrap();
        assert_eq!(second.start(1), Err(SessionError::RegistryFull { max: 1 }));
        assert_eq!(second.state(), SessionState::Closed);
        assert!(!second.send("nope".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn start_after_registry_dropped() {
        let (registry, session, _outbox) = fixture(5004);
        drop(registry);
        assert_eq!(session.start(10), Err(SessionError::ShuttingDown));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn start_after_registry_closed() {
        let (registry, session, mut outbox) = fixture(5050);
        assert!(registry.close().is_empty());

        assert_eq!(session.start(10), Err(SessionError::ShuttingDown));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty());
        assert!(!session.send("late".into()));
        assert!(outbox.try_recv().is_err());
    }

    #[test]
    fn sends_are_queued_in_order() {
        let (_registry, session, mut outbox) = fixture(5005);
        session.start(10).unwrap();
        for i in 0..100 {
            assert!(session.send(format!("m{i}")));
        }
        for i in 0..100 {
            assert_eq!(outbox.try_recv().unwrap(), format!("m{i}"));
        }
        assert!(outbox.try_recv().is_err());
    }

    #[test]
    fn disconnected_session_never_comes_back() {
        let (registry, session, mut outbox) = fixture(5006);
        session.start(10).unwrap();

        assert!(session.disconnect());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!registry.contains(session.id()));

        assert!(!session.disconnect());
        assert!(!session.mark_closing());
        assert!(session.start(10).is_err());
        assert!(!session.send("late".into()));
        assert!(!session.is_connected());
        assert!(outbox.try_recv().is_err());
    }

    #[test]
    fn closing_session_rejects_sends_and_still_disconnects_once() {
        let (registry, session, _outbox) = fixture(5007);
        session.start(10).unwrap();

        assert!(session.mark_closing());
        assert!(!session.mark_closing());
        assert_eq!(session.state(), SessionState::Closing);
        assert!(!session.send("x".into()));
        assert!(registry.contains(session.id()), "closing sessions wait for the reaper");

        assert!(session.disconnect());
        assert!(!registry.contains(session.id()));
    }

    #[test]
    fn concurrent_disconnect_cleans_up_exactly_once() {
        let (_registry, session, _outbox) = fixture(5008);
        session.start(10).unwrap();

        let winners: usize = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.disconnect())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn timeout_check_uses_supplied_clock() {
        let (_registry, session, _outbox) = fixture(5009);
        session.start(10).unwrap();
        let seen = session.last_activity();
        let timeout = Duration::from_secs(60);

        assert!(!session.is_timed_out(seen, timeout));
        assert!(!session.is_timed_out(seen + Duration::from_secs(60), timeout));
        assert!(session.is_timed_out(seen + Duration::from_secs(61), timeout));
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        metrics: Arc<ServerMetrics>,
        dispatcher: Arc<Dispatcher>,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let dispatcher = Arc::new(Dispatcher::new(
                Arc::clone(&registry),
                Arc::new(MessageLog::new(16)),
            ));
            Self {
                registry,
                metrics: Arc::new(ServerMetrics::new()),
                dispatcher,
            }
        }

        fn session(&self, port: u16) -> (Arc<Session>, Outbox) {
            let (session, outbox) = Session::new(addr(port), &self.registry, Arc::clone(&self.metrics));
            session.start(100).unwrap();
            (session, outbox)
        }
    }

    fn text(frame: Message) -> String {
        match frame {
            Message::Text(t) => t.as_str().to_owned(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn driver_writes_queue_in_order_and_closes_normally() {
        let harness = Harness::new();
        let (session, outbox) = harness.session(6000);
        let (sink, mut wire) = fmpsc::unbounded::<Message>();
        let (_inbound_tx, inbound) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let driver = tokio::spawn(run_connection(
            Arc::clone(&session),
            sink,
            inbound,
            outbox,
            Arc::clone(&harness.dispatcher),
            Duration::from_secs(30),
        ));

        for i in 0..5 {
            assert!(session.send(format!("frame-{i}")));
        }
        for i in 0..5 {
            assert_eq!(text(wire.next().await.unwrap()), format!("frame-{i}"));
        }

        session.disconnect();
        match wire.next().await.unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("expected close frame, got {other:?}"),
        }
        driver.await.unwrap();

        assert_eq!(harness.metrics.messages_sent(), 5);
        assert_eq!(harness.metrics.bytes_sent(), 5 * "frame-0".len() as u64);
    }

    #[tokio::test]
    async fn driver_dispatches_inbound_text_to_every_session() {
        let harness = Harness::new();
        let (session, outbox) = harness.session(6001);
        let (_peer, mut peer_outbox) = harness.session(6002);
        let (sink, _wire) = fmpsc::unbounded::<Message>();
        let (inbound_tx, inbound) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let driver = tokio::spawn(run_connection(
            Arc::clone(&session),
            sink,
            inbound,
            outbox,
            Arc::clone(&harness.dispatcher),
            Duration::from_secs(30),
        ));

        inbound_tx
            .unbounded_send(Ok(Message::Text("hello there".into())))
            .unwrap();

        let delivered = peer_outbox.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&delivered).unwrap();
        assert_eq!(value["sender"], "127.0.0.1:6001");
        assert_eq!(value["content"], "hello there");
        assert_eq!(harness.metrics.messages_received(), 1);
        assert_eq!(harness.metrics.bytes_received(), "hello there".len() as u64);

        // Peer hangs up.
        drop(inbound_tx);
        driver.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!harness.registry.contains(session.id()));
        assert_eq!(harness.registry.len(), 1);
    }

    #[tokio::test]
    async fn driver_stops_on_close_frame() {
        let harness = Harness::new();
        let (session, outbox) = harness.session(6003);
        let (sink, _wire) = fmpsc::unbounded::<Message>();
        let inbound = futures::stream::iter(vec![
            Ok::<_, axum::Error>(Message::Ping(Default::default())),
            Ok(Message::Close(None)),
        ]);

        run_connection(
            Arc::clone(&session),
            sink,
            inbound,
            outbox,
            Arc::clone(&harness.dispatcher),
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn write_failure_ends_the_connection() {
        let harness = Harness::new();
        let (session, outbox) = harness.session(6004);
        let (sink, wire) = fmpsc::unbounded::<Message>();
        drop(wire);
        let (_inbound_tx, inbound) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let driver = tokio::spawn(run_connection(
            Arc::clone(&session),
            sink,
            inbound,
            outbox,
            Arc::clone(&harness.dispatcher),
            Duration::from_secs(30),
        ));
        assert!(session.send("into the void".into()));
        driver.await.unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(harness.registry.is_empty());
        assert_eq!(harness.metrics.messages_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_pings_on_heartbeat() {
        let harness = Harness::new();
        let (session, outbox) = harness.session(6005);
        let (sink, mut wire) = fmpsc::unbounded::<Message>();
        let (_inbound_tx, inbound) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let driver = tokio::spawn(run_connection(
            Arc::clone(&session),
            sink,
            inbound,
            outbox,
            Arc::clone(&harness.dispatcher),
            Duration::from_secs(5),
        ));

        assert!(matches!(wire.next().await, Some(Message::Ping(_))));
        session.disconnect();
        driver.await.unwrap();
    }
}
