use std::sync::Arc;

use parley_core::envelope::UNKNOWN_IP;
use parley_core::{Envelope, LogEntry, MessageLog};
use tracing::{debug, error, info, trace, warn};

use crate::error::DispatchError;
use crate::registry::SessionRegistry;
use crate::session::Session;

/// Routes messages to sessions and records them in the message log.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    log: Arc<MessageLog>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>, log: Arc<MessageLog>) -> Self {
        Self { registry, log }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn message_log(&self) -> &Arc<MessageLog> {
        &self.log
    }

    /// Send a JSON envelope to every session registered right now.
    ///
    /// Returns how many sessions accepted it. A malformed payload is
    /// rejected before anything is logged or sent.
    pub fn broadcast(&self, raw: &str) -> Result<usize, DispatchError> {
        let envelope = Envelope::parse(raw).inspect_err(|e| {
            error!(error = %e, kind = e.error_kind(), "failed to parse broadcast message");
        })?;
        self.record(&envelope);
        let delivered = self.fan_out(&envelope);
        info!(sender = %envelope.sender, delivered, "broadcast message");
        Ok(delivered)
    }

    /// Broadcast plain text as the server.
    pub fn announce(&self, text: &str) -> usize {
        let envelope = Envelope::server(text);
        self.record_with_ip(&envelope, UNKNOWN_IP.to_string());
        let delivered = self.fan_out(&envelope);
        info!(delivered, "server announcement");
        delivered
    }

    /// Send server-authored text to the one client known by `client_id`
    /// (its `ip:port` or a sender name it has used).
    pub fn send_private(&self, client_id: &str, text: &str) -> Result<(), DispatchError> {
        let Some(session) = self.registry.find(client_id) else {
            warn!(client_id, "client not found for private message");
            return Err(DispatchError::ClientNotFound(client_id.to_string()));
        };
        if session.send(Envelope::server(text).to_json()) {
            info!(client_id, "private message sent");
            Ok(())
        } else {
            warn!(client_id, "client no longer connected for private message");
            Err(DispatchError::ClientDisconnected(client_id.to_string()))
        }
    }

    /// Parse a JSON envelope and append it to the message log without
    /// sending it anywhere.
    pub fn log_inbound(&self, raw: &str) -> Result<LogEntry, DispatchError> {
        let envelope = Envelope::parse(raw).inspect_err(|e| {
            error!(error = %e, kind = e.error_kind(), "failed to parse inbound message");
        })?;
        Ok(self.record(&envelope))
    }

    /// Handle a text frame from `session`: log it under the session's own
    /// IP and relay it to everyone, the sender included.
    pub fn handle_inbound(&self, session: &Arc<Session>, raw: &str) -> usize {
        let envelope = Envelope::from_inbound(raw, session.client_id());
        if envelope.sender != session.client_id()
            && !self.registry.associate(&envelope.sender, session)
        {
            debug!(sender = %envelope.sender, "sender name reserved or claimed by another client");
        }
        self.record_with_ip(&envelope, session.ip());
        self.fan_out(&envelope)
    }

    pub fn messages(&self) -> Vec<LogEntry> {
        self.log.entries()
    }

    pub fn recent_messages(&self, n: usize) -> Vec<LogEntry> {
        self.log.recent(n)
    }

    /// Log an envelope whose origin is only known by its sender field.
    fn record(&self, envelope: &Envelope) -> LogEntry {
        let ip = self
            .registry
            .find(&envelope.sender)
            .map(|s| s.ip())
            .unwrap_or_else(|| UNKNOWN_IP.to_string());
        self.record_with_ip(envelope, ip)
    }

    fn record_with_ip(&self, envelope: &Envelope, ip: String) -> LogEntry {
        let entry = envelope.clone().into_log_entry(ip);
        let evicted = self.log.append(entry.clone());
        if evicted > 0 {
            trace!(evicted, "message log full, dropped oldest entries");
        }
        entry
    }

    fn fan_out(&self, envelope: &Envelope) -> usize {
        let payload = envelope.to_json();
        self.registry
            .snapshot()
            .iter()
            .filter(|session| session.send(payload.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbox;
    use parley_core::SERVER_SENDER;
    use parley_telemetry::ServerMetrics;

    struct Room {
        dispatcher: Dispatcher,
        registry: Arc<SessionRegistry>,
        metrics: Arc<ServerMetrics>,
    }

    impl Room {
        fn new(log_capacity: usize) -> Self {
            let registry = Arc::new(SessionRegistry::new());
            Self {
                dispatcher: Dispatcher::new(
                    Arc::clone(&registry),
                    Arc::new(MessageLog::new(log_capacity)),
                ),
                registry,
                metrics: Arc::new(ServerMetrics::new()),
            }
        }

        fn join(&self, port: u16) -> (Arc<Session>, Outbox) {
            self.join_from("10.0.0.7", port)
        }

        fn join_from(&self, ip: &str, port: u16) -> (Arc<Session>, Outbox) {
            let addr = format!("{ip}:{port}").parse().unwrap();
            let (session, outbox) = Session::new(addr, &self.registry, Arc::clone(&self.metrics));
            session.start(100).unwrap();
            (session, outbox)
        }
    }

    fn drain(outbox: &mut Outbox) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(raw) = outbox.try_recv() {
            out.push(serde_json::from_str(&raw).unwrap());
        }
        out
    }

    const HELLO: &str = r#"{"timestamp":"2024-01-01T00:00:00Z","sender":"alice","content":"hi"}"#;

    #[test]
    fn broadcast_reaches_every_registered_session() {
        let room = Room::new(10);
        let mut members: Vec<_> = (0..3).map(|i| room.join(7000 + i)).collect();

        assert_eq!(room.dispatcher.broadcast(HELLO).unwrap(), 3);

        let payloads: Vec<_> = members.iter_mut().map(|(_, rx)| drain(rx)).collect();
        for received in &payloads {
            assert_eq!(received.len(), 1);
            assert_eq!(received[0], payloads[0][0]);
            assert_eq!(received[0]["sender"], "alice");
            assert_eq!(received[0]["content"], "hi");
            assert!(received[0].get("ip").is_none(), "ip stays server-side");
        }

        let log = room.dispatcher.messages();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].ip, UNKNOWN_IP);
    }

    #[test]
    fn broadcast_skips_late_joiners_and_closing_sessions() {
        let room = Room::new(10);
        let (_a, mut rx_a) = room.join(7100);
        let (b, mut rx_b) = room.join(7101);
        b.mark_closing();

        assert_eq!(room.dispatcher.broadcast(HELLO).unwrap(), 1);
        let (_c, mut rx_c) = room.join(7102);

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn malformed_broadcast_is_rejected_without_side_effects() {
        let room = Room::new(10);
        let (_a, mut rx) = room.join(7200);

        for bad in ["not json", "[1,2]", "\"str\""] {
            let err = room.dispatcher.broadcast(bad).unwrap_err();
            assert_eq!(err.error_kind(), "malformed_envelope");
        }
        assert!(drain(&mut rx).is_empty());
        assert!(room.dispatcher.messages().is_empty());
    }

    #[test]
    fn broadcast_with_missing_fields_uses_placeholders() {
        let room = Room::new(10);
        let (_a, mut rx) = room.join(7300);

        room.dispatcher.broadcast(r#"{"content":42}"#).unwrap();
        let got = drain(&mut rx);
        assert_eq!(got[0]["timestamp"], "Unknown Time");
        assert_eq!(got[0]["sender"], "Unknown Sender");
        assert_eq!(got[0]["content"], "Unknown Content");
    }

    #[test]
    fn private_message_to_unknown_client_sends_nothing() {
        let room = Room::new(10);
        let (_a, mut rx) = room.join(7400);

        let err = room
            .dispatcher
            .send_private("203.0.113.1:9", "psst")
            .unwrap_err();
        assert!(matches!(err, DispatchError::ClientNotFound(ref id) if id == "203.0.113.1:9"));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn private_message_reaches_only_its_target() {
        let room = Room::new(10);
        let (a, mut rx_a) = room.join(7500);
        let (_b, mut rx_b) = room.join(7501);

        room.dispatcher.send_private(a.client_id(), "just you").unwrap();

        let got = drain(&mut rx_a);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["sender"], SERVER_SENDER);
        assert_eq!(got[0]["content"], "just you");
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn private_message_to_closing_client_fails() {
        let room = Room::new(10);
        let (a, _rx) = room.join(7502);
        a.mark_closing();
        let err = room.dispatcher.send_private(a.client_id(), "late").unwrap_err();
        assert_eq!(err.error_kind(), "client_disconnected");
    }

    #[test]
    fn log_inbound_resolves_sender_ip() {
        let room = Room::new(10);
        let (a, _rx) = room.join(7600);

        let raw = format!(
            r#"{{"timestamp":"t","sender":"{}","content":"c"}}"#,
            a.client_id()
        );
        let entry = room.dispatcher.log_inbound(&raw).unwrap();
        assert_eq!(entry.ip, "10.0.0.7");
        assert_eq!(room.dispatcher.messages(), vec![entry]);

        let stranger = room.dispatcher.log_inbound(HELLO).unwrap();
        assert_eq!(stranger.ip, UNKNOWN_IP);
        assert!(room.dispatcher.log_inbound("{oops").is_err());
        assert_eq!(room.dispatcher.messages().len(), 2);
    }

    #[test]
    fn inbound_frames_relay_to_all_and_bind_sender_names() {
        let room = Room::new(10);
        let (a, mut rx_a) = room.join(7700);
        let (_b, mut rx_b) = room.join(7701);

        assert_eq!(room.dispatcher.handle_inbound(&a, "plain words"), 2);
        let from_a = drain(&mut rx_b);
        assert_eq!(from_a[0]["sender"], "10.0.0.7:7700");
        assert_eq!(from_a[0]["content"], "plain words");
        assert_eq!(drain(&mut rx_a).len(), 1, "sender hears its own message");

        room.dispatcher
            .handle_inbound(&a, r#"{"sender":"alice","content":"named"}"#);
        assert_eq!(room.registry.find("alice").unwrap().id(), a.id());
        assert_eq!(room.dispatcher.messages()[1].ip, "10.0.0.7");

        room.dispatcher.send_private("alice", "by name").unwrap();
        let to_alice = drain(&mut rx_a);
        assert_eq!(to_alice.last().unwrap()["content"], "by name");
    }

    #[test]
    fn borrowed_sender_name_is_logged_with_the_real_ip() {
        let room = Room::new(10);
        let (a, _rx_a) = room.join_from("10.0.0.1", 7800);
        let (b, mut rx_b) = room.join_from("10.0.0.2", 7801);

        room.dispatcher
            .handle_inbound(&a, r#"{"sender":"alice","content":"mine"}"#);
        room.dispatcher
            .handle_inbound(&b, r#"{"sender":"alice","content":"not alice"}"#);

        let log = room.dispatcher.messages();
        assert_eq!(log[0].ip, "10.0.0.1");
        assert_eq!(log[1].sender, "alice");
        assert_eq!(log[1].ip, "10.0.0.2");
        assert_eq!(room.registry.find("alice").unwrap().id(), a.id());
        assert_eq!(drain(&mut rx_b).len(), 2);
    }

    #[test]
    fn clients_cannot_pose_as_the_server() {
        let room = Room::new(10);
        let (a, mut rx_a) = room.join(7900);

        let raw = format!(r#"{{"sender":"{SERVER_SENDER}","content":"obey"}}"#);
        assert_eq!(room.dispatcher.handle_inbound(&a, &raw), 1);
        assert!(room.registry.find(SERVER_SENDER).is_none());
        assert_eq!(room.dispatcher.messages()[0].ip, "10.0.0.7");

        room.dispatcher.announce("maintenance at noon");
        assert_eq!(room.dispatcher.messages()[1].ip, UNKNOWN_IP);

        let err = room
            .dispatcher
            .send_private(SERVER_SENDER, "hello?")
            .unwrap_err();
        assert!(matches!(err, DispatchError::ClientNotFound(_)));
        assert_eq!(drain(&mut rx_a).len(), 2);
    }

    #[test]
    fn message_log_keeps_newest_entries() {
        let room = Room::new(2);
        for i in 0..5 {
            room.dispatcher.announce(&format!("notice {i}"));
        }
        let contents: Vec<_> = room
            .dispatcher
            .messages()
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(contents, vec!["notice 3", "notice 4"]);
        assert_eq!(room.dispatcher.recent_messages(1)[0].content, "notice 4");
    }
}
