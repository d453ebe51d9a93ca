//! Connectivity session: owns the MQTT connection lifecycle.
//!
//! ```text
//! Disconnected ──poll──▶ Connecting ──ConnAck──▶ Connected{subscribed: false}
//!      ▲                     │                          │ SubAck
//!      │ error (backoff)     │                          ▼
//!      └─────────────────────┴──────────────── Connected{subscribed: true}
//! ```
//!
//! [`Session::run`] is the driver.  It is spawned once and polls the event
//! loop for the life of the process, so a connect attempt always runs to
//! completion and a failed one waits the fixed backoff before the next.
//! Parsed commands leave the driver over an `mpsc` channel; the connection
//! state is published on a `watch` channel.
//!
//! The control loop holds a [`Link`]: a client handle plus the state
//! receiver.  Publishing through it never waits for the connection: while
//! not connected a publish is dropped and reported as an error.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS, SubscribeReasonCode,
};
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::command::{parse_command, Command};
use crate::config::MqttSection;
use crate::telemetry::Publish;
use crate::topics::Topics;

/// Capacity of the client's outbound request queue.
const REQUEST_QUEUE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { subscribed: bool },
}

impl ConnectionState {
    fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

#[derive(Debug, Serialize)]
struct StatusMsg {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

fn status_payload(status: &'static str, timestamp: Option<String>) -> Vec<u8> {
    // Serialising two plain strings cannot fail.
    serde_json::to_vec(&StatusMsg { status, timestamp }).unwrap_or_default()
}

pub struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    topics: Topics,
    state: watch::Sender<ConnectionState>,
    backoff: Duration,
    retry_at: Option<Instant>,
    failures: u32,
    /// The broker refused the command subscription; ask again on the next
    /// keep-alive round trip.
    resubscribe: bool,
}

impl Session {
    pub fn new(mqtt: &MqttSection, client_id: &str, topics: &Topics) -> Self {
        let mut options = MqttOptions::new(client_id, mqtt.host.clone(), mqtt.port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_s));
        if !mqtt.username.is_empty() {
            options.set_credentials(mqtt.username.clone(), mqtt.password.clone());
        }
        options.set_last_will(LastWill::new(
            topics.status.clone(),
            status_payload("offline", None),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        info!(
            broker = format_args!("{}:{}", mqtt.host, mqtt.port),
            client_id,
            command_topic = %topics.command,
            "mqtt session created"
        );

        Self {
            client,
            eventloop,
            topics: topics.clone(),
            state,
            backoff: Duration::from_secs(mqtt.reconnect_backoff_s),
            retry_at: None,
            failures: 0,
            resubscribe: false,
        }
    }

    /// A handle for publishing and watching the connection state.
    pub fn link(&self) -> Link {
        Link {
            client: self.client.clone(),
            state: self.state.subscribe(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    fn is_subscribed(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected { subscribed: true }
    }

    /// Drive the connection forever, forwarding commands to `commands`.
    /// Intended to be `tokio::spawn`-ed from main; returns once the command
    /// receiver is gone.
    pub async fn run(mut self, commands: mpsc::Sender<Command>) {
        loop {
            let Some(cmd) = self.poll().await else {
                continue;
            };
            match commands.try_send(cmd) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(cmd)) => {
                    warn!(?cmd, "command queue full; command dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("command receiver closed, session driver stopping");
                    return;
                }
            }
        }
    }

    /// Process one connection event.  Returns a command when one arrives on
    /// the command topic.
    async fn poll(&mut self) -> Option<Command> {
        if let Some(at) = self.retry_at.take() {
            sleep_until(at).await;
        }
        if *self.state.borrow() == ConnectionState::Disconnected {
            debug!(attempt = self.failures + 1, "connecting to broker");
            self.set_state(ConnectionState::Connecting);
        }

        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                self.on_connected();
                None
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                self.on_suback(&ack.return_codes);
                None
            }
            Ok(Event::Incoming(Packet::PingResp)) => {
                self.retry_subscription();
                None
            }
            Ok(Event::Incoming(Packet::Publish(p))) => self.on_message(&p.topic, &p.payload),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                self.on_connection_lost("broker sent disconnect");
                None
            }
            Ok(_) => None,
            Err(e) => {
                self.on_connection_lost(e);
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    fn on_connected(&mut self) {
        info!(after_failures = self.failures, "mqtt connected");
        self.set_state(ConnectionState::Connected { subscribed: false });
        self.failures = 0;
        self.resubscribe = false;
        self.subscribe();

        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339).ok();
        if let Err(e) = self.send(&self.topics.status, status_payload("online", timestamp), true) {
            warn!("presence not published: {e:#}");
        }
    }

    fn subscribe(&self) {
        if let Err(e) = self
            .client
            .try_subscribe(self.topics.command.clone(), QoS::AtLeastOnce)
        {
            warn!(topic = %self.topics.command, "subscribe request failed: {e}");
        }
    }

    fn on_suback(&mut self, codes: &[SubscribeReasonCode]) {
        if !self.is_connected() {
            return;
        }
        if codes
            .iter()
            .all(|c| !matches!(c, SubscribeReasonCode::Failure))
        {
            info!(topic = %self.topics.command, "subscribed to commands");
            self.set_state(ConnectionState::Connected { subscribed: true });
        } else {
            error!(
                topic = %self.topics.command,
                "broker rejected command subscription; remote commands are unavailable until it is accepted"
            );
            self.resubscribe = true;
        }
    }

    /// Re-request a rejected command subscription.  Returns `true` if a
    /// request was issued.
    fn retry_subscription(&mut self) -> bool {
        if !self.resubscribe || !self.is_connected() || self.is_subscribed() {
            return false;
        }
        self.resubscribe = false;
        info!(topic = %self.topics.command, "retrying command subscription");
        self.subscribe();
        true
    }

    fn on_connection_lost(&mut self, reason: impl fmt::Display) {
        self.failures += 1;
        self.set_state(ConnectionState::Disconnected);
        self.retry_at = Some(Instant::now() + self.backoff);
        warn!(
            attempt = self.failures,
            retry_in_sec = self.backoff.as_secs(),
            "mqtt connection failed: {reason}"
        );
    }

    fn on_message(&self, topic: &str, payload: &[u8]) -> Option<Command> {
        if !self.topics.is_command(topic) {
            debug!(topic, "ignoring message on unexpected topic");
            return None;
        }
        let cmd = parse_command(payload);
        debug!(?cmd, "command received");
        Some(cmd)
    }

    /// Retained presence publish from the driver side.
    fn send(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        if !self.is_connected() {
            bail!("not connected; dropped publish to {topic}");
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload)
            .with_context(|| format!("publish to {topic} failed"))
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// The control loop's view of the session.
#[derive(Clone)]
pub struct Link {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
}

impl Link {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Wait until the driver has connected and subscribed to commands.  The
    /// driver keeps retrying with the fixed backoff for as long as it takes.
    pub async fn ensure_connected(&mut self) {
        let subscribed = ConnectionState::Connected { subscribed: true };
        if self.state.wait_for(|s| *s == subscribed).await.is_err() {
            warn!("session driver stopped before the connection came up");
        }
    }
}

impl Publish for Link {
    /// One delivery attempt, at most once, never queued while disconnected.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            bail!("not connected; dropped publish to {topic}");
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .with_context(|| format!("publish to {topic} failed"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    /// A session pointed at `port` on localhost.
    pub(crate) fn session_on(port: u16, backoff_s: u64) -> Session {
        let mqtt = MqttSection {
            host: "127.0.0.1".into(),
            port,
            reconnect_backoff_s: backoff_s,
            ..MqttSection::default()
        };
        Session::new(&mqtt, "agri-node-test", &Topics::new("farm_001", "node_a1"))
    }

    /// A session pointed at a port nothing listens on.  The event loop is
    /// never polled unless a test drives it, so requests just queue up.
    pub(crate) fn test_session() -> Session {
        session_on(1, 5)
    }

    // -- Minimal MQTT 3.1.1 broker ------------------------------------------

    const CONNECT: u8 = 1;
    const SUBSCRIBE: u8 = 8;
    const PINGREQ: u8 = 12;

    async fn read_packet(sock: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let kind = sock.read_u8().await? >> 4;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = sock.read_u8().await?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        sock.read_exact(&mut body).await?;
        Ok((kind, body))
    }

    /// Serve one client: CONNACK after `connack_delay`, SUBACK granting
    /// QoS 1, PINGRESP.  With `hang_up` the link is closed right after the
    /// first SUBACK.
    pub(crate) async fn serve_client(mut sock: TcpStream, connack_delay: Duration, hang_up: bool) {
        while let Ok((kind, body)) = read_packet(&mut sock).await {
            let reply = match kind {
                CONNECT => {
                    tokio::time::sleep(connack_delay).await;
                    vec![0x20, 0x02, 0x00, 0x00]
                }
                SUBSCRIBE => vec![0x90, 0x03, body[0], body[1], 0x01],
                PINGREQ => vec![0xd0, 0x00],
                _ => continue,
            };
            if sock.write_all(&reply).await.is_err() {
                return;
            }
            if hang_up && kind == SUBSCRIBE {
                return;
            }
        }
    }

    const CMD_TOPIC: &str = "farm/farm_001/device/node_a1/command";
    const SUBSCRIBED: ConnectionState = ConnectionState::Connected { subscribed: true };

    #[tokio::test]
    async fn starts_disconnected() {
        let s = test_session();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(s.link().state(), ConnectionState::Disconnected);
        assert!(!s.link().is_connected());
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_dropped() {
        let s = test_session();
        let err = s
            .link()
            .publish("farm/farm_001/sensor/node_a1", b"{}".to_vec())
            .unwrap_err();
        assert!(err.to_string().contains("not connected"), "{err}");
    }

    #[tokio::test]
    async fn connack_connects_without_subscription() {
        let mut s = test_session();
        let link = s.link();
        s.on_connected();
        assert_eq!(link.state(), ConnectionState::Connected { subscribed: false });
        link.publish("farm/farm_001/sensor/node_a1", b"{}".to_vec())
            .unwrap();
    }

    #[tokio::test]
    async fn suback_marks_subscribed() {
        let mut s = test_session();
        s.on_connected();
        s.on_suback(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        assert_eq!(s.state(), SUBSCRIBED);
    }

    #[tokio::test]
    async fn rejected_suback_stays_unsubscribed() {
        let mut s = test_session();
        s.on_connected();
        s.on_suback(&[SubscribeReasonCode::Failure]);
        assert_eq!(s.state(), ConnectionState::Connected { subscribed: false });
    }

    #[tokio::test]
    async fn rejected_subscription_is_retried_once_per_rejection() {
        let mut s = test_session();
        s.on_connected();
        assert!(!s.retry_subscription(), "nothing to retry yet");

        s.on_suback(&[SubscribeReasonCode::Failure]);
        assert!(s.retry_subscription());
        assert!(!s.retry_subscription(), "one request per rejection");

        s.on_suback(&[SubscribeReasonCode::Failure]);
        s.on_suback(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        assert!(!s.retry_subscription(), "already subscribed");
    }

    #[tokio::test]
    async fn no_subscription_retry_while_disconnected() {
        let mut s = test_session();
        s.on_connected();
        s.on_suback(&[SubscribeReasonCode::Failure]);
        s.on_connection_lost("reset");
        assert!(!s.retry_subscription());
        s.on_connected();
        assert!(!s.retry_subscription(), "reconnect subscribes afresh");
    }

    #[tokio::test]
    async fn suback_while_disconnected_ignored() {
        let mut s = test_session();
        s.on_suback(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn already_subscribed_link_returns_immediately() {
        let mut s = test_session();
        let mut link = s.link();
        s.on_connected();
        s.on_suback(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        link.ensure_connected().await;
        assert!(link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_schedules_backoff() {
        let mut s = test_session();
        let link = s.link();
        s.on_connected();
        let before = Instant::now();
        s.on_connection_lost("connection reset");

        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(s.retry_at, Some(before + Duration::from_secs(5)));
        assert!(link.publish("t", b"{}".to_vec()).is_err());
    }

    #[tokio::test]
    async fn reconnect_resets_failures() {
        let mut s = test_session();
        s.on_connection_lost("refused");
        s.on_connection_lost("refused");
        assert_eq!(s.failures, 2);
        s.on_connected();
        assert_eq!(s.failures, 0);
    }

    #[tokio::test]
    async fn command_topic_messages_are_parsed() {
        let s = test_session();
        assert_eq!(s.on_message(CMD_TOPIC, b"PUMP_ON"), Some(Command::PumpOn));
        assert_eq!(
            s.on_message(CMD_TOPIC, br#"{"command":"PUMP_OFF"}"#),
            Some(Command::PumpOff)
        );
        assert_eq!(
            s.on_message(CMD_TOPIC, b"garbage"),
            Some(Command::Unknown("garbage".into()))
        );
    }

    #[tokio::test]
    async fn other_topics_are_ignored() {
        let s = test_session();
        assert_eq!(s.on_message("farm/farm_001/device/other/command", b"PUMP_ON"), None);
        assert_eq!(s.on_message("farm/farm_001/sensor/node_a1", b"PUMP_ON"), None);
    }

    #[test]
    fn status_payloads() {
        let online: serde_json::Value =
            serde_json::from_slice(&status_payload("online", Some("2026-01-01T00:00:00Z".into())))
                .unwrap();
        assert_eq!(online["status"], "online");
        assert_eq!(online["timestamp"], "2026-01-01T00:00:00Z");

        let offline: serde_json::Value =
            serde_json::from_slice(&status_payload("offline", None)).unwrap();
        assert_eq!(offline, serde_json::json!({"status": "offline"}));
    }

    // -- Against a live socket ------------------------------------------------

    #[tokio::test]
    async fn driver_connects_and_subscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            serve_client(sock, Duration::ZERO, false).await;
        });

        let session = session_on(port, 1);
        let mut link = session.link();
        let (tx, _rx) = mpsc::channel(8);
        tokio::spawn(session.run(tx));

        timeout(Duration::from_secs(5), link.ensure_connected())
            .await
            .expect("connected and subscribed");
        assert_eq!(link.state(), SUBSCRIBED);
        link.publish("farm/farm_001/sensor/node_a1", b"{}".to_vec())
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_link_reconnects_after_backoff() {
        let backoff = Duration::from_secs(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            serve_client(first, Duration::ZERO, true).await;
            let hung_up = Instant::now();

            let (second, _) = listener.accept().await.unwrap();
            let gap = hung_up.elapsed();
            tokio::spawn(serve_client(second, Duration::ZERO, false));
            gap
        });

        let session = session_on(port, backoff.as_secs());
        let mut link = session.link();
        let (tx, _rx) = mpsc::channel(8);
        tokio::spawn(session.run(tx));

        timeout(Duration::from_secs(5), link.ensure_connected())
            .await
            .expect("first connection");

        let gap = timeout(Duration::from_secs(5), broker)
            .await
            .expect("client came back")
            .unwrap();
        assert!(gap >= backoff, "reconnected after {gap:?}, before the backoff");

        timeout(Duration::from_secs(5), link.ensure_connected())
            .await
            .expect("resubscribed on reconnect");
        assert_eq!(link.state(), SUBSCRIBED);
    }
}
