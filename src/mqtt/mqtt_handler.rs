//! Connection worker and protocol handling.
//!
//! One worker task owns the TCP transport and the connection state; frame
//! decoding and state transitions are serialized on it, so the connection
//! core needs no locking. Commands arrive over an mpsc channel from the
//! [`MqttHandle`], telemetry and state changes leave over another channel
//! toward the aggregator.
//!
//! Reconnect timers are spawned with the worker's current generation and a
//! cancellation token; a timer from a superseded attempt can never reach
//! the state machine because its generation no longer matches.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{self, CodecError};
use super::connection::{
    Action, ConnectionEvent, ConnectionMachine, ConnectionState, CONNECT_TIMEOUT, RECONNECT_DELAY,
};
use super::frame_reader::{Frame, FrameKind, FrameReader};
use crate::persistence::ConnectionSettings;

/// Device/system log wildcard, first of the two startup subscriptions.
pub const LOG_TOPIC_FILTER: &str = "esp_log/#";
/// Environment data wildcard, second startup subscription.
pub const ENV_TOPIC_FILTER: &str = "env/#";
/// Retained configuration values for the device are published here.
pub const CONFIG_TOPIC: &str = "esp_cfg/1";

const SUBSCRIBE_PACKET_ID: u16 = 1;

/// Errors surfaced through the handle API.
#[derive(Debug, Error)]
pub enum MqttError {
    /// Publish attempted outside the `Ready` state; nothing was sent.
    #[error("not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    /// Packet could not be encoded, e.g. payload over the length limit.
    #[error("encoding error: {0}")]
    Codec(#[from] CodecError),

    /// The worker task is gone.
    #[error("connection worker unavailable: {0}")]
    Channel(String),
}

/// An incoming application message, derived from a PUBLISH frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

/// Events the worker reports to the telemetry aggregator.
#[derive(Debug, Clone)]
pub enum MqttEvent {
    StateChanged(ConnectionState),
    MessageReceived(PublishMessage),
    MessageSent,
}

/// Commands accepted by the worker.
#[derive(Debug)]
pub enum MqttCommand {
    Connect,
    Disconnect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
        result_tx: oneshot::Sender<Result<(), MqttError>>,
    },
    /// Replaces the connection settings; takes effect on the next connect.
    UpdateSettings(ConnectionSettings),
}

/// Cloneable handle to the connection worker.
#[derive(Clone)]
pub struct MqttHandle {
    command_tx: mpsc::Sender<MqttCommand>,
}

impl MqttHandle {
    /// Spawns the connection worker. Telemetry flows out through
    /// `event_tx`; the returned handle is the only way to reach the worker.
    pub fn spawn(settings: ConnectionSettings, event_tx: mpsc::Sender<MqttEvent>) -> Self {
        info!(
            "spawning MQTT worker for {}:{}",
            settings.host, settings.port
        );
        let (command_tx, command_rx) = mpsc::channel(32);
        tokio::spawn(run_worker(settings, command_rx, event_tx));
        Self { command_tx }
    }

    pub async fn connect(&self) -> Result<(), MqttError> {
        self.send(MqttCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.send(MqttCommand::Disconnect).await
    }

    /// Publishes to `topic`. Valid only in `Ready`; any other state is a
    /// no-op reported as [`MqttError::NotConnected`].
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(MqttCommand::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
            result_tx,
        })
        .await?;
        result_rx
            .await
            .map_err(|e| MqttError::Channel(e.to_string()))?
    }

    pub async fn update_settings(&self, settings: ConnectionSettings) -> Result<(), MqttError> {
        self.send(MqttCommand::UpdateSettings(settings)).await
    }

    async fn send(&self, command: MqttCommand) -> Result<(), MqttError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|e| MqttError::Channel(e.to_string()))
    }
}

type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

/// Read and write halves of one live transport.
struct ActiveLink {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ActiveLink {
    fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half),
            writer: write_half,
        }
    }
}

/// Everything the worker mutates outside the transport futures themselves.
struct Engine {
    settings: ConnectionSettings,
    machine: ConnectionMachine,
    /// Bumped on every teardown; pending reconnect timers carry the
    /// generation they were scheduled under and are dropped on mismatch.
    generation: u64,
    reconnect_token: Option<CancellationToken>,
    timer_tx: mpsc::Sender<u64>,
    event_tx: mpsc::Sender<MqttEvent>,
}

async fn run_worker(
    settings: ConnectionSettings,
    mut command_rx: mpsc::Receiver<MqttCommand>,
    event_tx: mpsc::Sender<MqttEvent>,
) {
    let (timer_tx, mut timer_rx) = mpsc::channel::<u64>(4);
    let mut engine = Engine {
        settings,
        machine: ConnectionMachine::default(),
        generation: 0,
        reconnect_token: None,
        timer_tx,
        event_tx,
    };
    let mut link: Option<ActiveLink> = None;
    let mut dial: Option<DialFuture> = None;

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else {
                    debug!("all handles dropped, stopping MQTT worker");
                    break;
                };
                engine.on_command(command, &mut link, &mut dial).await;
            }

            dialed = async { dial.as_mut().expect("guarded").as_mut().await }, if dial.is_some() => {
                dial = None;
                match dialed {
                    Ok(stream) => {
                        info!("transport established");
                        link = Some(ActiveLink::new(stream));
                        engine.dispatch(ConnectionEvent::TransportReady, &mut link, &mut dial).await;
                    }
                    Err(e) => {
                        warn!("transport connect failed: {}", e);
                        engine.dispatch(ConnectionEvent::TransportFailed, &mut link, &mut dial).await;
                    }
                }
            }

            frame = async { link.as_mut().expect("guarded").reader.next_frame().await }, if link.is_some() => {
                engine.on_frame(frame, &mut link, &mut dial).await;
            }

            Some(timer_generation) = timer_rx.recv() => {
                if timer_generation == engine.generation {
                    engine.dispatch(ConnectionEvent::ReconnectDue, &mut link, &mut dial).await;
                } else {
                    debug!("dropping reconnect timer from superseded generation {}", timer_generation);
                }
            }
        }
    }
}

impl Engine {
    async fn on_command(
        &mut self,
        command: MqttCommand,
        link: &mut Option<ActiveLink>,
        dial: &mut Option<DialFuture>,
    ) {
        match command {
            MqttCommand::Connect => {
                self.dispatch(ConnectionEvent::ConnectRequested, link, dial)
                    .await;
            }
            MqttCommand::Disconnect => {
                self.dispatch(ConnectionEvent::DisconnectRequested, link, dial)
                    .await;
            }
            MqttCommand::Publish {
                topic,
                payload,
                retain,
                result_tx,
            } => {
                let result = self.handle_publish(&topic, &payload, retain, link).await;
                let transport_failed = matches!(&result, Err(MqttError::Channel(_)));
                let _ = result_tx.send(result);
                if transport_failed {
                    *link = None;
                    self.dispatch(ConnectionEvent::TransportFailed, link, dial)
                        .await;
                }
            }
            MqttCommand::UpdateSettings(settings) => {
                info!(
                    "connection settings updated, effective on next connect: {}:{}",
                    settings.host, settings.port
                );
                self.settings = settings;
            }
        }
    }

    async fn handle_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
        link: &mut Option<ActiveLink>,
    ) -> Result<(), MqttError> {
        if !self.machine.state().is_ready() {
            debug!(
                "publish to {} ignored in state {:?}",
                topic,
                self.machine.state()
            );
            return Err(MqttError::NotConnected {
                state: self.machine.state().clone(),
            });
        }
        let Some(active) = link.as_mut() else {
            return Err(MqttError::NotConnected {
                state: self.machine.state().clone(),
            });
        };

        // Encoding failures never reach the wire: no partial sends.
        let packet = codec::encode_publish(topic, payload, retain)?;
        active
            .writer
            .write_all(&packet)
            .await
            .map_err(|e| MqttError::Channel(e.to_string()))?;
        debug!("published {} bytes to {}", payload.len(), topic);
        let _ = self.event_tx.send(MqttEvent::MessageSent).await;
        Ok(())
    }

    async fn on_frame(
        &mut self,
        frame: Result<Frame, super::frame_reader::FrameError>,
        link: &mut Option<ActiveLink>,
        dial: &mut Option<DialFuture>,
    ) {
        match frame {
            Ok(frame) => match frame.kind {
                FrameKind::ConnAck => match codec::decode_connack(&frame.bytes) {
                    Ok(code) => {
                        self.dispatch(ConnectionEvent::ConnAck(code), link, dial)
                            .await;
                    }
                    Err(e) => warn!("dropping malformed CONNACK: {}", e),
                },
                FrameKind::Publish => match codec::decode_publish(&frame.bytes) {
                    Ok((topic, payload)) => {
                        let message = PublishMessage {
                            topic,
                            payload,
                            received_at: Local::now(),
                        };
                        let _ = self
                            .event_tx
                            .send(MqttEvent::MessageReceived(message))
                            .await;
                    }
                    Err(e) => warn!("dropping malformed PUBLISH: {}", e),
                },
                // SUBACK, PINGRESP and friends: tolerated, not acted on.
                FrameKind::Other(packet_type) => {
                    debug!("ignoring frame type {}", packet_type);
                }
            },
            Err(e) => {
                warn!("receive loop ended: {}", e);
                *link = None;
                self.dispatch(ConnectionEvent::TransportFailed, link, dial)
                    .await;
            }
        }
    }

    /// Feeds one event through the state machine and performs the resulting
    /// actions. Actions may produce follow-up events (a send failure turns
    /// into `TransportFailed`), which are processed in order.
    async fn dispatch(
        &mut self,
        event: ConnectionEvent,
        link: &mut Option<ActiveLink>,
        dial: &mut Option<DialFuture>,
    ) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let before = self.machine.state().clone();
            let actions = self.machine.handle(event);
            let after = self.machine.state().clone();
            if before != after {
                info!("connection state: {}", after.status_text());
                let _ = self.event_tx.send(MqttEvent::StateChanged(after)).await;
            }
            for action in actions {
                if let Some(follow_up) = self.perform(action, link, dial).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn perform(
        &mut self,
        action: Action,
        link: &mut Option<ActiveLink>,
        dial: &mut Option<DialFuture>,
    ) -> Option<ConnectionEvent> {
        match action {
            Action::Dial => {
                let host = self.settings.host.clone();
                let port = self.settings.port;
                debug!("dialing {}:{}", host, port);
                *dial = Some(Box::pin(async move {
                    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "transport connect timed out",
                        )),
                    }
                }));
                None
            }
            Action::SendConnect => {
                let packet = match codec::encode_connect(&self.settings) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("cannot encode CONNECT: {}", e);
                        return Some(ConnectionEvent::TransportFailed);
                    }
                };
                self.write_packet(link, &packet)
                    .await
                    .err()
                    .map(|_| ConnectionEvent::TransportFailed)
            }
            Action::SendSubscriptions => {
                // Fire-and-forget: both filters at QoS 0, SUBACK is never
                // verified. Subscribing counts as complete once the frames
                // are written.
                for filter in [LOG_TOPIC_FILTER, ENV_TOPIC_FILTER] {
                    let packet = match codec::encode_subscribe(filter, SUBSCRIBE_PACKET_ID) {
                        Ok(packet) => packet,
                        Err(e) => {
                            warn!("cannot encode SUBSCRIBE for {}: {}", filter, e);
                            return Some(ConnectionEvent::TransportFailed);
                        }
                    };
                    if self.write_packet(link, &packet).await.is_err() {
                        return Some(ConnectionEvent::TransportFailed);
                    }
                    debug!("subscribed to {}", filter);
                }
                Some(ConnectionEvent::SubscriptionsSent)
            }
            Action::ScheduleReconnect => {
                let token = CancellationToken::new();
                let generation = self.generation;
                let timer_tx = self.timer_tx.clone();
                let timer_token = token.clone();
                self.reconnect_token = Some(token);
                debug!(
                    "reconnect scheduled in {:?} (generation {})",
                    RECONNECT_DELAY, generation
                );
                tokio::spawn(async move {
                    tokio::select! {
                        _ = timer_token.cancelled() => {}
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {
                            let _ = timer_tx.send(generation).await;
                        }
                    }
                });
                None
            }
            Action::CancelReconnect => {
                if let Some(token) = self.reconnect_token.take() {
                    debug!("cancelling pending reconnect timer");
                    token.cancel();
                }
                self.generation += 1;
                None
            }
            Action::Teardown => {
                *link = None;
                *dial = None;
                self.generation += 1;
                None
            }
        }
    }

    async fn write_packet(
        &mut self,
        link: &mut Option<ActiveLink>,
        packet: &[u8],
    ) -> Result<(), ()> {
        let Some(active) = link.as_mut() else {
            warn!("no transport to write to");
            return Err(());
        };
        if let Err(e) = active.writer.write_all(packet).await {
            warn!("transport write failed: {}", e);
            return Err(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::connection::FailureReason;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_settings(host: &str, port: u16) -> ConnectionSettings {
        ConnectionSettings {
            host: host.to_string(),
            port,
            client_id_prefix: "WaterPump-".to_string(),
            username: "etokoji".to_string(),
            password: String::new(),
            device_id: "cafebabe-0000-0000-0000-000000000000".to_string(),
        }
    }

    async fn next_state(event_rx: &mut mpsc::Receiver<MqttEvent>) -> ConnectionState {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(30), event_rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if let MqttEvent::StateChanged(state) = event {
                return state;
            }
        }
    }

    /// Accepts one client, answers the handshake with the given CONNACK
    /// return code, consumes both SUBSCRIBE frames and then pushes one
    /// PUBLISH before idling.
    async fn fake_broker(listener: TcpListener, connack_code: u8) {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut header = [0u8; 2];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], codec::CONNECT);
        let mut body = vec![0u8; header[1] as usize];
        socket.read_exact(&mut body).await.unwrap();

        socket
            .write_all(&[0x20, 0x02, 0x00, connack_code])
            .await
            .unwrap();
        if connack_code != 0 {
            return;
        }

        for _ in 0..2 {
            socket.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], codec::SUBSCRIBE);
            let mut body = vec![0u8; header[1] as usize];
            socket.read_exact(&mut body).await.unwrap();
        }

        let publish = codec::encode_publish("esp_log/1", b"pump on", false).unwrap();
        socket.write_all(&publish).await.unwrap();

        // Hold the connection open until the test ends.
        std::future::pending::<()>().await;
    }

    #[tokio::test]
    async fn accepted_handshake_walks_to_ready_and_delivers_publishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_broker(listener, 0));

        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = MqttHandle::spawn(test_settings("127.0.0.1", port), event_tx);
        handle.connect().await.unwrap();

        assert_eq!(
            next_state(&mut event_rx).await,
            ConnectionState::Connecting(1)
        );
        assert_eq!(next_state(&mut event_rx).await, ConnectionState::Handshaking);
        assert_eq!(
            next_state(&mut event_rx).await,
            ConnectionState::SubscribingTopics
        );
        assert_eq!(next_state(&mut event_rx).await, ConnectionState::Ready);

        loop {
            let event = tokio::time::timeout(Duration::from_secs(30), event_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let MqttEvent::MessageReceived(message) = event {
                assert_eq!(message.topic, "esp_log/1");
                assert_eq!(message.payload, b"pump on");
                break;
            }
        }
    }

    #[tokio::test]
    async fn rejected_handshake_fails_without_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_broker(listener, 5));

        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = MqttHandle::spawn(test_settings("127.0.0.1", port), event_tx);
        handle.connect().await.unwrap();

        loop {
            match next_state(&mut event_rx).await {
                ConnectionState::Failed(reason) => {
                    assert_eq!(reason, FailureReason::Auth { code: 5 });
                    break;
                }
                ConnectionState::Connecting(_) | ConnectionState::Handshaking => continue,
                other => panic!("unexpected state {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_exhaust_after_five_attempts() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = MqttHandle::spawn(test_settings("127.0.0.1", port), event_tx);
        handle.connect().await.unwrap();

        let mut attempts_seen = Vec::new();
        loop {
            match next_state(&mut event_rx).await {
                ConnectionState::Connecting(n) => attempts_seen.push(n),
                ConnectionState::Failed(reason) => {
                    assert_eq!(reason, FailureReason::ReconnectExhausted);
                    break;
                }
                other => panic!("unexpected state {:?}", other),
            }
        }
        assert_eq!(attempts_seen, vec![1, 2, 3, 4, 5]);

        // Terminal: no sixth attempt shows up.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(event_rx.try_recv().is_err());

        // Manual connect() starts a fresh attempt cycle.
        handle.connect().await.unwrap();
        assert_eq!(
            next_state(&mut event_rx).await,
            ConnectionState::Connecting(1)
        );
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_a_detectable_no_op() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let handle = MqttHandle::spawn(test_settings("127.0.0.1", 1883), event_tx);

        let result = handle
            .publish("esp_cfg/1", b"{\"PWM_length\":2500}", true)
            .await;
        match result {
            Err(MqttError::NotConnected { state }) => {
                assert_eq!(state, ConnectionState::Disconnected);
            }
            other => panic!("expected NotConnected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnect_from_any_state_is_safe() {
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = MqttHandle::spawn(test_settings("127.0.0.1", 1883), event_tx);

        // Twice in a row without ever connecting.
        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), event_rx.recv())
                .await
                .is_err(),
            "no state change expected from idle disconnects"
        );
    }
}
