use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};

use flume::{bounded, Receiver, Sender};
use mqtt5_codec::{Connect, ConnectReasonCode, Disconnect, Packet, Property};
use tokio::time::{self, error::Elapsed};
use tokio_stream::{wrappers::IntervalStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::brokers::{Backoff, BrokerList};
use crate::client::{ClientError, Message, Request};
use crate::framed::Network;
use crate::state::{complete_disconnect, MqttState, StateError};
use crate::{transport, Event, MqttOptions, TransportError};

const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Critical errors during eventloop polling
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    MqttState(#[from] StateError),
    #[error("Timeout")]
    Timeout(#[from] Elapsed),
    #[error("Connection refused, return code: `{0:?}`")]
    ConnectionRefused(ConnectReasonCode),
    #[error("Expected ConnAck packet, received: {0:?}")]
    NotConnAck(Box<Packet>),
    #[error("No bytes arrived within the keep alive window")]
    ReadTimeout,
    #[error("Requests done")]
    RequestsDone,
    #[error("The client was cancelled")]
    Cancelled,
}

/// Eventloop with all the state of a connection
///
/// All protocol state lives on this one task; the clone-able client handles
/// only post requests onto the bounded channel.
pub struct EventLoop {
    /// Options of the current mqtt connection
    mqtt_options: MqttOptions,
    /// Current state of the connection
    state: MqttState,
    /// Broker endpoints in rotation order
    brokers: BrokerList,
    /// Backoff applied after a full unsuccessful sweep of the broker list
    backoff: Backoff,
    /// Consecutive connect failures since the last successful handshake
    connect_failures: usize,
    /// Connection to the broker
    connection: Option<Connection>,
    /// Packets for transmission
    transmit: TransmitQueue,
    /// Cancellation shared with the client handles
    cancel: CancellationToken,
}

struct Connection {
    /// Underlying network connection
    network: Network,
    /// Effective keep alive: min(requested, server keep alive)
    keep_alive: Duration,
    /// Stream of instants when to consider sending a ping
    keep_alive_stream: Pin<Box<dyn Stream<Item = time::Instant> + Send>>,
}

struct TransmitQueue {
    /// Requests coming from the client
    requests_rx: Receiver<Request>,
    /// Packets to retransmit after a session was resumed
    pending: VecDeque<Packet>,
}

/// A unit of outgoing work: either a retransmission or a fresh user request.
enum Transmit {
    Pending(Packet),
    Request(Request),
}

impl EventLoop {
    /// Create a new `EventLoop` along with the request channel and the
    /// cancellation token shared with the client handles.
    pub(crate) fn new(
        mqtt_options: MqttOptions,
        cap: usize,
        inbound_tx: Sender<Message>,
    ) -> (Self, Sender<Request>, CancellationToken) {
        let (requests_tx, requests_rx) = bounded(cap);

        let brokers = BrokerList::parse(&mqtt_options.brokers, mqtt_options.default_port);
        let connect_properties = &mqtt_options.connect_options.properties;
        let alias_max_in = connect_properties
            .iter()
            .find_map(|p| match p {
                Property::TopicAliasMaximum(max) => Some(*max),
                _ => None,
            })
            .unwrap_or(0);
        let auth_configured = connect_properties
            .iter()
            .any(|p| matches!(p, Property::AuthenticationMethod(_)));

        let state = MqttState::new(
            mqtt_options.manual_acks,
            mqtt_options.topic_aliases_out,
            alias_max_in,
            auth_configured,
            inbound_tx,
        );

        let cancel = CancellationToken::new();
        let eventloop = Self {
            mqtt_options,
            state,
            brokers,
            backoff: Backoff::new(BACKOFF_INITIAL, BACKOFF_MAX),
            connect_failures: 0,
            connection: None,
            transmit: TransmitQueue {
                requests_rx,
                pending: VecDeque::new(),
            },
            cancel: cancel.clone(),
        };
        (eventloop, requests_tx, cancel)
    }

    /// Drive the event loop until the client is cancelled.
    ///
    /// Transport and protocol errors are retried indefinitely across the
    /// broker list; authentication failures are terminal.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        loop {
            match self.poll().await {
                Ok(event) => {
                    log::trace!("Event = {:?}", event);
                }
                Err(ConnectionError::Cancelled) | Err(ConnectionError::RequestsDone) => {
                    return Ok(());
                }
                Err(ConnectionError::ConnectionRefused(code))
                    if code.is_authentication_error() =>
                {
                    log::error!("Broker rejected our credentials: {:?}", code);
                    self.state.fail_all_pending(|| ClientError::Cancelled);
                    return Err(ConnectionError::ConnectionRefused(code));
                }
                Err(e) => {
                    log::error!("Connection error = {:?}", e);
                }
            }
        }
    }

    /// Yield the next notification or outgoing activity.
    ///
    /// This function will progress the eventloop:
    /// - Connect/reconnect to the broker
    /// - Periodically ping the broker
    /// - Handle incoming packets
    /// - Send outgoing requests
    ///
    /// > NOTE: don't block this while iterating
    pub async fn poll(&mut self) -> Result<Event, ConnectionError> {
        if self.cancel.is_cancelled() {
            self.connection = None;
            self.state.fail_all_pending(|| ClientError::Cancelled);
            return Err(ConnectionError::Cancelled);
        }

        if self.connection.is_none() {
            match self.connect().await {
                Ok(()) => {}
                Err(e) => {
                    self.connect_failures += 1;
                    return Err(e);
                }
            }
        }

        match self.select().await {
            Ok(event) => Ok(event),
            Err(e) => {
                self.teardown(&e).await;
                Err(e)
            }
        }
    }

    /// Close the connection after an error, notifying the broker of protocol
    /// violations and pending operations of terminal conditions.
    async fn teardown(&mut self, error: &ConnectionError) {
        if let ConnectionError::MqttState(state_error) = error {
            // tell the broker why before closing on protocol violations
            if let Some(reason_code) = state_error.disconnect_reason() {
                if let Some(conn) = self.connection.as_mut() {
                    let disconnect = Packet::Disconnect(Disconnect::with_reason(reason_code));
                    let _ = conn.network.write(disconnect).await;
                    let _ = conn.network.flush().await;
                }
            }

            if let StateError::ServerDisconnect { reason_code, .. } = state_error {
                let reason_code = *reason_code;
                self.state
                    .fail_all_pending(|| ClientError::ServerDisconnect(reason_code));
            }
        }

        if matches!(error, ConnectionError::Cancelled) {
            self.state.fail_all_pending(|| ClientError::Cancelled);
        }

        // in-flight publishes survive transport errors, they are replayed
        // once a session-present reconnect succeeds
        self.connection = None;
    }

    /// Open a stream to the next endpoint and run the MQTT handshake.
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.brokers.is_empty() {
            return Err(TransportError::NoEndpoints.into());
        }

        // a full sweep of the list failed, slow down before the next one
        if self.connect_failures > 0 && self.connect_failures % self.brokers.len() == 0 {
            let delay = self.backoff.next_delay();
            log::info!("All brokers unreachable, backing off for {:?}", delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConnectionError::Cancelled),
                _ = time::sleep(delay) => {}
            }
        }

        let (host, port) = self.brokers.next();
        log::debug!("Connecting to {}:{}", host, port);

        let cancel = self.cancel.clone();
        let session_present = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
            result = self.handshake(&host, port) => result?,
        };

        self.connect_failures = 0;
        self.backoff.reset();

        // adopt the identifier the broker generated for us
        if self.mqtt_options.connect_options.client_id.is_empty() {
            if let Some(assigned) = &self.state.limits().assigned_client_id {
                log::debug!("Broker assigned client id {}", assigned);
                self.mqtt_options.connect_options.client_id = assigned.clone();
            }
        }

        if session_present {
            // session present: retransmit in-flight publishes in pid order
            self.transmit.pending = self.state.replay().into();
        } else {
            self.state.session_reset();
            self.transmit.pending.clear();
        }

        Ok(())
    }

    /// Transport connect plus CONNECT/CONNACK exchange.
    ///
    /// Returns the session-present flag of the accepted CONNACK.
    async fn handshake(&mut self, host: &str, port: u16) -> Result<bool, ConnectionError> {
        let options = &self.mqtt_options;
        let timeout = Duration::from_secs(options.connection_timeout());

        let socket = time::timeout(timeout, transport::connect(options, host, port)).await??;
        let mut network = Network::new(
            socket,
            options.max_packet_size_in,
            options.max_packet_size_out,
        );

        let mut connect = Connect::new(
            options.keep_alive().as_secs() as u16,
            options.clean_session(),
            options.client_id(),
        );
        connect.last_will = options.last_will().map(|w| Box::new(w.clone()));
        connect.login = options.credentials().map(|l| Box::new(l.clone()));
        connect.properties = options.connect_options.properties.clone();

        network.write(Packet::Connect(connect)).await?;
        network.flush().await?;

        let connack = match time::timeout(timeout, network.read()).await?? {
            Packet::ConnAck(connack) if connack.code == ConnectReasonCode::Success => connack,
            Packet::ConnAck(connack) => {
                return Err(ConnectionError::ConnectionRefused(connack.code));
            }
            packet => return Err(ConnectionError::NotConnAck(Box::new(packet))),
        };

        self.state.handle_connack(&connack);
        let limits = self.state.limits();

        let max_outgoing = limits
            .maximum_packet_size
            .min(options.max_packet_size_out);
        network.set_max_outgoing_size(max_outgoing);

        // the broker may dictate a different keep alive than requested
        let mut keep_alive = options.keep_alive();
        if let Some(server_keep_alive) = limits.server_keep_alive {
            let server_keep_alive = Duration::from_secs(server_keep_alive as u64);
            log::debug!("Server sets keep alive time of {:?}", server_keep_alive);
            keep_alive = keep_alive.min(server_keep_alive);
        }

        let keep_alive_stream: Pin<Box<dyn Stream<Item = time::Instant> + Send>> =
            match ping_interval(keep_alive) {
                None => Box::pin(tokio_stream::pending()),
                Some(period) => {
                    let mut interval = time::interval_at(time::Instant::now() + period, period);
                    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
                    Box::pin(IntervalStream::new(interval))
                }
            };

        self.connection = Some(Connection {
            network,
            keep_alive,
            keep_alive_stream,
        });

        Ok(connack.session_present)
    }

    /// Perform work by `select!`ing on requests, incoming network traffic,
    /// keepalive pings and the read-inactivity sentry.
    ///
    /// User requests are only pulled while flow-control credit is left;
    /// retransmissions of a resumed session always go out first.
    async fn select(&mut self) -> Result<Event, ConnectionError> {
        loop {
            // Read buffered events before creating new events
            if let Some(event) = self.state.get_event() {
                return Ok(event);
            }

            let allow_out = self.transmit.has_pending() || self.state.has_credit();

            // We know the connection is set, since we check for `None` in the poll method
            let conn = self.connection.as_mut().expect("Connection should be set");

            let read_deadline = read_deadline(self.state.last_incoming(), conn.keep_alive);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state.fail_all_pending(|| ClientError::Cancelled);
                    return Err(ConnectionError::Cancelled);
                },
                // Handles pending and new requests.
                // Only accept new requests while flow-control credit is left.
                transmit = self.transmit.next(self.mqtt_options.pending_throttle()), if allow_out => {
                    match transmit? {
                        Transmit::Pending(packet) => {
                            conn.network.write(packet).await?;
                        }
                        Transmit::Request(Request::Disconnect { disconnect, done }) => {
                            // orderly shutdown: flush the disconnect, then cancel
                            let packet = self.state.outgoing_disconnect(disconnect);
                            conn.network.write(packet).await?;
                            conn.network.flush().await?;
                            complete_disconnect(done, Ok(()));
                            self.cancel.cancel();
                            self.state.fail_all_pending(|| ClientError::Cancelled);
                            return Err(ConnectionError::Cancelled);
                        }
                        Transmit::Request(request) => {
                            if let Some(outgoing) = self.state.handle_outgoing_request(request)? {
                                conn.network.write(outgoing).await?;
                            }
                        }
                    }
                },
                // Read in bulk from the network, reply in bulk
                res = conn.network.readb(&mut self.state) => {
                    res?;
                },
                // Consider a ping on every tick; the state skips it when
                // other writes already kept the connection alive.
                Some(_) = conn.keep_alive_stream.next() => {
                    let interval = ping_interval(conn.keep_alive).expect("stream only ticks with keep alive enabled");
                    if let Some(ping) = self.state.outgoing_ping(interval)? {
                        conn.network.write(ping).await?;
                    }
                },
                // No bytes from the broker for too long
                _ = time::sleep_until(read_deadline) => {
                    return Err(ConnectionError::ReadTimeout);
                },
            }

            let network_timeout = Duration::from_secs(self.mqtt_options.connection_timeout());
            time::timeout(network_timeout, conn.network.flush()).await??;
            self.state.flushed();
        }
    }
}

/// The interval between keepalive pings, one second short of the keep alive
/// window. `None` when keep alive is disabled.
fn ping_interval(keep_alive: Duration) -> Option<Duration> {
    if keep_alive.is_zero() {
        return None;
    }
    Some(keep_alive.saturating_sub(Duration::from_secs(1)).max(Duration::from_secs(1)))
}

/// When to give up on a silent broker: `max(keep_alive + 5s, 10s)` after the
/// last received byte, or effectively never when keep alive is disabled.
fn read_deadline(last_incoming: Instant, keep_alive: Duration) -> time::Instant {
    let idle_window = if keep_alive.is_zero() {
        Duration::from_secs(30 * 24 * 3600)
    } else {
        (keep_alive + Duration::from_secs(5)).max(Duration::from_secs(10))
    };
    time::Instant::from_std(last_incoming + idle_window)
}

impl TransmitQueue {
    /// Get the next unit of outgoing work.
    ///
    /// This prioritises retransmissions of a resumed session. The
    /// `pending_throttle` parameter puts a limit on how fast those are sent.
    /// If there are no pending packets, wait for the next user request.
    async fn next(&mut self, pending_throttle: Duration) -> Result<Transmit, ConnectionError> {
        if !self.pending.is_empty() {
            time::sleep(pending_throttle).await;
            // We must call .pop_front() AFTER sleep() otherwise we would have
            // advanced the iterator but the future might be canceled before return
            return Ok(Transmit::Pending(
                self.pending.pop_front().expect("pending is non-empty"),
            ));
        }

        match self.requests_rx.recv_async().await {
            Ok(r) => Ok(Transmit::Request(r)),
            Err(_) => Err(ConnectionError::RequestsDone),
        }
    }

    /// Are there any pending packets to be sent?
    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
