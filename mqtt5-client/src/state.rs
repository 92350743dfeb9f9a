use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use fixedbitset::FixedBitSet;
use mqtt5_codec::{
    topic, ConnAck, Disconnect, DisconnectReasonCode, Packet, PingReq, Property, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

use crate::alias::AliasPool;
use crate::client::{
    ClientError, DisconnectTx, Message, PublishAck, PublishTx, Request, SubscribeAck, SubscribeTx,
    UnsubscribeAck, UnsubscribeTx,
};
use crate::pid::PidRegistry;
use crate::{Event, Outgoing};

/// Errors during state handling
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Io Error while state is passed to network
    #[error("Io error: {0:?}")]
    Io(#[from] std::io::Error),
    /// Received a packet (ack) which isn't asked for
    #[error("Received unsolicited ack pkid: {0}")]
    Unsolicited(u16),
    /// Last pingreq isn't acked
    #[error("Last pingreq isn't acked")]
    AwaitPingResp,
    /// Received a wrong packet while waiting for another packet
    #[error("Received a wrong packet while waiting for another packet")]
    WrongPacket,
    #[error("Mqtt serialization/deserialization error: {0}")]
    Deserialization(#[from] mqtt5_codec::Error),
    #[error("Broker used topic alias '{alias:?}' outside the advertised maximum '{max:?}'")]
    InvalidAlias { alias: u16, max: u16 },
    #[error("Server sent disconnect with reason `{reason_string:?}` and code '{reason_code:?}'")]
    ServerDisconnect {
        reason_code: DisconnectReasonCode,
        reason_string: Option<String>,
    },
    #[error("Connection closed by peer abruptly")]
    ConnectionAborted,
    #[error("The channel of incoming messages is full")]
    InboundChannelFull,
    #[error("Received an AUTH packet without an authentication exchange in progress")]
    UnexpectedAuth,
}

impl StateError {
    /// The reason code to put in the DISCONNECT packet this error forces.
    pub(crate) fn disconnect_reason(&self) -> Option<DisconnectReasonCode> {
        match self {
            StateError::Deserialization(mqtt5_codec::Error::DuplicateProperty(_)) => {
                Some(DisconnectReasonCode::ProtocolError)
            }
            StateError::Deserialization(_) => Some(DisconnectReasonCode::MalformedPacket),
            StateError::Unsolicited(_) | StateError::WrongPacket | StateError::UnexpectedAuth => {
                Some(DisconnectReasonCode::ProtocolError)
            }
            StateError::InvalidAlias { .. } => Some(DisconnectReasonCode::TopicAliasInvalid),
            StateError::AwaitPingResp => Some(DisconnectReasonCode::KeepAliveTimeout),
            StateError::InboundChannelFull => Some(DisconnectReasonCode::ReceiveMaximumExceeded),
            _ => None,
        }
    }
}

/// Limits the broker advertised in its ConnAck.
///
/// Every outgoing request is clamped against these before any bytes are
/// produced for it.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    pub receive_maximum: u16,
    pub topic_alias_maximum: u16,
    pub maximum_qos: QoS,
    pub retain_available: bool,
    pub maximum_packet_size: u32,
    pub wildcard_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub shared_subscription_available: bool,
    pub server_keep_alive: Option<u16>,
    pub assigned_client_id: Option<String>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            receive_maximum: u16::MAX,
            topic_alias_maximum: 0,
            maximum_qos: QoS::ExactlyOnce,
            retain_available: true,
            maximum_packet_size: u32::MAX,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscription_available: true,
            server_keep_alive: None,
            assigned_client_id: None,
            response_information: None,
            server_reference: None,
        }
    }
}

impl ServerLimits {
    fn from_connack(connack: &ConnAck) -> Self {
        let mut limits = Self::default();
        for property in &connack.properties {
            match property {
                Property::ReceiveMaximum(max) => limits.receive_maximum = *max,
                Property::TopicAliasMaximum(max) => limits.topic_alias_maximum = *max,
                Property::MaximumQos(qos) => {
                    limits.maximum_qos = QoS::try_from(*qos).unwrap_or(QoS::AtMostOnce);
                }
                Property::RetainAvailable(available) => limits.retain_available = *available,
                Property::MaximumPacketSize(max) => limits.maximum_packet_size = *max,
                Property::WildcardSubscriptionAvailable(available) => {
                    limits.wildcard_subscription_available = *available;
                }
                Property::SubscriptionIdentifierAvailable(available) => {
                    limits.subscription_identifiers_available = *available;
                }
                Property::SharedSubscriptionAvailable(available) => {
                    limits.shared_subscription_available = *available;
                }
                Property::ServerKeepAlive(keep_alive) => {
                    limits.server_keep_alive = Some(*keep_alive);
                }
                Property::AssignedClientIdentifier(id) => {
                    limits.assigned_client_id = Some(id.clone());
                }
                Property::ResponseInformation(info) => {
                    limits.response_information = Some(info.clone());
                }
                Property::ServerReference(reference) => {
                    limits.server_reference = Some(reference.clone());
                }
                _ => {}
            }
        }
        limits
    }
}

/// An operation whose packet is on the wire, waiting for its acknowledgment.
///
/// Operations are looked up by packet identifier; the completion sender is
/// taken out exactly once, either by the acknowledgment or by a session
/// boundary (expiry, cancel, server disconnect).
#[derive(Debug)]
enum InflightOp {
    /// QoS 1 publish waiting for PUBACK
    PublishQoS1 {
        publish: Publish,
        done: Option<PublishTx>,
    },
    /// QoS 2 publish waiting for PUBREC
    PublishQoS2 {
        publish: Publish,
        done: Option<PublishTx>,
    },
    /// QoS 2 publish past PUBREC, waiting for PUBCOMP
    AwaitPubComp { done: Option<PublishTx> },
    /// Subscribe waiting for SUBACK
    Subscribe {
        filters: usize,
        done: Option<SubscribeTx>,
    },
    /// Unsubscribe waiting for UNSUBACK
    Unsubscribe {
        filters: usize,
        done: Option<UnsubscribeTx>,
    },
}

/// State of the mqtt connection.
///
/// Methods only modify the state of the object without doing any network
/// operations. The event loop owns the state and is the single task that
/// touches it, so no locking is involved.
#[derive(Debug)]
pub struct MqttState {
    /// Status of last ping
    pub(crate) await_pingresp: bool,
    /// Last incoming packet time
    last_incoming: Instant,
    /// Last outgoing packet time
    last_outgoing: Instant,
    /// Packet identifiers of all in-flight operations
    pids: PidRegistry,
    /// Flow-control credit for outgoing QoS > 0 publishes.
    /// Starts at the broker's receive maximum, decremented when a publish
    /// goes on the wire, incremented when its terminal ack arrives.
    credit: u16,
    /// In-flight operations by packet identifier
    inflight: HashMap<u16, InflightOp>,
    /// Packet ids of incoming QoS 2 publishes awaiting release
    incoming_pub: FixedBitSet,
    /// Buffered events for the event loop to yield
    events: VecDeque<Event>,
    /// Indicates if acknowledgements should be sent immediately
    manual_acks: bool,
    /// Assign aliases to outgoing publish topics
    topic_aliases_out: bool,
    /// Outgoing alias assignments, bounded by the broker's maximum
    aliases_out: AliasPool,
    /// Map of alias -> topic for incoming publishes
    aliases_in: HashMap<u16, String>,
    /// Topic alias maximum we advertised to the broker
    alias_max_in: u16,
    /// Did the connect packet carry an authentication method?
    auth_configured: bool,
    /// Limits received via the ConnAck packet
    limits: ServerLimits,
    /// Delivery channel for incoming application messages
    inbound: flume::Sender<Message>,
    /// QoS 0 publish completions waiting for the next successful flush
    flush_waiters: Vec<PublishTx>,
}

impl MqttState {
    /// Creates new MQTT state.
    pub fn new(
        manual_acks: bool,
        topic_aliases_out: bool,
        alias_max_in: u16,
        auth_configured: bool,
        inbound: flume::Sender<Message>,
    ) -> Self {
        MqttState {
            await_pingresp: false,
            last_incoming: Instant::now(),
            last_outgoing: Instant::now(),
            pids: PidRegistry::new(),
            credit: u16::MAX,
            inflight: HashMap::new(),
            incoming_pub: FixedBitSet::with_capacity(u16::MAX as usize + 1),
            events: VecDeque::with_capacity(100),
            manual_acks,
            topic_aliases_out,
            aliases_out: AliasPool::new(),
            aliases_in: HashMap::new(),
            alias_max_in,
            auth_configured,
            limits: ServerLimits::default(),
            inbound,
            flush_waiters: Vec::new(),
        }
    }

    /// Limits advertised by the broker in the last ConnAck.
    pub fn limits(&self) -> &ServerLimits {
        &self.limits
    }

    /// Is there flow-control credit left for another QoS > 0 publish?
    pub fn has_credit(&self) -> bool {
        self.credit > 0
    }

    /// Number of operations waiting for an acknowledgment.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Time the last packet arrived from the broker.
    pub fn last_incoming(&self) -> Instant {
        self.last_incoming
    }

    /// Get the next event to be processed by the event loop.
    pub fn get_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Apply the broker limits of a fresh connection.
    ///
    /// Aliases are connection scoped, so both alias tables restart empty.
    pub(crate) fn handle_connack(&mut self, connack: &ConnAck) {
        self.limits = ServerLimits::from_connack(connack);
        self.credit = self.limits.receive_maximum;
        let alias_max = if self.topic_aliases_out {
            self.limits.topic_alias_maximum
        } else {
            0
        };
        self.aliases_out.reset(alias_max);
        self.aliases_in.clear();
        self.await_pingresp = false;
        self.last_incoming = Instant::now();
        self.events.push_back(Event::Incoming(Packet::ConnAck(connack.clone())));
    }

    /// The broker restored our session: produce the packets to retransmit.
    ///
    /// QoS 1 publishes and QoS 2 publishes that have not seen a PUBREC are
    /// resent with the DUP flag; QoS 2 publishes past PUBREC resend their
    /// PUBREL. Retransmission happens in packet identifier order. Subscribes
    /// and unsubscribes are not replayable, their callers observe a
    /// session-expired error.
    pub(crate) fn replay(&mut self) -> Vec<Packet> {
        let mut pids: Vec<u16> = self.inflight.keys().copied().collect();
        pids.sort_unstable();

        let mut pending = Vec::new();
        let mut publishes: u16 = 0;
        let mut expired = Vec::new();
        for pid in pids {
            let op = self.inflight.get_mut(&pid).expect("pid taken from the map");
            match op {
                InflightOp::PublishQoS1 { publish, .. }
                | InflightOp::PublishQoS2 { publish, .. } => {
                    let mut publish = publish.clone();
                    publish.dup = true;
                    publishes += 1;
                    pending.push(Packet::Publish(publish));
                }
                InflightOp::AwaitPubComp { .. } => {
                    publishes += 1;
                    pending.push(Packet::PubRel(PubRel::new(pid)));
                }
                InflightOp::Subscribe { done, .. } => {
                    complete(done, Err(ClientError::SessionExpired));
                    expired.push(pid);
                }
                InflightOp::Unsubscribe { done, .. } => {
                    complete(done, Err(ClientError::SessionExpired));
                    expired.push(pid);
                }
            }
        }

        for pid in expired {
            self.inflight.remove(&pid);
            self.pids.release(pid);
        }

        self.credit = self.limits.receive_maximum.saturating_sub(publishes);
        pending
    }

    /// The broker started a fresh session: all in-flight operations are gone.
    pub(crate) fn session_reset(&mut self) {
        self.fail_all_pending(|| ClientError::SessionExpired);
        self.incoming_pub.clear();
        self.credit = self.limits.receive_maximum;
    }

    /// Complete every pending operation with the given error.
    pub(crate) fn fail_all_pending(&mut self, error: impl Fn() -> ClientError) {
        for (_, op) in self.inflight.drain() {
            match op {
                InflightOp::PublishQoS1 { mut done, .. }
                | InflightOp::PublishQoS2 { mut done, .. }
                | InflightOp::AwaitPubComp { mut done } => complete(&mut done, Err(error())),
                InflightOp::Subscribe { mut done, .. } => complete(&mut done, Err(error())),
                InflightOp::Unsubscribe { mut done, .. } => complete(&mut done, Err(error())),
            }
        }
        for done in self.flush_waiters.drain(..) {
            let _ = done.send(Err(error()));
        }
        self.pids.reset();
    }

    /// Complete QoS 0 publishes whose bytes reached the network.
    pub(crate) fn flushed(&mut self) {
        for done in self.flush_waiters.drain(..) {
            let _ = done.send(Ok(PublishAck::Written));
        }
    }

    /// Consolidates handling of all incoming mqtt packets. Returns the packet
    /// the event loop should put on the network in response, if any.
    /// E.g. for an incoming QoS1 publish this returns the PubAck to send back.
    pub fn handle_incoming_packet(&mut self, packet: Packet) -> Result<Option<Packet>, StateError> {
        let outgoing = match &packet {
            Packet::PingResp(_) => self.handle_incoming_pingresp()?,
            Packet::Publish(publish) => self.handle_incoming_publish(publish)?,
            Packet::SubAck(suback) => self.handle_incoming_suback(suback)?,
            Packet::UnsubAck(unsuback) => self.handle_incoming_unsuback(unsuback)?,
            Packet::PubAck(puback) => self.handle_incoming_puback(puback)?,
            Packet::PubRec(pubrec) => self.handle_incoming_pubrec(pubrec)?,
            Packet::PubRel(pubrel) => self.handle_incoming_pubrel(pubrel)?,
            Packet::PubComp(pubcomp) => self.handle_incoming_pubcomp(pubcomp)?,
            Packet::Disconnect(disconn) => self.handle_incoming_disconn(disconn)?,
            Packet::Auth(_) => self.handle_incoming_auth()?,
            _ => {
                log::error!("Invalid incoming packet = {:?}", packet);
                return Err(StateError::WrongPacket);
            }
        };

        self.events.push_back(Event::Incoming(packet));
        self.last_incoming = Instant::now();
        Ok(outgoing)
    }

    /// Consolidates handling of all outgoing mqtt packet logic. Returns a
    /// packet which should be put on to the network by the event loop.
    pub(crate) fn handle_outgoing_request(
        &mut self,
        request: Request,
    ) -> Result<Option<Packet>, StateError> {
        let packet = match request {
            Request::Publish { publish, done } => self.outgoing_publish(publish, done)?,
            Request::Subscribe { subscribe, done } => self.outgoing_subscribe(subscribe, done)?,
            Request::Unsubscribe { unsubscribe, done } => {
                self.outgoing_unsubscribe(unsubscribe, done)?
            }
            Request::Ack(ack) => self.outgoing_ack(ack)?,
            // handled by the event loop before reaching the state
            Request::Disconnect { .. } => unreachable!("disconnect is handled by the event loop"),
        };

        self.last_outgoing = Instant::now();
        Ok(packet)
    }

    fn handle_incoming_pingresp(&mut self) -> Result<Option<Packet>, StateError> {
        self.await_pingresp = false;
        Ok(None)
    }

    /// Results in a delivery to the inbound channel in all the QoS cases.
    ///
    /// Replies with a puback in case of QoS1 and replies with a pubrec in
    /// case of QoS2 while also recording the packet id for deduplication.
    fn handle_incoming_publish(&mut self, publish: &Publish) -> Result<Option<Packet>, StateError> {
        let mut topic = publish.topic.clone();

        // expand the topic alias before delivery
        for property in &publish.properties {
            if let Property::TopicAlias(alias) = property {
                if *alias == 0 || *alias > self.alias_max_in {
                    return Err(StateError::InvalidAlias {
                        alias: *alias,
                        max: self.alias_max_in,
                    });
                }
                if !publish.topic.is_empty() {
                    self.aliases_in.insert(*alias, publish.topic.clone());
                } else if let Some(known) = self.aliases_in.get(alias) {
                    topic.clone_from(known);
                } else {
                    return Err(StateError::InvalidAlias {
                        alias: *alias,
                        max: self.alias_max_in,
                    });
                }
            }
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver(topic, publish)?;
                Ok(None)
            }
            QoS::AtLeastOnce => {
                self.deliver(topic, publish)?;
                if !self.manual_acks {
                    let puback = PubAck::new(publish.pkid);
                    return self.outgoing_puback(puback);
                }
                Ok(None)
            }
            QoS::ExactlyOnce => {
                let pkid = publish.pkid;
                if self.incoming_pub.contains(pkid as usize) {
                    // duplicate delivery attempt, ack again but deliver once
                    log::debug!("Duplicate qos 2 publish. Pkid = {:?}", pkid);
                } else {
                    self.deliver(topic, publish)?;
                    self.incoming_pub.insert(pkid as usize);
                }

                if !self.manual_acks {
                    let pubrec = PubRec::new(pkid);
                    return self.outgoing_pubrec(pubrec);
                }
                Ok(None)
            }
        }
    }

    fn deliver(&mut self, topic: String, publish: &Publish) -> Result<(), StateError> {
        let message = Message {
            topic,
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            pkid: publish.pkid,
            properties: publish.properties.clone(),
        };

        match self.inbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(StateError::InboundChannelFull),
            Err(flume::TrySendError::Disconnected(_)) => {
                // no receiver left, the message is dropped
                log::debug!("No receiver for incoming publish, dropping message");
                Ok(())
            }
        }
    }

    fn handle_incoming_puback(&mut self, puback: &PubAck) -> Result<Option<Packet>, StateError> {
        match self.inflight.remove(&puback.pkid) {
            Some(InflightOp::PublishQoS1 { mut done, .. }) => {
                self.pids.release(puback.pkid);
                self.release_credit();
                complete(
                    &mut done,
                    Ok(PublishAck::PubAck {
                        reason: puback.reason,
                        properties: puback.properties.clone(),
                    }),
                );
                Ok(None)
            }
            Some(op) => {
                self.inflight.insert(puback.pkid, op);
                log::error!("Puback for a non qos1 operation: {:?}", puback.pkid);
                Err(StateError::WrongPacket)
            }
            None => {
                log::error!("Unsolicited puback packet: {:?}", puback.pkid);
                Err(StateError::Unsolicited(puback.pkid))
            }
        }
    }

    fn handle_incoming_pubrec(&mut self, pubrec: &PubRec) -> Result<Option<Packet>, StateError> {
        match self.inflight.remove(&pubrec.pkid) {
            Some(InflightOp::PublishQoS2 { mut done, .. }) => {
                if pubrec.reason.is_failure() {
                    // the handshake ends here, no pubrel follows
                    self.pids.release(pubrec.pkid);
                    self.release_credit();
                    complete(
                        &mut done,
                        Ok(PublishAck::PubRec {
                            reason: pubrec.reason,
                            properties: pubrec.properties.clone(),
                        }),
                    );
                    return Ok(None);
                }

                self.inflight
                    .insert(pubrec.pkid, InflightOp::AwaitPubComp { done });
                let event = Event::Outgoing(Outgoing::PubRel(pubrec.pkid));
                self.events.push_back(event);

                Ok(Some(Packet::PubRel(PubRel::new(pubrec.pkid))))
            }
            Some(op) => {
                self.inflight.insert(pubrec.pkid, op);
                log::error!("Pubrec for a non qos2 operation: {:?}", pubrec.pkid);
                Err(StateError::WrongPacket)
            }
            None => {
                log::error!("Unsolicited pubrec packet: {:?}", pubrec.pkid);
                Err(StateError::Unsolicited(pubrec.pkid))
            }
        }
    }

    fn handle_incoming_pubrel(&mut self, pubrel: &PubRel) -> Result<Option<Packet>, StateError> {
        if !self.incoming_pub.contains(pubrel.pkid as usize) {
            log::error!("Unsolicited pubrel packet: {:?}", pubrel.pkid);
            return Err(StateError::Unsolicited(pubrel.pkid));
        }
        self.incoming_pub.set(pubrel.pkid as usize, false);

        let event = Event::Outgoing(Outgoing::PubComp(pubrel.pkid));
        self.events.push_back(event);

        Ok(Some(Packet::PubComp(PubComp::new(pubrel.pkid))))
    }

    fn handle_incoming_pubcomp(&mut self, pubcomp: &PubComp) -> Result<Option<Packet>, StateError> {
        match self.inflight.remove(&pubcomp.pkid) {
            Some(InflightOp::AwaitPubComp { mut done }) => {
                self.pids.release(pubcomp.pkid);
                self.release_credit();
                complete(
                    &mut done,
                    Ok(PublishAck::PubComp {
                        reason: pubcomp.reason,
                        properties: pubcomp.properties.clone(),
                    }),
                );
                Ok(None)
            }
            Some(op) => {
                self.inflight.insert(pubcomp.pkid, op);
                log::error!("Pubcomp without a preceding pubrec: {:?}", pubcomp.pkid);
                Err(StateError::WrongPacket)
            }
            None => {
                log::error!("Unsolicited pubcomp packet: {:?}", pubcomp.pkid);
                Err(StateError::Unsolicited(pubcomp.pkid))
            }
        }
    }

    fn handle_incoming_suback(&mut self, suback: &SubAck) -> Result<Option<Packet>, StateError> {
        match self.inflight.remove(&suback.pkid) {
            Some(InflightOp::Subscribe { filters, mut done }) => {
                self.pids.release(suback.pkid);

                // one reason code per requested filter
                if suback.reason_codes.len() != filters {
                    log::error!(
                        "SubAck Pkid = {:?} has {} reason codes for {} filters",
                        suback.pkid,
                        suback.reason_codes.len(),
                        filters
                    );
                    complete(&mut done, Err(ClientError::SessionExpired));
                    return Err(StateError::WrongPacket);
                }

                for reason in suback.reason_codes.iter() {
                    match reason {
                        mqtt5_codec::SubscribeReasonCode::Success(qos) => {
                            log::debug!("SubAck Pkid = {:?}, QoS = {:?}", suback.pkid, qos);
                        }
                        _ => {
                            log::warn!("SubAck Pkid = {:?}, Reason = {:?}", suback.pkid, reason);
                        }
                    }
                }

                complete(
                    &mut done,
                    Ok(SubscribeAck {
                        reason_codes: suback.reason_codes.clone(),
                        properties: suback.properties.clone(),
                    }),
                );
                Ok(None)
            }
            Some(op) => {
                self.inflight.insert(suback.pkid, op);
                Err(StateError::WrongPacket)
            }
            None => {
                log::error!("Unsolicited suback packet: {:?}", suback.pkid);
                Err(StateError::Unsolicited(suback.pkid))
            }
        }
    }

    fn handle_incoming_unsuback(
        &mut self,
        unsuback: &UnsubAck,
    ) -> Result<Option<Packet>, StateError> {
        match self.inflight.remove(&unsuback.pkid) {
            Some(InflightOp::Unsubscribe { filters, mut done }) => {
                self.pids.release(unsuback.pkid);

                if unsuback.reason_codes.len() != filters {
                    complete(&mut done, Err(ClientError::SessionExpired));
                    return Err(StateError::WrongPacket);
                }

                for reason in unsuback.reason_codes.iter() {
                    if reason != &mqtt5_codec::UnsubscribeReasonCode::Success {
                        log::warn!("UnsubAck Pkid = {:?}, Reason = {:?}", unsuback.pkid, reason);
                    }
                }

                complete(
                    &mut done,
                    Ok(UnsubscribeAck {
                        reason_codes: unsuback.reason_codes.clone(),
                        properties: unsuback.properties.clone(),
                    }),
                );
                Ok(None)
            }
            Some(op) => {
                self.inflight.insert(unsuback.pkid, op);
                Err(StateError::WrongPacket)
            }
            None => {
                log::error!("Unsolicited unsuback packet: {:?}", unsuback.pkid);
                Err(StateError::Unsolicited(unsuback.pkid))
            }
        }
    }

    fn handle_incoming_disconn(
        &mut self,
        disconn: &Disconnect,
    ) -> Result<Option<Packet>, StateError> {
        let mut reason_string = None;
        for prop in &disconn.properties {
            if let Property::ReasonString(reason) = prop {
                reason_string = Some(reason.clone());
            }
        }
        Err(StateError::ServerDisconnect {
            reason_code: disconn.reason_code,
            reason_string,
        })
    }

    fn handle_incoming_auth(&mut self) -> Result<Option<Packet>, StateError> {
        if !self.auth_configured {
            return Err(StateError::UnexpectedAuth);
        }

        // The broker ends an enhanced authentication exchange with an AUTH
        // carrying reason Success; intermediate steps would need data from
        // the configured authentication method, which the connect packet
        // already supplied.
        Ok(None)
    }

    /// Validates a publish against the broker limits, assigns the packet
    /// identifier and hands the wire packet to the event loop.
    fn outgoing_publish(
        &mut self,
        mut publish: Publish,
        mut done: Option<PublishTx>,
    ) -> Result<Option<Packet>, StateError> {
        // fail fast against the broker limits, before a pid is taken
        if publish.qos > self.limits.maximum_qos {
            complete(&mut done, Err(ClientError::QosNotSupported(publish.qos)));
            return Ok(None);
        }
        if publish.retain && !self.limits.retain_available {
            complete(&mut done, Err(ClientError::RetainNotAvailable));
            return Ok(None);
        }
        for property in &publish.properties {
            if let Property::TopicAlias(alias) = property {
                if *alias == 0 || *alias > self.limits.topic_alias_maximum {
                    complete(
                        &mut done,
                        Err(ClientError::TopicAliasMaximum {
                            alias: *alias,
                            max: self.limits.topic_alias_maximum,
                        }),
                    );
                    return Ok(None);
                }
            }
        }

        if publish.qos == QoS::AtMostOnce {
            if let Err(error) = self.check_size(&publish) {
                complete(&mut done, Err(error));
                return Ok(None);
            }

            log::debug!(
                "Publish. Topic = {}, Payload Size = {:?}",
                publish.topic,
                publish.payload.len()
            );
            if let Some(done) = done {
                self.flush_waiters.push(done);
            }

            let publish = self.apply_alias(publish);
            self.events.push_back(Event::Outgoing(Outgoing::Publish(0)));
            return Ok(Some(Packet::Publish(publish)));
        }

        if self.credit == 0 {
            // The event loop suspends request intake while the credit is
            // exhausted; hitting this means a direct submission raced it.
            complete(&mut done, Err(ClientError::PidOverrun));
            return Ok(None);
        }
        let Some(pkid) = self.pids.allocate() else {
            complete(&mut done, Err(ClientError::PidOverrun));
            return Ok(None);
        };
        publish.pkid = pkid;

        if let Err(error) = self.check_size(&publish) {
            self.pids.release(pkid);
            complete(&mut done, Err(error));
            return Ok(None);
        }

        self.credit -= 1;

        log::debug!(
            "Publish. Topic = {}, Pkid = {:?}, Payload Size = {:?}",
            publish.topic,
            publish.pkid,
            publish.payload.len()
        );

        let op = match publish.qos {
            QoS::AtLeastOnce => InflightOp::PublishQoS1 {
                publish: publish.clone(),
                done,
            },
            _ => InflightOp::PublishQoS2 {
                publish: publish.clone(),
                done,
            },
        };
        self.inflight.insert(pkid, op);

        let publish = self.apply_alias(publish);
        self.events
            .push_back(Event::Outgoing(Outgoing::Publish(pkid)));

        Ok(Some(Packet::Publish(publish)))
    }

    fn outgoing_subscribe(
        &mut self,
        mut subscribe: Subscribe,
        mut done: Option<SubscribeTx>,
    ) -> Result<Option<Packet>, StateError> {
        if subscribe.filters.is_empty() {
            complete(&mut done, Err(ClientError::EmptySubscription));
            return Ok(None);
        }

        for filter in &subscribe.filters {
            if topic::has_wildcards(&filter.path) && !self.limits.wildcard_subscription_available {
                complete(&mut done, Err(ClientError::WildcardSubscriptionsNotSupported));
                return Ok(None);
            }
            if topic::shared_subscription(&filter.path).is_some()
                && !self.limits.shared_subscription_available
            {
                complete(&mut done, Err(ClientError::SharedSubscriptionsNotSupported));
                return Ok(None);
            }
        }

        let has_subscription_id = subscribe
            .properties
            .iter()
            .any(|p| matches!(p, Property::SubscriptionIdentifier(_)));
        if has_subscription_id && !self.limits.subscription_identifiers_available {
            complete(
                &mut done,
                Err(ClientError::SubscriptionIdentifiersNotSupported),
            );
            return Ok(None);
        }

        let Some(pkid) = self.pids.allocate() else {
            complete(&mut done, Err(ClientError::PidOverrun));
            return Ok(None);
        };
        subscribe.pkid = pkid;

        let packet = Packet::Subscribe(subscribe);
        if let Err(error) = self.check_packet_size(&packet) {
            self.pids.release(pkid);
            complete(&mut done, Err(error));
            return Ok(None);
        }

        let Packet::Subscribe(subscribe) = &packet else {
            unreachable!()
        };
        log::debug!(
            "Subscribe. Topics = {:?}, Pkid = {:?}",
            subscribe.filters,
            subscribe.pkid
        );

        self.inflight.insert(
            pkid,
            InflightOp::Subscribe {
                filters: subscribe.filters.len(),
                done,
            },
        );
        self.events
            .push_back(Event::Outgoing(Outgoing::Subscribe(pkid)));

        Ok(Some(packet))
    }

    fn outgoing_unsubscribe(
        &mut self,
        mut unsubscribe: Unsubscribe,
        mut done: Option<UnsubscribeTx>,
    ) -> Result<Option<Packet>, StateError> {
        if unsubscribe.filters.is_empty() {
            complete(&mut done, Err(ClientError::EmptySubscription));
            return Ok(None);
        }

        let Some(pkid) = self.pids.allocate() else {
            complete(&mut done, Err(ClientError::PidOverrun));
            return Ok(None);
        };
        unsubscribe.pkid = pkid;

        let packet = Packet::Unsubscribe(unsubscribe);
        if let Err(error) = self.check_packet_size(&packet) {
            self.pids.release(pkid);
            complete(&mut done, Err(error));
            return Ok(None);
        }

        let Packet::Unsubscribe(unsubscribe) = &packet else {
            unreachable!()
        };
        log::debug!(
            "Unsubscribe. Topics = {:?}, Pkid = {:?}",
            unsubscribe.filters,
            unsubscribe.pkid
        );

        self.inflight.insert(
            pkid,
            InflightOp::Unsubscribe {
                filters: unsubscribe.filters.len(),
                done,
            },
        );
        self.events
            .push_back(Event::Outgoing(Outgoing::Unsubscribe(pkid)));

        Ok(Some(packet))
    }

    fn outgoing_puback(&mut self, puback: PubAck) -> Result<Option<Packet>, StateError> {
        let event = Event::Outgoing(Outgoing::PubAck(puback.pkid));
        self.events.push_back(event);

        Ok(Some(Packet::PubAck(puback)))
    }

    fn outgoing_pubrec(&mut self, pubrec: PubRec) -> Result<Option<Packet>, StateError> {
        let event = Event::Outgoing(Outgoing::PubRec(pubrec.pkid));
        self.events.push_back(event);

        Ok(Some(Packet::PubRec(pubrec)))
    }

    /// Manual acknowledgement of an incoming publish.
    fn outgoing_ack(&mut self, ack: Packet) -> Result<Option<Packet>, StateError> {
        match ack {
            Packet::PubAck(puback) => self.outgoing_puback(puback),
            Packet::PubRec(pubrec) => self.outgoing_pubrec(pubrec),
            _ => Err(StateError::WrongPacket),
        }
    }

    /// Raise a ping request if the connection was write-idle for the whole
    /// keep alive interval.
    ///
    /// Errors if the previous ping request went unanswered, which forces a
    /// reconnect.
    pub(crate) fn outgoing_ping(&mut self, interval: Duration) -> Result<Option<Packet>, StateError> {
        if self.await_pingresp {
            return Err(StateError::AwaitPingResp);
        }

        let elapsed_out = self.last_outgoing.elapsed();
        if elapsed_out < interval {
            // recent writes already reset the broker's keep alive timer
            return Ok(None);
        }

        self.await_pingresp = true;
        self.last_outgoing = Instant::now();

        log::debug!(
            "Pingreq, last incoming packet before {:?}, last outgoing request before {:?}",
            self.last_incoming.elapsed(),
            elapsed_out,
        );

        let event = Event::Outgoing(Outgoing::PingReq);
        self.events.push_back(event);

        Ok(Some(Packet::PingReq(PingReq)))
    }

    /// Record a user initiated disconnect and produce its packet.
    pub(crate) fn outgoing_disconnect(&mut self, disconnect: Disconnect) -> Packet {
        log::debug!("Disconnect with reason {:?}", disconnect.reason_code);
        self.events.push_back(Event::Outgoing(Outgoing::Disconnect));
        Packet::Disconnect(disconnect)
    }

    fn release_credit(&mut self) {
        self.credit = self
            .credit
            .saturating_add(1)
            .min(self.limits.receive_maximum);
    }

    fn check_size(&self, publish: &Publish) -> Result<(), ClientError> {
        let pkt_size = publish.size().map_err(|_| ClientError::PacketTooLarge {
            pkt_size: u32::MAX,
            max: self.limits.maximum_packet_size,
        })?;
        if pkt_size > self.limits.maximum_packet_size {
            return Err(ClientError::PacketTooLarge {
                pkt_size,
                max: self.limits.maximum_packet_size,
            });
        }
        Ok(())
    }

    fn check_packet_size(&self, packet: &Packet) -> Result<(), ClientError> {
        let pkt_size = packet.size().map_err(|_| ClientError::PacketTooLarge {
            pkt_size: u32::MAX,
            max: self.limits.maximum_packet_size,
        })?;
        if pkt_size > self.limits.maximum_packet_size {
            return Err(ClientError::PacketTooLarge {
                pkt_size,
                max: self.limits.maximum_packet_size,
            });
        }
        Ok(())
    }

    /// Rewrite the wire copy of a publish according to the alias policy.
    ///
    /// The in-flight copy keeps the full topic so retransmissions after a
    /// reconnect re-establish the mapping.
    fn apply_alias(&mut self, mut publish: Publish) -> Publish {
        let explicit = publish
            .properties
            .iter()
            .any(|p| matches!(p, Property::TopicAlias(_)));
        if explicit {
            return publish;
        }

        if let Some((alias, send_full_topic)) = self.aliases_out.assign(&publish.topic) {
            publish.properties.add(Property::TopicAlias(alias));
            if !send_full_topic {
                publish.topic.clear();
            }
        }
        publish
    }
}

/// Deliver a completion exactly once. The receiving side may be gone, which
/// simply means nobody is interested in the result anymore.
fn complete<T>(done: &mut Option<tokio::sync::oneshot::Sender<T>>, value: T) {
    if let Some(done) = done.take() {
        let _ = done.send(value);
    }
}

/// Completion sender for a user initiated disconnect, consumed by the event
/// loop after the packet was flushed.
pub(crate) fn complete_disconnect(done: Option<DisconnectTx>, value: Result<(), ClientError>) {
    if let Some(done) = done {
        let _ = done.send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mqtt5_codec::{
        properties, PubAckReasonCode, PubCompReasonCode, PubRecReasonCode, SubscribeReasonCode,
    };
    use tokio::sync::oneshot;

    use crate::client::PublishAck;

    fn build_state() -> (MqttState, flume::Receiver<Message>) {
        build_state_with_capacity(16)
    }

    fn build_state_with_capacity(capacity: usize) -> (MqttState, flume::Receiver<Message>) {
        let (tx, rx) = flume::bounded(capacity);
        let mut state = MqttState::new(false, false, 10, false, tx);
        state.handle_connack(&ConnAck::new(false));
        let _ = state.get_event();
        (state, rx)
    }

    fn connack_with(properties: mqtt5_codec::Properties) -> ConnAck {
        let mut connack = ConnAck::new(false);
        connack.properties = properties;
        connack
    }

    fn publish_request(
        topic: &str,
        qos: QoS,
    ) -> (Publish, Option<PublishTx>, oneshot::Receiver<Result<PublishAck, ClientError>>) {
        let publish = Publish::new(topic, qos, &b"payload"[..]);
        let (done, completion) = oneshot::channel();
        (publish, Some(done), completion)
    }

    fn incoming_publish(topic: &str, qos: QoS, pkid: u16) -> Publish {
        let mut publish = Publish::new(topic, qos, &b"payload"[..]);
        publish.pkid = pkid;
        publish
    }

    #[test]
    fn qos1_publish_completes_on_puback_and_frees_its_pid() {
        let (mut state, _rx) = build_state();

        let (publish, done, mut completion) = publish_request("t", QoS::AtLeastOnce);
        let outgoing = state.outgoing_publish(publish, done).unwrap().unwrap();
        match outgoing {
            Packet::Publish(p) => assert_eq!(p.pkid, 1),
            packet => panic!("Invalid network request: {:?}", packet),
        }
        assert_eq!(state.inflight(), 1);

        state
            .handle_incoming_packet(Packet::PubAck(PubAck::new(1)))
            .unwrap();

        assert_eq!(state.inflight(), 0);
        match completion.try_recv().unwrap() {
            Ok(PublishAck::PubAck { reason, .. }) => {
                assert_eq!(reason, PubAckReasonCode::Success);
            }
            ack => panic!("Unexpected completion: {:?}", ack),
        }
    }

    #[test]
    fn retained_publish_is_refused_without_any_bytes_sent() {
        let (mut state, _rx) = build_state();
        state.handle_connack(&connack_with(properties![Property::RetainAvailable(false)]));

        let (mut publish, done, mut completion) = publish_request("t", QoS::AtLeastOnce);
        publish.retain = true;
        let outgoing = state.outgoing_publish(publish, done).unwrap();

        assert!(outgoing.is_none());
        assert_eq!(state.inflight(), 0);
        assert_eq!(
            completion.try_recv().unwrap(),
            Err(ClientError::RetainNotAvailable)
        );
    }

    #[test]
    fn qos_above_the_broker_maximum_is_refused() {
        let (mut state, _rx) = build_state();
        state.handle_connack(&connack_with(properties![Property::MaximumQos(1)]));

        let (publish, done, mut completion) = publish_request("t", QoS::ExactlyOnce);
        let outgoing = state.outgoing_publish(publish, done).unwrap();

        assert!(outgoing.is_none());
        assert_eq!(
            completion.try_recv().unwrap(),
            Err(ClientError::QosNotSupported(QoS::ExactlyOnce))
        );
    }

    #[test]
    fn oversized_publish_is_refused_and_releases_its_pid() {
        let (mut state, _rx) = build_state();
        state.handle_connack(&connack_with(properties![Property::MaximumPacketSize(32)]));

        let publish = Publish::new("t", QoS::AtLeastOnce, vec![0u8; 64]);
        let (done, mut completion) = oneshot::channel();
        let outgoing = state.outgoing_publish(publish, Some(done)).unwrap();

        assert!(outgoing.is_none());
        assert!(matches!(
            completion.try_recv().unwrap(),
            Err(ClientError::PacketTooLarge { .. })
        ));

        // the pid taken during validation is free again
        let (publish, done, _completion) = publish_request("t", QoS::AtLeastOnce);
        let outgoing = state.outgoing_publish(publish, done).unwrap().unwrap();
        match outgoing {
            Packet::Publish(p) => assert_eq!(state.inflight(), 1, "pkid = {}", p.pkid),
            packet => panic!("Invalid network request: {:?}", packet),
        }
    }

    #[test]
    fn session_present_reconnect_replays_publishes_in_pid_order() {
        let (mut state, _rx) = build_state();

        let (publish1, done1, _c1) = publish_request("t1", QoS::AtLeastOnce);
        let (publish2, done2, _c2) = publish_request("t2", QoS::AtLeastOnce);
        state.outgoing_publish(publish1, done1).unwrap();
        state.outgoing_publish(publish2, done2).unwrap();

        let pending = state.replay();
        assert_eq!(pending.len(), 2);
        match (&pending[0], &pending[1]) {
            (Packet::Publish(first), Packet::Publish(second)) => {
                assert_eq!(first.pkid, 1);
                assert_eq!(second.pkid, 2);
                assert!(first.dup);
                assert!(second.dup);
                assert_eq!(first.topic, "t1");
                assert_eq!(second.topic, "t2");
            }
            pending => panic!("Unexpected replay packets: {:?}", pending),
        }

        // the operations are still in flight, their acks complete them
        state
            .handle_incoming_packet(Packet::PubAck(PubAck::new(1)))
            .unwrap();
        state
            .handle_incoming_packet(Packet::PubAck(PubAck::new(2)))
            .unwrap();
        assert_eq!(state.inflight(), 0);
    }

    #[test]
    fn qos2_past_pubrec_replays_pubrel_without_dup() {
        let (mut state, _rx) = build_state();

        let (publish, done, _completion) = publish_request("t", QoS::ExactlyOnce);
        state.outgoing_publish(publish, done).unwrap();
        let outgoing = state
            .handle_incoming_packet(Packet::PubRec(PubRec::new(1)))
            .unwrap();
        assert!(matches!(outgoing, Some(Packet::PubRel(_))));

        let pending = state.replay();
        assert_eq!(pending.len(), 1);
        match &pending[0] {
            Packet::PubRel(pubrel) => assert_eq!(pubrel.pkid, 1),
            packet => panic!("Unexpected replay packet: {:?}", packet),
        }
    }

    #[test]
    fn clean_session_reconnect_expires_operations_and_reuses_pids() {
        let (mut state, _rx) = build_state();

        let (publish1, done1, mut c1) = publish_request("t1", QoS::AtLeastOnce);
        let (publish2, done2, mut c2) = publish_request("t2", QoS::ExactlyOnce);
        state.outgoing_publish(publish1, done1).unwrap();
        state.outgoing_publish(publish2, done2).unwrap();

        state.session_reset();

        assert_eq!(c1.try_recv().unwrap(), Err(ClientError::SessionExpired));
        assert_eq!(c2.try_recv().unwrap(), Err(ClientError::SessionExpired));
        assert_eq!(state.inflight(), 0);

        // a fresh session starts over at pid 1
        let (publish, done, _completion) = publish_request("t", QoS::AtLeastOnce);
        let outgoing = state.outgoing_publish(publish, done).unwrap().unwrap();
        match outgoing {
            Packet::Publish(p) => assert_eq!(p.pkid, 1),
            packet => panic!("Invalid network request: {:?}", packet),
        }
    }

    #[test]
    fn subscribes_are_not_replayed_they_expire() {
        let (mut state, _rx) = build_state();

        let subscribe = Subscribe::new(
            mqtt5_codec::Filter::new("a/#".to_owned(), QoS::AtLeastOnce),
            None,
        );
        let (done, mut completion) = oneshot::channel();
        state.outgoing_subscribe(subscribe, Some(done)).unwrap();

        let pending = state.replay();
        assert!(pending.is_empty());
        assert_eq!(
            completion.try_recv().unwrap(),
            Err(ClientError::SessionExpired)
        );
    }

    #[test]
    fn subscribe_completes_with_one_reason_code_per_filter() {
        let (mut state, rx) = build_state();

        let subscribe = Subscribe::new(
            mqtt5_codec::Filter::new("a/#".to_owned(), QoS::AtLeastOnce),
            None,
        );
        let (done, mut completion) = oneshot::channel();
        let outgoing = state.outgoing_subscribe(subscribe, Some(done)).unwrap();
        assert!(matches!(outgoing, Some(Packet::Subscribe(_))));

        let suback = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        state
            .handle_incoming_packet(Packet::SubAck(suback))
            .unwrap();

        let ack = completion.try_recv().unwrap().unwrap();
        assert_eq!(
            ack.reason_codes,
            vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]
        );

        // the broker forwards a matching message, we ack and deliver it
        let publish = incoming_publish("a/b", QoS::AtLeastOnce, 100);
        let outgoing = state
            .handle_incoming_packet(Packet::Publish(publish))
            .unwrap();
        match outgoing {
            Some(Packet::PubAck(puback)) => assert_eq!(puback.pkid, 100),
            packet => panic!("Invalid network request: {:?}", packet),
        }

        let message = rx.try_recv().unwrap();
        assert_eq!(message.topic, "a/b");
        assert_eq!(&message.payload[..], b"payload");
    }

    #[test]
    fn suback_with_wrong_reason_code_count_is_a_protocol_error() {
        let (mut state, _rx) = build_state();

        let subscribe = Subscribe::new(
            mqtt5_codec::Filter::new("a/#".to_owned(), QoS::AtLeastOnce),
            None,
        );
        state.outgoing_subscribe(subscribe, None).unwrap();

        let suback = SubAck::new(
            1,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::NotAuthorized,
            ],
        );
        assert!(matches!(
            state.handle_incoming_packet(Packet::SubAck(suback)),
            Err(StateError::WrongPacket)
        ));
    }

    #[test]
    fn wildcard_subscribe_is_refused_when_unsupported() {
        let (mut state, _rx) = build_state();
        state.handle_connack(&connack_with(properties![
            Property::WildcardSubscriptionAvailable(false)
        ]));

        let subscribe = Subscribe::new(
            mqtt5_codec::Filter::new("a/#".to_owned(), QoS::AtLeastOnce),
            None,
        );
        let (done, mut completion) = oneshot::channel();
        let outgoing = state.outgoing_subscribe(subscribe, Some(done)).unwrap();

        assert!(outgoing.is_none());
        assert_eq!(
            completion.try_recv().unwrap(),
            Err(ClientError::WildcardSubscriptionsNotSupported)
        );
    }

    #[test]
    fn cancel_completes_every_pending_operation_exactly_once() {
        let (mut state, _rx) = build_state();

        let (publish, done, mut c1) = publish_request("t", QoS::AtLeastOnce);
        state.outgoing_publish(publish, done).unwrap();

        let subscribe = Subscribe::new(
            mqtt5_codec::Filter::new("a/#".to_owned(), QoS::AtLeastOnce),
            None,
        );
        let (done, mut c2) = oneshot::channel();
        state.outgoing_subscribe(subscribe, Some(done)).unwrap();

        state.fail_all_pending(|| ClientError::Cancelled);

        assert_eq!(c1.try_recv().unwrap(), Err(ClientError::Cancelled));
        assert_eq!(c2.try_recv().unwrap(), Err(ClientError::Cancelled));
        assert_eq!(state.inflight(), 0);

        // completions fired exactly once, the senders are gone
        assert!(c1.try_recv().is_err());
        assert!(c2.try_recv().is_err());
    }

    #[test]
    fn flow_control_credit_is_bounded_by_the_receive_maximum() {
        let (mut state, _rx) = build_state();
        state.handle_connack(&connack_with(properties![Property::ReceiveMaximum(2)]));

        let (publish1, done1, _c1) = publish_request("t", QoS::AtLeastOnce);
        let (publish2, done2, _c2) = publish_request("t", QoS::AtLeastOnce);
        state.outgoing_publish(publish1, done1).unwrap();
        assert!(state.has_credit());
        state.outgoing_publish(publish2, done2).unwrap();

        // the event loop suspends request intake at this point
        assert!(!state.has_credit());
        assert_eq!(state.inflight(), 2);

        state
            .handle_incoming_packet(Packet::PubAck(PubAck::new(1)))
            .unwrap();
        assert!(state.has_credit());
    }

    #[test]
    fn qos2_publish_runs_the_full_handshake() {
        let (mut state, _rx) = build_state();

        let (publish, done, mut completion) = publish_request("t", QoS::ExactlyOnce);
        let outgoing = state.outgoing_publish(publish, done).unwrap().unwrap();
        match outgoing {
            Packet::Publish(p) => assert_eq!(p.pkid, 1),
            packet => panic!("Invalid network request: {:?}", packet),
        }

        let outgoing = state
            .handle_incoming_packet(Packet::PubRec(PubRec::new(1)))
            .unwrap();
        match outgoing {
            Some(Packet::PubRel(pubrel)) => assert_eq!(pubrel.pkid, 1),
            packet => panic!("Invalid network request: {:?}", packet),
        }
        // not complete yet
        assert!(completion.try_recv().is_err());
        assert!(!state.has_credit() || state.inflight() == 1);

        state
            .handle_incoming_packet(Packet::PubComp(PubComp::new(1)))
            .unwrap();
        match completion.try_recv().unwrap() {
            Ok(PublishAck::PubComp { reason, .. }) => {
                assert_eq!(reason, PubCompReasonCode::Success);
            }
            ack => panic!("Unexpected completion: {:?}", ack),
        }
        assert_eq!(state.inflight(), 0);
    }

    #[test]
    fn refusing_pubrec_short_circuits_the_qos2_handshake() {
        let (mut state, _rx) = build_state();
        state.handle_connack(&connack_with(properties![Property::ReceiveMaximum(1)]));

        let (publish, done, mut completion) = publish_request("t", QoS::ExactlyOnce);
        state.outgoing_publish(publish, done).unwrap();
        assert!(!state.has_credit());

        let mut pubrec = PubRec::new(1);
        pubrec.reason = PubRecReasonCode::QuotaExceeded;
        let outgoing = state
            .handle_incoming_packet(Packet::PubRec(pubrec))
            .unwrap();

        // no pubrel follows, pid and credit are back
        assert!(outgoing.is_none());
        assert!(state.has_credit());
        assert_eq!(state.inflight(), 0);
        match completion.try_recv().unwrap() {
            Ok(PublishAck::PubRec { reason, .. }) => {
                assert_eq!(reason, PubRecReasonCode::QuotaExceeded);
            }
            ack => panic!("Unexpected completion: {:?}", ack),
        }
    }

    #[test]
    fn duplicate_incoming_qos2_publish_is_delivered_only_once() {
        let (mut state, rx) = build_state();

        let publish = incoming_publish("a/b", QoS::ExactlyOnce, 5);
        let outgoing = state
            .handle_incoming_packet(Packet::Publish(publish.clone()))
            .unwrap();
        assert!(matches!(outgoing, Some(Packet::PubRec(_))));

        // retransmission of the same pid before the release
        let mut duplicate = publish.clone();
        duplicate.dup = true;
        let outgoing = state
            .handle_incoming_packet(Packet::Publish(duplicate))
            .unwrap();
        assert!(matches!(outgoing, Some(Packet::PubRec(_))));

        assert_eq!(rx.len(), 1);

        let outgoing = state
            .handle_incoming_packet(Packet::PubRel(PubRel::new(5)))
            .unwrap();
        match outgoing {
            Some(Packet::PubComp(pubcomp)) => assert_eq!(pubcomp.pkid, 5),
            packet => panic!("Invalid network request: {:?}", packet),
        }

        // after the release the pid may be used for a new delivery
        let outgoing = state
            .handle_incoming_packet(Packet::Publish(publish))
            .unwrap();
        assert!(matches!(outgoing, Some(Packet::PubRec(_))));
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn unsolicited_acks_are_protocol_errors() {
        let (mut state, _rx) = build_state();

        assert!(matches!(
            state.handle_incoming_packet(Packet::PubAck(PubAck::new(101))),
            Err(StateError::Unsolicited(101))
        ));
        assert!(matches!(
            state.handle_incoming_packet(Packet::PubRel(PubRel::new(101))),
            Err(StateError::Unsolicited(101))
        ));
    }

    #[test]
    fn outgoing_ping_requires_the_previous_response() {
        let (mut state, _rx) = build_state();

        let ping = state.outgoing_ping(Duration::ZERO).unwrap();
        assert!(matches!(ping, Some(Packet::PingReq(_))));

        // no pingresp yet
        match state.outgoing_ping(Duration::ZERO) {
            Err(StateError::AwaitPingResp) => {}
            result => panic!("Should await ping response: {:?}", result),
        }

        state
            .handle_incoming_packet(Packet::PingResp(mqtt5_codec::PingResp))
            .unwrap();
        let ping = state.outgoing_ping(Duration::ZERO).unwrap();
        assert!(matches!(ping, Some(Packet::PingReq(_))));
    }

    #[test]
    fn ping_is_skipped_while_writes_keep_the_connection_busy() {
        let (mut state, _rx) = build_state();

        let (publish, done, _completion) = publish_request("t", QoS::AtLeastOnce);
        state
            .handle_outgoing_request(Request::Publish { publish, done })
            .unwrap();

        // a write just happened, the interval has not been idle
        let ping = state.outgoing_ping(Duration::from_secs(30)).unwrap();
        assert!(ping.is_none());
        assert!(!state.await_pingresp);
    }

    #[test]
    fn outgoing_topic_aliases_follow_the_lru_policy() {
        let (tx, _rx) = flume::bounded(16);
        let mut state = MqttState::new(false, true, 0, false, tx);
        state.handle_connack(&connack_with(properties![Property::TopicAliasMaximum(2)]));

        let first = |state: &mut MqttState, topic: &str| {
            let (publish, done, _completion) = publish_request(topic, QoS::AtLeastOnce);
            match state.outgoing_publish(publish, done).unwrap().unwrap() {
                Packet::Publish(p) => p,
                packet => panic!("Invalid network request: {:?}", packet),
            }
        };

        // first use carries topic and alias
        let p = first(&mut state, "sensors/one");
        assert_eq!(p.topic, "sensors/one");
        assert!(p.properties.iter().any(|prop| *prop == Property::TopicAlias(1)));

        // the hit sends the alias with an empty topic
        let p = first(&mut state, "sensors/one");
        assert_eq!(p.topic, "");
        assert!(p.properties.iter().any(|prop| *prop == Property::TopicAlias(1)));

        // the in-flight copies keep the full topic for replay
        let pending = state.replay();
        for packet in pending {
            match packet {
                Packet::Publish(p) => assert_eq!(p.topic, "sensors/one"),
                packet => panic!("Unexpected replay packet: {:?}", packet),
            }
        }
    }

    #[test]
    fn explicit_alias_above_the_broker_maximum_is_refused() {
        let (mut state, _rx) = build_state();
        state.handle_connack(&connack_with(properties![Property::TopicAliasMaximum(5)]));

        let (mut publish, done, mut completion) = publish_request("t", QoS::AtLeastOnce);
        publish.properties.add(Property::TopicAlias(9));
        let outgoing = state.outgoing_publish(publish, done).unwrap();

        assert!(outgoing.is_none());
        assert_eq!(
            completion.try_recv().unwrap(),
            Err(ClientError::TopicAliasMaximum { alias: 9, max: 5 })
        );
    }

    #[test]
    fn incoming_topic_aliases_are_expanded_before_delivery() {
        let (mut state, rx) = build_state();

        let mut publish = incoming_publish("long/topic/name", QoS::AtMostOnce, 0);
        publish.properties.add(Property::TopicAlias(3));
        state
            .handle_incoming_packet(Packet::Publish(publish))
            .unwrap();

        let mut publish = incoming_publish("", QoS::AtMostOnce, 0);
        publish.properties.add(Property::TopicAlias(3));
        state
            .handle_incoming_packet(Packet::Publish(publish))
            .unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.topic, "long/topic/name");
        assert_eq!(second.topic, "long/topic/name");
    }

    #[test]
    fn incoming_alias_outside_our_maximum_is_a_protocol_error() {
        // we advertised a maximum of 10
        let (mut state, _rx) = build_state();

        let mut publish = incoming_publish("t", QoS::AtMostOnce, 0);
        publish.properties.add(Property::TopicAlias(11));
        assert!(matches!(
            state.handle_incoming_packet(Packet::Publish(publish)),
            Err(StateError::InvalidAlias { alias: 11, max: 10 })
        ));
    }

    #[test]
    fn inbound_channel_overflow_is_surfaced() {
        let (mut state, _rx) = build_state_with_capacity(1);

        state
            .handle_incoming_packet(Packet::Publish(incoming_publish("a", QoS::AtMostOnce, 0)))
            .unwrap();
        assert!(matches!(
            state.handle_incoming_packet(Packet::Publish(incoming_publish("b", QoS::AtMostOnce, 0))),
            Err(StateError::InboundChannelFull)
        ));
    }

    #[test]
    fn server_disconnect_surfaces_its_reason_code() {
        let (mut state, _rx) = build_state();

        let disconnect = Disconnect::with_reason(DisconnectReasonCode::ServerShuttingDown);
        match state.handle_incoming_packet(Packet::Disconnect(disconnect)) {
            Err(StateError::ServerDisconnect { reason_code, .. }) => {
                assert_eq!(reason_code, DisconnectReasonCode::ServerShuttingDown);
            }
            result => panic!("Unexpected result: {:?}", result),
        }
    }

    #[test]
    fn qos0_publishes_complete_on_flush() {
        let (mut state, _rx) = build_state();

        let (publish, done, mut completion) = publish_request("t", QoS::AtMostOnce);
        let outgoing = state.outgoing_publish(publish, done).unwrap();
        assert!(matches!(outgoing, Some(Packet::Publish(_))));
        assert_eq!(state.inflight(), 0);

        // nothing before the flush
        assert!(completion.try_recv().is_err());
        state.flushed();
        assert_eq!(completion.try_recv().unwrap(), Ok(PublishAck::Written));
    }
}
