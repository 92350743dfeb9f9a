//! High level asynchronous interface to interact with the event loop.

use bytes::Bytes;
use flume::{Receiver, Sender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use mqtt5_codec::{
    topic::{valid_filter, valid_topic},
    Disconnect, DisconnectReasonCode, Filter, Packet, Properties, PubAck, PubAckReasonCode,
    PubCompReasonCode, PubRec, PubRecReasonCode, Publish, QoS, Subscribe, SubscribeReasonCode,
    Unsubscribe, UnsubscribeReasonCode,
};

use crate::{EventLoop, MqttOptions};

/// Errors an operation can complete with
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("The client was cancelled")]
    Cancelled,
    #[error("No packet identifier available")]
    PidOverrun,
    #[error("The broker does not support QoS {0:?}")]
    QosNotSupported(QoS),
    #[error("The broker does not support retained messages")]
    RetainNotAvailable,
    #[error("Topic alias {alias} exceeds the broker maximum of {max}")]
    TopicAliasMaximum { alias: u16, max: u16 },
    #[error("Packet of {pkt_size} bytes exceeds the broker maximum of {max} bytes")]
    PacketTooLarge { pkt_size: u32, max: u32 },
    #[error("The broker does not support wildcard subscriptions")]
    WildcardSubscriptionsNotSupported,
    #[error("The broker does not support subscription identifiers")]
    SubscriptionIdentifiersNotSupported,
    #[error("The broker does not support shared subscriptions")]
    SharedSubscriptionsNotSupported,
    #[error("The session ended before the operation completed")]
    SessionExpired,
    #[error("Receive on a cancelled client")]
    ChannelCancelled,
    #[error("The broker closed the connection: {0:?}")]
    ServerDisconnect(DisconnectReasonCode),
    #[error("Invalid topic name")]
    InvalidTopic,
    #[error("Invalid topic filter")]
    InvalidFilter,
    #[error("A subscribe request needs at least one filter")]
    EmptySubscription,
    #[error("The event loop is not running")]
    EventLoopClosed,
}

/// An application message delivered by the broker.
///
/// The topic is fully expanded; alias resolution happened before delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub pkid: u16,
    pub properties: Properties,
}

/// Successful completion of a publish operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishAck {
    /// A QoS 0 publish reached the network
    Written,
    /// A QoS 1 publish was acknowledged
    PubAck {
        reason: PubAckReasonCode,
        properties: Properties,
    },
    /// A QoS 2 publish completed the full handshake
    PubComp {
        reason: PubCompReasonCode,
        properties: Properties,
    },
    /// A QoS 2 publish was refused at the PubRec stage
    PubRec {
        reason: PubRecReasonCode,
        properties: Properties,
    },
}

/// Successful completion of a subscribe operation.
///
/// `reason_codes` has exactly one entry per filter in the request, in
/// request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub reason_codes: Vec<SubscribeReasonCode>,
    pub properties: Properties,
}

/// Successful completion of an unsubscribe operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeAck {
    pub reason_codes: Vec<UnsubscribeReasonCode>,
    pub properties: Properties,
}

pub(crate) type PublishTx = oneshot::Sender<Result<PublishAck, ClientError>>;
pub(crate) type SubscribeTx = oneshot::Sender<Result<SubscribeAck, ClientError>>;
pub(crate) type UnsubscribeTx = oneshot::Sender<Result<UnsubscribeAck, ClientError>>;
pub(crate) type DisconnectTx = oneshot::Sender<Result<(), ClientError>>;

/// A user request posted onto the event loop.
#[derive(Debug)]
pub(crate) enum Request {
    Publish {
        publish: Publish,
        done: Option<PublishTx>,
    },
    Subscribe {
        subscribe: Subscribe,
        done: Option<SubscribeTx>,
    },
    Unsubscribe {
        unsubscribe: Unsubscribe,
        done: Option<UnsubscribeTx>,
    },
    Ack(Packet),
    Disconnect {
        disconnect: Disconnect,
        done: Option<DisconnectTx>,
    },
}

/// An asynchronous client, communicates with the MQTT [`EventLoop`].
///
/// This is cloneable and can be used to [`publish`](`AsyncClient::publish`),
/// [`subscribe`](`AsyncClient::subscribe`) and [`receive`](`AsyncClient::receive`)
/// through the `EventLoop`, which is to be polled in parallel.
///
/// **NOTE**: The `EventLoop` must be regularly polled (or driven by
/// [`EventLoop::run`]) in order to send, receive and process packets from
/// the broker, i.e. move ahead.
#[derive(Clone, Debug)]
pub struct AsyncClient {
    request_tx: Sender<Request>,
    inbound_rx: Receiver<Message>,
    cancel: CancellationToken,
}

impl AsyncClient {
    /// Create a new `AsyncClient` and its paired [`EventLoop`].
    ///
    /// `cap` specifies the capacity of the bounded request channel.
    pub fn new(options: MqttOptions, cap: usize) -> (AsyncClient, EventLoop) {
        let inbound_capacity = options.inbound_capacity;
        let (inbound_tx, inbound_rx) = flume::bounded(inbound_capacity);
        let (eventloop, request_tx, cancel) = EventLoop::new(options, cap, inbound_tx);

        let client = AsyncClient {
            request_tx,
            inbound_rx,
            cancel,
        };

        (client, eventloop)
    }

    /// Publish an application message.
    ///
    /// Completes when the delivery handshake for the requested QoS level is
    /// done: immediately after the write for QoS 0, on PUBACK for QoS 1 and
    /// on PUBCOMP (or a refusing PUBREC) for QoS 2.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> Result<PublishAck, ClientError> {
        self.handle_publish(topic, qos, retain, payload, None).await
    }

    /// Publish an application message with MQTT 5 properties.
    pub async fn publish_with_properties(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        properties: Properties,
    ) -> Result<PublishAck, ClientError> {
        self.handle_publish(topic, qos, retain, payload, Some(properties))
            .await
    }

    async fn handle_publish(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        properties: Option<Properties>,
    ) -> Result<PublishAck, ClientError> {
        let topic = topic.into();
        if !valid_topic(&topic) {
            return Err(ClientError::InvalidTopic);
        }

        let mut publish = Publish::new(topic, qos, payload);
        publish.retain = retain;
        if let Some(properties) = properties {
            publish.properties = properties;
        }

        let (done, completion) = oneshot::channel();
        self.submit(Request::Publish {
            publish,
            done: Some(done),
        })
        .await?;
        await_completion(completion).await
    }

    /// Subscribe to a single topic filter.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
    ) -> Result<SubscribeAck, ClientError> {
        let filter = Filter::new(filter.into(), qos);
        self.handle_subscribe(Subscribe::new(filter, None)).await
    }

    /// Subscribe to a single topic filter with MQTT 5 properties.
    pub async fn subscribe_with_properties(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        properties: Properties,
    ) -> Result<SubscribeAck, ClientError> {
        let filter = Filter::new(filter.into(), qos);
        self.handle_subscribe(Subscribe::new(filter, Some(properties)))
            .await
    }

    /// Subscribe to multiple topic filters in one request.
    ///
    /// The completion carries one reason code per filter, in request order.
    pub async fn subscribe_many<T>(&self, filters: T) -> Result<SubscribeAck, ClientError>
    where
        T: IntoIterator<Item = Filter>,
    {
        self.handle_subscribe(Subscribe::new_many(filters, None))
            .await
    }

    async fn handle_subscribe(&self, subscribe: Subscribe) -> Result<SubscribeAck, ClientError> {
        if subscribe.filters.is_empty() {
            return Err(ClientError::EmptySubscription);
        }
        if !subscribe.filters.iter().all(|f| valid_filter(&f.path)) {
            return Err(ClientError::InvalidFilter);
        }

        let (done, completion) = oneshot::channel();
        self.submit(Request::Subscribe {
            subscribe,
            done: Some(done),
        })
        .await?;
        await_completion(completion).await
    }

    /// Unsubscribe from a single topic filter.
    pub async fn unsubscribe(
        &self,
        filter: impl Into<String>,
    ) -> Result<UnsubscribeAck, ClientError> {
        self.handle_unsubscribe(Unsubscribe::new(filter.into()))
            .await
    }

    /// Unsubscribe from multiple topic filters in one request.
    pub async fn unsubscribe_many<T, S>(&self, filters: T) -> Result<UnsubscribeAck, ClientError>
    where
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handle_unsubscribe(Unsubscribe::new_many(filters)).await
    }

    async fn handle_unsubscribe(
        &self,
        unsubscribe: Unsubscribe,
    ) -> Result<UnsubscribeAck, ClientError> {
        if unsubscribe.filters.is_empty() {
            return Err(ClientError::EmptySubscription);
        }

        let (done, completion) = oneshot::channel();
        self.submit(Request::Unsubscribe {
            unsubscribe,
            done: Some(done),
        })
        .await?;
        await_completion(completion).await
    }

    /// Receive the next application message.
    ///
    /// Suspends until a message arrives or the client is cancelled.
    pub async fn receive(&self) -> Result<Message, ClientError> {
        self.inbound_rx
            .recv_async()
            .await
            .map_err(|_| ClientError::ChannelCancelled)
    }

    /// Receive the next application message if one is already buffered.
    pub fn try_receive(&self) -> Result<Option<Message>, ClientError> {
        match self.inbound_rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(ClientError::ChannelCancelled),
        }
    }

    /// Acknowledge an incoming publish.
    ///
    /// Only needed if the `manual_acks` flag is set.
    pub async fn ack(&self, message: &Message) -> Result<(), ClientError> {
        if let Some(ack) = get_ack_req(message) {
            self.submit(Request::Ack(ack)).await?;
        }
        Ok(())
    }

    /// Send a DISCONNECT with reason `NormalDisconnection` and shut the client down.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.handle_disconnect(Disconnect::new()).await
    }

    /// Send a DISCONNECT with the given reason code and shut the client down.
    pub async fn disconnect_with(
        &self,
        reason_code: DisconnectReasonCode,
        properties: Properties,
    ) -> Result<(), ClientError> {
        let mut disconnect = Disconnect::with_reason(reason_code);
        disconnect.properties = properties;
        self.handle_disconnect(disconnect).await
    }

    async fn handle_disconnect(&self, disconnect: Disconnect) -> Result<(), ClientError> {
        let (done, completion) = oneshot::channel();
        self.submit(Request::Disconnect {
            disconnect,
            done: Some(done),
        })
        .await?;
        await_completion(completion).await
    }

    /// Cancel the client.
    ///
    /// Every pending operation completes with [`ClientError::Cancelled`] and
    /// the connection is closed without sending a DISCONNECT packet.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn submit(&self, request: Request) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.request_tx
            .send_async(request)
            .await
            .map_err(|_| ClientError::EventLoopClosed)
    }
}

/// Wait for the event loop to resolve an operation.
///
/// A dropped completion sender means the event loop went away mid-operation,
/// which the caller observes as a cancellation.
async fn await_completion<T>(
    completion: oneshot::Receiver<Result<T, ClientError>>,
) -> Result<T, ClientError> {
    match completion.await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Cancelled),
    }
}

fn get_ack_req(message: &Message) -> Option<Packet> {
    let ack = match message.qos {
        QoS::AtMostOnce => return None,
        QoS::AtLeastOnce => Packet::PubAck(PubAck::new(message.pkid)),
        QoS::ExactlyOnce => Packet::PubRec(PubRec::new(message.pkid)),
    };
    Some(ack)
}
