//! An asynchronous MQTT 5.0 client.
//!
//! The crate is split into a clone-able request handle, the [`AsyncClient`],
//! and an [`EventLoop`] that owns the network connection and all protocol
//! state. The event loop must be driven (by calling [`EventLoop::poll`] in a
//! loop or by spawning [`EventLoop::run`]) for the client to make progress.
//!
//! ```no_run
//! use mqtt5_client::{AsyncClient, OptionBuilder, QoS};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = OptionBuilder::new_tcp("broker1:1883, broker2", 1883)
//!         .client_id("sensor-17")
//!         .finalize();
//!     let (client, eventloop) = AsyncClient::new(options, 10);
//!
//!     tokio::spawn(eventloop.run());
//!
//!     client.subscribe("state/#", QoS::AtLeastOnce).await.unwrap();
//!     let message = client.receive().await.unwrap();
//!     println!("{}: {:?}", message.topic, message.payload);
//! }
//! ```
//!
//! The event loop reconnects on any transport or protocol error, rotating
//! through the configured broker list with an exponential backoff. In-flight
//! QoS 1 and QoS 2 publishes are replayed when the broker restores the
//! session; otherwise their callers observe a session-expired error.

mod alias;
mod brokers;
mod client;
mod eventloop;
mod framed;
mod options;
mod pid;
mod state;
mod transport;

pub use client::{
    AsyncClient, ClientError, Message, PublishAck, SubscribeAck, UnsubscribeAck,
};
pub use eventloop::{ConnectionError, EventLoop};
pub use options::{MqttOptions, NetworkOptions, OptionBuilder};
pub use state::{MqttState, ServerLimits, StateError};
pub use transport::{Transport, TransportError};
#[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
pub use transport::TlsConfiguration;

pub use mqtt5_codec::{
    topic, ConnAck, ConnectReasonCode, Disconnect, DisconnectReasonCode, Filter, LastWill, Login,
    Packet, Properties, Property, PubAckReasonCode, PubCompReasonCode, PubRecReasonCode, Publish,
    QoS, RetainForwardRule, SubscribeReasonCode, UnsubscribeReasonCode,
};

/// Events which can be yielded by the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Incoming(Packet),
    Outgoing(Outgoing),
}

/// Current outgoing activity on the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outgoing {
    /// Publish packet with packet identifier (0 for QoS 0)
    Publish(u16),
    /// Subscribe packet with packet identifier
    Subscribe(u16),
    /// Unsubscribe packet with packet identifier
    Unsubscribe(u16),
    /// PubAck packet with packet identifier
    PubAck(u16),
    /// PubRec packet with packet identifier
    PubRec(u16),
    /// PubRel packet with packet identifier
    PubRel(u16),
    /// PubComp packet with packet identifier
    PubComp(u16),
    /// Ping request packet
    PingReq,
    /// Disconnect packet
    Disconnect,
}
