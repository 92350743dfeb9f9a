use std::time::Duration;

use bytes::Bytes;
use mqtt5_codec::{LastWill, Login, Properties, Property};

use super::{ConnectOptions, MqttOptions, NetworkOptions};
use crate::Transport;
#[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
use crate::TlsConfiguration;

/// Create [`MqttOptions`](super::MqttOptions) using a builder pattern.
pub struct OptionBuilder {
    // network options
    tcp_send_buffer_size: Option<u32>,
    tcp_recv_buffer_size: Option<u32>,
    tcp_nodelay: bool,
    conn_timeout: u64,
    // mqtt options
    transport: Transport,
    brokers: String,
    default_port: u16,

    client_id: Option<String>,
    keep_alive: Duration,
    clean_start: bool,
    credentials: Option<Login>,
    last_will: Option<LastWill>,
    session_expiry_interval: Option<u32>,
    topic_alias_maximum: Option<u16>,
    request_response_information: Option<bool>,
    request_problem_information: Option<bool>,
    user_properties: Vec<(String, String)>,
    authentication_method: Option<String>,
    authentication_data: Option<Bytes>,

    max_packet_size_in: u32,
    max_packet_size_out: u32,
    receive_max_in: u16,
    inbound_capacity: usize,
    pending_throttle: Duration,
    manual_acks: bool,
    topic_aliases_out: bool,
}

impl OptionBuilder {
    /// Create a new `OptionBuilder` for TCP connections
    ///
    /// `brokers` is a comma separated list of `host[:port]` entries,
    /// `default_port` applies to entries without an explicit port.
    pub fn new_tcp(brokers: impl Into<String>, default_port: u16) -> Self {
        Self::new(Transport::Tcp, brokers.into(), default_port)
    }

    /// Create a new `OptionBuilder` for TLS connections
    #[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
    pub fn new_tls(
        brokers: impl Into<String>,
        default_port: u16,
        config: TlsConfiguration,
    ) -> Self {
        Self::new(Transport::Tls(config), brokers.into(), default_port)
    }

    /// Create a new `OptionBuilder` for websocket connections
    ///
    /// Broker list entries are expected to be full URLs, e.g. `ws://host:8000/mqtt`.
    #[cfg(feature = "websocket")]
    pub fn new_ws(brokers: impl Into<String>, default_port: u16) -> Self {
        Self::new(Transport::Ws, brokers.into(), default_port)
    }

    /// Create a new `OptionBuilder` for secure websocket connections
    #[cfg(all(feature = "websocket", feature = "use-rustls"))]
    pub fn new_wss(
        brokers: impl Into<String>,
        default_port: u16,
        config: TlsConfiguration,
    ) -> Self {
        Self::new(Transport::Wss(config), brokers.into(), default_port)
    }

    fn new(transport: Transport, brokers: String, default_port: u16) -> Self {
        Self {
            // default network options
            tcp_send_buffer_size: None,
            tcp_recv_buffer_size: None,
            tcp_nodelay: false,
            conn_timeout: 10,
            // default mqtt options
            transport,
            brokers,
            default_port,
            client_id: None,
            keep_alive: Duration::from_secs(60),
            clean_start: true,
            credentials: None,
            last_will: None,
            session_expiry_interval: None,
            topic_alias_maximum: None,
            request_response_information: None,
            request_problem_information: None,
            user_properties: Vec::new(),
            authentication_method: None,
            authentication_data: None,
            max_packet_size_in: 10 * 1024,
            max_packet_size_out: 10 * 1024,
            receive_max_in: 100,
            inbound_capacity: 1024,
            pending_throttle: Duration::from_micros(0),
            manual_acks: false,
            topic_aliases_out: false,
        }
    }

    pub fn finalize(self) -> MqttOptions {
        let client_id = self.client_id.unwrap_or_default();
        if client_id.is_empty() && !self.clean_start {
            // We do not panic or return an error,
            // but at least warn the user of this misconfiguration.
            log::warn!("An empty client id without a clean session will be rejected.");
        }

        let network_options = NetworkOptions {
            tcp_send_buffer_size: self.tcp_send_buffer_size,
            tcp_recv_buffer_size: self.tcp_recv_buffer_size,
            tcp_nodelay: self.tcp_nodelay,
            conn_timeout: self.conn_timeout,
        };

        let mut connect_properties = Properties::new();
        connect_properties.add(Property::ReceiveMaximum(self.receive_max_in));
        connect_properties.add(Property::MaximumPacketSize(self.max_packet_size_in));

        if let Some(interval) = self.session_expiry_interval {
            connect_properties.add(Property::SessionExpiryInterval(interval));
        }
        if let Some(x) = self.topic_alias_maximum {
            connect_properties.add(Property::TopicAliasMaximum(x));
        }
        if let Some(x) = self.request_response_information {
            connect_properties.add(Property::RequestResponseInformation(x));
        }
        if let Some(x) = self.request_problem_information {
            connect_properties.add(Property::RequestProblemInformation(x));
        }
        for (name, value) in self.user_properties {
            connect_properties.add(Property::UserProperty { name, value });
        }
        if let Some(x) = self.authentication_method {
            connect_properties.add(Property::AuthenticationMethod(x));
        }
        if let Some(x) = self.authentication_data {
            connect_properties.add(Property::AuthenticationData(x));
        }

        let connect_options = ConnectOptions {
            client_id,
            clean_start: self.clean_start,
            credentials: self.credentials,
            last_will: self.last_will,
            properties: connect_properties,
        };

        MqttOptions {
            brokers: self.brokers,
            default_port: self.default_port,
            transport: self.transport,
            keep_alive: self.keep_alive,
            max_packet_size_in: self.max_packet_size_in,
            max_packet_size_out: self.max_packet_size_out,
            receive_max_in: self.receive_max_in,
            inbound_capacity: self.inbound_capacity,
            pending_throttle: self.pending_throttle,
            manual_acks: self.manual_acks,
            topic_aliases_out: self.topic_aliases_out,
            connect_options,
            network_options,
        }
    }
}

// Network options
impl OptionBuilder {
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn tcp_send_buffer_size(mut self, size: u32) -> Self {
        self.tcp_send_buffer_size = Some(size);
        self
    }

    pub fn tcp_recv_buffer_size(mut self, size: u32) -> Self {
        self.tcp_recv_buffer_size = Some(size);
        self
    }

    /// Set the connection timeout in seconds
    pub fn connection_timeout(mut self, timeout: u64) -> Self {
        self.conn_timeout = timeout;
        self
    }
}

// MQTT options
impl OptionBuilder {
    /// Replace the transport selected by the constructor
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Set the client identifier. The broker assigns one if left empty.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Set the keep alive interval. `Duration::ZERO` disables keep alive.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Ask the broker to start with a fresh session
    pub fn clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    /// Username and password sent in the connect packet
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Login::new(username, password));
        self
    }

    /// Message the broker publishes on our behalf on an ungraceful disconnect
    pub fn last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }

    /// Ask the broker to keep session state around after disconnecting
    pub fn session_expiry_interval(mut self, interval: u32) -> Self {
        self.session_expiry_interval = Some(interval);
        self
    }

    /// The highest topic alias we accept from the broker
    pub fn topic_alias_maximum(mut self, max: u16) -> Self {
        self.topic_alias_maximum = Some(max);
        self
    }

    pub fn request_response_information(mut self, request: bool) -> Self {
        self.request_response_information = Some(request);
        self
    }

    pub fn request_problem_information(mut self, request: bool) -> Self {
        self.request_problem_information = Some(request);
        self
    }

    /// Add a user property to the connect packet
    pub fn user_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((name.into(), value.into()));
        self
    }

    /// Enhanced authentication method and initial data
    pub fn authentication(mut self, method: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.authentication_method = Some(method.into());
        self.authentication_data = Some(data.into());
        self
    }

    /// Maximum size of incoming packets
    pub fn max_packet_size_in(mut self, size: u32) -> Self {
        self.max_packet_size_in = size;
        self
    }

    /// Maximum size of outgoing packets, may be lowered by the broker
    pub fn max_packet_size_out(mut self, size: u32) -> Self {
        self.max_packet_size_out = size;
        self
    }

    /// Number of unacknowledged incoming QoS1/QoS2 publishes we accept
    pub fn receive_maximum(mut self, max: u16) -> Self {
        self.receive_max_in = max;
        self
    }

    /// Capacity of the incoming application message channel
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    /// Minimum delay between packets retransmitted on session resume
    pub fn pending_throttle(mut self, throttle: Duration) -> Self {
        self.pending_throttle = throttle;
        self
    }

    /// Disable automatic acknowledgement of incoming publishes
    pub fn manual_acks(mut self, manual: bool) -> Self {
        self.manual_acks = manual;
        self
    }

    /// Assign topic aliases to outgoing publishes when the broker allows them
    pub fn topic_aliases_out(mut self, enable: bool) -> Self {
        self.topic_aliases_out = enable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_properties_reflect_builder_settings() {
        let options = OptionBuilder::new_tcp("localhost", 1883)
            .client_id("test-1")
            .session_expiry_interval(3600)
            .user_property("origin", "unit-test")
            .finalize();

        let properties = &options.connect_options.properties;
        assert!(properties
            .iter()
            .any(|p| *p == Property::ReceiveMaximum(100)));
        assert!(properties
            .iter()
            .any(|p| *p == Property::SessionExpiryInterval(3600)));
        assert!(properties.iter().any(|p| matches!(
            p,
            Property::UserProperty { name, .. } if name == "origin"
        )));
    }

    #[test]
    fn defaults_are_sensible() {
        let options = OptionBuilder::new_tcp("localhost", 1883).finalize();
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert!(options.clean_session());
        assert_eq!(options.connection_timeout(), 10);
        assert!(!options.manual_acks());
    }
}
