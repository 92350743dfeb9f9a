#[cfg(any(feature = "use-rustls", feature = "websocket"))]
use std::sync::Arc;

#[cfg(feature = "use-rustls")]
use rustls_native_certs::load_native_certs;
#[cfg(feature = "use-native-tls")]
use tokio_native_tls::native_tls;
#[cfg(feature = "use-rustls")]
use tokio_rustls::rustls::pki_types::{InvalidDnsNameError, ServerName};
#[cfg(feature = "use-rustls")]
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use tokio::net::TcpStream;

use crate::framed::AsyncReadWrite;
use crate::options::MqttOptions;

/// Errors while setting up the network connection to the broker
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "use-rustls")]
    #[error("TLS: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[cfg(feature = "use-rustls")]
    #[error("Invalid server name: {0}")]
    ServerName(#[from] InvalidDnsNameError),
    #[cfg(feature = "use-native-tls")]
    #[error("Native TLS: {0}")]
    NativeTls(#[from] native_tls::Error),
    #[cfg(feature = "websocket")]
    #[error("Websocket: {0}")]
    Websocket(#[from] Box<async_tungstenite::tungstenite::Error>),
    #[error("No broker addresses configured")]
    NoEndpoints,
}

/// Transport methods. Defaults to TCP.
#[derive(Clone)]
pub enum Transport {
    Tcp,
    #[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
    Tls(TlsConfiguration),
    #[cfg(feature = "websocket")]
    Ws,
    #[cfg(all(feature = "use-rustls", feature = "websocket"))]
    Wss(TlsConfiguration),
}

impl Default for Transport {
    fn default() -> Self {
        Self::tcp()
    }
}

impl Transport {
    /// Use regular tcp as transport (default)
    pub fn tcp() -> Self {
        Self::Tcp
    }

    #[cfg(feature = "use-rustls")]
    pub fn tls_with_default_config() -> Self {
        Self::tls_with_config(Default::default())
    }

    /// Use secure tcp with tls as transport
    #[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
    pub fn tls_with_config(tls_config: TlsConfiguration) -> Self {
        Self::Tls(tls_config)
    }

    /// Use websockets as transport
    #[cfg(feature = "websocket")]
    pub fn ws() -> Self {
        Self::Ws
    }

    /// Use secure websockets with tls as transport
    #[cfg(all(feature = "use-rustls", feature = "websocket"))]
    pub fn wss_with_config(tls_config: TlsConfiguration) -> Self {
        Self::Wss(tls_config)
    }

    #[cfg(all(feature = "use-rustls", feature = "websocket"))]
    pub fn wss_with_default_config() -> Self {
        Self::Wss(Default::default())
    }
}

/// TLS configuration method
#[derive(Clone)]
#[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
pub enum TlsConfiguration {
    #[cfg(feature = "use-rustls")]
    /// Injected rustls ClientConfig for TLS, to allow more customisation.
    Rustls(Arc<ClientConfig>),
    #[cfg(feature = "use-native-tls")]
    /// Use default native-tls configuration
    Native,
    #[cfg(feature = "use-native-tls")]
    /// Injected native-tls TlsConnector for TLS, to allow more customisation.
    NativeConnector(native_tls::TlsConnector),
}

#[cfg(feature = "use-rustls")]
impl Default for TlsConfiguration {
    fn default() -> Self {
        let mut root_cert_store = RootCertStore::empty();
        for cert in load_native_certs().certs {
            let _ = root_cert_store.add(cert);
        }
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        Self::Rustls(Arc::new(tls_config))
    }
}

#[cfg(feature = "use-rustls")]
impl From<ClientConfig> for TlsConfiguration {
    fn from(config: ClientConfig) -> Self {
        TlsConfiguration::Rustls(Arc::new(config))
    }
}

/// Open the configured transport to one broker endpoint.
///
/// Yields a boxed bidirectional byte stream, ready for the MQTT handshake.
pub(crate) async fn connect(
    options: &MqttOptions,
    host: &str,
    port: u16,
) -> Result<Box<dyn AsyncReadWrite>, TransportError> {
    match options.transport() {
        Transport::Tcp => {
            let tcp = tcp_connect(options, host, port).await?;
            Ok(Box::new(tcp))
        }
        #[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
        Transport::Tls(config) => {
            let tcp = tcp_connect(options, host, port).await?;
            tls_connect(tcp, config, host).await
        }
        #[cfg(feature = "websocket")]
        Transport::Ws => {
            let request = websocket_request(host)?;
            let (stream, _response) = async_tungstenite::tokio::connect_async(request)
                .await
                .map_err(Box::new)?;
            Ok(Box::new(ws_stream_tungstenite::WsStream::new(stream)))
        }
        #[cfg(all(feature = "use-rustls", feature = "websocket"))]
        Transport::Wss(config) => {
            let request = websocket_request(host)?;
            let connector = match config {
                TlsConfiguration::Rustls(config) => {
                    async_tungstenite::tokio::Connector::Rustls(config.clone())
                }
                #[cfg(feature = "use-native-tls")]
                _ => async_tungstenite::tokio::Connector::Plain,
            };
            let (stream, _response) =
                async_tungstenite::tokio::connect_async_with_tls_connector(request, Some(connector))
                    .await
                    .map_err(Box::new)?;
            Ok(Box::new(ws_stream_tungstenite::WsStream::new(stream)))
        }
    }
}

async fn tcp_connect(
    options: &MqttOptions,
    host: &str,
    port: u16,
) -> Result<TcpStream, TransportError> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let addr = addrs.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
    })?;

    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };

    let network_options = &options.network_options;
    if network_options.tcp_nodelay {
        socket.set_nodelay(true)?;
    }
    if let Some(size) = network_options.tcp_send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = network_options.tcp_recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }

    Ok(socket.connect(addr).await?)
}

#[cfg(any(feature = "use-rustls", feature = "use-native-tls"))]
async fn tls_connect(
    tcp: TcpStream,
    config: &TlsConfiguration,
    host: &str,
) -> Result<Box<dyn AsyncReadWrite>, TransportError> {
    match config {
        #[cfg(feature = "use-rustls")]
        TlsConfiguration::Rustls(config) => {
            let connector = tokio_rustls::TlsConnector::from(config.clone());
            let server_name = ServerName::try_from(host.to_owned())?;
            let stream = connector.connect(server_name, tcp).await?;
            Ok(Box::new(stream))
        }
        #[cfg(feature = "use-native-tls")]
        TlsConfiguration::Native => {
            let connector = native_tls::TlsConnector::new()?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let stream = connector.connect(host, tcp).await?;
            Ok(Box::new(stream))
        }
        #[cfg(feature = "use-native-tls")]
        TlsConfiguration::NativeConnector(connector) => {
            let connector = tokio_native_tls::TlsConnector::from(connector.clone());
            let stream = connector.connect(host, tcp).await?;
            Ok(Box::new(stream))
        }
    }
}

/// Build the websocket upgrade request for a broker URL.
///
/// Brokers expect the `mqtt` websocket subprotocol to be offered.
#[cfg(feature = "websocket")]
fn websocket_request(
    url: &str,
) -> Result<async_tungstenite::tungstenite::handshake::client::Request, TransportError> {
    use async_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url.into_client_request().map_err(Box::new)?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "mqtt".parse().expect("valid header value"));
    Ok(request)
}
