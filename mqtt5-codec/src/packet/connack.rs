use bytes::{BufMut, Bytes, BytesMut};

use crate::parse::*;
use crate::property::{Properties, PropertyType};
use crate::{reason, Error, FixedHeader};

const ALLOWED_PROPERTIES: &[PropertyType] = &[
    PropertyType::SessionExpiryInterval,
    PropertyType::ReceiveMaximum,
    PropertyType::MaximumQos,
    PropertyType::RetainAvailable,
    PropertyType::MaximumPacketSize,
    PropertyType::AssignedClientIdentifier,
    PropertyType::TopicAliasMaximum,
    PropertyType::ReasonString,
    PropertyType::UserProperty,
    PropertyType::WildcardSubscriptionAvailable,
    PropertyType::SubscriptionIdentifierAvailable,
    PropertyType::SharedSubscriptionAvailable,
    PropertyType::ServerKeepAlive,
    PropertyType::ResponseInformation,
    PropertyType::ServerReference,
    PropertyType::AuthenticationMethod,
    PropertyType::AuthenticationData,
];

/// Connect acknowledgment
///
/// Packet sent by the server in response to a CONNECT packet received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReasonCode,
    pub properties: Properties,
}

impl ConnAck {
    pub fn new(session_present: bool) -> Self {
        Self {
            session_present,
            code: ConnectReasonCode::Success,
            properties: Properties::new(),
        }
    }
}

/// Reason codes for the CONNACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReasonCode {
    Success = reason::SUCCESS,
    UnspecifiedError = reason::UNSPECIFIED_ERROR,
    MalformedPacket = reason::MALFORMED_PACKET,
    ProtocolError = reason::PROTOCOL_ERROR,
    ImplementationSpecificError = reason::IMPLEMENTATION_SPECIFIC_ERROR,
    UnsupportedProtocolVersion = reason::UNSUPPORTED_PROTOCOL_VERSION,
    ClientIdentifierNotValid = reason::CLIENT_IDENTIFIER_NOT_VALID,
    BadUserNamePassword = reason::BAD_USER_NAME_OR_PASSWORD,
    NotAuthorized = reason::NOT_AUTHORIZED,
    ServerUnavailable = reason::SERVER_UNAVAILABLE,
    ServerBusy = reason::SERVER_BUSY,
    Banned = reason::BANNED,
    BadAuthenticationMethod = reason::BAD_AUTHENTICATION_METHOD,
    TopicNameInvalid = reason::TOPIC_NAME_INVALID,
    PacketTooLarge = reason::PACKET_TOO_LARGE,
    QuotaExceeded = reason::QUOTA_EXCEEDED,
    PayloadFormatInvalid = reason::PAYLOAD_FORMAT_INVALID,
    RetainNotSupported = reason::RETAIN_NOT_SUPPORTED,
    QoSNotSupported = reason::QOS_NOT_SUPPORTED,
    UseAnotherServer = reason::USE_ANOTHER_SERVER,
    ServerMoved = reason::SERVER_MOVED,
    ConnectionRateExceeded = reason::CONNECTION_RATE_EXCEEDED,
}

impl ConnectReasonCode {
    /// Reason codes that indicate the credentials or the authentication
    /// method were rejected. Retrying with the same configuration will not
    /// succeed.
    pub fn is_authentication_error(&self) -> bool {
        matches!(
            self,
            ConnectReasonCode::BadUserNamePassword
                | ConnectReasonCode::NotAuthorized
                | ConnectReasonCode::BadAuthenticationMethod
                | ConnectReasonCode::Banned
                | ConnectReasonCode::ClientIdentifierNotValid
        )
    }
}

impl TryFrom<u8> for ConnectReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            reason::SUCCESS => Self::Success,
            reason::UNSPECIFIED_ERROR => Self::UnspecifiedError,
            reason::MALFORMED_PACKET => Self::MalformedPacket,
            reason::PROTOCOL_ERROR => Self::ProtocolError,
            reason::IMPLEMENTATION_SPECIFIC_ERROR => Self::ImplementationSpecificError,
            reason::UNSUPPORTED_PROTOCOL_VERSION => Self::UnsupportedProtocolVersion,
            reason::CLIENT_IDENTIFIER_NOT_VALID => Self::ClientIdentifierNotValid,
            reason::BAD_USER_NAME_OR_PASSWORD => Self::BadUserNamePassword,
            reason::NOT_AUTHORIZED => Self::NotAuthorized,
            reason::SERVER_UNAVAILABLE => Self::ServerUnavailable,
            reason::SERVER_BUSY => Self::ServerBusy,
            reason::BANNED => Self::Banned,
            reason::BAD_AUTHENTICATION_METHOD => Self::BadAuthenticationMethod,
            reason::TOPIC_NAME_INVALID => Self::TopicNameInvalid,
            reason::PACKET_TOO_LARGE => Self::PacketTooLarge,
            reason::QUOTA_EXCEEDED => Self::QuotaExceeded,
            reason::PAYLOAD_FORMAT_INVALID => Self::PayloadFormatInvalid,
            reason::RETAIN_NOT_SUPPORTED => Self::RetainNotSupported,
            reason::QOS_NOT_SUPPORTED => Self::QoSNotSupported,
            reason::USE_ANOTHER_SERVER => Self::UseAnotherServer,
            reason::SERVER_MOVED => Self::ServerMoved,
            reason::CONNECTION_RATE_EXCEEDED => Self::ConnectionRateExceeded,
            num => return Err(Error::InvalidConnectReasonCode(num)),
        };

        Ok(code)
    }
}

pub fn read(_fixed_header: FixedHeader, mut bytes: Bytes) -> Result<ConnAck, Error> {
    let flags = read_u8(&mut bytes)?;
    let return_code = read_u8(&mut bytes)?;
    let properties = Properties::read(&mut bytes, ALLOWED_PROPERTIES)?;

    let session_present = (flags & 0x01) == 1;
    let code = ConnectReasonCode::try_from(return_code)?;
    Ok(ConnAck {
        session_present,
        code,
        properties,
    })
}

pub fn write(packet: &ConnAck, buffer: &mut BytesMut) -> Result<usize, Error> {
    // packet type and flags
    buffer.put_u8(0x20);
    // remaining length
    let len = len(packet)?;
    len.write(buffer);
    // connect acknowledge flags
    buffer.put_u8(packet.session_present as u8);
    // reason code
    buffer.put_u8(packet.code as u8);
    // properties
    packet.properties.write(buffer)?;

    Ok(1 + len.length() + len.value())
}

pub fn len(packet: &ConnAck) -> Result<VarInt, Error> {
    let mut len = 1  // connect acknowledge flags
                + 1; // connect reason code

    let properties_len = packet.properties.len()?;
    len += properties_len.length() + properties_len.value();

    VarInt::new(len)
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::packet::{
        size_from_len,
        tests::{USER_PROP_KEY, USER_PROP_VAL},
    };
    use crate::{properties, Property};

    #[test]
    fn length_calculation() {
        let mut dummy_bytes = BytesMut::new();
        // Use user_properties to pad the size to exceed ~128 bytes to make the
        // remaining_length field in the packet be 2 bytes long.
        let connack_props = properties![Property::UserProperty {
            name: USER_PROP_KEY.into(),
            value: USER_PROP_VAL.into(),
        }];

        let mut connack_pkt = ConnAck::new(false);
        connack_pkt.properties = connack_props;

        let size_from_size = size_from_len(len(&connack_pkt).unwrap());
        let size_from_write = write(&connack_pkt, &mut dummy_bytes).unwrap();
        let size_from_bytes = dummy_bytes.len();

        assert_eq!(size_from_write, size_from_bytes);
        assert_eq!(size_from_size, size_from_bytes);
    }

    #[test]
    fn server_limits_survive_a_round_trip() {
        let mut connack = ConnAck::new(true);
        connack.properties = properties![
            Property::ReceiveMaximum(10),
            Property::MaximumQos(1),
            Property::RetainAvailable(false),
            Property::TopicAliasMaximum(5),
            Property::ServerKeepAlive(30),
            Property::AssignedClientIdentifier("generated-1".into()),
        ];

        let mut buffer = BytesMut::new();
        write(&connack, &mut buffer).unwrap();
        let fixed_header = FixedHeader::check(buffer.iter(), u32::MAX).unwrap();
        let mut bytes = buffer.freeze();
        let _ = bytes.split_to(fixed_header.header_len());
        let decoded = read(fixed_header, bytes).unwrap();

        assert_eq!(connack, decoded);
    }
}
