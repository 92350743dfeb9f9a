use bytes::{BufMut, Bytes, BytesMut};

use crate::parse::*;
use crate::property::{Properties, PropertyType};
use crate::{reason, Error, FixedHeader};

const ALLOWED_PROPERTIES: &[PropertyType] = &[
    PropertyType::AuthenticationMethod,
    PropertyType::AuthenticationData,
    PropertyType::ReasonString,
    PropertyType::UserProperty,
];

/// Authentication exchange
///
/// Sent from the client to the server or from the server to the client as
/// part of an extended authentication exchange, or to initiate
/// re-authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub reason: AuthReasonCode,
    pub properties: Properties,
}

impl Auth {
    pub fn new(reason: AuthReasonCode) -> Self {
        Self {
            reason,
            properties: Properties::new(),
        }
    }
}

/// Reason codes for the AUTH packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthReasonCode {
    Success = reason::SUCCESS,
    ContinueAuthentication = reason::CONTINUE_AUTHENTICATION,
    ReAuthenticate = reason::RE_AUTHENTICATE,
}

impl TryFrom<u8> for AuthReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            reason::SUCCESS => Self::Success,
            reason::CONTINUE_AUTHENTICATION => Self::ContinueAuthentication,
            reason::RE_AUTHENTICATE => Self::ReAuthenticate,
            num => return Err(Error::InvalidReason(num)),
        };

        Ok(code)
    }
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Auth, Error> {
    if fixed_header.flags() != 0x00 {
        return Err(Error::MalformedPacket);
    }

    if fixed_header.remaining_len == 0 {
        // Reason code and properties omitted implies success
        return Ok(Auth::new(AuthReasonCode::Success));
    }

    let reason = read_u8(&mut bytes)?;
    if fixed_header.remaining_len < 2 {
        // Property length is omitted, no properties
        return Ok(Auth::new(reason.try_into()?));
    }

    Ok(Auth {
        reason: reason.try_into()?,
        properties: Properties::read(&mut bytes, ALLOWED_PROPERTIES)?,
    })
}

pub fn write(packet: &Auth, buffer: &mut BytesMut) -> Result<usize, Error> {
    // packet type and flags
    buffer.put_u8(0xF0);
    // remaining length
    let len = len(packet)?;
    len.write(buffer);

    if len > 0 {
        // reason code
        buffer.put_u8(packet.reason as u8);
        // properties
        packet.properties.write(buffer)?;
    }

    Ok(1 + len.length() + len.value())
}

pub fn len(packet: &Auth) -> Result<VarInt, Error> {
    if packet.reason == AuthReasonCode::Success && packet.properties.is_empty() {
        // The entire variable header can be omitted in this case
        return VarInt::new(0);
    }

    let mut len = 1; // reason code

    let properties_len = packet.properties.len()?;
    len += properties_len.length() + properties_len.value();

    VarInt::new(len)
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::packet::size_from_len;
    use crate::{properties, Property};

    #[test]
    fn length_calculation() {
        let mut dummy_bytes = BytesMut::new();
        let mut auth_pkt = Auth::new(AuthReasonCode::ContinueAuthentication);
        auth_pkt.properties = properties![
            Property::AuthenticationMethod("SCRAM-SHA-1".into()),
            Property::AuthenticationData(Bytes::from_static(b"client-final-data")),
        ];

        let size_from_size = size_from_len(len(&auth_pkt).unwrap());
        let size_from_write = write(&auth_pkt, &mut dummy_bytes).unwrap();
        let size_from_bytes = dummy_bytes.len();

        assert_eq!(size_from_write, size_from_bytes);
        assert_eq!(size_from_size, size_from_bytes);
    }

    #[test]
    fn auth_exchange_survives_a_round_trip() {
        let mut auth = Auth::new(AuthReasonCode::ReAuthenticate);
        auth.properties = properties![Property::AuthenticationMethod("SCRAM-SHA-1".into())];

        let mut buffer = BytesMut::new();
        write(&auth, &mut buffer).unwrap();
        let fixed_header = FixedHeader::check(buffer.iter(), u32::MAX).unwrap();
        let mut bytes = buffer.freeze();
        let _ = bytes.split_to(fixed_header.header_len());
        let decoded = read(fixed_header, bytes).unwrap();

        assert_eq!(auth, decoded);
    }
}
