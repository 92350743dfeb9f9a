use bytes::{BufMut, Bytes, BytesMut};

use crate::parse::*;
use crate::property::{Properties, PropertyType};
use crate::{reason, Error, FixedHeader};

const ALLOWED_PROPERTIES: &[PropertyType] =
    &[PropertyType::ReasonString, PropertyType::UserProperty];

/// Publish release
///
/// Second part of the QoS 2 handshake, sent in response to a PUBREC packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
    pub reason: PubRelReasonCode,
    pub properties: Properties,
}

impl PubRel {
    pub fn new(pkid: u16) -> Self {
        Self {
            pkid,
            reason: PubRelReasonCode::Success,
            properties: Properties::new(),
        }
    }
}

/// Reason codes for the PUBREL packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PubRelReasonCode {
    Success = reason::SUCCESS,
    PacketIdentifierNotFound = reason::PACKET_IDENTIFIER_NOT_FOUND,
}

impl TryFrom<u8> for PubRelReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            reason::SUCCESS => Self::Success,
            reason::PACKET_IDENTIFIER_NOT_FOUND => Self::PacketIdentifierNotFound,
            num => return Err(Error::InvalidReason(num)),
        };

        Ok(code)
    }
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubRel, Error> {
    // PUBREL is the only ack with mandatory flag bits
    if fixed_header.flags() != 0x02 {
        return Err(Error::MalformedPacket);
    }

    let pkid = read_u16(&mut bytes)?;

    // No reason code or properties if remaining length == 2
    if fixed_header.remaining_len == 2 {
        return Ok(PubRel::new(pkid));
    }

    let ack_reason = read_u8(&mut bytes)?;
    if fixed_header.remaining_len < 4 {
        // Properties length is omitted
        return Ok(PubRel {
            pkid,
            reason: ack_reason.try_into()?,
            properties: Properties::new(),
        });
    }

    Ok(PubRel {
        pkid,
        reason: ack_reason.try_into()?,
        properties: Properties::read(&mut bytes, ALLOWED_PROPERTIES)?,
    })
}

pub fn write(packet: &PubRel, buffer: &mut BytesMut) -> Result<usize, Error> {
    // packet type and flags
    buffer.put_u8(0x62);
    // remaining length
    let len = len(packet)?;
    len.write(buffer);
    // packet identifier
    buffer.put_u16(packet.pkid);

    if len > 2 {
        // reason code
        buffer.put_u8(packet.reason as u8);
        // properties
        packet.properties.write(buffer)?;
    }

    Ok(1 + len.length() + len.value())
}

pub fn len(packet: &PubRel) -> Result<VarInt, Error> {
    let mut len = 2; // packet identifier

    if packet.reason == PubRelReasonCode::Success && packet.properties.is_empty() {
        // Reason code and property length can be omitted in this case
        return VarInt::new(len);
    }

    len += 1; // reason code

    let properties_len = packet.properties.len()?;
    len += properties_len.length() + properties_len.value();

    VarInt::new(len)
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn length_calculation() {
        let mut dummy_bytes = BytesMut::new();
        let pubrel_pkt = PubRel {
            pkid: 1,
            reason: PubRelReasonCode::PacketIdentifierNotFound,
            properties: Properties::new(),
        };

        let size_from_size = crate::packet::size_from_len(len(&pubrel_pkt).unwrap());
        let size_from_write = write(&pubrel_pkt, &mut dummy_bytes).unwrap();
        let size_from_bytes = dummy_bytes.len();

        assert_eq!(size_from_write, size_from_bytes);
        assert_eq!(size_from_size, size_from_bytes);
    }

    #[test]
    fn wrong_flag_bits_are_rejected() {
        let mut buffer = BytesMut::new();
        write(&PubRel::new(5), &mut buffer).unwrap();
        // corrupt the reserved flag bits
        buffer[0] = 0x60;

        let fixed_header = FixedHeader::check(buffer.iter(), u32::MAX).unwrap();
        let mut bytes = buffer.freeze();
        let _ = bytes.split_to(fixed_header.header_len());
        assert!(matches!(
            read(fixed_header, bytes),
            Err(Error::MalformedPacket)
        ));
    }
}
