use bytes::{BufMut, Bytes, BytesMut};

use crate::parse::*;
use crate::property::{Properties, PropertyType};
use crate::{Error, FixedHeader, QoS};

const ALLOWED_PROPERTIES: &[PropertyType] = &[
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::TopicAlias,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
    PropertyType::SubscriptionIdentifier,
    PropertyType::ContentType,
];

/// Publish message
///
/// Sent from a client to the server or from the server to a client to
/// transport an application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Is this packet a retransmission?
    pub dup: bool,
    /// Quality of service level
    pub qos: QoS,
    /// Should the broker retain this message?
    pub retain: bool,
    /// Packet identifier, only present for QoS > 0
    pub pkid: u16,
    /// Topic the message is published to
    pub topic: String,
    /// Properties of the publish packet
    pub properties: Properties,
    /// The application message
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            pkid: 0,
            topic: topic.into(),
            properties: Properties::new(),
            payload: payload.into(),
        }
    }

    /// The size of the full packet after serialization in bytes.
    pub fn size(&self) -> Result<u32, Error> {
        let len = len(self)?;
        Ok(crate::packet::size_from_len(len) as u32)
    }
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Publish, Error> {
    let dup = (fixed_header.flags() & 0b1000) != 0;
    let qos = QoS::try_from((fixed_header.flags() & 0b0110) >> 1)?;
    let retain = (fixed_header.flags() & 0b0001) != 0;

    let topic = read_mqtt_string(&mut bytes)?;

    // Packet identifier exists where QoS > 0
    let pkid = match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce | QoS::ExactlyOnce => read_u16(&mut bytes)?,
    };

    if qos != QoS::AtMostOnce && pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    let properties = Properties::read(&mut bytes, ALLOWED_PROPERTIES)?;
    Ok(Publish {
        dup,
        qos,
        retain,
        pkid,
        topic,
        properties,
        payload: bytes,
    })
}

pub fn write(packet: &Publish, buffer: &mut BytesMut) -> Result<usize, Error> {
    // packet type and flags
    let dup = packet.dup as u8;
    let qos = packet.qos as u8;
    let retain = packet.retain as u8;
    buffer.put_u8(0b0011_0000 | retain | (qos << 1) | (dup << 3));
    // remaining length
    let len = len(packet)?;
    len.write(buffer);
    // topic
    write_mqtt_string(buffer, &packet.topic);

    // packet identifier
    if packet.qos != QoS::AtMostOnce {
        let pkid = packet.pkid;
        if pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        buffer.put_u16(pkid);
    }

    // properties
    packet.properties.write(buffer)?;

    buffer.extend_from_slice(&packet.payload);

    Ok(1 + len.length() + len.value())
}

pub fn len(packet: &Publish) -> Result<VarInt, Error> {
    let mut len = 2 + packet.topic.len();
    if packet.qos != QoS::AtMostOnce && packet.pkid != 0 {
        // packet identifier is only present for QoS > 0
        len += 2;
    }

    let properties_len = packet.properties.len()?;
    len += properties_len.length() + properties_len.value();

    len += packet.payload.len();
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
        let publish_props = properties![
            Property::UserProperty {
                name: USER_PROP_KEY.into(),
                value: USER_PROP_VAL.into(),
            },
            Property::SubscriptionIdentifier(VarInt::new(1).unwrap()),
        ];

        let mut publish_pkt = Publish::new("hello/world", QoS::AtMostOnce, vec![1; 10]);
        publish_pkt.properties = publish_props;

        let size_from_size = size_from_len(len(&publish_pkt).unwrap());
        let size_from_write = write(&publish_pkt, &mut dummy_bytes).unwrap();
        let size_from_bytes = dummy_bytes.len();

        assert_eq!(size_from_write, size_from_bytes);
        assert_eq!(size_from_size, size_from_bytes);
    }

    #[test]
    fn qos1_with_pkid_zero_is_rejected() {
        let mut buffer = BytesMut::new();
        let publish = Publish::new("hello/world", QoS::AtLeastOnce, vec![1, 2, 3]);
        assert!(matches!(
            write(&publish, &mut buffer),
            Err(Error::PacketIdZero)
        ));
    }

    #[test]
    fn dup_and_retain_flags_survive_a_round_trip() {
        let mut publish = Publish::new("hello/world", QoS::ExactlyOnce, vec![1, 2, 3]);
        publish.pkid = 10;
        publish.dup = true;
        publish.retain = true;

        let mut buffer = BytesMut::new();
        write(&publish, &mut buffer).unwrap();
        let fixed_header = FixedHeader::check(buffer.iter(), u32::MAX).unwrap();
        let mut bytes = buffer.freeze();
        let _ = bytes.split_to(fixed_header.header_len());
        let decoded = read(fixed_header, bytes).unwrap();

        assert_eq!(publish, decoded);
    }
}
