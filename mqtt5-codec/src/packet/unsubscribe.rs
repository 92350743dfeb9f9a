use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::parse::*;
use crate::property::{Properties, PropertyType};
use crate::{Error, FixedHeader};

const ALLOWED_PROPERTIES: &[PropertyType] = &[PropertyType::UserProperty];

/// Unsubscribe request
///
/// Sent by the client to the server to remove one or more subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub properties: Properties,
    pub filters: Vec<String>,
}

impl Unsubscribe {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            pkid: 0,
            properties: Properties::new(),
            filters: vec![filter.into()],
        }
    }

    pub fn new_many<F, S>(filters: F) -> Self
    where
        F: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pkid: 0,
            properties: Properties::new(),
            filters: filters.into_iter().map(Into::into).collect(),
        }
    }
}

pub fn read(_fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Unsubscribe, Error> {
    let pkid = read_u16(&mut bytes)?;
    let properties = Properties::read(&mut bytes, ALLOWED_PROPERTIES)?;

    let mut filters = Vec::new();
    while bytes.has_remaining() {
        filters.push(read_mqtt_string(&mut bytes)?);
    }

    match filters.len() {
        0 => Err(Error::EmptySubscription),
        _ => Ok(Unsubscribe {
            pkid,
            properties,
            filters,
        }),
    }
}

pub fn write(packet: &Unsubscribe, buffer: &mut BytesMut) -> Result<usize, Error> {
    // packet type and flags
    buffer.put_u8(0xA2);
    // remaining length
    let len = len(packet)?;
    len.write(buffer);
    // packet identifier
    buffer.put_u16(packet.pkid);

    // properties
    packet.properties.write(buffer)?;

    // topic filters
    for filter in packet.filters.iter() {
        write_mqtt_string(buffer, filter);
    }

    Ok(1 + len.length() + len.value())
}

pub fn len(packet: &Unsubscribe) -> Result<VarInt, Error> {
    let mut len = 2 + packet.filters.iter().fold(0, |s, t| s + 2 + t.len());

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
        let unsubscribe_props = properties![Property::UserProperty {
            name: USER_PROP_KEY.into(),
            value: USER_PROP_VAL.into(),
        }];

        let mut unsubscribe_pkt = Unsubscribe::new("hello/world");
        unsubscribe_pkt.properties = unsubscribe_props;

        let size_from_size = size_from_len(len(&unsubscribe_pkt).unwrap());
        let size_from_write = write(&unsubscribe_pkt, &mut dummy_bytes).unwrap();
        let size_from_bytes = dummy_bytes.len();

        assert_eq!(size_from_write, size_from_bytes);
        assert_eq!(size_from_size, size_from_bytes);
    }

    #[test]
    fn multiple_filters_survive_a_round_trip() {
        let mut unsubscribe = Unsubscribe::new_many(["a/b", "c/+", "d/#"]);
        unsubscribe.pkid = 11;

        let mut buffer = BytesMut::new();
        write(&unsubscribe, &mut buffer).unwrap();
        let fixed_header = FixedHeader::check(buffer.iter(), u32::MAX).unwrap();
        let mut bytes = buffer.freeze();
        let _ = bytes.split_to(fixed_header.header_len());
        let decoded = read(fixed_header, bytes).unwrap();

        assert_eq!(unsubscribe, decoded);
    }
}
