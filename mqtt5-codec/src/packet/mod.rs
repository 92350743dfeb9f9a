//! The core MQTT 5.0 packet types as specified by the MQTT protocol.
//!
//! At the heart of this module is the [`Packet`] enum, which consolidates all
//! fifteen MQTT control packets into a single type. Each variant corresponds
//! to a specific control packet; the individual packet structs are defined in
//! their respective submodules and re-exported here for convenience.
//!
//! When decoding a byte stream, the result is a `Packet`. When encoding, you
//! construct the specific packet struct (e.g. `Publish`), wrap it in the
//! `Packet` enum and write it to the stream.

use bytes::BytesMut;

use crate::{Error, FixedHeader};

mod auth;
mod connack;
mod connect;
mod disconnect;
mod ping;
mod puback;
mod pubcomp;
mod publish;
mod pubrec;
mod pubrel;
mod suback;
mod subscribe;
mod unsuback;
mod unsubscribe;

pub use auth::{Auth, AuthReasonCode};
pub use connack::{ConnAck, ConnectReasonCode};
pub use connect::{Connect, LastWill, Login};
pub use disconnect::{Disconnect, DisconnectReasonCode};
pub use ping::{PingReq, PingResp};
pub use puback::{PubAck, PubAckReasonCode};
pub use pubcomp::{PubComp, PubCompReasonCode};
pub use publish::Publish;
pub use pubrec::{PubRec, PubRecReasonCode};
pub use pubrel::{PubRel, PubRelReasonCode};
pub use suback::{SubAck, SubscribeReasonCode};
pub use subscribe::{Filter, RetainForwardRule, Subscribe};
pub use unsuback::{UnsubAck, UnsubscribeReasonCode};
pub use unsubscribe::Unsubscribe;

/// MQTT Control Packet
///
/// This enumeration represents the different types of MQTT packets that can be sent or received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq(PingReq),
    PingResp(PingResp),
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    /// Deserializes a packet from a stream of bytes.
    ///
    /// Fails with [`Error::InsufficientBytes`] if the stream does not yet
    /// contain a complete frame.
    pub fn read(stream: &mut BytesMut, max_size: u32) -> Result<Packet, Error> {
        let fixed_header = FixedHeader::check(stream.iter(), max_size)?;
        let packet_type = fixed_header.packet_type()?;

        let mut packet = stream.split_to(fixed_header.frame_len());
        // skip the fixed header, we have already parsed it
        let _ = packet.split_to(fixed_header.header_len());

        if fixed_header.remaining_len == 0 {
            // no payload packets
            match packet_type {
                PacketType::Disconnect | PacketType::PingReq | PacketType::PingResp => (),
                _ => return Err(Error::PayloadRequired),
            };
        }

        let packet = packet.freeze();
        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(connect::read(fixed_header, packet)?),
            PacketType::ConnAck => Packet::ConnAck(connack::read(fixed_header, packet)?),
            PacketType::Publish => Packet::Publish(publish::read(fixed_header, packet)?),
            PacketType::PubAck => Packet::PubAck(puback::read(fixed_header, packet)?),
            PacketType::PubRec => Packet::PubRec(pubrec::read(fixed_header, packet)?),
            PacketType::PubRel => Packet::PubRel(pubrel::read(fixed_header, packet)?),
            PacketType::PubComp => Packet::PubComp(pubcomp::read(fixed_header, packet)?),
            PacketType::Subscribe => Packet::Subscribe(subscribe::read(fixed_header, packet)?),
            PacketType::SubAck => Packet::SubAck(suback::read(fixed_header, packet)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(unsubscribe::read(fixed_header, packet)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(unsuback::read(fixed_header, packet)?),
            PacketType::PingReq => Packet::PingReq(ping::req::read(fixed_header, packet)?),
            PacketType::PingResp => Packet::PingResp(ping::resp::read(fixed_header, packet)?),
            PacketType::Disconnect => Packet::Disconnect(disconnect::read(fixed_header, packet)?),
            PacketType::Auth => Packet::Auth(auth::read(fixed_header, packet)?),
        };

        Ok(packet)
    }

    /// Serializes the packet into a stream of bytes.
    pub fn write(&self, stream: &mut BytesMut, max_size: u32) -> Result<usize, Error> {
        let size = self.size()?;
        if size > max_size {
            return Err(Error::OutgoingPacketTooLarge {
                pkt_size: size,
                max: max_size,
            });
        }

        match self {
            Packet::Connect(c) => connect::write(c, stream),
            Packet::ConnAck(c) => connack::write(c, stream),
            Packet::Publish(p) => publish::write(p, stream),
            Packet::PubAck(p) => puback::write(p, stream),
            Packet::PubRec(p) => pubrec::write(p, stream),
            Packet::PubRel(p) => pubrel::write(p, stream),
            Packet::PubComp(p) => pubcomp::write(p, stream),
            Packet::Subscribe(s) => subscribe::write(s, stream),
            Packet::SubAck(s) => suback::write(s, stream),
            Packet::Unsubscribe(u) => unsubscribe::write(u, stream),
            Packet::UnsubAck(u) => unsuback::write(u, stream),
            Packet::PingReq(p) => ping::req::write(p, stream),
            Packet::PingResp(p) => ping::resp::write(p, stream),
            Packet::Disconnect(d) => disconnect::write(d, stream),
            Packet::Auth(a) => auth::write(a, stream),
        }
    }

    /// The size of the full packet (fixed header + variable header + payload) in bytes.
    pub fn size(&self) -> Result<u32, Error> {
        let len = match self {
            Packet::Connect(c) => connect::len(c),
            Packet::ConnAck(c) => connack::len(c),
            Packet::Publish(p) => publish::len(p),
            Packet::PubAck(p) => puback::len(p),
            Packet::PubRec(p) => pubrec::len(p),
            Packet::PubRel(p) => pubrel::len(p),
            Packet::PubComp(p) => pubcomp::len(p),
            Packet::Subscribe(s) => subscribe::len(s),
            Packet::SubAck(s) => suback::len(s),
            Packet::Unsubscribe(u) => unsubscribe::len(u),
            Packet::UnsubAck(u) => unsuback::len(u),
            Packet::PingReq(p) => ping::req::len(p),
            Packet::PingResp(p) => ping::resp::len(p),
            Packet::Disconnect(d) => disconnect::len(d),
            Packet::Auth(a) => auth::len(a),
        }?;
        Ok(size_from_len(len) as u32)
    }
}

/// MQTT packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Connection request
    Connect = 1,
    /// Connect acknowledgment
    ConnAck,
    /// Publish message
    Publish,
    /// Publish acknowledgment (QoS 1)
    PubAck,
    /// Publish received (QoS 2 delivery part 1)
    PubRec,
    /// Publish release (QoS 2 delivery part 2)
    PubRel,
    /// Publish complete (QoS 2 delivery part 3)
    PubComp,
    /// Subscribe request
    Subscribe,
    /// Subscribe acknowledgment
    SubAck,
    /// Unsubscribe request
    Unsubscribe,
    /// Unsubscribe acknowledgment
    UnsubAck,
    /// PING request
    PingReq,
    /// PING response
    PingResp,
    /// Disconnect notification
    Disconnect,
    /// Authentication exchange
    Auth,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            x => Err(Error::InvalidPacketType(x)),
        }
    }
}

/// Get the packet size from the remaining length
fn size_from_len(len: crate::VarInt) -> usize {
    // control field + remaining length + variable header & payload
    1 + len.length() + len.value()
}

#[cfg(test)]
mod tests {
    // These are used in tests by packets
    pub const USER_PROP_KEY: &str = "property";
    pub const USER_PROP_VAL: &str = "a value thats really long............................................................................................................";

    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::QoS;

    fn round_trip(packet: Packet) {
        let mut buffer = BytesMut::new();
        packet.write(&mut buffer, u32::MAX).unwrap();
        let decoded = Packet::read(&mut buffer, u32::MAX).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn all_packet_types_survive_a_round_trip() {
        let mut publish = Publish::new("a/b", QoS::AtLeastOnce, &b"hello"[..]);
        publish.pkid = 12;

        round_trip(Packet::Publish(publish));
        round_trip(Packet::Connect(Connect::new(30, true, "reader-1")));
        round_trip(Packet::ConnAck(ConnAck::new(true)));
        round_trip(Packet::PubAck(PubAck::new(12)));
        round_trip(Packet::PubRec(PubRec::new(12)));
        round_trip(Packet::PubRel(PubRel::new(12)));
        round_trip(Packet::PubComp(PubComp::new(12)));
        round_trip(Packet::Subscribe(Subscribe::new(
            Filter::new("a/+".to_owned(), QoS::AtLeastOnce),
            None,
        )));
        round_trip(Packet::SubAck(SubAck::new(
            3,
            vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        )));
        round_trip(Packet::Unsubscribe(Unsubscribe::new("a/+")));
        round_trip(Packet::UnsubAck(UnsubAck::new(
            3,
            vec![UnsubscribeReasonCode::Success],
        )));
        round_trip(Packet::PingReq(PingReq));
        round_trip(Packet::PingResp(PingResp));
        round_trip(Packet::Disconnect(Disconnect::new()));
        round_trip(Packet::Auth(Auth::new(AuthReasonCode::Success)));
    }

    #[test]
    fn truncated_frame_asks_for_more_bytes() {
        let mut publish = Publish::new("a/b", QoS::AtLeastOnce, vec![1; 32]);
        publish.pkid = 1;

        let mut buffer = BytesMut::new();
        Packet::Publish(publish).write(&mut buffer, u32::MAX).unwrap();
        let _ = buffer.split_off(buffer.len() - 10);

        assert!(matches!(
            Packet::read(&mut buffer, u32::MAX),
            Err(Error::InsufficientBytes(10))
        ));
    }
}
