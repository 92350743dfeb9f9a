//! MQTT 5.0 packet serialization and deserialization
//!
//! This crate implements the assembling and disassembling of all fifteen
//! MQTT 5.0 control packets, including the property system introduced by
//! version 5 of the protocol.
//!
//! It is mainly intended to be used with the mqtt5-client crate, but the
//! packet types and the [`Codec`] can be used on their own wherever MQTT 5.0
//! frames have to be produced or consumed.

mod codec;
mod error;
mod header;
mod packet;
mod parse;
mod property;
mod reason;
pub mod topic;

pub use codec::Codec;
pub use error::Error;
pub use packet::*;
pub use parse::VarInt;
pub use property::{Properties, Property};

use header::FixedHeader;

/// Quality of Service levels for packet delivery.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl Default for QoS {
    fn default() -> Self {
        Self::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            qos => Err(Error::InvalidQoS(qos)),
        }
    }
}
