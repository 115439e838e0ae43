//! rtnetlink inner-message dispatch.
//!
//! Maps the RTM_* message types this daemon speaks onto the typed
//! route/rule codecs and plugs them into `netlink-packet-core`
//! framing. Anything else on the socket is rejected as unknown and
//! skipped by the transport.

use netlink_packet_core::{NetlinkDeserializable, NetlinkHeader, NetlinkSerializable};
use netlink_packet_utils::{DecodeError, Emitable};
use std::net::IpAddr;

use crate::route::RouteMessage;
use crate::rule::RuleMessage;

pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_GETROUTE: u16 = 26;
pub const RTM_NEWRULE: u16 = 32;
pub const RTM_DELRULE: u16 = 33;
pub const RTM_GETRULE: u16 = 34;

/// Address families carried in the fixed message headers.
pub const AF_UNSPEC: u8 = 0;
pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

/// A typed rtnetlink message. NEW/DEL request types double as the
/// unsolicited broadcast notification types (with no correlation
/// number set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtnlMessage {
    NewRoute(RouteMessage),
    DelRoute(RouteMessage),
    GetRoute(RouteMessage),
    NewRule(RuleMessage),
    DelRule(RuleMessage),
    GetRule(RuleMessage),
}

impl RtnlMessage {
    pub fn message_type(&self) -> u16 {
        match self {
            RtnlMessage::NewRoute(_) => RTM_NEWROUTE,
            RtnlMessage::DelRoute(_) => RTM_DELROUTE,
            RtnlMessage::GetRoute(_) => RTM_GETROUTE,
            RtnlMessage::NewRule(_) => RTM_NEWRULE,
            RtnlMessage::DelRule(_) => RTM_DELRULE,
            RtnlMessage::GetRule(_) => RTM_GETRULE,
        }
    }

    pub fn is_route(&self) -> bool {
        matches!(
            self,
            RtnlMessage::NewRoute(_) | RtnlMessage::DelRoute(_) | RtnlMessage::GetRoute(_)
        )
    }

    pub fn is_rule(&self) -> bool {
        !self.is_route()
    }
}

impl Emitable for RtnlMessage {
    fn buffer_len(&self) -> usize {
        match self {
            RtnlMessage::NewRoute(m) | RtnlMessage::DelRoute(m) | RtnlMessage::GetRoute(m) => {
                m.buffer_len()
            }
            RtnlMessage::NewRule(m) | RtnlMessage::DelRule(m) | RtnlMessage::GetRule(m) => {
                m.buffer_len()
            }
        }
    }

    fn emit(&self, buffer: &mut [u8]) {
        match self {
            RtnlMessage::NewRoute(m) | RtnlMessage::DelRoute(m) | RtnlMessage::GetRoute(m) => {
                m.emit(buffer)
            }
            RtnlMessage::NewRule(m) | RtnlMessage::DelRule(m) | RtnlMessage::GetRule(m) => {
                m.emit(buffer)
            }
        }
    }
}

impl NetlinkSerializable for RtnlMessage {
    fn message_type(&self) -> u16 {
        RtnlMessage::message_type(self)
    }

    fn buffer_len(&self) -> usize {
        <Self as Emitable>::buffer_len(self)
    }

    fn serialize(&self, buffer: &mut [u8]) {
        self.emit(buffer)
    }
}

impl NetlinkDeserializable for RtnlMessage {
    type Error = DecodeError;

    fn deserialize(header: &NetlinkHeader, payload: &[u8]) -> Result<Self, Self::Error> {
        match header.message_type {
            RTM_NEWROUTE => Ok(RtnlMessage::NewRoute(RouteMessage::parse(payload)?)),
            RTM_DELROUTE => Ok(RtnlMessage::DelRoute(RouteMessage::parse(payload)?)),
            RTM_GETROUTE => Ok(RtnlMessage::GetRoute(RouteMessage::parse(payload)?)),
            RTM_NEWRULE => Ok(RtnlMessage::NewRule(RuleMessage::parse(payload)?)),
            RTM_DELRULE => Ok(RtnlMessage::DelRule(RuleMessage::parse(payload)?)),
            RTM_GETRULE => Ok(RtnlMessage::GetRule(RuleMessage::parse(payload)?)),
            other => Err(format!("unknown rtnetlink message type {other}").into()),
        }
    }
}

/// Rounds a length up to the 4-byte netlink attribute alignment.
pub(crate) fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Byte length of an address for the given family, used to validate
/// fixed-size address attributes before accepting them.
pub(crate) fn family_addr_len(family: u8) -> Option<usize> {
    match family {
        AF_INET => Some(4),
        AF_INET6 => Some(16),
        _ => None,
    }
}

pub(crate) fn ip_len(addr: &IpAddr) -> usize {
    match addr {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}

pub(crate) fn emit_ip(addr: &IpAddr, buffer: &mut [u8]) {
    match addr {
        IpAddr::V4(v4) => buffer[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => buffer[..16].copy_from_slice(&v6.octets()),
    }
}

/// Parses an address attribute payload, rejecting (not crashing on)
/// payloads whose length does not match the message family.
pub(crate) fn parse_ip(payload: &[u8], family: u8) -> Result<IpAddr, DecodeError> {
    let expected = family_addr_len(family)
        .ok_or_else(|| DecodeError::from(format!("address attribute for family {family}")))?;
    if payload.len() != expected {
        return Err(format!(
            "address attribute length {} does not match family {family}",
            payload.len()
        )
        .into());
    }
    match family {
        AF_INET => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(payload);
            Ok(IpAddr::from(octets))
        }
        _ => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(payload);
            Ok(IpAddr::from(octets))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_parse_ip_length_check() {
        assert!(parse_ip(&[10, 0, 0, 1], AF_INET).is_ok());
        assert!(parse_ip(&[10, 0, 0], AF_INET).is_err());
        assert!(parse_ip(&[0u8; 16], AF_INET6).is_ok());
        assert!(parse_ip(&[0u8; 4], AF_INET6).is_err());
        assert!(parse_ip(&[0u8; 4], AF_UNSPEC).is_err());
    }

    #[test]
    fn test_emit_ip_round_trip() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let mut buf = [0u8; 4];
        emit_ip(&v4, &mut buf);
        assert_eq!(parse_ip(&buf, AF_INET).unwrap(), v4);

        let v6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let mut buf = [0u8; 16];
        emit_ip(&v6, &mut buf);
        assert_eq!(parse_ip(&buf, AF_INET6).unwrap(), v6);
    }
}
