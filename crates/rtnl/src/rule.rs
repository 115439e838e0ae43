//! RTM_NEWRULE/RTM_DELRULE message codec.
//!
//! Encodes the fixed `fib_rule_hdr` plus the FRA_* attribute list
//! used by routing-policy rules: match prefixes, firewall mark/mask,
//! interface name filters, UID and port ranges, and the lookup table.

use netlink_packet_utils::nla::{DefaultNla, Nla, NlasIterator};
use netlink_packet_utils::parsers::{parse_string, parse_u32, parse_u8};
use netlink_packet_utils::{DecodeError, Emitable, Parseable};
use std::net::IpAddr;

use crate::message::{emit_ip, ip_len, parse_ip};

pub const FRA_DST: u16 = 1;
pub const FRA_SRC: u16 = 2;
pub const FRA_IIFNAME: u16 = 3;
pub const FRA_GOTO: u16 = 4;
pub const FRA_PRIORITY: u16 = 6;
pub const FRA_FWMARK: u16 = 10;
pub const FRA_SUPPRESS_PREFIXLEN: u16 = 14;
pub const FRA_TABLE: u16 = 15;
pub const FRA_FWMASK: u16 = 16;
pub const FRA_OIFNAME: u16 = 17;
pub const FRA_L3MDEV: u16 = 19;
pub const FRA_UID_RANGE: u16 = 20;
pub const FRA_PROTOCOL: u16 = 21;
pub const FRA_IP_PROTO: u16 = 22;
pub const FRA_SPORT_RANGE: u16 = 23;
pub const FRA_DPORT_RANGE: u16 = 24;

/// fib_rule_hdr.flags bit: invert the match.
pub const FIB_RULE_INVERT: u32 = 0x2;

const FIB_RULE_HDR_LEN: usize = 12;

/// Fixed `fib_rule_hdr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleHeader {
    pub family: u8,
    pub dst_prefixlen: u8,
    pub src_prefixlen: u8,
    pub tos: u8,
    pub table: u8,
    /// FR_ACT_* rule action (the object-model "type").
    pub action: u8,
    pub flags: u32,
}

impl RuleHeader {
    fn emit(&self, buffer: &mut [u8]) {
        buffer[0] = self.family;
        buffer[1] = self.dst_prefixlen;
        buffer[2] = self.src_prefixlen;
        buffer[3] = self.tos;
        buffer[4] = self.table;
        buffer[5] = 0; // res1
        buffer[6] = 0; // res2
        buffer[7] = self.action;
        buffer[8..12].copy_from_slice(&self.flags.to_ne_bytes());
    }

    fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < FIB_RULE_HDR_LEN {
            return Err(format!("fib_rule_hdr truncated: {} bytes", payload.len()).into());
        }
        Ok(Self {
            family: payload[0],
            dst_prefixlen: payload[1],
            src_prefixlen: payload[2],
            tos: payload[3],
            table: payload[4],
            action: payload[7],
            flags: u32::from_ne_bytes([payload[8], payload[9], payload[10], payload[11]]),
        })
    }
}

/// Typed FRA_* attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAttribute {
    /// FRA_DST: the "to" match prefix.
    Destination(IpAddr),
    /// FRA_SRC: the "from" match prefix.
    Source(IpAddr),
    IifName(String),
    OifName(String),
    Priority(u32),
    FwMark(u32),
    FwMask(u32),
    Table(u32),
    SuppressPrefixLen(u32),
    Goto(u32),
    L3MDev(u8),
    Protocol(u8),
    IpProto(u8),
    UidRange { start: u32, end: u32 },
    SportRange { start: u16, end: u16 },
    DportRange { start: u16, end: u16 },
    Other(DefaultNla),
}

impl Nla for RuleAttribute {
    fn value_len(&self) -> usize {
        match self {
            RuleAttribute::Destination(a) | RuleAttribute::Source(a) => ip_len(a),
            RuleAttribute::IifName(s) | RuleAttribute::OifName(s) => s.len() + 1,
            RuleAttribute::Priority(_)
            | RuleAttribute::FwMark(_)
            | RuleAttribute::FwMask(_)
            | RuleAttribute::Table(_)
            | RuleAttribute::SuppressPrefixLen(_)
            | RuleAttribute::Goto(_) => 4,
            RuleAttribute::L3MDev(_) | RuleAttribute::Protocol(_) | RuleAttribute::IpProto(_) => 1,
            RuleAttribute::UidRange { .. } => 8,
            RuleAttribute::SportRange { .. } | RuleAttribute::DportRange { .. } => 4,
            RuleAttribute::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            RuleAttribute::Destination(_) => FRA_DST,
            RuleAttribute::Source(_) => FRA_SRC,
            RuleAttribute::IifName(_) => FRA_IIFNAME,
            RuleAttribute::OifName(_) => FRA_OIFNAME,
            RuleAttribute::Priority(_) => FRA_PRIORITY,
            RuleAttribute::FwMark(_) => FRA_FWMARK,
            RuleAttribute::FwMask(_) => FRA_FWMASK,
            RuleAttribute::Table(_) => FRA_TABLE,
            RuleAttribute::SuppressPrefixLen(_) => FRA_SUPPRESS_PREFIXLEN,
            RuleAttribute::Goto(_) => FRA_GOTO,
            RuleAttribute::L3MDev(_) => FRA_L3MDEV,
            RuleAttribute::Protocol(_) => FRA_PROTOCOL,
            RuleAttribute::IpProto(_) => FRA_IP_PROTO,
            RuleAttribute::UidRange { .. } => FRA_UID_RANGE,
            RuleAttribute::SportRange { .. } => FRA_SPORT_RANGE,
            RuleAttribute::DportRange { .. } => FRA_DPORT_RANGE,
            RuleAttribute::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            RuleAttribute::Destination(a) | RuleAttribute::Source(a) => emit_ip(a, buffer),
            RuleAttribute::IifName(s) | RuleAttribute::OifName(s) => {
                buffer[..s.len()].copy_from_slice(s.as_bytes());
                buffer[s.len()] = 0;
            }
            RuleAttribute::Priority(v)
            | RuleAttribute::FwMark(v)
            | RuleAttribute::FwMask(v)
            | RuleAttribute::Table(v)
            | RuleAttribute::SuppressPrefixLen(v)
            | RuleAttribute::Goto(v) => buffer[..4].copy_from_slice(&v.to_ne_bytes()),
            RuleAttribute::L3MDev(v) | RuleAttribute::Protocol(v) | RuleAttribute::IpProto(v) => {
                buffer[0] = *v
            }
            RuleAttribute::UidRange { start, end } => {
                buffer[..4].copy_from_slice(&start.to_ne_bytes());
                buffer[4..8].copy_from_slice(&end.to_ne_bytes());
            }
            RuleAttribute::SportRange { start, end } | RuleAttribute::DportRange { start, end } => {
                buffer[..2].copy_from_slice(&start.to_ne_bytes());
                buffer[2..4].copy_from_slice(&end.to_ne_bytes());
            }
            RuleAttribute::Other(nla) => nla.emit_value(buffer),
        }
    }
}

fn parse_u32_pair(payload: &[u8], what: &str) -> Result<(u32, u32), DecodeError> {
    if payload.len() != 8 {
        return Err(format!("{what} has payload length {}, expected 8", payload.len()).into());
    }
    Ok((
        u32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]),
        u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]),
    ))
}

fn parse_u16_pair(payload: &[u8], what: &str) -> Result<(u16, u16), DecodeError> {
    if payload.len() != 4 {
        return Err(format!("{what} has payload length {}, expected 4", payload.len()).into());
    }
    Ok((
        u16::from_ne_bytes([payload[0], payload[1]]),
        u16::from_ne_bytes([payload[2], payload[3]]),
    ))
}

/// A complete routing-policy rule message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMessage {
    pub header: RuleHeader,
    pub attributes: Vec<RuleAttribute>,
}

impl RuleMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let header = RuleHeader::parse(payload)?;
        let mut attributes = Vec::new();
        for nla in NlasIterator::new(&payload[FIB_RULE_HDR_LEN..]) {
            let nla = nla?;
            let value = nla.value();
            let attr = match nla.kind() {
                FRA_DST => RuleAttribute::Destination(parse_ip(value, header.family)?),
                FRA_SRC => RuleAttribute::Source(parse_ip(value, header.family)?),
                FRA_IIFNAME => RuleAttribute::IifName(parse_string(value)?),
                FRA_OIFNAME => RuleAttribute::OifName(parse_string(value)?),
                FRA_PRIORITY => RuleAttribute::Priority(parse_u32(value)?),
                FRA_FWMARK => RuleAttribute::FwMark(parse_u32(value)?),
                FRA_FWMASK => RuleAttribute::FwMask(parse_u32(value)?),
                FRA_TABLE => RuleAttribute::Table(parse_u32(value)?),
                FRA_SUPPRESS_PREFIXLEN => RuleAttribute::SuppressPrefixLen(parse_u32(value)?),
                FRA_GOTO => RuleAttribute::Goto(parse_u32(value)?),
                FRA_L3MDEV => RuleAttribute::L3MDev(parse_u8(value)?),
                FRA_PROTOCOL => RuleAttribute::Protocol(parse_u8(value)?),
                FRA_IP_PROTO => RuleAttribute::IpProto(parse_u8(value)?),
                FRA_UID_RANGE => {
                    let (start, end) = parse_u32_pair(value, "FRA_UID_RANGE")?;
                    RuleAttribute::UidRange { start, end }
                }
                FRA_SPORT_RANGE => {
                    let (start, end) = parse_u16_pair(value, "FRA_SPORT_RANGE")?;
                    RuleAttribute::SportRange { start, end }
                }
                FRA_DPORT_RANGE => {
                    let (start, end) = parse_u16_pair(value, "FRA_DPORT_RANGE")?;
                    RuleAttribute::DportRange { start, end }
                }
                _ => RuleAttribute::Other(DefaultNla::parse(&nla)?),
            };
            attributes.push(attr);
        }
        Ok(Self { header, attributes })
    }
}

impl Emitable for RuleMessage {
    fn buffer_len(&self) -> usize {
        FIB_RULE_HDR_LEN + self.attributes.as_slice().buffer_len()
    }

    fn emit(&self, buffer: &mut [u8]) {
        self.header.emit(buffer);
        self.attributes
            .as_slice()
            .emit(&mut buffer[FIB_RULE_HDR_LEN..]);
    }
}
