//! RTM_NEWROUTE/RTM_DELROUTE message codec.
//!
//! Encodes the fixed `rtmsg` header plus the nested attribute list:
//! destination/source/preferred-source addresses, priority, the wide
//! table attribute, the RTA_METRICS container (sparse RTAX_* u32
//! sub-attributes and the congestion-control string), and
//! RTA_MULTIPATH nexthop records.
//!
//! Decoding is the strict inverse. An attribute whose length does not
//! match its expected fixed-size payload yields a `DecodeError`; the
//! caller discards that single message, never the socket.

use netlink_packet_utils::nla::{DefaultNla, Nla, NlasIterator};
use netlink_packet_utils::parsers::{parse_string, parse_u32, parse_u8};
use netlink_packet_utils::{DecodeError, Emitable, Parseable};
use std::net::IpAddr;

use crate::message::{emit_ip, ip_len, parse_ip};

pub const RTA_DST: u16 = 1;
pub const RTA_SRC: u16 = 2;
pub const RTA_OIF: u16 = 4;
pub const RTA_GATEWAY: u16 = 5;
pub const RTA_PRIORITY: u16 = 6;
pub const RTA_PREFSRC: u16 = 7;
pub const RTA_METRICS: u16 = 8;
pub const RTA_MULTIPATH: u16 = 9;
pub const RTA_CACHEINFO: u16 = 12;
pub const RTA_TABLE: u16 = 15;
pub const RTA_PREF: u16 = 20;
pub const RTA_EXPIRES: u16 = 23;

/// RTAX_* metric sub-attribute kinds (the reserved per-route metric
/// table range, see `linux/rtnetlink.h`).
pub const RTAX_LOCK: u16 = 1;
pub const RTAX_MTU: u16 = 2;
pub const RTAX_WINDOW: u16 = 3;
pub const RTAX_RTT: u16 = 4;
pub const RTAX_RTTVAR: u16 = 5;
pub const RTAX_SSTHRESH: u16 = 6;
pub const RTAX_CWND: u16 = 7;
pub const RTAX_ADVMSS: u16 = 8;
pub const RTAX_REORDERING: u16 = 9;
pub const RTAX_HOPLIMIT: u16 = 10;
pub const RTAX_INITCWND: u16 = 11;
pub const RTAX_FEATURES: u16 = 12;
pub const RTAX_RTO_MIN: u16 = 13;
pub const RTAX_INITRWND: u16 = 14;
pub const RTAX_QUICKACK: u16 = 15;
pub const RTAX_CC_ALGO: u16 = 16;
pub const RTAX_FASTOPEN_NO_COOKIE: u16 = 17;
pub const RTAX_MAX: u16 = 17;

const RTMSG_LEN: usize = 12;
const RTNEXTHOP_LEN: usize = 8;
const CACHEINFO_LEN: usize = 32;

/// Fixed `rtmsg` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteHeader {
    pub family: u8,
    pub dst_prefixlen: u8,
    pub src_prefixlen: u8,
    pub tos: u8,
    /// Table id if < 256; RT_TABLE_UNSPEC (0) with a wide RTA_TABLE
    /// attribute otherwise.
    pub table: u8,
    pub protocol: u8,
    pub scope: u8,
    pub kind: u8,
    pub flags: u32,
}

impl RouteHeader {
    fn emit(&self, buffer: &mut [u8]) {
        buffer[0] = self.family;
        buffer[1] = self.dst_prefixlen;
        buffer[2] = self.src_prefixlen;
        buffer[3] = self.tos;
        buffer[4] = self.table;
        buffer[5] = self.protocol;
        buffer[6] = self.scope;
        buffer[7] = self.kind;
        buffer[8..12].copy_from_slice(&self.flags.to_ne_bytes());
    }

    fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < RTMSG_LEN {
            return Err(format!("rtmsg header truncated: {} bytes", payload.len()).into());
        }
        Ok(Self {
            family: payload[0],
            dst_prefixlen: payload[1],
            src_prefixlen: payload[2],
            tos: payload[3],
            table: payload[4],
            protocol: payload[5],
            scope: payload[6],
            kind: payload[7],
            flags: u32::from_ne_bytes([payload[8], payload[9], payload[10], payload[11]]),
        })
    }
}

/// One entry of the per-route metric table. Sparse and
/// order-independent: an absent metric means "unset", and the engine
/// never emits explicit zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMetric {
    /// Numeric RTAX_* metric (MTU, window, hoplimit, ...).
    Numeric { kind: u16, value: u32 },
    /// RTAX_CC_ALGO: TCP congestion-control algorithm name.
    CongestionControl(String),
}

impl Nla for RouteMetric {
    fn value_len(&self) -> usize {
        match self {
            RouteMetric::Numeric { .. } => 4,
            RouteMetric::CongestionControl(algo) => algo.len() + 1,
        }
    }

    fn kind(&self) -> u16 {
        match self {
            RouteMetric::Numeric { kind, .. } => *kind,
            RouteMetric::CongestionControl(_) => RTAX_CC_ALGO,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            RouteMetric::Numeric { value, .. } => {
                buffer[..4].copy_from_slice(&value.to_ne_bytes())
            }
            RouteMetric::CongestionControl(algo) => {
                buffer[..algo.len()].copy_from_slice(algo.as_bytes());
                buffer[algo.len()] = 0;
            }
        }
    }
}

fn parse_metrics(payload: &[u8]) -> Result<Vec<RouteMetric>, DecodeError> {
    let mut metrics = Vec::new();
    for nla in NlasIterator::new(payload) {
        let nla = nla?;
        match nla.kind() {
            RTAX_CC_ALGO => metrics.push(RouteMetric::CongestionControl(parse_string(
                nla.value(),
            )?)),
            kind => {
                if nla.value().len() != 4 {
                    return Err(format!(
                        "metric {kind} has payload length {}, expected 4",
                        nla.value().len()
                    )
                    .into());
                }
                metrics.push(RouteMetric::Numeric {
                    kind,
                    value: parse_u32(nla.value())?,
                });
            }
        }
    }
    Ok(metrics)
}

/// One `rtnexthop` record inside RTA_MULTIPATH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteNextHopEntry {
    pub flags: u8,
    /// Weight minus one, as carried on the wire.
    pub hops: u8,
    pub ifindex: u32,
    pub gateway: Option<IpAddr>,
}

impl RouteNextHopEntry {
    fn wire_len(&self) -> usize {
        let attrs = match &self.gateway {
            // NLA header (4) + address, each 4-aligned.
            Some(gw) => 4 + crate::message::align4(ip_len(gw)),
            None => 0,
        };
        RTNEXTHOP_LEN + attrs
    }

    fn emit(&self, buffer: &mut [u8]) {
        let len = self.wire_len() as u16;
        buffer[..2].copy_from_slice(&len.to_ne_bytes());
        buffer[2] = self.flags;
        buffer[3] = self.hops;
        buffer[4..8].copy_from_slice(&self.ifindex.to_ne_bytes());
        if let Some(gw) = &self.gateway {
            let value_len = ip_len(gw);
            let nla_len = (4 + value_len) as u16;
            buffer[8..10].copy_from_slice(&nla_len.to_ne_bytes());
            buffer[10..12].copy_from_slice(&RTA_GATEWAY.to_ne_bytes());
            emit_ip(gw, &mut buffer[12..]);
        }
    }

    fn parse(payload: &[u8], family: u8) -> Result<(Self, usize), DecodeError> {
        if payload.len() < RTNEXTHOP_LEN {
            return Err(format!("rtnexthop truncated: {} bytes", payload.len()).into());
        }
        let len = u16::from_ne_bytes([payload[0], payload[1]]) as usize;
        if len < RTNEXTHOP_LEN || len > payload.len() {
            return Err(format!("rtnexthop has invalid length {len}").into());
        }
        let mut entry = Self {
            flags: payload[2],
            hops: payload[3],
            ifindex: u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]),
            gateway: None,
        };
        for nla in NlasIterator::new(&payload[RTNEXTHOP_LEN..len]) {
            let nla = nla?;
            if nla.kind() == RTA_GATEWAY {
                entry.gateway = Some(parse_ip(nla.value(), family)?);
            }
        }
        Ok((entry, crate::message::align4(len)))
    }
}

/// `struct rta_cacheinfo`. A nonzero `expires` tells the engine that
/// the kernel manages this route's expiry itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteCacheInfo {
    pub clntref: u32,
    pub lastuse: u32,
    pub expires: i32,
    pub error: i32,
    pub used: u32,
    pub id: u32,
    pub ts: u32,
    pub tsage: u32,
}

impl RouteCacheInfo {
    fn emit(&self, buffer: &mut [u8]) {
        buffer[0..4].copy_from_slice(&self.clntref.to_ne_bytes());
        buffer[4..8].copy_from_slice(&self.lastuse.to_ne_bytes());
        buffer[8..12].copy_from_slice(&self.expires.to_ne_bytes());
        buffer[12..16].copy_from_slice(&self.error.to_ne_bytes());
        buffer[16..20].copy_from_slice(&self.used.to_ne_bytes());
        buffer[20..24].copy_from_slice(&self.id.to_ne_bytes());
        buffer[24..28].copy_from_slice(&self.ts.to_ne_bytes());
        buffer[28..32].copy_from_slice(&self.tsage.to_ne_bytes());
    }

    fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() != CACHEINFO_LEN {
            return Err(format!(
                "RTA_CACHEINFO has payload length {}, expected {CACHEINFO_LEN}",
                payload.len()
            )
            .into());
        }
        let u = |i: usize| u32::from_ne_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]]);
        Ok(Self {
            clntref: u(0),
            lastuse: u(4),
            expires: u(8) as i32,
            error: u(12) as i32,
            used: u(16),
            id: u(20),
            ts: u(24),
            tsage: u(28),
        })
    }
}

/// Typed RTA_* attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAttribute {
    Destination(IpAddr),
    Source(IpAddr),
    PrefSource(IpAddr),
    Gateway(IpAddr),
    Oif(u32),
    Priority(u32),
    /// Wide table attribute, used when the table id does not fit the
    /// one-byte header field.
    Table(u32),
    Preference(u8),
    /// Requested lifetime in seconds.
    Expires(u32),
    CacheInfo(RouteCacheInfo),
    Metrics(Vec<RouteMetric>),
    MultiPath(Vec<RouteNextHopEntry>),
    Other(DefaultNla),
}

impl Nla for RouteAttribute {
    fn value_len(&self) -> usize {
        match self {
            RouteAttribute::Destination(a)
            | RouteAttribute::Source(a)
            | RouteAttribute::PrefSource(a)
            | RouteAttribute::Gateway(a) => ip_len(a),
            RouteAttribute::Oif(_)
            | RouteAttribute::Priority(_)
            | RouteAttribute::Table(_)
            | RouteAttribute::Expires(_) => 4,
            RouteAttribute::Preference(_) => 1,
            RouteAttribute::CacheInfo(_) => CACHEINFO_LEN,
            RouteAttribute::Metrics(metrics) => metrics.as_slice().buffer_len(),
            RouteAttribute::MultiPath(hops) => hops.iter().map(RouteNextHopEntry::wire_len).sum(),
            RouteAttribute::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            RouteAttribute::Destination(_) => RTA_DST,
            RouteAttribute::Source(_) => RTA_SRC,
            RouteAttribute::PrefSource(_) => RTA_PREFSRC,
            RouteAttribute::Gateway(_) => RTA_GATEWAY,
            RouteAttribute::Oif(_) => RTA_OIF,
            RouteAttribute::Priority(_) => RTA_PRIORITY,
            RouteAttribute::Table(_) => RTA_TABLE,
            RouteAttribute::Preference(_) => RTA_PREF,
            RouteAttribute::Expires(_) => RTA_EXPIRES,
            RouteAttribute::CacheInfo(_) => RTA_CACHEINFO,
            RouteAttribute::Metrics(_) => RTA_METRICS,
            RouteAttribute::MultiPath(_) => RTA_MULTIPATH,
            RouteAttribute::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            RouteAttribute::Destination(a)
            | RouteAttribute::Source(a)
            | RouteAttribute::PrefSource(a)
            | RouteAttribute::Gateway(a) => emit_ip(a, buffer),
            RouteAttribute::Oif(v)
            | RouteAttribute::Priority(v)
            | RouteAttribute::Table(v)
            | RouteAttribute::Expires(v) => buffer[..4].copy_from_slice(&v.to_ne_bytes()),
            RouteAttribute::Preference(v) => buffer[0] = *v,
            RouteAttribute::CacheInfo(ci) => ci.emit(buffer),
            RouteAttribute::Metrics(metrics) => metrics.as_slice().emit(buffer),
            RouteAttribute::MultiPath(hops) => {
                let mut offset = 0;
                for hop in hops {
                    hop.emit(&mut buffer[offset..]);
                    offset += hop.wire_len();
                }
            }
            RouteAttribute::Other(nla) => nla.emit_value(buffer),
        }
    }

    fn is_nested(&self) -> bool {
        matches!(self, RouteAttribute::Metrics(_))
    }
}

fn parse_multipath(payload: &[u8], family: u8) -> Result<Vec<RouteNextHopEntry>, DecodeError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + RTNEXTHOP_LEN <= payload.len() {
        let (entry, consumed) = RouteNextHopEntry::parse(&payload[offset..], family)?;
        entries.push(entry);
        offset += consumed;
    }
    Ok(entries)
}

/// A complete route message: fixed header plus attribute tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMessage {
    pub header: RouteHeader,
    pub attributes: Vec<RouteAttribute>,
}

impl RouteMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let header = RouteHeader::parse(payload)?;
        let mut attributes = Vec::new();
        for nla in NlasIterator::new(&payload[RTMSG_LEN..]) {
            let nla = nla?;
            let value = nla.value();
            let attr = match nla.kind() {
                RTA_DST => RouteAttribute::Destination(parse_ip(value, header.family)?),
                RTA_SRC => RouteAttribute::Source(parse_ip(value, header.family)?),
                RTA_PREFSRC => RouteAttribute::PrefSource(parse_ip(value, header.family)?),
                RTA_GATEWAY => RouteAttribute::Gateway(parse_ip(value, header.family)?),
                RTA_OIF => RouteAttribute::Oif(parse_u32(value)?),
                RTA_PRIORITY => RouteAttribute::Priority(parse_u32(value)?),
                RTA_TABLE => RouteAttribute::Table(parse_u32(value)?),
                RTA_PREF => RouteAttribute::Preference(parse_u8(value)?),
                RTA_EXPIRES => RouteAttribute::Expires(parse_u32(value)?),
                RTA_CACHEINFO => RouteAttribute::CacheInfo(RouteCacheInfo::parse(value)?),
                RTA_METRICS => RouteAttribute::Metrics(parse_metrics(value)?),
                RTA_MULTIPATH => {
                    RouteAttribute::MultiPath(parse_multipath(value, header.family)?)
                }
                _ => RouteAttribute::Other(DefaultNla::parse(&nla)?),
            };
            attributes.push(attr);
        }
        Ok(Self { header, attributes })
    }
}

impl Emitable for RouteMessage {
    fn buffer_len(&self) -> usize {
        RTMSG_LEN + self.attributes.as_slice().buffer_len()
    }

    fn emit(&self, buffer: &mut [u8]) {
        self.header.emit(buffer);
        self.attributes.as_slice().emit(&mut buffer[RTMSG_LEN..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AF_INET, AF_INET6};
    use pretty_assertions::assert_eq;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn round_trip(msg: &RouteMessage) -> RouteMessage {
        let mut buf = vec![0u8; msg.buffer_len()];
        msg.emit(&mut buf);
        RouteMessage::parse(&buf).expect("decode of encoded message")
    }

    #[test]
    fn test_v4_route_round_trip() {
        let msg = RouteMessage {
            header: RouteHeader {
                family: AF_INET,
                dst_prefixlen: 24,
                table: 254,
                protocol: 4, // static
                scope: 0,
                kind: 1, // unicast
                ..Default::default()
            },
            attributes: vec![
                RouteAttribute::Destination(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0))),
                RouteAttribute::Gateway(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
                RouteAttribute::Priority(1024),
                RouteAttribute::Oif(2),
            ],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_wide_table_round_trip() {
        let msg = RouteMessage {
            header: RouteHeader {
                family: AF_INET6,
                dst_prefixlen: 64,
                table: 0, // RT_TABLE_UNSPEC; wide attribute carries the id
                ..Default::default()
            },
            attributes: vec![
                RouteAttribute::Destination(IpAddr::V6(Ipv6Addr::new(
                    0x2001, 0xdb8, 0, 0, 0, 0, 0, 0,
                ))),
                RouteAttribute::Table(10_000),
            ],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_metrics_round_trip() {
        let msg = RouteMessage {
            header: RouteHeader {
                family: AF_INET,
                table: 254,
                ..Default::default()
            },
            attributes: vec![RouteAttribute::Metrics(vec![
                RouteMetric::Numeric {
                    kind: RTAX_MTU,
                    value: 1400,
                },
                RouteMetric::Numeric {
                    kind: RTAX_HOPLIMIT,
                    value: 64,
                },
                RouteMetric::CongestionControl("bbr".to_string()),
            ])],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_multipath_round_trip() {
        let msg = RouteMessage {
            header: RouteHeader {
                family: AF_INET6,
                dst_prefixlen: 48,
                table: 254,
                ..Default::default()
            },
            attributes: vec![RouteAttribute::MultiPath(vec![
                RouteNextHopEntry {
                    flags: 0,
                    hops: 0,
                    ifindex: 2,
                    gateway: Some(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))),
                },
                RouteNextHopEntry {
                    flags: 0,
                    hops: 4,
                    ifindex: 3,
                    gateway: Some(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2))),
                },
            ])],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_malformed_priority_rejected() {
        // Build a message with RTA_PRIORITY carrying 2 bytes instead of 4.
        let header = RouteHeader {
            family: AF_INET,
            table: 254,
            ..Default::default()
        };
        let mut buf = vec![0u8; RTMSG_LEN + 8];
        header.emit(&mut buf);
        buf[RTMSG_LEN..RTMSG_LEN + 2].copy_from_slice(&6u16.to_ne_bytes()); // nla_len = 4 + 2
        buf[RTMSG_LEN + 2..RTMSG_LEN + 4].copy_from_slice(&RTA_PRIORITY.to_ne_bytes());
        assert!(RouteMessage::parse(&buf).is_err());
    }

    #[test]
    fn test_malformed_address_rejected() {
        // RTA_DST with a 4-byte payload on an IPv6 route.
        let header = RouteHeader {
            family: AF_INET6,
            table: 254,
            ..Default::default()
        };
        let mut buf = vec![0u8; RTMSG_LEN + 8];
        header.emit(&mut buf);
        buf[RTMSG_LEN..RTMSG_LEN + 2].copy_from_slice(&8u16.to_ne_bytes());
        buf[RTMSG_LEN + 2..RTMSG_LEN + 4].copy_from_slice(&RTA_DST.to_ne_bytes());
        assert!(RouteMessage::parse(&buf).is_err());
    }

    #[test]
    fn test_unknown_attribute_preserved() {
        let header = RouteHeader {
            family: AF_INET,
            table: 254,
            ..Default::default()
        };
        let mut buf = vec![0u8; RTMSG_LEN + 8];
        header.emit(&mut buf);
        buf[RTMSG_LEN..RTMSG_LEN + 2].copy_from_slice(&8u16.to_ne_bytes());
        buf[RTMSG_LEN + 2..RTMSG_LEN + 4].copy_from_slice(&200u16.to_ne_bytes());
        buf[RTMSG_LEN + 4..RTMSG_LEN + 8].copy_from_slice(&7u32.to_ne_bytes());
        let msg = RouteMessage::parse(&buf).unwrap();
        assert!(matches!(msg.attributes[0], RouteAttribute::Other(_)));
    }
}
