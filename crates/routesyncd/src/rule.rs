//! Routing-policy rule object model.
//!
//! Rules share the route lifecycle (provenance, state, GC mark) but
//! have their own identity field walk. Unlike routes, IPv4 and IPv6
//! rules compare over the same field set; only unknown families get
//! the always-collides treatment.

use std::fmt;
use std::net::IpAddr;

use routesync_rtnl::message::{AF_INET, AF_INET6};
use routesync_rtnl::rule::FIB_RULE_INVERT;
use routesync_rtnl::{RuleAttribute, RuleHeader, RuleMessage};

use crate::types::{
    ConfigSection, ConfigSource, ConfigState, FR_ACT_TO_TBL, RT_TABLE_DEFAULT, RT_TABLE_LOCAL,
    RT_TABLE_MAIN,
};

/// Priorities of the three rules the kernel installs at boot for each
/// family. The kernel recreates them unconditionally, so they are
/// never adopted as foreign and never swept.
const KERNEL_RULES: [(u32, u32); 3] = [
    (0, RT_TABLE_LOCAL),
    (32766, RT_TABLE_MAIN),
    (32767, RT_TABLE_DEFAULT),
];

/// A managed routing-policy rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicyRule {
    // Identity fields.
    pub family: u8,
    pub from: Option<IpAddr>,
    pub from_prefixlen: u8,
    pub to: Option<IpAddr>,
    pub to_prefixlen: u8,
    pub invert: bool,
    pub tos: u8,
    /// FR_ACT_* action.
    pub action: u8,
    pub fwmark: u32,
    pub fwmask: u32,
    pub priority: u32,
    pub table: u32,
    pub suppress_prefixlen: Option<u32>,
    pub ipproto: u8,
    pub protocol: u8,
    pub sport: Option<(u16, u16)>,
    pub dport: Option<(u16, u16)>,
    pub uid_range: Option<(u32, u32)>,
    pub iif: Option<String>,
    pub oif: Option<String>,
    pub l3mdev: bool,

    // Non-identity fields.
    pub source: ConfigSource,
    pub section: Option<ConfigSection>,
    pub state: ConfigState,
    pub kernel_present: bool,
    pub marked: bool,
}

impl Default for RoutingPolicyRule {
    fn default() -> Self {
        Self {
            family: 0,
            from: None,
            from_prefixlen: 0,
            to: None,
            to_prefixlen: 0,
            invert: false,
            tos: 0,
            action: FR_ACT_TO_TBL,
            fwmark: 0,
            fwmask: 0,
            priority: 0,
            table: RT_TABLE_MAIN,
            suppress_prefixlen: None,
            ipproto: 0,
            protocol: 0,
            sport: None,
            dport: None,
            uid_range: None,
            iif: None,
            oif: None,
            l3mdev: false,
            source: ConfigSource::Static,
            section: None,
            state: ConfigState::Requesting,
            kernel_present: false,
            marked: false,
        }
    }
}

/// Identity key for a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleIdentity {
    Ip {
        family: u8,
        from: Option<IpAddr>,
        from_prefixlen: u8,
        to: Option<IpAddr>,
        to_prefixlen: u8,
        invert: bool,
        tos: u8,
        action: u8,
        fwmark: u32,
        fwmask: u32,
        priority: u32,
        table: u32,
        suppress_prefixlen: Option<u32>,
        ipproto: u8,
        protocol: u8,
        sport: Option<(u16, u16)>,
        dport: Option<(u16, u16)>,
        uid_range: Option<(u32, u32)>,
        iif: Option<String>,
        oif: Option<String>,
        l3mdev: bool,
    },
    /// Unknown address family: always hash-collides, never
    /// distinguishes.
    Unspec,
}

impl RoutingPolicyRule {
    pub fn identity(&self) -> RuleIdentity {
        match self.family {
            AF_INET | AF_INET6 => RuleIdentity::Ip {
                family: self.family,
                from: self.from,
                from_prefixlen: self.from_prefixlen,
                to: self.to,
                to_prefixlen: self.to_prefixlen,
                invert: self.invert,
                tos: self.tos,
                action: self.action,
                fwmark: self.fwmark,
                fwmask: self.fwmask,
                priority: self.priority,
                table: self.table,
                suppress_prefixlen: self.suppress_prefixlen,
                ipproto: self.ipproto,
                protocol: self.protocol,
                sport: self.sport,
                dport: self.dport,
                uid_range: self.uid_range,
                iif: self.iif.clone(),
                oif: self.oif.clone(),
                l3mdev: self.l3mdev,
            },
            _ => RuleIdentity::Unspec,
        }
    }

    pub fn exists(&self) -> bool {
        self.kernel_present && !self.state.is_departing()
    }

    /// Rules the kernel owns: the boot-time local/main/default triple
    /// and anything bound to an l3mdev, which the vrf driver manages.
    pub fn is_kernel_intrinsic(&self) -> bool {
        if self.l3mdev {
            return true;
        }
        if self.from.is_some()
            || self.to.is_some()
            || self.fwmark != 0
            || self.iif.is_some()
            || self.oif.is_some()
        {
            return false;
        }
        KERNEL_RULES
            .iter()
            .any(|(priority, table)| self.priority == *priority && self.table == *table)
    }

    /// Encodes the rule for an RTM_NEWRULE/RTM_DELRULE request.
    pub fn to_message(&self) -> RuleMessage {
        let header = RuleHeader {
            family: self.family,
            dst_prefixlen: self.to_prefixlen,
            src_prefixlen: self.from_prefixlen,
            tos: self.tos,
            table: if self.table < 256 { self.table as u8 } else { 0 },
            action: self.action,
            flags: if self.invert { FIB_RULE_INVERT } else { 0 },
        };
        let mut attributes = Vec::new();
        if let Some(to) = self.to {
            attributes.push(RuleAttribute::Destination(to));
        }
        if let Some(from) = self.from {
            attributes.push(RuleAttribute::Source(from));
        }
        attributes.push(RuleAttribute::Priority(self.priority));
        if self.fwmark != 0 {
            attributes.push(RuleAttribute::FwMark(self.fwmark));
            if self.fwmask != 0 {
                attributes.push(RuleAttribute::FwMask(self.fwmask));
            }
        }
        if self.table >= 256 {
            attributes.push(RuleAttribute::Table(self.table));
        }
        if let Some(len) = self.suppress_prefixlen {
            attributes.push(RuleAttribute::SuppressPrefixLen(len));
        }
        if self.ipproto != 0 {
            attributes.push(RuleAttribute::IpProto(self.ipproto));
        }
        if self.protocol != 0 {
            attributes.push(RuleAttribute::Protocol(self.protocol));
        }
        if let Some((start, end)) = self.sport {
            attributes.push(RuleAttribute::SportRange { start, end });
        }
        if let Some((start, end)) = self.dport {
            attributes.push(RuleAttribute::DportRange { start, end });
        }
        if let Some((start, end)) = self.uid_range {
            attributes.push(RuleAttribute::UidRange { start, end });
        }
        if let Some(iif) = &self.iif {
            attributes.push(RuleAttribute::IifName(iif.clone()));
        }
        if let Some(oif) = &self.oif {
            attributes.push(RuleAttribute::OifName(oif.clone()));
        }
        if self.l3mdev {
            attributes.push(RuleAttribute::L3MDev(1));
        }
        RuleMessage { header, attributes }
    }

    /// Builds a rule from a decoded kernel message, tagged
    /// foreign/present; reconciliation overrides both for replies to
    /// our own requests.
    pub fn from_message(msg: &RuleMessage) -> RoutingPolicyRule {
        let mut rule = RoutingPolicyRule {
            family: msg.header.family,
            to_prefixlen: msg.header.dst_prefixlen,
            from_prefixlen: msg.header.src_prefixlen,
            tos: msg.header.tos,
            table: msg.header.table as u32,
            action: msg.header.action,
            invert: msg.header.flags & FIB_RULE_INVERT != 0,
            source: ConfigSource::Foreign,
            state: ConfigState::Configured,
            kernel_present: true,
            ..Default::default()
        };
        for attr in &msg.attributes {
            match attr {
                RuleAttribute::Destination(a) => rule.to = Some(*a),
                RuleAttribute::Source(a) => rule.from = Some(*a),
                RuleAttribute::IifName(name) => rule.iif = Some(name.clone()),
                RuleAttribute::OifName(name) => rule.oif = Some(name.clone()),
                RuleAttribute::Priority(priority) => rule.priority = *priority,
                RuleAttribute::FwMark(mark) => rule.fwmark = *mark,
                RuleAttribute::FwMask(mask) => rule.fwmask = *mask,
                RuleAttribute::Table(table) => rule.table = *table,
                RuleAttribute::SuppressPrefixLen(len) => rule.suppress_prefixlen = Some(*len),
                RuleAttribute::L3MDev(v) => rule.l3mdev = *v != 0,
                RuleAttribute::Protocol(proto) => rule.protocol = *proto,
                RuleAttribute::IpProto(proto) => rule.ipproto = *proto,
                RuleAttribute::UidRange { start, end } => rule.uid_range = Some((*start, *end)),
                RuleAttribute::SportRange { start, end } => rule.sport = Some((*start, *end)),
                RuleAttribute::DportRange { start, end } => rule.dport = Some((*start, *end)),
                RuleAttribute::Goto(_) | RuleAttribute::Other(_) => {}
            }
        }
        rule
    }
}

impl fmt::Display for RoutingPolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule priority {}", self.priority)?;
        if let Some(from) = self.from {
            write!(f, " from {}/{}", from, self.from_prefixlen)?;
        }
        if let Some(to) = self.to {
            write!(f, " to {}/{}", to, self.to_prefixlen)?;
        }
        write!(f, " table {} ({})", self.table, self.source)
    }
}
