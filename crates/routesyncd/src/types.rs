//! Shared object-model types: provenance, lifecycle state, declared
//! section identity and the rtnetlink constants the engine matches on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Route protocols (`rtm_protocol`, linux/rtnetlink.h).
pub const RTPROT_UNSPEC: u8 = 0;
pub const RTPROT_REDIRECT: u8 = 1;
pub const RTPROT_KERNEL: u8 = 2;
pub const RTPROT_BOOT: u8 = 3;
pub const RTPROT_STATIC: u8 = 4;
pub const RTPROT_RA: u8 = 9;
pub const RTPROT_DHCP: u8 = 16;

/// Well-known routing table ids.
pub const RT_TABLE_UNSPEC: u32 = 0;
pub const RT_TABLE_DEFAULT: u32 = 253;
pub const RT_TABLE_MAIN: u32 = 254;
pub const RT_TABLE_LOCAL: u32 = 255;

/// Route scopes (`rtm_scope`).
pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RT_SCOPE_SITE: u8 = 200;
pub const RT_SCOPE_LINK: u8 = 253;
pub const RT_SCOPE_HOST: u8 = 254;
pub const RT_SCOPE_NOWHERE: u8 = 255;

/// Route types (`rtm_type`).
pub const RTN_UNSPEC: u8 = 0;
pub const RTN_UNICAST: u8 = 1;
pub const RTN_LOCAL: u8 = 2;
pub const RTN_BROADCAST: u8 = 3;
pub const RTN_ANYCAST: u8 = 4;
pub const RTN_MULTICAST: u8 = 5;
pub const RTN_BLACKHOLE: u8 = 6;
pub const RTN_UNREACHABLE: u8 = 7;
pub const RTN_PROHIBIT: u8 = 8;
pub const RTN_THROW: u8 = 9;

/// Routing-policy rule actions (`fib_rule_hdr.action`).
pub const FR_ACT_UNSPEC: u8 = 0;
pub const FR_ACT_TO_TBL: u8 = 1;
pub const FR_ACT_GOTO: u8 = 2;
pub const FR_ACT_NOP: u8 = 3;
pub const FR_ACT_BLACKHOLE: u8 = 6;
pub const FR_ACT_UNREACHABLE: u8 = 7;
pub const FR_ACT_PROHIBIT: u8 = 8;

/// Per-nexthop flag bits (`rtnh_flags`).
pub const RTNH_F_DEAD: u32 = 0x01;
pub const RTNH_F_PERVASIVE: u32 = 0x02;
pub const RTNH_F_ONLINK: u32 = 0x04;
pub const RTNH_F_OFFLOAD: u32 = 0x08;
pub const RTNH_F_LINKDOWN: u32 = 0x10;
pub const RTNH_F_UNRESOLVED: u32 = 0x20;
pub const RTNH_F_TRAP: u32 = 0x40;

/// Mask applied to route flags before identity comparison: the kernel
/// flips these bits at will, so they must never distinguish two
/// observations of the same route.
pub const RTNH_COMPARE_MASK: u32 = !(RTNH_F_DEAD | RTNH_F_LINKDOWN | RTNH_F_OFFLOAD | RTNH_F_TRAP);

/// Where a managed object came from.
///
/// Provenance decides garbage-collection eligibility (foreign and
/// statically declared objects are sweep targets, kernel-intrinsic
/// ones never are) and which log lines an operator sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Observed in the kernel, not created by this daemon.
    Foreign,
    /// Statically declared in a network profile.
    Static,
    /// Produced by a DHCPv4 lease.
    Dhcp4,
    /// Produced by a DHCPv6 lease.
    Dhcp6,
    /// Learned from router advertisements.
    Ndisc,
    /// IPv4 link-local autoconfiguration.
    Ipv4ll,
    /// Injected by a virtual-device construct outside normal link
    /// configuration.
    NetDev,
}

impl ConfigSource {
    /// Objects from dynamic protocols and static declarations are
    /// reclaimed when their declaring link goes away; foreign objects
    /// only when foreign management is enabled.
    pub fn is_gc_target(self) -> bool {
        !matches!(self, ConfigSource::NetDev)
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigSource::Foreign => "foreign",
            ConfigSource::Static => "static",
            ConfigSource::Dhcp4 => "DHCPv4",
            ConfigSource::Dhcp6 => "DHCPv6",
            ConfigSource::Ndisc => "NDisc",
            ConfigSource::Ipv4ll => "IPv4LL",
            ConfigSource::NetDev => "netdev",
        };
        f.write_str(s)
    }
}

/// Per-object lifecycle state.
///
/// Transitions happen only via the request queue or a kernel
/// notification; nothing else mutates this. The GC mark and the
/// kernel-presence bit are deliberately not part of this enum: both
/// are orthogonal to where the object is in its request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigState {
    /// Queued, not yet written to the socket.
    Requesting,
    /// Request sent, awaiting the kernel's reply.
    Configuring,
    /// Acked by the kernel.
    Configured,
    /// Removal sent, awaiting the kernel's reply.
    Removing,
    /// Removal acked or kernel deletion observed; the object is about
    /// to be forgotten.
    Removed,
}

impl ConfigState {
    /// True while a request is in flight in either direction.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ConfigState::Configuring | ConfigState::Removing)
    }

    /// True once the object is on its way out; such an object never
    /// satisfies a convergence check.
    pub fn is_departing(self) -> bool {
        matches!(self, ConfigState::Removing | ConfigState::Removed)
    }
}

impl fmt::Display for ConfigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigState::Requesting => "requesting",
            ConfigState::Configuring => "configuring",
            ConfigState::Configured => "configured",
            ConfigState::Removing => "removing",
            ConfigState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Identity of a declaration site in a network profile: the section
/// key used by the declared-config collaborator for lookup-or-create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigSection {
    pub filename: String,
    pub line: u32,
}

impl ConfigSection {
    pub fn new(filename: impl Into<String>, line: u32) -> Self {
        Self {
            filename: filename.into(),
            line,
        }
    }
}

impl fmt::Display for ConfigSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.line)
    }
}
