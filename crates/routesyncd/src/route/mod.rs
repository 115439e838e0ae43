//! Route object model.
//!
//! A [`Route`] carries two kinds of fields. Identity fields decide
//! whether two objects denote the same kernel entity; they feed
//! [`RouteIdentity`], the hash/compare key for every store and queue.
//! Everything else (lifetime, provenance, lifecycle state, nexthop
//! weight) may be updated in place on a stored route without changing
//! which entity it is.
//!
//! IPv4 and IPv6 use different identity field sets, mirroring how the
//! kernel's own fib lookup classifies the two families. Any other
//! family is deliberately treated as indistinct: all such routes
//! collapse onto one identity and are effectively untracked. This is
//! preserved behavior, not an oversight; tightening it would change
//! how unknown-family kernel state is (not) reconciled.

pub mod metric;
pub mod nexthop;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

use routesync_rtnl::message::{AF_INET, AF_INET6};
use routesync_rtnl::{RouteAttribute, RouteHeader, RouteMessage, RouteNextHopEntry};

use crate::types::{
    ConfigSection, ConfigSource, ConfigState, RTNH_COMPARE_MASK, RTN_BLACKHOLE, RTN_MULTICAST,
    RTN_PROHIBIT, RTN_THROW, RTN_UNICAST, RTN_UNREACHABLE, RTPROT_BOOT, RTPROT_KERNEL,
    RTPROT_STATIC, RT_SCOPE_UNIVERSE, RT_TABLE_MAIN,
};

use metric::RouteMetrics;
use nexthop::{NextHopIdentity, RouteNextHop};

/// A managed route: declared, adopted or in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    // Identity fields.
    pub family: u8,
    pub dst: Option<IpAddr>,
    pub dst_prefixlen: u8,
    pub src: Option<IpAddr>,
    pub src_prefixlen: u8,
    pub prefsrc: Option<IpAddr>,
    pub priority: u32,
    pub tos: u8,
    pub table: u32,
    pub protocol: u8,
    pub scope: u8,
    /// RTN_* route type.
    pub kind: u8,
    pub flags: u32,
    pub metrics: RouteMetrics,
    /// Declared routes may carry several hops; stored routes carry
    /// exactly one (multipath is expanded at enqueue time).
    pub nexthops: Vec<RouteNextHop>,

    // Non-identity fields.
    pub pref: Option<u8>,
    /// Declared lifetime; `None` means the route does not expire.
    pub lifetime: Option<Duration>,
    /// Absolute deadline derived from `lifetime` at configure time.
    /// Doubles as the staleness check for fired expiration timers.
    pub valid_until: Option<Instant>,
    /// Set once a kernel cache-expiry attribute was observed for this
    /// route; from then on the local expiration timer stays disabled.
    pub kernel_managed_expiry: bool,
    pub source: ConfigSource,
    pub section: Option<ConfigSection>,
    pub state: ConfigState,
    /// True while the kernel is believed to hold this route.
    pub kernel_present: bool,
    /// Orthogonal GC bit.
    pub marked: bool,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            family: 0,
            dst: None,
            dst_prefixlen: 0,
            src: None,
            src_prefixlen: 0,
            prefsrc: None,
            priority: 0,
            tos: 0,
            table: RT_TABLE_MAIN,
            protocol: RTPROT_STATIC,
            scope: RT_SCOPE_UNIVERSE,
            kind: RTN_UNICAST,
            flags: 0,
            metrics: RouteMetrics::default(),
            nexthops: Vec::new(),
            pref: None,
            lifetime: None,
            valid_until: None,
            kernel_managed_expiry: false,
            source: ConfigSource::Static,
            section: None,
            state: ConfigState::Requesting,
            kernel_present: false,
            marked: false,
        }
    }
}

/// The identity key for a route. Derived `Hash`/`Eq`/`Ord` over the
/// per-family field sets makes hash/compare consistency structural
/// rather than something two hand-written functions must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteIdentity {
    V4 {
        table: u32,
        dst: Option<IpAddr>,
        dst_prefixlen: u8,
        priority: u32,
        tos: u8,
        protocol: u8,
        scope: u8,
        kind: u8,
        flags: u32,
        prefsrc: Option<IpAddr>,
        metrics: RouteMetrics,
        nexthop: NextHopIdentity,
    },
    V6 {
        table: u32,
        dst: Option<IpAddr>,
        dst_prefixlen: u8,
        src: Option<IpAddr>,
        src_prefixlen: u8,
        priority: u32,
        nexthop: NextHopIdentity,
    },
    /// Unknown address family: always hash-collides, never
    /// distinguishes.
    Unspec,
}

impl Route {
    pub fn identity(&self) -> RouteIdentity {
        let nexthop = self
            .nexthops
            .first()
            .map(RouteNextHop::identity)
            .unwrap_or(NextHopIdentity {
                gateway: None,
                ifindex: 0,
            });
        match self.family {
            AF_INET => RouteIdentity::V4 {
                table: self.table,
                dst: self.dst,
                dst_prefixlen: self.dst_prefixlen,
                priority: self.priority,
                tos: self.tos,
                protocol: self.protocol,
                scope: self.scope,
                kind: self.kind,
                flags: self.flags & RTNH_COMPARE_MASK,
                prefsrc: self.prefsrc,
                metrics: self.metrics.clone(),
                nexthop,
            },
            AF_INET6 => RouteIdentity::V6 {
                table: self.table,
                dst: self.dst,
                dst_prefixlen: self.dst_prefixlen,
                src: self.src,
                src_prefixlen: self.src_prefixlen,
                priority: self.priority,
                nexthop,
            },
            _ => RouteIdentity::Unspec,
        }
    }

    /// True while the kernel is believed to hold this route and it is
    /// not already on its way out.
    pub fn exists(&self) -> bool {
        self.kernel_present && !self.state.is_departing()
    }

    /// Reject-type routes never carry a nexthop.
    pub fn is_reject(&self) -> bool {
        matches!(
            self.kind,
            RTN_BLACKHOLE | RTN_UNREACHABLE | RTN_PROHIBIT | RTN_THROW
        )
    }

    /// Routes the kernel creates and recreates on its own. Sweeping
    /// them is churn, not reconciliation, so the GC skips them and
    /// they are never adopted as foreign.
    pub fn is_kernel_intrinsic(&self) -> bool {
        if self.protocol == RTPROT_KERNEL {
            return true;
        }
        // The IPv6 multicast route the kernel installs per interface:
        // ff00::/8, proto boot, type multicast.
        if self.family == AF_INET6
            && self.protocol == RTPROT_BOOT
            && self.kind == RTN_MULTICAST
            && self.dst_prefixlen == 8
        {
            if let Some(IpAddr::V6(dst)) = self.dst {
                return dst.octets()[0] == 0xff;
            }
        }
        false
    }

    /// Snapshot duplication with a single nexthop, used both for
    /// multipath expansion and to give the request queue an immutable
    /// copy independent of the caller's.
    pub fn dup(&self, nexthop: RouteNextHop) -> Route {
        let mut copy = self.clone();
        copy.nexthops = vec![nexthop];
        copy.state = ConfigState::Requesting;
        copy.kernel_present = false;
        copy.marked = false;
        copy.valid_until = None;
        copy
    }

    /// Expands a declaration into its per-nexthop store entries. A
    /// route with zero or one nexthop yields exactly one snapshot.
    pub fn expand(&self) -> Vec<Route> {
        if self.nexthops.len() <= 1 {
            vec![self.dup(self.nexthops.first().cloned().unwrap_or_default())]
        } else {
            self.nexthops.iter().map(|nh| self.dup(nh.clone())).collect()
        }
    }

    /// Whether the stored route already satisfies the declared one,
    /// making a new configuration request redundant.
    pub fn converged_with(&self, declared: &Route) -> bool {
        self.exists() && self.state == ConfigState::Configured && self.lifetime == declared.lifetime
    }

    /// Encodes the route for an RTM_NEWROUTE/RTM_DELROUTE request.
    pub fn to_message(&self) -> RouteMessage {
        let header = RouteHeader {
            family: self.family,
            dst_prefixlen: self.dst_prefixlen,
            src_prefixlen: self.src_prefixlen,
            tos: self.tos,
            table: if self.table < 256 { self.table as u8 } else { 0 },
            protocol: self.protocol,
            scope: self.scope,
            kind: self.kind,
            flags: self.flags,
        };
        let mut attributes = Vec::new();
        if let Some(dst) = self.dst {
            attributes.push(RouteAttribute::Destination(dst));
        }
        if let Some(src) = self.src {
            attributes.push(RouteAttribute::Source(src));
        }
        if let Some(prefsrc) = self.prefsrc {
            attributes.push(RouteAttribute::PrefSource(prefsrc));
        }
        if self.priority != 0 {
            attributes.push(RouteAttribute::Priority(self.priority));
        }
        if self.table >= 256 {
            attributes.push(RouteAttribute::Table(self.table));
        }
        if let Some(pref) = self.pref {
            attributes.push(RouteAttribute::Preference(pref));
        }
        if let Some(lifetime) = self.lifetime {
            attributes.push(RouteAttribute::Expires(lifetime.as_secs() as u32));
        }
        if !self.metrics.is_empty() {
            attributes.push(RouteAttribute::Metrics(self.metrics.to_attributes()));
        }
        if !self.is_reject() {
            match self.nexthops.as_slice() {
                [] => {}
                [nh] => {
                    if let Some(gw) = nh.gateway {
                        attributes.push(RouteAttribute::Gateway(gw));
                    }
                    if nh.ifindex != 0 {
                        attributes.push(RouteAttribute::Oif(nh.ifindex));
                    }
                }
                hops => {
                    attributes.push(RouteAttribute::MultiPath(
                        hops.iter()
                            .map(|nh| RouteNextHopEntry {
                                flags: nh.flags as u8,
                                hops: nh.weight.saturating_sub(1),
                                ifindex: nh.ifindex,
                                gateway: nh.gateway,
                            })
                            .collect(),
                    ));
                }
            }
        }
        RouteMessage { header, attributes }
    }

    /// Builds a route from a decoded kernel message. The result is
    /// tagged foreign/present; the reconciliation path overrides both
    /// when the message answers one of our own requests.
    pub fn from_message(msg: &RouteMessage) -> Route {
        let mut route = Route {
            family: msg.header.family,
            dst_prefixlen: msg.header.dst_prefixlen,
            src_prefixlen: msg.header.src_prefixlen,
            tos: msg.header.tos,
            table: msg.header.table as u32,
            protocol: msg.header.protocol,
            scope: msg.header.scope,
            kind: msg.header.kind,
            flags: msg.header.flags,
            source: ConfigSource::Foreign,
            state: ConfigState::Configured,
            kernel_present: true,
            ..Default::default()
        };
        let mut single = RouteNextHop::default();
        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(a) => route.dst = Some(*a),
                RouteAttribute::Source(a) => route.src = Some(*a),
                RouteAttribute::PrefSource(a) => route.prefsrc = Some(*a),
                RouteAttribute::Gateway(a) => single.gateway = Some(*a),
                RouteAttribute::Oif(index) => single.ifindex = *index,
                RouteAttribute::Priority(priority) => route.priority = *priority,
                RouteAttribute::Table(table) => route.table = *table,
                RouteAttribute::Preference(pref) => route.pref = Some(*pref),
                RouteAttribute::Expires(secs) => {
                    route.lifetime = Some(Duration::from_secs(*secs as u64));
                }
                RouteAttribute::CacheInfo(ci) => {
                    if ci.expires != 0 {
                        route.kernel_managed_expiry = true;
                    }
                }
                RouteAttribute::Metrics(attrs) => {
                    route.metrics = RouteMetrics::from_attributes(attrs);
                }
                RouteAttribute::MultiPath(entries) => {
                    route.nexthops = entries
                        .iter()
                        .map(|e| RouteNextHop {
                            gateway: e.gateway,
                            ifindex: e.ifindex,
                            ifname: None,
                            weight: e.hops.saturating_add(1),
                            flags: e.flags as u32,
                        })
                        .collect();
                }
                RouteAttribute::Other(_) => {}
            }
        }
        if route.nexthops.is_empty() && (single.gateway.is_some() || single.ifindex != 0) {
            single.weight = 1;
            route.nexthops = vec![single];
        }
        route
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dst {
            Some(dst) => write!(f, "{}/{}", dst, self.dst_prefixlen)?,
            None => f.write_str("default")?,
        }
        if let Some(nh) = self.nexthops.first() {
            write!(f, " {}", nh)?;
        }
        write!(f, " table {} ({})", self.table, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn hash_of(id: &RouteIdentity) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    fn v4_route() -> Route {
        Route {
            family: AF_INET,
            dst: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0))),
            dst_prefixlen: 24,
            priority: 1024,
            nexthops: vec![RouteNextHop {
                gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
                ifindex: 2,
                weight: 1,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn v6_route() -> Route {
        Route {
            family: AF_INET6,
            dst: Some(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0))),
            dst_prefixlen: 64,
            priority: 512,
            nexthops: vec![RouteNextHop {
                gateway: Some(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))),
                ifindex: 2,
                weight: 1,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_equal_identity_implies_equal_hash() {
        let a = v4_route();
        let mut b = v4_route();
        // Differ only in non-identity fields.
        b.lifetime = Some(Duration::from_secs(600));
        b.nexthops[0].weight = 7;
        b.source = ConfigSource::Dhcp4;
        assert_eq!(a.identity(), b.identity());
        assert_eq!(hash_of(&a.identity()), hash_of(&b.identity()));
    }

    #[test]
    fn test_volatile_flags_do_not_distinguish() {
        let a = v4_route();
        let mut b = v4_route();
        b.flags |= crate::types::RTNH_F_DEAD | crate::types::RTNH_F_LINKDOWN;
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_v6_identity_ignores_tos_and_protocol() {
        // The IPv6 identity field set is narrower than IPv4's.
        let a = v6_route();
        let mut b = v6_route();
        b.tos = 16;
        b.protocol = RTPROT_BOOT;
        assert_eq!(a.identity(), b.identity());

        let mut c = v4_route();
        c.tos = 16;
        assert_ne!(v4_route().identity(), c.identity());
    }

    #[test]
    fn test_unknown_family_always_collides() {
        let mut a = v4_route();
        a.family = 7;
        let mut b = v6_route();
        b.family = 7;
        assert_eq!(a.identity(), b.identity());
        assert_eq!(hash_of(&a.identity()), hash_of(&b.identity()));
    }

    #[test]
    fn test_round_trip_preserves_identity() {
        for route in [v4_route(), v6_route()] {
            let rebuilt = Route::from_message(&route.to_message());
            assert_eq!(rebuilt.identity(), route.identity());
        }
    }

    #[test]
    fn test_wide_table_round_trip() {
        let mut route = v4_route();
        route.table = 10_000;
        let msg = route.to_message();
        assert_eq!(msg.header.table, 0);
        let rebuilt = Route::from_message(&msg);
        assert_eq!(rebuilt.table, 10_000);
        assert_eq!(rebuilt.identity(), route.identity());
    }

    #[test]
    fn test_reject_route_carries_no_nexthop() {
        let mut route = v4_route();
        route.kind = RTN_UNREACHABLE;
        let msg = route.to_message();
        assert!(!msg.attributes.iter().any(|a| matches!(
            a,
            RouteAttribute::Gateway(_) | RouteAttribute::Oif(_) | RouteAttribute::MultiPath(_)
        )));
    }

    #[test]
    fn test_cleared_metric_absent_from_encode() {
        let mut route = v4_route();
        route.metrics.set(routesync_rtnl::route::RTAX_MTU, 1400);
        assert!(route
            .to_message()
            .attributes
            .iter()
            .any(|a| matches!(a, RouteAttribute::Metrics(_))));

        route.metrics.set(routesync_rtnl::route::RTAX_MTU, 0);
        assert!(!route
            .to_message()
            .attributes
            .iter()
            .any(|a| matches!(a, RouteAttribute::Metrics(_))));
    }

    #[test]
    fn test_expand_multipath() {
        let mut route = v6_route();
        route.nexthops.push(RouteNextHop {
            gateway: Some(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2))),
            ifindex: 3,
            weight: 4,
            ..Default::default()
        });
        let expanded = route.expand();
        assert_eq!(expanded.len(), 2);
        assert_ne!(expanded[0].identity(), expanded[1].identity());
        for entry in &expanded {
            assert_eq!(entry.nexthops.len(), 1);
            assert_eq!(entry.state, ConfigState::Requesting);
        }
    }

    #[test]
    fn test_kernel_intrinsic_detection() {
        let mut kernel = v4_route();
        kernel.protocol = RTPROT_KERNEL;
        assert!(kernel.is_kernel_intrinsic());

        let multicast = Route {
            family: AF_INET6,
            dst: Some(IpAddr::V6(Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0))),
            dst_prefixlen: 8,
            protocol: RTPROT_BOOT,
            kind: RTN_MULTICAST,
            ..Default::default()
        };
        assert!(multicast.is_kernel_intrinsic());
        assert!(!v4_route().is_kernel_intrinsic());
    }
}
