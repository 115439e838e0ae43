//! Route nexthop satellite.
//!
//! A nexthop never exists on its own: its identity is folded into the
//! owning route's hash/compare, and multipath declarations are
//! expanded into one stored route per nexthop before anything reaches
//! the kernel.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::link::Link;

/// One hop of a route. `weight` is 1-based (the wire carries weight
/// minus one) and only meaningful inside a multipath declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteNextHop {
    pub gateway: Option<IpAddr>,
    /// Outgoing interface index; 0 when only the name is declared.
    pub ifindex: u32,
    /// Declared interface name, resolved to an index by [`Self::adjust`].
    pub ifname: Option<String>,
    pub weight: u8,
    pub flags: u32,
}

/// The slice of a nexthop that participates in route identity.
///
/// Weight is excluded: it is a mutable field merged in place when the
/// kernel reports a different balance for the same hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NextHopIdentity {
    pub gateway: Option<IpAddr>,
    pub ifindex: u32,
}

impl RouteNextHop {
    pub fn identity(&self) -> NextHopIdentity {
        NextHopIdentity {
            gateway: self.gateway,
            ifindex: self.ifindex,
        }
    }

    /// Identity including the weight, used when comparing whole
    /// multipath declarations (two declarations that only rebalance
    /// traffic are different intents).
    pub fn identity_with_weight(&self) -> (NextHopIdentity, u8) {
        (self.identity(), self.weight)
    }

    /// Link-dependent adjustment performed right before enqueue:
    /// resolves a declared interface name against the owning link.
    /// Returns false if the nexthop names a different interface and
    /// therefore cannot be configured through this link.
    pub fn adjust(&mut self, link: &Link) -> bool {
        match &self.ifname {
            Some(name) if *name == link.name => {
                self.ifindex = link.index;
                true
            }
            Some(_) => self.ifindex != 0,
            None => {
                if self.ifindex == 0 {
                    self.ifindex = link.index;
                }
                true
            }
        }
    }
}

impl fmt::Display for RouteNextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.gateway {
            Some(gw) => write!(f, "via {} dev {}", gw, self.ifindex),
            None => write!(f, "dev {}", self.ifindex),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use std::net::Ipv4Addr;

    fn link() -> Link {
        let mut link = Link::new(3, "eth0");
        link.state = LinkState::Configuring;
        link
    }

    #[test]
    fn test_adjust_resolves_name() {
        let mut nh = RouteNextHop {
            ifname: Some("eth0".to_string()),
            ..Default::default()
        };
        assert!(nh.adjust(&link()));
        assert_eq!(nh.ifindex, 3);
    }

    #[test]
    fn test_adjust_defaults_to_owning_link() {
        let mut nh = RouteNextHop {
            gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            ..Default::default()
        };
        assert!(nh.adjust(&link()));
        assert_eq!(nh.ifindex, 3);
    }

    #[test]
    fn test_adjust_rejects_unresolved_other_interface() {
        let mut nh = RouteNextHop {
            ifname: Some("eth1".to_string()),
            ..Default::default()
        };
        assert!(!nh.adjust(&link()));
    }

    #[test]
    fn test_identity_ignores_weight() {
        let a = RouteNextHop {
            gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            ifindex: 3,
            weight: 1,
            ..Default::default()
        };
        let mut b = a.clone();
        b.weight = 10;
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity_with_weight(), b.identity_with_weight());
    }
}
