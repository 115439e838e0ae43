//! Reconciliation: foreign adoption and mark-and-sweep collection.
//!
//! Unsolicited kernel notifications land here. A notification that
//! matches a stored object merges the mutable fields; one that does
//! not is either adopted (foreign management enabled, or it answers an
//! outstanding request) or dropped. Garbage collection runs on link
//! reconfiguration or loss, never continuously: mark every sweepable
//! object, unmark everything still declared by any active link, then
//! remove what stayed marked.

use std::collections::HashSet;

use tracing::{debug, info};

use routesync_rtnl::{RouteMessage, RtnlSender, RuleMessage};

use crate::error::Result;
use crate::link::LinkState;
use crate::manager::Manager;
use crate::queue::RequestObject;
use crate::route::Route;
use crate::rule::RoutingPolicyRule;
use crate::types::{ConfigSource, ConfigState};

impl Manager {
    /// Handles one RTM_NEWROUTE/RTM_DELROUTE broadcast. Multipath
    /// notifications are expanded so each hop reconciles against its
    /// own store entry.
    pub fn process_route_message(&mut self, is_new: bool, msg: &RouteMessage) {
        let incoming = Route::from_message(msg);
        for entry in incoming.expand() {
            if is_new {
                self.process_route_new(entry);
            } else {
                self.process_route_del(entry);
            }
        }
    }

    fn process_route_new(&mut self, mut entry: Route) {
        let identity = entry.identity();

        // Caller-intended metadata is not carried on the wire; if one
        // of our own requests is outstanding for this identity, take
        // lifetime and provenance from its snapshot.
        let requested = match self.queue.route_request_outstanding(&identity) {
            Some(request) => match &request.object {
                RequestObject::Route(snapshot) => {
                    Some((snapshot.lifetime, snapshot.source, snapshot.section.clone()))
                }
                RequestObject::Rule(_) => None,
            },
            None => None,
        };

        if let Some(stored) = self.routes.get_mut(&identity) {
            stored.kernel_present = true;
            if !stored.state.is_departing() {
                stored.state = ConfigState::Configured;
            }
            // Mutable, non-identity fields follow the kernel.
            stored.flags = entry.flags;
            if let (Some(ours), Some(theirs)) =
                (stored.nexthops.first_mut(), entry.nexthops.first())
            {
                ours.weight = theirs.weight;
            }
            if entry.kernel_managed_expiry {
                // The kernel enforces this route's lifetime from now
                // on; the local timer stays disabled for good.
                stored.kernel_managed_expiry = true;
            }
            if let Some((lifetime, source, section)) = requested {
                stored.lifetime = lifetime;
                stored.source = source;
                stored.section = section;
            }
            return;
        }

        match requested {
            Some((lifetime, source, section)) => {
                entry.lifetime = lifetime;
                entry.source = source;
                entry.section = section;
                entry.state = ConfigState::Configured;
                entry.kernel_present = true;
                debug!(route = %entry, "adopting just-configured route");
                self.routes.insert(identity, entry);
            }
            None if self.manage_foreign_routes && !entry.is_kernel_intrinsic() => {
                entry.source = ConfigSource::Foreign;
                entry.section = None;
                entry.state = ConfigState::Configured;
                entry.kernel_present = true;
                debug!(route = %entry, "adopting foreign route");
                self.routes.insert(identity, entry);
            }
            None => {
                debug!(route = %entry, "ignoring untracked route notification");
            }
        }
    }

    fn process_route_del(&mut self, entry: Route) {
        let identity = entry.identity();
        match self.routes.remove(&identity) {
            Some(mut stored) => {
                stored.state = ConfigState::Removed;
                debug!(route = %stored, "route removed by kernel");
            }
            None => {
                // Kernel state outran our knowledge; not an error.
                debug!(route = %entry, "deletion notification for unknown route");
            }
        }
    }

    /// Handles one RTM_NEWRULE/RTM_DELRULE broadcast.
    pub fn process_rule_message(&mut self, is_new: bool, msg: &RuleMessage) {
        let mut entry = RoutingPolicyRule::from_message(msg);
        let identity = entry.identity();

        if !is_new {
            match self.rules.remove(&identity) {
                Some(mut stored) => {
                    stored.state = ConfigState::Removed;
                    debug!(rule = %stored, "rule removed by kernel");
                }
                None => debug!(rule = %entry, "deletion notification for unknown rule"),
            }
            return;
        }

        let requested = match self.queue.rule_request_outstanding(&identity) {
            Some(request) => match &request.object {
                RequestObject::Rule(snapshot) => Some((snapshot.source, snapshot.section.clone())),
                RequestObject::Route(_) => None,
            },
            None => None,
        };

        if let Some(stored) = self.rules.get_mut(&identity) {
            stored.kernel_present = true;
            if !stored.state.is_departing() {
                stored.state = ConfigState::Configured;
            }
            if let Some((source, section)) = requested {
                stored.source = source;
                stored.section = section;
            }
            return;
        }

        match requested {
            Some((source, section)) => {
                entry.source = source;
                entry.section = section;
                entry.state = ConfigState::Configured;
                entry.kernel_present = true;
                self.rules.insert(identity, entry);
            }
            None if self.manage_foreign_rules && !entry.is_kernel_intrinsic() => {
                entry.source = ConfigSource::Foreign;
                entry.state = ConfigState::Configured;
                entry.kernel_present = true;
                debug!(rule = %entry, "adopting foreign rule");
                self.rules.insert(identity, entry);
            }
            None => {
                debug!(rule = %entry, "ignoring untracked rule notification");
            }
        }
    }

    /// Mark phase: every sweepable object becomes a removal candidate.
    /// Kernel-intrinsic objects and satellite-owned injections are
    /// exempt.
    pub fn gc_mark(&mut self) {
        for route in self.routes.values_mut() {
            if route.is_kernel_intrinsic() || !route.source.is_gc_target() {
                continue;
            }
            route.marked = true;
        }
        for rule in self.rules.values_mut() {
            if rule.is_kernel_intrinsic() || !rule.source.is_gc_target() {
                continue;
            }
            rule.marked = true;
        }
    }

    /// Unmark phase: walk every active link's declared objects
    /// (per-nexthop expanded, link-adjusted) and clear the mark on
    /// structurally identical store entries. A route one link dropped
    /// survives as long as any other link still declares it.
    pub fn gc_unmark_declared(&mut self) {
        let mut keep_routes = HashSet::new();
        let mut keep_rules = HashSet::new();
        for link in self.links.values() {
            if !matches!(link.state, LinkState::Configuring | LinkState::Configured) {
                continue;
            }
            let Some(network) = &link.network else {
                continue;
            };
            for declared in network.routes() {
                for mut snapshot in declared.expand() {
                    if let Some(nh) = snapshot.nexthops.first_mut() {
                        if !nh.adjust(link) {
                            continue;
                        }
                    }
                    keep_routes.insert(snapshot.identity());
                }
            }
            for declared in network.rules() {
                keep_rules.insert(declared.identity());
            }
        }

        for (identity, route) in self.routes.iter_mut() {
            if keep_routes.contains(identity) {
                route.marked = false;
            }
        }
        for (identity, rule) in self.rules.iter_mut() {
            if keep_rules.contains(identity) {
                rule.marked = false;
            }
        }
    }

    /// Sweep phase: removal requests for everything still marked.
    /// Entries that never made it into the kernel are simply
    /// forgotten.
    pub async fn gc_sweep(&mut self, sender: &mut dyn RtnlSender) -> Result<()> {
        let route_ids: Vec<_> = self
            .routes
            .iter()
            .filter(|(_, route)| route.marked && route.exists())
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in route_ids {
            info!("sweeping unclaimed route");
            self.remove_route(sender, &identity, false).await?;
        }
        self.routes
            .retain(|_, route| !(route.marked && !route.kernel_present));

        let rule_ids: Vec<_> = self
            .rules
            .iter()
            .filter(|(_, rule)| rule.marked && rule.exists())
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in rule_ids {
            info!("sweeping unclaimed rule");
            self.remove_rule(sender, &identity).await?;
        }
        self.rules
            .retain(|_, rule| !(rule.marked && !rule.kernel_present));
        Ok(())
    }

    /// Full collection pass, invoked on link reconfiguration or loss.
    pub async fn garbage_collect(&mut self, sender: &mut dyn RtnlSender) -> Result<()> {
        self.gc_mark();
        self.gc_unmark_declared();
        self.gc_sweep(sender).await
    }

    /// Release-unmanaged variant: instead of deleting still-marked
    /// objects, re-tag them as foreign so they stay in the kernel but
    /// are no longer claimed by any declaration.
    pub fn gc_foreignize(&mut self) {
        for route in self.routes.values_mut() {
            if route.marked {
                route.source = ConfigSource::Foreign;
                route.section = None;
                route.marked = false;
            }
        }
        for rule in self.rules.values_mut() {
            if rule.marked {
                rule.source = ConfigSource::Foreign;
                rule.section = None;
                rule.marked = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::network::Network;
    use crate::route::nexthop::RouteNextHop;
    use crate::types::RTPROT_KERNEL;
    use routesync_rtnl::message::AF_INET;
    use std::net::{IpAddr, Ipv4Addr};

    fn stored_route(dst: [u8; 4], source: ConfigSource) -> Route {
        Route {
            family: AF_INET,
            dst: Some(IpAddr::V4(Ipv4Addr::from(dst))),
            dst_prefixlen: 24,
            nexthops: vec![RouteNextHop {
                gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
                ifindex: 2,
                weight: 1,
                ..Default::default()
            }],
            source,
            state: ConfigState::Configured,
            kernel_present: true,
            ..Default::default()
        }
    }

    fn manager_with(routes: Vec<Route>) -> Manager {
        let mut manager = Manager::new(true, true);
        for route in routes {
            manager.routes.insert(route.identity(), route);
        }
        manager
    }

    #[test]
    fn test_mark_skips_kernel_intrinsic() {
        let mut kernel = stored_route([10, 1, 0, 0], ConfigSource::Foreign);
        kernel.protocol = RTPROT_KERNEL;
        let mut manager = manager_with(vec![
            stored_route([10, 0, 0, 0], ConfigSource::Static),
            kernel.clone(),
        ]);
        manager.gc_mark();
        assert!(manager.routes[&stored_route([10, 0, 0, 0], ConfigSource::Static).identity()].marked);
        assert!(!manager.routes[&kernel.identity()].marked);
    }

    #[test]
    fn test_unmark_keeps_still_declared() {
        let declared = stored_route([10, 0, 0, 0], ConfigSource::Static);
        let mut manager = manager_with(vec![declared.clone()]);

        let mut link = Link::new(2, "eth0");
        link.state = LinkState::Configured;
        let mut network = Network::new("uplink.network");
        *network.route_get_or_create(1).unwrap() = declared.clone();
        link.network = Some(network);
        manager.add_link(link);

        manager.gc_mark();
        manager.gc_unmark_declared();
        assert!(!manager.routes[&declared.identity()].marked);
    }

    #[test]
    fn test_foreignize_retags_marked() {
        let declared = stored_route([10, 0, 0, 0], ConfigSource::Static);
        let identity = declared.identity();
        let mut manager = manager_with(vec![declared]);
        manager.gc_mark();
        manager.gc_foreignize();
        let route = &manager.routes[&identity];
        assert_eq!(route.source, ConfigSource::Foreign);
        assert!(route.section.is_none());
        assert!(!route.marked);
    }

    #[test]
    fn test_notification_merges_into_stored_route() {
        let stored = stored_route([10, 0, 0, 0], ConfigSource::Static);
        let identity = stored.identity();
        let mut manager = manager_with(vec![stored.clone()]);

        // The kernel reports the same route, now with a cache-expiry
        // attribute: provenance stays ours, the expiry handoff sticks.
        let mut msg = stored.to_message();
        msg.attributes
            .push(routesync_rtnl::RouteAttribute::CacheInfo(
                routesync_rtnl::RouteCacheInfo {
                    expires: 300,
                    ..Default::default()
                },
            ));
        manager.process_route_message(true, &msg);

        let merged = &manager.routes[&identity];
        assert_eq!(merged.source, ConfigSource::Static);
        assert!(merged.kernel_managed_expiry);
        assert!(merged.kernel_present);
    }
}
