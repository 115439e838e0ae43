//! End-to-end engine tests driven through a recording transport mock.
//!
//! Each test tells one reconciliation story: a declaration enters the
//! engine, wire messages come out, replies and broadcasts come back,
//! and the stores settle into the expected shape. No kernel socket is
//! involved; the mock stands in for the transport seam.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::time::Instant;

use routesync_rtnl::message::{AF_INET, AF_INET6};
use routesync_rtnl::{RouteAttribute, RouteCacheInfo, RtnlMessage, RtnlSender};
use routesyncd::{
    ConfigSection, ConfigSource, ConfigState, Link, LinkState, Manager, Network, Route,
    RouteNextHop,
};

/// Records every request instead of writing to a socket. Sequence
/// numbers are handed out like the real transport's.
#[derive(Default)]
struct MockSender {
    sent: Vec<(RtnlMessage, u16)>,
    next_seq: u32,
}

#[async_trait]
impl RtnlSender for MockSender {
    async fn send_request(
        &mut self,
        message: RtnlMessage,
        extra_flags: u16,
    ) -> routesync_rtnl::Result<u32> {
        self.next_seq += 1;
        self.sent.push((message, extra_flags));
        Ok(self.next_seq)
    }
}

fn ready_link(index: u32, name: &str) -> Link {
    let mut link = Link::new(index, name);
    link.state = LinkState::Configuring;
    link.network = Some(Network::new(format!("{name}.network")));
    link
}

fn manager_with_link() -> Manager {
    let mut manager = Manager::new(true, true);
    manager.add_link(ready_link(2, "eth0"));
    manager
}

fn declared_v4_route() -> Route {
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

/// Declares `route` at `line` in the link's network profile, so the
/// GC unmark phase sees it.
fn declare_in_network(manager: &mut Manager, link_index: u32, line: u32, route: &Route) {
    let network = manager
        .links
        .get_mut(&link_index)
        .unwrap()
        .network
        .as_mut()
        .unwrap();
    let slot = network.route_get_or_create(line).unwrap();
    let section = slot.section.clone();
    *slot = route.clone();
    slot.section = section;
}

#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();
    let route = declared_v4_route();

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    manager.request_route(&mut mock, 2, &route).await.unwrap();

    // Two intents, one wire message.
    assert_eq!(mock.sent.len(), 1);
    assert!(matches!(mock.sent[0].0, RtnlMessage::NewRoute(_)));
}

#[tokio::test]
async fn test_multipath_expands_with_joint_completion() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();

    let mut route = Route {
        family: AF_INET6,
        dst: Some(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0))),
        dst_prefixlen: 64,
        ..Default::default()
    };
    route.nexthops = vec![
        RouteNextHop {
            gateway: Some(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))),
            ifindex: 2,
            weight: 1,
            ..Default::default()
        },
        RouteNextHop {
            gateway: Some(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2))),
            ifindex: 2,
            weight: 1,
            ..Default::default()
        },
    ];

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    assert_eq!(mock.sent.len(), 2, "one request per nexthop");

    // Each expansion deduplicates independently.
    manager.request_route(&mut mock, 2, &route).await.unwrap();
    assert_eq!(mock.sent.len(), 2);

    // Completion requires both replies.
    manager.handle_ack(&mut mock, 1, 0).await.unwrap();
    assert!(!manager.links[&2].routes_configured);
    manager.handle_ack(&mut mock, 2, 0).await.unwrap();
    assert!(manager.links[&2].routes_configured);
}

#[tokio::test]
async fn test_eexist_is_absorbed_as_success() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();
    let route = declared_v4_route();

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    manager
        .handle_ack(&mut mock, 1, -libc::EEXIST)
        .await
        .unwrap();

    let stored = &manager.routes[&route.identity()];
    assert_eq!(stored.state, ConfigState::Configured);
    assert!(stored.kernel_present);
    assert_ne!(manager.links[&2].state, LinkState::Failed);
}

#[tokio::test]
async fn test_kernel_rejection_fails_the_link() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();
    let route = declared_v4_route();

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    manager
        .handle_ack(&mut mock, 1, -libc::EINVAL)
        .await
        .unwrap();

    assert_eq!(manager.links[&2].state, LinkState::Failed);
    assert!(!manager.routes.contains_key(&route.identity()));
    // No auto-retry: nothing new on the wire.
    assert_eq!(mock.sent.len(), 1);
}

#[tokio::test]
async fn test_adopt_foreign_then_reclaim_on_delete() {
    let mut manager = manager_with_link();
    let route = declared_v4_route();

    manager.handle_notification(RtnlMessage::NewRoute(route.to_message()));
    let adopted = &manager.routes[&route.identity()];
    assert_eq!(adopted.source, ConfigSource::Foreign);
    assert!(adopted.kernel_present);

    manager.handle_notification(RtnlMessage::DelRoute(route.to_message()));
    assert!(!manager.routes.contains_key(&route.identity()));
}

#[tokio::test]
async fn test_foreign_management_disabled_drops_notification() {
    let mut manager = Manager::new(false, false);
    manager.add_link(ready_link(2, "eth0"));
    let route = declared_v4_route();

    manager.handle_notification(RtnlMessage::NewRoute(route.to_message()));
    assert!(manager.routes.is_empty());
}

#[tokio::test]
async fn test_gc_respects_the_other_links_declaration() {
    let mut manager = manager_with_link();
    manager.add_link(ready_link(3, "eth1"));
    let mut mock = MockSender::default();
    let route = declared_v4_route();

    // Both links declare the structurally identical route.
    declare_in_network(&mut manager, 2, 1, &route);
    declare_in_network(&mut manager, 3, 1, &route);

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    manager.handle_ack(&mut mock, 1, 0).await.unwrap();
    assert_eq!(mock.sent.len(), 1);

    // One link withdraws; the route must survive the sweep.
    let section = ConfigSection::new("eth0.network", 1);
    manager
        .links
        .get_mut(&2)
        .unwrap()
        .network
        .as_mut()
        .unwrap()
        .remove_route_declaration(&section);
    manager.garbage_collect(&mut mock).await.unwrap();
    assert!(manager.routes.contains_key(&route.identity()));
    assert_eq!(mock.sent.len(), 1, "no removal while still declared");

    // The second link withdraws too; now the sweep removes it.
    let section = ConfigSection::new("eth1.network", 1);
    manager
        .links
        .get_mut(&3)
        .unwrap()
        .network
        .as_mut()
        .unwrap()
        .remove_route_declaration(&section);
    manager.garbage_collect(&mut mock).await.unwrap();
    assert_eq!(mock.sent.len(), 2);
    assert!(matches!(mock.sent[1].0, RtnlMessage::DelRoute(_)));

    manager.handle_ack(&mut mock, 2, 0).await.unwrap();
    assert!(!manager.routes.contains_key(&route.identity()));
}

#[tokio::test(start_paused = true)]
async fn test_expiration_fires_removal() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();
    let mut route = declared_v4_route();
    route.lifetime = Some(Duration::from_secs(10));

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    manager.handle_ack(&mut mock, 1, 0).await.unwrap();

    tokio::time::advance(Duration::from_secs(11)).await;
    manager
        .handle_expirations(&mut mock, Instant::now())
        .await
        .unwrap();
    assert_eq!(mock.sent.len(), 2);
    assert!(matches!(mock.sent[1].0, RtnlMessage::DelRoute(_)));
}

#[tokio::test(start_paused = true)]
async fn test_expiration_handoff_disables_local_timer() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();
    let mut route = declared_v4_route();
    route.lifetime = Some(Duration::from_secs(10));

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    manager.handle_ack(&mut mock, 1, 0).await.unwrap();

    // A later notification reports kernel-side expiry management.
    let mut msg = route.to_message();
    msg.attributes.push(RouteAttribute::CacheInfo(RouteCacheInfo {
        expires: 1000,
        ..Default::default()
    }));
    manager.handle_notification(RtnlMessage::NewRoute(msg));

    // The armed timer fires into a no-op.
    tokio::time::advance(Duration::from_secs(11)).await;
    manager
        .handle_expirations(&mut mock, Instant::now())
        .await
        .unwrap();
    assert_eq!(mock.sent.len(), 1, "no removal: kernel owns the expiry");
    assert!(manager.routes.contains_key(&route.identity()));
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_is_local_not_fatal() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();
    let route = declared_v4_route();

    manager.request_route(&mut mock, 2, &route).await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    manager.handle_timeouts(Instant::now());

    assert!(manager.queue.is_empty());
    assert_ne!(manager.links[&2].state, LinkState::Failed);
    assert!(manager.links[&2].routes_configured);
    // A late reply for the timed-out request is ignored quietly.
    manager.handle_ack(&mut mock, 1, 0).await.unwrap();
}

#[tokio::test]
async fn test_remove_and_cancel_compensates_in_flight_request() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();
    let route = declared_v4_route();

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    // Withdrawal while the request is on the wire: nothing can be
    // recalled yet.
    manager
        .remove_and_cancel_route(&mut mock, &route)
        .await
        .unwrap();
    assert_eq!(mock.sent.len(), 1);

    // The reply lands; the compensating removal goes out.
    manager.handle_ack(&mut mock, 1, 0).await.unwrap();
    assert_eq!(mock.sent.len(), 2);
    assert!(matches!(mock.sent[1].0, RtnlMessage::DelRoute(_)));
}

#[tokio::test]
async fn test_zero_lifetime_route_is_refused() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();
    let mut route = declared_v4_route();
    route.lifetime = Some(Duration::ZERO);

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    assert!(mock.sent.is_empty());
    assert!(manager.routes.is_empty());
}

#[tokio::test]
async fn test_converged_route_skips_requeue() {
    let mut manager = manager_with_link();
    let mut mock = MockSender::default();
    let route = declared_v4_route();

    manager.request_route(&mut mock, 2, &route).await.unwrap();
    manager.handle_ack(&mut mock, 1, 0).await.unwrap();
    assert_eq!(mock.sent.len(), 1);

    // Identical declaration, already converged: no kernel churn.
    manager.request_route(&mut mock, 2, &route).await.unwrap();
    assert_eq!(mock.sent.len(), 1);

    // A changed lifetime is a real delta and goes back out.
    let mut refreshed = route.clone();
    refreshed.lifetime = Some(Duration::from_secs(600));
    manager.request_route(&mut mock, 2, &refreshed).await.unwrap();
    assert_eq!(mock.sent.len(), 2);
}

#[tokio::test]
async fn test_link_not_ready_is_rejected() {
    let mut manager = Manager::new(true, true);
    let mut link = Link::new(2, "eth0");
    link.state = LinkState::Pending;
    manager.add_link(link);
    let mut mock = MockSender::default();

    let result = manager.request_route(&mut mock, 2, &declared_v4_route()).await;
    assert!(result.is_err());
    assert!(mock.sent.is_empty());
}
