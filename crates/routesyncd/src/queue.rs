//! Request queue: pending configuration intents keyed by identity.
//!
//! The queue enforces the at-most-one-in-flight-per-identity
//! guarantee: a second intent for the same (operation, identity) key
//! merges into the existing request instead of producing a second
//! wire message. Each request owns an immutable object snapshot taken
//! at enqueue time and an absolute deadline on the monotonic clock,
//! after which it completes as a local timeout instead of lingering
//! forever.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

use crate::route::{Route, RouteIdentity};
use crate::rule::{RoutingPolicyRule, RuleIdentity};

/// How long a sent request may wait for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOp {
    Add,
    Remove,
}

/// Dedup key: one request may be in flight per (kind, op, identity).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    Route(RequestOp, RouteIdentity),
    Rule(RequestOp, RuleIdentity),
}

#[derive(Debug, Clone)]
pub enum RequestObject {
    Route(Route),
    Rule(RoutingPolicyRule),
}

/// One queued intent. Ephemeral: destroyed when the correlated reply
/// arrives, the deadline passes, or the request is canceled.
#[derive(Debug)]
pub struct Request {
    pub op: RequestOp,
    /// Enqueue-time snapshot, independent of the caller's copy.
    pub object: RequestObject,
    pub link_index: Option<u32>,
    pub sent_seq: Option<u32>,
    pub deadline: Instant,
    /// Set for expiry-initiated removals: an unexpected failure here
    /// means kernel state diverged from belief and the link fails.
    pub escalate_on_failure: bool,
    /// Set when a sent request was canceled: the reply, whatever it
    /// is, must be answered with the compensating opposite operation.
    pub compensate: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// A request with the same key is already pending; no second wire
    /// message will be produced.
    Merged,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Queued but never sent; dropped outright.
    Dropped,
    /// Already on the wire; flagged for compensation once the reply
    /// lands.
    Compensating,
    NotFound,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: HashMap<RequestKey, Request>,
    by_seq: HashMap<u32, RequestKey>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an intent, or merges it into an identical pending one.
    pub fn insert(
        &mut self,
        key: RequestKey,
        object: RequestObject,
        link_index: Option<u32>,
        escalate_on_failure: bool,
    ) -> EnqueueOutcome {
        if self.requests.contains_key(&key) {
            return EnqueueOutcome::Merged;
        }
        let op = match &key {
            RequestKey::Route(op, _) | RequestKey::Rule(op, _) => *op,
        };
        self.requests.insert(
            key,
            Request {
                op,
                object,
                link_index,
                sent_seq: None,
                deadline: Instant::now() + DEFAULT_REQUEST_TIMEOUT,
                escalate_on_failure,
                compensate: false,
            },
        );
        EnqueueOutcome::Inserted
    }

    /// Records the correlation number once the message is written.
    pub fn mark_sent(&mut self, key: &RequestKey, seq: u32) {
        if let Some(request) = self.requests.get_mut(key) {
            request.sent_seq = Some(seq);
            self.by_seq.insert(seq, key.clone());
        }
    }

    /// Completes the request correlated with `seq`, removing it.
    pub fn complete(&mut self, seq: u32) -> Option<(RequestKey, Request)> {
        let key = self.by_seq.remove(&seq)?;
        let request = self.requests.remove(&key)?;
        Some((key, request))
    }

    /// Cancels a pending request. A sent request cannot be recalled
    /// mid-flight; it is flagged so its reply triggers a compensating
    /// opposite operation instead.
    pub fn cancel(&mut self, key: &RequestKey) -> CancelOutcome {
        match self.requests.get_mut(key) {
            None => CancelOutcome::NotFound,
            Some(request) if request.sent_seq.is_none() => {
                self.requests.remove(key);
                CancelOutcome::Dropped
            }
            Some(request) => {
                request.compensate = true;
                CancelOutcome::Compensating
            }
        }
    }

    pub fn get(&self, key: &RequestKey) -> Option<&Request> {
        self.requests.get(key)
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.requests.contains_key(key)
    }

    /// Whether any request (add or remove) is outstanding for a route
    /// identity. Reconciliation uses this to tell "reply to us" from
    /// "foreign activity".
    pub fn route_request_outstanding(&self, identity: &RouteIdentity) -> Option<&Request> {
        self.requests
            .get(&RequestKey::Route(RequestOp::Add, identity.clone()))
            .or_else(|| {
                self.requests
                    .get(&RequestKey::Route(RequestOp::Remove, identity.clone()))
            })
    }

    pub fn rule_request_outstanding(&self, identity: &RuleIdentity) -> Option<&Request> {
        self.requests
            .get(&RequestKey::Rule(RequestOp::Add, identity.clone()))
            .or_else(|| {
                self.requests
                    .get(&RequestKey::Rule(RequestOp::Remove, identity.clone()))
            })
    }

    /// Earliest deadline among sent requests, for the event loop's
    /// timer arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.requests
            .values()
            .filter(|r| r.sent_seq.is_some())
            .map(|r| r.deadline)
            .min()
    }

    /// Removes and returns every sent request whose deadline passed.
    pub fn take_overdue(&mut self, now: Instant) -> Vec<(RequestKey, Request)> {
        let overdue: Vec<RequestKey> = self
            .requests
            .iter()
            .filter(|(_, r)| r.sent_seq.is_some() && r.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        overdue
            .into_iter()
            .filter_map(|key| {
                let request = self.requests.remove(&key)?;
                if let Some(seq) = request.sent_seq {
                    self.by_seq.remove(&seq);
                }
                Some((key, request))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::nexthop::RouteNextHop;
    use routesync_rtnl::message::AF_INET;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_route() -> Route {
        Route {
            family: AF_INET,
            dst: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0))),
            dst_prefixlen: 24,
            nexthops: vec![RouteNextHop {
                gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
                ifindex: 2,
                weight: 1,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn add_key(route: &Route) -> RequestKey {
        RequestKey::Route(RequestOp::Add, route.identity())
    }

    #[test]
    fn test_duplicate_intent_merges() {
        let mut queue = RequestQueue::new();
        let route = sample_route();
        let outcome = queue.insert(
            add_key(&route),
            RequestObject::Route(route.clone()),
            Some(2),
            false,
        );
        assert_eq!(outcome, EnqueueOutcome::Inserted);
        let outcome = queue.insert(
            add_key(&route),
            RequestObject::Route(route.clone()),
            Some(2),
            false,
        );
        assert_eq!(outcome, EnqueueOutcome::Merged);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_add_and_remove_are_distinct_keys() {
        let mut queue = RequestQueue::new();
        let route = sample_route();
        queue.insert(
            add_key(&route),
            RequestObject::Route(route.clone()),
            None,
            false,
        );
        let outcome = queue.insert(
            RequestKey::Route(RequestOp::Remove, route.identity()),
            RequestObject::Route(route.clone()),
            None,
            false,
        );
        assert_eq!(outcome, EnqueueOutcome::Inserted);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_cancel_unsent_drops_sent_compensates() {
        let mut queue = RequestQueue::new();
        let route = sample_route();
        let key = add_key(&route);
        queue.insert(key.clone(), RequestObject::Route(route.clone()), None, false);
        assert_eq!(queue.cancel(&key), CancelOutcome::Dropped);
        assert!(queue.is_empty());

        queue.insert(key.clone(), RequestObject::Route(route), None, false);
        queue.mark_sent(&key, 42);
        assert_eq!(queue.cancel(&key), CancelOutcome::Compensating);
        let (_, request) = queue.complete(42).expect("request still correlated");
        assert!(request.compensate);
    }

    #[test]
    fn test_complete_by_correlation_number() {
        let mut queue = RequestQueue::new();
        let route = sample_route();
        let key = add_key(&route);
        queue.insert(key.clone(), RequestObject::Route(route), Some(2), false);
        queue.mark_sent(&key, 7);
        let (completed_key, request) = queue.complete(7).unwrap();
        assert_eq!(completed_key, key);
        assert_eq!(request.link_index, Some(2));
        assert!(queue.complete(7).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_requests_are_taken() {
        let mut queue = RequestQueue::new();
        let route = sample_route();
        let key = add_key(&route);
        queue.insert(key.clone(), RequestObject::Route(route), None, false);
        queue.mark_sent(&key, 1);
        assert!(queue.take_overdue(Instant::now()).is_empty());

        tokio::time::advance(DEFAULT_REQUEST_TIMEOUT + Duration::from_secs(1)).await;
        let overdue = queue.take_overdue(Instant::now());
        assert_eq!(overdue.len(), 1);
        assert!(queue.is_empty());
    }
}
