//! Expiration coordinator.
//!
//! Routes with a finite declared lifetime get a local timer armed at
//! configure time. The heap holds (deadline, identity) pairs only;
//! firing re-resolves the identity through the manager's store, so a
//! route removed in the meantime is observed as "no longer resolves"
//! rather than acted on. A re-armed route leaves its older heap entry
//! behind; the store's `valid_until` field is the staleness check that
//! makes such an entry a no-op.
//!
//! Once a kernel cache-expiry attribute is observed for a route the
//! kernel enforces the lifetime itself, and the local timer for that
//! route is permanently disabled (two timers racing would
//! double-delete).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::Instant;

use crate::route::RouteIdentity;

#[derive(Debug, Default)]
pub struct ExpirationQueue {
    heap: BinaryHeap<Reverse<(Instant, RouteIdentity)>>,
}

impl ExpirationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) a timer. The caller records the same deadline
    /// in the route's `valid_until` so stale entries can be told apart.
    pub fn arm(&mut self, identity: RouteIdentity, deadline: Instant) {
        self.heap.push(Reverse((deadline, identity)));
    }

    /// Earliest pending deadline, for the event loop's timer arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((when, _))| *when)
    }

    /// Pops every entry due at `now`. Each returned pair must be
    /// validated against the stored route before acting on it.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(Instant, RouteIdentity)> {
        let mut due = Vec::new();
        while let Some(Reverse((when, _))) = self.heap.peek() {
            if *when > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            due.push(entry);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_pops_in_deadline_order() {
        let mut queue = ExpirationQueue::new();
        let now = Instant::now();
        queue.arm(RouteIdentity::Unspec, now + Duration::from_secs(20));
        queue.arm(RouteIdentity::Unspec, now + Duration::from_secs(10));
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(15)).await;
        let due = queue.pop_due(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, now + Duration::from_secs(10));
        assert!(!queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_leaves_stale_entry_behind() {
        let mut queue = ExpirationQueue::new();
        let now = Instant::now();
        queue.arm(RouteIdentity::Unspec, now + Duration::from_secs(10));
        queue.arm(RouteIdentity::Unspec, now + Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(11)).await;
        // The stale first entry fires; the caller detects staleness by
        // comparing the deadline against the route's valid_until.
        let due = queue.pop_due(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(60)));
    }
}
