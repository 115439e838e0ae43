//! Link-state surface.
//!
//! The engine only needs a narrow view of a link: whether it is ready
//! to accept configuration, how many of its requests are still
//! outstanding, and the "routes configured" / "entering failed"
//! signals raised back to whoever drives link lifecycle.

use tracing::{debug, warn};

use crate::network::Network;

/// Link lifecycle, reduced to what gates route configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Seen, not yet being configured.
    Pending,
    Configuring,
    Configured,
    /// A kernel rejection landed; operator intervention required.
    Failed,
    /// Present but not managed by this daemon.
    Unmanaged,
}

/// One managed link and its outstanding-request bookkeeping.
#[derive(Debug)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub state: LinkState,
    pub network: Option<Network>,
    /// Outstanding route requests; the "routes configured" signal
    /// fires when this returns to zero.
    route_messages: u32,
    rule_messages: u32,
    pub routes_configured: bool,
    pub rules_configured: bool,
}

impl Link {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            state: LinkState::Pending,
            network: None,
            route_messages: 0,
            rule_messages: 0,
            routes_configured: false,
            rules_configured: false,
        }
    }

    /// Gate checked before any enqueue on behalf of this link.
    pub fn is_ready_to_configure(&self) -> bool {
        matches!(self.state, LinkState::Configuring | LinkState::Configured)
            && self.network.is_some()
    }

    pub fn route_message_sent(&mut self) {
        self.route_messages += 1;
        self.routes_configured = false;
    }

    pub fn rule_message_sent(&mut self) {
        self.rule_messages += 1;
        self.rules_configured = false;
    }

    /// Accounts one completed route request. Returns true exactly when
    /// the counter reaches zero and the completion signal fires.
    pub fn route_message_done(&mut self) -> bool {
        self.route_messages = self.route_messages.saturating_sub(1);
        if self.route_messages == 0 && !self.routes_configured {
            self.routes_configured = true;
            debug!(link = %self.name, "all routes configured");
            return true;
        }
        false
    }

    pub fn rule_message_done(&mut self) -> bool {
        self.rule_messages = self.rule_messages.saturating_sub(1);
        if self.rule_messages == 0 && !self.rules_configured {
            self.rules_configured = true;
            debug!(link = %self.name, "all rules configured");
            return true;
        }
        false
    }

    pub fn outstanding_route_messages(&self) -> u32 {
        self.route_messages
    }

    /// A kernel rejection is fatal to the link; deliberately not
    /// auto-retried, since blind retry against a rejecting kernel is
    /// indistinguishable from a livelock.
    pub fn enter_failed(&mut self) {
        if self.state != LinkState::Failed {
            warn!(link = %self.name, "link entering failed state");
            self.state = LinkState::Failed;
        }
    }
}
