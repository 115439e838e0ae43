//! The reconciliation engine's single owner of mutable state.
//!
//! One task owns the manager; every mutation of the object stores,
//! the request queue, the links and the expiration heap happens from
//! its event loop. Kernel replies are delivered as owned, decoded
//! values and handlers re-resolve objects through the stores by
//! identity, so a removal elsewhere is observed as "no longer
//! resolves", never as acting on stale state.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Manager-wide route/rule stores
//! - SI-4: System Monitoring - Event loop over kernel notifications
//! - SI-11: Error Handling - Reply taxonomy (transient vs fatal-to-link)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use routesync_rtnl::transport::{NLM_F_CREATE, NLM_F_DUMP};
use routesync_rtnl::{RtnlEvent, RtnlMessage, RtnlSender, RtnlTransport, RuleMessage};

use crate::error::{Result, RouteSyncError};
use crate::expire::ExpirationQueue;
use crate::link::Link;
use crate::queue::{
    CancelOutcome, EnqueueOutcome, RequestKey, RequestObject, RequestOp, RequestQueue,
};
use crate::route::{Route, RouteIdentity};
use crate::rule::{RoutingPolicyRule, RuleIdentity};
use crate::types::ConfigState;

/// Kernel replies on delete that mean "already gone".
const ABSORBED_DELETE_ERRNOS: [i32; 3] = [libc::ESRCH, libc::ENOENT, libc::ENODEV];

/// Timer arm used when nothing is pending, so the loop still wakes up.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

pub struct Manager {
    pub routes: HashMap<RouteIdentity, Route>,
    pub rules: HashMap<RuleIdentity, RoutingPolicyRule>,
    pub links: HashMap<u32, Link>,
    pub queue: RequestQueue,
    pub expirations: ExpirationQueue,
    /// Whether foreign routes/rules are adopted and garbage-collected
    /// or left alone entirely.
    pub manage_foreign_routes: bool,
    pub manage_foreign_rules: bool,
    /// Admission ceiling applied to networks attached after startup.
    pub object_ceiling: usize,
}

impl Manager {
    pub fn new(manage_foreign_routes: bool, manage_foreign_rules: bool) -> Self {
        Self {
            routes: HashMap::new(),
            rules: HashMap::new(),
            links: HashMap::new(),
            queue: RequestQueue::new(),
            expirations: ExpirationQueue::new(),
            manage_foreign_routes,
            manage_foreign_rules,
            object_ceiling: crate::network::DEFAULT_OBJECT_CEILING,
        }
    }

    pub fn add_link(&mut self, link: Link) {
        self.links.insert(link.index, link);
    }

    /// Binds a network profile to a link, applying the manager-wide
    /// admission ceiling.
    pub fn attach_network(&mut self, link_index: u32, mut network: crate::network::Network) -> Result<()> {
        let link = self
            .links
            .get_mut(&link_index)
            .ok_or(RouteSyncError::LinkNotFound(link_index))?;
        network.object_ceiling = self.object_ceiling;
        link.network = Some(network);
        Ok(())
    }

    /// Enqueues a declared route on behalf of `link_index`, expanding
    /// multipath declarations into independently deduplicated
    /// per-nexthop requests.
    pub async fn request_route(
        &mut self,
        sender: &mut dyn RtnlSender,
        link_index: u32,
        declared: &Route,
    ) -> Result<()> {
        {
            let link = self
                .links
                .get(&link_index)
                .ok_or(RouteSyncError::LinkNotFound(link_index))?;
            if !link.is_ready_to_configure() {
                return Err(RouteSyncError::LinkNotReady(link_index));
            }
        }

        // A lifetime that already rounds to zero seconds would ask the
        // kernel to install an expired route; refuse instead.
        if matches!(declared.lifetime, Some(d) if d.as_secs() == 0) {
            debug!(route = %declared, "refusing route with zero remaining lifetime");
            return Ok(());
        }

        for mut snapshot in declared.expand() {
            let link = self.links.get(&link_index).expect("checked above");
            if let Some(nh) = snapshot.nexthops.first_mut() {
                if !nh.adjust(link) {
                    debug!(route = %snapshot, "nexthop does not resolve through this link");
                    continue;
                }
            }

            let identity = snapshot.identity();
            if let Some(existing) = self.routes.get(&identity) {
                if existing.converged_with(&snapshot) {
                    debug!(route = %snapshot, "already converged, skipping enqueue");
                    continue;
                }
            }

            let key = RequestKey::Route(RequestOp::Add, identity.clone());
            let outcome = self.queue.insert(
                key.clone(),
                RequestObject::Route(snapshot.clone()),
                Some(link_index),
                false,
            );
            if outcome == EnqueueOutcome::Merged {
                debug!(route = %snapshot, "request already queued");
                continue;
            }

            let message = RtnlMessage::NewRoute(snapshot.to_message());
            let seq = match sender.send_request(message, NLM_F_CREATE).await {
                Ok(seq) => seq,
                Err(routesync_rtnl::RtnlError::Encode(e)) => {
                    // An encode failure aborts only this request.
                    warn!(route = %snapshot, error = %e, "failed to encode route request");
                    self.queue.cancel(&key);
                    continue;
                }
                Err(e) => {
                    self.queue.cancel(&key);
                    return Err(e.into());
                }
            };
            self.queue.mark_sent(&key, seq);

            snapshot.state = ConfigState::Configuring;
            let stored = self.routes.entry(identity).or_insert_with(|| snapshot.clone());
            stored.state = ConfigState::Configuring;
            stored.lifetime = snapshot.lifetime;
            stored.source = snapshot.source;
            stored.section = snapshot.section.clone();

            if let Some(link) = self.links.get_mut(&link_index) {
                link.route_message_sent();
            }
            debug!(route = %snapshot, seq, "route configuration requested");
        }
        Ok(())
    }

    /// Enqueues a declared rule. Rules may be link-scoped (counted on
    /// that link) or manager-wide.
    pub async fn request_rule(
        &mut self,
        sender: &mut dyn RtnlSender,
        link_index: Option<u32>,
        declared: &RoutingPolicyRule,
    ) -> Result<()> {
        if let Some(index) = link_index {
            let link = self
                .links
                .get(&index)
                .ok_or(RouteSyncError::LinkNotFound(index))?;
            if !link.is_ready_to_configure() {
                return Err(RouteSyncError::LinkNotReady(index));
            }
        }

        let identity = declared.identity();
        if let Some(existing) = self.rules.get(&identity) {
            if existing.exists() && existing.state == ConfigState::Configured {
                debug!(rule = %declared, "already converged, skipping enqueue");
                return Ok(());
            }
        }

        let key = RequestKey::Rule(RequestOp::Add, identity.clone());
        let mut snapshot = declared.clone();
        snapshot.state = ConfigState::Requesting;
        snapshot.kernel_present = false;
        snapshot.marked = false;
        let outcome = self.queue.insert(
            key.clone(),
            RequestObject::Rule(snapshot.clone()),
            link_index,
            false,
        );
        if outcome == EnqueueOutcome::Merged {
            debug!(rule = %declared, "request already queued");
            return Ok(());
        }

        let message = RtnlMessage::NewRule(snapshot.to_message());
        let seq = match sender.send_request(message, NLM_F_CREATE).await {
            Ok(seq) => seq,
            Err(routesync_rtnl::RtnlError::Encode(e)) => {
                warn!(rule = %snapshot, error = %e, "failed to encode rule request");
                self.queue.cancel(&key);
                return Ok(());
            }
            Err(e) => {
                self.queue.cancel(&key);
                return Err(e.into());
            }
        };
        self.queue.mark_sent(&key, seq);

        snapshot.state = ConfigState::Configuring;
        let stored = self.rules.entry(identity).or_insert_with(|| snapshot.clone());
        stored.state = ConfigState::Configuring;
        stored.source = snapshot.source;
        stored.section = snapshot.section.clone();

        if let Some(index) = link_index {
            if let Some(link) = self.links.get_mut(&index) {
                link.rule_message_sent();
            }
        }
        debug!(rule = %snapshot, seq, "rule configuration requested");
        Ok(())
    }

    /// Issues a removal for a stored route. `escalate` marks removals
    /// whose unexpected failure means kernel state diverged from
    /// belief (expiry enforcement).
    pub async fn remove_route(
        &mut self,
        sender: &mut dyn RtnlSender,
        identity: &RouteIdentity,
        escalate: bool,
    ) -> Result<()> {
        let snapshot = match self.routes.get_mut(identity) {
            Some(route) => {
                route.state = ConfigState::Removing;
                route.clone()
            }
            None => return Ok(()),
        };

        let key = RequestKey::Route(RequestOp::Remove, identity.clone());
        let link_index = snapshot.nexthops.first().map(|nh| nh.ifindex);
        let outcome = self.queue.insert(
            key.clone(),
            RequestObject::Route(snapshot.clone()),
            link_index,
            escalate,
        );
        if outcome == EnqueueOutcome::Merged {
            return Ok(());
        }

        let message = RtnlMessage::DelRoute(snapshot.to_message());
        let seq = match sender.send_request(message, 0).await {
            Ok(seq) => seq,
            Err(routesync_rtnl::RtnlError::Encode(e)) => {
                warn!(route = %snapshot, error = %e, "failed to encode route removal");
                self.queue.cancel(&key);
                return Ok(());
            }
            Err(e) => {
                self.queue.cancel(&key);
                return Err(e.into());
            }
        };
        self.queue.mark_sent(&key, seq);
        if let Some(index) = link_index {
            if let Some(link) = self.links.get_mut(&index) {
                link.route_message_sent();
            }
        }
        debug!(route = %snapshot, seq, "route removal requested");
        Ok(())
    }

    pub async fn remove_rule(
        &mut self,
        sender: &mut dyn RtnlSender,
        identity: &RuleIdentity,
    ) -> Result<()> {
        let snapshot = match self.rules.get_mut(identity) {
            Some(rule) => {
                rule.state = ConfigState::Removing;
                rule.clone()
            }
            None => return Ok(()),
        };

        let key = RequestKey::Rule(RequestOp::Remove, identity.clone());
        let outcome =
            self.queue
                .insert(key.clone(), RequestObject::Rule(snapshot.clone()), None, false);
        if outcome == EnqueueOutcome::Merged {
            return Ok(());
        }

        let message = RtnlMessage::DelRule(snapshot.to_message());
        let seq = match sender.send_request(message, 0).await {
            Ok(seq) => seq,
            Err(routesync_rtnl::RtnlError::Encode(e)) => {
                warn!(rule = %snapshot, error = %e, "failed to encode rule removal");
                self.queue.cancel(&key);
                return Ok(());
            }
            Err(e) => {
                self.queue.cancel(&key);
                return Err(e.into());
            }
        };
        self.queue.mark_sent(&key, seq);
        debug!(rule = %snapshot, seq, "rule removal requested");
        Ok(())
    }

    /// Withdraws a declaration: queued-but-unsent requests are dropped
    /// outright, sent requests are flagged for a compensating removal
    /// once their reply lands, and anything already in the kernel gets
    /// a removal request.
    pub async fn remove_and_cancel_route(
        &mut self,
        sender: &mut dyn RtnlSender,
        declared: &Route,
    ) -> Result<()> {
        for snapshot in declared.expand() {
            let identity = snapshot.identity();
            let key = RequestKey::Route(RequestOp::Add, identity.clone());
            match self.queue.cancel(&key) {
                CancelOutcome::Dropped => {
                    // Never reached the kernel; forget the intent.
                    if let Some(route) = self.routes.get(&identity) {
                        if !route.kernel_present {
                            self.routes.remove(&identity);
                        }
                    }
                    continue;
                }
                CancelOutcome::Compensating => {
                    debug!(route = %snapshot, "in-flight request flagged for compensation");
                    continue;
                }
                CancelOutcome::NotFound => {}
            }
            let present = self.routes.get(&identity).is_some_and(Route::exists);
            if present {
                self.remove_route(sender, &identity, false).await?;
            }
        }
        Ok(())
    }

    /// Classifies one kernel reply and advances the object it answers.
    pub async fn handle_ack(
        &mut self,
        sender: &mut dyn RtnlSender,
        seq: u32,
        code: i32,
    ) -> Result<()> {
        let Some((key, request)) = self.queue.complete(seq) else {
            debug!(seq, code, "reply without a pending request");
            return Ok(());
        };

        // Account the completion on the owning link first; signals
        // fire even when the reply is an error.
        if let Some(index) = request.link_index {
            if let Some(link) = self.links.get_mut(&index) {
                match &key {
                    RequestKey::Route(..) => {
                        link.route_message_done();
                    }
                    RequestKey::Rule(..) => {
                        link.rule_message_done();
                    }
                }
            }
        }

        match key {
            RequestKey::Route(RequestOp::Add, identity) => {
                self.finish_route_add(sender, identity, request, code).await
            }
            RequestKey::Route(RequestOp::Remove, identity) => {
                self.finish_route_remove(identity, request, code)
            }
            RequestKey::Rule(RequestOp::Add, identity) => {
                self.finish_rule_add(sender, identity, request, code).await
            }
            RequestKey::Rule(RequestOp::Remove, identity) => {
                self.finish_rule_remove(identity, request, code)
            }
        }
    }

    async fn finish_route_add(
        &mut self,
        sender: &mut dyn RtnlSender,
        identity: RouteIdentity,
        request: crate::queue::Request,
        code: i32,
    ) -> Result<()> {
        let success = code == 0 || code == -libc::EEXIST;

        if request.compensate {
            // The declaration was withdrawn while the request was on
            // the wire; reverse its effect now that the reply landed.
            if success {
                self.remove_route(sender, &identity, false).await?;
            } else if let Some(route) = self.routes.get(&identity) {
                if !route.kernel_present {
                    self.routes.remove(&identity);
                }
            }
            return Ok(());
        }

        if success {
            if code == -libc::EEXIST {
                debug!("route already exists in the kernel, treating as configured");
            }
            if let Some(route) = self.routes.get_mut(&identity) {
                route.state = ConfigState::Configured;
                route.kernel_present = true;
                // EEXIST means the kernel sends no notification for
                // this request, so the lifetime refresh happens here.
                if let Some(lifetime) = route.lifetime {
                    if !route.kernel_managed_expiry {
                        let deadline = Instant::now() + lifetime;
                        route.valid_until = Some(deadline);
                        self.expirations.arm(identity, deadline);
                    }
                }
            }
            return Ok(());
        }

        warn!(errno = -code, "kernel rejected route configuration");
        if let Some(route) = self.routes.get(&identity) {
            if !route.kernel_present {
                self.routes.remove(&identity);
            }
        }
        if let Some(index) = request.link_index {
            if let Some(link) = self.links.get_mut(&index) {
                link.enter_failed();
            }
        }
        Ok(())
    }

    fn finish_route_remove(
        &mut self,
        identity: RouteIdentity,
        request: crate::queue::Request,
        code: i32,
    ) -> Result<()> {
        let absorbed = code == 0 || ABSORBED_DELETE_ERRNOS.contains(&-code);
        if absorbed {
            if code != 0 {
                debug!(errno = -code, "route already gone, removal absorbed");
            }
            if let Some(mut route) = self.routes.remove(&identity) {
                route.state = ConfigState::Removed;
            }
            return Ok(());
        }

        warn!(errno = -code, "kernel rejected route removal");
        if request.escalate_on_failure {
            // Expiry enforcement failed in a way we cannot reconcile.
            if let Some(index) = request.link_index {
                if let Some(link) = self.links.get_mut(&index) {
                    link.enter_failed();
                }
            }
        }
        Ok(())
    }

    async fn finish_rule_add(
        &mut self,
        sender: &mut dyn RtnlSender,
        identity: RuleIdentity,
        request: crate::queue::Request,
        code: i32,
    ) -> Result<()> {
        let success = code == 0 || code == -libc::EEXIST;

        if request.compensate {
            if success {
                self.remove_rule(sender, &identity).await?;
            }
            return Ok(());
        }

        if success {
            if let Some(rule) = self.rules.get_mut(&identity) {
                rule.state = ConfigState::Configured;
                rule.kernel_present = true;
            }
            return Ok(());
        }

        warn!(errno = -code, "kernel rejected rule configuration");
        if let Some(rule) = self.rules.get(&identity) {
            if !rule.kernel_present {
                self.rules.remove(&identity);
            }
        }
        if let Some(index) = request.link_index {
            if let Some(link) = self.links.get_mut(&index) {
                link.enter_failed();
            }
        }
        Ok(())
    }

    fn finish_rule_remove(
        &mut self,
        identity: RuleIdentity,
        _request: crate::queue::Request,
        code: i32,
    ) -> Result<()> {
        let absorbed = code == 0 || ABSORBED_DELETE_ERRNOS.contains(&-code);
        if absorbed {
            self.rules.remove(&identity);
        } else {
            warn!(errno = -code, "kernel rejected rule removal");
        }
        Ok(())
    }

    /// Completes every sent request whose deadline passed as a local
    /// timeout. Distinct from a kernel rejection: the link does not
    /// fail, and the caller may re-request.
    pub fn handle_timeouts(&mut self, now: Instant) {
        for (key, request) in self.queue.take_overdue(now) {
            warn!(?key, "request timed out waiting for kernel reply");
            if let Some(index) = request.link_index {
                if let Some(link) = self.links.get_mut(&index) {
                    match &key {
                        RequestKey::Route(..) => {
                            link.route_message_done();
                        }
                        RequestKey::Rule(..) => {
                            link.rule_message_done();
                        }
                    }
                }
            }
            match key {
                RequestKey::Route(RequestOp::Add, identity) => {
                    if let Some(route) = self.routes.get(&identity) {
                        if !route.kernel_present {
                            self.routes.remove(&identity);
                        }
                    }
                }
                RequestKey::Rule(RequestOp::Add, identity) => {
                    if let Some(rule) = self.rules.get(&identity) {
                        if !rule.kernel_present {
                            self.rules.remove(&identity);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Fires due expiration timers. Each entry is validated against
    /// the stored route: a route that no longer resolves, was re-armed
    /// since, or whose expiry the kernel took over is a no-op.
    pub async fn handle_expirations(
        &mut self,
        sender: &mut dyn RtnlSender,
        now: Instant,
    ) -> Result<()> {
        for (deadline, identity) in self.expirations.pop_due(now) {
            let Some(route) = self.routes.get(&identity) else {
                continue;
            };
            if route.kernel_managed_expiry {
                continue;
            }
            if route.valid_until != Some(deadline) {
                // Stale heap entry from an earlier arming.
                continue;
            }
            info!(route = %route, "declared lifetime expired, removing");
            self.remove_route(sender, &identity, true).await?;
        }
        Ok(())
    }

    /// Requests full route and rule dumps, used at startup to seed the
    /// stores before any reconfiguration happens.
    pub async fn request_dumps(&mut self, sender: &mut dyn RtnlSender) -> Result<()> {
        sender
            .send_request(
                RtnlMessage::GetRoute(Route::default().to_message()),
                NLM_F_DUMP,
            )
            .await?;
        sender
            .send_request(
                RtnlMessage::GetRule(RuleMessage::default()),
                NLM_F_DUMP,
            )
            .await?;
        Ok(())
    }

    fn next_deadline(&self) -> Instant {
        let queue = self.queue.next_deadline();
        let expiry = self.expirations.next_deadline();
        match (queue, expiry) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => Instant::now() + IDLE_WAKEUP,
        }
    }

    /// Dispatches one batch of classified transport events.
    pub async fn dispatch_events(
        &mut self,
        sender: &mut dyn RtnlSender,
        events: Vec<RtnlEvent>,
    ) -> Result<()> {
        for event in events {
            match event {
                RtnlEvent::Ack { seq, code } => self.handle_ack(sender, seq, code).await?,
                RtnlEvent::Notification(message) => self.handle_notification(message),
                RtnlEvent::DumpComplete { seq } => {
                    debug!(seq, "dump complete");
                }
            }
        }
        Ok(())
    }

    /// Routes one unsolicited broadcast (or dump entry) to the
    /// reconciliation path by message type.
    pub fn handle_notification(&mut self, message: RtnlMessage) {
        match message {
            RtnlMessage::NewRoute(msg) => self.process_route_message(true, &msg),
            RtnlMessage::DelRoute(msg) => self.process_route_message(false, &msg),
            RtnlMessage::NewRule(msg) => self.process_rule_message(true, &msg),
            RtnlMessage::DelRule(msg) => self.process_rule_message(false, &msg),
            RtnlMessage::GetRoute(_) | RtnlMessage::GetRule(_) => {
                debug!("ignoring echoed dump request");
            }
        }
    }

    /// Main event loop: transport events, the earliest pending
    /// deadline, and shutdown.
    pub async fn run(
        &mut self,
        transport: &mut RtnlTransport,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        info!("reconciliation engine running");
        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, leaving event loop");
                return Ok(());
            }

            let deadline = self.next_deadline();
            tokio::select! {
                events = transport.recv_events() => {
                    match events {
                        Ok(events) => self.dispatch_events(transport, events).await?,
                        Err(e) => {
                            // Socket hiccups never crash the daemon.
                            warn!(error = %e, "transport receive error");
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    let now = Instant::now();
                    self.handle_timeouts(now);
                    self.handle_expirations(transport, now).await?;
                }
            }
        }
    }
}
