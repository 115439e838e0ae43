//! Kernel routing-state reconciliation daemon.
//!
//! routesyncd keeps the kernel's unicast routes and routing-policy
//! rules synchronized with a declared configuration, using rtnetlink
//! as the only channel of truth. Declared objects enter the per-link
//! [`network`] maps, the [`queue`] turns unconverged objects into wire
//! requests, kernel replies and broadcasts drive the per-object state
//! machine, and [`reconcile`] adopts or garbage-collects objects the
//! daemon did not create.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | rtnetlink configuration requires CAP_NET_ADMIN |
//! | AU-3 | Content of Audit Records | Structured logging with route details |
//! | CM-6 | Configuration Settings | CLI-configurable object ceilings |
//! | CM-8 | System Component Inventory | Manager-wide route/rule stores |
//! | SC-7 | Boundary Protection | Kernel routing table ownership tracking |
//! | SI-4 | System Monitoring | Real-time rtnetlink event processing |
//! | SI-10 | Input Validation | Strict attribute-length validation in the codec |
//! | SI-11 | Error Handling | Structured error taxonomy |
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────────────┐
//! │  Linux Kernel   │     │          routesyncd          │
//! │                 │     │                              │
//! │  Routing tables │────▶│  RtnlTransport ─▶ Manager    │
//! │  Policy rules   │     │                    │  ▲      │
//! │                 │     │        RequestQueue│  │      │
//! │  RTM_NEWROUTE   │◀────│        Reconcile/GC│  │      │
//! │  RTM_DELROUTE   │     │        Expirations ▼  │      │
//! │  RTM_NEWRULE    │     │   Links ─ declared Networks  │
//! │  RTM_DELRULE    │     │                              │
//! └─────────────────┘     └──────────────────────────────┘
//! ```

pub mod error;
pub mod expire;
pub mod link;
pub mod manager;
pub mod network;
pub mod queue;
pub mod reconcile;
pub mod route;
pub mod rule;
pub mod types;

pub use error::{Result, RouteSyncError};
pub use expire::ExpirationQueue;
pub use link::{Link, LinkState};
pub use manager::Manager;
pub use network::Network;
pub use queue::{Request, RequestKey, RequestOp, RequestQueue};
pub use route::nexthop::RouteNextHop;
pub use route::{Route, RouteIdentity};
pub use rule::{RoutingPolicyRule, RuleIdentity};
pub use types::{ConfigSection, ConfigSource, ConfigState};
