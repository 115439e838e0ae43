//! rtnetlink codec and transport for routesyncd.
//!
//! This crate owns everything that touches raw rtnetlink bytes:
//!
//! - [`message`]: the typed route/rule message codec (header + nested
//!   attribute tree). Framing only; no reconciliation logic.
//! - [`socket`]: the `NETLINK_ROUTE` socket, bound to the route/rule
//!   broadcast groups, with tokio `AsyncFd` integration.
//! - [`transport`]: correlation-number assignment, ack/notification
//!   demultiplexing and multi-part dump reassembly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   datagrams   ┌───────────────┐   RtnlEvent   ┌────────────┐
//! │ Linux kernel │──────────────▶│ RtnlTransport │──────────────▶│ routesyncd │
//! │ (rtnetlink)  │◀──────────────│  (seq demux)  │◀──────────────│  manager   │
//! └──────────────┘   RtnlMessage └───────────────┘  send_request └────────────┘
//! ```
//!
//! The transport never interprets replies beyond classifying them; the
//! reconciliation engine owns all object state.

pub mod message;
pub mod route;
pub mod rule;
pub mod socket;
pub mod transport;

mod error;

pub use error::{Result, RtnlError};
pub use message::RtnlMessage;
pub use route::{
    RouteAttribute, RouteCacheInfo, RouteHeader, RouteMessage, RouteMetric, RouteNextHopEntry,
};
pub use rule::{RuleAttribute, RuleHeader, RuleMessage};
pub use socket::AsyncRtnlSocket;
pub use transport::{RtnlEvent, RtnlSender, RtnlTransport};
