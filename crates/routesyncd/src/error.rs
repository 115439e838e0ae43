//! Error types for routesyncd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors include sufficient detail for audit

use thiserror::Error;

/// Errors that can occur in routesyncd
///
/// The taxonomy matters more than the messages: transient kernel
/// replies (EEXIST on create, ESRCH on delete) are absorbed before an
/// error is ever constructed, so every variant here is something the
/// caller must actually react to.
///
/// # NIST Controls
/// - SI-11(a): Generate error messages providing information necessary for corrective actions
/// - SI-11(b): Reveal only information necessary for error handling
#[derive(Debug, Error)]
pub enum RouteSyncError {
    /// Netlink codec or socket error
    /// NIST: SC-7 (Boundary Protection) - Kernel interface errors
    #[error("Netlink error: {0}")]
    Netlink(#[from] routesync_rtnl::RtnlError),

    /// The kernel rejected a configuration request. Fatal to the
    /// owning link; never auto-retried.
    /// NIST: SI-4 (System Monitoring) - Kernel state divergence
    #[error("Kernel rejected request with errno {errno}")]
    KernelRejected { errno: i32 },

    /// Declared-object admission ceiling exceeded
    /// NIST: SC-5 (DoS Protection) - Bounded resource consumption
    #[error("Too many {kind} objects declared: limit is {limit}")]
    TooManyObjects { kind: &'static str, limit: usize },

    /// Link not ready to accept configuration
    /// NIST: CM-8 (System Component Inventory) - Link readiness gate
    #[error("Link {0} is not ready to be configured")]
    LinkNotReady(u32),

    /// Link lookup failed
    #[error("Link not found: index {0}")]
    LinkNotFound(u32),

    /// No reply from the kernel within the per-request deadline
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Object validation failed at admission time
    /// NIST: SI-10 (Information Input Validation)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    /// NIST: SI-11 (Error Handling) - System-level errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for routesyncd operations
pub type Result<T> = std::result::Result<T, RouteSyncError>;
