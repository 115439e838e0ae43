//! Per-route metric table.
//!
//! The kernel's metric table is sparse and order-independent: an
//! absent metric means "unset", and a metric explicitly set to zero is
//! indistinguishable from an absent one. The vector is kept trimmed so
//! that two logically equal tables are structurally equal, which lets
//! derived `Hash`/`Eq` stay consistent with the identity comparator.

use routesync_rtnl::route::{RTAX_CC_ALGO, RTAX_MAX};
use routesync_rtnl::RouteMetric;
use serde::{Deserialize, Serialize};

/// Sparse RTAX_* metric table plus the congestion-control algorithm
/// string, which the kernel carries in the same attribute range.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RouteMetrics {
    /// Indexed by RTAX_* kind; trailing zeros are trimmed.
    values: Vec<u32>,
    pub tcp_congestion_control_algo: Option<String>,
}

impl RouteMetrics {
    /// Sets (or, with value 0, clears) a numeric metric. Clearing
    /// removes the attribute from the next encoded message entirely.
    pub fn set(&mut self, kind: u16, value: u32) {
        if kind == 0 || kind > RTAX_MAX || kind == RTAX_CC_ALGO {
            return;
        }
        let index = kind as usize;
        if index >= self.values.len() {
            if value == 0 {
                return;
            }
            self.values.resize(index + 1, 0);
        }
        self.values[index] = value;
        while self.values.last() == Some(&0) {
            self.values.pop();
        }
    }

    pub fn get(&self, kind: u16) -> u32 {
        self.values.get(kind as usize).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.tcp_congestion_control_algo.is_none()
    }

    /// Encodes the table for RTA_METRICS, skipping unset entries.
    pub fn to_attributes(&self) -> Vec<RouteMetric> {
        let mut attrs = Vec::new();
        for (index, value) in self.values.iter().enumerate() {
            if *value != 0 {
                attrs.push(RouteMetric::Numeric {
                    kind: index as u16,
                    value: *value,
                });
            }
        }
        if let Some(algo) = &self.tcp_congestion_control_algo {
            attrs.push(RouteMetric::CongestionControl(algo.clone()));
        }
        attrs
    }

    /// Rebuilds the table from a decoded RTA_METRICS attribute.
    pub fn from_attributes(attrs: &[RouteMetric]) -> Self {
        let mut metrics = Self::default();
        for attr in attrs {
            match attr {
                RouteMetric::Numeric { kind, value } => metrics.set(*kind, *value),
                RouteMetric::CongestionControl(algo) => {
                    metrics.tcp_congestion_control_algo = Some(algo.clone());
                }
            }
        }
        metrics
    }
}
