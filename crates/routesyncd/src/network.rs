//! Declared-configuration surface.
//!
//! A [`Network`] is the in-memory shape of one network profile: the
//! by-section maps of declared routes and rules. The parsing that
//! fills these maps lives outside this daemon; the engine only needs
//! lookup-or-create by section identity, admission ceilings, and
//! section invalidation.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{Result, RouteSyncError};
use crate::route::Route;
use crate::rule::RoutingPolicyRule;
use crate::types::{ConfigSection, ConfigSource};

/// Default ceiling on declared objects per network, matching the
/// kernel's own sysctl defaults for comparable tables.
pub const DEFAULT_OBJECT_CEILING: usize = 4096;

/// One network profile's declared routes and rules.
#[derive(Debug, Default)]
pub struct Network {
    pub filename: String,
    routes_by_section: HashMap<ConfigSection, Route>,
    rules_by_section: HashMap<ConfigSection, RoutingPolicyRule>,
    /// Admission ceiling applied at create time; exceeding it is a
    /// distinct error, never a silent drop.
    pub object_ceiling: usize,
}

impl Network {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            routes_by_section: HashMap::new(),
            rules_by_section: HashMap::new(),
            object_ceiling: DEFAULT_OBJECT_CEILING,
        }
    }

    /// Looks up or creates the route declared at `line` of this
    /// profile. Creation is refused once the ceiling is reached.
    pub fn route_get_or_create(&mut self, line: u32) -> Result<&mut Route> {
        let section = ConfigSection::new(self.filename.clone(), line);
        if !self.routes_by_section.contains_key(&section) {
            if self.routes_by_section.len() >= self.object_ceiling {
                return Err(RouteSyncError::TooManyObjects {
                    kind: "route",
                    limit: self.object_ceiling,
                });
            }
            let route = Route {
                section: Some(section.clone()),
                source: ConfigSource::Static,
                ..Default::default()
            };
            self.routes_by_section.insert(section.clone(), route);
        }
        Ok(self.routes_by_section.get_mut(&section).unwrap())
    }

    /// Looks up or creates the rule declared at `line`.
    pub fn rule_get_or_create(&mut self, line: u32) -> Result<&mut RoutingPolicyRule> {
        let section = ConfigSection::new(self.filename.clone(), line);
        if !self.rules_by_section.contains_key(&section) {
            if self.rules_by_section.len() >= self.object_ceiling {
                return Err(RouteSyncError::TooManyObjects {
                    kind: "rule",
                    limit: self.object_ceiling,
                });
            }
            let rule = RoutingPolicyRule {
                section: Some(section.clone()),
                source: ConfigSource::Static,
                ..Default::default()
            };
            self.rules_by_section.insert(section.clone(), rule);
        }
        Ok(self.rules_by_section.get_mut(&section).unwrap())
    }

    /// Drops a section whose declaration failed validation. The object
    /// disappears from the declared set; any kernel-side counterpart
    /// is reclaimed by the next GC pass.
    pub fn drop_invalid_route(&mut self, section: &ConfigSection) {
        if self.routes_by_section.remove(section).is_some() {
            warn!(%section, "dropping invalid route declaration");
        }
    }

    pub fn drop_invalid_rule(&mut self, section: &ConfigSection) {
        if self.rules_by_section.remove(section).is_some() {
            warn!(%section, "dropping invalid rule declaration");
        }
    }

    pub fn remove_route_declaration(&mut self, section: &ConfigSection) -> Option<Route> {
        self.routes_by_section.remove(section)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes_by_section.values()
    }

    pub fn rules(&self) -> impl Iterator<Item = &RoutingPolicyRule> {
        self.rules_by_section.values()
    }

    pub fn route_count(&self) -> usize {
        self.routes_by_section.len()
    }
}
