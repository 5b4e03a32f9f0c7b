//! # Log manager: plan-driven log forwarder reconciliation.
//!
//! The [`LogManager`] keeps one forwarder slot per log target in the
//! plan, each knowing which services currently route to it (last-match
//! semantics of the target's `services` list). Socket I/O is an external
//! collaborator; this manager owns the slot lifecycle only.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::managers::plan::PlanChanged;
use crate::managers::Manager;
use crate::plan::{LogTarget, LogTargetType};

/// One reconciled forwarder slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Forwarder {
    pub target_type: LogTargetType,
    pub location: String,
    pub labels: BTreeMap<String, String>,
    /// Services whose logs currently route to this target.
    pub services: Vec<String>,
}

impl Forwarder {
    fn from_target(target: &LogTarget, service_names: &[&String]) -> Forwarder {
        Forwarder {
            target_type: target.target_type,
            location: target.location.clone(),
            labels: target.labels.clone(),
            services: service_names
                .iter()
                .filter(|name| target.logs_to(name))
                .map(|name| (*name).clone())
                .collect(),
        }
    }
}

/// Plan-driven owner of log forwarder slots.
#[derive(Default)]
pub struct LogManager {
    forwarders: Mutex<BTreeMap<String, Forwarder>>,
}

impl LogManager {
    pub fn new() -> LogManager {
        LogManager::default()
    }

    /// Rebuilds the forwarder set from a newly published plan.
    ///
    /// Runs under the plan lock; only swaps in-memory slots.
    pub fn plan_changed(&self, pc: &PlanChanged) {
        let service_names: Vec<&String> = pc.plan.services().keys().collect();
        let mut next = BTreeMap::new();
        for (name, target) in pc.plan.log_targets() {
            next.insert(name.clone(), Forwarder::from_target(target, &service_names));
        }

        let mut forwarders = self.forwarders.lock().unwrap_or_else(|e| e.into_inner());
        for name in forwarders.keys() {
            if !next.contains_key(name) {
                debug!(target = %name, "log target removed, tearing down forwarder");
            }
        }
        for (name, forwarder) in &next {
            match forwarders.get(name) {
                None => debug!(target = %name, services = ?forwarder.services, "log forwarder created"),
                Some(old) if old != forwarder => {
                    debug!(target = %name, services = ?forwarder.services, "log forwarder reconfigured");
                }
                Some(_) => {}
            }
        }
        *forwarders = next;
    }

    /// Snapshot of one forwarder slot.
    pub fn forwarder(&self, target: &str) -> Option<Forwarder> {
        let forwarders = self.forwarders.lock().unwrap_or_else(|e| e.into_inner());
        forwarders.get(target).cloned()
    }

    /// Names of all current forwarder slots.
    pub fn targets(&self) -> Vec<String> {
        let forwarders = self.forwarders.lock().unwrap_or_else(|e| e.into_inner());
        forwarders.keys().cloned().collect()
    }
}

#[async_trait]
impl Manager for LogManager {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn stop(&self) {
        let mut forwarders = self.forwarders.lock().unwrap_or_else(|e| e.into_inner());
        forwarders.clear();
    }
}
