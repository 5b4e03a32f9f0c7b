//! # Service manager: plan-driven service supervision.
//!
//! The [`ServiceManager`] tracks the derived runtime state of every
//! service in the plan and reacts to plan changes by submitting changes
//! to the state engine: an `autostart` change for startup-enabled
//! services that are not yet active, and a `replan` change restarting
//! active services whose configuration changed.
//!
//! Actual process spawning is an external collaborator; the
//! `service-start`/`service-stop` handlers registered here drive the
//! in-memory service registry that the external supervisor observes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::managers::plan::PlanChanged;
use crate::managers::Manager;
use crate::plan::{Service, ServiceStartup};
use crate::runner::{handler_fn, TaskRunner};
use crate::state::StateLock;

/// Derived run state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Inactive,
    Starting,
    Active,
}

#[derive(Debug, Clone)]
struct ServiceInfo {
    state: ServiceState,
    config: Service,
}

/// Plan-driven supervisor of the in-memory service registry.
pub struct ServiceManager {
    state: Arc<StateLock>,
    runner: Arc<TaskRunner>,
    services: Mutex<BTreeMap<String, ServiceInfo>>,
}

impl ServiceManager {
    /// Creates the manager and registers its task handlers.
    pub fn new(state: Arc<StateLock>, runner: Arc<TaskRunner>) -> Arc<ServiceManager> {
        let manager = Arc::new(ServiceManager {
            state,
            runner: Arc::clone(&runner),
            services: Mutex::new(BTreeMap::new()),
        });

        let m = Arc::clone(&manager);
        let do_start = handler_fn(move |task, _token| {
            let m = Arc::clone(&m);
            async move {
                let name: String = task.get("service-name").map_err(TaskError::from)?;
                m.mark(&name, ServiceState::Active)
            }
        });
        let m = Arc::clone(&manager);
        let undo_start = handler_fn(move |task, _token| {
            let m = Arc::clone(&m);
            async move {
                let name: String = task.get("service-name").map_err(TaskError::from)?;
                m.mark(&name, ServiceState::Inactive)
            }
        });
        runner.add_handler("service-start", do_start, Some(undo_start));

        let m = Arc::clone(&manager);
        let do_stop = handler_fn(move |task, _token| {
            let m = Arc::clone(&m);
            async move {
                let name: String = task.get("service-name").map_err(TaskError::from)?;
                m.mark(&name, ServiceState::Inactive)
            }
        });
        let m = Arc::clone(&manager);
        let undo_stop = handler_fn(move |task, _token| {
            let m = Arc::clone(&m);
            async move {
                let name: String = task.get("service-name").map_err(TaskError::from)?;
                m.mark(&name, ServiceState::Active)
            }
        });
        runner.add_handler("service-stop", do_stop, Some(undo_stop));

        manager
    }

    fn mark(&self, name: &str, state: ServiceState) -> Result<(), TaskError> {
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        let Some(info) = services.get_mut(name) else {
            return Err(TaskError::fail(format!("service {name:?} not in plan")));
        };
        info.state = state;
        Ok(())
    }

    /// Current derived state of one service.
    pub fn service_state(&self, name: &str) -> Option<ServiceState> {
        let services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        services.get(name).map(|info| info.state)
    }

    /// Reacts to a plan publication: records new configuration, restarts
    /// active services whose configuration changed, and drops services
    /// removed from the plan.
    ///
    /// Runs under the plan lock; submits changes and returns without
    /// waiting for them.
    pub fn plan_changed(self: &Arc<Self>, pc: &PlanChanged) {
        let mut restart = Vec::new();
        {
            let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());

            let removed: Vec<String> = services
                .keys()
                .filter(|name| !pc.plan.services().contains_key(*name))
                .cloned()
                .collect();
            for name in removed {
                debug!(service = %name, "service removed from plan");
                services.remove(&name);
            }

            for (name, config) in pc.plan.services() {
                match services.get_mut(name) {
                    Some(info) => {
                        if &info.config != config {
                            info.config = config.clone();
                            if matches!(info.state, ServiceState::Active | ServiceState::Starting) {
                                restart.push(name.clone());
                            }
                        }
                    }
                    None => {
                        services.insert(
                            name.clone(),
                            ServiceInfo {
                                state: ServiceState::Inactive,
                                config: config.clone(),
                            },
                        );
                    }
                }
            }
        }

        if !restart.is_empty() {
            if let Err(e) = self.submit_restart(&restart) {
                warn!(error = %e, "cannot submit replan change");
            }
        }
    }

    /// Submits a `replan` change restarting the given services: per
    /// service a stop task chained before a start task, all in one lane.
    fn submit_restart(&self, names: &[String]) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        let change_id = st.new_change("replan", &format!("Restart services {}", names.join(", ")));
        let lane = st.new_lane();
        let mut prev: Option<String> = None;
        for name in names {
            let stop_id = st.new_task("service-stop", &format!("Stop service {name:?}"));
            st.task_set(&stop_id, "service-name", name);
            st.task_join_lane(&stop_id, lane);
            let start_id = st.new_task("service-start", &format!("Start service {name:?}"));
            st.task_set(&start_id, "service-name", name);
            st.task_join_lane(&start_id, lane);
            st.task_wait_for(&start_id, &stop_id);
            if let Some(prev) = prev {
                st.task_wait_for(&stop_id, &prev);
            }
            st.change_add_task(&change_id, &stop_id);
            st.change_add_task(&change_id, &start_id);
            prev = Some(start_id);
        }
        st.ensure_before(std::time::Duration::ZERO);
        drop(st);
        self.runner.ensure();
        Ok(())
    }

    /// Submits an `autostart` change for every startup-enabled service
    /// that is currently inactive, in dependency order. Returns the
    /// change id, or `None` when nothing needs starting.
    pub fn autostart(&self, pc_plan: &crate::plan::Plan) -> anyhow::Result<Option<String>> {
        let want: Vec<String> = {
            let services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            pc_plan
                .services()
                .iter()
                .filter(|(name, s)| {
                    s.startup == ServiceStartup::Enabled
                        && services
                            .get(*name)
                            .map(|info| info.state == ServiceState::Inactive)
                            .unwrap_or(false)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        if want.is_empty() {
            return Ok(None);
        }
        let order = pc_plan.start_order(&want)?;

        {
            let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            for name in &order {
                if let Some(info) = services.get_mut(name) {
                    info.state = ServiceState::Starting;
                }
            }
        }

        let mut st = self.state.lock();
        let change_id = st.new_change("autostart", "Start startup-enabled services");
        let lane = st.new_lane();
        let mut prev: Option<String> = None;
        for name in &order {
            let task_id = st.new_task("service-start", &format!("Start service {name:?}"));
            st.task_set(&task_id, "service-name", name);
            st.task_join_lane(&task_id, lane);
            if let Some(prev) = prev {
                st.task_wait_for(&task_id, &prev);
            }
            st.change_add_task(&change_id, &task_id);
            prev = Some(task_id);
        }
        st.ensure_before(std::time::Duration::ZERO);
        drop(st);
        self.runner.ensure();
        Ok(Some(change_id))
    }
}

#[async_trait]
impl Manager for ServiceManager {
    fn name(&self) -> &'static str {
        "service"
    }
}
