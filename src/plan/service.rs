//! # The `services` plan section.
//!
//! [`Service`] describes one long-lived process managed by the supervisor:
//! its command line, startup policy, dependency edges, execution options,
//! and auto-restart behavior.
//!
//! This module also provides the dependency ordering used both for cycle
//! detection at plan validation time and by the service manager when it
//! sequences start/stop work:
//!
//! - [`start_order`](crate::plan::Plan::start_order) services plus their
//!   transitive `requires`, ordered so dependencies start first.
//! - [`stop_order`](crate::plan::Plan::stop_order) the reverse closure,
//!   ordered so dependents stop first.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::plan::types::{OptionalDuration, OptionalFloat, Override};

pub(crate) const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub(crate) const DEFAULT_BACKOFF_LIMIT: Duration = Duration::from_secs(30);

/// Whether a service starts automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStartup {
    #[default]
    #[serde(rename = "")]
    Unknown,
    Enabled,
    Disabled,
}

/// What the supervisor does when a service exits or a check fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceAction {
    /// No explicit action; the context default applies.
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Restart the service (with backoff).
    Restart,
    /// Shut the whole daemon down.
    Shutdown,
    /// Do nothing.
    Ignore,
    /// Shut down reporting failure (valid only for `on-success`).
    FailureShutdown,
    /// Shut down reporting success (valid only for `on-failure` and
    /// `on-check-failure`).
    SuccessShutdown,
}

impl ServiceAction {
    fn is_unset(&self) -> bool {
        matches!(self, ServiceAction::Unset)
    }

    /// Returns true when the action is allowed in a context that also
    /// permits `extra`.
    pub(crate) fn valid_in_context(&self, extra: ServiceAction) -> bool {
        matches!(
            self,
            ServiceAction::Unset
                | ServiceAction::Restart
                | ServiceAction::Shutdown
                | ServiceAction::Ignore
        ) || *self == extra
    }
}

/// A single service entry in a layer or combined plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Service {
    /// Entry name; comes from the map key, not the YAML body.
    #[serde(skip)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "ServiceStartup::is_unknown")]
    pub startup: ServiceStartup,
    #[serde(default, rename = "override", skip_serializing_if = "Override::is_unknown")]
    pub r#override: Override,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    // Service dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    // Options for command execution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,

    // Auto-restart and backoff behavior.
    #[serde(default, skip_serializing_if = "ServiceAction::is_unset")]
    pub on_success: ServiceAction,
    #[serde(default, skip_serializing_if = "ServiceAction::is_unset")]
    pub on_failure: ServiceAction,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on_check_failure: BTreeMap<String, ServiceAction>,
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub backoff_delay: OptionalDuration,
    #[serde(default, skip_serializing_if = "OptionalFloat::is_unset")]
    pub backoff_factor: OptionalFloat,
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub backoff_limit: OptionalDuration,
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub kill_delay: OptionalDuration,
}

impl ServiceStartup {
    fn is_unknown(&self) -> bool {
        matches!(self, ServiceStartup::Unknown)
    }
}

impl Service {
    /// Merges the fields set in `other` into `self`.
    ///
    /// Scalars are overwritten when set in `other`; `after`/`before`/
    /// `requires` are appended (not deduplicated); `environment` and
    /// `on-check-failure` are unioned with `other` winning per key.
    pub fn merge(&mut self, other: &Service) {
        if !other.summary.is_empty() {
            self.summary = other.summary.clone();
        }
        if !other.description.is_empty() {
            self.description = other.description.clone();
        }
        if other.startup != ServiceStartup::Unknown {
            self.startup = other.startup;
        }
        if !other.command.is_empty() {
            self.command = other.command.clone();
        }
        if other.kill_delay.is_set {
            self.kill_delay = other.kill_delay;
        }
        if other.user_id.is_some() {
            self.user_id = other.user_id;
        }
        if !other.user.is_empty() {
            self.user = other.user.clone();
        }
        if other.group_id.is_some() {
            self.group_id = other.group_id;
        }
        if !other.group.is_empty() {
            self.group = other.group.clone();
        }
        if !other.working_dir.is_empty() {
            self.working_dir = other.working_dir.clone();
        }
        self.after.extend(other.after.iter().cloned());
        self.before.extend(other.before.iter().cloned());
        self.requires.extend(other.requires.iter().cloned());
        for (k, v) in &other.environment {
            self.environment.insert(k.clone(), v.clone());
        }
        if other.on_success != ServiceAction::Unset {
            self.on_success = other.on_success;
        }
        if other.on_failure != ServiceAction::Unset {
            self.on_failure = other.on_failure;
        }
        for (k, v) in &other.on_check_failure {
            self.on_check_failure.insert(k.clone(), *v);
        }
        if other.backoff_delay.is_set {
            self.backoff_delay = other.backoff_delay;
        }
        if other.backoff_factor.is_set {
            self.backoff_factor = other.backoff_factor;
        }
        if other.backoff_limit.is_set {
            self.backoff_limit = other.backoff_limit;
        }
    }

    /// Splits the service command into the base command and the optional
    /// `[ ... ]` default-arguments group.
    ///
    /// The command is tokenised under POSIX shell rules. At most one bracket
    /// group is allowed; it may not nest, may not start the command, and no
    /// arguments may follow it.
    pub fn parse_command(&self) -> Result<(Vec<String>, Vec<String>), PlanError> {
        let fail = |msg: &str| {
            Err(PlanError::format(format!(
                "cannot parse service {:?} command: {msg}",
                self.name
            )))
        };

        let Some(args) = shlex::split(&self.command) else {
            return fail("invalid quoting or escaping");
        };

        let mut base = Vec::new();
        let mut extra = Vec::new();
        let mut in_brackets = false;
        let mut got_brackets = false;

        for (idx, arg) in args.into_iter().enumerate() {
            if in_brackets {
                match arg.as_str() {
                    "[" => return fail("cannot nest [ ... ] groups"),
                    "]" => in_brackets = false,
                    _ => extra.push(arg),
                }
                continue;
            }
            if got_brackets {
                return fail("cannot have any arguments after [ ... ] group");
            }
            match arg.as_str() {
                "[" => {
                    if idx == 0 {
                        return fail("cannot start command with [ ... ] group");
                    }
                    in_brackets = true;
                    got_brackets = true;
                }
                "]" => return fail("cannot have ] outside of [ ... ] group"),
                _ => base.push(arg),
            }
        }
        if in_brackets {
            return fail("[ ... ] group not closed");
        }
        Ok((base, extra))
    }
}

/// Re-joins a parsed command, appending the `extra` arguments group.
pub fn command_string(base: &[String], extra: &[String]) -> String {
    let join = |args: &[String]| shlex::try_join(args.iter().map(String::as_str)).unwrap_or_default();
    if extra.is_empty() {
        join(base)
    } else {
        format!("{} [ {} ]", join(base), join(extra))
    }
}

/// Computes the order in which `names` (and their dependency closure) must
/// be started or stopped.
///
/// For start, the closure follows `requires`; for stop, the reverse. The
/// sequencing within the closure follows `after`/`before` edges (reversed
/// for stop). An unknown service name or an ordering loop is a format
/// error; the loop error names every service involved.
pub(crate) fn order_services(
    services: &BTreeMap<String, Service>,
    names: &[String],
    stop: bool,
) -> Result<Vec<String>, PlanError> {
    // For stop, build the reversed `requires` relation.
    let mut predecessors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    if stop {
        for (name, service) in services {
            for req in &service.requires {
                predecessors.entry(req.as_str()).or_default().push(name.as_str());
            }
        }
    }

    // Collect the closure of services involved.
    let mut involved: BTreeMap<&str, ()> = BTreeMap::new();
    let mut pending: Vec<&str> = names.iter().map(String::as_str).collect();
    while let Some(name) = pending.pop() {
        if involved.contains_key(name) {
            continue;
        }
        let Some(service) = services.get(name) else {
            return Err(PlanError::format(format!(
                "service {name:?} does not exist"
            )));
        };
        involved.insert(
            services
                .get_key_value(name)
                .map(|(k, _)| k.as_str())
                .unwrap_or(name),
            (),
        );
        if stop {
            if let Some(preds) = predecessors.get(name) {
                pending.extend(preds.iter().copied());
            }
        } else {
            pending.extend(service.requires.iter().map(String::as_str));
        }
    }

    // Precedence edges within the closure: `prev -> next` means prev must
    // come first in the produced order.
    let nodes: Vec<&str> = involved.keys().copied().collect();
    let index: BTreeMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, name) in nodes.iter().enumerate() {
        let service = &services[*name];
        let (afters, befores) = if stop {
            (&service.before, &service.after)
        } else {
            (&service.after, &service.before)
        };
        for after in afters {
            if let Some(&j) = index.get(after.as_str()) {
                succs[j].push(i);
            }
        }
        for before in befores {
            if let Some(&j) = index.get(before.as_str()) {
                succs[i].push(j);
            }
        }
    }

    // Tarjan SCC; any component larger than one node is a loop. Components
    // pop sinks-first, so dependency-first order is the reverse.
    let sorted = tarjan(&succs);
    let mut out = Vec::with_capacity(nodes.len());
    for component in sorted.into_iter().rev() {
        if component.len() > 1 {
            let mut loop_names: Vec<&str> = component.iter().map(|&i| nodes[i]).collect();
            loop_names.sort_unstable();
            return Err(PlanError::format(format!(
                "services in before/after loop: {}",
                loop_names.join(", ")
            )));
        }
        out.push(nodes[component[0]].to_string());
    }
    Ok(out)
}

/// Iterative Tarjan strongly-connected components.
fn tarjan(succs: &[Vec<usize>]) -> Vec<Vec<usize>> {
    #[derive(Clone, Copy)]
    struct NodeState {
        index: usize,
        lowlink: usize,
        on_stack: bool,
        visited: bool,
    }

    let n = succs.len();
    let mut state = vec![
        NodeState {
            index: 0,
            lowlink: 0,
            on_stack: false,
            visited: false,
        };
        n
    ];
    let mut stack = Vec::new();
    let mut next_index = 0;
    let mut components = Vec::new();

    for root in 0..n {
        if state[root].visited {
            continue;
        }
        // Explicit DFS frames: (node, next child offset).
        let mut frames = vec![(root, 0usize)];
        while let Some(&(v, child)) = frames.last() {
            if child == 0 {
                state[v].visited = true;
                state[v].index = next_index;
                state[v].lowlink = next_index;
                next_index += 1;
                stack.push(v);
                state[v].on_stack = true;
            }
            if let Some(&w) = succs[v].get(child) {
                frames.last_mut().expect("frame just read").1 += 1;
                if !state[w].visited {
                    frames.push((w, 0));
                } else if state[w].on_stack {
                    state[v].lowlink = state[v].lowlink.min(state[w].index);
                }
                continue;
            }
            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                let low = state[v].lowlink;
                state[parent].lowlink = state[parent].lowlink.min(low);
            }
            if state[v].lowlink == state[v].index {
                let mut component = Vec::new();
                loop {
                    let w = stack.pop().expect("tarjan stack underflow");
                    state[w].on_stack = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.sort_unstable();
                components.push(component);
            }
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, after: &[&str], requires: &[&str]) -> Service {
        Service {
            name: name.into(),
            command: format!("/bin/{name}"),
            after: after.iter().map(|s| s.to_string()).collect(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn services(list: Vec<Service>) -> BTreeMap<String, Service> {
        list.into_iter().map(|s| (s.name.clone(), s)).collect()
    }

    #[test]
    fn parse_command_bracket_group() {
        let mut svc = Service {
            name: "web".into(),
            command: "/bin/srv --port 8080 [ --verbose ]".into(),
            ..Default::default()
        };
        let (base, extra) = svc.parse_command().unwrap();
        assert_eq!(base, vec!["/bin/srv", "--port", "8080"]);
        assert_eq!(extra, vec!["--verbose"]);
        assert_eq!(command_string(&base, &extra), svc.command);

        svc.command = "/bin/srv [ -a ] trailing".into();
        assert!(svc.parse_command().is_err());
        svc.command = "[ -a ]".into();
        assert!(svc.parse_command().is_err());
        svc.command = "/bin/srv [ [ -a ] ]".into();
        assert!(svc.parse_command().is_err());
        svc.command = "/bin/srv ]".into();
        assert!(svc.parse_command().is_err());
        svc.command = "/bin/srv 'unclosed".into();
        assert!(svc.parse_command().is_err());
    }

    #[test]
    fn merge_appends_lists_and_unions_maps() {
        let mut base = service("web", &["db"], &[]);
        base.environment.insert("A".into(), "1".into());
        let mut upper = service("web", &["db"], &["cache"]);
        upper.command = String::new();
        upper.environment.insert("B".into(), "2".into());

        base.merge(&upper);
        // List append keeps duplicates; callers must normalise.
        assert_eq!(base.after, vec!["db", "db"]);
        assert_eq!(base.requires, vec!["cache"]);
        assert_eq!(base.command, "/bin/web");
        assert_eq!(base.environment.len(), 2);
    }

    #[test]
    fn start_order_follows_requires_and_after() {
        let map = services(vec![
            service("web", &["db"], &["db"]),
            service("db", &[], &[]),
            service("worker", &["web"], &["web"]),
        ]);
        let order = order_services(&map, &["worker".into()], false).unwrap();
        assert_eq!(order, vec!["db", "web", "worker"]);
    }

    #[test]
    fn stop_order_reverses() {
        let map = services(vec![
            service("web", &["db"], &["db"]),
            service("db", &[], &[]),
        ]);
        let order = order_services(&map, &["db".into()], true).unwrap();
        assert_eq!(order, vec!["web", "db"]);
    }

    #[test]
    fn cycle_names_all_members() {
        let map = services(vec![
            service("a", &["b"], &[]),
            service("b", &["a"], &[]),
        ]);
        let names: Vec<String> = map.keys().cloned().collect();
        let err = order_services(&map, &names, false).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("a") && msg.contains("b"), "got: {msg}");
    }

    #[test]
    fn unknown_service_is_an_error() {
        let map = services(vec![service("a", &[], &["ghost"])]);
        let err = order_services(&map, &["a".into()], false).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
