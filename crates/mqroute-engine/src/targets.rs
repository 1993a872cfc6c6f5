//! Target Resolver: which `handler:target` pairs a message goes to.
//!
//! ```text
//! TargetSpec::Function  → targets(topic, data, services) must return a list
//! TargetSpec::Dispatch  → most specific matching pattern wins
//! TargetSpec::List      → verbatim
//! TargetSpec::Invalid   → error, nothing for this message
//!         │
//!         ▼
//! "{key}" interpolation per entry → split "handler[:target]" → Job per pair
//! ```

use std::sync::Arc;

use serde_json::Value;

use mqroute_core::traits::FunctionResolver;
use mqroute_core::types::{Job, Payload, RoutingRule, TargetSpec, TransformData};
use mqroute_core::ServiceContext;

use crate::format::{format, truncate};
use crate::registry::HandlerRegistry;
use crate::topic::most_specific;

/// Priority given to every job the resolver produces.
pub const JOB_PRIORITY: i64 = 1;

pub struct TargetResolver {
    functions: Arc<dyn FunctionResolver>,
    registry: Arc<HandlerRegistry>,
    services: ServiceContext,
}

impl TargetResolver {
    pub fn new(
        functions: Arc<dyn FunctionResolver>,
        registry: Arc<HandlerRegistry>,
        services: ServiceContext,
    ) -> Self {
        Self {
            functions,
            registry,
            services,
        }
    }

    /// Interpolated `handler[:target]` entries for one message, in resolution order.
    pub fn resolve_targets(&self, rule: &RoutingRule, topic: &str, data: &TransformData) -> Vec<String> {
        let Some(raw) = self.raw_targets(rule, topic, data) else {
            return Vec::new();
        };

        raw.iter()
            .filter_map(|entry| match entry {
                Value::String(template) => match format(template, data) {
                    Ok(target) => Some(target),
                    Err(e) => {
                        tracing::error!(
                            "❌ Cannot interpolate target `{}` of rule `{}`: {}",
                            template,
                            rule.name,
                            e
                        );
                        None
                    }
                },
                other => {
                    tracing::error!("❌ Ignoring non-text target {} in rule `{}`", other, rule.name);
                    None
                }
            })
            .collect()
    }

    fn raw_targets(&self, rule: &RoutingRule, topic: &str, data: &TransformData) -> Option<Vec<Value>> {
        match &rule.targets {
            TargetSpec::Function(name) => {
                let result = self
                    .functions
                    .resolve_targets(name)
                    .map_err(|e| e.to_string())
                    .and_then(|f| f(topic, data, &self.services).map_err(|e| format!("{e:#}")));
                match result {
                    Ok(Value::Array(items)) => Some(items),
                    Ok(other) => {
                        tracing::error!(
                            "❌ Targets function {}() in rule `{}` returned {} instead of a list: {}",
                            name,
                            rule.name,
                            json_type(&other),
                            truncate(&other.to_string(), 200)
                        );
                        None
                    }
                    Err(e) => {
                        tracing::error!(
                            "❌ Cannot invoke targets function {}() in rule `{}`: {}",
                            name,
                            rule.name,
                            e
                        );
                        None
                    }
                }
            }
            TargetSpec::Dispatch(entries) => match most_specific(entries, topic) {
                Some((pattern, targets)) => {
                    tracing::debug!("Rule `{}`: topic {} dispatched via `{}`", rule.name, topic, pattern);
                    Some(targets.clone())
                }
                None => {
                    tracing::debug!("Rule `{}`: no dispatch pattern matches topic {}", rule.name, topic);
                    None
                }
            },
            TargetSpec::List(items) => Some(items.clone()),
            TargetSpec::Invalid(value) => {
                tracing::error!(
                    "❌ Targets of rule `{}` must be a function, table or list, got {}: {}",
                    rule.name,
                    json_type(value),
                    value
                );
                None
            }
        }
    }

    /// One job per resolved `(handler, target)` pair. A bare handler fans out to all its targets.
    pub fn resolve_jobs(
        &self,
        rule: &RoutingRule,
        topic: &str,
        payload: &Payload,
        data: Arc<TransformData>,
    ) -> Vec<Job> {
        let mut jobs = Vec::new();

        for entry in self.resolve_targets(rule, topic, &data) {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            if parts.len() > 2 {
                tracing::error!("❌ Invalid target `{}` in rule `{}`", entry, rule.name);
                continue;
            }
            let handler = parts[0];
            if !self.registry.contains(handler) {
                tracing::error!(
                    "❌ Invalid handler `{}` in rule `{}`: not launched",
                    handler,
                    rule.name
                );
                continue;
            }

            let target_names = match parts.get(1) {
                Some(target) => vec![target.to_string()],
                None => {
                    let all = self.registry.target_names(handler);
                    if all.is_empty() {
                        tracing::warn!("⚠️ Handler `{}` has no targets configured", handler);
                    }
                    all
                }
            };

            for target in target_names {
                jobs.push(Job {
                    priority: JOB_PRIORITY,
                    handler_name: handler.to_string(),
                    rule_name: rule.name.clone(),
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    data: data.clone(),
                    target_name: Some(target),
                });
            }
        }

        jobs
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "table",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionTable;
    use crate::testing::{registry, services, Behaviour, Recorder};
    use serde_json::json;

    fn resolver(functions: FunctionTable) -> TargetResolver {
        let log = Recorder::new(Behaviour::Succeed);
        let file = Recorder::new(Behaviour::Succeed);
        let registry = registry(vec![
            ("log", log, vec!["debug", "info", "warn"]),
            ("file", file, vec!["f01"]),
        ]);
        TargetResolver::new(Arc::new(functions), Arc::new(registry), services())
    }

    fn data(value: Value) -> Arc<TransformData> {
        Arc::new(value.as_object().cloned().unwrap_or_default())
    }

    fn pairs(jobs: &[Job]) -> Vec<String> {
        jobs.iter()
            .map(|j| format!("{}:{}", j.handler_name, j.target_name.as_deref().unwrap_or("*")))
            .collect()
    }

    #[test]
    fn test_function_targets_one_job() {
        let mut table = FunctionTable::new();
        table.targets("pick", |_, _, _| Ok(json!(["log:info"])));
        let rule = RoutingRule::new("r", TargetSpec::Function("pick".into()));

        let jobs = resolver(table).resolve_jobs(&rule, "t", &Payload::from("x"), data(json!({})));
        assert_eq!(pairs(&jobs), vec!["log:info"]);
        assert_eq!(jobs[0].priority, JOB_PRIORITY);
        assert_eq!(jobs[0].rule_name, "r");
    }

    #[test]
    fn test_function_must_return_list() {
        let mut table = FunctionTable::new();
        table
            .targets("scalar", |_, _, _| Ok(json!("log:info")))
            .targets("broken", |_, _, _| Err(anyhow::anyhow!("nope")));
        let r = resolver(table);
        for name in ["scalar", "broken", "missing"] {
            let rule = RoutingRule::new("r", TargetSpec::Function(name.into()));
            assert!(r.resolve_jobs(&rule, "t", &Payload::from("x"), data(json!({}))).is_empty());
        }
    }

    #[test]
    fn test_bare_handler_fans_out() {
        let rule = RoutingRule::new("r", TargetSpec::List(vec![json!("log")]));
        let payload = Payload::from("x");
        let shared = data(json!({"k": 1}));
        let jobs = resolver(FunctionTable::new()).resolve_jobs(&rule, "t", &payload, shared.clone());
        assert_eq!(pairs(&jobs), vec!["log:debug", "log:info", "log:warn"]);
        assert!(jobs.iter().all(|j| Arc::ptr_eq(&j.data, &shared)));
    }

    #[test]
    fn test_dispatch_picks_most_specific() {
        let entries = vec![
            ("#".to_string(), vec![json!("log:debug")]),
            ("a/#".to_string(), vec![json!("log:warn")]),
            ("a/b/c".to_string(), vec![json!("file:f01")]),
            ("a/+/c".to_string(), vec![json!("log:info")]),
        ];
        let rule = RoutingRule::new("r", TargetSpec::Dispatch(entries));
        let r = resolver(FunctionTable::new());
        let d = json!({});
        assert_eq!(r.resolve_targets(&rule, "a/b/c", d.as_object().unwrap()), vec!["file:f01"]);
        assert_eq!(r.resolve_targets(&rule, "a/x/c", d.as_object().unwrap()), vec!["log:info"]);
        assert_eq!(r.resolve_targets(&rule, "a/x", d.as_object().unwrap()), vec!["log:warn"]);
        assert_eq!(r.resolve_targets(&rule, "z", d.as_object().unwrap()), vec!["log:debug"]);
    }

    #[test]
    fn test_dispatch_without_match_is_empty() {
        let entries = vec![("a/b".to_string(), vec![json!("log:info")])];
        let rule = RoutingRule::new("r", TargetSpec::Dispatch(entries));
        let jobs = resolver(FunctionTable::new()).resolve_jobs(&rule, "x/y", &Payload::from("x"), data(json!({})));
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_invalid_spec_yields_nothing() {
        let rule = RoutingRule::new("r", TargetSpec::Invalid(json!(42)));
        let jobs = resolver(FunctionTable::new()).resolve_jobs(&rule, "t", &Payload::from("x"), data(json!({})));
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_interpolation_and_bad_entries() {
        let rule = RoutingRule::new(
            "r",
            TargetSpec::List(vec![
                json!("log:{level}"),
                json!("log:{missing}"),
                json!(7),
                json!("pigeon:x"),
                json!("log:a:b"),
                json!("file:f01"),
            ]),
        );
        let jobs = resolver(FunctionTable::new()).resolve_jobs(
            &rule,
            "t",
            &Payload::from("x"),
            data(json!({"level": "warn"})),
        );
        assert_eq!(pairs(&jobs), vec!["log:warn", "file:f01"]);
    }

    #[test]
    fn test_explicit_target_is_not_checked_here() {
        // Unknown target names are dropped by the worker, not the resolver.
        let rule = RoutingRule::new("r", TargetSpec::List(vec![json!("log:nowhere")]));
        let jobs = resolver(FunctionTable::new()).resolve_jobs(&rule, "t", &Payload::from("x"), data(json!({})));
        assert_eq!(pairs(&jobs), vec!["log:nowhere"]);
    }
}
