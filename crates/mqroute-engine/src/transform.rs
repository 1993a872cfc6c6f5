//! Transformation pipeline: message → enriched data → rendered fields.
//!
//! ```text
//! decode(rule, topic, payload)
//!   ├── builtin:  topic, payload, _dtepoch, _dtiso, _ltiso, _dthhmm, _dthhmmss
//!   ├── datamap:  rule.datamap(topic, services)          (skipped on error)
//!   ├── alldata:  rule.alldata(topic, data, services)    (skipped on error)
//!   └── json:     payload parsed as a JSON object        (skipped on error)
//!                 later overlays win key conflicts
//! ```

use std::sync::Arc;

use chrono::{Local, Utc};
use serde_json::Value;
use thiserror::Error;

use mqroute_core::error::RouterError;
use mqroute_core::traits::{FunctionResolver, TemplateEngine};
use mqroute_core::types::{function_ref, Payload, RoutingRule, TransformData};
use mqroute_core::ServiceContext;

use crate::format::{format, truncate, FormatError};

/// Keys seeded from the clock on every decode.
pub const TIMESTAMP_KEYS: [&str; 5] = ["_dtepoch", "_dtiso", "_ltiso", "_dthhmm", "_dthhmmss"];

/// Why an enrichment step fell back.
#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error(transparent)]
    Lookup(#[from] RouterError),
    #[error("function '{name}' failed: {message}")]
    Failed { name: String, message: String },
    #[error("cannot decode JSON object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decoded JSON is not an object")]
    NotAnObject,
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("cannot coerce {0} to an integer")]
    NotAnInteger(String),
}

fn failed(name: &str, e: anyhow::Error) -> EnrichmentError {
    EnrichmentError::Failed {
        name: name.to_string(),
        message: format!("{e:#}"),
    }
}

/// Decoding and field rendering with injected user functions.
#[derive(Clone)]
pub struct Pipeline {
    functions: Arc<dyn FunctionResolver>,
    templates: Option<Arc<dyn TemplateEngine>>,
    services: ServiceContext,
}

impl Pipeline {
    pub fn new(
        functions: Arc<dyn FunctionResolver>,
        templates: Option<Arc<dyn TemplateEngine>>,
        services: ServiceContext,
    ) -> Self {
        Self {
            functions,
            templates,
            services,
        }
    }

    /// Does the rule's filter function ask to skip this message?
    pub fn is_filtered(&self, rule: &RoutingRule, topic: &str, payload: &Payload) -> bool {
        let Some(name) = &rule.filter else {
            return false;
        };
        let outcome = self
            .functions
            .resolve_filter(name)
            .map_err(EnrichmentError::from)
            .and_then(|filter| filter(topic, payload).map_err(|e| failed(name, e)));
        match outcome {
            Ok(skip) => skip,
            Err(e) => {
                tracing::warn!(
                    "⚠️ Cannot invoke filter function {} defined in rule `{}`: {}",
                    name,
                    rule.name,
                    e
                );
                false
            }
        }
    }

    /// Turn a raw message into transform data. Never fails; each overlay is best-effort.
    pub fn decode(&self, rule: Option<&RoutingRule>, topic: &str, payload: &Payload) -> TransformData {
        let mut data = builtin_data(topic, payload);
        let rule_name = rule.map(|r| r.name.as_str()).unwrap_or("-");

        if let Some(name) = rule.and_then(|r| r.datamap.as_deref()) {
            match self.datamap_step(name, topic) {
                Ok(overlay) => data.extend(overlay),
                Err(e) => tracing::warn!(
                    "⚠️ Cannot invoke datamap function {} defined in rule `{}`: {}",
                    name,
                    rule_name,
                    e
                ),
            }
        }

        if let Some(name) = rule.and_then(|r| r.alldata.as_deref()) {
            match self.alldata_step(name, topic, &data) {
                Ok(overlay) => data.extend(overlay),
                Err(e) => tracing::warn!(
                    "⚠️ Cannot invoke alldata function {} defined in rule `{}`: {}",
                    name,
                    rule_name,
                    e
                ),
            }
        }

        match json_step(payload) {
            Ok(overlay) => data.extend(overlay),
            Err(e) => tracing::debug!(
                "Cannot decode JSON object, payload={}: {}",
                truncate(&payload.as_text(), 200),
                e
            ),
        }

        data
    }

    fn datamap_step(&self, name: &str, topic: &str) -> Result<TransformData, EnrichmentError> {
        let datamap = self.functions.resolve_datamap(name)?;
        datamap(topic, &self.services).map_err(|e| failed(name, e))
    }

    fn alldata_step(
        &self,
        name: &str,
        topic: &str,
        data: &TransformData,
    ) -> Result<TransformData, EnrichmentError> {
        let alldata = self.functions.resolve_alldata(name)?;
        alldata(topic, data, &self.services).map_err(|e| failed(name, e))
    }

    fn field_step(&self, name: &str, data: &TransformData) -> Result<Value, EnrichmentError> {
        let field = self.functions.resolve_field(name)?;
        field(data, &self.services).map_err(|e| failed(name, e))
    }

    /// Render a `name()` function reference or a `{key}` template.
    ///
    /// `None` in, `None` out. Function results are returned as-is; template
    /// output has literal `\n` sequences turned into newlines, and a template
    /// that fails to format comes back unformatted.
    pub fn render_field(&self, reference: Option<&str>, data: &TransformData) -> Option<Value> {
        let reference = reference?;

        if let Some(name) = function_ref(reference) {
            match self.field_step(name, data) {
                Ok(value) => return Some(value),
                Err(e) => tracing::warn!("⚠️ Cannot invoke {}(): {}", name, e),
            }
        }

        let text = match format(reference, data) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("⚠️ Formatting `{}` failed: {}", truncate(reference, 200), e);
                reference.to_string()
            }
        };
        Some(Value::String(text.replace("\\n", "\n")))
    }

    pub fn render_field_or(&self, reference: Option<&str>, default: Value, data: &TransformData) -> Value {
        self.render_field(reference, data).unwrap_or(default)
    }

    /// Priority as an integer, `0` when unset or not coercible.
    pub fn render_priority(&self, reference: Option<&str>, data: &TransformData) -> i64 {
        let Some(value) = self.render_field(reference, data) else {
            return 0;
        };
        match coerce_int(&value) {
            Ok(priority) => priority,
            Err(e) => {
                tracing::warn!("⚠️ Failed to determine the priority, defaulting to zero: {}", e);
                0
            }
        }
    }

    /// Full template rendering; `None` when unavailable or failing.
    pub fn render_template(&self, name: &str, data: &TransformData) -> Option<String> {
        let Some(engine) = &self.templates else {
            tracing::warn!("⚠️ Templating `{}` not possible: no template engine configured", name);
            return None;
        };
        match engine.render(name, data) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!("⚠️ Cannot render `{}` template: {}", name, e);
                None
            }
        }
    }
}

/// Seed data every message starts from.
pub fn builtin_data(topic: &str, payload: &Payload) -> TransformData {
    let utc = Utc::now();
    let local = Local::now();

    let mut data = TransformData::new();
    data.insert("topic".into(), Value::String(topic.to_string()));
    data.insert("payload".into(), payload.to_value());
    data.insert("_dtepoch".into(), Value::from(utc.timestamp()));
    data.insert(
        "_dtiso".into(),
        Value::String(utc.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()),
    );
    data.insert(
        "_ltiso".into(),
        Value::String(local.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()),
    );
    data.insert("_dthhmm".into(), Value::String(local.format("%H:%M").to_string()));
    data.insert("_dthhmmss".into(), Value::String(local.format("%H:%M:%S").to_string()));
    data
}

/// Payload (minus trailing NULs) as a JSON object.
fn json_step(payload: &Payload) -> Result<TransformData, EnrichmentError> {
    let bytes = payload.as_bytes();
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    match serde_json::from_slice::<Value>(&bytes[..end])? {
        Value::Object(map) => Ok(map),
        _ => Err(EnrichmentError::NotAnObject),
    }
}

fn coerce_int(value: &Value) -> Result<i64, EnrichmentError> {
    let not_int = || EnrichmentError::NotAnInteger(value.to_string());
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .ok_or_else(not_int),
        Value::String(s) => s.trim().parse().map_err(|_| not_int()),
        Value::Bool(b) => Ok(i64::from(*b)),
        _ => Err(not_int()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionTable;
    use mqroute_core::error::Result as RouterResult;
    use mqroute_core::service::NullPublisher;
    use mqroute_core::types::TargetSpec;
    use serde_json::json;

    fn obj(value: Value) -> TransformData {
        value.as_object().cloned().unwrap_or_default()
    }

    fn services() -> ServiceContext {
        ServiceContext::new("mqroute.context", "mqroute", Arc::new(NullPublisher))
    }

    fn pipeline(table: FunctionTable) -> Pipeline {
        Pipeline::new(Arc::new(table), None, services())
    }

    fn rule() -> RoutingRule {
        RoutingRule::new("test/rule", TargetSpec::List(vec![json!("log")]))
    }

    #[test]
    fn test_builtin_keys() {
        let data = pipeline(FunctionTable::new()).decode(None, "bar", &Payload::from("baz"));
        assert_eq!(data["topic"], json!("bar"));
        assert_eq!(data["payload"], json!("baz"));
        for key in TIMESTAMP_KEYS {
            assert!(data.contains_key(key), "missing {key}");
        }
        assert!(data["_dtiso"].as_str().unwrap().ends_with('Z'));
        assert_eq!(data["_dthhmm"].as_str().unwrap().len(), 5);
    }

    #[test]
    fn test_enrichment_layering() {
        let mut table = FunctionTable::new();
        table
            .datamap("dm", |_, _| Ok(obj(json!({"x": 1}))))
            .alldata("ad", |_, data, _| {
                assert_eq!(data["x"], json!(1));
                Ok(obj(json!({"x": 2, "y": 3})))
            });
        let mut rule = rule();
        rule.datamap = Some("dm".into());
        rule.alldata = Some("ad".into());

        let data = pipeline(table).decode(Some(&rule), "t", &Payload::from(r#"{"y":4,"z":5}"#));
        assert_eq!(data["x"], json!(2));
        assert_eq!(data["y"], json!(4));
        assert_eq!(data["z"], json!(5));
        assert_eq!(data["topic"], json!("t"));
        assert_eq!(data.len(), 2 + TIMESTAMP_KEYS.len() + 3);
    }

    #[test]
    fn test_json_wins_over_builtin_keys() {
        let data = pipeline(FunctionTable::new()).decode(None, "t", &Payload::from(r#"{"topic":"override"}"#));
        assert_eq!(data["topic"], json!("override"));
    }

    #[test]
    fn test_failing_overlays_are_skipped() {
        let mut table = FunctionTable::new();
        table
            .datamap("boom", |_, _| Err(anyhow::anyhow!("datamap exploded")))
            .field("not_alldata", |_, _| Ok(json!(1)));
        let mut rule = rule();
        rule.datamap = Some("boom".into());
        rule.alldata = Some("not_alldata".into());

        let data = pipeline(table).decode(Some(&rule), "t", &Payload::from("plain"));
        assert_eq!(data["payload"], json!("plain"));
        assert_eq!(data.len(), 2 + TIMESTAMP_KEYS.len());
    }

    #[test]
    fn test_json_edge_cases() {
        let p = pipeline(FunctionTable::new());
        let data = p.decode(None, "t", &Payload::from("{\"a\": 1}\0\0"));
        assert_eq!(data["a"], json!(1));
        // Valid JSON that is not an object adds nothing.
        let data = p.decode(None, "t", &Payload::from("[1, 2]"));
        assert_eq!(data.len(), 2 + TIMESTAMP_KEYS.len());
        let data = p.decode(None, "t", &Payload::from(vec![0xff, 0xfe]));
        assert_eq!(data["payload"], json!([255, 254]));
    }

    #[test]
    fn test_decode_is_idempotent() {
        let mut table = FunctionTable::new();
        table.datamap("dm", |topic, _| Ok(obj(json!({"level": topic.split('/').count()}))));
        let mut rule = rule();
        rule.datamap = Some("dm".into());
        let p = pipeline(table);
        let payload = Payload::from(r#"{"v": [1, 2, {"k": null}]}"#);

        let strip = |mut data: TransformData| {
            for key in TIMESTAMP_KEYS {
                data.remove(key);
            }
            serde_json::to_vec(&data).unwrap()
        };
        let first = strip(p.decode(Some(&rule), "a/b/c", &payload));
        let second = strip(p.decode(Some(&rule), "a/b/c", &payload));
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_field_template() {
        let p = pipeline(FunctionTable::new());
        let data = obj(json!({"name": "temp", "value": 21.5}));
        assert_eq!(p.render_field(None, &data), None);
        assert_eq!(
            p.render_field(Some("{name}: {value}\\nok"), &data),
            Some(json!("temp: 21.5\nok"))
        );
        // Missing key: the unformatted reference comes back.
        assert_eq!(p.render_field(Some("{nope}"), &data), Some(json!("{nope}")));
        assert_eq!(p.render_field_or(None, json!("dflt"), &data), json!("dflt"));
    }

    #[test]
    fn test_render_field_function() {
        let mut table = FunctionTable::new();
        table
            .field("double", |data, _| Ok(json!(data["value"].as_i64().unwrap_or(0) * 2)))
            .field("broken", |_, _| Err(anyhow::anyhow!("nope")));
        let p = pipeline(table);
        let data = obj(json!({"value": 21}));
        assert_eq!(p.render_field(Some("double()"), &data), Some(json!(42)));
        // Failing function falls through to template treatment.
        assert_eq!(p.render_field(Some("broken()"), &data), Some(json!("broken()")));
        assert_eq!(p.render_field(Some("unknown()"), &data), Some(json!("unknown()")));
    }

    #[test]
    fn test_render_priority() {
        let p = pipeline(FunctionTable::new());
        let data = obj(json!({"level": "3", "f": 2.9, "word": "high"}));
        assert_eq!(p.render_priority(None, &data), 0);
        assert_eq!(p.render_priority(Some("5"), &data), 5);
        assert_eq!(p.render_priority(Some("{level}"), &data), 3);
        assert_eq!(p.render_priority(Some("{word}"), &data), 0);
        assert_eq!(coerce_int(&json!(2.9)).unwrap(), 2);
        assert_eq!(coerce_int(&json!(true)).unwrap(), 1);
        assert!(coerce_int(&json!(null)).is_err());
    }

    #[test]
    fn test_filter() {
        let mut table = FunctionTable::new();
        table
            .filter("skip_empty", |_, payload| Ok(payload.is_empty()))
            .filter("broken", |_, _| Err(anyhow::anyhow!("filter exploded")));
        let p = pipeline(table);
        let mut rule = rule();
        assert!(!p.is_filtered(&rule, "t", &Payload::from("")));

        rule.filter = Some("skip_empty".into());
        assert!(p.is_filtered(&rule, "t", &Payload::from("")));
        assert!(!p.is_filtered(&rule, "t", &Payload::from("x")));

        rule.filter = Some("broken".into());
        assert!(!p.is_filtered(&rule, "t", &Payload::from("")));
    }

    struct Upper;

    impl TemplateEngine for Upper {
        fn render(&self, name: &str, data: &TransformData) -> RouterResult<String> {
            match name {
                "upper" => Ok(data["name"].as_str().unwrap_or_default().to_uppercase()),
                _ => Err(RouterError::Template(format!("no template {name}"))),
            }
        }
    }

    #[test]
    fn test_render_template() {
        let data = obj(json!({"name": "temp"}));
        let without = pipeline(FunctionTable::new());
        assert_eq!(without.render_template("upper", &data), None);

        let with = Pipeline::new(Arc::new(FunctionTable::new()), Some(Arc::new(Upper)), services());
        assert_eq!(with.render_template("upper", &data).as_deref(), Some("TEMP"));
        assert_eq!(with.render_template("other", &data), None);
    }
}
