//! mqroute configuration system.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, RouterError};
use crate::types::{function_ref, RoutingRule, TargetSpec};

/// Name of the rule used by failover notifications.
pub const FAILOVER_RULE: &str = "failover";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerConfig>,
    #[serde(default)]
    pub cron: BTreeMap<String, CronSpec>,
    #[serde(default)]
    pub rules: BTreeMap<String, RuleConfig>,
}

impl RouterConfig {
    /// Load config from `$MQROUTE_CONFIG` or `./mqroute.toml`.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            return Err(RouterError::Config(format!(
                "Configuration file \"{}\" does not exist",
                path.display()
            )));
        }
        Self::load_from(&path)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RouterError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RouterError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        std::env::var("MQROUTE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("mqroute.toml"))
    }

    fn validate(&self) -> Result<()> {
        if self.defaults.num_workers == 0 {
            return Err(RouterError::Config("num_workers must be at least 1".into()));
        }
        let timeout = self.defaults.handler_timeout_secs;
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(RouterError::Config(format!(
                "handler_timeout_secs must be positive, got {timeout}"
            )));
        }
        Ok(())
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.defaults.handler_timeout_secs)
    }

    /// Routing rules with a target specification. Rules without one are inert.
    pub fn routing_rules(&self) -> Vec<RoutingRule> {
        self.rules
            .iter()
            .filter_map(|(name, rule)| rule.to_rule(name))
            .collect()
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub launch: Vec<String>,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default)]
    pub skip_retained: bool,
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: f64,
    #[serde(default = "default_script_name")]
    pub script_name: String,
    #[serde(default)]
    pub templates_dir: Option<String>,
}

fn default_num_workers() -> usize { 1 }
fn default_handler_timeout() -> f64 { 10.0 }
fn default_script_name() -> String { "mqroute".into() }

impl Default for Defaults {
    fn default() -> Self {
        Self {
            launch: Vec::new(),
            num_workers: default_num_workers(),
            skip_retained: false,
            handler_timeout_secs: default_handler_timeout(),
            script_name: default_script_name(),
            templates_dir: None,
        }
    }
}

/// `[handlers.<name>]`: everything except `module` and `targets` is the handler's config map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub targets: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

/// `[rules.<name>]`: one routing rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub targets: Option<Value>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub datamap: Option<String>,
    #[serde(default)]
    pub alldata: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub priority: Option<String>,
}

impl RuleConfig {
    pub fn to_rule(&self, name: &str) -> Option<RoutingRule> {
        let Some(targets) = &self.targets else {
            tracing::warn!("⚠️ Rule `{}` has no targets defined, skipping", name);
            return None;
        };
        Some(RoutingRule {
            name: name.to_string(),
            topic: self.topic.clone().unwrap_or_else(|| name.to_string()),
            qos: self.qos,
            targets: TargetSpec::from_value(targets),
            filter: function_option(name, "filter", self.filter.as_deref()),
            datamap: function_option(name, "datamap", self.datamap.as_deref()),
            alldata: function_option(name, "alldata", self.alldata.as_deref()),
            title: self.title.clone(),
            image: self.image.clone(),
            format: self.format.clone(),
            template: self.template.clone(),
            priority: self.priority.clone(),
        })
    }
}

fn function_option(rule: &str, key: &str, value: Option<&str>) -> Option<String> {
    let value = value?;
    match function_ref(value) {
        Some(name) => Some(name.to_string()),
        None => {
            tracing::warn!(
                "⚠️ Invalid function reference `{}` for `{}` in rule `{}`, ignoring",
                value,
                key,
                rule
            );
            None
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or a number, got {other}"
        ))),
    }
}

/// `[cron]` entry: `"60; now=true"`, a bare number of seconds, or a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CronSpec {
    Seconds(f64),
    Options(String),
    Table {
        interval: f64,
        #[serde(default)]
        now: bool,
    },
}

/// Parsed periodic task options.
#[derive(Debug, Clone, PartialEq)]
pub struct CronOptions {
    pub interval: Duration,
    pub now: bool,
}

impl CronSpec {
    pub fn options(&self) -> Result<CronOptions> {
        match self {
            CronSpec::Seconds(secs) => cron_options(*secs, false),
            CronSpec::Options(s) => parse_cron_options(s),
            CronSpec::Table { interval, now } => cron_options(*interval, *now),
        }
    }
}

fn cron_options(interval: f64, now: bool) -> Result<CronOptions> {
    if !interval.is_finite() || interval <= 0.0 {
        return Err(RouterError::Config(format!("Invalid cron interval: {interval}")));
    }
    Ok(CronOptions {
        interval: Duration::from_secs_f64(interval),
        now,
    })
}

/// Parse `"<interval>[; name=value]*"`.
pub fn parse_cron_options(spec: &str) -> Result<CronOptions> {
    let mut parts = spec.split(';');
    let interval = parts.next().unwrap_or_default().trim();
    let interval: f64 = interval
        .parse()
        .map_err(|_| RouterError::Config(format!("Invalid cron interval: '{interval}'")))?;
    let mut now = false;
    for part in parts {
        let Some((name, value)) = part.split_once('=') else {
            return Err(RouterError::Config(format!("Invalid cron option: '{}'", part.trim())));
        };
        match name.trim() {
            "now" => now = asbool(value)?,
            other => tracing::debug!("Ignoring unknown cron option '{}'", other),
        }
    }
    cron_options(interval, now)
}

/// Lenient boolean parsing for option strings.
pub fn asbool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "y" | "t" | "1" => Ok(true),
        "false" | "no" | "off" | "n" | "f" | "0" => Ok(false),
        other => Err(RouterError::Config(format!("String is not true/false: '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
        [defaults]
        launch = ["log", "file"]
        num_workers = 3
        skip_retained = true

        [handlers.log]
        targets = { info = ["info"], warn = ["warn"] }
        format = "short"

        [handlers.file]
        module = "file"
        targets = { out = ["/tmp/out.log"] }

        [cron]
        heartbeat = "60; now=true"
        cleanup = 300
        report = { interval = 0.5 }

        [rules."sensors/+/temp"]
        targets = ["log:info"]
        format = "{name}: {value}"
        priority = 2
        filter = "only_numbers()"

        [rules.dispatch]
        topic = "home/#"
        targets = { "home/#" = "log:info", "home/kitchen/+" = ["log:warn", "file"] }

        [rules.inert]
        topic = "nowhere"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = RouterConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.defaults.launch, vec!["log", "file"]);
        assert_eq!(config.defaults.num_workers, 3);
        assert!(config.defaults.skip_retained);
        assert_eq!(config.handler_timeout(), Duration::from_secs(10));
        assert_eq!(config.handlers["log"].settings["format"], json!("short"));
        assert!(!config.handlers["log"].settings.contains_key("targets"));
        assert_eq!(config.handlers["file"].module.as_deref(), Some("file"));
    }

    #[test]
    fn test_routing_rules_skip_inert() {
        let config = RouterConfig::from_toml_str(SAMPLE).unwrap();
        let rules = config.routing_rules();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["dispatch", "sensors/+/temp"]);

        let sensors = &rules[1];
        assert_eq!(sensors.topic, "sensors/+/temp");
        assert_eq!(sensors.priority.as_deref(), Some("2"));
        assert_eq!(sensors.filter.as_deref(), Some("only_numbers"));
        assert_eq!(rules[0].topic, "home/#");
        assert!(matches!(rules[0].targets, TargetSpec::Dispatch(ref d) if d.len() == 2));
    }

    #[test]
    fn test_invalid_function_reference_ignored() {
        let rule = RuleConfig {
            targets: Some(json!(["log"])),
            datamap: Some("not a function".into()),
            ..Default::default()
        };
        assert!(rule.to_rule("r").unwrap().datamap.is_none());
    }

    #[test]
    fn test_cron_specs() {
        let config = RouterConfig::from_toml_str(SAMPLE).unwrap();
        let heartbeat = config.cron["heartbeat"].options().unwrap();
        assert_eq!(heartbeat.interval, Duration::from_secs(60));
        assert!(heartbeat.now);
        assert!(!config.cron["cleanup"].options().unwrap().now);
        assert_eq!(
            config.cron["report"].options().unwrap().interval,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_parse_cron_options() {
        assert!(!parse_cron_options("5").unwrap().now);
        assert!(parse_cron_options("5; now=Yes").unwrap().now);
        assert!(parse_cron_options("five").is_err());
        assert!(parse_cron_options("5; now=maybe").is_err());
        assert!(parse_cron_options("-1").is_err());
    }

    #[test]
    fn test_asbool() {
        assert!(asbool(" ON ").unwrap());
        assert!(!asbool("f").unwrap());
        assert!(asbool("2").is_err());
    }

    #[test]
    fn test_invalid_defaults() {
        assert!(RouterConfig::from_toml_str("[defaults]\nnum_workers = 0").is_err());
        assert!(RouterConfig::from_toml_str("[defaults]\nhandler_timeout_secs = 0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mqroute.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = RouterConfig::load_from(&path).unwrap();
        assert_eq!(config.rules.len(), 3);
        assert!(RouterConfig::load_from(&dir.path().join("missing.toml")).is_err());
    }
}
