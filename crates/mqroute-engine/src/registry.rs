//! Handler Registry: launched handlers with their config and target tables.
//!
//! Populated once before workers start and read-only afterwards; workers
//! share it through an `Arc` without locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use mqroute_core::config::RouterConfig;
use mqroute_core::error::{Result, RouterError};
use mqroute_core::traits::Handler;

/// One launched handler.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn Handler>,
    pub config: Map<String, Value>,
    /// Target name → address descriptor. The descriptor shape belongs to the handler.
    pub targets: BTreeMap<String, Value>,
}

/// Registry of launched handlers, keyed by configured name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `[defaults].launch`, resolving each handler's module through `factory`.
    ///
    /// A launched handler without a `[handlers.<name>]` section, or whose
    /// module the factory does not know, is a configuration error.
    pub fn from_config<F>(config: &RouterConfig, factory: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<Arc<dyn Handler>>,
    {
        let mut registry = Self::new();
        for name in &config.defaults.launch {
            let section = config.handlers.get(name).ok_or_else(|| {
                RouterError::Config(format!(
                    "Handler '{name}' is launched but has no [handlers.{name}] section"
                ))
            })?;
            let module = section.module.as_deref().unwrap_or(name);
            let handler = factory(module).ok_or_else(|| {
                RouterError::Config(format!("Handler '{name}': unknown module '{module}'"))
            })?;
            registry.register(name, handler, section.settings.clone(), section.targets.clone());
        }
        Ok(registry)
    }

    /// Register (or replace) a handler.
    pub fn register(
        &mut self,
        name: &str,
        handler: Arc<dyn Handler>,
        config: Map<String, Value>,
        targets: BTreeMap<String, Value>,
    ) -> &mut Self {
        tracing::info!(
            "🔌 Registered handler: {} ({}, {} target(s))",
            name,
            handler.name(),
            targets.len()
        );
        self.entries.insert(
            name.to_string(),
            HandlerEntry {
                handler,
                config,
                targets,
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&HandlerEntry> {
        self.entries.get(name)
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.entries.get(name).map(|e| e.handler.clone())
    }

    pub fn config(&self, name: &str) -> Option<&Map<String, Value>> {
        self.entries.get(name).map(|e| &e.config)
    }

    pub fn targets(&self, name: &str) -> Option<&BTreeMap<String, Value>> {
        self.entries.get(name).map(|e| &e.targets)
    }

    /// Target names of a handler in table order; empty for unknown handlers.
    pub fn target_names(&self, name: &str) -> Vec<String> {
        self.targets(name)
            .map(|targets| targets.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
