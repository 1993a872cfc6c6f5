//! Function table: static name → callable registry for user functions.
//!
//! Each function is stored with its canonical role signature. Legacy shapes
//! (a datamap taking only the topic) are wrapped at registration time.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use mqroute_core::error::{Result, RouterError};
use mqroute_core::traits::FunctionResolver;
use mqroute_core::traits::UserFunction;
use mqroute_core::types::{Payload, TransformData};
use mqroute_core::ServiceContext;

/// In-memory function registry.
#[derive(Default, Clone)]
pub struct FunctionTable {
    functions: HashMap<String, UserFunction>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a function under `name`.
    pub fn register(&mut self, name: &str, function: UserFunction) -> &mut Self {
        tracing::debug!("🧩 Registered {} function: {}", function.role(), name);
        self.functions.insert(name.to_string(), function);
        self
    }

    pub fn filter<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&str, &Payload) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.register(name, UserFunction::Filter(Arc::new(f)))
    }

    pub fn datamap<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&str, &ServiceContext) -> anyhow::Result<TransformData> + Send + Sync + 'static,
    {
        self.register(name, UserFunction::Datamap(Arc::new(f)))
    }

    /// Datamap function that only wants the topic.
    pub fn datamap_legacy<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&str) -> anyhow::Result<TransformData> + Send + Sync + 'static,
    {
        self.register(
            name,
            UserFunction::Datamap(Arc::new(move |topic: &str, _: &ServiceContext| f(topic))),
        )
    }

    pub fn alldata<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&str, &TransformData, &ServiceContext) -> anyhow::Result<TransformData>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, UserFunction::AllData(Arc::new(f)))
    }

    pub fn targets<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&str, &TransformData, &ServiceContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, UserFunction::Targets(Arc::new(f)))
    }

    pub fn field<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&TransformData, &ServiceContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, UserFunction::Field(Arc::new(f)))
    }

    pub fn periodic<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&ServiceContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(name, UserFunction::Periodic(Arc::new(f)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FunctionResolver for FunctionTable {
    fn resolve(&self, name: &str) -> Result<UserFunction> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| RouterError::FunctionNotFound(name.to_string()))
    }
}
