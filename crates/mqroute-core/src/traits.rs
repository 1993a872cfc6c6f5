//! Boundary contracts between the router core and its collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, RouterError};
use crate::service::ServiceContext;
use crate::types::{Payload, TransformData, WorkItem};

/// A notification backend. Called from worker tasks; must not assume it owns the process.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one work item. `Ok(true)` is the only outcome counted as success.
    async fn handle(&self, ctx: &ServiceContext, item: &WorkItem) -> Result<bool>;
}

/// Publish-capable transport handle.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<()>;
}

/// Renders a named template over the full transform data.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, name: &str, data: &TransformData) -> Result<String>;
}

/// `(topic, payload) -> skip?`
pub type FilterFn = Arc<dyn Fn(&str, &Payload) -> anyhow::Result<bool> + Send + Sync>;
/// `(topic, services) -> data overlay`
pub type DatamapFn = Arc<dyn Fn(&str, &ServiceContext) -> anyhow::Result<TransformData> + Send + Sync>;
/// `(topic, data, services) -> data overlay`
pub type AllDataFn =
    Arc<dyn Fn(&str, &TransformData, &ServiceContext) -> anyhow::Result<TransformData> + Send + Sync>;
/// `(topic, data, services) -> target list`. Any non-list value is rejected by the resolver.
pub type TargetsFn =
    Arc<dyn Fn(&str, &TransformData, &ServiceContext) -> anyhow::Result<Value> + Send + Sync>;
/// `(data, services) -> field value` for title/image/format/priority.
pub type FieldFn = Arc<dyn Fn(&TransformData, &ServiceContext) -> anyhow::Result<Value> + Send + Sync>;
/// `(services)`: periodic task body.
pub type PeriodicFn = Arc<dyn Fn(&ServiceContext) -> anyhow::Result<()> + Send + Sync>;

/// A user function with its canonical, role-specific signature.
#[derive(Clone)]
pub enum UserFunction {
    Filter(FilterFn),
    Datamap(DatamapFn),
    AllData(AllDataFn),
    Targets(TargetsFn),
    Field(FieldFn),
    Periodic(PeriodicFn),
}

impl UserFunction {
    pub fn role(&self) -> &'static str {
        match self {
            UserFunction::Filter(_) => "filter",
            UserFunction::Datamap(_) => "datamap",
            UserFunction::AllData(_) => "alldata",
            UserFunction::Targets(_) => "targets",
            UserFunction::Field(_) => "field",
            UserFunction::Periodic(_) => "periodic",
        }
    }
}

impl std::fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserFunction::{}", self.role())
    }
}

fn wrong_role(name: &str, expected: &'static str, found: &UserFunction) -> RouterError {
    RouterError::WrongFunctionRole {
        name: name.to_string(),
        expected,
        actual: found.role(),
    }
}

/// Name → callable resolution. How names are bound is up to the implementation.
pub trait FunctionResolver: Send + Sync {
    /// Fails with [`RouterError::FunctionNotFound`] when the name is unconfigured.
    fn resolve(&self, name: &str) -> Result<UserFunction>;

    fn resolve_filter(&self, name: &str) -> Result<FilterFn> {
        match self.resolve(name)? {
            UserFunction::Filter(f) => Ok(f),
            other => Err(wrong_role(name, "filter", &other)),
        }
    }

    fn resolve_datamap(&self, name: &str) -> Result<DatamapFn> {
        match self.resolve(name)? {
            UserFunction::Datamap(f) => Ok(f),
            other => Err(wrong_role(name, "datamap", &other)),
        }
    }

    fn resolve_alldata(&self, name: &str) -> Result<AllDataFn> {
        match self.resolve(name)? {
            UserFunction::AllData(f) => Ok(f),
            other => Err(wrong_role(name, "alldata", &other)),
        }
    }

    fn resolve_targets(&self, name: &str) -> Result<TargetsFn> {
        match self.resolve(name)? {
            UserFunction::Targets(f) => Ok(f),
            other => Err(wrong_role(name, "targets", &other)),
        }
    }

    fn resolve_field(&self, name: &str) -> Result<FieldFn> {
        match self.resolve(name)? {
            UserFunction::Field(f) => Ok(f),
            other => Err(wrong_role(name, "field", &other)),
        }
    }

    fn resolve_periodic(&self, name: &str) -> Result<PeriodicFn> {
        match self.resolve(name)? {
            UserFunction::Periodic(f) => Ok(f),
            other => Err(wrong_role(name, "periodic", &other)),
        }
    }
}
