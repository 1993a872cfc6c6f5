//! Test doubles shared by the engine's unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use mqroute_core::error::{Result, RouterError};
use mqroute_core::service::NullPublisher;
use mqroute_core::traits::Handler;
use mqroute_core::types::WorkItem;
use mqroute_core::ServiceContext;

use crate::registry::HandlerRegistry;

pub fn services() -> ServiceContext {
    ServiceContext::new("mqroute.context", "mqroute", Arc::new(NullPublisher))
}

/// How a [`Recorder`] answers.
#[derive(Clone, Copy)]
pub enum Behaviour {
    Succeed,
    Refuse,
    Fail,
    Hang,
    Sleep(Duration),
    /// Blocks the calling thread.
    Block(Duration),
}

/// Records every delivered work item.
pub struct Recorder {
    behaviour: Behaviour,
    pub items: Mutex<Vec<WorkItem>>,
}

impl Recorder {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            items: Mutex::new(Vec::new()),
        })
    }

    pub fn delivered(&self) -> Vec<WorkItem> {
        self.items.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, _ctx: &ServiceContext, item: &WorkItem) -> Result<bool> {
        self.items.lock().unwrap().push(item.clone());
        match self.behaviour {
            Behaviour::Succeed => Ok(true),
            Behaviour::Refuse => Ok(false),
            Behaviour::Fail => Err(RouterError::Handler("boom".into())),
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                Ok(true)
            }
            Behaviour::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(true)
            }
            Behaviour::Block(d) => {
                std::thread::sleep(d);
                Ok(true)
            }
        }
    }
}

/// Registry with one handler per `(name, handler, target names)`.
pub fn registry(handlers: Vec<(&str, Arc<Recorder>, Vec<&str>)>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for (name, handler, targets) in handlers {
        let targets: BTreeMap<String, Value> = targets
            .iter()
            .map(|t| (t.to_string(), json!([format!("{name}-{t}")])))
            .collect();
        registry.register(name, handler, Map::new(), targets);
    }
    registry
}
