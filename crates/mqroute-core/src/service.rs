//! Services context handed to handlers and user functions.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Result, RouterError};
use crate::traits::Publisher;
use crate::types::OutboundMessage;

/// Logger identity plus a publish-capable transport handle.
#[derive(Clone)]
pub struct ServiceContext {
    name: String,
    script_name: String,
    publisher: Arc<dyn Publisher>,
}

impl ServiceContext {
    pub fn new(name: &str, script_name: &str, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            name: name.to_string(),
            script_name: script_name.to_string(),
            publisher,
        }
    }

    /// Context for invoking handler `handler`, named after its logger.
    pub fn for_handler(&self, handler: &str) -> Self {
        Self {
            name: logger_name(&self.script_name, handler),
            script_name: self.script_name.clone(),
            publisher: Arc::clone(&self.publisher),
        }
    }

    /// Same transport, different logger name.
    pub fn named(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            script_name: self.script_name.clone(),
            publisher: Arc::clone(&self.publisher),
        }
    }

    /// Logger name, e.g. `mqroute.handlers.log`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Span to run handler/user code in; carries the logger name.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("handler", logger = %self.name)
    }

    pub fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<()> {
        self.publisher.publish(topic, payload, qos, retain)
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("name", &self.name)
            .field("script_name", &self.script_name)
            .finish()
    }
}

/// Handler loggers live under `<script>.handlers.`; dotted names are used verbatim.
pub fn logger_name(script_name: &str, handler: &str) -> String {
    if handler.contains('.') {
        handler.to_string()
    } else {
        format!("{script_name}.handlers.{handler}")
    }
}

/// Publisher for running without a transport: logs and drops.
#[derive(Debug, Default)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, topic: &str, payload: &[u8], _qos: u8, _retain: bool) -> Result<()> {
        tracing::debug!("🔇 No transport, dropping publish to {} ({} bytes)", topic, payload.len());
        Ok(())
    }
}

/// Forwards published messages into a channel (loopback into the router, or a transport task).
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<()> {
        self.tx
            .send(OutboundMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
                retain,
            })
            .map_err(|_| RouterError::Publish(format!("channel closed, cannot publish to {topic}")))
    }
}
