//! `log` handler: writes the message to the router's own log stream.

use async_trait::async_trait;

use mqroute_core::error::Result;
use mqroute_core::traits::Handler;
use mqroute_core::types::WorkItem;
use mqroute_core::ServiceContext;

use crate::first_address;

pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, ctx: &ServiceContext, item: &WorkItem) -> Result<bool> {
        tracing::debug!("*** handler={}, target={}", item.handler, item.target);

        let level = first_address(&item.addrs).and_then(|v| v.as_str()).unwrap_or("info");
        let logger = ctx.name();
        let text = &item.message;
        match level {
            "debug" => tracing::debug!(logger = %logger, "{}", text),
            "info" => tracing::info!(logger = %logger, "{}", text),
            "warn" => tracing::warn!(logger = %logger, "{}", text),
            "error" | "crit" => tracing::error!(logger = %logger, "{}", text),
            other => {
                tracing::warn!("⚠️ Cannot invoke handler log with level `{}`", other);
                return Ok(false);
            }
        }
        Ok(true)
    }
}
