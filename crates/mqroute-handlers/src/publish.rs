//! `publish` handler: republishes the message on the bus via the services context.

use async_trait::async_trait;
use serde_json::Value;

use mqroute_core::error::{Result, RouterError};
use mqroute_core::traits::Handler;
use mqroute_core::types::WorkItem;
use mqroute_core::ServiceContext;
use mqroute_engine::format::format;

pub struct PublishHandler;

/// `(topic template, qos, retain)` from a list or table address.
fn destination(addrs: &Value) -> Option<(&str, u8, bool)> {
    let (topic, qos, retain) = match addrs {
        Value::Array(items) => (items.first(), items.get(1), items.get(2)),
        Value::Object(table) => (table.get("topic"), table.get("qos"), table.get("retain")),
        Value::String(_) => (Some(addrs), None, None),
        _ => return None,
    };
    let qos = qos.and_then(Value::as_u64).map_or(0, |q| q.min(2) as u8);
    let retain = retain.and_then(Value::as_bool).unwrap_or(false);
    Some((topic?.as_str()?, qos, retain))
}

#[async_trait]
impl Handler for PublishHandler {
    fn name(&self) -> &str {
        "publish"
    }

    async fn handle(&self, ctx: &ServiceContext, item: &WorkItem) -> Result<bool> {
        let (template, qos, retain) = destination(&item.addrs).ok_or_else(|| {
            RouterError::Handler(format!("publish target `{}` has no topic", item.target))
        })?;
        let topic = format(template, &item.data).map_err(|e| RouterError::Handler(e.to_string()))?;

        tracing::debug!("📤 Publishing to {} (qos={}, retain={})", topic, qos, retain);
        ctx.publish(&topic, item.message.as_bytes(), qos, retain)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::work_item;
    use mqroute_core::service::ChannelPublisher;
    use mqroute_core::types::OutboundMessage;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_publishes_interpolated_topic() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let ctx = ServiceContext::new("mqroute.handlers.publish", "mqroute", Arc::new(publisher));
        let item = work_item("publish", json!(["alerts/{room}", 1, true]), "hot", json!({"room": "kitchen"}));

        assert!(PublishHandler.handle(&ctx, &item).await.unwrap());
        assert_eq!(
            rx.recv().await.unwrap(),
            OutboundMessage {
                topic: "alerts/kitchen".into(),
                payload: b"hot".to_vec(),
                qos: 1,
                retain: true,
            }
        );
    }

    #[test]
    fn test_destination_shapes() {
        assert_eq!(destination(&json!("a/b")), Some(("a/b", 0, false)));
        assert_eq!(destination(&json!({"topic": "a", "qos": 7})), Some(("a", 2, false)));
        assert_eq!(destination(&json!([])), None);
        assert_eq!(destination(&json!(42)), None);
    }
}
